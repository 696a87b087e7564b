//! Fixed-cadence persistence.
//!
//! The feed can deliver hundreds of ticks per second; storage gets at most
//! one row per interval. A timer checks at fine resolution (default 100ms)
//! and samples the pipeline's latest row whenever a full interval has
//! elapsed since the last write. Failed writes are logged and dropped; the
//! next interval simply tries again.

use crate::pipeline::AnalyticsPipeline;
use crate::storage::AnalyticsStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

/// Pure cadence gate, separated from the timer so the at-most-one-write-per-
/// interval guarantee is directly testable.
#[derive(Debug)]
pub struct WriteGate {
    interval_ms: i64,
    last_write_ms: Option<i64>,
}

impl WriteGate {
    pub fn new(interval_ms: i64) -> Self {
        Self {
            interval_ms,
            last_write_ms: None,
        }
    }

    /// True at most once per interval; the caller must only invoke this when
    /// it is about to write.
    pub fn should_write(&mut self, now_ms: i64) -> bool {
        match self.last_write_ms {
            Some(last) if now_ms - last < self.interval_ms => false,
            _ => {
                self.last_write_ms = Some(now_ms);
                true
            }
        }
    }
}

pub struct PersistenceThrottle {
    pipeline: Arc<AnalyticsPipeline>,
    store: Arc<AnalyticsStore>,
    gate: WriteGate,
    check_resolution: Duration,
}

impl PersistenceThrottle {
    pub fn new(
        pipeline: Arc<AnalyticsPipeline>,
        store: Arc<AnalyticsStore>,
        interval_ms: i64,
        check_resolution_ms: u64,
    ) -> Self {
        Self {
            pipeline,
            store,
            gate: WriteGate::new(interval_ms),
            check_resolution: Duration::from_millis(check_resolution_ms),
        }
    }

    /// Runs until the task is aborted at shutdown. An in-flight insert is
    /// synchronous and short; aborting between ticks never tears a write.
    pub async fn run(mut self) {
        let mut ticker = interval(self.check_resolution);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            self.check_once(chrono::Utc::now().timestamp_millis());
        }
    }

    pub fn check_once(&mut self, now_ms: i64) -> bool {
        // A latest row past the freshness window resolves to None, so a feed
        // outage stops the writes rather than duplicating the last snapshot.
        let Some(row) = self.pipeline.latest_row_at(now_ms) else {
            return false;
        };
        if !self.gate.should_write(now_ms) {
            return false;
        }
        match self.store.insert_snapshot(&row) {
            Ok(()) => {
                debug!(ts = row.calculation_timestamp, "persisted analytics row");
                true
            }
            Err(e) => {
                // Dropped, no retry queue; the next interval samples anew.
                warn!(error = %e, "failed to persist analytics row");
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_allows_first_write_immediately() {
        let mut gate = WriteGate::new(1_000);
        assert!(gate.should_write(10));
        assert!(!gate.should_write(500));
    }

    #[test]
    fn at_most_one_write_per_interval() {
        let mut gate = WriteGate::new(1_000);
        let mut writes = 0;
        // 10 seconds of 1ms "ticks": 10,000 checks.
        for now in 0..10_000 {
            if gate.should_write(now) {
                writes += 1;
            }
        }
        // ceil(10_000 / 1_000) + 1
        assert!(writes <= 11, "writes = {writes}");
        assert!(writes >= 10);
    }

    #[test]
    fn gate_recovers_after_quiet_period() {
        let mut gate = WriteGate::new(1_000);
        assert!(gate.should_write(0));
        assert!(gate.should_write(5_000));
        assert!(!gate.should_write(5_500));
        assert!(gate.should_write(6_000));
    }
}
