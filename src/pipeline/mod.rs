//! Tick-to-analytics pipeline.
//!
//! One entry point, `AnalyticsPipeline::on_tick`: validate, cache, react to
//! spot (strike selection), derive the synthetic snapshot, fold the calendar
//! spread into the rolling statistics, then broadcast. Each tick is handled
//! to completion before the next, so the shared state reads within a single
//! computation are never interleaved with a concurrent strike change.

pub mod engine;
pub mod expiry;
pub mod stats;
pub mod strike;
pub mod tick_cache;

use crate::feed::resilience::ConnectionMonitor;
use crate::instruments::{Tenor, SPOT_INSTRUMENT};
use crate::models::{MarketDataEvent, SnapshotRow, SyntheticSnapshot, Tick};
use chrono::{DateTime, Utc};
use engine::SyntheticEngine;
use expiry::ExpirySelector;
use parking_lot::RwLock;
use stats::{SpreadStatistics, ZScoreResult};
use std::sync::Arc;
use strike::StrikeSelector;
use tick_cache::TickCache;
use tokio::sync::broadcast;
use tracing::debug;

/// Fire-and-forget fan-out of computed snapshots. Slow consumers lag and
/// drop; the producer never blocks.
pub struct Broadcaster {
    tx: broadcast::Sender<MarketDataEvent>,
    latest: RwLock<Option<MarketDataEvent>>,
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            latest: RwLock::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MarketDataEvent> {
        self.tx.subscribe()
    }

    pub fn latest(&self) -> Option<MarketDataEvent> {
        self.latest.read().clone()
    }

    pub fn publish(&self, event: MarketDataEvent) {
        *self.latest.write() = Some(event.clone());
        // No receivers is not an error.
        let _ = self.tx.send(event);
    }
}

pub struct AnalyticsPipeline {
    cache: TickCache,
    strike: Arc<StrikeSelector>,
    expiry: Arc<ExpirySelector>,
    engine: SyntheticEngine,
    stats: SpreadStatistics,
    broadcaster: Arc<Broadcaster>,
    monitor: Arc<ConnectionMonitor>,
    max_tick_age_ms: i64,
    /// Latest computed snapshot plus its z-score, sampled by the throttle.
    latest: RwLock<Option<(SyntheticSnapshot, Option<f64>)>>,
}

impl AnalyticsPipeline {
    pub fn new(
        cache: TickCache,
        strike: Arc<StrikeSelector>,
        expiry: Arc<ExpirySelector>,
        broadcaster: Arc<Broadcaster>,
        monitor: Arc<ConnectionMonitor>,
        max_tick_age_ms: i64,
    ) -> Self {
        let engine = SyntheticEngine::new(cache.clone(), max_tick_age_ms);
        Self {
            cache,
            strike,
            expiry,
            engine,
            stats: SpreadStatistics::new(),
            broadcaster,
            monitor,
            max_tick_age_ms,
            latest: RwLock::new(None),
        }
    }

    pub fn cache(&self) -> &TickCache {
        &self.cache
    }

    pub fn stats(&self) -> &SpreadStatistics {
        &self.stats
    }

    pub fn on_tick(&self, tick: Tick) {
        self.on_tick_at(tick, Utc::now());
    }

    pub fn on_tick_at(&self, tick: Tick, now: DateTime<Utc>) {
        if let Err(e) = tick.validate() {
            debug!(error = %e, "rejected malformed tick");
            return;
        }
        let now_ms = now.timestamp_millis();
        let is_spot = tick.instrument_id == SPOT_INSTRUMENT;
        let spot_price = tick.last_price;
        self.cache.update(tick);

        if is_spot {
            self.strike.on_spot_tick(spot_price, now_ms);
        }

        let Some(atm_strike) = self.strike.current_strike() else {
            return;
        };
        let weekly_days = self.expiry.days_to_expiry(Tenor::Weekly, now);
        let monthly_days = self.expiry.days_to_expiry(Tenor::Monthly, now);

        let Some(snapshot) = self
            .engine
            .compute_at(atm_strike, weekly_days, monthly_days, now_ms)
        else {
            // Stale or partial data: suppressed, no value broadcast.
            return;
        };

        let z_result: Option<ZScoreResult> = snapshot
            .calendar_spread
            .map(|spread| self.stats.observe(spread));
        let z_value = z_result.as_ref().and_then(|r| r.z_score());

        *self.latest.write() = Some((snapshot.clone(), z_value));

        self.broadcaster.publish(MarketDataEvent {
            snapshot,
            spread_z_score: z_result,
            connection_status: self.monitor.get(),
            market_status: expiry::market_status(now),
            timestamp: now,
        });
    }

    pub fn latest_row(&self) -> Option<SnapshotRow> {
        self.latest_row_at(Utc::now().timestamp_millis())
    }

    /// Current persistable row. `None` before the first successful
    /// computation, and again once the last one has aged past the freshness
    /// window, so an outage or a closed market never replays the same
    /// snapshot into storage.
    pub fn latest_row_at(&self, now_ms: i64) -> Option<SnapshotRow> {
        let guard = self.latest.read();
        let (snapshot, z) = guard.as_ref()?;
        if now_ms - snapshot.computed_at_ms >= self.max_tick_age_ms {
            return None;
        }
        Some(SnapshotRow {
            id: None,
            spot: snapshot.spot,
            weekly_synthetic: snapshot.weekly_synthetic,
            monthly_synthetic: snapshot.monthly_synthetic,
            weekly_carry: snapshot.weekly_carry,
            monthly_carry: snapshot.monthly_carry,
            weekly_premium_annualized: snapshot.weekly_premium_annualized,
            monthly_premium_annualized: snapshot.monthly_premium_annualized,
            calendar_spread: snapshot.calendar_spread,
            atm_strike: snapshot.atm_strike,
            spread_z_score: *z,
            data_quality: snapshot.data_quality.as_str().to_string(),
            calculation_timestamp: snapshot.computed_at_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::transport::FeedHandle;
    use crate::models::ConnectionStatus;
    use chrono::TimeZone;
    use tokio::sync::mpsc;

    fn pipeline() -> (AnalyticsPipeline, Arc<Broadcaster>) {
        let (tx, _rx) = mpsc::channel(256);
        let handle = FeedHandle::new(tx);
        let cache = TickCache::new();
        let now = chrono::Utc.with_ymd_and_hms(2024, 1, 10, 6, 30, 0).unwrap();
        let strike = Arc::new(StrikeSelector::new(50.0, handle.clone(), None));
        let expiry = Arc::new(ExpirySelector::new_at(
            handle.clone(),
            strike.clone(),
            None,
            now,
        ));
        let broadcaster = Arc::new(Broadcaster::new(256));
        let monitor = Arc::new(ConnectionMonitor::new());
        monitor.set(ConnectionStatus::Live);
        let pipeline =
            AnalyticsPipeline::new(cache, strike, expiry, broadcaster.clone(), monitor, 5_000);
        (pipeline, broadcaster)
    }

    fn tick(id: &str, price: f64, now: DateTime<Utc>) -> Tick {
        Tick::new(id, price, now.timestamp_millis())
    }

    #[test]
    fn spot_tick_seeds_strike_and_legs_produce_snapshot() {
        let (pipeline, broadcaster) = pipeline();
        // Wednesday 2024-01-10 12:00 IST.
        let now = chrono::Utc.with_ymd_and_hms(2024, 1, 10, 6, 30, 0).unwrap();

        pipeline.on_tick_at(tick("NIFTY_SPOT", 21_412.0, now), now);
        // Spot alone: strike is set, but no leg data yet, nothing broadcast.
        assert!(broadcaster.latest().is_none());

        pipeline.on_tick_at(tick("NIFTY_21400_CE_WEEKLY", 150.0, now), now);
        pipeline.on_tick_at(tick("NIFTY_21400_PE_WEEKLY", 120.0, now), now);

        let event = broadcaster.latest().expect("snapshot broadcast expected");
        assert_eq!(event.snapshot.atm_strike, 21_400.0);
        assert_eq!(event.snapshot.weekly_synthetic, Some(21_430.0));
        assert_eq!(event.snapshot.weekly_carry, Some(21_430.0 - 21_412.0));
        assert!(event.spread_z_score.is_none());
        assert_eq!(event.connection_status, ConnectionStatus::Live);
    }

    #[test]
    fn malformed_tick_is_dropped_before_cache() {
        let (pipeline, _b) = pipeline();
        let now = chrono::Utc.with_ymd_and_hms(2024, 1, 10, 6, 30, 0).unwrap();
        let mut bad = tick("NIFTY_SPOT", 21_412.0, now);
        bad.last_price = f64::NAN;
        pipeline.on_tick_at(bad, now);
        assert!(pipeline.cache().get("NIFTY_SPOT").is_none());
    }

    #[test]
    fn calendar_spread_feeds_statistics() {
        let (pipeline, broadcaster) = pipeline();
        let base = chrono::Utc.with_ymd_and_hms(2024, 1, 10, 6, 30, 0).unwrap();

        for i in 0..12i64 {
            let now = base + chrono::Duration::seconds(i);
            pipeline.on_tick_at(tick("NIFTY_SPOT", 21_412.0, now), now);
            pipeline.on_tick_at(tick("NIFTY_21400_CE_WEEKLY", 150.0, now), now);
            pipeline.on_tick_at(tick("NIFTY_21400_PE_WEEKLY", 120.0, now), now);
            pipeline.on_tick_at(
                tick("NIFTY_21400_CE_MONTHLY", 280.0 + i as f64, now),
                now,
            );
            pipeline.on_tick_at(tick("NIFTY_21400_PE_MONTHLY", 200.0, now), now);
        }

        let event = broadcaster.latest().unwrap();
        assert!(event.snapshot.calendar_spread.is_some());
        let z = event.spread_z_score.expect("z-score expected");
        assert!(matches!(z, ZScoreResult::Ok(_)));

        let last = base + chrono::Duration::seconds(11);
        let row = pipeline
            .latest_row_at(last.timestamp_millis())
            .expect("persistable row expected");
        assert_eq!(row.data_quality, "FULL");
        assert!(row.spread_z_score.is_some());

        // The same row ages out with the freshness window.
        let stale = last + chrono::Duration::seconds(6);
        assert!(pipeline.latest_row_at(stale.timestamp_millis()).is_none());
    }
}
