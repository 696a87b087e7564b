//! Latest-tick cache with freshness gating.
//!
//! - One entry per instrument, overwritten in place on arrival
//! - Freshness checks against the tick's own `observed_at_ms`
//! - Periodic sweep evicts entries older than 2x the freshness window

use crate::models::Tick;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct TickCache {
    inner: Arc<RwLock<HashMap<String, Tick>>>,
}

impl Default for TickCache {
    fn default() -> Self {
        Self::new()
    }
}

impl TickCache {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::with_capacity(16))),
        }
    }

    /// O(1) upsert; always succeeds. Latest tick wins.
    pub fn update(&self, tick: Tick) {
        self.inner.write().insert(tick.instrument_id.clone(), tick);
    }

    pub fn get(&self, instrument_id: &str) -> Option<Tick> {
        self.inner.read().get(instrument_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn is_fresh(&self, instrument_id: &str, max_age_ms: i64) -> bool {
        self.is_fresh_at(instrument_id, max_age_ms, chrono::Utc::now().timestamp_millis())
    }

    /// False when the instrument is absent or `now - observed_at >= max_age_ms`.
    pub fn is_fresh_at(&self, instrument_id: &str, max_age_ms: i64, now_ms: i64) -> bool {
        match self.inner.read().get(instrument_id) {
            Some(tick) => now_ms - tick.observed_at_ms < max_age_ms,
            None => false,
        }
    }

    /// Gate for two-legged computations: a single stale leg suppresses both.
    pub fn both_fresh(&self, a: &str, b: &str, max_age_ms: i64) -> bool {
        self.both_fresh_at(a, b, max_age_ms, chrono::Utc::now().timestamp_millis())
    }

    pub fn both_fresh_at(&self, a: &str, b: &str, max_age_ms: i64, now_ms: i64) -> bool {
        self.is_fresh_at(a, max_age_ms, now_ms) && self.is_fresh_at(b, max_age_ms, now_ms)
    }

    /// Atomic read of a jointly-fresh pair under a single lock acquisition, so
    /// a computation never mixes a leg read before an update with one after.
    pub fn fresh_pair_at(
        &self,
        a: &str,
        b: &str,
        max_age_ms: i64,
        now_ms: i64,
    ) -> Option<(Tick, Tick)> {
        let map = self.inner.read();
        let ta = map.get(a)?;
        let tb = map.get(b)?;
        if now_ms - ta.observed_at_ms < max_age_ms && now_ms - tb.observed_at_ms < max_age_ms {
            Some((ta.clone(), tb.clone()))
        } else {
            None
        }
    }

    /// Evict entries older than 2x the freshness window to bound memory.
    pub fn sweep(&self, max_age_ms: i64) -> usize {
        self.sweep_at(max_age_ms, chrono::Utc::now().timestamp_millis())
    }

    pub fn sweep_at(&self, max_age_ms: i64, now_ms: i64) -> usize {
        let mut map = self.inner.write();
        let before = map.len();
        map.retain(|_, tick| now_ms - tick.observed_at_ms < 2 * max_age_ms);
        let evicted = before - map.len();
        if evicted > 0 {
            debug!(evicted, remaining = map.len(), "tick cache sweep");
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000_000;

    #[test]
    fn absent_instrument_is_never_fresh() {
        let cache = TickCache::new();
        assert!(!cache.is_fresh_at("NIFTY_SPOT", 5_000, NOW));
    }

    #[test]
    fn freshness_boundary_is_exclusive() {
        let cache = TickCache::new();
        cache.update(Tick::new("NIFTY_SPOT", 21_412.0, NOW - 5_000));
        // Exactly max_age old counts as stale.
        assert!(!cache.is_fresh_at("NIFTY_SPOT", 5_000, NOW));

        cache.update(Tick::new("NIFTY_SPOT", 21_412.0, NOW - 4_999));
        assert!(cache.is_fresh_at("NIFTY_SPOT", 5_000, NOW));
    }

    #[test]
    fn latest_tick_wins() {
        let cache = TickCache::new();
        cache.update(Tick::new("NIFTY_SPOT", 21_400.0, NOW - 100));
        cache.update(Tick::new("NIFTY_SPOT", 21_412.0, NOW));
        assert_eq!(cache.get("NIFTY_SPOT").unwrap().last_price, 21_412.0);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn one_stale_leg_suppresses_pair() {
        let cache = TickCache::new();
        cache.update(Tick::new("NIFTY_21400_CE_WEEKLY", 150.0, NOW));
        cache.update(Tick::new("NIFTY_21400_PE_WEEKLY", 120.0, NOW - 10_000));
        assert!(!cache.both_fresh_at(
            "NIFTY_21400_CE_WEEKLY",
            "NIFTY_21400_PE_WEEKLY",
            5_000,
            NOW
        ));
        assert!(cache
            .fresh_pair_at("NIFTY_21400_CE_WEEKLY", "NIFTY_21400_PE_WEEKLY", 5_000, NOW)
            .is_none());
    }

    #[test]
    fn sweep_evicts_beyond_double_window() {
        let cache = TickCache::new();
        cache.update(Tick::new("OLD", 1.0, NOW - 11_000));
        cache.update(Tick::new("STALE_BUT_KEPT", 1.0, NOW - 9_000));
        cache.update(Tick::new("FRESH", 1.0, NOW));

        let evicted = cache.sweep_at(5_000, NOW);
        assert_eq!(evicted, 1);
        assert!(cache.get("OLD").is_none());
        assert!(cache.get("STALE_BUT_KEPT").is_some());
        assert!(cache.get("FRESH").is_some());
    }
}
