//! At-the-money strike tracking.
//!
//! Idempotent reducer over spot ticks: the current strike is always
//! `round(spot / interval) * interval`, recomputed on every fresh spot tick.
//! A strike change swaps the four option-leg subscriptions, appends an audit
//! row, and fans out a `StrikeChange` event. Transitions are serialized by an
//! internal mutex so concurrent spot ticks cannot race two candidates.

use crate::feed::transport::FeedHandle;
use crate::instruments::legs_for_strike;
use crate::storage::AnalyticsStore;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct StrikeChange {
    pub old_strike: Option<f64>,
    pub new_strike: f64,
    pub spot: f64,
    pub changed_at_ms: i64,
}

#[derive(Debug)]
struct StrikeState {
    current: Option<f64>,
    last_changed_at_ms: i64,
}

pub struct StrikeSelector {
    state: Mutex<StrikeState>,
    interval: f64,
    feed: FeedHandle,
    store: Option<Arc<AnalyticsStore>>,
    change_tx: broadcast::Sender<StrikeChange>,
}

impl StrikeSelector {
    pub fn new(interval: f64, feed: FeedHandle, store: Option<Arc<AnalyticsStore>>) -> Self {
        let (change_tx, _) = broadcast::channel(64);
        Self {
            state: Mutex::new(StrikeState {
                current: None,
                last_changed_at_ms: 0,
            }),
            interval,
            feed,
            store,
            change_tx,
        }
    }

    pub fn current_strike(&self) -> Option<f64> {
        self.state.lock().current
    }

    /// The four option legs for the current strike; empty before the first
    /// spot tick has seeded a strike.
    pub fn current_instruments(&self) -> Vec<String> {
        match self.state.lock().current {
            Some(strike) => legs_for_strike(strike).to_vec(),
            None => Vec::new(),
        }
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<StrikeChange> {
        self.change_tx.subscribe()
    }

    pub fn on_spot_tick(&self, spot: f64, now_ms: i64) -> Option<StrikeChange> {
        if !spot.is_finite() || spot <= 0.0 {
            return None;
        }
        let candidate = (spot / self.interval).round() * self.interval;

        // Single-writer discipline: candidate comparison and state update
        // happen under one lock so two ticks cannot apply different strikes
        // out of order.
        let change = {
            let mut state = self.state.lock();
            if state.current == Some(candidate) {
                return None;
            }
            let change = StrikeChange {
                old_strike: state.current,
                new_strike: candidate,
                spot,
                changed_at_ms: now_ms,
            };
            state.current = Some(candidate);
            state.last_changed_at_ms = now_ms;
            change
        };

        info!(
            old = ?change.old_strike,
            new = change.new_strike,
            spot,
            "🎯 ATM strike changed"
        );

        // Subscription swap is optimistic: the local strike has already
        // advanced, and a failed upstream call is retried by the next
        // reconnect replay.
        if let Some(old) = change.old_strike {
            self.feed.unsubscribe(legs_for_strike(old).to_vec());
        }
        self.feed.subscribe(legs_for_strike(change.new_strike).to_vec());

        if let Some(store) = &self.store {
            let store = store.clone();
            let audit = change.clone();
            tokio::spawn(async move {
                if let Err(e) = store.insert_strike_change(&audit) {
                    warn!(error = %e, "failed to persist strike audit row");
                }
            });
        }

        let _ = self.change_tx.send(change.clone());
        Some(change)
    }
}
