//! Active expiry tracking and rollover.
//!
//! NIFTY conventions: weekly contracts expire every Thursday at the 15:30 IST
//! close, monthly contracts on the last Thursday of the month. A minute-level
//! check rolls each tenor once its close has passed; the weekly/monthly pair
//! is swapped under a single write lock so readers never observe a
//! half-updated state, and rolling is idempotent because the check compares
//! stored dates, not time-of-day.

use crate::feed::transport::FeedHandle;
use crate::instruments::Tenor;
use crate::pipeline::strike::StrikeSelector;
use crate::storage::AnalyticsStore;
use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, TimeZone, Utc, Weekday};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

const IST_OFFSET_SECS: i32 = 5 * 3600 + 30 * 60;
const CLOSE_HOUR: u32 = 15;
const CLOSE_MINUTE: u32 = 30;

fn ist_offset() -> FixedOffset {
    FixedOffset::east_opt(IST_OFFSET_SECS).expect("valid IST offset")
}

/// Market close (15:30 IST) on the given date.
pub fn close_time(date: NaiveDate) -> DateTime<FixedOffset> {
    let naive = date
        .and_hms_opt(CLOSE_HOUR, CLOSE_MINUTE, 0)
        .expect("valid close time");
    ist_offset()
        .from_local_datetime(&naive)
        .single()
        .expect("IST has no DST ambiguity")
}

/// Next weekly expiry at or after `now`: the coming Thursday, or today if it
/// is a Thursday and the close has not yet passed.
pub fn next_weekly_expiry(now: DateTime<Utc>) -> NaiveDate {
    let local = now.with_timezone(&ist_offset());
    let mut date = local.date_naive();
    loop {
        if date.weekday() == Weekday::Thu && now < close_time(date) {
            return date;
        }
        date += Duration::days(1);
    }
}

fn last_thursday(year: i32, month: u32) -> NaiveDate {
    let (next_y, next_m) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    let mut date = NaiveDate::from_ymd_opt(next_y, next_m, 1).expect("valid month start")
        - Duration::days(1);
    while date.weekday() != Weekday::Thu {
        date -= Duration::days(1);
    }
    date
}

/// Active monthly expiry: last Thursday of the current month, or of the next
/// month once the current one has closed.
pub fn next_monthly_expiry(now: DateTime<Utc>) -> NaiveDate {
    let local = now.with_timezone(&ist_offset());
    let current = last_thursday(local.year(), local.month());
    if now < close_time(current) {
        return current;
    }
    let (y, m) = if local.month() == 12 {
        (local.year() + 1, 1)
    } else {
        (local.year(), local.month() + 1)
    };
    last_thursday(y, m)
}

/// NSE cash session: Mon-Fri, 09:15-15:30 IST. Broadcasts pass through when
/// closed, tagged accordingly; snapshots are never frozen.
pub fn market_status(now: DateTime<Utc>) -> crate::models::MarketStatus {
    use chrono::Timelike;
    let local = now.with_timezone(&ist_offset());
    let weekday_ok = !matches!(local.weekday(), Weekday::Sat | Weekday::Sun);
    let minutes = local.hour() * 60 + local.minute();
    let session_ok = (9 * 60 + 15..=15 * 60 + 30).contains(&minutes);
    if weekday_ok && session_ok {
        crate::models::MarketStatus::Open
    } else {
        crate::models::MarketStatus::Closed
    }
}

/// Both active expiries. Invariant: each date's close is >= now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExpiryState {
    pub weekly: NaiveDate,
    pub monthly: NaiveDate,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExpiryRolled {
    pub tenor: String,
    pub old_date: NaiveDate,
    pub new_date: NaiveDate,
    pub rolled_at: DateTime<Utc>,
}

pub struct ExpirySelector {
    state: RwLock<ExpiryState>,
    feed: FeedHandle,
    strike: Arc<StrikeSelector>,
    store: Option<Arc<AnalyticsStore>>,
    rolled_tx: broadcast::Sender<ExpiryRolled>,
}

impl ExpirySelector {
    pub fn new(
        feed: FeedHandle,
        strike: Arc<StrikeSelector>,
        store: Option<Arc<AnalyticsStore>>,
    ) -> Self {
        Self::new_at(feed, strike, store, Utc::now())
    }

    pub fn new_at(
        feed: FeedHandle,
        strike: Arc<StrikeSelector>,
        store: Option<Arc<AnalyticsStore>>,
        now: DateTime<Utc>,
    ) -> Self {
        let (rolled_tx, _) = broadcast::channel(64);
        Self {
            state: RwLock::new(ExpiryState {
                weekly: next_weekly_expiry(now),
                monthly: next_monthly_expiry(now),
            }),
            feed,
            strike,
            store,
            rolled_tx,
        }
    }

    /// Atomic read; never a half-updated pair.
    pub fn current(&self) -> ExpiryState {
        *self.state.read()
    }

    pub fn subscribe_rollovers(&self) -> broadcast::Receiver<ExpiryRolled> {
        self.rolled_tx.subscribe()
    }

    pub fn expiry_date(&self, tenor: Tenor) -> NaiveDate {
        let state = self.state.read();
        match tenor {
            Tenor::Weekly => state.weekly,
            Tenor::Monthly => state.monthly,
        }
    }

    /// Whole days until the tenor's close, ceiled; `None` once the close has
    /// passed (the engine then falls back to a non-annualized premium).
    pub fn days_to_expiry(&self, tenor: Tenor, now: DateTime<Utc>) -> Option<f64> {
        let close = close_time(self.expiry_date(tenor));
        let secs = (close.with_timezone(&Utc) - now).num_seconds();
        if secs <= 0 {
            return None;
        }
        Some((secs as f64 / 86_400.0).ceil())
    }

    /// Minute-cadence rollover check. Rolls each tenor whose stored expiry
    /// has closed; repeated calls within the same day are no-ops because the
    /// recomputed candidate equals the stored date.
    pub fn check_rollover(&self, now: DateTime<Utc>) -> Vec<ExpiryRolled> {
        let weekly_candidate = next_weekly_expiry(now);
        let monthly_candidate = next_monthly_expiry(now);

        let mut rolled = Vec::new();
        {
            let mut state = self.state.write();
            if state.weekly != weekly_candidate {
                rolled.push(ExpiryRolled {
                    tenor: Tenor::Weekly.code().to_string(),
                    old_date: state.weekly,
                    new_date: weekly_candidate,
                    rolled_at: now,
                });
                state.weekly = weekly_candidate;
            }
            if state.monthly != monthly_candidate {
                rolled.push(ExpiryRolled {
                    tenor: Tenor::Monthly.code().to_string(),
                    old_date: state.monthly,
                    new_date: monthly_candidate,
                    rolled_at: now,
                });
                state.monthly = monthly_candidate;
            }
        }

        if rolled.is_empty() {
            return rolled;
        }

        for roll in &rolled {
            info!(
                tenor = %roll.tenor,
                old = %roll.old_date,
                new = %roll.new_date,
                "📅 expiry rolled over"
            );
        }

        // Leg ids carry the tenor, not the date: re-issuing the same ids
        // tells the upstream to re-resolve them to the next contract.
        let legs = self.strike.current_instruments();
        if !legs.is_empty() {
            self.feed.unsubscribe(legs.clone());
            self.feed.subscribe(legs);
        }

        if let Some(store) = &self.store {
            let store = store.clone();
            let audits = rolled.clone();
            tokio::spawn(async move {
                for roll in &audits {
                    if let Err(e) = store.insert_rollover(roll) {
                        warn!(error = %e, "failed to persist rollover audit row");
                    }
                }
            });
        }

        for roll in &rolled {
            let _ = self.rolled_tx.send(roll.clone());
        }
        rolled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::transport::FeedHandle;
    use tokio::sync::mpsc;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        // Arguments are IST wall-clock; convert to the UTC instant.
        let naive = NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, 0)
            .unwrap();
        ist_offset()
            .from_local_datetime(&naive)
            .single()
            .unwrap()
            .with_timezone(&Utc)
    }

    fn selector_at(now: DateTime<Utc>) -> ExpirySelector {
        let (tx, _rx) = mpsc::channel(64);
        let feed = FeedHandle::new(tx.clone());
        let strike = Arc::new(StrikeSelector::new(50.0, FeedHandle::new(tx), None));
        ExpirySelector::new_at(feed, strike, None, now)
    }

    #[test]
    fn weekly_is_coming_thursday() {
        // Wed 2024-01-10 noon IST -> Thu 2024-01-11.
        let now = utc(2024, 1, 10, 12, 0);
        assert_eq!(
            next_weekly_expiry(now),
            NaiveDate::from_ymd_opt(2024, 1, 11).unwrap()
        );
    }

    #[test]
    fn weekly_on_thursday_before_and_after_close() {
        let before_close = utc(2024, 1, 11, 15, 0);
        assert_eq!(
            next_weekly_expiry(before_close),
            NaiveDate::from_ymd_opt(2024, 1, 11).unwrap()
        );

        let after_close = utc(2024, 1, 11, 15, 31);
        assert_eq!(
            next_weekly_expiry(after_close),
            NaiveDate::from_ymd_opt(2024, 1, 18).unwrap()
        );
    }

    #[test]
    fn monthly_is_last_thursday() {
        let now = utc(2024, 1, 10, 12, 0);
        assert_eq!(
            next_monthly_expiry(now),
            NaiveDate::from_ymd_opt(2024, 1, 25).unwrap()
        );

        // Past the January close: February's last Thursday (leap year, Feb 29).
        let late = utc(2024, 1, 26, 10, 0);
        assert_eq!(
            next_monthly_expiry(late),
            NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()
        );
    }

    #[test]
    fn december_rolls_into_january() {
        let now = utc(2024, 12, 27, 10, 0); // past Dec 26 close
        assert_eq!(
            next_monthly_expiry(now),
            NaiveDate::from_ymd_opt(2025, 1, 30).unwrap()
        );
    }

    #[test]
    fn rollover_is_idempotent_within_the_day() {
        let before = utc(2024, 1, 11, 12, 0);
        let sel = selector_at(before);
        assert_eq!(
            sel.current().weekly,
            NaiveDate::from_ymd_opt(2024, 1, 11).unwrap()
        );

        let after_close = utc(2024, 1, 11, 15, 45);
        let first = sel.check_rollover(after_close);
        assert_eq!(first.len(), 1);
        assert_eq!(
            sel.current().weekly,
            NaiveDate::from_ymd_opt(2024, 1, 18).unwrap()
        );

        // Same evening, second check: nothing rolls again.
        let later = utc(2024, 1, 11, 17, 0);
        assert!(sel.check_rollover(later).is_empty());
    }

    #[test]
    fn expiries_never_in_the_past() {
        let now = utc(2024, 3, 15, 11, 0);
        let sel = selector_at(now);
        let state = sel.current();
        assert!(close_time(state.weekly).with_timezone(&Utc) > now);
        assert!(close_time(state.monthly).with_timezone(&Utc) > now);
    }

    #[test]
    fn market_status_tracks_ist_session() {
        use crate::models::MarketStatus;
        // Wednesday mid-session.
        assert_eq!(market_status(utc(2024, 1, 10, 11, 0)), MarketStatus::Open);
        // Before the open, after the close, weekend.
        assert_eq!(market_status(utc(2024, 1, 10, 9, 14)), MarketStatus::Closed);
        assert_eq!(market_status(utc(2024, 1, 10, 15, 31)), MarketStatus::Closed);
        assert_eq!(market_status(utc(2024, 1, 13, 11, 0)), MarketStatus::Closed);
    }

    #[test]
    fn days_to_expiry_ceils_partial_days() {
        let now = utc(2024, 1, 10, 15, 30); // 24h before Thursday close
        let sel = selector_at(now);
        assert_eq!(sel.days_to_expiry(Tenor::Weekly, now), Some(1.0));

        let slightly_earlier = utc(2024, 1, 10, 12, 0);
        assert_eq!(sel.days_to_expiry(Tenor::Weekly, slightly_earlier), Some(2.0));
    }
}
