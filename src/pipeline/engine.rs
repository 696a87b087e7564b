//! Put-call-parity synthetic future derivation.
//!
//! One computation per tick, from a single atomic read of the cache state:
//! `synthetic = call - put + strike`, `carry = synthetic - spot`, premium
//! annualized by days to expiry, calendar spread when both tenors resolve.
//! Stale or invalid inputs yield `None`, never zeros.

use crate::instruments::{option_leg, OptionSide, Tenor, SPOT_INSTRUMENT};
use crate::models::{DataQuality, SyntheticSnapshot};
use crate::pipeline::tick_cache::TickCache;

#[derive(Debug, Clone, Copy)]
struct LegResult {
    synthetic: f64,
    carry: f64,
    premium_annualized: f64,
}

#[derive(Debug, Clone)]
pub struct SyntheticEngine {
    cache: TickCache,
    max_age_ms: i64,
}

impl SyntheticEngine {
    pub fn new(cache: TickCache, max_age_ms: i64) -> Self {
        Self { cache, max_age_ms }
    }

    pub fn compute(
        &self,
        atm_strike: f64,
        weekly_days: Option<f64>,
        monthly_days: Option<f64>,
    ) -> Option<SyntheticSnapshot> {
        self.compute_at(
            atm_strike,
            weekly_days,
            monthly_days,
            chrono::Utc::now().timestamp_millis(),
        )
    }

    pub fn compute_at(
        &self,
        atm_strike: f64,
        weekly_days: Option<f64>,
        monthly_days: Option<f64>,
        now_ms: i64,
    ) -> Option<SyntheticSnapshot> {
        // A stale spot suppresses the whole computation: the strike was
        // derived from spot, so without a fresh spot nothing downstream is
        // trustworthy.
        let spot_tick = self.cache.get(SPOT_INSTRUMENT)?;
        if now_ms - spot_tick.observed_at_ms >= self.max_age_ms {
            return None;
        }
        let spot = spot_tick.last_price;
        if !spot.is_finite() || spot <= 0.0 {
            return None;
        }
        if !atm_strike.is_finite() || atm_strike <= 0.0 {
            return None;
        }

        let weekly = self.leg(atm_strike, Tenor::Weekly, spot, weekly_days, now_ms);
        let monthly = self.leg(atm_strike, Tenor::Monthly, spot, monthly_days, now_ms);

        let data_quality = match (&weekly, &monthly) {
            (Some(_), Some(_)) => DataQuality::Full,
            (Some(_), None) => DataQuality::WeeklyOnly,
            (None, Some(_)) => DataQuality::MonthlyOnly,
            (None, None) => return None,
        };

        let calendar_spread = match (&weekly, &monthly) {
            (Some(w), Some(m)) => Some(m.synthetic - w.synthetic),
            _ => None,
        };

        Some(SyntheticSnapshot {
            spot,
            weekly_synthetic: weekly.map(|l| l.synthetic),
            monthly_synthetic: monthly.map(|l| l.synthetic),
            weekly_carry: weekly.map(|l| l.carry),
            monthly_carry: monthly.map(|l| l.carry),
            weekly_premium_annualized: weekly.map(|l| l.premium_annualized),
            monthly_premium_annualized: monthly.map(|l| l.premium_annualized),
            calendar_spread,
            atm_strike,
            computed_at_ms: now_ms,
            data_quality,
        })
    }

    /// One tenor's synthetic. Both legs must be jointly fresh; a single stale
    /// leg suppresses the tenor rather than mixing mismatched timestamps.
    fn leg(
        &self,
        strike: f64,
        tenor: Tenor,
        spot: f64,
        days_to_expiry: Option<f64>,
        now_ms: i64,
    ) -> Option<LegResult> {
        let call_id = option_leg(strike, OptionSide::Call, tenor);
        let put_id = option_leg(strike, OptionSide::Put, tenor);
        let (call, put) = self
            .cache
            .fresh_pair_at(&call_id, &put_id, self.max_age_ms, now_ms)?;

        let synthetic = call.last_price - put.last_price + strike;
        let carry = synthetic - spot;
        let premium_annualized = match days_to_expiry {
            Some(days) if days > 0.0 => (carry / spot) * (365.0 / days) * 100.0,
            // Expiry unknown or passed: plain percentage, not annualized.
            _ => (carry / spot) * 100.0,
        };

        Some(LegResult {
            synthetic,
            carry,
            premium_annualized,
        })
    }
}
