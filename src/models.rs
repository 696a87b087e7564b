use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single price update for one instrument, as delivered by the upstream feed.
///
/// `observed_at_ms` is the feed's own event timestamp (epoch milliseconds); all
/// freshness checks compare against it, never against receive time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    pub instrument_id: String,
    pub last_price: f64,
    #[serde(default)]
    pub bid: Option<f64>,
    #[serde(default)]
    pub ask: Option<f64>,
    #[serde(default)]
    pub volume: f64,
    #[serde(default)]
    pub open_interest: Option<f64>,
    #[serde(default)]
    pub implied_volatility: Option<f64>,
    pub observed_at_ms: i64,
}

impl Tick {
    pub fn new(instrument_id: impl Into<String>, last_price: f64, observed_at_ms: i64) -> Self {
        Self {
            instrument_id: instrument_id.into(),
            last_price,
            bid: None,
            ask: None,
            volume: 0.0,
            open_interest: None,
            implied_volatility: None,
            observed_at_ms,
        }
    }

    /// Ingestion-boundary validation. Malformed ticks are rejected here so
    /// NaN/zero prices never reach the computation pipeline.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.instrument_id.trim().is_empty() {
            anyhow::bail!("tick has empty instrument id");
        }
        if !self.last_price.is_finite() || self.last_price <= 0.0 {
            anyhow::bail!(
                "tick for {} has invalid last_price {}",
                self.instrument_id,
                self.last_price
            );
        }
        for (name, v) in [
            ("bid", self.bid),
            ("ask", self.ask),
            ("open_interest", self.open_interest),
            ("implied_volatility", self.implied_volatility),
        ] {
            if let Some(v) = v {
                if !v.is_finite() {
                    anyhow::bail!("tick for {} has non-finite {}", self.instrument_id, name);
                }
            }
        }
        if self.observed_at_ms <= 0 {
            anyhow::bail!("tick for {} has invalid timestamp", self.instrument_id);
        }
        Ok(())
    }
}

/// Which legs contributed to a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataQuality {
    Full,
    WeeklyOnly,
    MonthlyOnly,
}

impl DataQuality {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataQuality::Full => "FULL",
            DataQuality::WeeklyOnly => "WEEKLY_ONLY",
            DataQuality::MonthlyOnly => "MONTHLY_ONLY",
        }
    }
}

/// One synthetic-future derivation. Recomputed on every tick; never stored
/// incrementally. Absent fields mean the corresponding leg pair was stale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyntheticSnapshot {
    pub spot: f64,
    pub weekly_synthetic: Option<f64>,
    pub monthly_synthetic: Option<f64>,
    pub weekly_carry: Option<f64>,
    pub monthly_carry: Option<f64>,
    pub weekly_premium_annualized: Option<f64>,
    pub monthly_premium_annualized: Option<f64>,
    pub calendar_spread: Option<f64>,
    pub atm_strike: f64,
    pub computed_at_ms: i64,
    pub data_quality: DataQuality,
}

/// Flat row shape persisted to SQLite and returned from history queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRow {
    pub id: Option<i64>,
    pub spot: f64,
    pub weekly_synthetic: Option<f64>,
    pub monthly_synthetic: Option<f64>,
    pub weekly_carry: Option<f64>,
    pub monthly_carry: Option<f64>,
    pub weekly_premium_annualized: Option<f64>,
    pub monthly_premium_annualized: Option<f64>,
    pub calendar_spread: Option<f64>,
    pub atm_strike: f64,
    pub spread_z_score: Option<f64>,
    pub data_quality: String,
    pub calculation_timestamp: i64,
}

/// Upstream connection lifecycle, owned by the feed resilience worker and
/// observable by everything downstream via broadcast tagging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Live,
    Reconnecting,
    Failed,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "DISCONNECTED",
            ConnectionStatus::Connecting => "CONNECTING",
            ConnectionStatus::Live => "LIVE",
            ConnectionStatus::Reconnecting => "RECONNECTING",
            ConnectionStatus::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarketStatus {
    Open,
    Closed,
}

/// Broadcast envelope sent to every connected listener on each computed
/// snapshot: the snapshot itself plus spread statistics and status metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketDataEvent {
    #[serde(flatten)]
    pub snapshot: SyntheticSnapshot,
    /// Absent when this snapshot produced no calendar spread.
    pub spread_z_score: Option<crate::pipeline::stats::ZScoreResult>,
    pub connection_status: ConnectionStatus,
    pub market_status: MarketStatus,
    pub timestamp: DateTime<Utc>,
}

/// Application configuration, resolved from the environment with defaults.
#[derive(Debug, Clone)]
pub struct Config {
    pub feed_url: String,
    pub database_path: String,
    pub port: u16,
    /// Freshness gate: ticks older than this never enter a computation.
    pub max_tick_age_ms: i64,
    /// Minimum spacing between persisted analytics rows.
    pub storage_interval_ms: i64,
    /// Resolution at which the persistence throttle checks its clock.
    pub throttle_check_ms: u64,
    /// Cadence of the tick cache GC sweep.
    pub sweep_interval_ms: u64,
    /// Cadence of the expiry rollover check.
    pub expiry_check_ms: u64,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub reconnect_max_attempts: u32,
    pub strike_interval: f64,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let feed_url = std::env::var("FEED_WS_URL")
            .unwrap_or_else(|_| "ws://127.0.0.1:8765/ticks".to_string());
        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./carrytrack.db".to_string());

        Ok(Self {
            feed_url,
            database_path,
            port: env_parse("PORT", 8080u16),
            max_tick_age_ms: env_parse("MAX_TICK_AGE_MS", 5_000i64),
            storage_interval_ms: env_parse("STORAGE_INTERVAL_MS", 1_000i64),
            throttle_check_ms: env_parse("THROTTLE_CHECK_MS", 100u64),
            sweep_interval_ms: env_parse("SWEEP_INTERVAL_MS", 10_000u64),
            expiry_check_ms: env_parse("EXPIRY_CHECK_MS", 60_000u64),
            reconnect_base_delay_ms: env_parse("RECONNECT_BASE_DELAY_MS", 1_000u64),
            reconnect_max_delay_ms: env_parse("RECONNECT_MAX_DELAY_MS", 60_000u64),
            reconnect_max_attempts: env_parse("RECONNECT_MAX_ATTEMPTS", 10u32),
            strike_interval: env_parse("STRIKE_INTERVAL", 50.0f64),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            feed_url: "ws://127.0.0.1:8765/ticks".to_string(),
            database_path: "./carrytrack.db".to_string(),
            port: 8080,
            max_tick_age_ms: 5_000,
            storage_interval_ms: 1_000,
            throttle_check_ms: 100,
            sweep_interval_ms: 10_000,
            expiry_check_ms: 60_000,
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 60_000,
            reconnect_max_attempts: 10,
            strike_interval: 50.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_bad_prices() {
        let mut tick = Tick::new("NIFTY_SPOT", 21_412.0, 1_700_000_000_000);
        assert!(tick.validate().is_ok());

        tick.last_price = f64::NAN;
        assert!(tick.validate().is_err());

        tick.last_price = -5.0;
        assert!(tick.validate().is_err());

        tick.last_price = 0.0;
        assert!(tick.validate().is_err());
    }

    #[test]
    fn validate_rejects_non_finite_optionals() {
        let mut tick = Tick::new("NIFTY_21400_CE_WEEKLY", 150.0, 1_700_000_000_000);
        tick.bid = Some(f64::INFINITY);
        assert!(tick.validate().is_err());
    }
}
