//! SQLite persistence for analytics rows and audit records.
//!
//! - WAL mode for concurrent reads during writes
//! - Single connection guarded by a parking_lot mutex
//! - Range queries newest-first, reversed to chronological for chart consumers

use crate::models::SnapshotRow;
use crate::pipeline::expiry::ExpiryRolled;
use crate::pipeline::strike::StrikeChange;
use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, Row};
use std::sync::Arc;
use tracing::{info, warn};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -16000;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS synthetic_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    spot REAL NOT NULL,
    weekly_synthetic REAL,
    monthly_synthetic REAL,
    weekly_carry REAL,
    monthly_carry REAL,
    weekly_premium_annualized REAL,
    monthly_premium_annualized REAL,
    calendar_spread REAL,
    atm_strike REAL NOT NULL,
    spread_z_score REAL,
    data_quality TEXT NOT NULL,
    calculation_timestamp INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_snapshots_ts
    ON synthetic_snapshots(calculation_timestamp DESC);

CREATE TABLE IF NOT EXISTS strike_audit (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    old_strike REAL,
    new_strike REAL NOT NULL,
    spot REAL NOT NULL,
    changed_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS rollover_audit (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    tenor TEXT NOT NULL,
    old_date TEXT NOT NULL,
    new_date TEXT NOT NULL,
    rolled_at TEXT NOT NULL
);
"#;

pub struct AnalyticsStore {
    conn: Arc<Mutex<Connection>>,
}

impl AnalyticsStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX; // We handle our own locking

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open database at {}", db_path))?;

        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize database schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM synthetic_snapshots", [], |row| {
                row.get(0)
            })
            .unwrap_or(0);
        info!("📊 Analytics database ready at {} ({} rows)", db_path, count);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn insert_snapshot(&self, row: &SnapshotRow) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO synthetic_snapshots
             (spot, weekly_synthetic, monthly_synthetic, weekly_carry, monthly_carry,
              weekly_premium_annualized, monthly_premium_annualized, calendar_spread,
              atm_strike, spread_z_score, data_quality, calculation_timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                row.spot,
                row.weekly_synthetic,
                row.monthly_synthetic,
                row.weekly_carry,
                row.monthly_carry,
                row.weekly_premium_annualized,
                row.monthly_premium_annualized,
                row.calendar_spread,
                row.atm_strike,
                row.spread_z_score,
                row.data_quality,
                row.calculation_timestamp,
            ],
        )?;
        Ok(())
    }

    pub fn insert_strike_change(&self, change: &StrikeChange) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO strike_audit (old_strike, new_strike, spot, changed_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                change.old_strike,
                change.new_strike,
                change.spot,
                change.changed_at_ms,
            ],
        )?;
        Ok(())
    }

    pub fn insert_rollover(&self, roll: &ExpiryRolled) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO rollover_audit (tenor, old_date, new_date, rolled_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                roll.tenor,
                roll.old_date.to_string(),
                roll.new_date.to_string(),
                roll.rolled_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn snapshot_count(&self) -> Result<i64> {
        let conn = self.conn.lock();
        let count =
            conn.query_row("SELECT COUNT(*) FROM synthetic_snapshots", [], |row| {
                row.get(0)
            })?;
        Ok(count)
    }

    /// Most recent rows, chronological order.
    pub fn recent_snapshots(&self, limit: usize) -> Result<Vec<SnapshotRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, spot, weekly_synthetic, monthly_synthetic, weekly_carry, monthly_carry,
                    weekly_premium_annualized, monthly_premium_annualized, calendar_spread,
                    atm_strike, spread_z_score, data_quality, calculation_timestamp
             FROM synthetic_snapshots
             ORDER BY calculation_timestamp DESC
             LIMIT ?1",
        )?;
        let mut rows: Vec<SnapshotRow> = stmt
            .query_map(params![limit as i64], row_to_snapshot)?
            .collect::<std::result::Result<_, _>>()?;
        rows.reverse();
        Ok(rows)
    }

    /// Range query by timestamp, newest-first then reversed so charts get
    /// chronological data.
    pub fn snapshots_in_range(
        &self,
        from_ms: i64,
        to_ms: i64,
        limit: usize,
    ) -> Result<Vec<SnapshotRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, spot, weekly_synthetic, monthly_synthetic, weekly_carry, monthly_carry,
                    weekly_premium_annualized, monthly_premium_annualized, calendar_spread,
                    atm_strike, spread_z_score, data_quality, calculation_timestamp
             FROM synthetic_snapshots
             WHERE calculation_timestamp >= ?1 AND calculation_timestamp <= ?2
             ORDER BY calculation_timestamp DESC
             LIMIT ?3",
        )?;
        let mut rows: Vec<SnapshotRow> = stmt
            .query_map(params![from_ms, to_ms, limit as i64], row_to_snapshot)?
            .collect::<std::result::Result<_, _>>()?;
        rows.reverse();
        Ok(rows)
    }
}

fn row_to_snapshot(row: &Row) -> rusqlite::Result<SnapshotRow> {
    Ok(SnapshotRow {
        id: row.get(0)?,
        spot: row.get(1)?,
        weekly_synthetic: row.get(2)?,
        monthly_synthetic: row.get(3)?,
        weekly_carry: row.get(4)?,
        monthly_carry: row.get(5)?,
        weekly_premium_annualized: row.get(6)?,
        monthly_premium_annualized: row.get(7)?,
        calendar_spread: row.get(8)?,
        atm_strike: row.get(9)?,
        spread_z_score: row.get(10)?,
        data_quality: row.get(11)?,
        calculation_timestamp: row.get(12)?,
    })
}
