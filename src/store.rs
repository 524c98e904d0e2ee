//! Physical Candle Version Store
//!
//! Append-only storage for `CandleVersion` rows. The engine is written
//! against the `CandleStore` trait, which captures the generic contract the
//! core needs from any ordered store:
//!
//! - append-only batch writes
//! - range scan by logical-key prefix
//! - scan by run (rollback support)
//! - tombstone update by run id (the only in-place mutation)
//! - physical purge of named versions (compaction's deferred delete)
//!
//! Resolution semantics live entirely in `dedup`; the store never picks
//! winners. Any backend offering these primitives can replace the bundled
//! SQLite implementation.

use crate::candle::{CandleVersion, Interval, LogicalKey, SourceTier, TimestampMs};
use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OpenFlags, TransactionBehavior};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

// =============================================================================
// STORAGE SCHEMA
// =============================================================================

const CANDLE_STORE_SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -64000;
PRAGMA temp_store = MEMORY;

-- Every physical write attempt, retained forever (until compaction).
CREATE TABLE IF NOT EXISTS candle_versions (
    version_id INTEGER PRIMARY KEY AUTOINCREMENT,

    -- Logical key
    entity_id TEXT NOT NULL,
    chain TEXT NOT NULL,
    interval TEXT NOT NULL,
    ts_ms INTEGER NOT NULL,

    -- OHLCV payload
    open REAL NOT NULL,
    high REAL NOT NULL,
    low REAL NOT NULL,
    close REAL NOT NULL,
    volume REAL NOT NULL,

    -- Provenance and resolution inputs
    quality_score INTEGER NOT NULL,
    source_tier TEXT NOT NULL,
    run_id TEXT NOT NULL,
    ingested_at_ns INTEGER NOT NULL,
    superseded INTEGER NOT NULL DEFAULT 0
);

-- Resolution scan path: all versions of one logical key, in key order
CREATE INDEX IF NOT EXISTS idx_candle_versions_key
    ON candle_versions(entity_id, chain, interval, ts_ms);

-- Rollback path: all versions written by one run
CREATE INDEX IF NOT EXISTS idx_candle_versions_run
    ON candle_versions(run_id);
"#;

// =============================================================================
// ERRORS
// =============================================================================

/// Errors from the candle version store.
#[derive(Debug)]
pub enum StoreError {
    Sqlite(rusqlite::Error),
    /// A persisted row failed to map back to the model (unknown interval or
    /// tier string).
    Decode(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sqlite(e) => write!(f, "SQLite error: {}", e),
            Self::Decode(msg) => write!(f, "row decode error: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Sqlite(e)
    }
}

// =============================================================================
// KEY RANGE
// =============================================================================

/// A logical-key prefix plus optional half-open time slice, used for range
/// scans. `None` fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyRange {
    pub entity_id: Option<String>,
    pub chain: Option<String>,
    pub interval: Option<Interval>,
    /// Inclusive lower bound on `ts_ms`.
    pub start_ts_ms: Option<TimestampMs>,
    /// Exclusive upper bound on `ts_ms`.
    pub end_ts_ms: Option<TimestampMs>,
}

impl KeyRange {
    /// Match every version in the store.
    pub fn all() -> Self {
        Self::default()
    }

    /// Match exactly one logical key.
    pub fn single(key: &LogicalKey) -> Self {
        Self {
            entity_id: Some(key.entity_id.clone()),
            chain: Some(key.chain.clone()),
            interval: Some(key.interval),
            start_ts_ms: Some(key.ts_ms),
            end_ts_ms: Some(key.ts_ms + 1),
        }
    }

    /// Match a half-open `[start, end)` time slice across all entities.
    pub fn time_slice(start_ts_ms: TimestampMs, end_ts_ms: TimestampMs) -> Self {
        Self {
            start_ts_ms: Some(start_ts_ms),
            end_ts_ms: Some(end_ts_ms),
            ..Self::default()
        }
    }
}

// =============================================================================
// STORE CONTRACT
// =============================================================================

/// The storage primitives the engine is written against.
pub trait CandleStore: Send + Sync {
    /// Append a batch of versions in one transaction. Returns the number of
    /// rows written. Never updates existing rows.
    fn append_versions(&self, versions: &[CandleVersion]) -> Result<u64, StoreError>;

    /// Scan all versions in a key range, ordered by logical key then
    /// `version_id`. Tombstoned rows are included only when asked for.
    fn scan_range(
        &self,
        range: &KeyRange,
        include_superseded: bool,
    ) -> Result<Vec<CandleVersion>, StoreError>;

    /// Scan all versions written by one run, tombstoned or not.
    fn scan_run(&self, run_id: &str) -> Result<Vec<CandleVersion>, StoreError>;

    /// Tombstone every non-superseded version of a run. Returns the number
    /// of rows flipped. Idempotent.
    fn mark_superseded(&self, run_id: &str) -> Result<u64, StoreError>;

    /// Physically delete the named versions. Compaction only; returns the
    /// number of rows removed.
    fn purge_versions(&self, version_ids: &[i64]) -> Result<u64, StoreError>;
}

// =============================================================================
// SQLITE IMPLEMENTATION
// =============================================================================

/// SQLite-backed candle version store.
pub struct SqliteCandleStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCandleStore {
    /// Open or create the store at the given path.
    pub fn open(db_path: &str) -> Result<Self> {
        let path = Path::new(db_path);
        if let Some(parent) = path.parent() {
            if !parent.exists() && !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open candle store database: {}", db_path))?;
        conn.execute_batch(CANDLE_STORE_SCHEMA)?;

        info!(path = %db_path, "Candle store opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open in-memory storage (for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(CANDLE_STORE_SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn row_to_version(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawVersionRow> {
        Ok(RawVersionRow {
            version_id: row.get(0)?,
            entity_id: row.get(1)?,
            chain: row.get(2)?,
            interval: row.get(3)?,
            ts_ms: row.get(4)?,
            open: row.get(5)?,
            high: row.get(6)?,
            low: row.get(7)?,
            close: row.get(8)?,
            volume: row.get(9)?,
            quality_score: row.get(10)?,
            source_tier: row.get(11)?,
            run_id: row.get(12)?,
            ingested_at_ns: row.get(13)?,
            superseded: row.get::<_, i64>(14)? != 0,
        })
    }
}

/// Row image before enum decoding; keeps the rusqlite mapping closure
/// infallible so decode failures surface as `StoreError::Decode`.
struct RawVersionRow {
    version_id: i64,
    entity_id: String,
    chain: String,
    interval: String,
    ts_ms: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    quality_score: i64,
    source_tier: String,
    run_id: String,
    ingested_at_ns: i64,
    superseded: bool,
}

impl RawVersionRow {
    fn decode(self) -> Result<CandleVersion, StoreError> {
        let interval = Interval::parse(&self.interval)
            .ok_or_else(|| StoreError::Decode(format!("unknown interval '{}'", self.interval)))?;
        let source_tier = SourceTier::parse(&self.source_tier).ok_or_else(|| {
            StoreError::Decode(format!("unknown source tier '{}'", self.source_tier))
        })?;
        Ok(CandleVersion {
            version_id: self.version_id,
            key: LogicalKey {
                entity_id: self.entity_id,
                chain: self.chain,
                interval,
                ts_ms: self.ts_ms,
            },
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            quality_score: self.quality_score as u8,
            source_tier,
            run_id: self.run_id,
            ingested_at_ns: self.ingested_at_ns,
            superseded: self.superseded,
        })
    }
}

const SELECT_COLUMNS: &str = "version_id, entity_id, chain, interval, ts_ms, \
     open, high, low, close, volume, \
     quality_score, source_tier, run_id, ingested_at_ns, superseded";

impl CandleStore for SqliteCandleStore {
    fn append_versions(&self, versions: &[CandleVersion]) -> Result<u64, StoreError> {
        if versions.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO candle_versions \
                 (entity_id, chain, interval, ts_ms, \
                  open, high, low, close, volume, \
                  quality_score, source_tier, run_id, ingested_at_ns, superseded) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            )?;
            for v in versions {
                stmt.execute(params![
                    v.key.entity_id,
                    v.key.chain,
                    v.key.interval.as_str(),
                    v.key.ts_ms,
                    v.open,
                    v.high,
                    v.low,
                    v.close,
                    v.volume,
                    v.quality_score as i64,
                    v.source_tier.as_str(),
                    v.run_id,
                    v.ingested_at_ns,
                    v.superseded as i64,
                ])?;
            }
        }
        tx.commit()?;

        debug!(rows = versions.len(), "Appended candle versions");
        Ok(versions.len() as u64)
    }

    fn scan_range(
        &self,
        range: &KeyRange,
        include_superseded: bool,
    ) -> Result<Vec<CandleVersion>, StoreError> {
        let mut sql = format!(
            "SELECT {} FROM candle_versions WHERE 1=1",
            SELECT_COLUMNS
        );
        let mut bind: Vec<Value> = Vec::new();

        if let Some(entity_id) = &range.entity_id {
            sql.push_str(" AND entity_id = ?");
            bind.push(Value::Text(entity_id.clone()));
        }
        if let Some(chain) = &range.chain {
            sql.push_str(" AND chain = ?");
            bind.push(Value::Text(chain.clone()));
        }
        if let Some(interval) = range.interval {
            sql.push_str(" AND interval = ?");
            bind.push(Value::Text(interval.as_str().to_string()));
        }
        if let Some(start) = range.start_ts_ms {
            sql.push_str(" AND ts_ms >= ?");
            bind.push(Value::Integer(start));
        }
        if let Some(end) = range.end_ts_ms {
            sql.push_str(" AND ts_ms < ?");
            bind.push(Value::Integer(end));
        }
        if !include_superseded {
            sql.push_str(" AND superseded = 0");
        }
        sql.push_str(" ORDER BY entity_id, chain, interval, ts_ms, version_id");

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(bind), Self::row_to_version)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?.decode()?);
        }
        Ok(out)
    }

    fn scan_run(&self, run_id: &str) -> Result<Vec<CandleVersion>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM candle_versions WHERE run_id = ?1 \
             ORDER BY entity_id, chain, interval, ts_ms, version_id",
            SELECT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![run_id], Self::row_to_version)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?.decode()?);
        }
        Ok(out)
    }

    fn mark_superseded(&self, run_id: &str) -> Result<u64, StoreError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE candle_versions SET superseded = 1 \
             WHERE run_id = ?1 AND superseded = 0",
            params![run_id],
        )?;
        Ok(changed as u64)
    }

    fn purge_versions(&self, version_ids: &[i64]) -> Result<u64, StoreError> {
        if version_ids.is_empty() {
            return Ok(0);
        }

        // SQLite caps bound variables; delete in chunks.
        const CHUNK: usize = 500;

        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut removed = 0u64;
        for chunk in version_ids.chunks(CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "DELETE FROM candle_versions WHERE version_id IN ({})",
                placeholders
            );
            let bind: Vec<Value> = chunk.iter().map(|id| Value::Integer(*id)).collect();
            removed += tx.execute(&sql, params_from_iter(bind))? as u64;
        }
        tx.commit()?;

        debug!(rows = removed, "Purged candle versions");
        Ok(removed)
    }
}
