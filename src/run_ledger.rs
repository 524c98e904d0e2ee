//! Ingestion Run Ledger
//!
//! Append-only record of every ingestion/migration attempt and its
//! lifecycle. Every candle version is tagged with a run from this ledger, so
//! the ledger is the single source of truth for provenance, rollback
//! eligibility, and operator triage.
//!
//! # State Machine
//!
//! ```text
//! Pending -> Running -> { Completed, Failed } -> RolledBack
//! ```
//!
//! Transitions for one `run_id` are serialized with compare-and-swap
//! UPDATEs on the status column; different run ids never contend. Stats are
//! finalized at Completed/Failed; the RolledBack transition does not alter
//! them.
//!
//! The ledger is an explicitly constructed, injected repository (open /
//! open_memory), not a process-wide singleton, so tests can run any number
//! of independent ledgers side by side.

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{
    params, params_from_iter, Connection, OpenFlags, OptionalExtension, TransactionBehavior,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

// =============================================================================
// STORAGE SCHEMA
// =============================================================================

const RUN_LEDGER_SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS ingestion_runs (
    run_id TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    source TEXT NOT NULL,
    config_snapshot_hash TEXT NOT NULL,
    started_at_ms INTEGER NOT NULL,
    ended_at_ms INTEGER,

    -- Per-run counters, accumulated while Running
    fetched INTEGER NOT NULL DEFAULT 0,
    inserted INTEGER NOT NULL DEFAULT 0,
    rejected INTEGER NOT NULL DEFAULT 0,
    warned INTEGER NOT NULL DEFAULT 0,
    deduplicated INTEGER NOT NULL DEFAULT 0,

    -- Error messages merged by text, with occurrence counts
    errors_json TEXT NOT NULL DEFAULT '[]'
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_ingestion_runs_started
    ON ingestion_runs(started_at_ms DESC);

CREATE INDEX IF NOT EXISTS idx_ingestion_runs_status
    ON ingestion_runs(status, started_at_ms DESC);
"#;

/// Distinct error messages kept per run; further messages fold into the
/// last entry's count.
const MAX_DISTINCT_ERRORS: usize = 64;

// =============================================================================
// MODEL
// =============================================================================

/// Run lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    RolledBack,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "rolled_back" => Some(Self::RolledBack),
            _ => None,
        }
    }

    /// Terminal states eligible for rollback.
    pub fn is_rollback_eligible(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One distinct error message with an occurrence count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub message: String,
    pub count: u64,
}

/// Counters for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub fetched: u64,
    pub inserted: u64,
    pub rejected: u64,
    pub warned: u64,
    pub deduplicated: u64,
    pub errors: Vec<RunError>,
}

impl RunStats {
    /// Rejected / fetched, or 0 when nothing was fetched.
    pub fn rejected_ratio(&self) -> f64 {
        if self.fetched == 0 {
            0.0
        } else {
            self.rejected as f64 / self.fetched as f64
        }
    }

    /// Warned / fetched, or 0 when nothing was fetched.
    pub fn warned_ratio(&self) -> f64 {
        if self.fetched == 0 {
            0.0
        } else {
            self.warned as f64 / self.fetched as f64
        }
    }
}

/// A batch of counter increments plus new error messages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsDelta {
    pub fetched: u64,
    pub inserted: u64,
    pub rejected: u64,
    pub warned: u64,
    pub deduplicated: u64,
    pub errors: Vec<String>,
}

impl StatsDelta {
    pub fn is_empty(&self) -> bool {
        self.fetched == 0
            && self.inserted == 0
            && self.rejected == 0
            && self.warned == 0
            && self.deduplicated == 0
            && self.errors.is_empty()
    }
}

/// What a caller supplies to open a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    /// Caller-supplied id; generated (UUID v4) when absent.
    pub run_id: Option<String>,
    /// Human-readable origin label, e.g. "binance-backfill".
    pub source: String,
    /// Arbitrary configuration/environment snapshot; hashed for
    /// reproducibility checks.
    pub config: serde_json::Value,
}

impl RunManifest {
    pub fn new(source: &str) -> Self {
        Self {
            run_id: None,
            source: source.to_string(),
            config: serde_json::Value::Null,
        }
    }

    pub fn with_run_id(mut self, run_id: &str) -> Self {
        self.run_id = Some(run_id.to_string());
        self
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    /// SHA-256 over the serialized config, hex-encoded.
    pub fn config_snapshot_hash(&self) -> String {
        let serialized = self.config.to_string();
        let mut hasher = Sha256::new();
        hasher.update(serialized.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// One tracked ingestion or migration attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionRun {
    pub run_id: String,
    pub status: RunStatus,
    pub source: String,
    pub config_snapshot_hash: String,
    pub started_at_ms: i64,
    pub ended_at_ms: Option<i64>,
    pub stats: RunStats,
}

/// Filter for `list_runs`. `None` fields match everything.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub status: Option<RunStatus>,
    pub started_after_ms: Option<i64>,
    pub started_before_ms: Option<i64>,
    pub limit: Option<u32>,
}

/// Thresholds for `find_faulty_runs`. A Completed run is faulty when either
/// ratio strictly exceeds its threshold.
#[derive(Debug, Clone, Copy)]
pub struct FaultyRunThresholds {
    pub max_rejected_ratio: f64,
    pub max_warned_ratio: f64,
}

// =============================================================================
// ERRORS
// =============================================================================

/// Ledger state-machine and persistence errors.
#[derive(Debug)]
pub enum LedgerError {
    /// `begin_run` with an id that already exists.
    DuplicateRun(String),
    /// A lifecycle operation found the run in the wrong state.
    InvalidTransition {
        run_id: String,
        from: RunStatus,
        to: RunStatus,
    },
    RunNotFound(String),
    /// A persisted row failed to map back to the model.
    Decode(String),
    Sqlite(rusqlite::Error),
    Serialization(serde_json::Error),
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateRun(id) => write!(f, "run already exists: {}", id),
            Self::InvalidTransition { run_id, from, to } => {
                write!(f, "invalid transition for run {}: {} -> {}", run_id, from, to)
            }
            Self::RunNotFound(id) => write!(f, "run not found: {}", id),
            Self::Decode(msg) => write!(f, "row decode error: {}", msg),
            Self::Sqlite(e) => write!(f, "SQLite error: {}", e),
            Self::Serialization(e) => write!(f, "Serialization error: {}", e),
        }
    }
}

impl std::error::Error for LedgerError {}

impl From<rusqlite::Error> for LedgerError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Sqlite(e)
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e)
    }
}

// =============================================================================
// LEDGER
// =============================================================================

/// SQLite-backed run ledger repository.
pub struct RunLedger {
    conn: Arc<Mutex<Connection>>,
}

impl RunLedger {
    /// Open or create the ledger at the given path.
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
            .with_context(|| format!("Failed to open run ledger database: {}", db_path))?;
        conn.execute_batch(RUN_LEDGER_SCHEMA)?;

        info!(path = %db_path, "Run ledger opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open in-memory storage (for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(RUN_LEDGER_SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create a run and move it straight through Pending into Running.
    ///
    /// Fails with `DuplicateRun` if the id already exists, regardless of the
    /// existing run's state.
    pub fn begin_run(&self, manifest: &RunManifest) -> Result<IngestionRun, LedgerError> {
        let run_id = manifest
            .run_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let config_snapshot_hash = manifest.config_snapshot_hash();
        let started_at_ms = Utc::now().timestamp_millis();

        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let inserted = tx.execute(
            "INSERT INTO ingestion_runs \
             (run_id, status, source, config_snapshot_hash, started_at_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                run_id,
                RunStatus::Pending.as_str(),
                manifest.source,
                config_snapshot_hash,
                started_at_ms,
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                return Err(LedgerError::DuplicateRun(run_id));
            }
            Err(e) => return Err(e.into()),
        }

        tx.execute(
            "UPDATE ingestion_runs SET status = ?1 WHERE run_id = ?2 AND status = ?3",
            params![
                RunStatus::Running.as_str(),
                run_id,
                RunStatus::Pending.as_str(),
            ],
        )?;
        tx.commit()?;
        drop(conn);

        info!(run_id = %run_id, source = %manifest.source, "Ingestion run started");

        self.get_run(&run_id)?
            .ok_or_else(|| LedgerError::RunNotFound(run_id))
    }

    /// Accumulate counters for a Running run. Callable many times; each call
    /// is atomic.
    pub fn record_stats(&self, run_id: &str, delta: &StatsDelta) -> Result<(), LedgerError> {
        if delta.is_empty() {
            return Ok(());
        }
        let conn = self.conn.lock();
        self.apply_delta(&conn, run_id, delta, RunStatus::Running)
    }

    /// Terminal transition Running -> Completed, folding in a final stats
    /// delta atomically with the transition.
    pub fn complete_run(
        &self,
        run_id: &str,
        final_delta: Option<&StatsDelta>,
    ) -> Result<IngestionRun, LedgerError> {
        self.finish_run(run_id, RunStatus::Completed, final_delta, None)
    }

    /// Terminal transition Running -> Failed, recording the run-level error.
    pub fn fail_run(&self, run_id: &str, error: &str) -> Result<IngestionRun, LedgerError> {
        warn!(run_id = %run_id, error = %error, "Ingestion run failed");
        self.finish_run(run_id, RunStatus::Failed, None, Some(error))
    }

    /// Orthogonal terminal transition Completed|Failed -> RolledBack. Stats
    /// are not altered.
    pub fn mark_rolled_back(&self, run_id: &str) -> Result<(), LedgerError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE ingestion_runs SET status = ?1 \
             WHERE run_id = ?2 AND status IN (?3, ?4)",
            params![
                RunStatus::RolledBack.as_str(),
                run_id,
                RunStatus::Completed.as_str(),
                RunStatus::Failed.as_str(),
            ],
        )?;
        if changed == 0 {
            let status = self.read_status(&conn, run_id)?;
            return Err(LedgerError::InvalidTransition {
                run_id: run_id.to_string(),
                from: status,
                to: RunStatus::RolledBack,
            });
        }
        info!(run_id = %run_id, "Run marked rolled back");
        Ok(())
    }

    /// Fetch one run with its live counters.
    pub fn get_run(&self, run_id: &str) -> Result<Option<IngestionRun>, LedgerError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT run_id, status, source, config_snapshot_hash, started_at_ms, \
                 ended_at_ms, fetched, inserted, rejected, warned, deduplicated, errors_json \
                 FROM ingestion_runs WHERE run_id = ?1",
                params![run_id],
                Self::row_to_run,
            )
            .optional()?;
        match row {
            Some(raw) => Ok(Some(raw.decode()?)),
            None => Ok(None),
        }
    }

    /// List runs ordered by `started_at_ms` descending.
    pub fn list_runs(&self, filter: &RunFilter) -> Result<Vec<IngestionRun>, LedgerError> {
        let mut sql = String::from(
            "SELECT run_id, status, source, config_snapshot_hash, started_at_ms, \
             ended_at_ms, fetched, inserted, rejected, warned, deduplicated, errors_json \
             FROM ingestion_runs WHERE 1=1",
        );
        let mut bind: Vec<Value> = Vec::new();

        if let Some(status) = filter.status {
            sql.push_str(" AND status = ?");
            bind.push(Value::Text(status.as_str().to_string()));
        }
        if let Some(after) = filter.started_after_ms {
            sql.push_str(" AND started_at_ms >= ?");
            bind.push(Value::Integer(after));
        }
        if let Some(before) = filter.started_before_ms {
            sql.push_str(" AND started_at_ms < ?");
            bind.push(Value::Integer(before));
        }
        sql.push_str(" ORDER BY started_at_ms DESC, run_id");
        if let Some(limit) = filter.limit {
            sql.push_str(" LIMIT ?");
            bind.push(Value::Integer(limit as i64));
        }

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(bind), Self::row_to_run)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?.decode()?);
        }
        Ok(out)
    }

    /// Completed runs whose rejected/fetched or warned/fetched ratio exceeds
    /// the thresholds. Pure query; drives operator-initiated rollback.
    pub fn find_faulty_runs(
        &self,
        thresholds: &FaultyRunThresholds,
    ) -> Result<Vec<IngestionRun>, LedgerError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT run_id, status, source, config_snapshot_hash, started_at_ms, \
             ended_at_ms, fetched, inserted, rejected, warned, deduplicated, errors_json \
             FROM ingestion_runs \
             WHERE status = ?1 AND fetched > 0 \
               AND (CAST(rejected AS REAL) / fetched > ?2 \
                 OR CAST(warned AS REAL) / fetched > ?3) \
             ORDER BY started_at_ms DESC, run_id",
        )?;
        let rows = stmt.query_map(
            params![
                RunStatus::Completed.as_str(),
                thresholds.max_rejected_ratio,
                thresholds.max_warned_ratio,
            ],
            Self::row_to_run,
        )?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?.decode()?);
        }
        Ok(out)
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn finish_run(
        &self,
        run_id: &str,
        to: RunStatus,
        final_delta: Option<&StatsDelta>,
        error: Option<&str>,
    ) -> Result<IngestionRun, LedgerError> {
        {
            let mut conn = self.conn.lock();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let current = self.read_status(&tx, run_id)?;
            if current != RunStatus::Running {
                return Err(LedgerError::InvalidTransition {
                    run_id: run_id.to_string(),
                    from: current,
                    to,
                });
            }

            if let Some(delta) = final_delta {
                if !delta.is_empty() {
                    self.apply_delta(&tx, run_id, delta, RunStatus::Running)?;
                }
            }
            if let Some(message) = error {
                let delta = StatsDelta {
                    errors: vec![message.to_string()],
                    ..StatsDelta::default()
                };
                self.apply_delta(&tx, run_id, &delta, RunStatus::Running)?;
            }

            let ended_at_ms = Utc::now().timestamp_millis();
            tx.execute(
                "UPDATE ingestion_runs SET status = ?1, ended_at_ms = ?2 \
                 WHERE run_id = ?3 AND status = ?4",
                params![
                    to.as_str(),
                    ended_at_ms,
                    run_id,
                    RunStatus::Running.as_str(),
                ],
            )?;
            tx.commit()?;
        }

        info!(run_id = %run_id, status = %to, "Ingestion run finished");

        self.get_run(run_id)?
            .ok_or_else(|| LedgerError::RunNotFound(run_id.to_string()))
    }

    /// Read-modify-write of counters and the error list, guarded by the
    /// expected status. The connection mutex serializes writers.
    fn apply_delta(
        &self,
        conn: &Connection,
        run_id: &str,
        delta: &StatsDelta,
        expected: RunStatus,
    ) -> Result<(), LedgerError> {
        let current: Option<(String, String)> = conn
            .query_row(
                "SELECT status, errors_json FROM ingestion_runs WHERE run_id = ?1",
                params![run_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (status_str, errors_json) = match current {
            Some(pair) => pair,
            None => return Err(LedgerError::RunNotFound(run_id.to_string())),
        };
        let status = RunStatus::parse(&status_str)
            .ok_or_else(|| LedgerError::Decode(format!("unknown run status '{}'", status_str)))?;
        if status != expected {
            return Err(LedgerError::InvalidTransition {
                run_id: run_id.to_string(),
                from: status,
                to: expected,
            });
        }

        let mut errors: Vec<RunError> = serde_json::from_str(&errors_json)?;
        for message in &delta.errors {
            merge_error(&mut errors, message);
        }
        let merged = serde_json::to_string(&errors)?;

        conn.execute(
            "UPDATE ingestion_runs SET \
             fetched = fetched + ?1, inserted = inserted + ?2, rejected = rejected + ?3, \
             warned = warned + ?4, deduplicated = deduplicated + ?5, errors_json = ?6 \
             WHERE run_id = ?7",
            params![
                delta.fetched as i64,
                delta.inserted as i64,
                delta.rejected as i64,
                delta.warned as i64,
                delta.deduplicated as i64,
                merged,
                run_id,
            ],
        )?;
        Ok(())
    }

    fn read_status(&self, conn: &Connection, run_id: &str) -> Result<RunStatus, LedgerError> {
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM ingestion_runs WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?;
        match status {
            Some(s) => RunStatus::parse(&s)
                .ok_or_else(|| LedgerError::Decode(format!("unknown run status '{}'", s))),
            None => Err(LedgerError::RunNotFound(run_id.to_string())),
        }
    }

    fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRunRow> {
        Ok(RawRunRow {
            run_id: row.get(0)?,
            status: row.get(1)?,
            source: row.get(2)?,
            config_snapshot_hash: row.get(3)?,
            started_at_ms: row.get(4)?,
            ended_at_ms: row.get(5)?,
            fetched: row.get(6)?,
            inserted: row.get(7)?,
            rejected: row.get(8)?,
            warned: row.get(9)?,
            deduplicated: row.get(10)?,
            errors_json: row.get(11)?,
        })
    }
}

fn merge_error(errors: &mut Vec<RunError>, message: &str) {
    if let Some(existing) = errors.iter_mut().find(|e| e.message == message) {
        existing.count += 1;
        return;
    }
    if errors.len() >= MAX_DISTINCT_ERRORS {
        // Fold overflow into the newest slot rather than growing unbounded.
        if let Some(last) = errors.last_mut() {
            last.count += 1;
        }
        return;
    }
    errors.push(RunError {
        message: message.to_string(),
        count: 1,
    });
}

/// Row image before enum/JSON decoding.
struct RawRunRow {
    run_id: String,
    status: String,
    source: String,
    config_snapshot_hash: String,
    started_at_ms: i64,
    ended_at_ms: Option<i64>,
    fetched: i64,
    inserted: i64,
    rejected: i64,
    warned: i64,
    deduplicated: i64,
    errors_json: String,
}

impl RawRunRow {
    fn decode(self) -> Result<IngestionRun, LedgerError> {
        let status = RunStatus::parse(&self.status)
            .ok_or_else(|| LedgerError::Decode(format!("unknown run status '{}'", self.status)))?;
        let errors: Vec<RunError> = serde_json::from_str(&self.errors_json)?;
        Ok(IngestionRun {
            run_id: self.run_id,
            status,
            source: self.source,
            config_snapshot_hash: self.config_snapshot_hash,
            started_at_ms: self.started_at_ms,
            ended_at_ms: self.ended_at_ms,
            stats: RunStats {
                fetched: self.fetched as u64,
                inserted: self.inserted as u64,
                rejected: self.rejected as u64,
                warned: self.warned as u64,
                deduplicated: self.deduplicated as u64,
                errors,
            },
        })
    }
}
