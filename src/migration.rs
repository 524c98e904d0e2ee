//! Batched Window Driver and Legacy Migration Controller
//!
//! Large backfills and legacy-format migrations cannot be processed in one
//! pass: the per-key aggregation set for a wide time range can exceed
//! available memory. The driver therefore processes a time range as a
//! sequence of disjoint half-open windows `[start, start + W)`, commits each
//! window, checkpoints the last completed window boundary per job, and
//! resumes from the checkpoint after a crash.
//!
//! # Failure Semantics
//!
//! A failure partway through a window aborts only that window. Prior
//! windows' commits stand; retrying the whole call resumes at the failed
//! window. Re-processing an already-committed window is idempotent at the
//! logical-view level: writes are keyed and resolution is
//! order-independent, so replayed rows can add physical versions but never
//! change a winner to different values.

use crate::candle::{CandleVersion, RawCandle, SourceTier, TimestampMs};
use crate::run_ledger::{LedgerError, RunLedger, RunManifest, StatsDelta};
use crate::store::{CandleStore, StoreError};
use crate::validation::{validate, ValidationOutcome, ValidationPolicy};
use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

// =============================================================================
// TIME WINDOWS
// =============================================================================

/// A half-open `[start_ms, end_ms)` time window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start_ms: TimestampMs,
    pub end_ms: TimestampMs,
}

impl TimeWindow {
    pub fn new(start_ms: TimestampMs, end_ms: TimestampMs) -> Self {
        Self { start_ms, end_ms }
    }

    pub fn contains(&self, ts_ms: TimestampMs) -> bool {
        ts_ms >= self.start_ms && ts_ms < self.end_ms
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start_ms, self.end_ms)
    }
}

/// Split a range into disjoint windows of `width_ms`, the last one clipped
/// to the range end.
pub fn windows(range: TimeWindow, width_ms: i64) -> Vec<TimeWindow> {
    debug_assert!(width_ms > 0, "window width must be positive");
    let mut out = Vec::new();
    let mut start = range.start_ms;
    while start < range.end_ms {
        let end = (start + width_ms).min(range.end_ms);
        out.push(TimeWindow::new(start, end));
        start = end;
    }
    out
}

// =============================================================================
// ERRORS
// =============================================================================

/// Migration driver and controller errors.
#[derive(Debug)]
pub enum MigrationError {
    InvalidRange { start_ms: i64, end_ms: i64 },
    InvalidWindowWidth(i64),
    /// One window's processing failed. Prior windows' commits stand; the
    /// whole call is safe to retry with `resume`.
    BatchFailure {
        job_id: String,
        window: TimeWindow,
        message: String,
    },
    Ledger(LedgerError),
    Store(StoreError),
    Sqlite(rusqlite::Error),
}

impl fmt::Display for MigrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidRange { start_ms, end_ms } => {
                write!(f, "invalid time range [{}, {})", start_ms, end_ms)
            }
            Self::InvalidWindowWidth(w) => write!(f, "invalid window width {}", w),
            Self::BatchFailure {
                job_id,
                window,
                message,
            } => write!(f, "window {} of job {} failed: {}", window, job_id, message),
            Self::Ledger(e) => write!(f, "ledger error: {}", e),
            Self::Store(e) => write!(f, "store error: {}", e),
            Self::Sqlite(e) => write!(f, "SQLite error: {}", e),
        }
    }
}

impl std::error::Error for MigrationError {}

impl From<LedgerError> for MigrationError {
    fn from(e: LedgerError) -> Self {
        Self::Ledger(e)
    }
}

impl From<StoreError> for MigrationError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<rusqlite::Error> for MigrationError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Sqlite(e)
    }
}

// =============================================================================
// CHECKPOINT STORE
// =============================================================================

const CHECKPOINT_SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

-- Last fully-committed window boundary per migration job.
CREATE TABLE IF NOT EXISTS migration_checkpoints (
    job_id TEXT PRIMARY KEY,
    last_window_end_ms INTEGER NOT NULL,
    updated_at_ms INTEGER NOT NULL
) WITHOUT ROWID;
"#;

/// Durable per-job window checkpoints.
pub struct CheckpointStore {
    conn: Arc<Mutex<Connection>>,
}

impl CheckpointStore {
    /// Open or create the checkpoint database at the given path.
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
            .with_context(|| format!("Failed to open checkpoint database: {}", db_path))?;
        conn.execute_batch(CHECKPOINT_SCHEMA)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open in-memory storage (for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(CHECKPOINT_SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// The last fully-committed window end for a job, if any.
    pub fn last_checkpoint(&self, job_id: &str) -> Result<Option<i64>, MigrationError> {
        let conn = self.conn.lock();
        let value = conn
            .query_row(
                "SELECT last_window_end_ms FROM migration_checkpoints WHERE job_id = ?1",
                params![job_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Record a committed window boundary.
    pub fn record(&self, job_id: &str, window_end_ms: i64) -> Result<(), MigrationError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO migration_checkpoints (job_id, last_window_end_ms, updated_at_ms) \
             VALUES (?1, ?2, ?3) \
             ON CONFLICT(job_id) DO UPDATE SET \
             last_window_end_ms = excluded.last_window_end_ms, \
             updated_at_ms = excluded.updated_at_ms",
            params![job_id, window_end_ms, Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }

    /// Forget a job's checkpoint (e.g. after a deliberate full re-run).
    pub fn clear(&self, job_id: &str) -> Result<(), MigrationError> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM migration_checkpoints WHERE job_id = ?1",
            params![job_id],
        )?;
        Ok(())
    }
}

// =============================================================================
// WINDOW DRIVER
// =============================================================================

/// Per-window work result, accumulated into the report.
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowOutcome {
    pub rows_read: u64,
    pub rows_written: u64,
    pub rows_rejected: u64,
    pub rows_warned: u64,
    pub rows_deduplicated: u64,
}

/// One unit of windowed work. Errors are plain messages; the driver wraps
/// them with window context into `MigrationError::BatchFailure`.
pub trait WindowProcessor {
    fn process(&mut self, window: &TimeWindow) -> Result<WindowOutcome, String>;
}

/// Driver options.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Window width in milliseconds.
    pub window_ms: i64,
    /// Skip windows at or before the job's checkpoint.
    pub resume: bool,
    /// Process and count without committing or checkpointing.
    pub dry_run: bool,
}

/// Outcome of one driver invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MigrationReport {
    pub job_id: String,
    /// The ledger run that tagged this invocation's writes. `None` for dry
    /// runs.
    pub run_id: Option<String>,
    pub windows_planned: u64,
    pub windows_processed: u64,
    /// Windows skipped because of a resume checkpoint.
    pub windows_skipped: u64,
    pub rows_read: u64,
    pub rows_migrated: u64,
    pub rows_rejected: u64,
    pub rows_warned: u64,
    pub rows_deduplicated: u64,
    /// Checkpoint this invocation started from, when resuming.
    pub resumed_from_ms: Option<i64>,
    /// Last committed window boundary after this invocation.
    pub checkpoint_ms: Option<i64>,
    pub dry_run: bool,
}

/// Windowed execution with checkpointing. Generic over the per-window work
/// so bulk migration and windowed reprocessing share one resume/commit
/// implementation.
pub struct BatchWindowDriver {
    checkpoints: Arc<CheckpointStore>,
}

impl BatchWindowDriver {
    pub fn new(checkpoints: Arc<CheckpointStore>) -> Self {
        Self { checkpoints }
    }

    pub fn run(
        &self,
        job_id: &str,
        range: TimeWindow,
        options: &BatchOptions,
        processor: &mut dyn WindowProcessor,
    ) -> Result<MigrationReport, MigrationError> {
        if range.start_ms >= range.end_ms {
            return Err(MigrationError::InvalidRange {
                start_ms: range.start_ms,
                end_ms: range.end_ms,
            });
        }
        if options.window_ms <= 0 {
            return Err(MigrationError::InvalidWindowWidth(options.window_ms));
        }

        let mut report = MigrationReport {
            job_id: job_id.to_string(),
            dry_run: options.dry_run,
            ..MigrationReport::default()
        };

        let mut effective_start = range.start_ms;
        if options.resume {
            if let Some(checkpoint) = self.checkpoints.last_checkpoint(job_id)? {
                if checkpoint > effective_start {
                    report.resumed_from_ms = Some(checkpoint);
                    report.checkpoint_ms = Some(checkpoint);
                    effective_start = checkpoint;
                }
            }
        }

        let all = windows(range, options.window_ms);
        report.windows_planned = all.len() as u64;

        for window in all {
            if window.start_ms < effective_start {
                report.windows_skipped += 1;
                continue;
            }

            debug!(job_id = %job_id, window = %window, "Processing migration window");

            let outcome = processor.process(&window).map_err(|message| {
                MigrationError::BatchFailure {
                    job_id: job_id.to_string(),
                    window,
                    message,
                }
            })?;

            report.windows_processed += 1;
            report.rows_read += outcome.rows_read;
            report.rows_migrated += outcome.rows_written;
            report.rows_rejected += outcome.rows_rejected;
            report.rows_warned += outcome.rows_warned;
            report.rows_deduplicated += outcome.rows_deduplicated;

            if !options.dry_run {
                self.checkpoints.record(job_id, window.end_ms)?;
                report.checkpoint_ms = Some(window.end_ms);
            }
        }

        info!(
            job_id = %job_id,
            windows = report.windows_processed,
            skipped = report.windows_skipped,
            rows = report.rows_migrated,
            dry_run = report.dry_run,
            "Batched job finished"
        );
        Ok(report)
    }
}

// =============================================================================
// LEGACY MIGRATION
// =============================================================================

/// Reads legacy-format candles for one window. Implemented by the adapter
/// over whatever legacy table/file format is being migrated.
pub trait LegacyCandleSource: Send + Sync {
    fn fetch_window(&self, window: &TimeWindow) -> Result<Vec<RawCandle>, String>;
}

/// How migrated rows are scored.
///
/// Legacy rows predate validation, so the reference behavior gives them a
/// sentinel score of 0: they never outrank any freshly-validated version,
/// not even a zero-volume one. That precedence is a policy choice, so it is
/// explicit and configurable here rather than baked in.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum MigratedScorePolicy {
    /// Fixed score for every migrated row.
    Sentinel(u8),
    /// Score migrated rows through the normal quality formula.
    Recompute,
}

impl Default for MigratedScorePolicy {
    fn default() -> Self {
        Self::Sentinel(0)
    }
}

/// Configuration for a legacy migration job.
#[derive(Debug, Clone)]
pub struct LegacyMigrationConfig {
    pub score_policy: MigratedScorePolicy,
    /// Provenance tier recorded on migrated rows (and used by the formula
    /// under `Recompute`).
    pub tier: SourceTier,
    /// Ledger source label for migration runs.
    pub source_label: String,
}

impl Default for LegacyMigrationConfig {
    fn default() -> Self {
        Self {
            score_policy: MigratedScorePolicy::default(),
            tier: SourceTier::Backfill,
            source_label: "legacy-migration".to_string(),
        }
    }
}

/// Drives a `LegacyCandleSource` through the window driver into the
/// versioned store, under its own ledger run so the whole migration can be
/// rolled back like any other ingestion.
pub struct LegacyMigrator {
    source: Arc<dyn LegacyCandleSource>,
    store: Arc<dyn CandleStore>,
    ledger: Arc<RunLedger>,
    driver: BatchWindowDriver,
    config: LegacyMigrationConfig,
}

impl LegacyMigrator {
    pub fn new(
        source: Arc<dyn LegacyCandleSource>,
        store: Arc<dyn CandleStore>,
        ledger: Arc<RunLedger>,
        checkpoints: Arc<CheckpointStore>,
        config: LegacyMigrationConfig,
    ) -> Self {
        Self {
            source,
            store,
            ledger,
            driver: BatchWindowDriver::new(checkpoints),
            config,
        }
    }

    /// Migrate `range` in `options.window_ms` windows.
    ///
    /// Each non-dry invocation opens its own ledger run; on success the run
    /// completes, on a window failure it fails with the window's error and
    /// the checkpoint stays at the last committed boundary.
    pub fn migrate(
        &self,
        job_id: &str,
        range: TimeWindow,
        options: &BatchOptions,
    ) -> Result<MigrationReport, MigrationError> {
        let run_id = if options.dry_run {
            None
        } else {
            let manifest = RunManifest::new(&self.config.source_label).with_config(json!({
                "job_id": job_id,
                "range": range,
                "window_ms": options.window_ms,
                "resume": options.resume,
                "score_policy": self.config.score_policy,
                "tier": self.config.tier,
            }));
            Some(self.ledger.begin_run(&manifest)?.run_id)
        };

        let mut processor = LegacyWindowProcessor {
            source: self.source.as_ref(),
            store: self.store.as_ref(),
            ledger: self.ledger.as_ref(),
            config: &self.config,
            run_id: run_id.as_deref(),
        };

        let result = self.driver.run(job_id, range, options, &mut processor);

        match (&result, &run_id) {
            (Ok(_), Some(id)) => {
                self.ledger.complete_run(id, None)?;
            }
            (Err(e), Some(id)) => {
                self.ledger.fail_run(id, &e.to_string())?;
            }
            _ => {}
        }

        let mut report = result?;
        report.run_id = run_id;
        Ok(report)
    }
}

/// Per-window legacy migration work: read, gate corruption, score per
/// policy, dedup within the window, append, record stats.
struct LegacyWindowProcessor<'a> {
    source: &'a dyn LegacyCandleSource,
    store: &'a dyn CandleStore,
    ledger: &'a RunLedger,
    config: &'a LegacyMigrationConfig,
    run_id: Option<&'a str>,
}

impl WindowProcessor for LegacyWindowProcessor<'_> {
    fn process(&mut self, window: &TimeWindow) -> Result<WindowOutcome, String> {
        let rows = self.source.fetch_window(window)?;
        let mut outcome = WindowOutcome {
            rows_read: rows.len() as u64,
            ..WindowOutcome::default()
        };

        let ingested_at_ns = crate::candle::wall_clock_nanos();
        let mut errors: Vec<String> = Vec::new();
        let mut kept: BTreeMap<crate::candle::LogicalKey, CandleVersion> = BTreeMap::new();

        for raw in &rows {
            // Migration is lenient by construction: only corruption drops a
            // legacy row, quality defects just count as warnings.
            let validated = validate(raw, self.config.tier, ValidationPolicy::Lenient);
            let score = match validated {
                ValidationOutcome::Rejected { reason } => {
                    outcome.rows_rejected += 1;
                    errors.push(reason.to_string());
                    continue;
                }
                ValidationOutcome::Warned { score, .. } => {
                    outcome.rows_warned += 1;
                    score
                }
                ValidationOutcome::Accepted { score } => score,
            };
            let score = match self.config.score_policy {
                MigratedScorePolicy::Sentinel(sentinel) => sentinel,
                MigratedScorePolicy::Recompute => score,
            };

            let run_id = self.run_id.unwrap_or("dry-run");
            let version =
                CandleVersion::from_raw(raw, score, self.config.tier, run_id, ingested_at_ns);
            match kept.entry(version.key.clone()) {
                std::collections::btree_map::Entry::Vacant(slot) => {
                    slot.insert(version);
                }
                std::collections::btree_map::Entry::Occupied(mut slot) => {
                    outcome.rows_deduplicated += 1;
                    if version.resolution_key() > slot.get().resolution_key() {
                        slot.insert(version);
                    }
                }
            }
        }

        let versions: Vec<CandleVersion> = kept.into_values().collect();
        outcome.rows_written = versions.len() as u64;

        if let Some(run_id) = self.run_id {
            self.store
                .append_versions(&versions)
                .map_err(|e| e.to_string())?;
            let delta = StatsDelta {
                fetched: outcome.rows_read,
                inserted: outcome.rows_written,
                rejected: outcome.rows_rejected,
                warned: outcome.rows_warned,
                deduplicated: outcome.rows_deduplicated,
                errors,
            };
            self.ledger
                .record_stats(run_id, &delta)
                .map_err(|e| e.to_string())?;
        }

        Ok(outcome)
    }
}
