//! Engine Facade
//!
//! Wires the ledger, store, deduplication engine, rollback manager, and
//! migration controller into the operational surface a thin CLI or API
//! layer would wrap:
//!
//! - `begin_run` / `ingest_batch` / `complete_run` / `fail_run`
//! - `logical_view` / `logical_view_at`
//! - `list_runs` / `run_details` / `find_faulty_runs`
//! - `rollback_run`
//! - `sweep` / `sweep_batched` / `spawn_sweeper`
//! - `migrate`
//!
//! All collaborators are explicitly constructed and injected; nothing here
//! is process-global, so tests can stand up any number of engines.

use crate::candle::{CandleVersion, LogicalKey, RawCandle, SourceTier};
use crate::dedup::{CompactionReport, DedupEngine, SweepOptions};
use crate::ingest::{BatchResult, IngestError, IngestPipeline};
use crate::migration::{
    BatchOptions, CheckpointStore, LegacyCandleSource, LegacyMigrationConfig, LegacyMigrator,
    MigrationError, MigrationReport, TimeWindow,
};
use crate::rollback::{RollbackError, RollbackManager, RollbackReport};
use crate::run_ledger::{
    FaultyRunThresholds, IngestionRun, LedgerError, RunFilter, RunLedger, RunManifest, StatsDelta,
};
use crate::store::{CandleStore, KeyRange, SqliteCandleStore, StoreError};
use crate::sweeper::{spawn_sweeper, SweeperConfig, SweeperHandle};
use crate::validation::ValidationPolicy;
use anyhow::Result;
use std::path::Path;
use std::sync::Arc;

/// The assembled candle deduplication & ingestion audit engine.
pub struct CandleEngine {
    ledger: Arc<RunLedger>,
    store: Arc<dyn CandleStore>,
    checkpoints: Arc<CheckpointStore>,
    dedup: DedupEngine,
    rollback: RollbackManager,
    ingest: IngestPipeline,
}

impl CandleEngine {
    /// Assemble an engine from explicit collaborators.
    pub fn new(
        ledger: Arc<RunLedger>,
        store: Arc<dyn CandleStore>,
        checkpoints: Arc<CheckpointStore>,
        policy: ValidationPolicy,
    ) -> Self {
        let dedup = DedupEngine::new(store.clone());
        let rollback = RollbackManager::new(ledger.clone(), store.clone());
        let ingest = IngestPipeline::new(ledger.clone(), store.clone(), policy);
        Self {
            ledger,
            store,
            checkpoints,
            dedup,
            rollback,
            ingest,
        }
    }

    /// Open an engine with its three databases under one directory.
    pub fn open(dir: &Path, policy: ValidationPolicy) -> Result<Self> {
        let candle_db = dir.join("candles.db");
        let ledger_db = dir.join("runs.db");
        let checkpoint_db = dir.join("checkpoints.db");

        let store = SqliteCandleStore::open(&candle_db.to_string_lossy())?;
        let ledger = RunLedger::open(&ledger_db.to_string_lossy())?;
        let checkpoints = CheckpointStore::open(&checkpoint_db.to_string_lossy())?;

        Ok(Self::new(
            Arc::new(ledger),
            Arc::new(store),
            Arc::new(checkpoints),
            policy,
        ))
    }

    /// Fully in-memory engine (for testing).
    pub fn open_memory(policy: ValidationPolicy) -> Result<Self> {
        Ok(Self::new(
            Arc::new(RunLedger::open_memory()?),
            Arc::new(SqliteCandleStore::open_memory()?),
            Arc::new(CheckpointStore::open_memory()?),
            policy,
        ))
    }

    // -------------------------------------------------------------------------
    // Ingestion
    // -------------------------------------------------------------------------

    pub fn begin_run(&self, manifest: &RunManifest) -> Result<IngestionRun, LedgerError> {
        self.ledger.begin_run(manifest)
    }

    pub fn ingest_batch(
        &self,
        run_id: &str,
        candles: &[RawCandle],
        tier: SourceTier,
    ) -> Result<BatchResult, IngestError> {
        self.ingest.ingest_batch(run_id, candles, tier)
    }

    pub fn complete_run(
        &self,
        run_id: &str,
        final_delta: Option<&StatsDelta>,
    ) -> Result<IngestionRun, LedgerError> {
        self.ledger.complete_run(run_id, final_delta)
    }

    pub fn fail_run(&self, run_id: &str, error: &str) -> Result<IngestionRun, LedgerError> {
        self.ledger.fail_run(run_id, error)
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn logical_view(&self, range: &KeyRange) -> Result<Vec<CandleVersion>, StoreError> {
        self.dedup.logical_view(range)
    }

    pub fn logical_view_at(&self, key: &LogicalKey) -> Result<Option<CandleVersion>, StoreError> {
        self.dedup.logical_view_at(key)
    }

    pub fn list_runs(&self, filter: &RunFilter) -> Result<Vec<IngestionRun>, LedgerError> {
        self.ledger.list_runs(filter)
    }

    pub fn run_details(&self, run_id: &str) -> Result<Option<IngestionRun>, LedgerError> {
        self.ledger.get_run(run_id)
    }

    pub fn find_faulty_runs(
        &self,
        thresholds: &FaultyRunThresholds,
    ) -> Result<Vec<IngestionRun>, LedgerError> {
        self.ledger.find_faulty_runs(thresholds)
    }

    // -------------------------------------------------------------------------
    // Rollback and compaction
    // -------------------------------------------------------------------------

    pub fn rollback_run(&self, run_id: &str) -> Result<RollbackReport, RollbackError> {
        self.rollback.rollback(run_id)
    }

    /// On-demand compaction sweep.
    pub fn sweep(&self, options: &SweepOptions) -> Result<CompactionReport, StoreError> {
        self.dedup.sweep(options)
    }

    /// Memory-bounded sweep of a wide time range: one window at a time, so
    /// the per-key grouping set never covers more than `window_ms` of data.
    pub fn sweep_batched(
        &self,
        range: TimeWindow,
        window_ms: i64,
        options: &SweepOptions,
    ) -> Result<CompactionReport, StoreError> {
        let mut total = CompactionReport {
            dry_run: options.dry_run,
            ..CompactionReport::default()
        };
        for window in crate::migration::windows(range, window_ms) {
            let mut window_options = options.clone();
            window_options.range = KeyRange {
                start_ts_ms: Some(window.start_ms),
                end_ts_ms: Some(window.end_ms),
                ..options.range.clone()
            };
            let report = self.dedup.sweep(&window_options)?;
            total.keys_examined += report.keys_examined;
            total.keys_compacted += report.keys_compacted;
            total.versions_purged += report.versions_purged;
        }
        Ok(total)
    }

    /// Spawn the background sweeper on the current tokio runtime.
    pub fn spawn_sweeper(&self, config: SweeperConfig) -> SweeperHandle {
        spawn_sweeper(self.dedup.clone(), config)
    }

    // -------------------------------------------------------------------------
    // Migration
    // -------------------------------------------------------------------------

    /// Run a legacy migration job over `range`.
    pub fn migrate(
        &self,
        source: Arc<dyn LegacyCandleSource>,
        job_id: &str,
        range: TimeWindow,
        options: &BatchOptions,
        config: LegacyMigrationConfig,
    ) -> Result<MigrationReport, MigrationError> {
        let migrator = LegacyMigrator::new(
            source,
            self.store.clone(),
            self.ledger.clone(),
            self.checkpoints.clone(),
            config,
        );
        migrator.migrate(job_id, range, options)
    }

    // -------------------------------------------------------------------------
    // Accessors (integration tests and embedding layers)
    // -------------------------------------------------------------------------

    pub fn ledger(&self) -> &Arc<RunLedger> {
        &self.ledger
    }

    pub fn store(&self) -> &Arc<dyn CandleStore> {
        &self.store
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointStore> {
        &self.checkpoints
    }
}
