//! candlevault - Candle Deduplication & Ingestion Audit Engine
//!
//! Ingests OHLCV candles for many tokens from multiple overlapping, possibly
//! low-quality sources, physically retains every version ever written, and
//! presents exactly one authoritative value per (entity, chain, timestamp,
//! interval) key.
//!
//! # Architecture
//!
//! ```text
//! upstream fetch (external)
//!        │
//!        ▼
//! ┌─────────────┐   outcome counts    ┌─────────────┐
//! │  Validator  │────────────────────▶│ Run Ledger  │
//! │ (corruption │                     │ (append-only│
//! │  / quality) │                     │  run record)│
//! └──────┬──────┘                     └──────┬──────┘
//!        │ score + run tag                   │ status CAS
//!        ▼                                   ▼
//! ┌──────────────────────────────────────────────────┐
//! │        Physical store (append-only versions)     │
//! └──────┬─────────────────┬──────────────┬──────────┘
//!        │                 │              │
//!        ▼                 ▼              ▼
//! ┌─────────────┐   ┌─────────────┐   ┌──────────────┐
//! │ DedupEngine │   │  Rollback   │   │ BatchMigrator│
//! │ (view +     │   │ (tombstone  │   │ (windowed,   │
//! │  compaction)│   │  by run)    │   │ checkpointed)│
//! └─────────────┘   └─────────────┘   └──────────────┘
//! ```
//!
//! # Determinism Guarantees
//!
//! - Resolution uses the total order `(quality_score, ingested_at_ns,
//!   run_id)` over data already written, never wall-clock write order, so
//!   the logical view is identical for any permutation of writes.
//! - Compaction and rollback only remove or tombstone non-winning rows;
//!   neither can change a resolution result.
//! - A candle with positive volume always outranks a zero-volume version of
//!   the same key (scoring bounds), for any source tiers and write times.

pub mod candle;
pub mod quality;
pub mod validation;
pub mod run_ledger;
pub mod store;
pub mod dedup;
pub mod sweeper;
pub mod rollback;
pub mod migration;
pub mod ingest;
pub mod engine;

#[cfg(test)]
mod run_ledger_tests;
#[cfg(test)]
mod migration_tests;

pub use candle::{CandleVersion, Interval, LogicalKey, RawCandle, SourceTier};
pub use dedup::{CompactionReport, DedupEngine, SweepOptions};
pub use engine::CandleEngine;
pub use ingest::{BatchResult, IngestError, IngestPipeline};
pub use migration::{
    BatchOptions, LegacyCandleSource, LegacyMigrationConfig, MigratedScorePolicy, MigrationError,
    MigrationReport, TimeWindow,
};
pub use rollback::{RollbackError, RollbackManager, RollbackReport};
pub use run_ledger::{
    FaultyRunThresholds, IngestionRun, LedgerError, RunFilter, RunLedger, RunManifest, RunStats,
    RunStatus, StatsDelta,
};
pub use store::{CandleStore, KeyRange, SqliteCandleStore, StoreError};
pub use validation::{ValidationOutcome, ValidationPolicy};
