//! Batched Migration Tests
//!
//! Covers window arithmetic, checkpoint durability, per-window failure
//! isolation, and the resumable-migration property: one pass over a range
//! and a crash-plus-resume produce identical logical views.

use crate::candle::{Interval, RawCandle, SourceTier};
use crate::engine::CandleEngine;
use crate::migration::{
    windows, BatchOptions, CheckpointStore, LegacyCandleSource, LegacyMigrationConfig,
    MigratedScorePolicy, MigrationError, TimeWindow,
};
use crate::run_ledger::{RunFilter, RunStatus};
use crate::store::KeyRange;
use crate::validation::ValidationPolicy;
use std::sync::Arc;

const W: i64 = 10_000;

fn raw(entity: &str, ts_ms: i64, close: f64, volume: f64) -> RawCandle {
    RawCandle {
        entity_id: entity.into(),
        chain: "ethereum".into(),
        interval: Interval::M5,
        ts_ms,
        open: 1.0,
        high: 2.0,
        low: 0.5,
        close,
        volume,
    }
}

/// Legacy source over a fixed row set, with an optional window that fails.
struct TestSource {
    rows: Vec<RawCandle>,
    fail_window_start: Option<i64>,
}

impl TestSource {
    fn new(rows: Vec<RawCandle>) -> Arc<Self> {
        Arc::new(Self {
            rows,
            fail_window_start: None,
        })
    }

    fn failing_at(rows: Vec<RawCandle>, window_start: i64) -> Arc<Self> {
        Arc::new(Self {
            rows,
            fail_window_start: Some(window_start),
        })
    }
}

impl LegacyCandleSource for TestSource {
    fn fetch_window(&self, window: &TimeWindow) -> Result<Vec<RawCandle>, String> {
        if self.fail_window_start == Some(window.start_ms) {
            return Err("legacy store unavailable".into());
        }
        Ok(self
            .rows
            .iter()
            .filter(|r| window.contains(r.ts_ms))
            .cloned()
            .collect())
    }
}

fn options(resume: bool) -> BatchOptions {
    BatchOptions {
        window_ms: W,
        resume,
        dry_run: false,
    }
}

/// Row set spanning three windows of width `W` starting at 0.
fn three_window_rows() -> Vec<RawCandle> {
    vec![
        raw("tokenA", 1_000, 1.1, 100.0),
        raw("tokenB", 2_000, 1.2, 100.0),
        raw("tokenA", 11_000, 1.3, 100.0),
        raw("tokenB", 12_000, 1.4, 100.0),
        raw("tokenA", 21_000, 1.5, 100.0),
    ]
}

/// Comparable image of the logical view: (entity, ts, close, score).
fn view_signature(engine: &CandleEngine) -> Vec<(String, i64, f64, u8)> {
    engine
        .logical_view(&KeyRange::all())
        .unwrap()
        .into_iter()
        .map(|v| (v.key.entity_id, v.key.ts_ms, v.close, v.quality_score))
        .collect()
}

// =============================================================================
// WINDOW ARITHMETIC
// =============================================================================

#[test]
fn test_windows_are_disjoint_and_clipped() {
    let range = TimeWindow::new(0, 25_000);
    let ws = windows(range, W);
    assert_eq!(
        ws,
        vec![
            TimeWindow::new(0, 10_000),
            TimeWindow::new(10_000, 20_000),
            TimeWindow::new(20_000, 25_000),
        ]
    );

    // Exact multiple: no stub window.
    assert_eq!(windows(TimeWindow::new(0, 20_000), W).len(), 2);
    // Range narrower than one window.
    assert_eq!(
        windows(TimeWindow::new(5_000, 7_000), W),
        vec![TimeWindow::new(5_000, 7_000)]
    );
}

#[test]
fn test_window_contains_is_half_open() {
    let w = TimeWindow::new(10_000, 20_000);
    assert!(w.contains(10_000));
    assert!(w.contains(19_999));
    assert!(!w.contains(20_000));
    assert!(!w.contains(9_999));
}

// =============================================================================
// CHECKPOINT STORE
// =============================================================================

#[test]
fn test_checkpoints_record_and_upsert() {
    let store = CheckpointStore::open_memory().unwrap();
    assert_eq!(store.last_checkpoint("job").unwrap(), None);

    store.record("job", 10_000).unwrap();
    assert_eq!(store.last_checkpoint("job").unwrap(), Some(10_000));

    store.record("job", 20_000).unwrap();
    assert_eq!(store.last_checkpoint("job").unwrap(), Some(20_000));

    // Jobs are independent.
    assert_eq!(store.last_checkpoint("other").unwrap(), None);

    store.clear("job").unwrap();
    assert_eq!(store.last_checkpoint("job").unwrap(), None);
}

// =============================================================================
// MIGRATION RUNS
// =============================================================================

#[test]
fn test_full_migration_writes_sentinel_scored_rows() {
    let engine = CandleEngine::open_memory(ValidationPolicy::Lenient).unwrap();
    let report = engine
        .migrate(
            TestSource::new(three_window_rows()),
            "backfill-2024",
            TimeWindow::new(0, 30_000),
            &options(false),
            LegacyMigrationConfig::default(),
        )
        .unwrap();

    assert_eq!(report.windows_planned, 3);
    assert_eq!(report.windows_processed, 3);
    assert_eq!(report.rows_read, 5);
    assert_eq!(report.rows_migrated, 5);
    assert_eq!(report.checkpoint_ms, Some(30_000));

    // Migrated rows carry the sentinel score and the configured tier.
    let view = engine.logical_view(&KeyRange::all()).unwrap();
    assert_eq!(view.len(), 5);
    assert!(view.iter().all(|v| v.quality_score == 0));
    assert!(view.iter().all(|v| v.source_tier == SourceTier::Backfill));

    // The migration ran under its own completed ledger run.
    let run_id = report.run_id.unwrap();
    let run = engine.run_details(&run_id).unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.stats.fetched, 5);
    assert_eq!(run.stats.inserted, 5);
}

#[test]
fn test_migration_drops_corrupt_rows_only() {
    let mut rows = three_window_rows();
    // Inverted range: corrupt, dropped. Zero volume: warned, kept.
    rows.push(raw("corrupt", 3_000, 1.0, 100.0));
    rows.last_mut().unwrap().high = 0.1;
    rows.push(raw("sparse", 4_000, 1.0, 0.0));

    let engine = CandleEngine::open_memory(ValidationPolicy::Lenient).unwrap();
    let report = engine
        .migrate(
            TestSource::new(rows),
            "backfill-2024",
            TimeWindow::new(0, 30_000),
            &options(false),
            LegacyMigrationConfig::default(),
        )
        .unwrap();

    assert_eq!(report.rows_read, 7);
    assert_eq!(report.rows_rejected, 1);
    assert_eq!(report.rows_warned, 1);
    assert_eq!(report.rows_migrated, 6);

    let view = engine.logical_view(&KeyRange::all()).unwrap();
    assert!(view.iter().all(|v| v.key.entity_id != "corrupt"));
    assert!(view.iter().any(|v| v.key.entity_id == "sparse"));
}

#[test]
fn test_recompute_policy_scores_through_the_formula() {
    let engine = CandleEngine::open_memory(ValidationPolicy::Lenient).unwrap();
    engine
        .migrate(
            TestSource::new(vec![raw("tokenA", 1_000, 1.1, 100.0)]),
            "backfill-2024",
            TimeWindow::new(0, W),
            &options(false),
            LegacyMigrationConfig {
                score_policy: MigratedScorePolicy::Recompute,
                ..LegacyMigrationConfig::default()
            },
        )
        .unwrap();

    let view = engine.logical_view(&KeyRange::all()).unwrap();
    // 100 + 10 + 5 + 5 + 1 (Backfill).
    assert_eq!(view[0].quality_score, 121);
}

#[test]
fn test_migrated_sentinel_rows_lose_to_fresh_ingestion() {
    let engine = CandleEngine::open_memory(ValidationPolicy::Lenient).unwrap();
    engine
        .migrate(
            TestSource::new(vec![raw("tokenA", 1_000, 9.9, 100.0)]),
            "backfill-2024",
            TimeWindow::new(0, W),
            &options(false),
            LegacyMigrationConfig::default(),
        )
        .unwrap();

    // Even a zero-volume lenient ingest (score 21) outranks sentinel rows.
    engine
        .begin_run(&crate::run_ledger::RunManifest::new("feed").with_run_id("fresh"))
        .unwrap();
    engine
        .ingest_batch("fresh", &[raw("tokenA", 1_000, 1.5, 0.0)], SourceTier::Backfill)
        .unwrap();

    let view = engine.logical_view(&KeyRange::all()).unwrap();
    assert_eq!(view.len(), 1);
    assert_eq!(view[0].close, 1.5);
    assert_eq!(view[0].quality_score, 21);
}

#[test]
fn test_dry_run_writes_nothing() {
    let engine = CandleEngine::open_memory(ValidationPolicy::Lenient).unwrap();
    let report = engine
        .migrate(
            TestSource::new(three_window_rows()),
            "backfill-2024",
            TimeWindow::new(0, 30_000),
            &BatchOptions {
                window_ms: W,
                resume: false,
                dry_run: true,
            },
            LegacyMigrationConfig::default(),
        )
        .unwrap();

    assert!(report.dry_run);
    assert_eq!(report.rows_read, 5);
    assert_eq!(report.rows_migrated, 5);
    assert!(report.run_id.is_none());
    assert_eq!(report.checkpoint_ms, None);

    assert!(engine.logical_view(&KeyRange::all()).unwrap().is_empty());
    assert!(engine.list_runs(&RunFilter::default()).unwrap().is_empty());
    assert_eq!(
        engine.checkpoints().last_checkpoint("backfill-2024").unwrap(),
        None
    );
}

// =============================================================================
// FAILURE AND RESUME
// =============================================================================

#[test]
fn test_failed_window_aborts_at_checkpoint_boundary() {
    let engine = CandleEngine::open_memory(ValidationPolicy::Lenient).unwrap();
    let result = engine.migrate(
        TestSource::failing_at(three_window_rows(), 10_000),
        "backfill-2024",
        TimeWindow::new(0, 30_000),
        &options(false),
        LegacyMigrationConfig::default(),
    );

    match result {
        Err(MigrationError::BatchFailure { window, .. }) => {
            assert_eq!(window.start_ms, 10_000);
        }
        other => panic!("expected BatchFailure, got {:?}", other),
    }

    // Window one's commit stands; the checkpoint sits before the failure.
    assert_eq!(
        engine.checkpoints().last_checkpoint("backfill-2024").unwrap(),
        Some(10_000)
    );
    let view = engine.logical_view(&KeyRange::all()).unwrap();
    assert_eq!(view.len(), 2);
    assert!(view.iter().all(|v| v.key.ts_ms < 10_000));

    // The migration run is recorded as Failed.
    let runs = engine.list_runs(&RunFilter::default()).unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Failed);
}

#[test]
fn test_crash_and_resume_matches_single_pass() {
    // Reference: one uninterrupted pass.
    let reference = CandleEngine::open_memory(ValidationPolicy::Lenient).unwrap();
    reference
        .migrate(
            TestSource::new(three_window_rows()),
            "backfill-2024",
            TimeWindow::new(0, 30_000),
            &options(false),
            LegacyMigrationConfig::default(),
        )
        .unwrap();

    // Crashing pass: fails at the third window, then resumes.
    let resumed = CandleEngine::open_memory(ValidationPolicy::Lenient).unwrap();
    let first = resumed.migrate(
        TestSource::failing_at(three_window_rows(), 20_000),
        "backfill-2024",
        TimeWindow::new(0, 30_000),
        &options(false),
        LegacyMigrationConfig::default(),
    );
    assert!(first.is_err());

    let second = resumed
        .migrate(
            TestSource::new(three_window_rows()),
            "backfill-2024",
            TimeWindow::new(0, 30_000),
            &options(true),
            LegacyMigrationConfig::default(),
        )
        .unwrap();
    assert_eq!(second.windows_skipped, 2);
    assert_eq!(second.windows_processed, 1);
    assert_eq!(second.resumed_from_ms, Some(20_000));

    assert_eq!(view_signature(&reference), view_signature(&resumed));
}

#[test]
fn test_replaying_a_committed_window_is_view_idempotent() {
    let engine = CandleEngine::open_memory(ValidationPolicy::Lenient).unwrap();
    let full_range = TimeWindow::new(0, 30_000);
    engine
        .migrate(
            TestSource::new(three_window_rows()),
            "backfill-2024",
            full_range,
            &options(false),
            LegacyMigrationConfig::default(),
        )
        .unwrap();
    let before = view_signature(&engine);

    // Deliberate full re-run without resume: every window replays.
    engine
        .migrate(
            TestSource::new(three_window_rows()),
            "backfill-2024-redo",
            full_range,
            &options(false),
            LegacyMigrationConfig::default(),
        )
        .unwrap();

    assert_eq!(view_signature(&engine), before);
}

#[test]
fn test_duplicate_keys_within_a_window_collapse() {
    let rows = vec![
        raw("tokenA", 1_000, 1.1, 100.0),
        raw("tokenA", 1_000, 1.1, 100.0),
    ];
    let engine = CandleEngine::open_memory(ValidationPolicy::Lenient).unwrap();
    let report = engine
        .migrate(
            TestSource::new(rows),
            "backfill-2024",
            TimeWindow::new(0, W),
            &options(false),
            LegacyMigrationConfig::default(),
        )
        .unwrap();

    assert_eq!(report.rows_read, 2);
    assert_eq!(report.rows_deduplicated, 1);
    assert_eq!(report.rows_migrated, 1);
}

// =============================================================================
// ARGUMENT VALIDATION
// =============================================================================

#[test]
fn test_invalid_range_and_window_are_refused() {
    let engine = CandleEngine::open_memory(ValidationPolicy::Lenient).unwrap();

    let empty = engine.migrate(
        TestSource::new(vec![]),
        "job",
        TimeWindow::new(5_000, 5_000),
        &options(false),
        LegacyMigrationConfig::default(),
    );
    assert!(matches!(empty, Err(MigrationError::InvalidRange { .. })));

    let zero_width = engine.migrate(
        TestSource::new(vec![]),
        "job",
        TimeWindow::new(0, 10_000),
        &BatchOptions {
            window_ms: 0,
            resume: false,
            dry_run: false,
        },
        LegacyMigrationConfig::default(),
    );
    assert!(matches!(
        zero_width,
        Err(MigrationError::InvalidWindowWidth(0))
    ));
}
