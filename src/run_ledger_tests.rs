//! Run Ledger State Machine and Statistics Tests

use crate::run_ledger::{
    FaultyRunThresholds, LedgerError, RunFilter, RunLedger, RunManifest, RunStatus, StatsDelta,
};
use serde_json::json;

fn delta(fetched: u64, inserted: u64, rejected: u64, warned: u64) -> StatsDelta {
    StatsDelta {
        fetched,
        inserted,
        rejected,
        warned,
        ..StatsDelta::default()
    }
}

// =============================================================================
// RUN CREATION
// =============================================================================

#[test]
fn test_begin_run_creates_running_run() {
    let ledger = RunLedger::open_memory().unwrap();
    let manifest = RunManifest::new("binance-backfill")
        .with_run_id("r1")
        .with_config(json!({"symbols": ["BTC", "ETH"], "interval": "5m"}));

    let run = ledger.begin_run(&manifest).unwrap();
    assert_eq!(run.run_id, "r1");
    assert_eq!(run.status, RunStatus::Running);
    assert_eq!(run.source, "binance-backfill");
    assert_eq!(run.config_snapshot_hash, manifest.config_snapshot_hash());
    assert!(run.started_at_ms > 0);
    assert!(run.ended_at_ms.is_none());
    assert_eq!(run.stats.fetched, 0);
}

#[test]
fn test_begin_run_generates_id_when_absent() {
    let ledger = RunLedger::open_memory().unwrap();
    let run = ledger.begin_run(&RunManifest::new("feed")).unwrap();
    assert!(!run.run_id.is_empty());
    assert_eq!(
        ledger.get_run(&run.run_id).unwrap().unwrap().run_id,
        run.run_id
    );
}

#[test]
fn test_duplicate_run_id_is_refused() {
    let ledger = RunLedger::open_memory().unwrap();
    let manifest = RunManifest::new("feed").with_run_id("r1");
    ledger.begin_run(&manifest).unwrap();

    match ledger.begin_run(&manifest) {
        Err(LedgerError::DuplicateRun(id)) => assert_eq!(id, "r1"),
        other => panic!("expected DuplicateRun, got {:?}", other),
    }

    // Still refused after the original run finished.
    ledger.complete_run("r1", None).unwrap();
    assert!(matches!(
        ledger.begin_run(&manifest),
        Err(LedgerError::DuplicateRun(_))
    ));
}

#[test]
fn test_config_snapshot_hash_is_deterministic() {
    let a = RunManifest::new("feed").with_config(json!({"window": 300}));
    let b = RunManifest::new("feed").with_config(json!({"window": 300}));
    let c = RunManifest::new("feed").with_config(json!({"window": 600}));
    assert_eq!(a.config_snapshot_hash(), b.config_snapshot_hash());
    assert_ne!(a.config_snapshot_hash(), c.config_snapshot_hash());
    assert_eq!(a.config_snapshot_hash().len(), 64);
}

// =============================================================================
// STATS ACCUMULATION
// =============================================================================

#[test]
fn test_record_stats_accumulates_across_calls() {
    let ledger = RunLedger::open_memory().unwrap();
    let manifest = RunManifest::new("feed").with_run_id("r1");
    ledger.begin_run(&manifest).unwrap();

    ledger.record_stats("r1", &delta(10, 8, 1, 1)).unwrap();
    ledger.record_stats("r1", &delta(5, 5, 0, 0)).unwrap();

    let run = ledger.get_run("r1").unwrap().unwrap();
    assert_eq!(run.stats.fetched, 15);
    assert_eq!(run.stats.inserted, 13);
    assert_eq!(run.stats.rejected, 1);
    assert_eq!(run.stats.warned, 1);
}

#[test]
fn test_error_messages_merge_by_text() {
    let ledger = RunLedger::open_memory().unwrap();
    ledger
        .begin_run(&RunManifest::new("feed").with_run_id("r1"))
        .unwrap();

    let with_errors = StatsDelta {
        rejected: 3,
        errors: vec![
            "corrupt candle: high 1 below low 2".into(),
            "corrupt candle: high 1 below low 2".into(),
            "corrupt candle: negative volume -1".into(),
        ],
        ..StatsDelta::default()
    };
    ledger.record_stats("r1", &with_errors).unwrap();

    let run = ledger.get_run("r1").unwrap().unwrap();
    assert_eq!(run.stats.errors.len(), 2);
    let repeated = run
        .stats
        .errors
        .iter()
        .find(|e| e.message.contains("below low"))
        .unwrap();
    assert_eq!(repeated.count, 2);
}

#[test]
fn test_record_stats_requires_running_run() {
    let ledger = RunLedger::open_memory().unwrap();
    ledger
        .begin_run(&RunManifest::new("feed").with_run_id("r1"))
        .unwrap();
    ledger.complete_run("r1", None).unwrap();

    match ledger.record_stats("r1", &delta(1, 1, 0, 0)) {
        Err(LedgerError::InvalidTransition { from, .. }) => {
            assert_eq!(from, RunStatus::Completed);
        }
        other => panic!("expected InvalidTransition, got {:?}", other),
    }

    assert!(matches!(
        ledger.record_stats("missing", &delta(1, 1, 0, 0)),
        Err(LedgerError::RunNotFound(_))
    ));
}

// =============================================================================
// TERMINAL TRANSITIONS
// =============================================================================

#[test]
fn test_complete_run_finalizes_with_final_delta() {
    let ledger = RunLedger::open_memory().unwrap();
    ledger
        .begin_run(&RunManifest::new("feed").with_run_id("r1"))
        .unwrap();
    ledger.record_stats("r1", &delta(10, 9, 1, 0)).unwrap();

    let run = ledger
        .complete_run("r1", Some(&delta(2, 2, 0, 0)))
        .unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.ended_at_ms.is_some());
    assert_eq!(run.stats.fetched, 12);
    assert_eq!(run.stats.inserted, 11);
}

#[test]
fn test_terminal_transitions_are_one_shot() {
    let ledger = RunLedger::open_memory().unwrap();
    ledger
        .begin_run(&RunManifest::new("feed").with_run_id("r1"))
        .unwrap();
    ledger.complete_run("r1", None).unwrap();

    assert!(matches!(
        ledger.complete_run("r1", None),
        Err(LedgerError::InvalidTransition { .. })
    ));
    assert!(matches!(
        ledger.fail_run("r1", "late failure"),
        Err(LedgerError::InvalidTransition { .. })
    ));
}

#[test]
fn test_fail_run_records_the_error() {
    let ledger = RunLedger::open_memory().unwrap();
    ledger
        .begin_run(&RunManifest::new("feed").with_run_id("r1"))
        .unwrap();

    let run = ledger.fail_run("r1", "store unavailable").unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.stats.errors.len(), 1);
    assert_eq!(run.stats.errors[0].message, "store unavailable");
}

#[test]
fn test_rolled_back_transition_freezes_stats() {
    let ledger = RunLedger::open_memory().unwrap();
    ledger
        .begin_run(&RunManifest::new("feed").with_run_id("r1"))
        .unwrap();
    ledger.record_stats("r1", &delta(10, 10, 0, 0)).unwrap();
    let completed = ledger.complete_run("r1", None).unwrap();

    ledger.mark_rolled_back("r1").unwrap();
    let rolled = ledger.get_run("r1").unwrap().unwrap();
    assert_eq!(rolled.status, RunStatus::RolledBack);
    assert_eq!(rolled.stats, completed.stats);
    assert_eq!(rolled.ended_at_ms, completed.ended_at_ms);
}

#[test]
fn test_mark_rolled_back_requires_terminal_run() {
    let ledger = RunLedger::open_memory().unwrap();
    ledger
        .begin_run(&RunManifest::new("feed").with_run_id("r1"))
        .unwrap();

    assert!(matches!(
        ledger.mark_rolled_back("r1"),
        Err(LedgerError::InvalidTransition {
            from: RunStatus::Running,
            ..
        })
    ));

    ledger.complete_run("r1", None).unwrap();
    ledger.mark_rolled_back("r1").unwrap();
    assert!(matches!(
        ledger.mark_rolled_back("r1"),
        Err(LedgerError::InvalidTransition {
            from: RunStatus::RolledBack,
            ..
        })
    ));
}

// =============================================================================
// QUERIES
// =============================================================================

#[test]
fn test_list_runs_filters_by_status() {
    let ledger = RunLedger::open_memory().unwrap();
    for id in ["r1", "r2", "r3"] {
        ledger
            .begin_run(&RunManifest::new("feed").with_run_id(id))
            .unwrap();
    }
    ledger.complete_run("r1", None).unwrap();
    ledger.fail_run("r2", "boom").unwrap();

    let all = ledger.list_runs(&RunFilter::default()).unwrap();
    assert_eq!(all.len(), 3);

    let completed = ledger
        .list_runs(&RunFilter {
            status: Some(RunStatus::Completed),
            ..RunFilter::default()
        })
        .unwrap();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].run_id, "r1");

    let limited = ledger
        .list_runs(&RunFilter {
            limit: Some(2),
            ..RunFilter::default()
        })
        .unwrap();
    assert_eq!(limited.len(), 2);
}

#[test]
fn test_list_runs_time_filters() {
    let ledger = RunLedger::open_memory().unwrap();
    let run = ledger
        .begin_run(&RunManifest::new("feed").with_run_id("r1"))
        .unwrap();

    let after = ledger
        .list_runs(&RunFilter {
            started_after_ms: Some(run.started_at_ms + 1),
            ..RunFilter::default()
        })
        .unwrap();
    assert!(after.is_empty());

    let around = ledger
        .list_runs(&RunFilter {
            started_after_ms: Some(run.started_at_ms),
            started_before_ms: Some(run.started_at_ms + 1),
            ..RunFilter::default()
        })
        .unwrap();
    assert_eq!(around.len(), 1);
}

#[test]
fn test_find_faulty_runs_applies_thresholds() {
    let ledger = RunLedger::open_memory().unwrap();

    // Clean run: 1 rejection out of 100.
    ledger
        .begin_run(&RunManifest::new("feed").with_run_id("clean"))
        .unwrap();
    ledger.record_stats("clean", &delta(100, 99, 1, 0)).unwrap();
    ledger.complete_run("clean", None).unwrap();

    // Faulty by rejection ratio: 30 out of 100.
    ledger
        .begin_run(&RunManifest::new("feed").with_run_id("rejects"))
        .unwrap();
    ledger
        .record_stats("rejects", &delta(100, 70, 30, 0))
        .unwrap();
    ledger.complete_run("rejects", None).unwrap();

    // Faulty by warning ratio, but still Running: must not be reported.
    ledger
        .begin_run(&RunManifest::new("feed").with_run_id("active"))
        .unwrap();
    ledger
        .record_stats("active", &delta(100, 100, 0, 90))
        .unwrap();

    let faulty = ledger
        .find_faulty_runs(&FaultyRunThresholds {
            max_rejected_ratio: 0.1,
            max_warned_ratio: 0.5,
        })
        .unwrap();
    assert_eq!(faulty.len(), 1);
    assert_eq!(faulty[0].run_id, "rejects");
}

#[test]
fn test_ratios_handle_zero_fetched() {
    let ledger = RunLedger::open_memory().unwrap();
    ledger
        .begin_run(&RunManifest::new("feed").with_run_id("empty"))
        .unwrap();
    let run = ledger.complete_run("empty", None).unwrap();
    assert_eq!(run.stats.rejected_ratio(), 0.0);
    assert_eq!(run.stats.warned_ratio(), 0.0);

    let faulty = ledger
        .find_faulty_runs(&FaultyRunThresholds {
            max_rejected_ratio: 0.0,
            max_warned_ratio: 0.0,
        })
        .unwrap();
    assert!(faulty.is_empty());
}
