//! Deduplication Engine - Logical View Resolution and Compaction
//!
//! Resolves the many physical versions of a logical key into the single
//! authoritative one, and prunes the losers once a key has gone quiet.
//!
//! # Resolution Order (Total Order)
//!
//! Among non-superseded versions of a key, the winner is the maximum under:
//! 1. **Primary**: `quality_score` (higher wins)
//! 2. **Secondary**: `ingested_at_ns` (later wins)
//! 3. **Tertiary**: `run_id` (lexicographic, last resort)
//!
//! with `version_id` as a final fallback so that byte-identical duplicate
//! writes still resolve to one definite row.
//!
//! # Determinism Contract
//!
//! Resolution for a key is identical regardless of the order its versions
//! were written and regardless of how many times compaction has run.
//! Query-time resolution is the baseline correctness guarantee: it is
//! correct with zero background processing. Compaction only reduces the
//! number of physical rows scanned; it must never change a winner, which
//! holds because it only ever deletes rows that are not the winner.

use crate::candle::{wall_clock_nanos, CandleVersion, LogicalKey, Nanos};
use crate::store::{CandleStore, KeyRange, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Default quiescence window before a key becomes eligible for compaction:
/// one hour.
pub const DEFAULT_QUIESCENCE_NS: Nanos = 3_600 * 1_000_000_000;

// =============================================================================
// PURE RESOLUTION
// =============================================================================

/// Pick the winning version among physical versions of ONE logical key.
///
/// Tombstoned versions never win. Returns `None` when no live version
/// remains (e.g. every contributing run was rolled back).
pub fn resolve(versions: &[CandleVersion]) -> Option<&CandleVersion> {
    versions
        .iter()
        .filter(|v| !v.superseded)
        .max_by(|a, b| {
            a.resolution_key()
                .cmp(&b.resolution_key())
                .then(a.version_id.cmp(&b.version_id))
        })
}

/// Group a key-ordered scan into per-key version sets.
///
/// The map is ordered, so downstream output is deterministic independent of
/// scan backend quirks.
pub fn group_by_key(versions: Vec<CandleVersion>) -> BTreeMap<LogicalKey, Vec<CandleVersion>> {
    let mut grouped: BTreeMap<LogicalKey, Vec<CandleVersion>> = BTreeMap::new();
    for version in versions {
        grouped.entry(version.key.clone()).or_default().push(version);
    }
    grouped
}

// =============================================================================
// SWEEP OPTIONS / REPORT
// =============================================================================

/// Options for a compaction sweep.
#[derive(Debug, Clone)]
pub struct SweepOptions {
    /// Keys to consider. Defaults to the whole store.
    pub range: KeyRange,
    /// A key is eligible only when its newest write (tombstoned or not) is
    /// at least this old.
    pub quiescence_ns: Nanos,
    /// Count without deleting.
    pub dry_run: bool,
    /// Override "now" (tests). Wall clock when `None`.
    pub now_ns: Option<Nanos>,
}

impl Default for SweepOptions {
    fn default() -> Self {
        Self {
            range: KeyRange::all(),
            quiescence_ns: DEFAULT_QUIESCENCE_NS,
            dry_run: false,
            now_ns: None,
        }
    }
}

/// Outcome of one compaction sweep.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompactionReport {
    pub keys_examined: u64,
    pub keys_compacted: u64,
    pub versions_purged: u64,
    pub dry_run: bool,
}

// =============================================================================
// ENGINE
// =============================================================================

/// Query-time resolution plus background compaction over a `CandleStore`.
#[derive(Clone)]
pub struct DedupEngine {
    store: Arc<dyn CandleStore>,
}

impl DedupEngine {
    pub fn new(store: Arc<dyn CandleStore>) -> Self {
        Self { store }
    }

    /// The logical view for every key in the range: one winning version per
    /// key, in key order.
    pub fn logical_view(&self, range: &KeyRange) -> Result<Vec<CandleVersion>, StoreError> {
        let rows = self.store.scan_range(range, false)?;
        let grouped = group_by_key(rows);
        let mut out = Vec::with_capacity(grouped.len());
        for versions in grouped.values() {
            if let Some(winner) = resolve(versions) {
                out.push(winner.clone());
            }
        }
        Ok(out)
    }

    /// The logical view for a single key, or `None` when no live version
    /// exists.
    pub fn logical_view_at(&self, key: &LogicalKey) -> Result<Option<CandleVersion>, StoreError> {
        let rows = self.store.scan_range(&KeyRange::single(key), false)?;
        Ok(resolve(&rows).cloned())
    }

    /// Compact quiescent keys: physically remove every version that is not
    /// the current winner, including tombstoned rows (deferred rollback
    /// delete). Keys written to within the quiescence window are left
    /// untouched so in-flight ingestion never races the sweeper.
    pub fn sweep(&self, options: &SweepOptions) -> Result<CompactionReport, StoreError> {
        let now_ns = options.now_ns.unwrap_or_else(wall_clock_nanos);
        let rows = self.store.scan_range(&options.range, true)?;
        let grouped = group_by_key(rows);

        let mut report = CompactionReport {
            dry_run: options.dry_run,
            ..CompactionReport::default()
        };
        let mut purge_ids: Vec<i64> = Vec::new();

        for (key, versions) in &grouped {
            report.keys_examined += 1;

            let newest_write_ns = versions
                .iter()
                .map(|v| v.ingested_at_ns)
                .max()
                .unwrap_or(now_ns);
            if now_ns - newest_write_ns < options.quiescence_ns {
                continue;
            }

            let winner_id = resolve(versions).map(|w| w.version_id);
            let losers: Vec<i64> = versions
                .iter()
                .filter(|v| Some(v.version_id) != winner_id)
                .map(|v| v.version_id)
                .collect();
            if losers.is_empty() {
                continue;
            }

            debug!(key = %key, losers = losers.len(), "Key eligible for compaction");
            report.keys_compacted += 1;
            report.versions_purged += losers.len() as u64;
            purge_ids.extend(losers);
        }

        if !options.dry_run && !purge_ids.is_empty() {
            self.store.purge_versions(&purge_ids)?;
        }

        if report.versions_purged > 0 {
            info!(
                keys = report.keys_compacted,
                versions = report.versions_purged,
                dry_run = report.dry_run,
                "Compaction sweep finished"
            );
        }
        Ok(report)
    }
}
