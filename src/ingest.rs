//! Ingestion Entrypoint
//!
//! `ingest_batch` is the single write path for upstream fetch clients: it
//! validates every candle against the active policy, tags accepted rows
//! with the run and its quality score, collapses duplicate keys within the
//! batch, appends in one transaction, and folds the outcome counts into the
//! run's ledger stats.
//!
//! Per-candle failures are never raised to the caller: a rejected candle
//! is a counted outcome, not an error. Errors from this module are run- or
//! store-level only.

use crate::candle::{wall_clock_nanos, CandleVersion, LogicalKey, RawCandle, SourceTier};
use crate::run_ledger::{LedgerError, RunLedger, RunStatus, StatsDelta};
use crate::store::{CandleStore, StoreError};
use crate::validation::{validate, ValidationOutcome, ValidationPolicy};
use serde::{Deserialize, Serialize};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

// =============================================================================
// ERRORS
// =============================================================================

/// Run-level ingestion errors.
#[derive(Debug)]
pub enum IngestError {
    /// Writes are only accepted for a Running run.
    RunNotRunning { run_id: String, status: RunStatus },
    Ledger(LedgerError),
    Store(StoreError),
}

impl fmt::Display for IngestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RunNotRunning { run_id, status } => {
                write!(f, "run {} is {}, not running", run_id, status)
            }
            Self::Ledger(e) => write!(f, "ledger error: {}", e),
            Self::Store(e) => write!(f, "store error: {}", e),
        }
    }
}

impl std::error::Error for IngestError {}

impl From<LedgerError> for IngestError {
    fn from(e: LedgerError) -> Self {
        Self::Ledger(e)
    }
}

impl From<StoreError> for IngestError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

// =============================================================================
// BATCH RESULT
// =============================================================================

/// Per-batch outcome counts, mirrored into the run's ledger stats.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    pub fetched: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub warned: u64,
    /// Duplicate logical keys collapsed within this batch.
    pub deduplicated: u64,
}

// =============================================================================
// PIPELINE
// =============================================================================

/// Validator + ledger + store glued into the write path.
pub struct IngestPipeline {
    ledger: Arc<RunLedger>,
    store: Arc<dyn CandleStore>,
    policy: ValidationPolicy,
}

impl IngestPipeline {
    pub fn new(
        ledger: Arc<RunLedger>,
        store: Arc<dyn CandleStore>,
        policy: ValidationPolicy,
    ) -> Self {
        Self {
            ledger,
            store,
            policy,
        }
    }

    pub fn policy(&self) -> ValidationPolicy {
        self.policy
    }

    /// Ingest one batch for a Running run, with the batch's declared source
    /// tier.
    pub fn ingest_batch(
        &self,
        run_id: &str,
        candles: &[RawCandle],
        tier: SourceTier,
    ) -> Result<BatchResult, IngestError> {
        let run = self
            .ledger
            .get_run(run_id)?
            .ok_or_else(|| IngestError::Ledger(LedgerError::RunNotFound(run_id.to_string())))?;
        if run.status != RunStatus::Running {
            return Err(IngestError::RunNotRunning {
                run_id: run_id.to_string(),
                status: run.status,
            });
        }

        let mut result = BatchResult {
            fetched: candles.len() as u64,
            ..BatchResult::default()
        };
        let mut errors: Vec<String> = Vec::new();
        let ingested_at_ns = wall_clock_nanos();

        // Collapse duplicate keys within the batch, keeping the version
        // that would win resolution anyway.
        let mut kept: BTreeMap<LogicalKey, CandleVersion> = BTreeMap::new();

        for raw in candles {
            let score = match validate(raw, tier, self.policy) {
                ValidationOutcome::Rejected { reason } => {
                    result.rejected += 1;
                    debug!(key = %raw.key(), reason = %reason, "Candle rejected");
                    errors.push(reason.to_string());
                    continue;
                }
                ValidationOutcome::Warned { score, defects } => {
                    result.warned += 1;
                    debug!(
                        key = %raw.key(),
                        score,
                        defects = defects.len(),
                        "Candle accepted with quality warnings"
                    );
                    score
                }
                ValidationOutcome::Accepted { score } => {
                    result.accepted += 1;
                    score
                }
            };

            let version = CandleVersion::from_raw(raw, score, tier, run_id, ingested_at_ns);
            match kept.entry(version.key.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(version);
                }
                Entry::Occupied(mut slot) => {
                    result.deduplicated += 1;
                    if version.resolution_key() > slot.get().resolution_key() {
                        slot.insert(version);
                    }
                }
            }
        }

        let versions: Vec<CandleVersion> = kept.into_values().collect();
        let inserted = self.store.append_versions(&versions)?;

        self.ledger.record_stats(
            run_id,
            &StatsDelta {
                fetched: result.fetched,
                inserted,
                rejected: result.rejected,
                warned: result.warned,
                deduplicated: result.deduplicated,
                errors,
            },
        )?;

        Ok(result)
    }
}
