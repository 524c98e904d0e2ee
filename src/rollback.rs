//! Rollback Manager
//!
//! Deactivates every candle version a run contributed, without deleting
//! anything: rollback flips the `superseded` tombstone and transitions the
//! run to RolledBack in the ledger. Physical removal of tombstoned rows is
//! deferred to the background compactor, keeping an operator-triggered
//! rollback off the slow bulk-delete path.
//!
//! Rollback only ever touches versions carrying the rolled-back `run_id`;
//! versions from other runs, including concurrently running ones, are
//! never observed or modified.

use crate::candle::LogicalKey;
use crate::dedup;
use crate::run_ledger::{LedgerError, RunLedger, RunStatus};
use crate::store::{CandleStore, KeyRange, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::info;

// =============================================================================
// ERRORS
// =============================================================================

/// Rollback precondition and execution errors. Precondition failures refuse
/// the operation with no partial effect.
#[derive(Debug)]
pub enum RollbackError {
    RunNotFound(String),
    /// The run is still Pending/Running.
    RunActive(String),
    AlreadyRolledBack(String),
    Ledger(LedgerError),
    Store(StoreError),
}

impl fmt::Display for RollbackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RunNotFound(id) => write!(f, "run not found: {}", id),
            Self::RunActive(id) => write!(f, "run still active, cannot roll back: {}", id),
            Self::AlreadyRolledBack(id) => write!(f, "run already rolled back: {}", id),
            Self::Ledger(e) => write!(f, "ledger error: {}", e),
            Self::Store(e) => write!(f, "store error: {}", e),
        }
    }
}

impl std::error::Error for RollbackError {}

impl From<LedgerError> for RollbackError {
    fn from(e: LedgerError) -> Self {
        Self::Ledger(e)
    }
}

impl From<StoreError> for RollbackError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

// =============================================================================
// REPORT
// =============================================================================

/// Observable outcome of a rollback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackReport {
    pub run_id: String,
    /// Versions tombstoned by this rollback.
    pub versions_superseded: u64,
    /// Logical keys whose view changed: keys where the rolled-back run
    /// held the winning version.
    pub views_changed: u64,
}

// =============================================================================
// MANAGER
// =============================================================================

/// Coordinates tombstoning with the ledger's run state machine.
pub struct RollbackManager {
    ledger: Arc<RunLedger>,
    store: Arc<dyn CandleStore>,
}

impl RollbackManager {
    pub fn new(ledger: Arc<RunLedger>, store: Arc<dyn CandleStore>) -> Self {
        Self { ledger, store }
    }

    /// Roll back one run: tombstone its versions, then transition the run.
    ///
    /// The ledger transition is the authoritative gate against concurrent
    /// double-rollback: tombstoning is idempotent, and the loser of a
    /// transition race reports `AlreadyRolledBack`.
    pub fn rollback(&self, run_id: &str) -> Result<RollbackReport, RollbackError> {
        let run = self
            .ledger
            .get_run(run_id)?
            .ok_or_else(|| RollbackError::RunNotFound(run_id.to_string()))?;
        match run.status {
            RunStatus::Pending | RunStatus::Running => {
                return Err(RollbackError::RunActive(run_id.to_string()));
            }
            RunStatus::RolledBack => {
                return Err(RollbackError::AlreadyRolledBack(run_id.to_string()));
            }
            RunStatus::Completed | RunStatus::Failed => {}
        }

        // Count the keys this rollback will change BEFORE tombstoning: a
        // key's view changes iff the run currently holds its winner.
        let run_rows = self.store.scan_run(run_id)?;
        let affected_keys: BTreeSet<LogicalKey> =
            run_rows.iter().map(|v| v.key.clone()).collect();
        let mut views_changed = 0u64;
        for key in &affected_keys {
            let versions = self.store.scan_range(&KeyRange::single(key), false)?;
            if let Some(winner) = dedup::resolve(&versions) {
                if winner.run_id == run_id {
                    views_changed += 1;
                }
            }
        }

        let versions_superseded = self.store.mark_superseded(run_id)?;

        match self.ledger.mark_rolled_back(run_id) {
            Ok(()) => {}
            Err(LedgerError::InvalidTransition { .. }) => {
                // Lost a transition race; the run is rolled back either way.
                return Err(RollbackError::AlreadyRolledBack(run_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            run_id = %run_id,
            versions = versions_superseded,
            views_changed,
            "Run rolled back"
        );

        Ok(RollbackReport {
            run_id: run_id.to_string(),
            versions_superseded,
            views_changed,
        })
    }
}
