//! Background Compaction Sweeper
//!
//! Idle-priority periodic driver for `DedupEngine::sweep`. Compaction is an
//! optimization: the logical view is already correct without it, so the
//! sweeper only has to bound storage growth, never to fix correctness. A
//! sweep failure is logged and retried on the next tick.

use crate::dedup::{DedupEngine, SweepOptions};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Configuration for the background sweeper.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Time between sweeps.
    pub interval: Duration,
    /// Sweep options applied on every tick (`dry_run` is forced off).
    pub options: SweepOptions,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            options: SweepOptions::default(),
        }
    }
}

/// Handle to a running sweeper task.
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop the sweeper and wait for the in-flight sweep, if any, to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

/// Spawn the sweeper on the current tokio runtime.
pub fn spawn_sweeper(engine: DedupEngine, config: SweeperConfig) -> SweeperHandle {
    let (tx, mut rx) = watch::channel(false);

    let task = tokio::spawn(async move {
        let mut options = config.options.clone();
        options.dry_run = false;

        let mut ticker = tokio::time::interval(config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so a fresh process does
        // not sweep before any data exists.
        ticker.tick().await;

        info!(interval_secs = config.interval.as_secs(), "Compaction sweeper started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let engine = engine.clone();
                    let tick_options = options.clone();
                    let result = tokio::task::spawn_blocking(move || {
                        engine.sweep(&tick_options)
                    })
                    .await;
                    match result {
                        Ok(Ok(report)) => {
                            if report.versions_purged == 0 {
                                debug!(keys = report.keys_examined, "Sweep tick: nothing to compact");
                            }
                        }
                        Ok(Err(e)) => warn!(error = %e, "Sweep tick failed"),
                        Err(e) => warn!(error = %e, "Sweep task panicked"),
                    }
                }
                changed = rx.changed() => {
                    if changed.is_err() || *rx.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Compaction sweeper stopped");
    });

    SweeperHandle { shutdown: tx, task }
}
