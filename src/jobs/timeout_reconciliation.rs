//! Timeout Reconciliation Job
//!
//! Periodically sweeps pending transactions that are past their deadline and
//! times them out, independent of the cleanup queue. Covers cleanup jobs that
//! were lost, e.g. when the process restarted with jobs held in memory.
//! Supports graceful shutdown via SIGTERM/SIGINT signals.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{error, info, warn};

use super::cleanup_job_id;
use super::cleanup_worker::{expire_if_pending, ExpireOutcome};
use crate::services::polling_scheduler::{PollingScheduler, QueueName};
use crate::services::transaction_store::{StoreError, TransactionStore};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileStats {
    pub candidates: usize,
    pub timed_out: usize,
    pub already_final: usize,
    pub errors: usize,
}

/// Time out every pending transaction whose deadline is at or before `now`
pub async fn run_reconciliation_cycle(
    store: &dyn TransactionStore,
    scheduler: &dyn PollingScheduler,
    now: DateTime<Utc>,
    batch_size: u64,
    io_timeout: Duration,
) -> Result<ReconcileStats, StoreError> {
    let candidates = store.list_timed_out_candidates(now, batch_size).await?;
    let mut stats = ReconcileStats {
        candidates: candidates.len(),
        ..Default::default()
    };

    for tx in candidates {
        match expire_if_pending(store, scheduler, &tx.tx_id, io_timeout).await {
            Ok(ExpireOutcome::TimedOut) => {
                stats.timed_out += 1;
                if let Err(e) = scheduler
                    .cancel(QueueName::Cleanup, &cleanup_job_id(&tx.tx_id))
                    .await
                {
                    warn!(tx_id = %tx.tx_id, error = %e, "Failed to cancel cleanup job");
                }
            }
            Ok(_) => stats.already_final += 1,
            Err(e) => {
                stats.errors += 1;
                warn!(tx_id = %tx.tx_id, error = %e, "Failed to reconcile expired transaction");
            }
        }
    }

    Ok(stats)
}

/// Start the timeout reconciliation job
///
/// Spawns a background task that runs a reconciliation cycle every
/// `reconcile_interval` until ctrl-c or until `shutdown` turns true.
pub async fn start_timeout_reconciliation_job(
    store: Arc<dyn TransactionStore>,
    scheduler: Arc<dyn PollingScheduler>,
    reconcile_interval: Duration,
    batch_size: u64,
    io_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        info!(
            interval_secs = reconcile_interval.as_secs(),
            batch_size = batch_size,
            "Timeout reconciliation job started"
        );

        let mut interval = interval(reconcile_interval);

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received, stopping timeout reconciliation job");
                    break;
                }
                _ = shutdown.changed() => {
                    info!("Pipeline shutting down, stopping timeout reconciliation job");
                    break;
                }
                _ = interval.tick() => {
                    match run_reconciliation_cycle(
                        store.as_ref(),
                        scheduler.as_ref(),
                        Utc::now(),
                        batch_size,
                        io_timeout,
                    )
                    .await
                    {
                        Ok(stats) if stats.candidates > 0 => {
                            info!(
                                candidates = stats.candidates,
                                timed_out = stats.timed_out,
                                already_final = stats.already_final,
                                errors = stats.errors,
                                "Timeout reconciliation cycle complete"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!(error = %e, "Timeout reconciliation cycle failed");
                        }
                    }
                }
            }
        }

        info!("Timeout reconciliation job stopped");
    });
}
