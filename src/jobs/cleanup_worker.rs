//! Cleanup Worker
//!
//! Fires once per transaction at its deadline. If the poller has not
//! finalized the record by then, the record is marked `timeout` and the
//! poll job is cancelled. Usually the poller got there first and this is a no-op.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::{poll_job_id, store_call, TransactionJobPayload};
use crate::models::transaction::{StatusUpdate, TransactionStatus};
use crate::services::polling_scheduler::{
    HandlerError, Job, JobHandler, JobOutcome, PollingScheduler, QueueName,
};
use crate::services::transaction_store::{StoreError, TransactionStore};

/// Error message stored on timed out records
pub const POLLING_TIMED_OUT: &str = "polling timed out";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpireOutcome {
    TimedOut,
    AlreadyFinal(TransactionStatus),
    Missing,
}

/// Mark `tx_id` as timed out if it is still pending, then cancel its poll job
pub async fn expire_if_pending(
    store: &dyn TransactionStore,
    scheduler: &dyn PollingScheduler,
    tx_id: &str,
    io_timeout: Duration,
) -> Result<ExpireOutcome, StoreError> {
    let record = match store_call(io_timeout, store.get(tx_id)).await {
        Ok(record) => record,
        Err(StoreError::NotFound(_)) => return Ok(ExpireOutcome::Missing),
        Err(e) => return Err(e),
    };

    if record.status.is_terminal() {
        return Ok(ExpireOutcome::AlreadyFinal(record.status));
    }

    let update = StatusUpdate {
        error_message: Some(POLLING_TIMED_OUT.to_string()),
        ..Default::default()
    };

    match store_call(
        io_timeout,
        store.update_status(tx_id, TransactionStatus::Timeout, update),
    )
    .await
    {
        Ok(tx) => {
            info!(
                tx_id = %tx_id,
                retry_count = tx.retry_count,
                timeout_at = %tx.timeout_at,
                "Transaction timed out waiting for confirmation"
            );
        }
        Err(StoreError::AlreadyFinalized { status, .. }) => {
            debug!(tx_id = %tx_id, status = %status, "Finalized by poller just before timeout");
            return Ok(ExpireOutcome::AlreadyFinal(status));
        }
        Err(StoreError::NotFound(_)) => return Ok(ExpireOutcome::Missing),
        Err(e) => return Err(e),
    }

    if let Err(e) = scheduler.cancel(QueueName::Poll, &poll_job_id(tx_id)).await {
        warn!(tx_id = %tx_id, error = %e, "Failed to cancel poll job");
    }

    Ok(ExpireOutcome::TimedOut)
}

pub struct CleanupWorker {
    store: Arc<dyn TransactionStore>,
    scheduler: Arc<dyn PollingScheduler>,
    io_timeout: Duration,
}

impl CleanupWorker {
    pub fn new(
        store: Arc<dyn TransactionStore>,
        scheduler: Arc<dyn PollingScheduler>,
        io_timeout: Duration,
    ) -> Self {
        Self {
            store,
            scheduler,
            io_timeout,
        }
    }
}

#[async_trait]
impl JobHandler for CleanupWorker {
    async fn handle(&self, job: &Job) -> Result<JobOutcome, HandlerError> {
        let payload: TransactionJobPayload = match job.payload_as() {
            Ok(payload) => payload,
            Err(e) => {
                error!(job_id = %job.job_id, error = %e, "Dropping cleanup job with bad payload");
                return Ok(JobOutcome::Done);
            }
        };

        match expire_if_pending(
            self.store.as_ref(),
            self.scheduler.as_ref(),
            &payload.tx_id,
            self.io_timeout,
        )
        .await
        {
            Ok(ExpireOutcome::Missing) => {
                warn!(tx_id = %payload.tx_id, "Cleanup job for unknown transaction");
                Ok(JobOutcome::Done)
            }
            Ok(_) => Ok(JobOutcome::Done),
            // Store unreachable: let the scheduler try again
            Err(e) => Err(e.into()),
        }
    }
}
