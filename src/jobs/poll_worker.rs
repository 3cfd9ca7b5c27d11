//! Poll Worker
//!
//! Handles poll jobs: asks the indexer for the transaction's on-chain status
//! and finalizes the record once the chain reports success or abort.
//! Anything short of that (not indexed yet, still in mempool, indexer down)
//! asks the scheduler for another attempt.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::{cleanup_job_id, store_call, TransactionJobPayload};
use crate::models::settlement::SettlementEvent;
use crate::models::transaction::{StatusUpdate, Transaction, TransactionStatus};
use crate::services::finality_client::{ChainStatus, FinalityClient};
use crate::services::notification_sink::NotificationSink;
use crate::services::polling_scheduler::{
    HandlerError, Job, JobHandler, JobOutcome, PollingScheduler, QueueName,
};
use crate::services::transaction_store::{StoreError, TransactionStore};

/// Result of a single poll attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// This attempt moved the record to a terminal status
    Finalized(TransactionStatus),
    /// Someone else finalized it first
    AlreadyFinal(TransactionStatus),
    StillPending,
    /// No such record; nothing to poll
    Missing,
}

impl PollOutcome {
    pub fn job_outcome(&self) -> JobOutcome {
        match self {
            PollOutcome::StillPending => JobOutcome::Retry,
            _ => JobOutcome::Done,
        }
    }
}

pub struct PollWorker {
    store: Arc<dyn TransactionStore>,
    finality: Arc<dyn FinalityClient>,
    sink: Arc<dyn NotificationSink>,
    scheduler: Arc<dyn PollingScheduler>,
    io_timeout: Duration,
    /// Transactions whose terminal write timed out or errored, so may have landed unseen
    unsettled: Mutex<HashSet<String>>,
}

impl PollWorker {
    pub fn new(
        store: Arc<dyn TransactionStore>,
        finality: Arc<dyn FinalityClient>,
        sink: Arc<dyn NotificationSink>,
        scheduler: Arc<dyn PollingScheduler>,
        io_timeout: Duration,
    ) -> Self {
        Self {
            store,
            finality,
            sink,
            scheduler,
            io_timeout,
            unsettled: Mutex::new(HashSet::new()),
        }
    }

    /// Run one poll attempt for `tx_id`
    pub async fn poll_once(&self, tx_id: &str, attempt: u32) -> PollOutcome {
        let record = match store_call(self.io_timeout, self.store.get(tx_id)).await {
            Ok(record) => record,
            Err(StoreError::NotFound(_)) => {
                warn!(tx_id = %tx_id, "Poll job for unknown transaction, dropping");
                return PollOutcome::Missing;
            }
            Err(e) => {
                warn!(tx_id = %tx_id, error = %e, "Failed to load transaction, will retry");
                return PollOutcome::StillPending;
            }
        };

        if self.claim_unsettled(&record) {
            info!(tx_id = %tx_id, status = %record.status, "Earlier finalize write landed, completing it");
            return self.complete_finalized(record).await;
        }
        if record.status.is_terminal() {
            debug!(tx_id = %tx_id, status = %record.status, "Transaction already final, stop polling");
            return PollOutcome::AlreadyFinal(record.status);
        }

        if let Err(e) = store_call(self.io_timeout, self.store.increment_retry(tx_id)).await {
            warn!(tx_id = %tx_id, error = %e, "Failed to record poll attempt");
        }

        let chain_status = match tokio::time::timeout(self.io_timeout, self.finality.query(tx_id)).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                warn!(tx_id = %tx_id, attempt = attempt, error = %e, "Indexer query failed, will retry");
                return PollOutcome::StillPending;
            }
            Err(_) => {
                warn!(
                    tx_id = %tx_id,
                    attempt = attempt,
                    timeout_secs = self.io_timeout.as_secs(),
                    "Indexer query timed out, will retry"
                );
                return PollOutcome::StillPending;
            }
        };

        match chain_status {
            ChainStatus::Success { block_height } => {
                let update = StatusUpdate {
                    block_height,
                    ..Default::default()
                };
                self.finalize(tx_id, TransactionStatus::Success, update).await
            }
            ChainStatus::Aborted {
                status,
                block_height,
            } => {
                let update = StatusUpdate {
                    block_height,
                    error_message: Some(format!("transaction failed on chain: {}", status)),
                    ..Default::default()
                };
                self.finalize(tx_id, TransactionStatus::Failed, update).await
            }
            ChainStatus::NotFound => {
                debug!(tx_id = %tx_id, attempt = attempt, "Transaction not yet indexed");
                PollOutcome::StillPending
            }
            ChainStatus::Pending { status } => {
                debug!(tx_id = %tx_id, attempt = attempt, chain_status = %status, "Transaction not final yet");
                PollOutcome::StillPending
            }
        }
    }

    async fn finalize(
        &self,
        tx_id: &str,
        status: TransactionStatus,
        update: StatusUpdate,
    ) -> PollOutcome {
        match store_call(
            self.io_timeout,
            self.store.update_status(tx_id, status, update),
        )
        .await
        {
            Ok(tx) => {
                self.unsettled.lock().remove(tx_id);
                self.complete_finalized(tx).await
            }
            Err(StoreError::AlreadyFinalized { status: current, .. }) => {
                // Only the poller writes success or failed: an earlier write of ours landed late
                if current == status && self.unsettled.lock().contains(tx_id) {
                    return self.settle_unknown_write(tx_id).await;
                }
                debug!(tx_id = %tx_id, status = %current, "Lost finalize race, nothing to do");
                PollOutcome::AlreadyFinal(current)
            }
            Err(StoreError::NotFound(_)) => PollOutcome::Missing,
            Err(e) => {
                warn!(tx_id = %tx_id, error = %e, "Finalize write outcome unknown, checking record");
                self.unsettled.lock().insert(tx_id.to_string());
                self.settle_unknown_write(tx_id).await
            }
        }
    }

    /// Re-read a record whose terminal write may or may not have been applied
    async fn settle_unknown_write(&self, tx_id: &str) -> PollOutcome {
        match store_call(self.io_timeout, self.store.get(tx_id)).await {
            Ok(record) if self.claim_unsettled(&record) => self.complete_finalized(record).await,
            Ok(record) if record.status.is_terminal() => PollOutcome::AlreadyFinal(record.status),
            // Not applied yet; the next attempt checks again
            Ok(_) => PollOutcome::StillPending,
            Err(StoreError::NotFound(_)) => {
                self.unsettled.lock().remove(tx_id);
                PollOutcome::Missing
            }
            Err(e) => {
                warn!(tx_id = %tx_id, error = %e, "Failed to re-read transaction, will retry");
                PollOutcome::StillPending
            }
        }
    }

    /// True if `record` carries a terminal write this worker made but never confirmed.
    /// Clears the marker once the record is terminal.
    fn claim_unsettled(&self, record: &Transaction) -> bool {
        if !record.status.is_terminal() {
            return false;
        }
        let written_by_poller = matches!(
            record.status,
            TransactionStatus::Success | TransactionStatus::Failed
        );
        self.unsettled.lock().remove(&record.tx_id) && written_by_poller
    }

    /// Follow-up for a transition this worker applied: cancel cleanup, then notify on success
    async fn complete_finalized(&self, finalized: Transaction) -> PollOutcome {
        info!(
            tx_id = %finalized.tx_id,
            status = %finalized.status,
            block_height = ?finalized.block_height,
            retry_count = finalized.retry_count,
            "Transaction finalized"
        );

        if let Err(e) = self
            .scheduler
            .cancel(QueueName::Cleanup, &cleanup_job_id(&finalized.tx_id))
            .await
        {
            warn!(tx_id = %finalized.tx_id, error = %e, "Failed to cancel cleanup job");
        }

        if finalized.status == TransactionStatus::Success {
            self.notify(&finalized).await;
        }

        PollOutcome::Finalized(finalized.status)
    }

    async fn notify(&self, tx: &Transaction) {
        let event = SettlementEvent::from(tx);
        if let Err(e) = self.sink.publish_settlement(event).await {
            // The transition stands; subscribers can reconcile from the record
            error!(tx_id = %tx.tx_id, error = %e, "Failed to publish settlement event");
        }
    }
}

#[async_trait]
impl JobHandler for PollWorker {
    async fn handle(&self, job: &Job) -> Result<JobOutcome, HandlerError> {
        let payload: TransactionJobPayload = match job.payload_as() {
            Ok(payload) => payload,
            Err(e) => {
                error!(job_id = %job.job_id, error = %e, "Dropping poll job with bad payload");
                return Ok(JobOutcome::Done);
            }
        };

        let outcome = self.poll_once(&payload.tx_id, job.attempts_made + 1).await;
        Ok(outcome.job_outcome())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::transaction::{NewTransaction, TransactionType};
    use crate::services::finality_client::FinalityError;
    use crate::services::notification_sink::NotificationError;
    use crate::jobs::testing::FaultyStore;
    use crate::services::polling_scheduler::{InMemoryScheduler, JobState, QueueConfig};
    use std::collections::VecDeque;

    /// Replays scripted indexer answers, then keeps answering NotFound
    struct ScriptedFinality {
        answers: Mutex<VecDeque<Result<ChainStatus, FinalityError>>>,
    }

    impl ScriptedFinality {
        fn new(answers: Vec<Result<ChainStatus, FinalityError>>) -> Arc<Self> {
            Arc::new(Self {
                answers: Mutex::new(answers.into()),
            })
        }
    }

    #[async_trait]
    impl FinalityClient for ScriptedFinality {
        async fn query(&self, _tx_id: &str) -> Result<ChainStatus, FinalityError> {
            self.answers
                .lock()
                .pop_front()
                .unwrap_or(Ok(ChainStatus::NotFound))
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<SettlementEvent>>,
        fail: bool,
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn publish_settlement(&self, event: SettlementEvent) -> Result<(), NotificationError> {
            self.events.lock().push(event);
            if self.fail {
                return Err(NotificationError::Delivery("broker down".to_string()));
            }
            Ok(())
        }
    }

    /// Indexer that never answers
    struct HangingFinality;

    #[async_trait]
    impl FinalityClient for HangingFinality {
        async fn query(&self, _tx_id: &str) -> Result<ChainStatus, FinalityError> {
            std::future::pending().await
        }
    }

    struct Fixture {
        store: Arc<FaultyStore>,
        scheduler: Arc<InMemoryScheduler>,
        sink: Arc<RecordingSink>,
        worker: PollWorker,
    }

    async fn fixture(answers: Vec<Result<ChainStatus, FinalityError>>, sink: RecordingSink) -> Fixture {
        fixture_with(FaultyStore::new(), ScriptedFinality::new(answers), sink).await
    }

    async fn fixture_with(
        store: FaultyStore,
        finality: Arc<dyn FinalityClient>,
        sink: RecordingSink,
    ) -> Fixture {
        let store = Arc::new(store);
        let scheduler = Arc::new(InMemoryScheduler::new(
            QueueConfig::poll_default(),
            QueueConfig::cleanup_default(),
        ));
        let sink = Arc::new(sink);
        let worker = PollWorker::new(
            store.clone(),
            finality,
            sink.clone(),
            scheduler.clone(),
            Duration::from_secs(10),
        );

        store
            .create(NewTransaction {
                tx_id: "0xaa".to_string(),
                user_id: "user-1".to_string(),
                user_address: "SP2J6ZY48GV1EZ5V2V5RB9MP66SW86PYKKNRV9EJ7".to_string(),
                tx_type: TransactionType::Deposit,
                stx_amount: Some(10_000_000),
                plmd_amount: Some(9_950_000),
                nav: Some(1_000_000),
                fee: Some(50_000),
                net_amount: Some(9_950_000),
            })
            .await
            .unwrap();
        scheduler
            .schedule(
                QueueName::Cleanup,
                &cleanup_job_id("0xaa"),
                serde_json::json!({"txId": "0xaa"}),
                Duration::from_secs(300),
            )
            .await
            .unwrap();

        Fixture {
            store,
            scheduler,
            sink,
            worker,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_finalizes_cancels_cleanup_and_notifies() {
        let f = fixture(
            vec![Ok(ChainStatus::Success { block_height: Some(170_001) })],
            RecordingSink::default(),
        )
        .await;

        let outcome = f.worker.poll_once("0xaa", 1).await;
        assert_eq!(outcome, PollOutcome::Finalized(TransactionStatus::Success));
        assert_eq!(outcome.job_outcome(), JobOutcome::Done);

        let tx = f.store.get("0xaa").await.unwrap();
        assert_eq!(tx.status, TransactionStatus::Success);
        assert_eq!(tx.block_height, Some(170_001));
        assert_eq!(tx.retry_count, 1);
        assert!(tx.confirmed_at.is_some());

        assert_eq!(f.scheduler.job_state(QueueName::Cleanup, "cleanup:0xaa"), None);

        let events = f.sink.events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].tx_id, "0xaa");
        assert_eq!(events[0].block_height, Some(170_001));
        assert_eq!(events[0].gross_amount, Some(10_000_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_marks_failed_without_notification() {
        let f = fixture(
            vec![Ok(ChainStatus::Aborted {
                status: "abort_by_response".to_string(),
                block_height: Some(9),
            })],
            RecordingSink::default(),
        )
        .await;

        assert_eq!(
            f.worker.poll_once("0xaa", 1).await,
            PollOutcome::Finalized(TransactionStatus::Failed)
        );

        let tx = f.store.get("0xaa").await.unwrap();
        assert_eq!(tx.status, TransactionStatus::Failed);
        assert!(tx.error_message.unwrap().contains("abort_by_response"));
        assert!(f.sink.events.lock().is_empty());
        assert_eq!(f.scheduler.job_state(QueueName::Cleanup, "cleanup:0xaa"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_answers_retry_and_count_attempts() {
        let f = fixture(
            vec![
                Err(FinalityError::Http("connection refused".to_string())),
                Ok(ChainStatus::NotFound),
                Ok(ChainStatus::Pending { status: "pending".to_string() }),
            ],
            RecordingSink::default(),
        )
        .await;

        for attempt in 1..=3 {
            let outcome = f.worker.poll_once("0xaa", attempt).await;
            assert_eq!(outcome, PollOutcome::StillPending);
            assert_eq!(outcome.job_outcome(), JobOutcome::Retry);
        }

        let tx = f.store.get("0xaa").await.unwrap();
        assert_eq!(tx.status, TransactionStatus::Pending);
        assert_eq!(tx.retry_count, 3);
        assert!(tx.last_polled_at.is_some());
        assert_eq!(
            f.scheduler.job_state(QueueName::Cleanup, "cleanup:0xaa"),
            Some(JobState::Delayed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_race_does_not_notify() {
        let f = fixture(
            vec![Ok(ChainStatus::Success { block_height: Some(1) })],
            RecordingSink::default(),
        )
        .await;
        f.store
            .update_status("0xaa", TransactionStatus::Timeout, StatusUpdate::default())
            .await
            .unwrap();

        assert_eq!(
            f.worker.poll_once("0xaa", 7).await,
            PollOutcome::AlreadyFinal(TransactionStatus::Timeout)
        );
        assert!(f.sink.events.lock().is_empty());
        assert_eq!(f.store.get("0xaa").await.unwrap().status, TransactionStatus::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_failure_keeps_success() {
        let f = fixture(
            vec![Ok(ChainStatus::Success { block_height: Some(5) })],
            RecordingSink {
                fail: true,
                ..Default::default()
            },
        )
        .await;

        assert_eq!(
            f.worker.poll_once("0xaa", 1).await,
            PollOutcome::Finalized(TransactionStatus::Success)
        );
        assert_eq!(f.store.get("0xaa").await.unwrap().status, TransactionStatus::Success);
        assert_eq!(f.sink.events.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_transaction_drops_job() {
        let f = fixture(vec![], RecordingSink::default()).await;
        assert_eq!(f.worker.poll_once("0xmissing", 1).await, PollOutcome::Missing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_payload_is_dropped() {
        let f = fixture(vec![], RecordingSink::default()).await;
        let job = Job::new(QueueName::Poll, "0xaa", serde_json::json!({"unexpected": true}));
        assert_eq!(f.worker.handle(&job).await.unwrap(), JobOutcome::Done);
        assert_eq!(f.store.get("0xaa").await.unwrap().retry_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_indexer_timeout_retries_and_counts_attempt() {
        let f = fixture_with(FaultyStore::new(), Arc::new(HangingFinality), RecordingSink::default()).await;

        let outcome = f.worker.poll_once("0xaa", 1).await;
        assert_eq!(outcome, PollOutcome::StillPending);
        assert_eq!(outcome.job_outcome(), JobOutcome::Retry);

        let tx = f.store.get("0xaa").await.unwrap();
        assert_eq!(tx.status, TransactionStatus::Pending);
        assert_eq!(tx.retry_count, 1);
        assert!(f.sink.events.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_committed_behind_slow_write_still_notifies_once() {
        let store = FaultyStore {
            stall_after_write: Duration::from_secs(11),
            ..FaultyStore::new()
        };
        let f = fixture_with(
            store,
            ScriptedFinality::new(vec![Ok(ChainStatus::Success { block_height: Some(42) })]),
            RecordingSink::default(),
        )
        .await;

        // The write lands but its call outlives the I/O timeout
        assert_eq!(
            f.worker.poll_once("0xaa", 1).await,
            PollOutcome::Finalized(TransactionStatus::Success)
        );
        assert_eq!(f.sink.events.lock().len(), 1);
        assert_eq!(f.scheduler.job_state(QueueName::Cleanup, "cleanup:0xaa"), None);

        assert_eq!(
            f.worker.poll_once("0xaa", 2).await,
            PollOutcome::AlreadyFinal(TransactionStatus::Success)
        );
        assert_eq!(f.sink.events.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfirmed_success_completed_on_next_attempt() {
        let store = FaultyStore {
            stall_after_write: Duration::from_secs(11),
            failing_gets_after_write: 1,
            ..FaultyStore::new()
        };
        let f = fixture_with(
            store,
            ScriptedFinality::new(vec![Ok(ChainStatus::Success { block_height: Some(42) })]),
            RecordingSink::default(),
        )
        .await;

        // Neither the write nor the re-read can be confirmed
        assert_eq!(f.worker.poll_once("0xaa", 1).await, PollOutcome::StillPending);
        assert!(f.sink.events.lock().is_empty());
        assert_eq!(f.store.get("0xaa").await.unwrap().status, TransactionStatus::Success);

        assert_eq!(
            f.worker.poll_once("0xaa", 2).await,
            PollOutcome::Finalized(TransactionStatus::Success)
        );
        assert_eq!(f.sink.events.lock().len(), 1);
        assert_eq!(f.sink.events.lock()[0].block_height, Some(42));
        assert_eq!(f.scheduler.job_state(QueueName::Cleanup, "cleanup:0xaa"), None);

        assert_eq!(
            f.worker.poll_once("0xaa", 3).await,
            PollOutcome::AlreadyFinal(TransactionStatus::Success)
        );
        assert_eq!(f.sink.events.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfirmed_write_overtaken_by_timeout_does_not_notify() {
        let f = fixture(vec![], RecordingSink::default()).await;
        f.worker.unsettled.lock().insert("0xaa".to_string());
        f.store
            .update_status("0xaa", TransactionStatus::Timeout, StatusUpdate::default())
            .await
            .unwrap();

        assert_eq!(
            f.worker.poll_once("0xaa", 2).await,
            PollOutcome::AlreadyFinal(TransactionStatus::Timeout)
        );
        assert!(f.sink.events.lock().is_empty());
        assert!(f.worker.unsettled.lock().is_empty());
    }
}
