mod common;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{deposit, withdrawal, FakeIndexer, RecordingSink};
use parking_lot::Mutex;
use poolmind_settlement::config::PipelineConfig;
use poolmind_settlement::jobs::cleanup_worker::POLLING_TIMED_OUT;
use poolmind_settlement::models::transaction::{
    ListFilter, NewTransaction, StatusUpdate, Transaction, TransactionStatus,
};
use poolmind_settlement::pipeline::SettlementPipeline;
use poolmind_settlement::services::finality_client::ChainStatus;
use poolmind_settlement::services::polling_scheduler::{QueueName, SchedulerError};
use poolmind_settlement::services::transaction_service::SubmitError;
use poolmind_settlement::services::transaction_store::{
    InMemoryTransactionStore, StoreError, TransactionStore,
};
use std::sync::Arc;
use std::time::Duration;

/// Records every terminal write that actually applied
struct AuditedStore {
    inner: InMemoryTransactionStore,
    terminal_writes: Mutex<Vec<(String, TransactionStatus)>>,
}

impl AuditedStore {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryTransactionStore::new(chrono::Duration::minutes(5)),
            terminal_writes: Mutex::new(Vec::new()),
        })
    }

    fn writes_for(&self, tx_id: &str) -> Vec<TransactionStatus> {
        self.terminal_writes
            .lock()
            .iter()
            .filter(|(id, _)| id == tx_id)
            .map(|(_, status)| *status)
            .collect()
    }
}

#[async_trait]
impl TransactionStore for AuditedStore {
    async fn create(&self, data: NewTransaction) -> Result<Transaction, StoreError> {
        self.inner.create(data).await
    }

    async fn get(&self, tx_id: &str) -> Result<Transaction, StoreError> {
        self.inner.get(tx_id).await
    }

    async fn update_status(
        &self,
        tx_id: &str,
        status: TransactionStatus,
        update: StatusUpdate,
    ) -> Result<Transaction, StoreError> {
        let tx = self.inner.update_status(tx_id, status, update).await?;
        self.terminal_writes
            .lock()
            .push((tx_id.to_string(), tx.status));
        Ok(tx)
    }

    async fn increment_retry(&self, tx_id: &str) -> Result<(), StoreError> {
        self.inner.increment_retry(tx_id).await
    }

    async fn list_by_user(
        &self,
        user_id: &str,
        filter: ListFilter,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<Transaction>, StoreError> {
        self.inner.list_by_user(user_id, filter, limit, offset).await
    }

    async fn list_timed_out_candidates(
        &self,
        now: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<Transaction>, StoreError> {
        self.inner.list_timed_out_candidates(now, limit).await
    }

    async fn list_pending(
        &self,
        now: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<Transaction>, StoreError> {
        self.inner.list_pending(now, limit).await
    }
}

struct Harness {
    store: Arc<AuditedStore>,
    indexer: Arc<FakeIndexer>,
    sink: Arc<RecordingSink>,
    pipeline: SettlementPipeline,
}

async fn start_pipeline() -> Harness {
    let store = AuditedStore::new();
    let indexer = Arc::new(FakeIndexer::default());
    let sink = Arc::new(RecordingSink::default());
    let pipeline = SettlementPipeline::new(
        PipelineConfig::default(),
        store.clone(),
        indexer.clone(),
        sink.clone(),
    );
    pipeline.start().await.expect("Failed to start pipeline");

    Harness {
        store,
        indexer,
        sink,
        pipeline,
    }
}

#[tokio::test(start_paused = true)]
async fn test_confirmed_deposit_publishes_once() {
    let h = start_pipeline().await;
    h.indexer.confirm_after("0x01", 2, ChainStatus::Success { block_height: Some(170_500) });

    h.pipeline.service().submit(deposit("0x01", "user-1")).await.unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;

    let tx = h.store.get("0x01").await.unwrap();
    assert_eq!(tx.status, TransactionStatus::Success);
    assert_eq!(tx.block_height, Some(170_500));
    assert_eq!(tx.retry_count, 3);
    assert_eq!(h.indexer.queries(), 3);

    assert_eq!(h.sink.published_for("0x01"), 1);
    assert_eq!(h.store.writes_for("0x01"), vec![TransactionStatus::Success]);

    // Neither job is left behind, and the deadline passing changes nothing
    let scheduler = h.pipeline.scheduler();
    assert_eq!(scheduler.live_jobs(QueueName::Poll), 0);
    assert_eq!(scheduler.live_jobs(QueueName::Cleanup), 0);
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(h.store.writes_for("0x01"), vec![TransactionStatus::Success]);
    assert_eq!(h.sink.published_for("0x01"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_never_indexed_times_out_once() {
    let h = start_pipeline().await;

    h.pipeline.service().submit(deposit("0x02", "user-1")).await.unwrap();
    tokio::time::sleep(Duration::from_secs(400)).await;

    let tx = h.store.get("0x02").await.unwrap();
    assert_eq!(tx.status, TransactionStatus::Timeout);
    assert_eq!(tx.error_message.as_deref(), Some(POLLING_TIMED_OUT));
    assert!(tx.confirmed_at.is_some());
    assert!(tx.retry_count >= 1 && tx.retry_count <= 60);

    assert_eq!(h.store.writes_for("0x02"), vec![TransactionStatus::Timeout]);
    assert_eq!(h.sink.published_for("0x02"), 0);

    let scheduler = h.pipeline.scheduler();
    assert_eq!(scheduler.live_jobs(QueueName::Poll), 0);
    assert_eq!(scheduler.live_jobs(QueueName::Cleanup), 0);
}

#[tokio::test(start_paused = true)]
async fn test_aborted_withdrawal_fails_without_publish() {
    let h = start_pipeline().await;
    h.indexer.confirm_after(
        "0x03",
        0,
        ChainStatus::Aborted {
            status: "abort_by_response".to_string(),
            block_height: Some(9),
        },
    );

    h.pipeline.service().submit(withdrawal("0x03", "user-1")).await.unwrap();
    tokio::time::sleep(Duration::from_secs(400)).await;

    let tx = h.store.get("0x03").await.unwrap();
    assert_eq!(tx.status, TransactionStatus::Failed);
    assert_eq!(tx.retry_count, 1);
    assert_eq!(h.store.writes_for("0x03"), vec![TransactionStatus::Failed]);
    assert_eq!(h.sink.published_for("0x03"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_submit_creates_no_second_job() {
    let h = start_pipeline().await;
    let service = h.pipeline.service();

    service.submit(deposit("0x04", "user-1")).await.unwrap();
    let err = service.submit(deposit("0x04", "user-1")).await.unwrap_err();
    assert_eq!(
        err,
        SubmitError::Store(StoreError::DuplicateTransaction("0x04".to_string()))
    );

    let scheduler = h.pipeline.scheduler();
    assert_eq!(scheduler.live_jobs(QueueName::Poll), 1);
    assert_eq!(scheduler.live_jobs(QueueName::Cleanup), 1);

    // One poll chain means one query per backoff tick
    tokio::time::sleep(Duration::from_secs(12)).await;
    assert_eq!(h.indexer.queries(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_many_transactions_settle_independently() {
    let h = start_pipeline().await;
    let service = h.pipeline.service();

    for i in 0..10 {
        let tx_id = format!("0x1{}", i);
        if i % 2 == 0 {
            h.indexer
                .confirm_after(&tx_id, i, ChainStatus::Success { block_height: Some(i as i64) });
        }
        service.submit(deposit(&tx_id, "user-9")).await.unwrap();
    }
    tokio::time::sleep(Duration::from_secs(400)).await;

    for i in 0..10 {
        let tx_id = format!("0x1{}", i);
        let expected = if i % 2 == 0 {
            TransactionStatus::Success
        } else {
            TransactionStatus::Timeout
        };
        assert_eq!(h.store.get(&tx_id).await.unwrap().status, expected);
        assert_eq!(h.store.writes_for(&tx_id).len(), 1);
        assert_eq!(h.sink.published_for(&tx_id), usize::from(i % 2 == 0));
    }

    let history = service
        .list_for_user("user-9", ListFilter::default(), None, 0)
        .await
        .unwrap();
    assert_eq!(history.len(), 10);
}

#[tokio::test]
async fn test_pipeline_cannot_start_twice() {
    let h = start_pipeline().await;
    assert!(matches!(
        h.pipeline.start().await,
        Err(SchedulerError::AlreadyConsuming(QueueName::Poll))
    ));
    h.pipeline.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_reconciliation() {
    // Every record is overdue as soon as it exists
    let store = Arc::new(InMemoryTransactionStore::new(chrono::Duration::zero()));
    let pipeline = SettlementPipeline::new(
        PipelineConfig::default(),
        store.clone(),
        Arc::new(FakeIndexer::default()),
        Arc::new(RecordingSink::default()),
    );
    pipeline.start_reconciliation().await;
    pipeline.shutdown();
    tokio::time::sleep(Duration::from_secs(1)).await;

    store.create(deposit("0x05", "user-1")).await.unwrap();
    tokio::time::sleep(Duration::from_secs(300)).await;

    assert_eq!(store.get("0x05").await.unwrap().status, TransactionStatus::Pending);
}
