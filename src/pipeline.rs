//! Wires the store, scheduler, indexer client and sink into a running pipeline

use std::sync::Arc;
use tracing::info;

use crate::config::PipelineConfig;
use crate::jobs::cleanup_worker::CleanupWorker;
use crate::jobs::poll_worker::PollWorker;
use crate::jobs::timeout_reconciliation::start_timeout_reconciliation_job;
use crate::services::finality_client::FinalityClient;
use crate::services::notification_sink::NotificationSink;
use crate::services::polling_scheduler::{InMemoryScheduler, PollingScheduler, QueueName, SchedulerError};
use crate::services::transaction_service::TransactionService;
use crate::services::transaction_store::TransactionStore;

/// Cleanup jobs are processed one at a time
const CLEANUP_CONCURRENCY: usize = 1;

pub struct SettlementPipeline {
    config: PipelineConfig,
    store: Arc<dyn TransactionStore>,
    scheduler: Arc<InMemoryScheduler>,
    finality: Arc<dyn FinalityClient>,
    sink: Arc<dyn NotificationSink>,
}

impl SettlementPipeline {
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn TransactionStore>,
        finality: Arc<dyn FinalityClient>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        let scheduler = Arc::new(InMemoryScheduler::new(
            config.poll_queue(),
            config.cleanup_queue(),
        ));

        Self {
            config,
            store,
            scheduler,
            finality,
            sink,
        }
    }

    pub fn scheduler(&self) -> Arc<InMemoryScheduler> {
        self.scheduler.clone()
    }

    pub fn store(&self) -> Arc<dyn TransactionStore> {
        self.store.clone()
    }

    /// Submit/query facade sharing this pipeline's store and scheduler
    pub fn service(&self) -> TransactionService {
        TransactionService::new(self.store.clone(), self.scheduler.clone())
    }

    /// Start consuming both queues
    pub async fn start(&self) -> Result<(), SchedulerError> {
        let scheduler: Arc<dyn PollingScheduler> = self.scheduler.clone();

        let poll_worker = Arc::new(PollWorker::new(
            self.store.clone(),
            self.finality.clone(),
            self.sink.clone(),
            scheduler.clone(),
            self.config.io_timeout,
        ));
        self.scheduler
            .consume(QueueName::Poll, self.config.poll_concurrency, poll_worker)
            .await?;

        let cleanup_worker = Arc::new(CleanupWorker::new(
            self.store.clone(),
            scheduler,
            self.config.io_timeout,
        ));
        self.scheduler
            .consume(QueueName::Cleanup, CLEANUP_CONCURRENCY, cleanup_worker)
            .await?;

        info!(
            poll_concurrency = self.config.poll_concurrency,
            poll_interval_secs = self.config.poll_interval.as_secs(),
            poll_max_attempts = self.config.poll_max_attempts,
            tx_timeout_secs = self.config.tx_timeout.as_secs(),
            "Settlement pipeline started"
        );
        Ok(())
    }

    /// Start the periodic sweep for pending transactions past their deadline
    pub async fn start_reconciliation(&self) {
        start_timeout_reconciliation_job(
            self.store.clone(),
            self.scheduler.clone(),
            self.config.reconcile_interval,
            self.config.reconcile_batch_size,
            self.config.io_timeout,
            self.scheduler.shutdown_signal(),
        )
        .await;
    }

    /// Stop the queue consumers and the reconciliation sweep; in-flight jobs finish
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
        info!("Settlement pipeline stopped");
    }
}
