//! Submit and query entry points
//!
//! `submit` records a pending transaction and arms its two jobs: an
//! immediate poll job and a cleanup job at the deadline.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::jobs::{cleanup_job_id, poll_job_id, TransactionJobPayload};
use crate::models::transaction::{ListFilter, NewTransaction, Transaction};
use crate::services::amount_converter::{
    deposit_breakdown, withdrawal_breakdown, ConversionError, DepositQuote, NavSnapshot,
    WithdrawalQuote,
};
use crate::services::polling_scheduler::{PollingScheduler, QueueName};
use crate::services::transaction_store::{StoreError, TransactionStore};

pub const DEFAULT_LIST_LIMIT: u64 = 20;
pub const MAX_LIST_LIMIT: u64 = 100;

/// Error types for submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    Validation(String),
    Conversion(ConversionError),
    Store(StoreError),
}

impl std::fmt::Display for SubmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubmitError::Validation(msg) => write!(f, "Validation error: {}", msg),
            SubmitError::Conversion(e) => write!(f, "Conversion error: {}", e),
            SubmitError::Store(e) => write!(f, "Store error: {}", e),
        }
    }
}

impl std::error::Error for SubmitError {}

impl From<ConversionError> for SubmitError {
    fn from(e: ConversionError) -> Self {
        SubmitError::Conversion(e)
    }
}

impl From<StoreError> for SubmitError {
    fn from(e: StoreError) -> Self {
        SubmitError::Store(e)
    }
}

fn validate(data: &NewTransaction) -> Result<(), SubmitError> {
    if data.tx_id.trim().is_empty() {
        return Err(SubmitError::Validation("txId is required".to_string()));
    }
    if data.user_id.trim().is_empty() {
        return Err(SubmitError::Validation("userId is required".to_string()));
    }
    if data.user_address.trim().is_empty() {
        return Err(SubmitError::Validation("userAddress is required".to_string()));
    }

    if let Some(nav) = data.nav.filter(|nav| *nav <= 0) {
        return Err(ConversionError::NavNotPositive(nav).into());
    }
    for amount in [data.stx_amount, data.plmd_amount, data.net_amount]
        .into_iter()
        .flatten()
    {
        if amount <= 0 {
            return Err(ConversionError::InvalidAmount(amount).into());
        }
    }
    if let Some(fee) = data.fee.filter(|fee| *fee < 0) {
        return Err(ConversionError::InvalidAmount(fee).into());
    }

    Ok(())
}

/// Clamp a caller-supplied page size to `1..=100`, defaulting to 20
pub fn clamp_limit(limit: Option<u64>) -> u64 {
    limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT)
}

pub struct TransactionService {
    store: Arc<dyn TransactionStore>,
    scheduler: Arc<dyn PollingScheduler>,
}

impl TransactionService {
    pub fn new(store: Arc<dyn TransactionStore>, scheduler: Arc<dyn PollingScheduler>) -> Self {
        Self { store, scheduler }
    }

    /// Record a submitted transaction and start tracking it
    pub async fn submit(&self, data: NewTransaction) -> Result<Transaction, SubmitError> {
        validate(&data)?;

        let tx = match self.store.create(data).await {
            Ok(tx) => tx,
            Err(StoreError::DuplicateTransaction(tx_id)) => {
                warn!(tx_id = %tx_id, "Duplicate transaction submission rejected");
                return Err(StoreError::DuplicateTransaction(tx_id).into());
            }
            Err(e) => return Err(e.into()),
        };

        info!(
            tx_id = %tx.tx_id,
            user_id = %tx.user_id,
            tx_type = %tx.tx_type,
            timeout_at = %tx.timeout_at,
            "Transaction submitted"
        );

        self.schedule_tracking(&tx).await;
        Ok(tx)
    }

    /// Arm the poll and cleanup jobs for a pending transaction.
    /// Scheduling failures are logged; reconciliation still bounds the record.
    pub async fn schedule_tracking(&self, tx: &Transaction) {
        let payload = TransactionJobPayload {
            tx_id: tx.tx_id.clone(),
        }
        .to_value();

        if let Err(e) = self
            .scheduler
            .schedule(QueueName::Poll, &poll_job_id(&tx.tx_id), payload.clone(), Duration::ZERO)
            .await
        {
            warn!(tx_id = %tx.tx_id, error = %e, "Failed to schedule poll job");
        }

        let until_deadline = (tx.timeout_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        if let Err(e) = self
            .scheduler
            .schedule(
                QueueName::Cleanup,
                &cleanup_job_id(&tx.tx_id),
                payload,
                until_deadline,
            )
            .await
        {
            warn!(tx_id = %tx.tx_id, error = %e, "Failed to schedule cleanup job");
        }
    }

    /// Re-arm jobs for pending transactions still inside their window.
    /// Used at startup since scheduled jobs live in memory.
    pub async fn resume_pending(&self, batch_size: u64) -> Result<usize, StoreError> {
        let pending = self.store.list_pending(Utc::now(), batch_size).await?;
        for tx in &pending {
            self.schedule_tracking(tx).await;
        }

        if !pending.is_empty() {
            info!(count = pending.len(), "Resumed tracking of pending transactions");
        }
        Ok(pending.len())
    }

    pub async fn get_status(&self, tx_id: &str) -> Result<Transaction, StoreError> {
        self.store.get(tx_id).await
    }

    pub async fn list_for_user(
        &self,
        user_id: &str,
        filter: ListFilter,
        limit: Option<u64>,
        offset: u64,
    ) -> Result<Vec<Transaction>, StoreError> {
        let limit = clamp_limit(limit);
        debug!(user_id = %user_id, limit = limit, offset = offset, "Listing user transactions");
        self.store.list_by_user(user_id, filter, limit, offset).await
    }

    pub fn preview_deposit(
        &self,
        gross_stx: i64,
        snapshot: NavSnapshot,
    ) -> Result<DepositQuote, ConversionError> {
        deposit_breakdown(gross_stx, snapshot.nav, snapshot.entry_fee_rate_bp)
    }

    pub fn preview_withdrawal(
        &self,
        shares: i64,
        snapshot: NavSnapshot,
    ) -> Result<WithdrawalQuote, ConversionError> {
        withdrawal_breakdown(shares, snapshot.nav, snapshot.exit_fee_rate_bp)
    }
}
