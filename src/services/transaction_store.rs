//! Transaction persistence
//!
//! Status writes are compare-and-set on `status = 'pending'` so the poll and
//! cleanup paths can race freely: the first terminal write wins and every
//! later writer observes `AlreadyFinalized`.

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use parking_lot::Mutex;
use sea_orm::{
    sea_query::Expr, ActiveValue::Set, ColumnTrait, DatabaseConnection, DbErr, EntityTrait,
    QueryFilter, QueryOrder, QuerySelect, SqlErr,
};
use std::collections::HashMap;
use tracing::debug;

use crate::entities::{prelude::Transactions, transactions};
use crate::models::transaction::{
    ListFilter, NewTransaction, StatusUpdate, Transaction, TransactionStatus,
};

/// Error types for the transaction store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    DuplicateTransaction(String),
    NotFound(String),
    /// Benign race: another writer already moved the record out of `pending`
    AlreadyFinalized {
        tx_id: String,
        status: TransactionStatus,
    },
    InvalidTransition(String),
    Database(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DuplicateTransaction(tx_id) => {
                write!(f, "Transaction {} already submitted", tx_id)
            }
            StoreError::NotFound(tx_id) => write!(f, "Transaction {} not found", tx_id),
            StoreError::AlreadyFinalized { tx_id, status } => {
                write!(f, "Transaction {} already finalized as {}", tx_id, status)
            }
            StoreError::InvalidTransition(msg) => write!(f, "Invalid status transition: {}", msg),
            StoreError::Database(msg) => write!(f, "Database error: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<DbErr> for StoreError {
    fn from(e: DbErr) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Current time at the precision the database keeps (microseconds)
pub fn store_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

fn ensure_terminal(tx_id: &str, status: TransactionStatus) -> Result<(), StoreError> {
    if status.is_terminal() {
        Ok(())
    } else {
        Err(StoreError::InvalidTransition(format!(
            "{} cannot be moved back to {}",
            tx_id, status
        )))
    }
}

#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Record a new pending transaction; fails if the id was already submitted
    async fn create(&self, data: NewTransaction) -> Result<Transaction, StoreError>;

    async fn get(&self, tx_id: &str) -> Result<Transaction, StoreError>;

    /// Move a pending transaction to a terminal status, atomically
    async fn update_status(
        &self,
        tx_id: &str,
        status: TransactionStatus,
        update: StatusUpdate,
    ) -> Result<Transaction, StoreError>;

    /// Count one poll attempt and stamp `last_polled_at`
    async fn increment_retry(&self, tx_id: &str) -> Result<(), StoreError>;

    /// Newest first
    async fn list_by_user(
        &self,
        user_id: &str,
        filter: ListFilter,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<Transaction>, StoreError>;

    /// Pending transactions whose deadline is at or before `now`, oldest deadline first
    async fn list_timed_out_candidates(
        &self,
        now: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<Transaction>, StoreError>;

    /// Pending transactions still inside their polling window
    async fn list_pending(&self, now: DateTime<Utc>, limit: u64) -> Result<Vec<Transaction>, StoreError>;
}

/// PostgreSQL (or SQLite) backed store
#[derive(Clone)]
pub struct SeaOrmTransactionStore {
    db: DatabaseConnection,
    tx_timeout: chrono::Duration,
}

impl SeaOrmTransactionStore {
    pub fn new(db: DatabaseConnection, tx_timeout: chrono::Duration) -> Self {
        Self { db, tx_timeout }
    }

    fn to_domain(model: transactions::Model) -> Result<Transaction, StoreError> {
        Transaction::try_from(model).map_err(StoreError::Database)
    }
}

#[async_trait]
impl TransactionStore for SeaOrmTransactionStore {
    async fn create(&self, data: NewTransaction) -> Result<Transaction, StoreError> {
        let tx = Transaction::new_pending(data, store_now(), self.tx_timeout);

        let model = transactions::ActiveModel {
            tx_id: Set(tx.tx_id.clone()),
            user_id: Set(tx.user_id.clone()),
            user_address: Set(tx.user_address.clone()),
            tx_type: Set(tx.tx_type.to_string()),
            status: Set(tx.status.to_string()),
            stx_amount: Set(tx.stx_amount),
            plmd_amount: Set(tx.plmd_amount),
            nav: Set(tx.nav),
            fee: Set(tx.fee),
            net_amount: Set(tx.net_amount),
            block_height: Set(None),
            retry_count: Set(0),
            last_polled_at: Set(None),
            confirmed_at: Set(None),
            timeout_at: Set(tx.timeout_at.fixed_offset()),
            error_message: Set(None),
            created_at: Set(tx.created_at.fixed_offset()),
            updated_at: Set(tx.updated_at.fixed_offset()),
        };

        Transactions::insert(model)
            .exec_without_returning(&self.db)
            .await
            .map_err(|e| match e.sql_err() {
                Some(SqlErr::UniqueConstraintViolation(_)) => {
                    StoreError::DuplicateTransaction(tx.tx_id.clone())
                }
                _ => StoreError::from(e),
            })?;

        debug!(tx_id = %tx.tx_id, timeout_at = %tx.timeout_at, "Created pending transaction");
        Ok(tx)
    }

    async fn get(&self, tx_id: &str) -> Result<Transaction, StoreError> {
        let model = Transactions::find_by_id(tx_id.to_string())
            .one(&self.db)
            .await?
            .ok_or_else(|| StoreError::NotFound(tx_id.to_string()))?;
        Self::to_domain(model)
    }

    async fn update_status(
        &self,
        tx_id: &str,
        status: TransactionStatus,
        update: StatusUpdate,
    ) -> Result<Transaction, StoreError> {
        ensure_terminal(tx_id, status)?;

        // Returned record is this read plus the update; nothing is re-read once the write commits
        let mut finalized = self.get(tx_id).await?;
        if finalized.status.is_terminal() {
            return Err(StoreError::AlreadyFinalized {
                tx_id: tx_id.to_string(),
                status: finalized.status,
            });
        }

        let now = store_now();
        let confirmed_at = update.confirmed_at.unwrap_or(now);

        let mut query = Transactions::update_many()
            .col_expr(transactions::Column::Status, Expr::value(status.as_str()))
            .col_expr(
                transactions::Column::ConfirmedAt,
                Expr::value(confirmed_at.fixed_offset()),
            )
            .col_expr(transactions::Column::UpdatedAt, Expr::value(now.fixed_offset()));

        if let Some(height) = update.block_height {
            query = query.col_expr(transactions::Column::BlockHeight, Expr::value(height));
        }
        if let Some(message) = update.error_message.clone() {
            query = query.col_expr(transactions::Column::ErrorMessage, Expr::value(message));
        }

        let result = query
            .filter(transactions::Column::TxId.eq(tx_id))
            .filter(transactions::Column::Status.eq(TransactionStatus::Pending.as_str()))
            .exec(&self.db)
            .await?;

        if result.rows_affected == 0 {
            // Lost the race between our read and the guarded write
            let current = self.get(tx_id).await?;
            return Err(StoreError::AlreadyFinalized {
                tx_id: tx_id.to_string(),
                status: current.status,
            });
        }

        finalized.apply_update(status, &update, now);
        Ok(finalized)
    }

    async fn increment_retry(&self, tx_id: &str) -> Result<(), StoreError> {
        let result = Transactions::update_many()
            .col_expr(
                transactions::Column::RetryCount,
                Expr::col(transactions::Column::RetryCount).add(1),
            )
            .col_expr(
                transactions::Column::LastPolledAt,
                Expr::value(store_now().fixed_offset()),
            )
            .filter(transactions::Column::TxId.eq(tx_id))
            .exec(&self.db)
            .await?;

        if result.rows_affected == 0 {
            return Err(StoreError::NotFound(tx_id.to_string()));
        }
        Ok(())
    }

    async fn list_by_user(
        &self,
        user_id: &str,
        filter: ListFilter,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<Transaction>, StoreError> {
        let mut query = Transactions::find().filter(transactions::Column::UserId.eq(user_id));

        if let Some(status) = filter.status {
            query = query.filter(transactions::Column::Status.eq(status.as_str()));
        }
        if let Some(tx_type) = filter.tx_type {
            query = query.filter(transactions::Column::TxType.eq(tx_type.as_str()));
        }

        query
            .order_by_desc(transactions::Column::CreatedAt)
            .order_by_desc(transactions::Column::TxId)
            .limit(limit)
            .offset(offset)
            .all(&self.db)
            .await?
            .into_iter()
            .map(Self::to_domain)
            .collect()
    }

    async fn list_timed_out_candidates(
        &self,
        now: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<Transaction>, StoreError> {
        Transactions::find()
            .filter(transactions::Column::Status.eq(TransactionStatus::Pending.as_str()))
            .filter(transactions::Column::TimeoutAt.lte(now.fixed_offset()))
            .order_by_asc(transactions::Column::TimeoutAt)
            .limit(limit)
            .all(&self.db)
            .await?
            .into_iter()
            .map(Self::to_domain)
            .collect()
    }

    async fn list_pending(&self, now: DateTime<Utc>, limit: u64) -> Result<Vec<Transaction>, StoreError> {
        Transactions::find()
            .filter(transactions::Column::Status.eq(TransactionStatus::Pending.as_str()))
            .filter(transactions::Column::TimeoutAt.gt(now.fixed_offset()))
            .order_by_asc(transactions::Column::TimeoutAt)
            .limit(limit)
            .all(&self.db)
            .await?
            .into_iter()
            .map(Self::to_domain)
            .collect()
    }
}

/// Process-local store, used by tests and single-node dry runs
pub struct InMemoryTransactionStore {
    records: Mutex<HashMap<String, Transaction>>,
    tx_timeout: chrono::Duration,
}

impl InMemoryTransactionStore {
    pub fn new(tx_timeout: chrono::Duration) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            tx_timeout,
        }
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl TransactionStore for InMemoryTransactionStore {
    async fn create(&self, data: NewTransaction) -> Result<Transaction, StoreError> {
        let mut records = self.records.lock();
        if records.contains_key(&data.tx_id) {
            return Err(StoreError::DuplicateTransaction(data.tx_id));
        }
        let tx = Transaction::new_pending(data, store_now(), self.tx_timeout);
        records.insert(tx.tx_id.clone(), tx.clone());
        Ok(tx)
    }

    async fn get(&self, tx_id: &str) -> Result<Transaction, StoreError> {
        self.records
            .lock()
            .get(tx_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(tx_id.to_string()))
    }

    async fn update_status(
        &self,
        tx_id: &str,
        status: TransactionStatus,
        update: StatusUpdate,
    ) -> Result<Transaction, StoreError> {
        ensure_terminal(tx_id, status)?;

        let mut records = self.records.lock();
        let tx = records
            .get_mut(tx_id)
            .ok_or_else(|| StoreError::NotFound(tx_id.to_string()))?;

        if tx.status.is_terminal() {
            return Err(StoreError::AlreadyFinalized {
                tx_id: tx_id.to_string(),
                status: tx.status,
            });
        }

        tx.apply_update(status, &update, store_now());
        Ok(tx.clone())
    }

    async fn increment_retry(&self, tx_id: &str) -> Result<(), StoreError> {
        let mut records = self.records.lock();
        let tx = records
            .get_mut(tx_id)
            .ok_or_else(|| StoreError::NotFound(tx_id.to_string()))?;
        tx.retry_count += 1;
        tx.last_polled_at = Some(store_now());
        Ok(())
    }

    async fn list_by_user(
        &self,
        user_id: &str,
        filter: ListFilter,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<Transaction>, StoreError> {
        let records = self.records.lock();
        let mut matching: Vec<Transaction> = records
            .values()
            .filter(|tx| tx.user_id == user_id && filter.matches(tx))
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.tx_id.cmp(&a.tx_id))
        });

        Ok(matching
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn list_timed_out_candidates(
        &self,
        now: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<Transaction>, StoreError> {
        let records = self.records.lock();
        let mut expired: Vec<Transaction> = records
            .values()
            .filter(|tx| tx.status == TransactionStatus::Pending && tx.timeout_at <= now)
            .cloned()
            .collect();
        expired.sort_by_key(|tx| tx.timeout_at);
        expired.truncate(limit as usize);
        Ok(expired)
    }

    async fn list_pending(&self, now: DateTime<Utc>, limit: u64) -> Result<Vec<Transaction>, StoreError> {
        let records = self.records.lock();
        let mut pending: Vec<Transaction> = records
            .values()
            .filter(|tx| tx.status == TransactionStatus::Pending && tx.timeout_at > now)
            .cloned()
            .collect();
        pending.sort_by_key(|tx| tx.timeout_at);
        pending.truncate(limit as usize);
        Ok(pending)
    }
}
