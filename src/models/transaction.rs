//! Transaction types and status enums for deposit/withdrawal confirmation tracking
//!
//! Status progresses: pending → success
//!                            ↘ failed
//!                            ↘ timeout

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entities::transactions;

/// Kind of pool operation a transaction performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Deposit,
    Withdrawal,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Deposit => "deposit",
            TransactionType::Withdrawal => "withdrawal",
        }
    }
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TransactionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "deposit" => Ok(TransactionType::Deposit),
            "withdrawal" => Ok(TransactionType::Withdrawal),
            _ => Err(format!("Unknown transaction type: {}", s)),
        }
    }
}

/// Lifecycle status of a submitted transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    /// Submitted, outcome not yet observed on chain
    Pending,
    /// Confirmed on chain
    Success,
    /// Aborted or reverted on chain
    Failed,
    /// Not observed before the polling deadline
    Timeout,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Success => "success",
            TransactionStatus::Failed => "failed",
            TransactionStatus::Timeout => "timeout",
        }
    }

    /// Terminal statuses never transition again
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TransactionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(TransactionStatus::Pending),
            "success" => Ok(TransactionStatus::Success),
            "failed" => Ok(TransactionStatus::Failed),
            "timeout" => Ok(TransactionStatus::Timeout),
            _ => Err(format!("Unknown transaction status: {}", s)),
        }
    }
}

/// A tracked on-chain transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub tx_id: String,
    pub user_id: String,
    pub user_address: String,
    #[serde(rename = "type")]
    pub tx_type: TransactionType,
    pub status: TransactionStatus,
    pub stx_amount: Option<i64>,
    pub plmd_amount: Option<i64>,
    pub nav: Option<i64>,
    pub fee: Option<i64>,
    pub net_amount: Option<i64>,
    pub block_height: Option<i64>,
    pub retry_count: i32,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub timeout_at: DateTime<Utc>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    /// Build a fresh pending record with its polling deadline fixed at `created_at + timeout`
    pub fn new_pending(data: NewTransaction, created_at: DateTime<Utc>, timeout: chrono::Duration) -> Self {
        Self {
            tx_id: data.tx_id,
            user_id: data.user_id,
            user_address: data.user_address,
            tx_type: data.tx_type,
            status: TransactionStatus::Pending,
            stx_amount: data.stx_amount,
            plmd_amount: data.plmd_amount,
            nav: data.nav,
            fee: data.fee,
            net_amount: data.net_amount,
            block_height: None,
            retry_count: 0,
            last_polled_at: None,
            confirmed_at: None,
            timeout_at: created_at + timeout,
            error_message: None,
            created_at,
            updated_at: created_at,
        }
    }

    /// Apply a terminal status and its accompanying fields
    pub fn apply_update(&mut self, status: TransactionStatus, update: &StatusUpdate, now: DateTime<Utc>) {
        self.status = status;
        if update.block_height.is_some() {
            self.block_height = update.block_height;
        }
        self.confirmed_at = Some(update.confirmed_at.unwrap_or(now));
        if update.error_message.is_some() {
            self.error_message = update.error_message.clone();
        }
        self.updated_at = now;
    }
}

impl TryFrom<transactions::Model> for Transaction {
    type Error = String;

    fn try_from(model: transactions::Model) -> Result<Self, Self::Error> {
        Ok(Self {
            tx_type: model.tx_type.parse()?,
            status: model.status.parse()?,
            tx_id: model.tx_id,
            user_id: model.user_id,
            user_address: model.user_address,
            stx_amount: model.stx_amount,
            plmd_amount: model.plmd_amount,
            nav: model.nav,
            fee: model.fee,
            net_amount: model.net_amount,
            block_height: model.block_height,
            retry_count: model.retry_count,
            last_polled_at: model.last_polled_at.map(|t| t.with_timezone(&Utc)),
            confirmed_at: model.confirmed_at.map(|t| t.with_timezone(&Utc)),
            timeout_at: model.timeout_at.with_timezone(&Utc),
            error_message: model.error_message,
            created_at: model.created_at.with_timezone(&Utc),
            updated_at: model.updated_at.with_timezone(&Utc),
        })
    }
}

/// Data supplied by the submit caller when a transaction is first recorded
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTransaction {
    pub tx_id: String,
    pub user_id: String,
    pub user_address: String,
    #[serde(rename = "type")]
    pub tx_type: TransactionType,
    pub stx_amount: Option<i64>,
    pub plmd_amount: Option<i64>,
    pub nav: Option<i64>,
    pub fee: Option<i64>,
    pub net_amount: Option<i64>,
}

/// Fields written together with a terminal status
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusUpdate {
    pub block_height: Option<i64>,
    /// Defaults to the time of the write when unset
    pub confirmed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Optional filters for per-user history queries
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListFilter {
    pub status: Option<TransactionStatus>,
    #[serde(rename = "type")]
    pub tx_type: Option<TransactionType>,
}

impl ListFilter {
    pub fn matches(&self, tx: &Transaction) -> bool {
        self.status.is_none_or(|s| s == tx.status) && self.tx_type.is_none_or(|t| t == tx.tx_type)
    }
}
