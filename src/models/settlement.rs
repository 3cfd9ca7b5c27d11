//! Settlement events published when a transaction confirms on chain

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::transaction::{Transaction, TransactionType};

/// Pub/sub topic carrying settlement events
pub const SETTLEMENT_TOPIC: &str = "poolmind.settlement";

/// Settled deposit or withdrawal, built from the finalized record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementEvent {
    pub tx_id: String,
    pub user_id: String,
    #[serde(rename = "type")]
    pub tx_type: TransactionType,
    /// Principal put in by the user: micro-STX for deposits, PLMD micro-shares for withdrawals
    pub gross_amount: Option<i64>,
    pub net_amount: Option<i64>,
    pub fee: Option<i64>,
    pub nav: Option<i64>,
    pub block_height: Option<i64>,
}

impl SettlementEvent {
    pub fn event_type(&self) -> &'static str {
        match self.tx_type {
            TransactionType::Deposit => "deposit.succeeded",
            TransactionType::Withdrawal => "withdrawal.succeeded",
        }
    }
}

impl From<&Transaction> for SettlementEvent {
    fn from(tx: &Transaction) -> Self {
        let gross_amount = match tx.tx_type {
            TransactionType::Deposit => tx.stx_amount,
            TransactionType::Withdrawal => tx.plmd_amount,
        };

        Self {
            tx_id: tx.tx_id.clone(),
            user_id: tx.user_id.clone(),
            tx_type: tx.tx_type,
            gross_amount,
            net_amount: tx.net_amount,
            fee: tx.fee,
            nav: tx.nav,
            block_height: tx.block_height,
        }
    }
}

/// Envelope delivered to topic subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementMessage {
    pub topic: String,
    pub event_type: String,
    pub payload: SettlementEvent,
    pub published_at: DateTime<Utc>,
}

impl SettlementMessage {
    pub fn new(event: SettlementEvent) -> Self {
        Self {
            topic: SETTLEMENT_TOPIC.to_string(),
            event_type: event.event_type().to_string(),
            payload: event,
            published_at: Utc::now(),
        }
    }
}
