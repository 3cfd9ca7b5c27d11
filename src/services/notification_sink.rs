//! Settlement event fan-out
//!
//! The sink is a plain at-least-once publisher. Publishing at most once per
//! transaction is the caller's job (only the writer that wins the status CAS
//! publishes).

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::models::settlement::{SettlementEvent, SettlementMessage, SETTLEMENT_TOPIC};

/// Error types for settlement publishing
#[derive(Debug)]
pub enum NotificationError {
    Serialization(String),
    Delivery(String),
}

impl std::fmt::Display for NotificationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            NotificationError::Delivery(msg) => write!(f, "Delivery error: {}", msg),
        }
    }
}

impl std::error::Error for NotificationError {}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn publish_settlement(&self, event: SettlementEvent) -> Result<(), NotificationError>;
}

/// In-process pub/sub on the settlement topic
pub struct BroadcastNotificationSink {
    /// JSON-encoded `SettlementMessage`s
    tx: broadcast::Sender<String>,
}

impl BroadcastNotificationSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn topic(&self) -> &'static str {
        SETTLEMENT_TOPIC
    }

    /// Subscribe to settlement messages
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastNotificationSink {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl NotificationSink for BroadcastNotificationSink {
    async fn publish_settlement(&self, event: SettlementEvent) -> Result<(), NotificationError> {
        let message = SettlementMessage::new(event);
        let payload = serde_json::to_string(&message)
            .map_err(|e| NotificationError::Serialization(e.to_string()))?;

        match self.tx.send(payload) {
            Ok(receivers) => {
                info!(
                    topic = SETTLEMENT_TOPIC,
                    tx_id = %message.payload.tx_id,
                    event_type = %message.event_type,
                    receivers = receivers,
                    "Published settlement event"
                );
            }
            Err(_) => {
                // Nobody listening is not a delivery failure
                debug!(
                    topic = SETTLEMENT_TOPIC,
                    tx_id = %message.payload.tx_id,
                    "No subscribers for settlement event"
                );
            }
        }
        Ok(())
    }
}
