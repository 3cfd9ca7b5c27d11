pub mod cleanup_worker;
pub mod poll_worker;
pub mod timeout_reconciliation;

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

use crate::services::transaction_store::StoreError;

/// Payload carried by poll and cleanup jobs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionJobPayload {
    pub tx_id: String,
}

impl TransactionJobPayload {
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({ "txId": self.tx_id })
    }
}

/// Poll jobs are keyed by the transaction id itself
pub fn poll_job_id(tx_id: &str) -> String {
    tx_id.to_string()
}

pub fn cleanup_job_id(tx_id: &str) -> String {
    format!("cleanup:{}", tx_id)
}

/// Bound a store call; an elapsed timer is reported as a database error
pub async fn store_call<T, F>(io_timeout: Duration, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(io_timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Database(format!(
            "store call timed out after {}s",
            io_timeout.as_secs()
        ))),
    }
}
