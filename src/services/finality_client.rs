//! Blockchain indexer client for on-chain transaction status
//!
//! Queries the Stacks API (`GET /extended/v1/tx/{tx_id}`). A 404 means the
//! indexer has not seen the transaction yet, which is normal right after
//! broadcast and is reported as `ChainStatus::NotFound`, not as an error.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Error types for indexer queries; all of them are transient from the poller's view
#[derive(Debug)]
pub enum FinalityError {
    Http(String),
    UnexpectedStatus(u16, String),
    Decode(String),
}

impl std::fmt::Display for FinalityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FinalityError::Http(msg) => write!(f, "Indexer request failed: {}", msg),
            FinalityError::UnexpectedStatus(code, body) => {
                write!(f, "Indexer returned {}: {}", code, body)
            }
            FinalityError::Decode(msg) => write!(f, "Invalid indexer response: {}", msg),
        }
    }
}

impl std::error::Error for FinalityError {}

/// On-chain outcome as seen by the indexer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainStatus {
    /// Not (yet) known to the indexer
    NotFound,
    /// Known but not final, e.g. still in the mempool
    Pending { status: String },
    Success { block_height: Option<i64> },
    /// Aborted or reverted; the raw indexer status is kept for the error message
    Aborted {
        status: String,
        block_height: Option<i64>,
    },
}

impl ChainStatus {
    /// Map a raw indexer status string
    pub fn from_indexer(status: Option<&str>, block_height: Option<i64>) -> Self {
        match status {
            None => ChainStatus::NotFound,
            Some("success") => ChainStatus::Success { block_height },
            Some(s) if s.starts_with("abort") || s.starts_with("revert") => ChainStatus::Aborted {
                status: s.to_string(),
                block_height,
            },
            Some(s) => ChainStatus::Pending {
                status: s.to_string(),
            },
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, ChainStatus::Success { .. } | ChainStatus::Aborted { .. })
    }
}

#[async_trait]
pub trait FinalityClient: Send + Sync {
    async fn query(&self, tx_id: &str) -> Result<ChainStatus, FinalityError>;
}

#[derive(Debug, Deserialize)]
struct IndexerTxResponse {
    #[serde(alias = "status")]
    tx_status: Option<String>,
    #[serde(alias = "blockHeight")]
    block_height: Option<i64>,
}

/// HTTP client for a Stacks API compatible indexer
#[derive(Clone)]
pub struct HttpFinalityClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpFinalityClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self, FinalityError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| FinalityError::Http(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn tx_url(&self, tx_id: &str) -> String {
        format!("{}/extended/v1/tx/{}", self.base_url, tx_id)
    }
}

#[async_trait]
impl FinalityClient for HttpFinalityClient {
    async fn query(&self, tx_id: &str) -> Result<ChainStatus, FinalityError> {
        let mut request = self
            .client
            .get(self.tx_url(tx_id))
            .header("accept", "application/json");
        if let Some(key) = &self.api_key {
            request = request.header("x-api-key", key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| FinalityError::Http(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            debug!(tx_id = %tx_id, "Transaction not yet indexed");
            return Ok(ChainStatus::NotFound);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FinalityError::UnexpectedStatus(status.as_u16(), body));
        }

        let body: IndexerTxResponse = response
            .json()
            .await
            .map_err(|e| FinalityError::Decode(e.to_string()))?;

        let chain_status = ChainStatus::from_indexer(body.tx_status.as_deref(), body.block_height);
        debug!(tx_id = %tx_id, status = ?chain_status, "Indexer status");
        Ok(chain_status)
    }
}
