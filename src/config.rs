//! Pipeline configuration from environment variables
//!
//! Every setting has a default; `.env` is loaded by `main` before this runs.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::services::polling_scheduler::{
    QueueConfig, DEFAULT_CLEANUP_MAX_ATTEMPTS, DEFAULT_CLEANUP_RETRY_SECS,
    DEFAULT_POLL_INTERVAL_SECS, DEFAULT_POLL_MAX_ATTEMPTS,
};

/// Stacks mainnet API
const DEFAULT_INDEXER_URL: &str = "https://api.hiro.so";
const DEFAULT_POLL_CONCURRENCY: usize = 5;
/// 5 minutes
const DEFAULT_TX_TIMEOUT_SECS: u64 = 300;
const DEFAULT_IO_TIMEOUT_SECS: u64 = 10;
const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 60;
const DEFAULT_RECONCILE_BATCH_SIZE: u64 = 100;
const DEFAULT_SETTLEMENT_CHANNEL_CAPACITY: usize = 1024;

/// Environment variable names
const ENV_INDEXER_URL: &str = "STACKS_API_URL";
const ENV_INDEXER_API_KEY: &str = "STACKS_API_KEY";
const ENV_POLL_INTERVAL: &str = "TX_POLL_INTERVAL_SECS";
const ENV_POLL_MAX_ATTEMPTS: &str = "TX_POLL_MAX_ATTEMPTS";
const ENV_POLL_CONCURRENCY: &str = "TX_POLL_CONCURRENCY";
const ENV_TX_TIMEOUT: &str = "TX_TIMEOUT_SECS";
const ENV_IO_TIMEOUT: &str = "TX_IO_TIMEOUT_SECS";
const ENV_RECONCILE_INTERVAL: &str = "TX_RECONCILE_INTERVAL_SECS";
const ENV_RECONCILE_BATCH_SIZE: &str = "TX_RECONCILE_BATCH_SIZE";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub indexer_url: String,
    pub indexer_api_key: Option<String>,
    pub poll_interval: Duration,
    pub poll_max_attempts: u32,
    pub poll_concurrency: usize,
    /// Deadline after submission before a pending transaction times out
    pub tx_timeout: Duration,
    /// Bound on each indexer and store call
    pub io_timeout: Duration,
    pub cleanup_retry: Duration,
    pub cleanup_max_attempts: u32,
    pub reconcile_interval: Duration,
    pub reconcile_batch_size: u64,
    pub settlement_channel_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            indexer_url: DEFAULT_INDEXER_URL.to_string(),
            indexer_api_key: None,
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            poll_max_attempts: DEFAULT_POLL_MAX_ATTEMPTS,
            poll_concurrency: DEFAULT_POLL_CONCURRENCY,
            tx_timeout: Duration::from_secs(DEFAULT_TX_TIMEOUT_SECS),
            io_timeout: Duration::from_secs(DEFAULT_IO_TIMEOUT_SECS),
            cleanup_retry: Duration::from_secs(DEFAULT_CLEANUP_RETRY_SECS),
            cleanup_max_attempts: DEFAULT_CLEANUP_MAX_ATTEMPTS,
            reconcile_interval: Duration::from_secs(DEFAULT_RECONCILE_INTERVAL_SECS),
            reconcile_batch_size: DEFAULT_RECONCILE_BATCH_SIZE,
            settlement_channel_capacity: DEFAULT_SETTLEMENT_CHANNEL_CAPACITY,
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            indexer_url: env::var(ENV_INDEXER_URL).unwrap_or(defaults.indexer_url),
            indexer_api_key: env::var(ENV_INDEXER_API_KEY)
                .ok()
                .filter(|key| !key.is_empty()),
            poll_interval: Duration::from_secs(env_or(ENV_POLL_INTERVAL, DEFAULT_POLL_INTERVAL_SECS)),
            poll_max_attempts: env_or(ENV_POLL_MAX_ATTEMPTS, defaults.poll_max_attempts).max(1),
            poll_concurrency: env_or(ENV_POLL_CONCURRENCY, defaults.poll_concurrency).max(1),
            tx_timeout: Duration::from_secs(env_or(ENV_TX_TIMEOUT, DEFAULT_TX_TIMEOUT_SECS)),
            io_timeout: Duration::from_secs(env_or(ENV_IO_TIMEOUT, DEFAULT_IO_TIMEOUT_SECS)),
            cleanup_retry: defaults.cleanup_retry,
            cleanup_max_attempts: defaults.cleanup_max_attempts,
            reconcile_interval: Duration::from_secs(env_or(
                ENV_RECONCILE_INTERVAL,
                DEFAULT_RECONCILE_INTERVAL_SECS,
            )),
            reconcile_batch_size: env_or(ENV_RECONCILE_BATCH_SIZE, defaults.reconcile_batch_size),
            settlement_channel_capacity: defaults.settlement_channel_capacity,
        }
    }

    pub fn poll_queue(&self) -> QueueConfig {
        QueueConfig {
            backoff: self.poll_interval,
            max_attempts: self.poll_max_attempts,
        }
    }

    pub fn cleanup_queue(&self) -> QueueConfig {
        QueueConfig {
            backoff: self.cleanup_retry,
            max_attempts: self.cleanup_max_attempts,
        }
    }

    pub fn tx_timeout_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.tx_timeout).unwrap_or(chrono::Duration::minutes(5))
    }
}
