#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use poolmind_settlement::models::settlement::SettlementEvent;
use poolmind_settlement::models::transaction::{NewTransaction, TransactionType};
use poolmind_settlement::services::finality_client::{ChainStatus, FinalityClient, FinalityError};
use poolmind_settlement::services::notification_sink::{NotificationError, NotificationSink};
use sea_orm::{ConnectOptions, Database, DatabaseConnection, DbErr};
use sea_orm_migration::MigratorTrait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Set up test database connection
/// Uses an in-memory SQLite database with the migrations applied
pub async fn setup_test_db() -> Result<DatabaseConnection, DbErr> {
    // A single connection keeps every query on the same in-memory database
    let mut options = ConnectOptions::new("sqlite::memory:");
    options.max_connections(1).min_connections(1).sqlx_logging(false);

    let db = Database::connect(options).await?;
    migration::Migrator::up(&db, None).await?;
    Ok(db)
}

pub fn deposit(tx_id: &str, user_id: &str) -> NewTransaction {
    NewTransaction {
        tx_id: tx_id.to_string(),
        user_id: user_id.to_string(),
        user_address: "SP2J6ZY48GV1EZ5V2V5RB9MP66SW86PYKKNRV9EJ7".to_string(),
        tx_type: TransactionType::Deposit,
        stx_amount: Some(10_000_000),
        plmd_amount: Some(9_950_000),
        nav: Some(1_000_000),
        fee: Some(50_000),
        net_amount: Some(9_950_000),
    }
}

pub fn withdrawal(tx_id: &str, user_id: &str) -> NewTransaction {
    NewTransaction {
        tx_id: tx_id.to_string(),
        user_id: user_id.to_string(),
        user_address: "SP2J6ZY48GV1EZ5V2V5RB9MP66SW86PYKKNRV9EJ7".to_string(),
        tx_type: TransactionType::Withdrawal,
        stx_amount: Some(4_975_000),
        plmd_amount: Some(5_000_000),
        nav: Some(1_000_000),
        fee: Some(25_000),
        net_amount: Some(4_975_000),
    }
}

/// Indexer fake: answers per tx id after a number of not-found polls
#[derive(Default)]
pub struct FakeIndexer {
    /// tx_id -> (not-found answers before the final one, final answer)
    script: Mutex<HashMap<String, (usize, ChainStatus)>>,
    queries: AtomicUsize,
}

impl FakeIndexer {
    pub fn confirm_after(&self, tx_id: &str, not_found_polls: usize, status: ChainStatus) {
        self.script
            .lock()
            .insert(tx_id.to_string(), (not_found_polls, status));
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FinalityClient for FakeIndexer {
    async fn query(&self, tx_id: &str) -> Result<ChainStatus, FinalityError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script.lock();
        match script.get_mut(tx_id) {
            Some((remaining, _)) if *remaining > 0 => {
                *remaining -= 1;
                Ok(ChainStatus::NotFound)
            }
            Some((_, status)) => Ok(status.clone()),
            None => Ok(ChainStatus::NotFound),
        }
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub events: Mutex<Vec<SettlementEvent>>,
}

impl RecordingSink {
    pub fn published_for(&self, tx_id: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| event.tx_id == tx_id)
            .count()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn publish_settlement(&self, event: SettlementEvent) -> Result<(), NotificationError> {
        self.events.lock().push(event);
        Ok(())
    }
}
