use poolmind_settlement::config::PipelineConfig;
use poolmind_settlement::models::settlement::SettlementMessage;
use poolmind_settlement::pipeline::SettlementPipeline;
use poolmind_settlement::services::finality_client::HttpFinalityClient;
use poolmind_settlement::services::notification_sink::BroadcastNotificationSink;
use poolmind_settlement::services::transaction_store::SeaOrmTransactionStore;
use sea_orm::Database;
use sea_orm_migration::MigratorTrait;
use std::env;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,poolmind_settlement=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();
    let config = PipelineConfig::from_env();

    // Connect to database
    let database_url = env::var("DATABASE_URL").map_err(|_| "DATABASE_URL must be set")?;
    tracing::info!("Connecting to database...");
    let db = Database::connect(&database_url).await?;

    // Run migrations
    tracing::info!("Running migrations...");
    migration::Migrator::up(&db, None).await?;

    let store = Arc::new(SeaOrmTransactionStore::new(db, config.tx_timeout_chrono()));
    let finality = Arc::new(HttpFinalityClient::new(
        config.indexer_url.clone(),
        config.indexer_api_key.clone(),
        config.io_timeout,
    )?);
    let sink = Arc::new(BroadcastNotificationSink::new(config.settlement_channel_capacity));

    spawn_settlement_logger(sink.subscribe());

    tracing::info!(indexer_url = %config.indexer_url, "Starting settlement pipeline");
    let pipeline = SettlementPipeline::new(config.clone(), store, finality, sink);
    pipeline.start().await?;

    // Jobs live in memory, so re-arm anything still pending from a previous run
    pipeline
        .service()
        .resume_pending(config.reconcile_batch_size)
        .await?;
    pipeline.start_reconciliation().await;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    pipeline.shutdown();

    Ok(())
}

/// Log every settlement message published on the in-process topic
fn spawn_settlement_logger(mut rx: broadcast::Receiver<String>) {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(raw) => match serde_json::from_str::<SettlementMessage>(&raw) {
                    Ok(message) => tracing::info!(
                        topic = %message.topic,
                        event_type = %message.event_type,
                        tx_id = %message.payload.tx_id,
                        user_id = %message.payload.user_id,
                        net_amount = ?message.payload.net_amount,
                        "Settlement event"
                    ),
                    Err(e) => tracing::warn!(error = %e, "Undecodable settlement message"),
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped = skipped, "Settlement logger lagged behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
