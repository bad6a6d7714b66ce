//! iot-alerting worker
//!
//! Runs the rule evaluator and the outbox relay against NATS, Redis, and
//! Postgres until Ctrl-C.

use iot_alerting::telemetry::init_tracing;
use iot_alerting::{
    BackoffPolicy, ChannelProvider, EventIngestor, MemoryDlqHandler, NatsProvider,
    PipelineConfig, PostgresStore, RedisDirectory, Result, RuleEvaluator,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = PipelineConfig::from_env()?;
    init_tracing(config.log_level(), config.log_json)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        queue = %config.queue_name,
        consumer = %config.consumer_name,
        "Starting iot-alerting worker"
    );

    let store =
        Arc::new(PostgresStore::connect(&config.database_url, config.db_max_connections).await?);
    store.ensure_schema().await?;

    let directory =
        Arc::new(RedisDirectory::connect(&config.redis_url, BackoffPolicy::default()).await?);
    let channel = Arc::new(NatsProvider::connect(config.nats_config()).await?);

    let ingestor = EventIngestor::new(channel.clone(), directory.clone(), store.clone());
    let evaluator = RuleEvaluator::new(
        directory.clone(),
        store.clone(),
        Arc::new(MemoryDlqHandler::default()),
        config.evaluator_config(),
    );

    let subscription = channel
        .subscribe_durable(&config.consumer_name, &config.subscribe_options())
        .await?;

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl-C received, shutting down");
                shutdown.cancel();
            }
            Err(e) => tracing::error!(error = %e, "Failed to listen for Ctrl-C"),
        }
    });

    let worker = async {
        let stats = evaluator.run(subscription, cancel.clone()).await;
        cancel.cancel();
        stats
    };
    let relay = ingestor.run_outbox_relay(config.outbox_interval(), cancel.clone());
    let (stats, ()) = tokio::join!(worker, relay);
    let stats = stats?;

    directory.disconnect().await;
    info!(
        processed = stats.processed,
        alerts = stats.alerts,
        dead_lettered = stats.dead_lettered,
        "Worker shutdown complete"
    );
    Ok(())
}
