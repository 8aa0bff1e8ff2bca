use anyhow::Context;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

use stream_sync::telemetry::init_telemetry;
use stream_sync::{
    load_config, GroupConsumer, Namespace, Producer, RedisBroker, RequestHandler, SurrealStore, SyncMetrics,
    TableStore,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let telemetry = init_telemetry("interface", "interface=info,stream_sync=info")
        .context("Failed to initialize telemetry")?;

    info!("Starting interface...");

    let config = load_config();
    let settings = config.consumer.clone();

    let broker = Arc::new(
        RedisBroker::connect(&config.broker)
            .await
            .context("Failed to connect to Redis")?,
    );
    let store = Arc::new(
        SurrealStore::connect(config.store.clone())
            .await
            .context("Failed to connect to SurrealDB")?,
    );

    let metrics = SyncMetrics::global();
    let namespace = Namespace::new(&config.store.database, &config.store.collection);
    let table_store = TableStore::new(store, namespace, settings.operation_timeout);
    let producer = Producer::new(broker.clone(), settings.operation_timeout);
    let handler = RequestHandler::new(table_store, producer, &settings, metrics.clone());
    let consumer = GroupConsumer::new(broker, handler, settings, metrics);

    let result = consumer.run(shutdown_signal()).await;
    if let Err(e) = &result {
        error!(error = %e, "Consumer failed");
    }

    info!("Shutting down...");
    telemetry.shutdown();
    info!("Interface shut down.");

    result.context("Consumer loop exited with an error")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Signal received, finishing current batch");
}
