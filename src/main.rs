use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use order_ingest::api::{self, AppState};
use order_ingest::cache::OrderCache;
use order_ingest::config::{Config, DeliverySemantics};
use order_ingest::messaging::KafkaSource;
use order_ingest::metrics::Metrics;
use order_ingest::pipeline::{IngestionPipeline, PipelineConfig};
use order_ingest::store::{schema, DuplicatePolicy, PgOrderStore};
use order_ingest::utils::{retry_on_transient, RetryConfig};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Default to INFO level, can be overridden with RUST_LOG env var
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,order_ingest=debug")),
        )
        .init();

    tracing::info!("Starting order ingestion service");

    let config = Config::from_env()?;
    tracing::info!(
        db_host = %config.database.host,
        db_name = %config.database.name,
        brokers = ?config.kafka.brokers,
        topic = %config.kafka.topic,
        batch_size = config.batch_size,
        semantics = ?config.delivery_semantics,
        "Configuration loaded"
    );

    // === 1. Initialize Prometheus metrics ===
    let metrics = Arc::new(Metrics::new()?);

    // === 2. Connect to Postgres and bootstrap the schema ===
    let store = retry_on_transient("connect to postgres", RetryConfig::startup(), |_| {
        PgOrderStore::connect(&config.database, metrics.clone())
    })
    .await
    .into_result()?;

    retry_on_transient("ensure schema", RetryConfig::startup(), |_| {
        schema::ensure_schema(store.pool())
    })
    .await
    .into_result()?;

    let duplicate_policy = match config.delivery_semantics {
        DeliverySemantics::AtMostOnce => DuplicatePolicy::Reject,
        DeliverySemantics::AtLeastOnce => DuplicatePolicy::Skip,
    };
    let store = Arc::new(store.with_duplicate_policy(duplicate_policy));

    // === 3. Hydrate the cache before consuming anything ===
    let cache = Arc::new(OrderCache::new());
    let report = cache.hydrate(store.as_ref()).await?;
    metrics.orders_cached.set(cache.len() as i64);
    tracing::info!(
        loaded = report.loaded,
        skipped = report.skipped,
        "Order cache loaded"
    );

    // === 4. Start the ingestion pipeline ===
    let source = KafkaSource::new(&config.kafka, config.delivery_semantics)?;
    let mut pipeline = IngestionPipeline::new(
        source,
        store.clone(),
        cache.clone(),
        metrics.clone(),
        PipelineConfig {
            batch_size: config.batch_size,
            semantics: config.delivery_semantics,
        },
    );
    let pipeline_state = pipeline.subscribe_state();

    let shutdown = CancellationToken::new();
    let pipeline_task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            let result = pipeline.run(shutdown.clone()).await;
            // A failed consumer takes the process down with it.
            shutdown.cancel();
            result
        }
    });

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            tokio::select! {
                received = shutdown_signal() => {
                    match received {
                        Ok(()) => tracing::info!("Shutdown signal received"),
                        Err(e) => tracing::error!(error = %e, "Failed to listen for shutdown signals"),
                    }
                    shutdown.cancel();
                }
                _ = shutdown.cancelled() => {}
            }
        }
    });

    // === 5. Serve the query surface ===
    let state = AppState {
        cache,
        metrics,
        pipeline: pipeline_state,
    };
    let server = match api::start_api_server(state, config.http_port, config.shutdown_timeout) {
        Ok(server) => server,
        Err(e) => {
            shutdown.cancel();
            return Err(e.into());
        }
    };

    api::serve_until_shutdown(server, shutdown.clone()).await?;

    // === 6. Wait for the pipeline to wind down ===
    match tokio::time::timeout(config.shutdown_timeout, pipeline_task).await {
        Ok(joined) => joined??,
        Err(_) => tracing::warn!(
            timeout_ms = config.shutdown_timeout.as_millis() as u64,
            "Pipeline did not stop in time"
        ),
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        signal(SignalKind::terminate())?.recv().await;
        Ok::<(), std::io::Error>(())
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<std::io::Result<()>>();

    tokio::select! {
        received = tokio::signal::ctrl_c() => received,
        received = terminate => received,
    }
}
