//! Interface exception collector server.
//!
//! This binary:
//! - Connects to `PostgreSQL` and runs the schema migrations
//! - Starts the Prometheus scrape endpoint
//! - Consumes the inbound failure topics from Redpanda
//! - Publishes lifecycle changes and dead letters back to the broker
//! - Drains partition workers on Ctrl+C / SIGTERM
//!
//! # Usage
//!
//! ```bash
//! docker compose up -d
//! cargo run --bin exception-collector
//! ```

use anyhow::Context;
use exception_collector_core::dead_letter::DeadLetterSink;
use exception_collector_postgres::{PostgresDeadLetterQueue, PostgresExceptionStore};
use exception_collector_redpanda::{RedpandaConsumer, RedpandaProducer};
use exception_collector_runtime::{
    ExceptionService, FanoutPublisher, MetricsServer, PartitionDispatcher, SubscriptionHub,
};
use exception_collector_server::{Config, DeadLetterTarget};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "exception_collector=info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting interface exception collector");

    let config = Config::from_env();
    info!(
        redpanda = %config.redpanda.brokers,
        topics = ?config.redpanda.inbound_topics,
        dead_letters = ?config.redpanda.dead_letter_target,
        "Configuration loaded"
    );

    let mut metrics = MetricsServer::new(
        config
            .server
            .metrics_addr()
            .context("Invalid METRICS_HOST")?,
    );
    metrics.start()?;

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .acquire_timeout(Duration::from_secs(config.database.connect_timeout))
        .connect(&config.database.url)
        .await
        .context("Failed to connect to database")?;
    let store = PostgresExceptionStore::from_pool(pool.clone());
    if config.database.run_migrations {
        store.migrate().await?;
        info!("Migrations applied");
    }

    let producer = RedpandaProducer::builder()
        .brokers(&config.redpanda.brokers)
        .producer_acks(&config.redpanda.producer_acks)
        .timeout(Duration::from_millis(config.redpanda.producer_timeout_ms))
        .build()?;

    let dead_letters: Arc<dyn DeadLetterSink> = match config.redpanda.dead_letter_target {
        DeadLetterTarget::Topic => Arc::new(
            producer
                .dead_letter_sink()
                .with_suffix(&config.redpanda.dead_letter_suffix),
        ),
        DeadLetterTarget::Table => Arc::new(PostgresDeadLetterQueue::new(pool)),
    };

    let mut fanout = FanoutPublisher::new(SubscriptionHub::new(config.server.subscriber_capacity))
        .with_sla(config.server.fanout_sla());
    if config.redpanda.publish_lifecycle_events {
        let publisher = config
            .redpanda
            .outbound_topics
            .routes()
            .into_iter()
            .fold(producer.lifecycle_publisher(), |publisher, (kind, topic)| {
                publisher.with_topic(kind, topic)
            });
        fanout = fanout.with_publisher(Arc::new(publisher));
    }

    let service = ExceptionService::builder()
        .store(Arc::new(store))
        .dead_letters(dead_letters)
        .fanout(fanout)
        .policy(config.ingestion.backoff_policy())
        .rate_limit(config.limits.rate_limit_config())
        .request_timeout(config.server.request_timeout())
        .build()?;
    let eviction = service.limiter().spawn_eviction();

    let consumer = RedpandaConsumer::builder()
        .brokers(&config.redpanda.brokers)
        .consumer_group(&config.redpanda.consumer_group)
        .topics(config.redpanda.inbound_topics.iter().cloned())
        .auto_offset_reset(&config.redpanda.auto_offset_reset)
        .session_timeout_ms(config.redpanda.session_timeout_ms)
        .build()?;
    let mut dispatcher = PartitionDispatcher::new(service.ingestion().clone(), consumer.committer())
        .with_queue_capacity(config.ingestion.queue_capacity);

    info!("Interface exception collector is running");
    let consumed = consumer.run(&mut dispatcher, shutdown_signal()).await;

    if let Err(error) = dispatcher.shutdown(config.server.shutdown_timeout()).await {
        error!(%error, "Partition workers did not drain");
    }
    eviction.abort();

    consumed?;
    info!("Interface exception collector stopped");
    Ok(())
}

/// Graceful shutdown signal handler.
///
/// Waits for:
/// - Ctrl+C (SIGINT)
/// - SIGTERM (in production environments)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = signal::ctrl_c().await {
            error!(%error, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(error) => {
                error!(%error, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C signal, shutting down gracefully...");
        },
        () = terminate => {
            info!("Received SIGTERM signal, shutting down gracefully...");
        },
    }
}
