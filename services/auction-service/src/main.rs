//! Auction service.
//!
//! Serves the authoritative auction API and runs the outbox dispatcher that
//! publishes every committed change to the broker.

mod config;

use anyhow::Context;
use config::Config;
use gavel_core::environment::SystemClock;
use gavel_core::event_bus::EventBus;
use gavel_core::outbox::OutboxStore;
use gavel_core::routing::TopicRouter;
use gavel_postgres::{PostgresAuctionStore, PostgresOutboxStore};
use gavel_redpanda::RedpandaEventBus;
use gavel_runtime::metrics::MetricsRecorder;
use gavel_runtime::{DispatcherConfig, OutboxDispatcher};
use gavel_web::{auction_router, AuctionApiState};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!(
        brokers = %config.redpanda.brokers,
        topic_prefix = %config.redpanda.topic_prefix,
        "Starting auction service"
    );

    let metrics = MetricsRecorder::install()?;

    let store = PostgresAuctionStore::connect(&config.database_url, SystemClock)
        .await
        .context("connecting to the auction database")?;
    store.migrate().await?;
    let outbox: Arc<dyn OutboxStore> = Arc::new(PostgresOutboxStore::new(store.pool().clone()));
    info!("Auction database ready");

    let event_bus: Arc<dyn EventBus> = Arc::new(
        RedpandaEventBus::builder()
            .brokers(&config.redpanda.brokers)
            .producer_acks(&config.redpanda.producer_acks)
            .timeout(config.redpanda.timeout)
            .build()?,
    );

    let dispatcher = OutboxDispatcher::new(
        Arc::clone(&outbox),
        event_bus,
        TopicRouter::new(config.redpanda.topic_prefix.clone()),
        DispatcherConfig::builder()
            .poll_interval(config.outbox.poll_interval)
            .batch_size(config.outbox.batch_size)
            .max_in_flight(config.outbox.max_in_flight)
            .shutdown_grace(config.outbox.shutdown_grace)
            .build()?,
    )?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let dispatcher_task = tokio::spawn(async move { dispatcher.run(shutdown_rx).await });

    let state = AuctionApiState::new(Arc::new(store), outbox).with_metrics(metrics);
    let app = auction_router(state);

    let addr = config.server.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(address = %addr, "Auction API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown_tx.send(true).ok();
    dispatcher_task.await?;

    info!("Auction service stopped");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            },
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}
