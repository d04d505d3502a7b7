//! Search service.
//!
//! Serves search over the read model and keeps it in sync: the consumer
//! applies events from the broker and the reconciler pulls whatever the
//! events missed from the auction service.

mod config;

use anyhow::Context;
use config::Config;
use gavel_core::environment::SystemClock;
use gavel_core::event_bus::EventBus;
use gavel_core::poison::PoisonStore;
use gavel_core::routing::TopicRouter;
use gavel_postgres::PostgresPoisonStore;
use gavel_projections::{
    CatchUpReconciler, ConsumerConfig, ConsumerWorker, HttpAuctionSource, PostgresSearchStore,
    ReconcilerConfig, SearchIndexer,
};
use gavel_redpanda::RedpandaEventBus;
use gavel_runtime::metrics::MetricsRecorder;
use gavel_runtime::RetryPolicy;
use gavel_web::{search_router, SearchApiState};
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
        consumer_group = %config.redpanda.consumer_group,
        auction_service = %config.reconciler.auction_service_url,
        "Starting search service"
    );

    let metrics = MetricsRecorder::install()?;

    let search_store = PostgresSearchStore::connect(&config.database_url)
        .await
        .context("connecting to the search database")?;
    search_store.migrate().await?;
    let dead_letters = PostgresPoisonStore::new(search_store.pool().clone());
    dead_letters.migrate().await?;
    let poison: Arc<dyn PoisonStore> = Arc::new(dead_letters);
    let indexer = Arc::new(SearchIndexer::new(Arc::new(search_store)));
    info!("Search database ready");

    let source = HttpAuctionSource::new(
        &config.reconciler.auction_service_url,
        config.reconciler.request_timeout,
    )?;
    let mut reconciler_config =
        ReconcilerConfig::builder().shutdown_grace(config.reconciler.shutdown_grace);
    if let Some(interval) = config.reconciler.interval {
        reconciler_config = reconciler_config.interval(interval);
    }
    let reconciler = CatchUpReconciler::new(
        Arc::new(source),
        Arc::clone(&indexer),
        reconciler_config.build(),
    );

    let event_bus: Arc<dyn EventBus> = Arc::new(
        RedpandaEventBus::builder()
            .brokers(&config.redpanda.brokers)
            .consumer_group(&config.redpanda.consumer_group)
            .auto_offset_reset(&config.redpanda.auto_offset_reset)
            .build()?,
    );
    let consumer = ConsumerWorker::new(
        Arc::clone(&indexer),
        event_bus,
        Arc::clone(&poison),
        TopicRouter::new(config.redpanda.topic_prefix.clone()),
        ConsumerConfig::builder()
            .retry(
                RetryPolicy::builder()
                    .max_retries(config.consumer.max_retries)
                    .initial_delay(config.consumer.initial_delay)
                    .max_delay(config.consumer.max_delay)
                    .build(),
            )
            .consumer_group(config.redpanda.consumer_group.clone())
            .build(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);

    let reconciler_rx = shutdown_rx.clone();
    let reconciler_task = tokio::spawn(async move { reconciler.run(reconciler_rx).await });

    // A consumer that stops on its own takes the service down with it so the
    // unacknowledged message is redelivered after restart.
    let consumer_task = {
        let shutdown_tx = Arc::clone(&shutdown_tx);
        let consumer_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let result = consumer.run(consumer_rx).await;
            if let Err(e) = &result {
                tracing::error!(error = %e, "Consumer stopped");
            }
            shutdown_tx.send(true).ok();
            result
        })
    };

    let state = SearchApiState::new(indexer, poison, Arc::new(SystemClock)).with_metrics(metrics);
    let app = search_router(state);

    let addr = config.server.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(address = %addr, "Search API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                () = shutdown_signal() => {},
                () = stopped(shutdown_rx) => {},
            }
        })
        .await?;

    shutdown_tx.send(true).ok();
    reconciler_task.await?;
    consumer_task.await??;

    info!("Search service stopped");
    Ok(())
}

/// Resolves once the shutdown flag is raised.
async fn stopped(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }
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
