//! Catch-up reconciler: repairs the read model from the authoritative service.
//!
//! The broker is the primary path; this is the backstop for events that were
//! never delivered. Each cycle reads the watermark (the newest
//! `last_applied_at` in the read model, or the Unix epoch when it is empty),
//! asks the authoritative service for every record modified strictly after
//! it, and applies each record through [`SearchIndexer::apply_record`], the
//! same monotonic rule the consumer uses.
//!
//! A cycle that cannot reach the authoritative service is skipped and the
//! next one tries again.

use crate::indexer::{ApplyError, SearchIndexer};
use chrono::{DateTime, Utc};
use gavel_core::projection::SearchStoreError;
use gavel_core::source::{AuctionSource, SourceError};
use gavel_runtime::metrics::ReconcilerMetrics;
use gavel_runtime::retry::{RetryPolicy, retry_with_predicate};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

/// Errors from a reconciliation cycle.
#[derive(Error, Debug)]
pub enum ReconcileError {
    /// The delta read failed after its retries.
    #[error("Delta read failed: {0}")]
    Source(#[from] SourceError),

    /// The read model could not be read or written.
    #[error("Search store: {0}")]
    Store(#[from] SearchStoreError),
}

/// Reconciler tuning.
///
/// # Default Values
///
/// - `interval`: `None` (startup only)
/// - `request_retry`: 3 retries starting at 500ms
/// - `shutdown_grace`: 5s
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcilerConfig {
    /// Pause between scheduled cycles; `None` runs only at startup
    pub interval: Option<Duration>,
    /// Retry budget for the delta-read request within one cycle
    pub request_retry: RetryPolicy,
    /// How long a running cycle may continue after shutdown; then it is abandoned
    pub shutdown_grace: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: None,
            request_retry: RetryPolicy::builder()
                .max_retries(3)
                .initial_delay(Duration::from_millis(500))
                .max_delay(Duration::from_secs(5))
                .build(),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl ReconcilerConfig {
    /// Create a new config builder.
    #[must_use]
    pub fn builder() -> ReconcilerConfigBuilder {
        ReconcilerConfigBuilder::default()
    }
}

/// Builder for [`ReconcilerConfig`].
#[derive(Debug, Clone, Default)]
pub struct ReconcilerConfigBuilder {
    config: ReconcilerConfig,
}

impl ReconcilerConfigBuilder {
    /// Reconcile every `interval` after the startup cycle.
    #[must_use]
    pub const fn interval(mut self, interval: Duration) -> Self {
        self.config.interval = Some(interval);
        self
    }

    /// Set the delta-read retry policy.
    #[must_use]
    pub fn request_retry(mut self, retry: RetryPolicy) -> Self {
        self.config.request_retry = retry;
        self
    }

    /// Set how long a running cycle may continue after shutdown.
    #[must_use]
    pub const fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.config.shutdown_grace = grace;
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> ReconcilerConfig {
        self.config
    }
}

/// Outcome of one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    /// The `modifiedSince` value sent
    pub watermark: DateTime<Utc>,
    /// Records returned by the authoritative service
    pub fetched: usize,
    /// Records that changed the read model
    pub repaired: usize,
    /// Records the read model already had
    pub unchanged: usize,
    /// Records rejected by validation
    pub rejected: usize,
}

/// Pulls missed changes straight from the authoritative service.
pub struct CatchUpReconciler {
    source: Arc<dyn AuctionSource>,
    indexer: Arc<SearchIndexer>,
    config: ReconcilerConfig,
}

impl CatchUpReconciler {
    /// Create a reconciler applying through `indexer`.
    #[must_use]
    pub fn new(
        source: Arc<dyn AuctionSource>,
        indexer: Arc<SearchIndexer>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            source,
            indexer,
            config,
        }
    }

    /// The watermark the next cycle will use.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::Store`] if the read model cannot be queried.
    pub async fn watermark(&self) -> Result<DateTime<Utc>, ReconcileError> {
        Ok(self
            .indexer
            .store()
            .watermark()
            .await?
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH))
    }

    /// Run one reconciliation cycle.
    ///
    /// # Errors
    ///
    /// - [`ReconcileError::Source`] if the delta read kept failing
    /// - [`ReconcileError::Store`] if the read model failed; records applied
    ///   before the failure stay applied
    pub async fn run_once(&self) -> Result<ReconcileReport, ReconcileError> {
        let watermark = self.watermark().await?;
        let records = retry_with_predicate(
            &self.config.request_retry,
            || self.source.fetch_modified_since(watermark),
            SourceError::is_transient,
        )
        .await?;

        let mut report = ReconcileReport {
            watermark,
            fetched: records.len(),
            repaired: 0,
            unchanged: 0,
            rejected: 0,
        };

        for record in &records {
            match self.indexer.apply_record(record).await {
                Ok(outcome) if outcome.changed() => report.repaired += 1,
                Ok(_) => report.unchanged += 1,
                Err(ApplyError::Invalid(e)) => {
                    tracing::warn!(
                        auction_id = %record.id,
                        error = %e,
                        "Authoritative record failed validation, not applied"
                    );
                    report.rejected += 1;
                }
                Err(ApplyError::Store(e)) => return Err(e.into()),
            }
        }

        ReconcilerMetrics::record_repaired(report.repaired);
        tracing::info!(
            watermark = %report.watermark,
            fetched = report.fetched,
            repaired = report.repaired,
            unchanged = report.unchanged,
            rejected = report.rejected,
            "Reconciliation cycle complete"
        );
        Ok(report)
    }

    /// Run one cycle, logging instead of failing.
    ///
    /// Returns `None` when the cycle was skipped.
    pub async fn run_at_startup(&self) -> Option<ReconcileReport> {
        match self.run_once().await {
            Ok(report) => Some(report),
            Err(e) => {
                ReconcilerMetrics::record_skipped_cycle();
                tracing::warn!(error = %e, "Reconciliation cycle skipped");
                None
            }
        }
    }

    /// Reconcile at startup, then every `interval` until `shutdown` turns `true`.
    ///
    /// Without an interval this returns after the startup cycle. A cycle that
    /// is running when shutdown arrives gets `shutdown_grace` to finish and is
    /// then abandoned; each record is applied in a single store write, so an
    /// abandoned cycle leaves no half-applied document.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let completed = self.cycle_until_shutdown(&mut shutdown).await;
        if let (true, Some(interval)) = (completed, self.config.interval) {
            self.run_scheduled(interval, &mut shutdown).await;
        }
        tracing::info!("Reconciler stopped");
    }

    async fn run_scheduled(&self, interval: Duration, shutdown: &mut watch::Receiver<bool>) {
        tracing::info!(interval_ms = interval.as_millis(), "Scheduling reconciliation");

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        while !*shutdown.borrow() {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.cycle_until_shutdown(shutdown).await {
                        return;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }

    /// Run one cycle; `false` when shutdown arrived before or during it.
    async fn cycle_until_shutdown(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        if *shutdown.borrow() {
            return false;
        }

        let cycle = self.run_at_startup();
        tokio::pin!(cycle);

        tokio::select! {
            _ = &mut cycle => true,
            _ = shutdown.changed() => {
                tracing::info!(
                    grace_ms = self.config.shutdown_grace.as_millis(),
                    "Shutdown signal received, finishing reconciliation cycle"
                );
                if tokio::time::timeout(self.config.shutdown_grace, &mut cycle).await.is_err() {
                    tracing::warn!("Shutdown grace elapsed, abandoning reconciliation cycle");
                }
                false
            }
        }
    }
}
