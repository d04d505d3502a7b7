//! Prometheus metrics for the synchronization layer.
//!
//! Components record through the small recorder types below; the service
//! binaries install the Prometheus recorder once at startup and expose
//! [`MetricsRecorder::render`] on `/metrics`.
//!
//! # Example
//!
//! ```rust,no_run
//! use gavel_runtime::metrics::MetricsRecorder;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let recorder = MetricsRecorder::install()?;
//! let body = recorder.render();
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Installed Prometheus recorder.
#[derive(Clone)]
pub struct MetricsRecorder {
    handle: PrometheusHandle,
}

impl MetricsRecorder {
    /// Describe every metric and install the global Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Install`] if a recorder is already installed.
    pub fn install() -> Result<Self, MetricsError> {
        register_metrics();

        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .install_recorder()
            .map_err(|e| MetricsError::Install(e.to_string()))?;

        tracing::info!("Prometheus metrics recorder installed");
        Ok(Self { handle })
    }

    /// Render current metrics in Prometheus text format.
    #[must_use]
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

fn register_metrics() {
    describe_counter!(
        "outbox.dispatch.published",
        "Outbox entries published and marked delivered"
    );
    describe_counter!(
        "outbox.dispatch.failed",
        "Publish attempts that left the entry pending"
    );
    describe_counter!(
        "outbox.dispatch.rejected",
        "Outbox entries marked failed because their payload cannot be decoded"
    );
    describe_histogram!(
        "outbox.dispatch.batch_duration_seconds",
        "Time taken to dispatch one outbox batch"
    );
    describe_gauge!("outbox.pending", "Outbox entries awaiting delivery");

    describe_counter!("consumer.applied", "Events that changed the read model");
    describe_counter!(
        "consumer.skipped",
        "Events ignored because the read model was already newer"
    );
    describe_counter!("consumer.poisoned", "Events parked on the dead-letter path");

    describe_counter!(
        "reconciler.repaired",
        "Records the catch-up reconciler wrote to the read model"
    );
    describe_counter!(
        "reconciler.skipped_cycles",
        "Reconciliation cycles skipped because the source was unreachable"
    );
}

/// Dispatcher metrics recorder.
pub struct OutboxMetrics;

impl OutboxMetrics {
    /// Record a delivered entry.
    pub fn record_published(topic: &str) {
        counter!("outbox.dispatch.published", "topic" => topic.to_string()).increment(1);
    }

    /// Record a failed publish.
    pub fn record_publish_failure(topic: &str) {
        counter!("outbox.dispatch.failed", "topic" => topic.to_string()).increment(1);
    }

    /// Record an undecodable entry.
    pub fn record_rejected() {
        counter!("outbox.dispatch.rejected").increment(1);
    }

    /// Record one dispatch batch.
    pub fn record_batch(duration: Duration) {
        histogram!("outbox.dispatch.batch_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record the pending backlog.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_pending(pending: i64) {
        gauge!("outbox.pending").set(pending as f64);
    }
}

/// Consumer metrics recorder.
pub struct ConsumerMetrics;

impl ConsumerMetrics {
    /// Record an event that changed the read model.
    pub fn record_applied(event_type: &str) {
        counter!("consumer.applied", "event_type" => event_type.to_string()).increment(1);
    }

    /// Record an event ignored as stale or duplicate.
    pub fn record_skipped(event_type: &str) {
        counter!("consumer.skipped", "event_type" => event_type.to_string()).increment(1);
    }

    /// Record a parked event.
    pub fn record_poisoned(event_type: &str, kind: &'static str) {
        counter!(
            "consumer.poisoned",
            "event_type" => event_type.to_string(),
            "kind" => kind
        )
        .increment(1);
    }
}

/// Reconciler metrics recorder.
pub struct ReconcilerMetrics;

impl ReconcilerMetrics {
    /// Record records written by a reconciliation cycle.
    pub fn record_repaired(count: usize) {
        counter!("reconciler.repaired").increment(count as u64);
    }

    /// Record a skipped cycle.
    pub fn record_skipped_cycle() {
        counter!("reconciler.skipped_cycles").increment(1);
    }
}
