//! Outbox dispatcher: moves committed events from the outbox to the broker.
//!
//! # Overview
//!
//! ```text
//! ┌──────────────┐  fetch_pending(batch_size)  ┌──────────────┐
//! │ OutboxStore  │ ──────────────────────────▶ │  Dispatcher  │
//! │              │ ◀────────────────────────── │              │
//! └──────────────┘  mark_delivered(seq)        └──────┬───────┘
//!                                                      │ publish, keyed by auction id
//!                                                      ▼
//!                                              ┌──────────────┐
//!                                              │   EventBus   │
//!                                              └──────────────┘
//! ```
//!
//! Each poll takes a bounded batch of pending entries in sequence order and
//! groups them by auction identity. Groups are published concurrently, at
//! most `max_in_flight` at a time; entries within a group are published one
//! after another. An entry is marked delivered only after the broker
//! acknowledged it. When a publish fails, the entry and every later entry of
//! the same identity stay pending for the next poll, so per-identity order
//! survives retries.
//!
//! # Shutdown
//!
//! On shutdown the in-flight batch gets `shutdown_grace` to finish. Anything
//! still running after that is dropped between statements: an entry that was
//! acknowledged but not yet marked is published again after restart, which
//! consumers tolerate.

use crate::metrics::OutboxMetrics;
use futures::StreamExt;
use gavel_core::auction::AuctionId;
use gavel_core::event::SerializedEvent;
use gavel_core::event_bus::EventBus;
use gavel_core::outbox::{OutboxEntry, OutboxError, OutboxStore};
use gavel_core::routing::TopicRouter;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;

/// Errors from a dispatch cycle.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// The outbox could not be read.
    #[error("Outbox error: {0}")]
    Outbox(#[from] OutboxError),

    /// The configuration is unusable.
    #[error("Invalid dispatcher configuration: {0}")]
    InvalidConfig(String),
}

/// Dispatcher tuning.
///
/// # Default Values
///
/// - `poll_interval`: 500ms
/// - `batch_size`: 100
/// - `max_in_flight`: 16
/// - `shutdown_grace`: 10 seconds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Pause between polls when the outbox is drained
    pub poll_interval: Duration,
    /// Maximum entries fetched per poll
    pub batch_size: usize,
    /// Maximum identities published concurrently
    pub max_in_flight: usize,
    /// Time allowed for in-flight publishes to finish on shutdown
    pub shutdown_grace: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            batch_size: 100,
            max_in_flight: 16,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl DispatcherConfig {
    /// Create a new config builder.
    #[must_use]
    pub fn builder() -> DispatcherConfigBuilder {
        DispatcherConfigBuilder::default()
    }

    /// Reject values the dispatcher cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::InvalidConfig`] for a zero batch size or
    /// a zero in-flight window.
    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.batch_size == 0 {
            return Err(DispatchError::InvalidConfig(
                "batch_size must be at least 1".to_string(),
            ));
        }
        if self.max_in_flight == 0 {
            return Err(DispatchError::InvalidConfig(
                "max_in_flight must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`DispatcherConfig`].
#[derive(Debug, Clone, Default)]
pub struct DispatcherConfigBuilder {
    config: DispatcherConfig,
}

impl DispatcherConfigBuilder {
    /// Set the idle poll interval.
    #[must_use]
    pub const fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    /// Set the batch size.
    #[must_use]
    pub const fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = size;
        self
    }

    /// Set the in-flight window.
    #[must_use]
    pub const fn max_in_flight(mut self, window: usize) -> Self {
        self.config.max_in_flight = window;
        self
    }

    /// Set the shutdown grace period.
    #[must_use]
    pub const fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.config.shutdown_grace = grace;
        self
    }

    /// Build and validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::InvalidConfig`] if validation fails.
    pub fn build(self) -> Result<DispatcherConfig, DispatchError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Outcome of one dispatch cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Entries fetched
    pub fetched: usize,
    /// Entries published and marked delivered
    pub published: usize,
    /// Entries whose publish or mark failed; still pending
    pub failed: usize,
    /// Entries not attempted because an earlier entry of the same identity failed
    pub held_back: usize,
    /// Entries marked failed because their payload is undecodable
    pub rejected: usize,
    /// Entries another dispatcher instance had already marked
    pub already_delivered: usize,
}

impl DispatchReport {
    /// Whether the batch came back full, meaning more may be waiting.
    #[must_use]
    pub const fn was_full(&self, batch_size: usize) -> bool {
        self.fetched >= batch_size
    }

    fn merge(&mut self, other: Self) {
        self.published += other.published;
        self.failed += other.failed;
        self.held_back += other.held_back;
        self.already_delivered += other.already_delivered;
    }
}

fn log_result(result: &Result<DispatchReport, DispatchError>) {
    if let Err(e) = result {
        tracing::error!(error = %e, "Outbox dispatch cycle failed");
    }
}

struct Outgoing {
    sequence_id: i64,
    topic: String,
    message: SerializedEvent,
}

/// Publishes pending outbox entries to the event bus.
///
/// # Example
///
/// ```ignore
/// let dispatcher = OutboxDispatcher::new(outbox, event_bus, TopicRouter::new("auctions"), config)?;
/// let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
/// tokio::spawn(async move { dispatcher.run(shutdown_rx).await });
/// // ...
/// shutdown_tx.send(true).ok();
/// ```
pub struct OutboxDispatcher {
    outbox: Arc<dyn OutboxStore>,
    event_bus: Arc<dyn EventBus>,
    router: TopicRouter,
    config: DispatcherConfig,
}

impl OutboxDispatcher {
    /// Create a dispatcher.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::InvalidConfig`] if `config` fails validation.
    pub fn new(
        outbox: Arc<dyn OutboxStore>,
        event_bus: Arc<dyn EventBus>,
        router: TopicRouter,
        config: DispatcherConfig,
    ) -> Result<Self, DispatchError> {
        config.validate()?;
        Ok(Self {
            outbox,
            event_bus,
            router,
            config,
        })
    }

    /// The active configuration.
    #[must_use]
    pub const fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Dispatch one batch of pending entries.
    ///
    /// Publish failures are not errors: they are counted in the report and
    /// the affected entries stay pending.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Outbox`] if the pending entries cannot be fetched.
    pub async fn dispatch_batch(&self) -> Result<DispatchReport, DispatchError> {
        let started = Instant::now();
        let entries = self.outbox.fetch_pending(self.config.batch_size).await?;

        let mut report = DispatchReport {
            fetched: entries.len(),
            ..DispatchReport::default()
        };
        if entries.is_empty() {
            return Ok(report);
        }

        let (groups, rejected) = self.group_by_identity(entries).await;
        report.rejected = rejected;

        let outcomes: Vec<DispatchReport> = futures::stream::iter(groups)
            .map(|group| self.publish_group(group))
            .buffer_unordered(self.config.max_in_flight)
            .collect()
            .await;

        for outcome in outcomes {
            report.merge(outcome);
        }

        OutboxMetrics::record_batch(started.elapsed());
        tracing::debug!(
            fetched = report.fetched,
            published = report.published,
            failed = report.failed,
            held_back = report.held_back,
            rejected = report.rejected,
            "Dispatched outbox batch"
        );
        Ok(report)
    }

    /// Split a batch into per-identity queues, keeping sequence order within
    /// each queue. Undecodable entries are marked failed on the way.
    async fn group_by_identity(&self, entries: Vec<OutboxEntry>) -> (Vec<Vec<Outgoing>>, usize) {
        let mut groups: Vec<Vec<Outgoing>> = Vec::new();
        let mut index: HashMap<AuctionId, usize> = HashMap::new();
        let mut rejected = 0;

        for entry in entries {
            match entry.decode() {
                Ok((envelope, message)) => {
                    let outgoing = Outgoing {
                        sequence_id: entry.sequence_id,
                        topic: self.router.topic_for(envelope.event_type).to_string(),
                        message,
                    };
                    let slot = *index.entry(envelope.auction_id).or_insert_with(|| {
                        groups.push(Vec::new());
                        groups.len() - 1
                    });
                    groups[slot].push(outgoing);
                }
                Err(e) => {
                    tracing::error!(
                        sequence_id = entry.sequence_id,
                        event_type = %entry.event_type,
                        payload_bytes = entry.payload.len(),
                        error = %e,
                        "Outbox entry cannot be decoded, marking failed"
                    );
                    OutboxMetrics::record_rejected();
                    rejected += 1;
                    if let Err(mark_err) = self
                        .outbox
                        .mark_failed(entry.sequence_id, &e.to_string())
                        .await
                    {
                        tracing::warn!(
                            sequence_id = entry.sequence_id,
                            error = %mark_err,
                            "Failed to mark outbox entry failed"
                        );
                    }
                }
            }
        }

        (groups, rejected)
    }

    async fn publish_group(&self, group: Vec<Outgoing>) -> DispatchReport {
        let mut report = DispatchReport::default();
        let total = group.len();

        for (position, outgoing) in group.into_iter().enumerate() {
            let delivered = match self
                .event_bus
                .publish(&outgoing.topic, &outgoing.message)
                .await
            {
                Ok(()) => self.mark_delivered(&outgoing, &mut report).await,
                Err(e) => {
                    tracing::warn!(
                        sequence_id = outgoing.sequence_id,
                        topic = %outgoing.topic,
                        auction_id = %outgoing.message.key,
                        error = %e,
                        "Publish failed, entry stays pending"
                    );
                    OutboxMetrics::record_publish_failure(&outgoing.topic);
                    false
                }
            };

            if !delivered {
                report.failed += 1;
                report.held_back += total - position - 1;
                break;
            }
        }

        report
    }

    async fn mark_delivered(&self, outgoing: &Outgoing, report: &mut DispatchReport) -> bool {
        match self.outbox.mark_delivered(outgoing.sequence_id).await {
            Ok(true) => {
                tracing::debug!(
                    sequence_id = outgoing.sequence_id,
                    topic = %outgoing.topic,
                    auction_id = %outgoing.message.key,
                    "Outbox entry delivered"
                );
                OutboxMetrics::record_published(&outgoing.topic);
                report.published += 1;
                true
            }
            Ok(false) => {
                tracing::debug!(
                    sequence_id = outgoing.sequence_id,
                    "Outbox entry already delivered by another dispatcher"
                );
                report.already_delivered += 1;
                true
            }
            Err(e) => {
                tracing::warn!(
                    sequence_id = outgoing.sequence_id,
                    error = %e,
                    "Published but could not mark delivered; will republish"
                );
                false
            }
        }
    }

    /// Poll and dispatch until `shutdown` turns `true`.
    ///
    /// A full batch is followed immediately by another poll; otherwise the
    /// loop waits `poll_interval`. Outbox read errors are logged and retried
    /// on the next poll. Never returns an error: delivery problems must not
    /// stop the service.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            poll_interval_ms = self.config.poll_interval.as_millis(),
            batch_size = self.config.batch_size,
            max_in_flight = self.config.max_in_flight,
            "Starting outbox dispatcher"
        );

        while !*shutdown.borrow() {
            let batch = self.dispatch_batch();
            tokio::pin!(batch);

            let result = tokio::select! {
                result = &mut batch => Some(result),
                _ = shutdown.changed() => {
                    tracing::info!(
                        grace_ms = self.config.shutdown_grace.as_millis(),
                        "Shutdown signal received, draining in-flight publishes"
                    );
                    if let Ok(result) = tokio::time::timeout(self.config.shutdown_grace, &mut batch).await {
                        log_result(&result);
                    } else {
                        tracing::warn!("Shutdown grace elapsed, abandoning in-flight publishes");
                    }
                    break;
                }
            };

            let backlog = result.is_some_and(|result| {
                log_result(&result);
                matches!(result, Ok(report) if report.was_full(self.config.batch_size) && report.failed == 0)
            });
            if backlog {
                continue;
            }

            tokio::select! {
                () = tokio::time::sleep(self.config.poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }

        tracing::info!("Outbox dispatcher stopped");
    }

    /// Report the pending backlog to metrics and return it.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Outbox`] if the count query fails.
    pub async fn pending(&self) -> Result<i64, DispatchError> {
        let pending = self.outbox.count_pending().await?;
        OutboxMetrics::record_pending(pending);
        Ok(pending)
    }
}
