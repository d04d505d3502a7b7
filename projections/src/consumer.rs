//! Idempotent consumer: applies auction events from the bus to the read model.
//!
//! # Overview
//!
//! ```text
//! EventBus ──▶ decode ──▶ handler table ──▶ SearchIndexer
//!                │              │                 │
//!                │ malformed    │ no handler      │ permanent / retries exhausted
//!                ▼              ▼                 ▼
//!           ┌─────────────────────────────────────────┐
//!           │              PoisonStore                │
//!           └─────────────────────────────────────────┘
//! ```
//!
//! Each message is decoded and routed by its event type through an explicit
//! handler table. Transient store failures are retried in place with bounded
//! backoff. A message that cannot succeed (undecodable, invalid, unhandled)
//! or that exhausted its retries is parked with its raw bytes and the worker
//! moves on, so one bad message never blocks the ones behind it.

use crate::indexer::{ApplyError, ApplyOutcome, SearchIndexer};
use futures::StreamExt;
use futures::future::BoxFuture;
use gavel_core::event::{EventEnvelope, EventType, SerializedEvent};
use gavel_core::event_bus::{EventBus, EventBusError};
use gavel_core::poison::{FailureKind, NewPoisonedEvent, PoisonStore, PoisonStoreError};
use gavel_core::routing::TopicRouter;
use gavel_runtime::metrics::ConsumerMetrics;
use gavel_runtime::retry::{RetryPolicy, retry_with_backoff, retry_with_predicate};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;
use tokio::sync::watch;

/// Errors that stop the consumer.
///
/// Apply failures never surface here: they end in the poison store.
#[derive(Error, Debug)]
pub enum ConsumeError {
    /// Subscribing to the event bus failed.
    #[error("Subscription failed: {0}")]
    Subscribe(#[from] EventBusError),

    /// An event could not be parked, so it would otherwise be lost.
    #[error("Could not park event: {0}")]
    Park(#[from] PoisonStoreError),
}

/// A function applying one event type.
pub type Handler =
    for<'a> fn(&'a SearchIndexer, &'a EventEnvelope) -> BoxFuture<'a, Result<ApplyOutcome, ApplyError>>;

fn on_snapshot<'a>(
    indexer: &'a SearchIndexer,
    envelope: &'a EventEnvelope,
) -> BoxFuture<'a, Result<ApplyOutcome, ApplyError>> {
    Box::pin(indexer.apply(envelope))
}

fn on_deleted<'a>(
    indexer: &'a SearchIndexer,
    envelope: &'a EventEnvelope,
) -> BoxFuture<'a, Result<ApplyOutcome, ApplyError>> {
    Box::pin(async move {
        let outcome = indexer.apply(envelope).await?;
        if outcome.changed() {
            tracing::info!(auction_id = %envelope.auction_id, "Auction removed from search");
        }
        Ok(outcome)
    })
}

fn on_finished<'a>(
    indexer: &'a SearchIndexer,
    envelope: &'a EventEnvelope,
) -> BoxFuture<'a, Result<ApplyOutcome, ApplyError>> {
    Box::pin(async move {
        let outcome = indexer.apply(envelope).await?;
        if let (true, Some(snapshot)) = (outcome.changed(), &envelope.snapshot) {
            tracing::info!(
                auction_id = %envelope.auction_id,
                status = %snapshot.status,
                winner = snapshot.winner.as_deref().unwrap_or("-"),
                "Auction settled in search"
            );
        }
        Ok(outcome)
    })
}

/// Routing table from event type to handler.
///
/// Event types without a registered handler are parked as malformed.
#[derive(Clone)]
pub struct HandlerTable {
    handlers: HashMap<EventType, Handler>,
}

impl HandlerTable {
    /// A table with no handlers.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// The table the search service runs with: every event type is handled.
    #[must_use]
    pub fn standard() -> Self {
        Self::empty()
            .register(EventType::Created, on_snapshot)
            .register(EventType::Updated, on_snapshot)
            .register(EventType::Deleted, on_deleted)
            .register(EventType::Finished, on_finished)
    }

    /// Route `event_type` to `handler`, replacing any earlier registration.
    #[must_use]
    pub fn register(mut self, event_type: EventType, handler: Handler) -> Self {
        self.handlers.insert(event_type, handler);
        self
    }

    /// Whether `event_type` has a handler.
    #[must_use]
    pub fn handles(&self, event_type: EventType) -> bool {
        self.handlers.contains_key(&event_type)
    }

    fn get(&self, event_type: EventType) -> Option<Handler> {
        self.handlers.get(&event_type).copied()
    }
}

impl Default for HandlerTable {
    fn default() -> Self {
        Self::standard()
    }
}

/// Consumer tuning.
///
/// # Default Values
///
/// - `retry`: [`RetryPolicy::default`] (3 retries, 100ms doubling)
/// - `consumer_group`: `search-service`
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerConfig {
    /// Retry budget for transient apply failures
    pub retry: RetryPolicy,
    /// Broker consumer group
    pub consumer_group: String,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            consumer_group: "search-service".to_string(),
        }
    }
}

impl ConsumerConfig {
    /// Create a new config builder.
    #[must_use]
    pub fn builder() -> ConsumerConfigBuilder {
        ConsumerConfigBuilder::default()
    }
}

/// Builder for [`ConsumerConfig`].
#[derive(Debug, Clone, Default)]
pub struct ConsumerConfigBuilder {
    config: ConsumerConfig,
}

impl ConsumerConfigBuilder {
    /// Set the retry policy.
    #[must_use]
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.config.retry = retry;
        self
    }

    /// Set the consumer group.
    #[must_use]
    pub fn consumer_group(mut self, group: impl Into<String>) -> Self {
        self.config.consumer_group = group.into();
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> ConsumerConfig {
        self.config
    }
}

/// What happened to one message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// The event was applied (or found already applied).
    Applied(ApplyOutcome),
    /// The event was parked in the poison store.
    Parked {
        /// Dead-letter entry id
        id: i64,
        /// Why it was parked
        kind: FailureKind,
    },
}

/// Subscribes to every auction topic and applies what arrives.
///
/// # Example
///
/// ```ignore
/// let consumer = ConsumerWorker::new(indexer, event_bus, poison_store, router, ConsumerConfig::default());
/// let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
/// tokio::spawn(async move { consumer.run(shutdown_rx).await });
/// ```
pub struct ConsumerWorker {
    indexer: Arc<SearchIndexer>,
    event_bus: Arc<dyn EventBus>,
    poison: Arc<dyn PoisonStore>,
    router: TopicRouter,
    handlers: HandlerTable,
    config: ConsumerConfig,
}

impl ConsumerWorker {
    /// Create a worker using the standard handler table.
    #[must_use]
    pub fn new(
        indexer: Arc<SearchIndexer>,
        event_bus: Arc<dyn EventBus>,
        poison: Arc<dyn PoisonStore>,
        router: TopicRouter,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            indexer,
            event_bus,
            poison,
            router,
            handlers: HandlerTable::standard(),
            config,
        }
    }

    /// Replace the handler table.
    #[must_use]
    pub fn with_handlers(mut self, handlers: HandlerTable) -> Self {
        self.handlers = handlers;
        self
    }

    /// The active configuration.
    #[must_use]
    pub const fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Process one message to completion.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumeError::Park`] only if the message had to be parked
    /// and the poison store kept failing.
    pub async fn handle(&self, message: &SerializedEvent) -> Result<Disposition, ConsumeError> {
        let topic = self.topic_of(message);

        let envelope = match EventEnvelope::from_serialized(message) {
            Ok(envelope) => envelope,
            Err(e) => {
                return self
                    .park(topic, message, FailureKind::Malformed, e.to_string(), 1)
                    .await;
            }
        };

        let Some(handler) = self.handlers.get(envelope.event_type) else {
            let reason = format!("no handler registered for {}", envelope.event_type);
            return self
                .park(topic, message, FailureKind::Malformed, reason, 1)
                .await;
        };

        let attempts = AtomicU32::new(0);
        let indexer = &*self.indexer;
        let decoded = &envelope;
        let result = retry_with_predicate(
            &self.config.retry,
            || {
                attempts.fetch_add(1, Ordering::Relaxed);
                handler(indexer, decoded)
            },
            ApplyError::is_transient,
        )
        .await;
        let attempts = attempts.load(Ordering::Relaxed);

        match result {
            Ok(outcome) => {
                if outcome.changed() {
                    ConsumerMetrics::record_applied(envelope.event_type.as_str());
                } else {
                    ConsumerMetrics::record_skipped(envelope.event_type.as_str());
                }
                Ok(Disposition::Applied(outcome))
            }
            Err(e) if e.is_transient() => {
                tracing::error!(
                    auction_id = %envelope.auction_id,
                    event_type = %envelope.event_type,
                    attempt = attempts,
                    error = %e,
                    "Apply retries exhausted"
                );
                self.indexer.mark_exhausted(envelope.auction_id);
                self.park(topic, message, FailureKind::Exhausted, e.to_string(), attempts)
                    .await
            }
            Err(e) => {
                self.park(topic, message, FailureKind::Malformed, e.to_string(), attempts)
                    .await
            }
        }
    }

    /// Consume until `shutdown` turns `true` or the stream ends.
    ///
    /// A message being processed when shutdown arrives is finished first.
    ///
    /// # Errors
    ///
    /// - [`ConsumeError::Subscribe`] if the subscription cannot be opened
    /// - [`ConsumeError::Park`] if a message could not be parked; the
    ///   worker stops so the broker redelivers it after restart
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), ConsumeError> {
        let topics = self.router.topics();
        let mut stream = self.event_bus.subscribe(&topics).await?;
        tracing::info!(
            consumer_group = %self.config.consumer_group,
            topics = ?topics,
            "Starting consumer"
        );

        while !*shutdown.borrow() {
            tokio::select! {
                _ = shutdown.changed() => {}
                next = stream.next() => match next {
                    Some(Ok(message)) => {
                        self.handle(&message).await?;
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Event stream error");
                    }
                    None => {
                        tracing::warn!("Event stream ended");
                        break;
                    }
                },
            }
        }

        tracing::info!("Consumer stopped");
        Ok(())
    }

    fn topic_of(&self, message: &SerializedEvent) -> String {
        message
            .event_type
            .parse::<EventType>()
            .map_or_else(
                |_| format!("{}.unroutable", self.router.prefix()),
                |event_type| self.router.topic_for(event_type).to_string(),
            )
    }

    async fn park(
        &self,
        topic: String,
        message: &SerializedEvent,
        kind: FailureKind,
        error_message: String,
        attempts: u32,
    ) -> Result<Disposition, ConsumeError> {
        tracing::warn!(
            topic = %topic,
            event_type = %message.event_type,
            key = %message.key,
            kind = kind.as_str(),
            attempt = attempts,
            error = %error_message,
            "Parking event"
        );
        ConsumerMetrics::record_poisoned(&message.event_type, kind.as_str());

        let entry = NewPoisonedEvent {
            topic,
            event: message.clone(),
            kind,
            error_message,
            attempts,
        };
        let id = retry_with_backoff(&self.config.retry, || self.poison.park(entry.clone())).await?;
        Ok(Disposition::Parked { id, kind })
    }
}
