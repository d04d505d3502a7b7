//! Broker abstraction between the outbox dispatcher and the search consumers.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │ Business write  │
//! │ + outbox row    │◄─── One transaction
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │ Outbox          │
//! │ Dispatcher      │◄─── Marks delivered after ack
//! └────────┬────────┘
//!          │ publish(topic, event keyed by auction id)
//!          ▼
//! ┌─────────────────┐
//! │   Event Bus     │◄─── At-least-once delivery
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │ Idempotent      │
//! │ Consumer        │◄─── Tolerates duplicates and reordering
//! └─────────────────┘
//! ```
//!
//! # Key Principles
//!
//! - **Outbox first**: events are committed with the business row before publishing
//! - **At-least-once delivery**: events may be delivered multiple times
//! - **Ordered per key**: events carrying the same key keep their relative order
//!
//! # Implementations
//!
//! - `InMemoryEventBus` in `gavel-testing`, with publish fault injection
//! - `RedpandaEventBus` in `gavel-redpanda`, for production

use crate::event::SerializedEvent;
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during event bus operations.
#[derive(Error, Debug, Clone)]
pub enum EventBusError {
    /// Failed to connect to the event bus
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish an event to a topic
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to subscribe to topics
    #[error("Subscription failed for topics {topics:?}: {reason}")]
    SubscriptionFailed {
        /// The topics that failed to subscribe
        topics: Vec<String>,
        /// The reason for failure
        reason: String,
    },

    /// Failed to deserialize an event
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    /// Topic not found or invalid
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    /// Consumer group error
    #[error("Consumer group error: {0}")]
    ConsumerGroupError(String),

    /// Network or transport error
    #[error("Transport error: {0}")]
    TransportError(String),

    /// Generic error for other failures
    #[error("Event bus error: {0}")]
    Other(String),
}

impl EventBusError {
    /// Whether retrying the same operation later may succeed.
    ///
    /// Malformed messages and invalid topics never become valid by waiting.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        !matches!(
            self,
            Self::DeserializationFailed(_) | Self::InvalidTopic(_)
        )
    }
}

/// Stream of events from subscriptions.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<SerializedEvent, EventBusError>> + Send>>;

/// Trait for event bus implementations.
///
/// # Ordering
///
/// Implementations must deliver events published with the same
/// [`SerializedEvent::key`] to a subscriber in publish order (Kafka does this by
/// hashing the key to a partition). No order is promised across keys.
///
/// # Dyn Compatibility
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns instead of `async fn`
/// so it can be shared as `Arc<dyn EventBus>` between the dispatcher and
/// the consumer workers.
pub trait EventBus: Send + Sync {
    /// Publish an event to a topic.
    ///
    /// Resolves only after the broker has acknowledged the message. The
    /// dispatcher relies on this to flip an outbox entry to delivered.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::PublishFailed`] if the publish operation fails.
    fn publish(
        &self,
        topic: &str,
        event: &SerializedEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>>;

    /// Subscribe to one or more topics and receive a stream of events.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::SubscriptionFailed`] if subscription fails.
    ///
    /// # Consumer Groups
    ///
    /// Implementations typically use consumer groups to enable multiple instances
    /// of the same subscriber to share the workload. Each consumer group receives
    /// its own copy of every event.
    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<EventStream, EventBusError>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_failures_are_transient() {
        assert!(EventBusError::ConnectionFailed("down".into()).is_transient());
        assert!(
            EventBusError::PublishFailed {
                topic: "t".into(),
                reason: "timeout".into()
            }
            .is_transient()
        );
        assert!(!EventBusError::DeserializationFailed("bad".into()).is_transient());
        assert!(!EventBusError::InvalidTopic("??".into()).is_transient());
    }
}
