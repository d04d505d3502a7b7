//! Redpanda event bus for the auction platform.
//!
//! Implements [`EventBus`] from `gavel-core` on top of rdkafka, so it works
//! against Redpanda or any other Kafka-compatible broker.
//!
//! # Message Layout
//!
//! | Kafka field          | Source                                  |
//! |----------------------|-----------------------------------------|
//! | key                  | [`SerializedEvent::key`] (auction id)   |
//! | payload              | [`SerializedEvent::data`] (envelope)    |
//! | `event-type` header  | [`SerializedEvent::event_type`]         |
//! | `event-version` header | [`SerializedEvent::event_version`]    |
//!
//! Keying by auction id sends every event of one auction to the same
//! partition, which is what gives consumers per-auction ordering.
//!
//! # Delivery Semantics
//!
//! **Publish** resolves after the broker acknowledges the write (`acks=all`,
//! idempotent producer). The outbox dispatcher marks an entry delivered only
//! after that.
//!
//! **Subscribe** is at-least-once with manual commits. A message's offset is
//! committed when the subscriber polls for the next one, i.e. after it has
//! finished handling the previous message. If the subscriber stops or
//! crashes first, the message is redelivered.
//!
//! Messages are never rejected at this layer. A record with missing headers
//! or payload is still yielded so the consumer can park its raw bytes.
//!
//! # Example
//!
//! ```no_run
//! use gavel_redpanda::RedpandaEventBus;
//! use gavel_core::event_bus::EventBus;
//! use gavel_core::event::SerializedEvent;
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let event_bus = RedpandaEventBus::builder()
//!     .brokers("localhost:9092")
//!     .consumer_group("search-service")
//!     .build()?;
//!
//! let event = SerializedEvent::new(
//!     "AuctionDeleted".to_string(),
//!     1,
//!     "4f7e0b7c-2b43-4a0c-9d4e-3f1f6f8b9b10".to_string(),
//!     vec![1, 2, 3],
//! );
//! event_bus.publish("auctions.record-deleted", &event).await?;
//!
//! let mut stream = event_bus.subscribe(&["auctions.record-deleted"]).await?;
//! while let Some(result) = stream.next().await {
//!     match result {
//!         Ok(event) => println!("Received: {}", event.event_type),
//!         Err(e) => eprintln!("Error: {e}"),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use gavel_core::event::SerializedEvent;
use gavel_core::event_bus::{EventBus, EventBusError, EventStream};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Header carrying [`SerializedEvent::event_type`].
pub const EVENT_TYPE_HEADER: &str = "event-type";

/// Header carrying [`SerializedEvent::event_version`] as a decimal string.
pub const EVENT_VERSION_HEADER: &str = "event-version";

/// Redpanda event bus implementation.
///
/// # Configuration
///
/// - **Broker addresses**: Bootstrap servers (required)
/// - **Producer settings**: Acks, compression, timeout
/// - **Consumer group**: Explicit ID or derived from the subscribed topics
/// - **Offset reset**: Where new groups start reading (default: "earliest")
///
/// # Example
///
/// ```no_run
/// use gavel_redpanda::RedpandaEventBus;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let event_bus = RedpandaEventBus::new("localhost:9092")?;
///
/// let event_bus = RedpandaEventBus::builder()
///     .brokers("localhost:9092,localhost:9093")
///     .compression("lz4")
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RedpandaEventBus {
    producer: FutureProducer,
    brokers: String,
    timeout: Duration,
    consumer_group: Option<String>,
    auto_offset_reset: String,
}

impl RedpandaEventBus {
    /// Create a new Redpanda event bus with default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if the producer cannot be created.
    pub fn new(brokers: &str) -> Result<Self, EventBusError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a new builder for configuring the event bus.
    #[must_use]
    pub fn builder() -> RedpandaEventBusBuilder {
        RedpandaEventBusBuilder::default()
    }

    /// Get a reference to the brokers string.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    /// Consumer group used by [`EventBus::subscribe`] for `topics`.
    #[must_use]
    pub fn consumer_group_for(&self, topics: &[String]) -> String {
        self.consumer_group.clone().unwrap_or_else(|| {
            let mut sorted_topics = topics.to_vec();
            sorted_topics.sort();
            format!("gavel-{}", sorted_topics.join("-"))
        })
    }
}

/// Builder for configuring a [`RedpandaEventBus`].
#[derive(Default)]
pub struct RedpandaEventBusBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    consumer_group: Option<String>,
    auto_offset_reset: Option<String>,
}

impl RedpandaEventBusBuilder {
    /// Set the broker addresses (comma-separated).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the producer acknowledgment mode.
    ///
    /// Default: "all". Anything weaker can lose a message the dispatcher has
    /// already marked delivered.
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Set the compression codec ("none", "gzip", "snappy", "lz4", "zstd").
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Set the producer send timeout.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the consumer group ID for subscriptions.
    ///
    /// Instances sharing a group split the partitions between them. Each
    /// group receives its own copy of every event.
    #[must_use]
    pub fn consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = Some(consumer_group.into());
        self
    }

    /// Set the auto offset reset policy for new consumer groups.
    ///
    /// Default: "earliest", so a fresh search instance sees retained history.
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Build the [`RedpandaEventBus`].
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if brokers are not set or
    /// the producer cannot be created.
    pub fn build(self) -> Result<RedpandaEventBus, EventBusError> {
        let brokers = self.brokers.ok_or_else(|| {
            EventBusError::ConnectionFailed("Brokers not configured".to_string())
        })?;
        let timeout = self.timeout.unwrap_or(Duration::from_secs(5));
        let acks = self.producer_acks.as_deref().unwrap_or("all");
        let compression = self.compression.as_deref().unwrap_or("none");

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", acks)
            .set("enable.idempotence", "true")
            .set("compression.type", compression)
            .create()
            .map_err(|e| {
                EventBusError::ConnectionFailed(format!("Failed to create producer: {e}"))
            })?;

        let auto_offset_reset = self
            .auto_offset_reset
            .unwrap_or_else(|| "earliest".to_string());

        tracing::info!(
            brokers = %brokers,
            acks,
            compression,
            consumer_group = ?self.consumer_group,
            auto_offset_reset = %auto_offset_reset,
            "RedpandaEventBus created successfully"
        );

        Ok(RedpandaEventBus {
            producer,
            brokers,
            timeout,
            consumer_group: self.consumer_group,
            auto_offset_reset,
        })
    }
}

/// Kafka headers describing `event`.
#[must_use]
pub fn event_headers(event: &SerializedEvent) -> OwnedHeaders {
    let version = event.event_version.to_string();
    OwnedHeaders::new()
        .insert(Header {
            key: EVENT_TYPE_HEADER,
            value: Some(event.event_type.as_bytes()),
        })
        .insert(Header {
            key: EVENT_VERSION_HEADER,
            value: Some(version.as_bytes()),
        })
}

fn header_value<'a, H: Headers>(headers: Option<&'a H>, name: &str) -> Option<&'a [u8]> {
    headers?
        .iter()
        .find(|header| header.key == name)
        .and_then(|header| header.value)
}

/// Rebuild a [`SerializedEvent`] from a received record.
///
/// Missing or unreadable parts become empty values instead of an error, so
/// the event still reaches the consumer and can be parked with its bytes.
#[must_use]
pub fn decode_record<H: Headers>(
    key: Option<&[u8]>,
    headers: Option<&H>,
    payload: Option<&[u8]>,
) -> SerializedEvent {
    let event_type = header_value(headers, EVENT_TYPE_HEADER)
        .map(|v| String::from_utf8_lossy(v).into_owned())
        .unwrap_or_default();
    let event_version = header_value(headers, EVENT_VERSION_HEADER)
        .and_then(|v| std::str::from_utf8(v).ok())
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(0);
    let key = key
        .map(|k| String::from_utf8_lossy(k).into_owned())
        .unwrap_or_default();

    SerializedEvent::new(event_type, event_version, key, payload.map(<[u8]>::to_vec).unwrap_or_default())
}

impl EventBus for RedpandaEventBus {
    fn publish(
        &self,
        topic: &str,
        event: &SerializedEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        // Clone data before moving into async block
        let topic = topic.to_string();
        let event = event.clone();
        let timeout = self.timeout;

        Box::pin(async move {
            let record = FutureRecord::to(&topic)
                .payload(&event.data)
                .key(&event.key)
                .headers(event_headers(&event));

            match self.producer.send(record, Timeout::After(timeout)).await {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        topic = %topic,
                        partition,
                        offset,
                        key = %event.key,
                        event_type = %event.event_type,
                        "Event published successfully"
                    );
                    Ok(())
                },
                Err((kafka_error, _)) => {
                    tracing::warn!(
                        topic = %topic,
                        key = %event.key,
                        error = %kafka_error,
                        "Failed to publish event"
                    );
                    Err(EventBusError::PublishFailed {
                        topic,
                        reason: kafka_error.to_string(),
                    })
                },
            }
        })
    }

    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<EventStream, EventBusError>> + Send + '_>> {
        let topics: Vec<String> = topics.iter().map(|s| (*s).to_string()).collect();
        let consumer_group_id = self.consumer_group_for(&topics);
        let brokers = self.brokers.clone();
        let auto_offset_reset = self.auto_offset_reset.clone();

        Box::pin(async move {
            let consumer: StreamConsumer = ClientConfig::new()
                .set("bootstrap.servers", &brokers)
                .set("group.id", &consumer_group_id)
                .set("enable.auto.commit", "false")
                .set("auto.offset.reset", &auto_offset_reset)
                .set("session.timeout.ms", "6000")
                .set("enable.partition.eof", "false")
                .create()
                .map_err(|e| EventBusError::SubscriptionFailed {
                    topics: topics.clone(),
                    reason: format!("Failed to create consumer: {e}"),
                })?;

            let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
            consumer
                .subscribe(&topic_refs)
                .map_err(|e| EventBusError::SubscriptionFailed {
                    topics: topics.clone(),
                    reason: format!("Failed to subscribe to topics: {e}"),
                })?;

            tracing::info!(
                topics = ?topics,
                consumer_group = %consumer_group_id,
                auto_offset_reset = %auto_offset_reset,
                "Subscribed to topics"
            );

            let stream = async_stream::stream! {
                loop {
                    let received = match consumer.recv().await {
                        Ok(message) => {
                            let event = decode_record(
                                message.key(),
                                message.headers(),
                                message.payload(),
                            );
                            if event.event_type.is_empty() {
                                tracing::warn!(
                                    topic = message.topic(),
                                    partition = message.partition(),
                                    offset = message.offset(),
                                    "Received record without event-type header"
                                );
                            }
                            Ok((
                                message.topic().to_string(),
                                message.partition(),
                                message.offset(),
                                event,
                            ))
                        },
                        Err(e) => Err(EventBusError::TransportError(format!(
                            "Failed to receive message: {e}"
                        ))),
                    };

                    match received {
                        Ok((topic, partition, offset, event)) => {
                            yield Ok(event);
                            // Polled again: the previous event has been handled.
                            commit(&consumer, &topic, partition, offset);
                        },
                        Err(e) => yield Err(e),
                    }
                }
            };

            Ok(Box::pin(stream) as EventStream)
        })
    }
}

fn commit(consumer: &StreamConsumer, topic: &str, partition: i32, offset: i64) {
    let mut tpl = TopicPartitionList::new();
    let result = tpl
        .add_partition_offset(topic, partition, Offset::Offset(offset + 1))
        .and_then(|()| consumer.commit(&tpl, CommitMode::Async));
    if let Err(e) = result {
        tracing::warn!(
            topic,
            partition,
            offset,
            error = %e,
            "Failed to commit offset (message may be redelivered)"
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn redpanda_event_bus_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<RedpandaEventBus>();
        assert_sync::<RedpandaEventBus>();
    }

    #[test]
    fn build_requires_brokers() {
        assert!(matches!(
            RedpandaEventBus::builder().build(),
            Err(EventBusError::ConnectionFailed(_))
        ));
    }

    #[test]
    fn record_rebuilds_event_from_headers() {
        let event = SerializedEvent::new(
            "AuctionUpdated".to_string(),
            1,
            "auction-1".to_string(),
            vec![1, 2, 3],
        );
        let headers = event_headers(&event);

        let decoded = decode_record(
            Some(event.key.as_bytes()),
            Some(&headers),
            Some(event.data.as_slice()),
        );

        assert_eq!(decoded, event);
    }

    #[test]
    fn record_without_headers_is_still_yielded() {
        let decoded = decode_record::<OwnedHeaders>(None, None, Some([9_u8, 9].as_slice()));

        assert_eq!(decoded.event_type, "");
        assert_eq!(decoded.event_version, 0);
        assert_eq!(decoded.key, "");
        assert_eq!(decoded.data, vec![9, 9]);
    }

    #[test]
    fn unparsable_version_defaults_to_zero() {
        let headers = OwnedHeaders::new()
            .insert(Header {
                key: EVENT_TYPE_HEADER,
                value: Some("AuctionCreated".as_bytes()),
            })
            .insert(Header {
                key: EVENT_VERSION_HEADER,
                value: Some("v1".as_bytes()),
            });

        let decoded = decode_record(Some(b"k".as_slice()), Some(&headers), None);

        assert_eq!(decoded.event_type, "AuctionCreated");
        assert_eq!(decoded.event_version, 0);
        assert!(decoded.data.is_empty());
    }
}
