//! Event envelope and wire format shared by the auction and search services.
//!
//! Every authoritative mutation produces one [`EventEnvelope`]. The envelope
//! carries a full [`AuctionRecord`] snapshot for created, updated and finished
//! events, and only the identity for deletions, so the read side never needs
//! to merge partial diffs.
//!
//! # Design
//!
//! Envelopes are serialized with `bincode`. The same bytes are stored in the
//! outbox `payload` column and sent as the broker message body, so the
//! dispatcher never re-encodes anything. Both services are Rust and share
//! this crate, which keeps the binary format safe to use across the wire.
//!
//! # Example
//!
//! ```
//! use gavel_core::event::{EventEnvelope, EventType};
//! use gavel_core::auction::AuctionId;
//! use chrono::Utc;
//!
//! let id = AuctionId::new();
//! let envelope = EventEnvelope::deleted(id, Utc::now());
//! let serialized = envelope.to_serialized().unwrap();
//!
//! assert_eq!(serialized.event_type, "AuctionDeleted");
//! assert_eq!(serialized.key, id.to_string());
//!
//! let decoded = EventEnvelope::from_serialized(&serialized).unwrap();
//! assert_eq!(decoded.event_type, EventType::Deleted);
//! ```

use crate::auction::{AuctionId, AuctionRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Current envelope schema version.
pub const SCHEMA_VERSION: u16 = 1;

/// Error types for event operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    /// Failed to serialize event to bytes.
    #[error("Failed to serialize event: {0}")]
    SerializationError(String),

    /// Failed to deserialize event from bytes.
    #[error("Failed to deserialize event: {0}")]
    DeserializationError(String),

    /// Unknown event type encountered during deserialization.
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    /// The type tag on the wire disagrees with the decoded payload.
    #[error("Event type mismatch: tagged {tagged}, payload is {actual}")]
    TypeMismatch {
        /// Tag carried next to the payload
        tagged: String,
        /// Tag of the decoded envelope
        actual: String,
    },
}

/// An event that can be serialized for the outbox and the broker.
///
/// The trait provides default `bincode` implementations for any type that
/// implements `Serialize` and `DeserializeOwned`.
pub trait Event: Send + Sync + 'static {
    /// Returns the stable type identifier for this event.
    fn event_type(&self) -> &'static str;

    /// Serialize this event to bincode bytes.
    ///
    /// # Errors
    ///
    /// Returns `EventError::SerializationError` if the event cannot be serialized.
    fn to_bytes(&self) -> Result<Vec<u8>, EventError>
    where
        Self: Serialize,
    {
        bincode::serialize(self).map_err(|e| EventError::SerializationError(e.to_string()))
    }

    /// Deserialize an event from bincode bytes.
    ///
    /// # Errors
    ///
    /// Returns `EventError::DeserializationError` if the bytes are corrupted
    /// or represent a different schema.
    fn from_bytes(bytes: &[u8]) -> Result<Self, EventError>
    where
        Self: DeserializeOwned + Sized,
    {
        bincode::deserialize(bytes).map_err(|e| EventError::DeserializationError(e.to_string()))
    }
}

/// Closed set of auction event types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventType {
    /// A new auction was opened.
    Created,
    /// Descriptive attributes changed.
    Updated,
    /// The auction was removed.
    Deleted,
    /// The auction was settled.
    Finished,
}

impl EventType {
    /// Every event type, in routing-table order.
    pub const ALL: [Self; 4] = [Self::Created, Self::Updated, Self::Deleted, Self::Finished];

    /// Type tag stored in the outbox and carried on the wire.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "AuctionCreated",
            Self::Updated => "AuctionUpdated",
            Self::Deleted => "AuctionDeleted",
            Self::Finished => "AuctionFinished",
        }
    }

    /// Topic suffix for this event type.
    #[must_use]
    pub const fn topic_slug(&self) -> &'static str {
        match self {
            Self::Created => "record-created",
            Self::Updated => "record-updated",
            Self::Deleted => "record-deleted",
            Self::Finished => "record-finished",
        }
    }

    /// Whether events of this type carry a full snapshot.
    #[must_use]
    pub const fn carries_snapshot(&self) -> bool {
        !matches!(self, Self::Deleted)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| EventError::UnknownEventType(s.to_string()))
    }
}

/// Versioned, typed event exchanged between services.
///
/// `modified_at` is the authoritative record's last-modified timestamp at the
/// time of the mutation. It is the only value the read side uses to order
/// events for the same identity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Schema version of this envelope.
    pub schema_version: u16,
    /// Event type tag.
    pub event_type: EventType,
    /// Identity of the affected auction.
    pub auction_id: AuctionId,
    /// Authoritative last-modified timestamp.
    pub modified_at: DateTime<Utc>,
    /// Full snapshot; `None` for deletions.
    pub snapshot: Option<AuctionRecord>,
}

impl EventEnvelope {
    fn with_snapshot(event_type: EventType, record: &AuctionRecord) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            event_type,
            auction_id: record.id,
            modified_at: record.updated_at,
            snapshot: Some(record.clone()),
        }
    }

    /// Envelope for a newly opened auction.
    #[must_use]
    pub fn created(record: &AuctionRecord) -> Self {
        Self::with_snapshot(EventType::Created, record)
    }

    /// Envelope for an attribute update.
    #[must_use]
    pub fn updated(record: &AuctionRecord) -> Self {
        Self::with_snapshot(EventType::Updated, record)
    }

    /// Envelope for a settled auction.
    #[must_use]
    pub fn finished(record: &AuctionRecord) -> Self {
        Self::with_snapshot(EventType::Finished, record)
    }

    /// Identity-only envelope for a deletion at `deleted_at`.
    #[must_use]
    pub const fn deleted(auction_id: AuctionId, deleted_at: DateTime<Utc>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            event_type: EventType::Deleted,
            auction_id,
            modified_at: deleted_at,
            snapshot: None,
        }
    }

    /// Wrap into the wire format, keyed by auction identity.
    ///
    /// # Errors
    ///
    /// Returns `EventError::SerializationError` if encoding fails.
    pub fn to_serialized(&self) -> Result<SerializedEvent, EventError> {
        Ok(SerializedEvent::new(
            self.event_type.as_str().to_string(),
            self.schema_version,
            self.auction_id.to_string(),
            self.to_bytes()?,
        ))
    }

    /// Decode from the wire format.
    ///
    /// # Errors
    ///
    /// - `EventError::UnknownEventType` if the tag is not recognized
    /// - `EventError::DeserializationError` if the payload is corrupted
    /// - `EventError::TypeMismatch` if the tag disagrees with the payload
    pub fn from_serialized(event: &SerializedEvent) -> Result<Self, EventError> {
        let tagged: EventType = event.event_type.parse()?;
        let envelope = Self::from_bytes(&event.data)?;
        if envelope.event_type != tagged {
            return Err(EventError::TypeMismatch {
                tagged: tagged.to_string(),
                actual: envelope.event_type.to_string(),
            });
        }
        Ok(envelope)
    }
}

impl Event for EventEnvelope {
    fn event_type(&self) -> &'static str {
        self.event_type.as_str()
    }
}

/// A serialized event as it travels through the outbox and the broker.
///
/// `key` is the partition key (the auction identity) so that every event for
/// one auction lands on the same partition and keeps its order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedEvent {
    /// The event type identifier (e.g., "AuctionCreated").
    pub event_type: String,

    /// Envelope schema version.
    pub event_version: u16,

    /// Partition key.
    pub key: String,

    /// The bincode-serialized envelope.
    pub data: Vec<u8>,
}

impl SerializedEvent {
    /// Create a new serialized event.
    ///
    /// # Examples
    ///
    /// ```
    /// use gavel_core::event::SerializedEvent;
    ///
    /// let event = SerializedEvent::new(
    ///     "AuctionCreated".to_string(),
    ///     1,
    ///     "auction-1".to_string(),
    ///     vec![1, 2, 3, 4],
    /// );
    /// assert_eq!(event.data.len(), 4);
    /// ```
    #[must_use]
    pub const fn new(event_type: String, event_version: u16, key: String, data: Vec<u8>) -> Self {
        Self {
            event_type,
            event_version,
            key,
            data,
        }
    }
}

impl fmt::Display for SerializedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SerializedEvent {{ type: {}, key: {}, size: {} bytes }}",
            self.event_type,
            self.key,
            self.data.len()
        )
    }
}
