//! Transactional outbox: the durable hand-off between a business write and
//! the broker.
//!
//! An [`OutboxEntry`] is inserted by the authoritative store inside the same
//! transaction as the mutation it describes. After that, only the dispatcher
//! touches it, and only to move it out of [`DeliveryState::Pending`].
//!
//! # State transitions
//!
//! ```text
//! Pending ──ack──▶ Delivered
//!    │
//!    └──undecodable payload──▶ Failed
//! ```
//!
//! A failed publish leaves the entry `Pending`; the next poll picks it up
//! again. Transitions are guarded by `state = 'pending'` so two dispatcher
//! instances racing on one entry cannot both claim it.

use crate::event::{EventEnvelope, EventError, SerializedEvent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Delivery state of an outbox entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryState {
    /// Awaiting broker acknowledgment.
    Pending,
    /// Acknowledged by the broker.
    Delivered,
    /// Can never be published.
    Failed,
}

impl DeliveryState {
    /// Database representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        }
    }

    /// Parse the database representation.
    ///
    /// # Errors
    ///
    /// Returns the unrecognized input when it is not a known state.
    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "pending" => Ok(Self::Pending),
            "delivered" => Ok(Self::Delivered),
            "failed" => Ok(Self::Failed),
            other => Err(format!("Invalid delivery state: {other}")),
        }
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the outbox table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboxEntry {
    /// Monotonic per database; defines dispatch order.
    pub sequence_id: i64,
    /// Event type tag.
    pub event_type: String,
    /// Serialized [`EventEnvelope`].
    pub payload: Vec<u8>,
    /// When the business transaction wrote this row.
    pub created_at: DateTime<Utc>,
    /// Current delivery state.
    pub state: DeliveryState,
}

impl OutboxEntry {
    /// Decode the payload into a broker message keyed by auction identity.
    ///
    /// # Errors
    ///
    /// Returns an [`EventError`] if the payload or tag cannot be decoded.
    pub fn decode(&self) -> Result<(EventEnvelope, SerializedEvent), EventError> {
        let envelope = EventEnvelope::from_serialized(&SerializedEvent::new(
            self.event_type.clone(),
            0,
            String::new(),
            self.payload.clone(),
        ))?;
        let message = SerializedEvent::new(
            self.event_type.clone(),
            envelope.schema_version,
            envelope.auction_id.to_string(),
            self.payload.clone(),
        );
        Ok((envelope, message))
    }
}

/// Errors from outbox storage.
#[derive(Error, Debug, Clone)]
pub enum OutboxError {
    /// Storage unavailable or the query failed.
    #[error("Database error: {0}")]
    Database(String),

    /// A stored row could not be read back.
    #[error("Corrupt outbox row {sequence_id}: {reason}")]
    CorruptRow {
        /// Offending row
        sequence_id: i64,
        /// What was wrong with it
        reason: String,
    },
}

/// Dispatcher-side view of the outbox.
///
/// Insertion is not part of this trait: it belongs to the authoritative
/// store's transaction. This trait only reads pending rows and moves them
/// along.
pub trait OutboxStore: Send + Sync {
    /// Up to `limit` pending entries ordered by ascending sequence id.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Database`] if the query fails.
    fn fetch_pending(
        &self,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxEntry>, OutboxError>> + Send + '_>>;

    /// Flip an entry from pending to delivered.
    ///
    /// Returns `false` if the entry was no longer pending (another dispatcher
    /// instance got there first).
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Database`] if the update fails.
    fn mark_delivered(
        &self,
        sequence_id: i64,
    ) -> Pin<Box<dyn Future<Output = Result<bool, OutboxError>> + Send + '_>>;

    /// Flip an entry from pending to failed, recording why.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Database`] if the update fails.
    fn mark_failed(
        &self,
        sequence_id: i64,
        reason: &str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, OutboxError>> + Send + '_>>;

    /// Number of entries still pending.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Database`] if the query fails.
    fn count_pending(&self) -> Pin<Box<dyn Future<Output = Result<i64, OutboxError>> + Send + '_>>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::auction::AuctionId;

    #[test]
    fn decode_keys_by_auction() {
        let id = AuctionId::new();
        let envelope = EventEnvelope::deleted(id, Utc::now());
        let serialized = envelope.to_serialized().unwrap();
        let entry = OutboxEntry {
            sequence_id: 7,
            event_type: serialized.event_type.clone(),
            payload: serialized.data.clone(),
            created_at: Utc::now(),
            state: DeliveryState::Pending,
        };

        let (decoded, message) = entry.decode().unwrap();
        assert_eq!(decoded, envelope);
        assert_eq!(message, serialized);
    }

    #[test]
    fn decode_rejects_garbage() {
        let entry = OutboxEntry {
            sequence_id: 1,
            event_type: "AuctionCreated".to_string(),
            payload: vec![9, 9],
            created_at: Utc::now(),
            state: DeliveryState::Pending,
        };
        assert!(entry.decode().is_err());
    }

    #[test]
    fn state_parses() {
        for state in [DeliveryState::Pending, DeliveryState::Delivered, DeliveryState::Failed] {
            assert_eq!(DeliveryState::parse(state.as_str()).unwrap(), state);
        }
        assert!(DeliveryState::parse("archived").is_err());
    }
}
