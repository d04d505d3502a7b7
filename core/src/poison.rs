//! Poison (dead-letter) path for events the consumer cannot apply.
//!
//! An event is parked here when it is malformed (cannot be decoded, fails a
//! domain rule) or when transient failures outlast the retry budget. Parking
//! takes the event out of the consumer's way so the messages behind it keep
//! flowing. Nothing is dropped: every parked event keeps its raw bytes for
//! operator replay.

use crate::event::SerializedEvent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Why an event was parked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// The event can never be applied as-is.
    Malformed,
    /// Transient failures exhausted the retry budget.
    Exhausted,
}

impl FailureKind {
    /// Database representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Malformed => "malformed",
            Self::Exhausted => "exhausted",
        }
    }

    /// Parse the database representation.
    ///
    /// # Errors
    ///
    /// Returns the unrecognized input when it is not a known kind.
    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "malformed" => Ok(Self::Malformed),
            "exhausted" => Ok(Self::Exhausted),
            other => Err(format!("Invalid failure kind: {other}")),
        }
    }
}

/// Status of a parked event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeadLetterStatus {
    /// Awaiting operator attention
    Pending,
    /// Replayed successfully
    Resolved,
    /// Permanently discarded
    Discarded,
}

impl DeadLetterStatus {
    /// Database representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Resolved => "resolved",
            Self::Discarded => "discarded",
        }
    }

    /// Parse the database representation.
    ///
    /// # Errors
    ///
    /// Returns the unrecognized input when it is not a known status.
    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "pending" => Ok(Self::Pending),
            "resolved" => Ok(Self::Resolved),
            "discarded" => Ok(Self::Discarded),
            other => Err(format!("Invalid dead-letter status: {other}")),
        }
    }
}

impl fmt::Display for DeadLetterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event about to be parked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPoisonedEvent {
    /// Topic the event arrived on
    pub topic: String,
    /// The event exactly as received
    pub event: SerializedEvent,
    /// Why it was parked
    pub kind: FailureKind,
    /// Last error observed
    pub error_message: String,
    /// Processing attempts made
    pub attempts: u32,
}

/// A parked event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoisonedEvent {
    /// Unique identifier for this entry
    pub id: i64,
    /// Topic the event arrived on
    pub topic: String,
    /// The event exactly as received
    pub event: SerializedEvent,
    /// Why it was parked
    pub kind: FailureKind,
    /// Last error observed
    pub error_message: String,
    /// Processing attempts made
    pub attempts: u32,
    /// When it was parked
    pub parked_at: DateTime<Utc>,
    /// Current status
    pub status: DeadLetterStatus,
    /// When it left the pending state
    pub resolved_at: Option<DateTime<Utc>>,
    /// Operator notes
    pub resolution_notes: Option<String>,
}

/// Errors from the poison store.
#[derive(Error, Debug, Clone)]
pub enum PoisonStoreError {
    /// Storage unavailable or the query failed.
    #[error("Database error: {0}")]
    Database(String),

    /// No entry with this id.
    #[error("Dead-letter entry not found: {0}")]
    NotFound(i64),
}

/// Durable holding area for unprocessable events.
pub trait PoisonStore: Send + Sync {
    /// Park an event. Returns the new entry id.
    ///
    /// # Errors
    ///
    /// Returns [`PoisonStoreError::Database`] if the insert fails.
    fn park(
        &self,
        entry: NewPoisonedEvent,
    ) -> Pin<Box<dyn Future<Output = Result<i64, PoisonStoreError>> + Send + '_>>;

    /// Oldest pending entries first, up to `limit`.
    ///
    /// # Errors
    ///
    /// Returns [`PoisonStoreError::Database`] if the query fails.
    fn list_pending(
        &self,
        limit: i64,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<PoisonedEvent>, PoisonStoreError>> + Send + '_>>;

    /// Mark an entry resolved after a successful replay.
    ///
    /// # Errors
    ///
    /// - [`PoisonStoreError::NotFound`] if the entry does not exist
    /// - [`PoisonStoreError::Database`] if the update fails
    fn mark_resolved(
        &self,
        id: i64,
        notes: Option<String>,
    ) -> Pin<Box<dyn Future<Output = Result<(), PoisonStoreError>> + Send + '_>>;

    /// Mark an entry permanently discarded.
    ///
    /// # Errors
    ///
    /// - [`PoisonStoreError::NotFound`] if the entry does not exist
    /// - [`PoisonStoreError::Database`] if the update fails
    fn mark_discarded(
        &self,
        id: i64,
        notes: Option<String>,
    ) -> Pin<Box<dyn Future<Output = Result<(), PoisonStoreError>> + Send + '_>>;

    /// Number of pending entries.
    ///
    /// # Errors
    ///
    /// Returns [`PoisonStoreError::Database`] if the query fails.
    fn count_pending(&self) -> Pin<Box<dyn Future<Output = Result<i64, PoisonStoreError>> + Send + '_>>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn status_and_kind_parse() {
        for status in [
            DeadLetterStatus::Pending,
            DeadLetterStatus::Resolved,
            DeadLetterStatus::Discarded,
        ] {
            assert_eq!(DeadLetterStatus::parse(status.as_str()).unwrap(), status);
        }
        for kind in [FailureKind::Malformed, FailureKind::Exhausted] {
            assert_eq!(FailureKind::parse(kind.as_str()).unwrap(), kind);
        }
        assert!(DeadLetterStatus::parse("processing").is_err());
    }
}
