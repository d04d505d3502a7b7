//! Idempotent apply of auction events and snapshots to the search store.
//!
//! [`SearchIndexer`] is the single write path into the read model. The
//! consumer hands it decoded envelopes and the reconciler hands it records
//! fetched from the delta-read endpoint; both end in [`SearchIndexer::apply`]'s
//! snapshot rule:
//!
//! - no entry, or an entry older than the incoming timestamp: write
//! - an entry at or after the incoming timestamp: skip
//! - a deletion: replace with a tombstone, whatever is stored
//!
//! Applies for the same auction are serialized through a keyed lock so the
//! read-compare-write sequence is not interleaved within one process. The
//! store's conditional upsert keeps the rule across processes.

use chrono::{DateTime, Utc};
use gavel_core::auction::{AuctionId, AuctionRecord};
use gavel_core::event::{EventEnvelope, EventType};
use gavel_core::freshness::{Freshness, FreshnessSignal};
use gavel_core::projection::{IndexEntry, SearchDocument, SearchStore, SearchStoreError};
use gavel_core::validation::{ValidationError, validate_envelope, validate_record};
use gavel_runtime::KeyedLocks;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

/// Result of applying one event or record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// A document was created.
    Inserted,
    /// An older document was overwritten.
    Updated,
    /// The stored entry was already at least as new.
    Skipped,
    /// A document was replaced with a tombstone.
    Deleted,
    /// Deletion of an auction the read model never held, or already deleted.
    AlreadyAbsent,
}

impl ApplyOutcome {
    /// Whether the read model changed.
    #[must_use]
    pub const fn changed(self) -> bool {
        matches!(self, Self::Inserted | Self::Updated | Self::Deleted)
    }

    /// Outcome name, for logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Inserted => "inserted",
            Self::Updated => "updated",
            Self::Skipped => "skipped",
            Self::Deleted => "deleted",
            Self::AlreadyAbsent => "already_absent",
        }
    }
}

/// Why an apply failed.
#[derive(Error, Debug, Clone)]
pub enum ApplyError {
    /// The event or record breaks a domain rule. Retrying will not help.
    #[error("Invalid: {0}")]
    Invalid(#[from] ValidationError),

    /// The search store rejected the read or write.
    #[error("Search store: {0}")]
    Store(#[from] SearchStoreError),
}

impl ApplyError {
    /// Whether a retry may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Store(SearchStoreError::Storage(_)))
    }
}

/// Applies events and snapshots to a [`SearchStore`] under the monotonic rule.
///
/// Also tracks per-auction [`Freshness`] for auctions this process has seen.
pub struct SearchIndexer {
    store: Arc<dyn SearchStore>,
    locks: KeyedLocks<AuctionId>,
    freshness: Mutex<HashMap<AuctionId, Freshness>>,
}

impl SearchIndexer {
    /// Create an indexer writing to `store`.
    #[must_use]
    pub fn new(store: Arc<dyn SearchStore>) -> Self {
        Self {
            store,
            locks: KeyedLocks::new(),
            freshness: Mutex::new(HashMap::new()),
        }
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn SearchStore> {
        &self.store
    }

    /// Apply a decoded event.
    ///
    /// Safe to call any number of times with the same envelope and with
    /// envelopes arriving out of order.
    ///
    /// # Errors
    ///
    /// Returns [`ApplyError::Invalid`] if the envelope fails validation and
    /// [`ApplyError::Store`] if the store fails.
    pub async fn apply(&self, envelope: &EventEnvelope) -> Result<ApplyOutcome, ApplyError> {
        validate_envelope(envelope)?;

        let _guard = self.locks.lock(envelope.auction_id).await;
        let outcome = match (&envelope.snapshot, envelope.event_type) {
            (_, EventType::Deleted) => {
                self.delete(envelope.auction_id, envelope.modified_at)
                    .await?
            }
            (Some(snapshot), _) => self.write(snapshot, envelope.modified_at).await?,
            (None, event_type) => {
                return Err(ValidationError::MissingSnapshot(event_type.as_str()).into());
            }
        };

        if envelope.event_type == EventType::Deleted {
            self.forget(envelope.auction_id);
        } else {
            self.signal(envelope.auction_id, FreshnessSignal::Applied);
        }
        tracing::debug!(
            auction_id = %envelope.auction_id,
            event_type = %envelope.event_type,
            modified_at = %envelope.modified_at,
            outcome = outcome.as_str(),
            "Applied event"
        );
        Ok(outcome)
    }

    /// Apply an authoritative record fetched by the reconciler.
    ///
    /// The record's `updated_at` is its apply timestamp, so a record already
    /// delivered by event is skipped.
    ///
    /// # Errors
    ///
    /// Returns [`ApplyError::Invalid`] if the record fails validation and
    /// [`ApplyError::Store`] if the store fails.
    pub async fn apply_record(&self, record: &AuctionRecord) -> Result<ApplyOutcome, ApplyError> {
        validate_record(record)?;

        let _guard = self.locks.lock(record.id).await;
        let outcome = self.write(record, record.updated_at).await?;
        self.signal(record.id, FreshnessSignal::Reconciled);
        tracing::debug!(
            auction_id = %record.id,
            updated_at = %record.updated_at,
            outcome = outcome.as_str(),
            "Applied record"
        );
        Ok(outcome)
    }

    /// Record that delivery of an event for `id` was given up.
    ///
    /// A parked event is evidence of an unapplied authoritative change, so
    /// the auction becomes stale until the reconciler repairs it.
    pub fn mark_exhausted(&self, id: AuctionId) {
        self.signal(id, FreshnessSignal::Mutated);
        self.signal(id, FreshnessSignal::DeliveryExhausted);
    }

    /// Freshness of one auction as seen by this process.
    ///
    /// Only auctions with an unapplied change are tracked in memory; any
    /// other auction is `Synced` when the store holds its document and
    /// `Unknown` otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`SearchStoreError`] if the store cannot be read.
    pub async fn freshness(&self, id: AuctionId) -> Result<Freshness, SearchStoreError> {
        if let Some(state) = self.tracked(id) {
            return Ok(state);
        }
        Ok(match self.store.get(id).await? {
            Some(IndexEntry::Document(_)) => Freshness::Synced,
            _ => Freshness::Unknown,
        })
    }

    /// Auctions waiting for the reconciler.
    #[must_use]
    pub fn stale_prolonged(&self) -> Vec<AuctionId> {
        self.freshness
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, state)| **state == Freshness::StaleProlonged)
            .map(|(id, _)| *id)
            .collect()
    }

    async fn write(
        &self,
        record: &AuctionRecord,
        applied_at: DateTime<Utc>,
    ) -> Result<ApplyOutcome, ApplyError> {
        let existing = self.store.get(record.id).await?;
        if existing
            .as_ref()
            .is_some_and(|entry| applied_at <= entry.last_applied_at())
        {
            return Ok(ApplyOutcome::Skipped);
        }

        let written = self
            .store
            .upsert_if_newer(SearchDocument::from_snapshot(record, applied_at))
            .await?;
        Ok(match (written, existing) {
            (false, _) => ApplyOutcome::Skipped,
            (true, Some(IndexEntry::Document(_))) => ApplyOutcome::Updated,
            (true, _) => ApplyOutcome::Inserted,
        })
    }

    async fn delete(
        &self,
        id: AuctionId,
        deleted_at: DateTime<Utc>,
    ) -> Result<ApplyOutcome, ApplyError> {
        if self.store.remove(id, deleted_at).await? {
            Ok(ApplyOutcome::Deleted)
        } else {
            Ok(ApplyOutcome::AlreadyAbsent)
        }
    }

    fn tracked(&self, id: AuctionId) -> Option<Freshness> {
        self.freshness
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .copied()
    }

    // Synced and Unknown are not stored, so the map holds only auctions
    // still waiting for a repair.
    fn signal(&self, id: AuctionId, signal: FreshnessSignal) {
        let mut freshness = self.freshness.lock().unwrap_or_else(PoisonError::into_inner);
        let next = freshness.get(&id).copied().unwrap_or_default().on(signal);
        if matches!(next, Freshness::Synced | Freshness::Unknown) {
            freshness.remove(&id);
        } else {
            freshness.insert(id, next);
        }
    }

    #[cfg(test)]
    fn tracked_count(&self) -> usize {
        self.freshness
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn forget(&self, id: AuctionId) {
        self.freshness
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }
}
