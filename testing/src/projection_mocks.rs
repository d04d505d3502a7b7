//! In-memory read-model testing utilities
//!
//! Provides fast, deterministic stand-ins for the search-side storage:
//! - [`InMemorySearchStore`]: `HashMap`-based search index with tombstones
//! - [`InMemoryPoisonStore`]: dead-letter storage
//!
//! Both support fault injection so tests can exercise the transient-failure
//! and retry paths.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Lock poisoning only happens after a test already panicked

use chrono::{DateTime, Utc};
use gavel_core::auction::AuctionId;
use gavel_core::poison::{
    DeadLetterStatus, NewPoisonedEvent, PoisonStore, PoisonStoreError, PoisonedEvent,
};
use gavel_core::projection::{IndexEntry, SearchDocument, SearchStore, SearchStoreError, Tombstone};
use gavel_core::query::{SearchPage, SearchQuery};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, SearchStoreError>> + Send + 'a>>;

/// In-memory search index for fast, deterministic testing.
///
/// # Example
///
/// ```
/// use gavel_testing::InMemorySearchStore;
/// use gavel_core::projection::SearchStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemorySearchStore::new();
/// assert_eq!(store.watermark().await?, None);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemorySearchStore {
    entries: Arc<RwLock<HashMap<AuctionId, IndexEntry>>>,
    unavailable: Arc<AtomicBool>,
    failing_writes: Arc<AtomicUsize>,
    writes: Arc<AtomicUsize>,
}

impl InMemorySearchStore {
    /// Create a new empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail until switched back
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make the next `count` writes fail with a storage error
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// The live document for an identity, if any
    #[must_use]
    pub fn document(&self, id: AuctionId) -> Option<SearchDocument> {
        self.entries
            .read()
            .unwrap()
            .get(&id)
            .and_then(|entry| entry.document().cloned())
    }

    /// Every live document
    #[must_use]
    pub fn documents(&self) -> Vec<SearchDocument> {
        self.entries
            .read()
            .unwrap()
            .values()
            .filter_map(|entry| entry.document().cloned())
            .collect()
    }

    /// Whether a tombstone is recorded for an identity
    #[must_use]
    pub fn is_tombstoned(&self, id: AuctionId) -> bool {
        matches!(
            self.entries.read().unwrap().get(&id),
            Some(IndexEntry::Tombstone(_))
        )
    }

    /// Number of writes that changed the store
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Full snapshot of the store, for equality assertions
    #[must_use]
    pub fn snapshot(&self) -> HashMap<AuctionId, IndexEntry> {
        self.entries.read().unwrap().clone()
    }

    fn check_available(&self) -> Result<(), SearchStoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SearchStoreError::Storage("search store unavailable".to_string()));
        }
        Ok(())
    }

    fn check_write(&self) -> Result<(), SearchStoreError> {
        self.check_available()?;
        let injected = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(SearchStoreError::Storage("injected write failure".to_string()));
        }
        Ok(())
    }
}

impl SearchStore for InMemorySearchStore {
    fn get(&self, id: AuctionId) -> StoreFuture<'_, Option<IndexEntry>> {
        Box::pin(async move {
            self.check_available()?;
            Ok(self.entries.read().unwrap().get(&id).cloned())
        })
    }

    fn upsert_if_newer(&self, document: SearchDocument) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            self.check_write()?;
            let mut entries = self.entries.write().unwrap();
            let newer = entries
                .get(&document.id)
                .is_none_or(|existing| document.last_applied_at > existing.last_applied_at());
            if newer {
                entries.insert(document.id, IndexEntry::Document(document));
                self.writes.fetch_add(1, Ordering::SeqCst);
            }
            Ok(newer)
        })
    }

    fn remove(&self, id: AuctionId, deleted_at: DateTime<Utc>) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            self.check_write()?;
            let mut entries = self.entries.write().unwrap();
            let (removed, deleted_at) = match entries.get(&id) {
                Some(IndexEntry::Document(_)) => (true, deleted_at),
                Some(IndexEntry::Tombstone(stone)) => (false, stone.deleted_at.max(deleted_at)),
                None => (false, deleted_at),
            };
            entries.insert(
                id,
                IndexEntry::Tombstone(Tombstone {
                    auction_id: id,
                    deleted_at,
                }),
            );
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(removed)
        })
    }

    fn watermark(&self) -> StoreFuture<'_, Option<DateTime<Utc>>> {
        Box::pin(async move {
            self.check_available()?;
            Ok(self
                .entries
                .read()
                .unwrap()
                .values()
                .filter_map(|entry| entry.document().map(|doc| doc.last_applied_at))
                .max())
        })
    }

    fn search(&self, query: &SearchQuery, now: DateTime<Utc>) -> StoreFuture<'_, SearchPage> {
        let query = query.clone();
        Box::pin(async move {
            self.check_available()?;
            let entries = self.entries.read().unwrap();
            Ok(query.run(entries.values().filter_map(IndexEntry::document), now))
        })
    }

    fn count(&self) -> StoreFuture<'_, i64> {
        Box::pin(async move {
            self.check_available()?;
            let live = self
                .entries
                .read()
                .unwrap()
                .values()
                .filter(|entry| entry.document().is_some())
                .count();
            Ok(i64::try_from(live).unwrap_or(i64::MAX))
        })
    }
}

/// In-memory dead-letter storage.
///
/// # Example
///
/// ```
/// use gavel_testing::InMemoryPoisonStore;
/// use gavel_core::poison::PoisonStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryPoisonStore::new();
/// assert_eq!(store.count_pending().await?, 0);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryPoisonStore {
    entries: Arc<RwLock<Vec<PoisonedEvent>>>,
}

impl InMemoryPoisonStore {
    /// Create a new empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every parked event, in parking order
    #[must_use]
    pub fn entries(&self) -> Vec<PoisonedEvent> {
        self.entries.read().unwrap().clone()
    }

    /// Number of parked events in any status
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    /// Whether nothing was ever parked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn transition(
        &self,
        id: i64,
        status: DeadLetterStatus,
        notes: Option<String>,
    ) -> Result<(), PoisonStoreError> {
        let mut entries = self.entries.write().unwrap();
        let entry = entries
            .iter_mut()
            .find(|entry| entry.id == id)
            .ok_or(PoisonStoreError::NotFound(id))?;
        entry.status = status;
        entry.resolved_at = Some(Utc::now());
        entry.resolution_notes = notes;
        Ok(())
    }
}

impl PoisonStore for InMemoryPoisonStore {
    fn park(
        &self,
        entry: NewPoisonedEvent,
    ) -> Pin<Box<dyn Future<Output = Result<i64, PoisonStoreError>> + Send + '_>> {
        Box::pin(async move {
            let mut entries = self.entries.write().unwrap();
            let id = i64::try_from(entries.len()).unwrap_or(i64::MAX) + 1;
            entries.push(PoisonedEvent {
                id,
                topic: entry.topic,
                event: entry.event,
                kind: entry.kind,
                error_message: entry.error_message,
                attempts: entry.attempts,
                parked_at: Utc::now(),
                status: DeadLetterStatus::Pending,
                resolved_at: None,
                resolution_notes: None,
            });
            Ok(id)
        })
    }

    fn list_pending(
        &self,
        limit: i64,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<PoisonedEvent>, PoisonStoreError>> + Send + '_>>
    {
        Box::pin(async move {
            let limit = usize::try_from(limit).unwrap_or(0);
            Ok(self
                .entries
                .read()
                .unwrap()
                .iter()
                .filter(|entry| entry.status == DeadLetterStatus::Pending)
                .take(limit)
                .cloned()
                .collect())
        })
    }

    fn mark_resolved(
        &self,
        id: i64,
        notes: Option<String>,
    ) -> Pin<Box<dyn Future<Output = Result<(), PoisonStoreError>> + Send + '_>> {
        Box::pin(async move { self.transition(id, DeadLetterStatus::Resolved, notes) })
    }

    fn mark_discarded(
        &self,
        id: i64,
        notes: Option<String>,
    ) -> Pin<Box<dyn Future<Output = Result<(), PoisonStoreError>> + Send + '_>> {
        Box::pin(async move { self.transition(id, DeadLetterStatus::Discarded, notes) })
    }

    fn count_pending(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<i64, PoisonStoreError>> + Send + '_>> {
        Box::pin(async move {
            let pending = self
                .entries
                .read()
                .unwrap()
                .iter()
                .filter(|entry| entry.status == DeadLetterStatus::Pending)
                .count();
            Ok(i64::try_from(pending).unwrap_or(i64::MAX))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use chrono::Duration;
    use gavel_core::event::SerializedEvent;
    use gavel_core::poison::FailureKind;

    #[tokio::test]
    async fn upsert_requires_strictly_newer() {
        let store = InMemorySearchStore::new();
        let record = fixtures::toyota(fixtures::epoch_2025());
        let doc = SearchDocument::from_snapshot(&record, record.updated_at);

        assert!(store.upsert_if_newer(doc.clone()).await.unwrap());
        assert!(!store.upsert_if_newer(doc.clone()).await.unwrap());

        let mut older = doc.clone();
        older.last_applied_at = doc.last_applied_at - Duration::seconds(1);
        older.mileage = 1;
        assert!(!store.upsert_if_newer(older).await.unwrap());
        assert_eq!(store.document(record.id), Some(doc));
    }

    #[tokio::test]
    async fn tombstone_blocks_stale_resurrection() {
        let store = InMemorySearchStore::new();
        let record = fixtures::toyota(fixtures::epoch_2025());
        let doc = SearchDocument::from_snapshot(&record, record.updated_at);
        store.upsert_if_newer(doc.clone()).await.unwrap();

        let deleted_at = record.updated_at + Duration::seconds(5);
        assert!(store.remove(record.id, deleted_at).await.unwrap());
        assert!(!store.remove(record.id, deleted_at).await.unwrap());
        assert!(!store.upsert_if_newer(doc).await.unwrap());
        assert!(store.is_tombstoned(record.id));
        assert_eq!(store.watermark().await.unwrap(), None);
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn injected_failures_surface_as_storage_errors() {
        let store = InMemorySearchStore::new();
        store.fail_next_writes(1);
        let record = fixtures::toyota(fixtures::epoch_2025());
        let doc = SearchDocument::from_snapshot(&record, record.updated_at);
        assert!(store.upsert_if_newer(doc.clone()).await.is_err());
        assert!(store.upsert_if_newer(doc).await.unwrap());

        store.set_unavailable(true);
        assert!(store.get(record.id).await.is_err());
    }

    #[tokio::test]
    async fn poison_store_lifecycle() {
        let store = InMemoryPoisonStore::new();
        let id = store
            .park(NewPoisonedEvent {
                topic: "auctions.record-created".to_string(),
                event: SerializedEvent::new("AuctionCreated".to_string(), 1, "k".to_string(), vec![1]),
                kind: FailureKind::Malformed,
                error_message: "bad".to_string(),
                attempts: 1,
            })
            .await
            .unwrap();

        assert_eq!(store.count_pending().await.unwrap(), 1);
        store.mark_discarded(id, Some("junk".to_string())).await.unwrap();
        assert_eq!(store.count_pending().await.unwrap(), 0);
        assert!(matches!(
            store.mark_resolved(99, None).await,
            Err(PoisonStoreError::NotFound(99))
        ));
    }
}
