//! In-memory authoritative auction database.
//!
//! [`InMemoryAuctionStore`] keeps the auctions table and the outbox table
//! behind one lock and applies every mutation to a staged copy that replaces
//! the committed state only at "commit". Arming
//! [`InMemoryAuctionStore::crash_before_next_commit`] makes the next mutation
//! fail after staging both writes but before committing either, which is how
//! the atomicity tests simulate a process crash mid-transaction.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Lock poisoning only happens after a test already panicked

use chrono::{DateTime, Utc};
use gavel_core::auction::{
    AuctionFinished, AuctionId, AuctionPatch, AuctionRecord, AuctionStore, AuctionStoreError,
    NewAuction, StoreFuture, next_modified_at, validate_new_auction,
};
use gavel_core::environment::Clock;
use gavel_core::event::EventEnvelope;
use gavel_core::outbox::{DeliveryState, OutboxEntry, OutboxError, OutboxStore};
use gavel_core::source::{AuctionSource, SourceError};
use gavel_core::validation::validate_record;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Clone, Debug, Default)]
struct AuctionDb {
    auctions: HashMap<AuctionId, AuctionRecord>,
    outbox: Vec<OutboxEntry>,
    next_sequence: i64,
}

impl AuctionDb {
    fn append(
        &mut self,
        envelope: &EventEnvelope,
        created_at: DateTime<Utc>,
    ) -> Result<(), AuctionStoreError> {
        let serialized = envelope
            .to_serialized()
            .map_err(|e| AuctionStoreError::Serialization(e.to_string()))?;
        self.next_sequence += 1;
        self.outbox.push(OutboxEntry {
            sequence_id: self.next_sequence,
            event_type: serialized.event_type,
            payload: serialized.data,
            created_at,
            state: DeliveryState::Pending,
        });
        Ok(())
    }

    fn find(&self, id: AuctionId) -> Result<AuctionRecord, AuctionStoreError> {
        self.auctions
            .get(&id)
            .cloned()
            .ok_or(AuctionStoreError::NotFound(id))
    }
}

/// Transactional in-memory auction store with its outbox.
///
/// Implements [`AuctionStore`] for the write side, [`OutboxStore`] for the
/// dispatcher and [`AuctionSource`] for the reconciler, all over the same
/// tables.
///
/// # Example
///
/// ```
/// use gavel_testing::{InMemoryAuctionStore, fixtures};
/// use gavel_core::auction::AuctionStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryAuctionStore::new(fixtures::manual_clock());
/// let record = store.create(fixtures::new_toyota()).await?;
/// assert_eq!(store.pending_entries().len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryAuctionStore {
    db: Arc<Mutex<AuctionDb>>,
    clock: Arc<dyn Clock>,
    crash_next_commit: Arc<AtomicBool>,
    source_unreachable: Arc<AtomicBool>,
    source_failures: Arc<AtomicUsize>,
    source_requests: Arc<Mutex<Vec<DateTime<Utc>>>>,
}

impl InMemoryAuctionStore {
    /// Create an empty store stamping writes with `clock`
    #[must_use]
    pub fn new(clock: impl Clock + 'static) -> Self {
        Self {
            db: Arc::new(Mutex::new(AuctionDb::default())),
            clock: Arc::new(clock),
            crash_next_commit: Arc::new(AtomicBool::new(false)),
            source_unreachable: Arc::new(AtomicBool::new(false)),
            source_failures: Arc::new(AtomicUsize::new(0)),
            source_requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Fail the next mutation after staging its writes, committing nothing
    pub fn crash_before_next_commit(&self) {
        self.crash_next_commit.store(true, Ordering::SeqCst);
    }

    /// Make the delta-read endpoint unreachable until switched back
    pub fn set_source_unreachable(&self, unreachable: bool) {
        self.source_unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Make the next `count` delta reads fail as unreachable
    pub fn fail_next_source_reads(&self, count: usize) {
        self.source_failures.store(count, Ordering::SeqCst);
    }

    /// Every `modifiedSince` value the delta-read endpoint was called with
    #[must_use]
    pub fn source_requests(&self) -> Vec<DateTime<Utc>> {
        self.source_requests.lock().unwrap().clone()
    }

    /// Every outbox row, in sequence order
    #[must_use]
    pub fn outbox_entries(&self) -> Vec<OutboxEntry> {
        self.db.lock().unwrap().outbox.clone()
    }

    /// Outbox rows still pending
    #[must_use]
    pub fn pending_entries(&self) -> Vec<OutboxEntry> {
        self.outbox_entries()
            .into_iter()
            .filter(|entry| entry.state == DeliveryState::Pending)
            .collect()
    }

    /// Committed auctions, in no particular order
    #[must_use]
    pub fn records(&self) -> Vec<AuctionRecord> {
        self.db.lock().unwrap().auctions.values().cloned().collect()
    }

    /// Insert a raw outbox row, bypassing the write API
    pub fn insert_raw_outbox(&self, event_type: &str, payload: Vec<u8>) -> i64 {
        let mut db = self.db.lock().unwrap();
        db.next_sequence += 1;
        let sequence_id = db.next_sequence;
        db.outbox.push(OutboxEntry {
            sequence_id,
            event_type: event_type.to_string(),
            payload,
            created_at: self.clock.now(),
            state: DeliveryState::Pending,
        });
        sequence_id
    }

    /// Run `mutation` against a staged copy and commit it unless a crash is armed.
    fn transact<T>(
        &self,
        mutation: impl FnOnce(&mut AuctionDb, DateTime<Utc>) -> Result<T, AuctionStoreError>,
    ) -> Result<T, AuctionStoreError> {
        let mut db = self.db.lock().unwrap();
        let mut staged = db.clone();
        let result = mutation(&mut staged, self.clock.now())?;
        if self.crash_next_commit.swap(false, Ordering::SeqCst) {
            return Err(AuctionStoreError::Database(
                "simulated crash before commit".to_string(),
            ));
        }
        *db = staged;
        Ok(result)
    }

    fn set_outbox_state(&self, sequence_id: i64, state: DeliveryState) -> bool {
        let mut db = self.db.lock().unwrap();
        match db
            .outbox
            .iter_mut()
            .find(|entry| entry.sequence_id == sequence_id && entry.state == DeliveryState::Pending)
        {
            Some(entry) => {
                entry.state = state;
                true
            }
            None => false,
        }
    }

    fn modified_after(&self, since: DateTime<Utc>) -> Vec<AuctionRecord> {
        let mut records: Vec<_> = self
            .db
            .lock()
            .unwrap()
            .auctions
            .values()
            .filter(|record| record.updated_at > since)
            .cloned()
            .collect();
        records.sort_by_key(|record| (record.updated_at, record.id));
        records
    }
}

impl AuctionStore for InMemoryAuctionStore {
    fn create(&self, request: NewAuction) -> StoreFuture<'_, AuctionRecord, AuctionStoreError> {
        Box::pin(async move {
            self.transact(|db, now| {
                let id = AuctionId::new();
                validate_new_auction(id, &request, now)?;
                let record = AuctionRecord::open(id, request, now);
                db.auctions.insert(id, record.clone());
                db.append(&EventEnvelope::created(&record), now)?;
                Ok(record)
            })
        })
    }

    fn update(
        &self,
        id: AuctionId,
        patch: AuctionPatch,
    ) -> StoreFuture<'_, AuctionRecord, AuctionStoreError> {
        Box::pin(async move {
            self.transact(|db, now| {
                let mut record = db.find(id)?;
                if !record.apply_patch(&patch) {
                    return Ok(record);
                }
                record.updated_at = next_modified_at(record.updated_at, now);
                validate_record(&record)?;
                db.auctions.insert(id, record.clone());
                db.append(&EventEnvelope::updated(&record), now)?;
                Ok(record)
            })
        })
    }

    fn delete(&self, id: AuctionId) -> StoreFuture<'_, (), AuctionStoreError> {
        Box::pin(async move {
            self.transact(|db, now| {
                let record = db.find(id)?;
                db.auctions.remove(&id);
                let deleted_at = next_modified_at(record.updated_at, now);
                db.append(&EventEnvelope::deleted(id, deleted_at), now)
            })
        })
    }

    fn settle(
        &self,
        notice: AuctionFinished,
    ) -> StoreFuture<'_, Option<AuctionRecord>, AuctionStoreError> {
        Box::pin(async move {
            self.transact(|db, now| {
                let mut record = db.find(notice.auction_id)?;
                if !record.settle(&notice) {
                    return Ok(None);
                }
                record.updated_at = next_modified_at(record.updated_at, now);
                db.auctions.insert(record.id, record.clone());
                db.append(&EventEnvelope::finished(&record), now)?;
                Ok(Some(record))
            })
        })
    }

    fn get(&self, id: AuctionId) -> StoreFuture<'_, Option<AuctionRecord>, AuctionStoreError> {
        Box::pin(async move { Ok(self.db.lock().unwrap().auctions.get(&id).cloned()) })
    }

    fn list(&self) -> StoreFuture<'_, Vec<AuctionRecord>, AuctionStoreError> {
        Box::pin(async move {
            let mut records = self.records();
            records.sort_by(|a, b| a.make.cmp(&b.make).then_with(|| a.id.cmp(&b.id)));
            Ok(records)
        })
    }

    fn modified_since(
        &self,
        since: DateTime<Utc>,
    ) -> StoreFuture<'_, Vec<AuctionRecord>, AuctionStoreError> {
        Box::pin(async move { Ok(self.modified_after(since)) })
    }
}

impl OutboxStore for InMemoryAuctionStore {
    fn fetch_pending(
        &self,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxEntry>, OutboxError>> + Send + '_>> {
        Box::pin(async move { Ok(self.pending_entries().into_iter().take(limit).collect()) })
    }

    fn mark_delivered(
        &self,
        sequence_id: i64,
    ) -> Pin<Box<dyn Future<Output = Result<bool, OutboxError>> + Send + '_>> {
        Box::pin(async move { Ok(self.set_outbox_state(sequence_id, DeliveryState::Delivered)) })
    }

    fn mark_failed(
        &self,
        sequence_id: i64,
        _reason: &str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, OutboxError>> + Send + '_>> {
        Box::pin(async move { Ok(self.set_outbox_state(sequence_id, DeliveryState::Failed)) })
    }

    fn count_pending(&self) -> Pin<Box<dyn Future<Output = Result<i64, OutboxError>> + Send + '_>> {
        Box::pin(async move { Ok(i64::try_from(self.pending_entries().len()).unwrap_or(i64::MAX)) })
    }
}

impl AuctionSource for InMemoryAuctionStore {
    fn fetch_modified_since(
        &self,
        since: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<AuctionRecord>, SourceError>> + Send + '_>> {
        Box::pin(async move {
            self.source_requests.lock().unwrap().push(since);
            let injected = self
                .source_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if injected || self.source_unreachable.load(Ordering::SeqCst) {
                return Err(SourceError::Unreachable("connection refused".to_string()));
            }
            Ok(self.modified_after(since))
        })
    }
}
