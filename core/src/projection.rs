//! Search read model: denormalized auction documents kept in sync by events.
//!
//! # Overview
//!
//! The search service owns a [`SearchStore`] holding one entry per auction
//! identity. Only the idempotent consumer and the catch-up reconciler write
//! to it, and both go through the same apply path.
//!
//! ```text
//! Auction service:             Search service:
//! ┌─────────────────┐         ┌─────────────────┐
//! │  auctions       │         │  search_index   │
//! │  outbox         │         │  (documents +   │
//! │                 │         │   tombstones)   │
//! └─────────────────┘         └─────────────────┘
//!         │                            ▲
//!         │ dispatcher publishes       │ apply (strictly newer only)
//!         ▼                            │
//! ┌──────────────────────────────────────┐
//! │         Event Bus (Redpanda)         │
//! └──────────────────────────────────────┘
//!         ▲                            ▲
//!         └── GET /api/auctions?modifiedSince ── reconciler
//! ```
//!
//! ## Monotonic apply
//!
//! Every entry remembers the authoritative timestamp of the last change applied
//! to it. A write carrying a timestamp that is not strictly newer is a no-op.
//!
//! ## Tombstones
//!
//! A deletion replaces the document with a [`Tombstone`] rather than erasing
//! the key. A stale update redelivered after the delete finds the tombstone's
//! newer timestamp and is skipped, so the document stays absent. Tombstones
//! are invisible to search and do not contribute to the watermark.

use crate::auction::{AuctionId, AuctionRecord, AuctionStatus};
use crate::query::{SearchPage, SearchQuery};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Error type for search store operations.
#[derive(Debug, Error, Clone)]
pub enum SearchStoreError {
    /// Storage backend unavailable or the query failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A stored document could not be decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Denormalized auction as served by search.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchDocument {
    /// Identity, shared with the authoritative record
    pub id: AuctionId,
    /// Vehicle make
    pub make: String,
    /// Vehicle model
    pub model: String,
    /// Vehicle color
    pub color: String,
    /// Odometer reading
    pub mileage: i32,
    /// Model year
    pub year: i32,
    /// Start of the auction window
    pub created_at: DateTime<Utc>,
    /// End of the auction window
    pub auction_end: DateTime<Utc>,
    /// Lifecycle status
    pub status: AuctionStatus,
    /// Reserve price
    pub reserve_price: i32,
    /// Seller username
    pub seller: String,
    /// Winning bidder
    pub winner: Option<String>,
    /// Final sale amount
    pub sold_amount: Option<i32>,
    /// Current highest bid
    pub current_high_bid: Option<i32>,
    /// Authoritative last-modified timestamp of the snapshot
    pub updated_at: DateTime<Utc>,
    /// Timestamp of the last event or record applied to this document
    pub last_applied_at: DateTime<Utc>,
}

impl SearchDocument {
    /// Project an authoritative snapshot applied at `applied_at`.
    #[must_use]
    pub fn from_snapshot(record: &AuctionRecord, applied_at: DateTime<Utc>) -> Self {
        Self {
            id: record.id,
            make: record.make.clone(),
            model: record.model.clone(),
            color: record.color.clone(),
            mileage: record.mileage,
            year: record.year,
            created_at: record.created_at,
            auction_end: record.auction_end,
            status: record.status,
            reserve_price: record.reserve_price,
            seller: record.seller.clone(),
            winner: record.winner.clone(),
            sold_amount: record.sold_amount,
            current_high_bid: record.current_high_bid,
            updated_at: record.updated_at,
            last_applied_at: applied_at,
        }
    }

    /// Whether this document mirrors `record` field for field.
    #[must_use]
    pub fn mirrors(&self, record: &AuctionRecord) -> bool {
        *self == Self::from_snapshot(record, self.last_applied_at)
    }
}

/// Marker left behind by a deletion.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    /// Deleted identity
    pub auction_id: AuctionId,
    /// Authoritative deletion timestamp
    pub deleted_at: DateTime<Utc>,
}

/// What the read model holds for one identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IndexEntry {
    /// A searchable document.
    Document(SearchDocument),
    /// The auction was deleted.
    Tombstone(Tombstone),
}

impl IndexEntry {
    /// Timestamp a newer change must exceed to be applied.
    #[must_use]
    pub fn last_applied_at(&self) -> DateTime<Utc> {
        match self {
            Self::Document(doc) => doc.last_applied_at,
            Self::Tombstone(stone) => stone.deleted_at,
        }
    }

    /// The document, unless deleted.
    #[must_use]
    pub fn document(&self) -> Option<&SearchDocument> {
        match self {
            Self::Document(doc) => Some(doc),
            Self::Tombstone(_) => None,
        }
    }
}

/// Storage backend for the search read model.
///
/// # Dyn Compatibility
///
/// Methods return boxed futures so one store can be shared as
/// `Arc<dyn SearchStore>` by the consumer, the reconciler and the HTTP layer.
pub trait SearchStore: Send + Sync {
    /// Current entry for an identity, tombstones included.
    ///
    /// # Errors
    ///
    /// Returns [`SearchStoreError::Storage`] if the lookup fails.
    fn get(
        &self,
        id: AuctionId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<IndexEntry>, SearchStoreError>> + Send + '_>>;

    /// Insert or overwrite a document if it is strictly newer than what is stored.
    ///
    /// Returns `true` if the document was written. The comparison and the
    /// write happen atomically with respect to other writers of the same store.
    ///
    /// # Errors
    ///
    /// Returns [`SearchStoreError::Storage`] if the write fails.
    fn upsert_if_newer(
        &self,
        document: SearchDocument,
    ) -> Pin<Box<dyn Future<Output = Result<bool, SearchStoreError>> + Send + '_>>;

    /// Replace whatever is stored for `id` with a tombstone.
    ///
    /// Unconditional for documents; an existing tombstone keeps the later
    /// deletion timestamp. Returns `true` if a document was removed.
    ///
    /// # Errors
    ///
    /// Returns [`SearchStoreError::Storage`] if the write fails.
    fn remove(
        &self,
        id: AuctionId,
        deleted_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<bool, SearchStoreError>> + Send + '_>>;

    /// Largest `last_applied_at` across live documents, `None` when empty.
    ///
    /// # Errors
    ///
    /// Returns [`SearchStoreError::Storage`] if the query fails.
    fn watermark(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<DateTime<Utc>>, SearchStoreError>> + Send + '_>>;

    /// Run a search query evaluated at `now`.
    ///
    /// # Errors
    ///
    /// Returns [`SearchStoreError::Storage`] if the query fails.
    fn search(
        &self,
        query: &SearchQuery,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<SearchPage, SearchStoreError>> + Send + '_>>;

    /// Number of live documents.
    ///
    /// # Errors
    ///
    /// Returns [`SearchStoreError::Storage`] if the query fails.
    fn count(&self) -> Pin<Box<dyn Future<Output = Result<i64, SearchStoreError>> + Send + '_>>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::auction::NewAuction;
    use chrono::{Duration, TimeZone};

    #[test]
    fn projection_mirrors_snapshot() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let record = AuctionRecord::open(
            AuctionId::new(),
            NewAuction {
                make: "Audi".to_string(),
                model: "R8".to_string(),
                color: "Black".to_string(),
                mileage: 1_000,
                year: 2023,
                reserve_price: 90_000,
                auction_end: now + Duration::days(3),
                seller: "carol".to_string(),
            },
            now,
        );
        let doc = SearchDocument::from_snapshot(&record, record.updated_at);
        assert!(doc.mirrors(&record));

        let mut changed = record.clone();
        changed.mileage += 1;
        assert!(!doc.mirrors(&changed));
    }

    #[test]
    fn tombstone_exposes_deletion_time() {
        let at = Utc.with_ymd_and_hms(2025, 6, 2, 0, 0, 0).unwrap();
        let entry = IndexEntry::Tombstone(Tombstone {
            auction_id: AuctionId::new(),
            deleted_at: at,
        });
        assert_eq!(entry.last_applied_at(), at);
        assert!(entry.document().is_none());
    }
}
