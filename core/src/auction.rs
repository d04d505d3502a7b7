//! Authoritative auction records and the write-side store port.
//!
//! The auction service owns [`AuctionRecord`] exclusively. Every mutation goes
//! through an [`AuctionStore`], and every implementation of that trait must
//! commit the business row and its outbox row in the same transaction: no
//! committed mutation exists without an outbox entry, and no outbox entry
//! exists without a committed mutation.
//!
//! # Last-modified timestamps
//!
//! `updated_at` doubles as the event timestamp the read side compares against.
//! [`next_modified_at`] guarantees it strictly increases per record even when
//! two writes land within the same clock tick.

use crate::validation::{ValidationError, validate_record};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Opaque unique identity of an auction.
///
/// Shared verbatim between the authoritative record and its search document.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuctionId(Uuid);

impl AuctionId {
    /// Generate a fresh random identity.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// The underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for AuctionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AuctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AuctionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle status of an auction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuctionStatus {
    /// Accepting bids.
    Live,
    /// Ended without a bid meeting the reserve price.
    ReserveNotMet,
    /// Ended with a winning bid at or above the reserve price.
    Finished,
}

impl AuctionStatus {
    /// Database representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Live => "Live",
            Self::ReserveNotMet => "ReserveNotMet",
            Self::Finished => "Finished",
        }
    }

    /// Parse the database representation.
    ///
    /// # Errors
    ///
    /// Returns the unrecognized input when it is not a known status.
    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "Live" => Ok(Self::Live),
            "ReserveNotMet" => Ok(Self::ReserveNotMet),
            "Finished" => Ok(Self::Finished),
            other => Err(format!("Invalid auction status: {other}")),
        }
    }
}

impl fmt::Display for AuctionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The authoritative auction row.
///
/// `created_at` opens the auction window and `auction_end` closes it.
/// `winner` and `sold_amount` stay `None` until settlement.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuctionRecord {
    /// Identity
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
    /// Minimum accepted sale price
    pub reserve_price: i32,
    /// Seller username
    pub seller: String,
    /// Winning bidder, once settled
    pub winner: Option<String>,
    /// Final sale amount, once settled
    pub sold_amount: Option<i32>,
    /// Current highest bid
    pub current_high_bid: Option<i32>,
    /// Last-modified timestamp, strictly increasing per record
    pub updated_at: DateTime<Utc>,
}

impl AuctionRecord {
    /// Open a new live auction from a creation request.
    #[must_use]
    pub fn open(id: AuctionId, request: NewAuction, now: DateTime<Utc>) -> Self {
        Self {
            id,
            make: request.make,
            model: request.model,
            color: request.color,
            mileage: request.mileage,
            year: request.year,
            created_at: now,
            auction_end: request.auction_end,
            status: AuctionStatus::Live,
            reserve_price: request.reserve_price,
            seller: request.seller,
            winner: None,
            sold_amount: None,
            current_high_bid: None,
            updated_at: now,
        }
    }

    /// Apply a partial update. Returns `true` if any field changed.
    ///
    /// Fields left as `None` in the patch keep their current value. The
    /// caller is responsible for bumping `updated_at` when this returns `true`.
    pub fn apply_patch(&mut self, patch: &AuctionPatch) -> bool {
        let mut changed = false;
        if let Some(make) = &patch.make {
            changed |= replace(&mut self.make, make.clone());
        }
        if let Some(model) = &patch.model {
            changed |= replace(&mut self.model, model.clone());
        }
        if let Some(color) = &patch.color {
            changed |= replace(&mut self.color, color.clone());
        }
        if let Some(mileage) = patch.mileage {
            changed |= replace(&mut self.mileage, mileage);
        }
        if let Some(year) = patch.year {
            changed |= replace(&mut self.year, year);
        }
        changed
    }

    /// Settle the auction from a lifecycle notice. Returns `true` if the
    /// record changed.
    ///
    /// Only a `Live` auction can be settled, so a redelivered notice is a
    /// no-op. The auction is `Finished` when the item sold for at least the
    /// reserve price and `ReserveNotMet` otherwise.
    pub fn settle(&mut self, notice: &AuctionFinished) -> bool {
        if self.status != AuctionStatus::Live {
            return false;
        }

        if notice.item_sold {
            self.winner.clone_from(&notice.winner);
            self.sold_amount = notice.amount;
        }

        let met_reserve = notice.item_sold
            && notice
                .amount
                .is_some_and(|amount| amount >= self.reserve_price);

        self.status = if met_reserve {
            AuctionStatus::Finished
        } else {
            AuctionStatus::ReserveNotMet
        };
        true
    }
}

fn replace<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        false
    } else {
        *slot = value;
        true
    }
}

/// Next last-modified timestamp for a record previously modified at `previous`.
///
/// Normally `now`; bumped one microsecond past `previous` when the clock has
/// not advanced (or went backwards) since the last write.
#[must_use]
pub fn next_modified_at(previous: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    let floor = previous + Duration::microseconds(1);
    if now >= floor { now } else { floor }
}

/// Request to open a new auction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAuction {
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
    /// Minimum accepted sale price
    pub reserve_price: i32,
    /// End of the auction window
    pub auction_end: DateTime<Utc>,
    /// Seller username
    pub seller: String,
}

/// Partial update of an auction's descriptive attributes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuctionPatch {
    /// New make
    pub make: Option<String>,
    /// New model
    pub model: Option<String>,
    /// New color
    pub color: Option<String>,
    /// New mileage
    pub mileage: Option<i32>,
    /// New year
    pub year: Option<i32>,
}

/// Lifecycle notice that an auction's bidding window has closed.
///
/// Produced by the bidding side; consumed by the auction service, which
/// settles the record and emits a `Finished` event with the full snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuctionFinished {
    /// Auction being settled
    pub auction_id: AuctionId,
    /// Whether any bid was accepted
    pub item_sold: bool,
    /// Highest bidder
    pub winner: Option<String>,
    /// Highest bid amount
    pub amount: Option<i32>,
}

/// Errors from the authoritative auction store.
#[derive(Error, Debug)]
pub enum AuctionStoreError {
    /// The auction does not exist.
    #[error("Auction not found: {0}")]
    NotFound(AuctionId),

    /// The request violates a domain rule.
    #[error("Invalid auction: {0}")]
    Invalid(#[from] ValidationError),

    /// The transaction failed; neither the record nor its outbox row were committed.
    #[error("Database error: {0}")]
    Database(String),

    /// The outbox payload could not be encoded.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Boxed future returned by the object-safe store traits.
pub type StoreFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// The authoritative auction store.
///
/// Each mutating method runs one transaction that writes the business row
/// and appends the corresponding outbox entry. Failures roll back both.
///
/// # Dyn Compatibility
///
/// Methods return boxed futures so the store can be shared as
/// `Arc<dyn AuctionStore>` across HTTP handlers and consumers.
pub trait AuctionStore: Send + Sync {
    /// Open a new auction and append a `Created` event.
    ///
    /// # Errors
    ///
    /// - [`AuctionStoreError::Invalid`] if the request violates a domain rule
    /// - [`AuctionStoreError::Database`] if the transaction fails
    fn create(&self, request: NewAuction) -> StoreFuture<'_, AuctionRecord, AuctionStoreError>;

    /// Apply a partial update and append an `Updated` event.
    ///
    /// A patch that changes nothing writes nothing and appends no event.
    ///
    /// # Errors
    ///
    /// - [`AuctionStoreError::NotFound`] if the auction does not exist
    /// - [`AuctionStoreError::Database`] if the transaction fails
    fn update(
        &self,
        id: AuctionId,
        patch: AuctionPatch,
    ) -> StoreFuture<'_, AuctionRecord, AuctionStoreError>;

    /// Delete an auction and append a `Deleted` event.
    ///
    /// # Errors
    ///
    /// - [`AuctionStoreError::NotFound`] if the auction does not exist
    /// - [`AuctionStoreError::Database`] if the transaction fails
    fn delete(&self, id: AuctionId) -> StoreFuture<'_, (), AuctionStoreError>;

    /// Settle an auction from a lifecycle notice and append a `Finished` event.
    ///
    /// Returns `None` when the auction was already settled (no write, no event).
    ///
    /// # Errors
    ///
    /// - [`AuctionStoreError::NotFound`] if the auction does not exist
    /// - [`AuctionStoreError::Database`] if the transaction fails
    fn settle(
        &self,
        notice: AuctionFinished,
    ) -> StoreFuture<'_, Option<AuctionRecord>, AuctionStoreError>;

    /// Load one auction.
    ///
    /// # Errors
    ///
    /// Returns [`AuctionStoreError::Database`] if the query fails.
    fn get(&self, id: AuctionId) -> StoreFuture<'_, Option<AuctionRecord>, AuctionStoreError>;

    /// All auctions ordered by make.
    ///
    /// # Errors
    ///
    /// Returns [`AuctionStoreError::Database`] if the query fails.
    fn list(&self) -> StoreFuture<'_, Vec<AuctionRecord>, AuctionStoreError>;

    /// Auctions modified strictly after `since`, oldest modification first.
    ///
    /// Backs the delta-read endpoint used by the catch-up reconciler. A
    /// timestamp older than any retained data returns everything.
    ///
    /// # Errors
    ///
    /// Returns [`AuctionStoreError::Database`] if the query fails.
    fn modified_since(
        &self,
        since: DateTime<Utc>,
    ) -> StoreFuture<'_, Vec<AuctionRecord>, AuctionStoreError>;
}

/// Check a creation request against the domain rules before opening it.
///
/// # Errors
///
/// Returns the first violated [`ValidationError`].
pub fn validate_new_auction(
    id: AuctionId,
    request: &NewAuction,
    now: DateTime<Utc>,
) -> Result<(), ValidationError> {
    validate_record(&AuctionRecord::open(id, request.clone(), now))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(reserve_price: i32) -> AuctionRecord {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        AuctionRecord::open(
            AuctionId::new(),
            NewAuction {
                make: "Toyota".to_string(),
                model: "Corolla".to_string(),
                color: "White".to_string(),
                mileage: 50_000,
                year: 2018,
                reserve_price,
                auction_end: now + Duration::days(7),
                seller: "alice".to_string(),
            },
            now,
        )
    }

    fn notice(id: AuctionId, item_sold: bool, amount: Option<i32>) -> AuctionFinished {
        AuctionFinished {
            auction_id: id,
            item_sold,
            winner: item_sold.then(|| "bob".to_string()),
            amount,
        }
    }

    #[test]
    fn settle_meets_reserve() {
        let mut auction = record(10_000);
        assert!(auction.settle(&notice(auction.id, true, Some(12_000))));
        assert_eq!(auction.status, AuctionStatus::Finished);
        assert_eq!(auction.winner.as_deref(), Some("bob"));
        assert_eq!(auction.sold_amount, Some(12_000));
    }

    #[test]
    fn settle_exactly_at_reserve_is_finished() {
        let mut auction = record(10_000);
        auction.settle(&notice(auction.id, true, Some(10_000)));
        assert_eq!(auction.status, AuctionStatus::Finished);
    }

    #[test]
    fn settle_below_reserve() {
        let mut auction = record(10_000);
        auction.settle(&notice(auction.id, true, Some(9_999)));
        assert_eq!(auction.status, AuctionStatus::ReserveNotMet);
        assert_eq!(auction.sold_amount, Some(9_999));
    }

    #[test]
    fn settle_unsold() {
        let mut auction = record(0);
        auction.settle(&notice(auction.id, false, None));
        assert_eq!(auction.status, AuctionStatus::ReserveNotMet);
        assert_eq!(auction.winner, None);
    }

    #[test]
    fn settle_is_idempotent() {
        let mut auction = record(100);
        assert!(auction.settle(&notice(auction.id, true, Some(200))));
        let settled = auction.clone();
        assert!(!auction.settle(&notice(auction.id, false, None)));
        assert_eq!(auction, settled);
    }

    #[test]
    fn patch_reports_changes() {
        let mut auction = record(100);
        assert!(!auction.apply_patch(&AuctionPatch::default()));
        assert!(!auction.apply_patch(&AuctionPatch {
            make: Some("Toyota".to_string()),
            ..AuctionPatch::default()
        }));
        assert!(auction.apply_patch(&AuctionPatch {
            mileage: Some(60_000),
            ..AuctionPatch::default()
        }));
        assert_eq!(auction.mileage, 60_000);
        assert_eq!(auction.make, "Toyota");
    }

    #[test]
    fn modified_at_strictly_increases() {
        let t = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(next_modified_at(t, t + Duration::seconds(1)), t + Duration::seconds(1));
        assert_eq!(next_modified_at(t, t), t + Duration::microseconds(1));
        assert_eq!(
            next_modified_at(t, t - Duration::seconds(5)),
            t + Duration::microseconds(1)
        );
    }

    #[test]
    fn auction_id_parses_display() {
        let id = AuctionId::new();
        assert_eq!(id.to_string().parse::<AuctionId>().unwrap(), id);
    }

    proptest::proptest! {
        /// Whatever the clock does, a sequence of writes never repeats or
        /// reverses a last-modified timestamp.
        #[test]
        fn modified_at_is_strictly_monotonic(
            steps in proptest::collection::vec(-5_000i64..5_000, 1..32)
        ) {
            let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
            let mut clock = start;
            let mut modified = start;
            for step in steps {
                clock += Duration::microseconds(step);
                let next = next_modified_at(modified, clock);
                proptest::prop_assert!(next > modified);
                proptest::prop_assert!(next >= clock);
                modified = next;
            }
        }

        /// Applying the same patch twice reports a change at most once.
        #[test]
        fn patch_is_idempotent(mileage in 0..500_000i32, year in 1990..2026i32) {
            let mut auction = record(1_000);
            let patch = AuctionPatch {
                mileage: Some(mileage),
                year: Some(year),
                ..AuctionPatch::default()
            };
            auction.apply_patch(&patch);
            let settled = auction.clone();
            proptest::prop_assert!(!auction.apply_patch(&patch));
            proptest::prop_assert_eq!(auction, settled);
        }
    }
}
