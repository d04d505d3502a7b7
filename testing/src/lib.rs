//! # Gavel Testing
//!
//! Testing utilities for the auction read-model synchronization layer.
//!
//! This crate provides:
//! - Deterministic clocks ([`FixedClock`], [`ManualClock`])
//! - In-memory implementations of every port, with fault injection
//! - Fixtures for auctions and events
//! - proptest strategies for property-based tests
//!
//! ## Example
//!
//! ```ignore
//! use gavel_testing::{InMemoryAuctionStore, InMemoryEventBus, fixtures};
//!
//! #[tokio::test]
//! async fn created_auction_reaches_the_outbox() {
//!     let store = InMemoryAuctionStore::new(fixtures::manual_clock());
//!     store.create(fixtures::new_toyota()).await.unwrap();
//!     assert_eq!(store.pending_entries().len(), 1);
//! }
//! ```

use chrono::{DateTime, Utc};
use gavel_core::environment::Clock;

pub mod auction_store;
pub mod event_bus;
pub mod projection_mocks;

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use chrono::Duration;
    use std::sync::{Arc, Mutex, PoisonError};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use gavel_testing::mocks::FixedClock;
    /// use gavel_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when a test advances it.
    ///
    /// Clones share the same time, so a test can keep one handle and give
    /// another to the store under test.
    ///
    /// # Example
    ///
    /// ```
    /// use gavel_testing::mocks::ManualClock;
    /// use gavel_core::environment::Clock;
    /// use chrono::{Duration, Utc};
    ///
    /// let clock = ManualClock::new(Utc::now());
    /// let before = clock.now();
    /// clock.advance(Duration::minutes(5));
    /// assert_eq!(clock.now() - before, Duration::minutes(5));
    /// ```
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Create a clock stopped at `time`
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Move the clock forward
        pub fn advance(&self, by: Duration) {
            let mut time = self.time.lock().unwrap_or_else(PoisonError::into_inner);
            *time += by;
        }

        /// Jump to an absolute time
        pub fn set(&self, to: DateTime<Utc>) {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner) = to;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(crate::fixtures::epoch_2025())
    }
}

/// Auction and event fixtures
pub mod fixtures {
    use super::mocks::ManualClock;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use gavel_core::auction::{AuctionId, AuctionRecord, NewAuction};

    /// 2025-01-01 00:00:00 UTC
    #[must_use]
    pub fn epoch_2025() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }

    /// Manual clock starting at [`epoch_2025`]
    #[must_use]
    pub fn manual_clock() -> ManualClock {
        ManualClock::new(epoch_2025())
    }

    /// Creation request for a live auction ending ten days after [`epoch_2025`]
    #[must_use]
    pub fn new_auction(make: &str, model: &str) -> NewAuction {
        NewAuction {
            make: make.to_string(),
            model: model.to_string(),
            color: "White".to_string(),
            mileage: 25_000,
            year: 2019,
            reserve_price: 15_000,
            auction_end: epoch_2025() + Duration::days(10),
            seller: "alice".to_string(),
        }
    }

    /// Creation request for a Toyota Corolla
    #[must_use]
    pub fn new_toyota() -> NewAuction {
        new_auction("Toyota", "Corolla")
    }

    /// A live Toyota record opened at `now`
    #[must_use]
    pub fn toyota(now: DateTime<Utc>) -> AuctionRecord {
        AuctionRecord::open(AuctionId::new(), new_toyota(), now)
    }
}

/// Property-based testing utilities
pub mod properties {
    use gavel_core::auction::AuctionPatch;
    use proptest::prelude::*;

    /// One step of a write workload against a single auction
    #[derive(Debug, Clone)]
    pub enum WriteOp {
        /// Patch the auction after `advance_ms`
        Update {
            /// Clock advance before the write
            advance_ms: i64,
            /// Fields to change
            patch: AuctionPatch,
        },
        /// Delete the auction after `advance_ms`
        Delete {
            /// Clock advance before the write
            advance_ms: i64,
        },
    }

    /// Patches that always change at least the mileage
    pub fn arb_patch() -> impl Strategy<Value = AuctionPatch> {
        (
            0..500_000i32,
            proptest::option::of(prop_oneof![
                Just("Red".to_string()),
                Just("Blue".to_string()),
                Just("Silver".to_string()),
            ]),
            proptest::option::of(1990..2025i32),
        )
            .prop_map(|(mileage, color, year)| AuctionPatch {
                mileage: Some(mileage),
                color,
                year,
                ..AuctionPatch::default()
            })
    }

    /// Workloads of updates, possibly ending in a delete
    pub fn arb_workload() -> impl Strategy<Value = Vec<WriteOp>> {
        (
            proptest::collection::vec(
                (0..2_000i64, arb_patch())
                    .prop_map(|(advance_ms, patch)| WriteOp::Update { advance_ms, patch }),
                0..8,
            ),
            proptest::option::of(0..2_000i64),
        )
            .prop_map(|(mut ops, delete)| {
                if let Some(advance_ms) = delete {
                    ops.push(WriteOp::Delete { advance_ms });
                }
                ops
            })
    }
}

/// Install a test-friendly tracing subscriber once.
///
/// Honors `RUST_LOG`; output is captured per test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// Re-export commonly used items
pub use auction_store::InMemoryAuctionStore;
pub use event_bus::InMemoryEventBus;
pub use mocks::{FixedClock, ManualClock, test_clock};
pub use projection_mocks::{InMemoryPoisonStore, InMemorySearchStore};

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        assert_eq!(clock.now(), fixtures::epoch_2025());
        assert_eq!(clock.now(), clock.now());
    }

    #[test]
    fn manual_clock_clones_share_time() {
        let clock = fixtures::manual_clock();
        let handle = clock.clone();
        handle.advance(Duration::seconds(3));
        assert_eq!(clock.now(), fixtures::epoch_2025() + Duration::seconds(3));
    }
}
