//! `PostgreSQL` storage for the auction platform.
//!
//! - **[`PostgresAuctionStore`]**: authoritative auction records. Each
//!   mutation writes the record and its outbox row in one transaction.
//! - **[`PostgresOutboxStore`]**: the dispatcher's view of the outbox table.
//! - **[`PostgresPoisonStore`]**: dead-letter storage for the search consumer.
//!
//! The auction store and outbox share the auction database. The dead-letter
//! table lives in the search database, next to the read model.
//!
//! # Example
//!
//! ```ignore
//! use gavel_postgres::{PostgresAuctionStore, PostgresOutboxStore};
//!
//! let store = PostgresAuctionStore::connect(&database_url, SystemClock).await?;
//! store.migrate().await?;
//! let outbox = Arc::new(PostgresOutboxStore::new(store.pool().clone()));
//! let dispatcher = OutboxDispatcher::new(outbox, event_bus, router, config)?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auction_store;
pub mod dead_letter_queue;
pub mod outbox;

pub use auction_store::PostgresAuctionStore;
pub use dead_letter_queue::PostgresPoisonStore;
pub use outbox::{append, PostgresOutboxStore};
