//! Search read model for the auction platform.
//!
//! # Overview
//!
//! This crate keeps the search service's copy of every auction in sync with
//! the auction service:
//! - **[`SearchIndexer`]**: the one write path, enforcing monotonic apply
//! - **[`ConsumerWorker`]**: applies events from the bus, parking poison messages
//! - **[`CatchUpReconciler`]**: repairs missed events from the delta-read endpoint
//! - **[`HttpAuctionSource`]**: HTTP client for that endpoint
//! - **[`PostgresSearchStore`]**: `PostgreSQL` storage with paged search
//!
//! # CQRS Separation
//!
//! The search database is separate from the auction database:
//!
//! ```text
//! Auction DB (Write)  →  Outbox  →  Event Bus  →  Consumer  →  Search DB (Read)
//!        └──────────── GET /api/auctions?modifiedSince ──── Reconciler ──┘
//! ```
//!
//! # Wiring
//!
//! ```ignore
//! use gavel_projections::{CatchUpReconciler, ConsumerWorker, SearchIndexer};
//!
//! let store = Arc::new(PostgresSearchStore::connect(&database_url).await?);
//! let indexer = Arc::new(SearchIndexer::new(store));
//!
//! let reconciler = CatchUpReconciler::new(source, Arc::clone(&indexer), ReconcilerConfig::default());
//! reconciler.run_at_startup().await;
//!
//! let consumer = ConsumerWorker::new(indexer, event_bus, poison_store, router, ConsumerConfig::default());
//! consumer.run(shutdown_rx).await?;
//! ```

pub mod consumer;
pub mod http_source;
pub mod indexer;
pub mod postgres;
pub mod reconciler;

// Re-export main types for convenience
pub use consumer::{ConsumeError, ConsumerConfig, ConsumerWorker, Disposition, HandlerTable};
pub use http_source::HttpAuctionSource;
pub use indexer::{ApplyError, ApplyOutcome, SearchIndexer};
pub use postgres::PostgresSearchStore;
pub use reconciler::{CatchUpReconciler, ReconcileError, ReconcileReport, ReconcilerConfig};
