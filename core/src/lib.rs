//! # Gavel Core
//!
//! Domain types and port traits for keeping the auction search index in
//! sync with the authoritative auction store.
//!
//! This crate performs no I/O. It defines what flows between the two
//! services and the contracts each adapter must honor; the runtime,
//! Postgres, Redpanda and projection crates provide the implementations.
//!
//! ## Core Concepts
//!
//! - **AuctionRecord**: The authoritative row, owned by the auction service
//! - **EventEnvelope**: Versioned event carrying a full snapshot (or identity for deletes)
//! - **Outbox**: Events committed in the same transaction as the business write
//! - **SearchDocument**: The read-model projection, guarded by monotonic apply
//! - **Watermark**: Newest applied timestamp, computed from the read model itself
//!
//! ## Data Flow
//!
//! ```text
//! write ─▶ auctions + outbox (one tx) ─▶ dispatcher ─▶ broker ─▶ consumer ─▶ search index
//!                                                                    ▲
//!              GET /api/auctions?modifiedSince=<watermark> ── reconciler
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

pub mod auction;
pub mod environment;
pub mod event;
pub mod event_bus;
pub mod freshness;
pub mod outbox;
pub mod poison;
pub mod projection;
pub mod query;
pub mod routing;
pub mod source;
pub mod validation;
