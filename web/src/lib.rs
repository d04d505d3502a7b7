//! Axum routers for the auction platform.
//!
//! Two routers, one per service:
//!
//! - [`auction_router`]: the authoritative write API and the delta-read
//!   endpoint (`GET /api/auctions?modifiedSince=`) the search side's
//!   reconciler polls.
//! - [`search_router`]: paged search over the read model.
//!
//! Both carry `/health`, `/health/ready` and `/metrics`, and tag every
//! request with a correlation ID.
//!
//! # Example
//!
//! ```ignore
//! use gavel_web::{auction_router, AuctionApiState};
//!
//! let state = AuctionApiState::new(store, outbox).with_metrics(recorder);
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//! axum::serve(listener, auction_router(state)).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod router;
pub mod state;

// Re-export key types for convenience
pub use error::AppError;
pub use middleware::{track_requests, CorrelationId, CORRELATION_ID_HEADER};
pub use router::{auction_router, search_router};
pub use state::{AuctionApiState, MetricsHandle, SearchApiState};

/// Result type alias for web handlers.
pub type WebResult<T> = Result<T, AppError>;
