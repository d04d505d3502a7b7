//! # Gavel Runtime
//!
//! Background machinery shared by the auction and search services.
//!
//! ## Core Components
//!
//! - **Dispatcher**: Polls the outbox and publishes to the event bus
//! - **Retry**: Bounded exponential backoff for transient failures
//! - **Keyed locks**: Per-identity mutual exclusion for monotonic apply
//! - **Metrics**: Prometheus recorder and counters for the sync path

/// Outbox dispatcher loop
pub mod dispatcher;

/// Per-key mutual exclusion
pub mod keyed_lock;

/// Prometheus metrics for observability
pub mod metrics;

/// Retry logic with exponential backoff
pub mod retry;

pub use dispatcher::{DispatchError, DispatchReport, DispatcherConfig, OutboxDispatcher};
pub use keyed_lock::KeyedLocks;
pub use retry::RetryPolicy;
