//! Shared state for the two routers.
//!
//! Both are plain bundles of `Arc`ed ports wired at startup. Handlers pull
//! the piece they need through [`axum::extract::FromRef`].

use axum::extract::FromRef;
use gavel_core::auction::AuctionStore;
use gavel_core::environment::Clock;
use gavel_core::outbox::OutboxStore;
use gavel_core::poison::PoisonStore;
use gavel_projections::SearchIndexer;
use gavel_runtime::metrics::MetricsRecorder;
use std::sync::Arc;

/// Prometheus handle, absent when no recorder was installed.
#[derive(Clone, Default)]
pub struct MetricsHandle(pub Option<MetricsRecorder>);

/// State behind the auction service's router.
#[derive(Clone, FromRef)]
pub struct AuctionApiState {
    /// Authoritative store
    pub store: Arc<dyn AuctionStore>,
    /// Outbox, for readiness reporting
    pub outbox: Arc<dyn OutboxStore>,
    /// Metrics exposition
    pub metrics: MetricsHandle,
}

impl AuctionApiState {
    /// Bundle the auction-side ports.
    #[must_use]
    pub fn new(store: Arc<dyn AuctionStore>, outbox: Arc<dyn OutboxStore>) -> Self {
        Self {
            store,
            outbox,
            metrics: MetricsHandle::default(),
        }
    }

    /// Serve `/metrics` from `recorder`.
    #[must_use]
    pub fn with_metrics(mut self, recorder: MetricsRecorder) -> Self {
        self.metrics = MetricsHandle(Some(recorder));
        self
    }
}

/// State behind the search service's router.
#[derive(Clone, FromRef)]
pub struct SearchApiState {
    /// Read-model writer; queries go through its store
    pub indexer: Arc<SearchIndexer>,
    /// Dead-letter store, for readiness reporting
    pub poison: Arc<dyn PoisonStore>,
    /// Time source for the ending-soon and finished windows
    pub clock: Arc<dyn Clock>,
    /// Metrics exposition
    pub metrics: MetricsHandle,
}

impl SearchApiState {
    /// Bundle the search-side ports.
    #[must_use]
    pub fn new(
        indexer: Arc<SearchIndexer>,
        poison: Arc<dyn PoisonStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            indexer,
            poison,
            clock,
            metrics: MetricsHandle::default(),
        }
    }

    /// Serve `/metrics` from `recorder`.
    #[must_use]
    pub fn with_metrics(mut self, recorder: MetricsRecorder) -> Self {
        self.metrics = MetricsHandle(Some(recorder));
        self
    }
}
