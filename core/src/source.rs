//! Delta-read port onto the authoritative auction service.

use crate::auction::AuctionRecord;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors reading from the authoritative source.
#[derive(Error, Debug, Clone)]
pub enum SourceError {
    /// The service could not be reached.
    #[error("Auction service unreachable: {0}")]
    Unreachable(String),

    /// The service answered with a non-success status.
    #[error("Auction service returned status {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body, possibly truncated
        body: String,
    },

    /// The response body could not be decoded.
    #[error("Failed to decode auction service response: {0}")]
    Decode(String),
}

impl SourceError {
    /// Whether retrying the request may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Unreachable(_) => true,
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            Self::Decode(_) => false,
        }
    }
}

/// The authoritative service's "changed since" endpoint.
pub trait AuctionSource: Send + Sync {
    /// Every record modified strictly after `since`, oldest modification first.
    ///
    /// # Errors
    ///
    /// Returns a [`SourceError`] if the service cannot be queried.
    fn fetch_modified_since(
        &self,
        since: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<AuctionRecord>, SourceError>> + Send + '_>>;
}
