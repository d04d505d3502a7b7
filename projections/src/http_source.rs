//! HTTP client for the authoritative delta-read endpoint.
//!
//! `GET {base_url}/api/auctions?modifiedSince=<RFC 3339>` returns every record
//! modified strictly after the timestamp, oldest first. Retries are the
//! reconciler's job; this client makes exactly one request per call.

use chrono::{DateTime, SecondsFormat, Utc};
use gavel_core::auction::AuctionRecord;
use gavel_core::source::{AuctionSource, SourceError};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// [`AuctionSource`] backed by the auction service's HTTP API.
#[derive(Clone, Debug)]
pub struct HttpAuctionSource {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpAuctionSource {
    /// Create a client for the auction service at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Unreachable`] if the HTTP client cannot be built.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SourceError::Unreachable(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: format!("{}/api/auctions", base_url.trim_end_matches('/')),
        })
    }

    /// The delta-read URL without its query string.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn fetch(&self, since: DateTime<Utc>) -> Result<Vec<AuctionRecord>, SourceError> {
        let modified_since = since.to_rfc3339_opts(SecondsFormat::Micros, true);
        tracing::debug!(endpoint = %self.endpoint, modified_since = %modified_since, "Fetching delta");

        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("modifiedSince", modified_since.as_str())])
            .send()
            .await
            .map_err(|e| SourceError::Unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::Status {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<Vec<AuctionRecord>>()
            .await
            .map_err(|e| SourceError::Decode(e.to_string()))
    }
}

impl AuctionSource for HttpAuctionSource {
    fn fetch_modified_since(
        &self,
        since: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<AuctionRecord>, SourceError>> + Send + '_>> {
        Box::pin(self.fetch(since))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::extract::Query;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Json;
    use gavel_testing::fixtures::{epoch_2025, toyota};
    use std::collections::HashMap;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn sends_watermark_and_decodes_records() {
        let record = toyota(epoch_2025());
        let served = record.clone();
        let app = Router::new().route(
            "/api/auctions",
            get(move |Query(params): Query<HashMap<String, String>>| {
                let served = served.clone();
                async move {
                    let since: DateTime<Utc> = params["modifiedSince"].parse().unwrap();
                    if since < served.updated_at {
                        Json(vec![served])
                    } else {
                        Json(Vec::new())
                    }
                }
            }),
        );
        let source = HttpAuctionSource::new(&serve(app).await, DEFAULT_TIMEOUT).unwrap();

        let all = source
            .fetch_modified_since(DateTime::<Utc>::UNIX_EPOCH)
            .await
            .unwrap();
        let none = source.fetch_modified_since(record.updated_at).await.unwrap();

        assert_eq!(all, vec![record]);
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn server_error_is_transient() {
        let app = Router::new().route(
            "/api/auctions",
            get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "down") }),
        );
        let source = HttpAuctionSource::new(&serve(app).await, DEFAULT_TIMEOUT).unwrap();

        let err = source.fetch_modified_since(epoch_2025()).await.unwrap_err();

        assert!(matches!(err, SourceError::Status { status: 503, .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn garbage_body_is_a_decode_error() {
        let app = Router::new().route("/api/auctions", get(|| async { "not json" }));
        let source = HttpAuctionSource::new(&serve(app).await, DEFAULT_TIMEOUT).unwrap();

        let err = source.fetch_modified_since(epoch_2025()).await.unwrap_err();

        assert!(matches!(err, SourceError::Decode(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn closed_port_is_unreachable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let source = HttpAuctionSource::new(&format!("http://{addr}/"), DEFAULT_TIMEOUT).unwrap();

        let err = source.fetch_modified_since(epoch_2025()).await.unwrap_err();

        assert!(matches!(err, SourceError::Unreachable(_)));
        assert_eq!(source.endpoint(), format!("http://{addr}/api/auctions"));
    }
}
