//! Health and metrics endpoints.
//!
//! Used by load balancers and monitoring systems.

use crate::state::{AuctionApiState, MetricsHandle, SearchApiState};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// Liveness: 200 while the process is serving requests.
///
/// Does NOT check dependencies.
///
/// # Endpoint
///
/// ```text
/// GET /health
/// ```
#[allow(clippy::unused_async)]
pub async fn health_check() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

/// Readiness report of the auction service.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuctionReadiness {
    /// "ready" or "unavailable"
    pub status: &'static str,
    /// Outbox entries not yet acknowledged by the broker
    pub pending_outbox: Option<i64>,
}

/// Readiness of the auction service: the database answers.
///
/// # Endpoint
///
/// ```text
/// GET /health/ready
/// ```
///
/// # Status Codes
///
/// - 200 OK: outbox reachable (body carries the pending count)
/// - 503 Service Unavailable: database unreachable
pub async fn auction_readiness(
    State(state): State<AuctionApiState>,
) -> (StatusCode, Json<AuctionReadiness>) {
    match state.outbox.count_pending().await {
        Ok(pending) => (
            StatusCode::OK,
            Json(AuctionReadiness {
                status: "ready",
                pending_outbox: Some(pending),
            }),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(AuctionReadiness {
                    status: "unavailable",
                    pending_outbox: None,
                }),
            )
        },
    }
}

/// Readiness report of the search service.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchReadiness {
    /// "ready", "degraded" or "unavailable"
    pub status: &'static str,
    /// Documents in the read model
    pub documents: Option<i64>,
    /// Parked events awaiting an operator
    pub poisoned: Option<i64>,
    /// Auctions whose events exhausted their retries and await reconciliation
    pub stale: usize,
}

/// Readiness of the search service.
///
/// # Endpoint
///
/// ```text
/// GET /health/ready
/// ```
///
/// # Status Codes
///
/// - 200 OK: read model reachable. `degraded` when events are parked or
///   auctions are waiting on the reconciler.
/// - 503 Service Unavailable: read model or dead-letter table unreachable
pub async fn search_readiness(
    State(state): State<SearchApiState>,
) -> (StatusCode, Json<SearchReadiness>) {
    let stale = state.indexer.stale_prolonged().len();
    let documents = state.indexer.store().count().await;
    let poisoned = state.poison.count_pending().await;

    match (documents, poisoned) {
        (Ok(documents), Ok(poisoned)) => {
            let status = if poisoned > 0 || stale > 0 {
                "degraded"
            } else {
                "ready"
            };
            (
                StatusCode::OK,
                Json(SearchReadiness {
                    status,
                    documents: Some(documents),
                    poisoned: Some(poisoned),
                    stale,
                }),
            )
        },
        (documents, poisoned) => {
            tracing::warn!(
                documents = ?documents.as_ref().err(),
                poisoned = ?poisoned.as_ref().err(),
                "Readiness check failed"
            );
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(SearchReadiness {
                    status: "unavailable",
                    documents: documents.ok(),
                    poisoned: poisoned.ok(),
                    stale,
                }),
            )
        },
    }
}

/// Prometheus exposition.
///
/// # Endpoint
///
/// ```text
/// GET /metrics
/// ```
///
/// 404 when no recorder is installed.
#[allow(clippy::unused_async)]
pub async fn render_metrics(State(metrics): State<MetricsHandle>) -> Response {
    match metrics.0 {
        Some(recorder) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            recorder.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn liveness_is_ok() {
        let (status, body) = health_check().await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn metrics_without_recorder_is_not_found() {
        let response = render_metrics(State(MetricsHandle::default())).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
