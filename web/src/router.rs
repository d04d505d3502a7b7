//! Router assembly for both services.

use crate::handlers::{auctions, health, search};
use crate::middleware::track_requests;
use crate::state::{AuctionApiState, SearchApiState};
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

/// Routes served by the auction service.
///
/// | Method | Path | |
/// |--------|------|-|
/// | GET | `/api/auctions[?modifiedSince=]` | list, or delta read |
/// | POST | `/api/auctions` | create |
/// | GET, PUT, DELETE | `/api/auctions/{id}` | read, update, delete |
/// | POST | `/api/auctions/{id}/finish` | settle |
/// | GET | `/health`, `/health/ready`, `/metrics` | operations |
pub fn auction_router(state: AuctionApiState) -> Router {
    Router::new()
        .route(
            "/api/auctions",
            get(auctions::list_auctions).post(auctions::create_auction),
        )
        .route(
            "/api/auctions/:id",
            get(auctions::get_auction)
                .put(auctions::update_auction)
                .delete(auctions::delete_auction),
        )
        .route("/api/auctions/:id/finish", post(auctions::finish_auction))
        .route("/health", get(health::health_check))
        .route("/health/ready", get(health::auction_readiness))
        .route("/metrics", get(health::render_metrics))
        .layer(axum::middleware::from_fn(track_requests))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Routes served by the search service.
pub fn search_router(state: SearchApiState) -> Router {
    Router::new()
        .route("/api/search", get(search::search))
        .route("/health", get(health::health_check))
        .route("/health/ready", get(health::search_readiness))
        .route("/metrics", get(health::render_metrics))
        .layer(axum::middleware::from_fn(track_requests))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
