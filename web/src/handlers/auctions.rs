//! Authoritative auction endpoints, including the delta read the search
//! side's reconciler calls.

use crate::error::AppError;
use crate::state::AuctionApiState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use gavel_core::auction::{AuctionFinished, AuctionId, AuctionPatch, AuctionRecord, NewAuction};
use serde::Deserialize;

/// Query string of `GET /api/auctions`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListParams {
    /// RFC 3339 timestamp; when present only records modified strictly
    /// after it are returned, oldest modification first.
    pub modified_since: Option<String>,
}

/// Body of `POST /api/auctions/{id}/finish`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishRequest {
    /// Whether any bid was accepted
    pub item_sold: bool,
    /// Highest bidder
    pub winner: Option<String>,
    /// Highest bid amount
    pub amount: Option<i32>,
}

fn parse_since(raw: &str) -> Result<DateTime<Utc>, AppError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| AppError::bad_request(format!("Invalid modifiedSince '{raw}': {e}")))
}

/// `GET /api/auctions[?modifiedSince=]`
///
/// Without a timestamp, every auction ordered by make. With one, the delta
/// read: records modified strictly after it ordered by modification time.
/// A timestamp older than any data returns everything.
///
/// # Errors
///
/// 400 for an unparsable timestamp, 503 if storage is unavailable.
pub async fn list_auctions(
    State(state): State<AuctionApiState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<AuctionRecord>>, AppError> {
    let records = match params.modified_since.as_deref() {
        Some(raw) => {
            let since = parse_since(raw)?;
            let records = state.store.modified_since(since).await?;
            tracing::debug!(modified_since = %since, count = records.len(), "Served delta read");
            records
        },
        None => state.store.list().await?,
    };
    Ok(Json(records))
}

/// `GET /api/auctions/{id}`
///
/// # Errors
///
/// 404 if the auction does not exist.
pub async fn get_auction(
    State(state): State<AuctionApiState>,
    Path(id): Path<AuctionId>,
) -> Result<Json<AuctionRecord>, AppError> {
    state
        .store
        .get(id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::not_found("Auction", id))
}

/// `POST /api/auctions`
///
/// # Errors
///
/// 422 if the request violates a domain rule.
pub async fn create_auction(
    State(state): State<AuctionApiState>,
    Json(request): Json<NewAuction>,
) -> Result<(StatusCode, Json<AuctionRecord>), AppError> {
    let record = state.store.create(request).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

/// `PUT /api/auctions/{id}`
///
/// Fields missing from the body keep their value.
///
/// # Errors
///
/// 404 if the auction does not exist, 422 if the result is invalid.
pub async fn update_auction(
    State(state): State<AuctionApiState>,
    Path(id): Path<AuctionId>,
    Json(patch): Json<AuctionPatch>,
) -> Result<Json<AuctionRecord>, AppError> {
    Ok(Json(state.store.update(id, patch).await?))
}

/// `DELETE /api/auctions/{id}`
///
/// # Errors
///
/// 404 if the auction does not exist.
pub async fn delete_auction(
    State(state): State<AuctionApiState>,
    Path(id): Path<AuctionId>,
) -> Result<StatusCode, AppError> {
    state.store.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /api/auctions/{id}/finish`
///
/// Settles a live auction. Repeating the call is a no-op that returns the
/// record as already settled.
///
/// # Errors
///
/// 404 if the auction does not exist.
pub async fn finish_auction(
    State(state): State<AuctionApiState>,
    Path(id): Path<AuctionId>,
    Json(request): Json<FinishRequest>,
) -> Result<Json<AuctionRecord>, AppError> {
    let notice = AuctionFinished {
        auction_id: id,
        item_sold: request.item_sold,
        winner: request.winner,
        amount: request.amount,
    };
    if let Some(record) = state.store.settle(notice).await? {
        return Ok(Json(record));
    }
    state
        .store
        .get(id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::not_found("Auction", id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn since_accepts_offsets_and_rejects_garbage() {
        let parsed = parse_since("2025-01-01T02:00:00+02:00");
        assert!(matches!(parsed, Ok(ts) if ts.to_rfc3339() == "2025-01-01T00:00:00+00:00"));
        assert!(parse_since("yesterday").is_err());
    }
}
