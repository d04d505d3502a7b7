//! Search over the read model.

use crate::error::AppError;
use crate::state::SearchApiState;
use axum::extract::{Query, State};
use axum::Json;
use gavel_core::query::{FilterBy, OrderBy, SearchPage, SearchQuery, DEFAULT_PAGE_SIZE};
use serde::Deserialize;

/// Largest page a caller may request.
pub const MAX_PAGE_SIZE: u32 = 100;

/// Query string of `GET /api/search`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchParams {
    /// Term matched against make, model and color
    pub search_term: Option<String>,
    /// One-based page number
    pub page_number: Option<u32>,
    /// Results per page
    pub page_size: Option<u32>,
    /// Only auctions by this seller
    pub seller: Option<String>,
    /// Only auctions won by this bidder
    pub winner: Option<String>,
    /// `make`, `new` or auction end (default)
    pub order_by: Option<String>,
    /// `finished`, `endingSoon` or live (default)
    pub filter_by: Option<String>,
}

impl From<SearchParams> for SearchQuery {
    fn from(params: SearchParams) -> Self {
        Self {
            term: params.search_term.filter(|t| !t.trim().is_empty()),
            order_by: OrderBy::from_param(params.order_by.as_deref()),
            filter_by: FilterBy::from_param(params.filter_by.as_deref()),
            seller: params.seller,
            winner: params.winner,
            page_number: params.page_number.unwrap_or(1).max(1),
            page_size: params
                .page_size
                .unwrap_or(DEFAULT_PAGE_SIZE)
                .clamp(1, MAX_PAGE_SIZE),
        }
    }
}

/// `GET /api/search`
///
/// # Errors
///
/// 503 if the read model is unavailable.
pub async fn search(
    State(state): State<SearchApiState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<SearchPage>, AppError> {
    let query = SearchQuery::from(params);
    let page = state
        .indexer
        .store()
        .search(&query, state.clock.now())
        .await?;
    tracing::debug!(
        term = ?query.term,
        page = query.page_number,
        total = page.total_count,
        "Search served"
    );
    Ok(Json(page))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_map_onto_query() {
        let query = SearchQuery::from(SearchParams {
            search_term: Some("ford".to_string()),
            page_number: Some(0),
            page_size: Some(1_000),
            order_by: Some("make".to_string()),
            filter_by: Some("endingSoon".to_string()),
            ..SearchParams::default()
        });

        assert_eq!(query.term.as_deref(), Some("ford"));
        assert_eq!(query.page_number, 1);
        assert_eq!(query.page_size, MAX_PAGE_SIZE);
        assert_eq!(query.order_by, OrderBy::Make);
        assert_eq!(query.filter_by, FilterBy::EndingSoon);
    }

    #[test]
    fn empty_params_are_the_default_query() {
        let query = SearchQuery::from(SearchParams {
            search_term: Some("  ".to_string()),
            ..SearchParams::default()
        });
        assert_eq!(query, SearchQuery::default());
    }
}
