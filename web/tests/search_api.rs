//! Search service routes against the in-memory read model.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::Duration;
use gavel_core::auction::{AuctionId, AuctionRecord};
use gavel_core::event::SerializedEvent;
use gavel_core::poison::{FailureKind, NewPoisonedEvent, PoisonStore};
use gavel_core::query::SearchPage;
use gavel_projections::SearchIndexer;
use gavel_testing::fixtures::{epoch_2025, new_auction, toyota};
use gavel_testing::{test_clock, InMemoryPoisonStore, InMemorySearchStore};
use gavel_web::{search_router, SearchApiState};
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;

struct Api {
    app: Router,
    indexer: Arc<SearchIndexer>,
    search: InMemorySearchStore,
    poison: InMemoryPoisonStore,
}

fn api() -> Api {
    let search = InMemorySearchStore::new();
    let poison = InMemoryPoisonStore::new();
    let indexer = Arc::new(SearchIndexer::new(Arc::new(search.clone())));
    let state = SearchApiState::new(
        Arc::clone(&indexer),
        Arc::new(poison.clone()),
        Arc::new(test_clock()),
    );
    Api {
        app: search_router(state),
        indexer,
        search,
        poison,
    }
}

impl Api {
    async fn get(&self, uri: &str) -> (StatusCode, Value) {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    async fn page(&self, uri: &str) -> SearchPage {
        let (status, body) = self.get(uri).await;
        assert_eq!(status, StatusCode::OK);
        serde_json::from_value(body).unwrap()
    }

    async fn index(&self, record: &AuctionRecord) {
        self.indexer.apply_record(record).await.unwrap();
    }
}

fn auction(make: &str, model: &str, ends_in: Duration) -> AuctionRecord {
    let opened = epoch_2025() - Duration::days(1);
    let mut request = new_auction(make, model);
    request.auction_end = epoch_2025() + ends_in;
    AuctionRecord::open(AuctionId::new(), request, opened)
}

fn makes(page: &SearchPage) -> Vec<&str> {
    page.results.iter().map(|doc| doc.make.as_str()).collect()
}

#[tokio::test]
async fn default_search_lists_live_auctions_by_end() {
    let api = api();
    api.index(&auction("Ford", "GT", Duration::days(3))).await;
    api.index(&auction("Audi", "R8", Duration::days(1))).await;
    api.index(&auction("Bmw", "M3", -Duration::hours(1))).await;

    let page = api.page("/api/search").await;

    assert_eq!(makes(&page), vec!["Audi", "Ford"]);
    assert_eq!(page.total_count, 2);
    assert_eq!(page.page_count, 1);
}

#[tokio::test]
async fn term_matches_make_model_or_color() {
    let api = api();
    api.index(&toyota(epoch_2025())).await;
    api.index(&auction("Ford", "Mustang", Duration::days(2))).await;

    let by_model = api.page("/api/search?searchTerm=corolla").await;
    let by_color = api.page("/api/search?searchTerm=WHITE").await;

    assert_eq!(makes(&by_model), vec!["Toyota"]);
    assert_eq!(by_color.total_count, 2);
}

#[tokio::test]
async fn filters_and_ordering() {
    let api = api();
    api.index(&auction("Ford", "GT", Duration::hours(2))).await;
    api.index(&auction("Audi", "R8", Duration::days(2))).await;
    api.index(&auction("Bmw", "M3", -Duration::hours(1))).await;

    let ending = api.page("/api/search?filterBy=endingSoon").await;
    let finished = api.page("/api/search?filterBy=finished").await;
    let by_make = api.page("/api/search?orderBy=make").await;

    assert_eq!(makes(&ending), vec!["Ford"]);
    assert_eq!(makes(&finished), vec!["Bmw"]);
    assert_eq!(makes(&by_make), vec!["Audi", "Ford"]);
}

#[tokio::test]
async fn pages_through_results() {
    let api = api();
    for (i, make) in ["A", "B", "C", "D", "E"].iter().enumerate() {
        let hours = i64::try_from(i).unwrap() + 1;
        api.index(&auction(make, "X", Duration::hours(hours * 24))).await;
    }

    let first = api.page("/api/search?pageSize=2").await;
    let last = api.page("/api/search?pageSize=2&pageNumber=3").await;

    assert_eq!(makes(&first), vec!["A", "B"]);
    assert_eq!(first.page_count, 3);
    assert_eq!(makes(&last), vec!["E"]);
    assert_eq!(last.total_count, 5);
}

#[tokio::test]
async fn seller_and_winner_filters() {
    let api = api();
    let mut sold = auction("Ford", "GT", Duration::days(1));
    sold.seller = "carol".to_string();
    sold.winner = Some("dave".to_string());
    api.index(&sold).await;
    api.index(&auction("Audi", "R8", Duration::days(1))).await;

    let by_seller = api.page("/api/search?seller=carol").await;
    let by_winner = api.page("/api/search?winner=dave").await;

    assert_eq!(makes(&by_seller), vec!["Ford"]);
    assert_eq!(makes(&by_winner), vec!["Ford"]);
}

#[tokio::test]
async fn unavailable_read_model_is_503() {
    let api = api();
    api.search.set_unavailable(true);

    let (search, body) = api.get("/api/search").await;
    let (ready, _) = api.get("/health/ready").await;

    assert_eq!(search, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], "SERVICE_UNAVAILABLE");
    assert_eq!(ready, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn readiness_degrades_with_parked_events() {
    let api = api();
    api.index(&toyota(epoch_2025())).await;

    let (_, healthy) = api.get("/health/ready").await;
    api.poison
        .park(NewPoisonedEvent {
            topic: "auctions.updated".to_string(),
            event: SerializedEvent::new(
                "AuctionUpdated".to_string(),
                1,
                AuctionId::new().to_string(),
                b"{".to_vec(),
            ),
            kind: FailureKind::Malformed,
            error_message: "EOF while parsing".to_string(),
            attempts: 1,
        })
        .await
        .unwrap();
    let (status, degraded) = api.get("/health/ready").await;

    assert_eq!(healthy["status"], "ready");
    assert_eq!(healthy["documents"], 1);
    assert_eq!(status, StatusCode::OK);
    assert_eq!(degraded["status"], "degraded");
    assert_eq!(degraded["poisoned"], 1);
}

#[tokio::test]
async fn readiness_degrades_while_auctions_are_stale() {
    let api = api();
    api.indexer.mark_exhausted(AuctionId::new());

    let (_, body) = api.get("/health/ready").await;

    assert_eq!(body["status"], "degraded");
    assert_eq!(body["stale"], 1);
}
