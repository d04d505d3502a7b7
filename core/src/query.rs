//! Search query over the read model.
//!
//! Stores either evaluate [`SearchQuery`] in memory with [`SearchQuery::run`]
//! or translate it to their own query language; both must agree on the
//! filtering, ordering and paging rules defined here.

use crate::projection::SearchDocument;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Auctions ending within this window count as ending soon.
pub const ENDING_SOON_WINDOW_HOURS: i64 = 6;

/// Default page size.
pub const DEFAULT_PAGE_SIZE: u32 = 4;

/// Result ordering.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OrderBy {
    /// Make ascending, then model.
    Make,
    /// Newest auctions first.
    New,
    /// Auctions ending soonest first.
    #[default]
    AuctionEnd,
}

impl OrderBy {
    /// Parse a request parameter. Unknown or missing values use the default.
    #[must_use]
    pub fn from_param(param: Option<&str>) -> Self {
        match param {
            Some("make") => Self::Make,
            Some("new") => Self::New,
            _ => Self::AuctionEnd,
        }
    }

    fn compare(self, a: &SearchDocument, b: &SearchDocument) -> Ordering {
        let primary = match self {
            Self::Make => a.make.cmp(&b.make).then_with(|| a.model.cmp(&b.model)),
            Self::New => b.created_at.cmp(&a.created_at),
            Self::AuctionEnd => a.auction_end.cmp(&b.auction_end),
        };
        primary.then_with(|| a.id.cmp(&b.id))
    }
}

/// Result filtering by auction window.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FilterBy {
    /// The auction window has closed.
    Finished,
    /// Still open, closing within [`ENDING_SOON_WINDOW_HOURS`].
    EndingSoon,
    /// Still open.
    #[default]
    Live,
}

impl FilterBy {
    /// Parse a request parameter. Unknown or missing values use the default.
    #[must_use]
    pub fn from_param(param: Option<&str>) -> Self {
        match param {
            Some("finished") => Self::Finished,
            Some("endingSoon") => Self::EndingSoon,
            _ => Self::Live,
        }
    }

    fn admits(self, auction_end: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self {
            Self::Finished => auction_end < now,
            Self::EndingSoon => {
                auction_end > now && auction_end < now + Duration::hours(ENDING_SOON_WINDOW_HOURS)
            }
            Self::Live => auction_end > now,
        }
    }
}

/// A search request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchQuery {
    /// Case-insensitive term matched against make, model and color.
    pub term: Option<String>,
    /// Result ordering.
    pub order_by: OrderBy,
    /// Window filter.
    pub filter_by: FilterBy,
    /// Only auctions by this seller.
    pub seller: Option<String>,
    /// Only auctions won by this bidder.
    pub winner: Option<String>,
    /// One-based page number.
    pub page_number: u32,
    /// Results per page.
    pub page_size: u32,
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self {
            term: None,
            order_by: OrderBy::default(),
            filter_by: FilterBy::default(),
            seller: None,
            winner: None,
            page_number: 1,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl SearchQuery {
    /// Whether a document satisfies every filter at `now`.
    #[must_use]
    pub fn matches(&self, doc: &SearchDocument, now: DateTime<Utc>) -> bool {
        let term_ok = self.term.as_deref().is_none_or(|term| {
            let term = term.to_lowercase();
            [&doc.make, &doc.model, &doc.color]
                .iter()
                .any(|field| field.to_lowercase().contains(&term))
        });
        let seller_ok = self.seller.as_deref().is_none_or(|s| doc.seller == s);
        let winner_ok = self
            .winner
            .as_deref()
            .is_none_or(|w| doc.winner.as_deref() == Some(w));

        term_ok && seller_ok && winner_ok && self.filter_by.admits(doc.auction_end, now)
    }

    /// Rows to skip for the requested page.
    #[must_use]
    pub fn offset(&self) -> u64 {
        u64::from(self.page_number.max(1) - 1) * u64::from(self.page_size())
    }

    /// Effective page size (never zero).
    #[must_use]
    pub fn page_size(&self) -> u32 {
        self.page_size.max(1)
    }

    /// Filter, order and page an in-memory set of documents.
    #[must_use]
    pub fn run<'a>(
        &self,
        docs: impl IntoIterator<Item = &'a SearchDocument>,
        now: DateTime<Utc>,
    ) -> SearchPage {
        let mut hits: Vec<SearchDocument> = docs
            .into_iter()
            .filter(|doc| self.matches(doc, now))
            .cloned()
            .collect();
        hits.sort_by(|a, b| self.order_by.compare(a, b));

        let total_count = hits.len() as u64;
        let offset = usize::try_from(self.offset()).unwrap_or(usize::MAX);
        let results = hits
            .into_iter()
            .skip(offset)
            .take(self.page_size() as usize)
            .collect();

        SearchPage::new(results, total_count, self.page_size())
    }
}

/// One page of search results.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchPage {
    /// Documents on this page
    pub results: Vec<SearchDocument>,
    /// Number of pages at the requested page size
    pub page_count: u64,
    /// Number of matching documents across all pages
    pub total_count: u64,
}

impl SearchPage {
    /// Assemble a page, deriving the page count.
    #[must_use]
    pub fn new(results: Vec<SearchDocument>, total_count: u64, page_size: u32) -> Self {
        Self {
            results,
            page_count: total_count.div_ceil(u64::from(page_size.max(1))),
            total_count,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::auction::{AuctionId, AuctionStatus};
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 5, 1, 12, 0, 0).unwrap()
    }

    fn doc(make: &str, model: &str, created_days_ago: i64, ends_in_hours: i64) -> SearchDocument {
        let created_at = now() - Duration::days(created_days_ago);
        SearchDocument {
            id: AuctionId::new(),
            make: make.to_string(),
            model: model.to_string(),
            color: "Red".to_string(),
            mileage: 10,
            year: 2020,
            created_at,
            auction_end: now() + Duration::hours(ends_in_hours),
            status: AuctionStatus::Live,
            reserve_price: 0,
            seller: "alice".to_string(),
            winner: None,
            sold_amount: None,
            current_high_bid: None,
            updated_at: created_at,
            last_applied_at: created_at,
        }
    }

    #[test]
    fn default_query_lists_live_by_end() {
        let docs = [
            doc("Ford", "GT", 1, 48),
            doc("Audi", "R8", 2, 3),
            doc("BMW", "M3", 3, -1),
        ];
        let page = SearchQuery::default().run(&docs, now());
        let makes: Vec<_> = page.results.iter().map(|d| d.make.as_str()).collect();
        assert_eq!(makes, ["Audi", "Ford"]);
        assert_eq!(page.total_count, 2);
        assert_eq!(page.page_count, 1);
    }

    #[test]
    fn filters_by_window() {
        let docs = [
            doc("Ford", "GT", 1, 48),
            doc("Audi", "R8", 2, 3),
            doc("BMW", "M3", 3, -1),
        ];
        let finished = SearchQuery {
            filter_by: FilterBy::Finished,
            ..SearchQuery::default()
        }
        .run(&docs, now());
        assert_eq!(finished.results[0].make, "BMW");

        let soon = SearchQuery {
            filter_by: FilterBy::EndingSoon,
            ..SearchQuery::default()
        }
        .run(&docs, now());
        assert_eq!(soon.total_count, 1);
        assert_eq!(soon.results[0].make, "Audi");
    }

    #[test]
    fn term_is_case_insensitive() {
        let docs = [doc("Toyota", "Corolla", 1, 10), doc("Ford", "Mustang", 1, 10)];
        let page = SearchQuery {
            term: Some("corol".to_string()),
            ..SearchQuery::default()
        }
        .run(&docs, now());
        assert_eq!(page.total_count, 1);
        assert_eq!(page.results[0].make, "Toyota");
    }

    #[test]
    fn orders_and_pages() {
        let docs: Vec<_> = ["E", "D", "C", "B", "A"]
            .iter()
            .enumerate()
            .map(|(i, make)| doc(make, "X", i64::try_from(i).unwrap(), 24))
            .collect();

        let page2 = SearchQuery {
            order_by: OrderBy::Make,
            page_number: 2,
            page_size: 2,
            ..SearchQuery::default()
        }
        .run(&docs, now());
        let makes: Vec<_> = page2.results.iter().map(|d| d.make.as_str()).collect();
        assert_eq!(makes, ["C", "D"]);
        assert_eq!(page2.page_count, 3);

        let newest = SearchQuery {
            order_by: OrderBy::New,
            ..SearchQuery::default()
        }
        .run(&docs, now());
        assert_eq!(newest.results[0].make, "E");
    }

    #[test]
    fn seller_and_winner_filters() {
        let mut won = doc("Ford", "GT", 1, -5);
        won.winner = Some("bob".to_string());
        let docs = [won, doc("Audi", "R8", 1, -5)];
        let page = SearchQuery {
            filter_by: FilterBy::Finished,
            winner: Some("bob".to_string()),
            seller: Some("alice".to_string()),
            ..SearchQuery::default()
        }
        .run(&docs, now());
        assert_eq!(page.total_count, 1);
        assert_eq!(page.results[0].make, "Ford");
    }

    proptest::proptest! {
        /// Walking every page returns each match exactly once.
        #[test]
        fn pages_partition_the_matches(
            ends in proptest::collection::vec(1i64..500, 0..40),
            page_size in 1u32..10,
        ) {
            let docs: Vec<_> = ends.iter().map(|h| doc("Ford", "GT", 1, *h)).collect();
            let first = SearchQuery { page_size, ..SearchQuery::default() }.run(&docs, now());
            proptest::prop_assert_eq!(first.total_count, docs.len() as u64);

            let mut seen = Vec::new();
            for page_number in 1..=u32::try_from(first.page_count).unwrap() {
                let page = SearchQuery { page_size, page_number, ..SearchQuery::default() }
                    .run(&docs, now());
                proptest::prop_assert!(page.results.len() <= page_size as usize);
                seen.extend(page.results.into_iter().map(|d| d.id));
            }
            let mut expected: Vec<_> = docs.iter().map(|d| d.id).collect();
            expected.sort();
            seen.sort();
            proptest::prop_assert_eq!(seen, expected);
        }
    }

    #[test]
    fn params_fall_back_to_defaults() {
        assert_eq!(OrderBy::from_param(Some("bogus")), OrderBy::AuctionEnd);
        assert_eq!(FilterBy::from_param(None), FilterBy::Live);
        assert_eq!(FilterBy::from_param(Some("endingSoon")), FilterBy::EndingSoon);
    }
}
