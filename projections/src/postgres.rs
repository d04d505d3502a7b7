//! `PostgreSQL` implementation of the search read model.
//!
//! # Overview
//!
//! The search service keeps its own database, separate from the auction
//! service's (true CQRS):
//!
//! ```text
//! Auction DB (write side)          Search DB (read side)
//! ┌─────────────────────┐          ┌─────────────────────┐
//! │  auctions           │          │  search_documents   │
//! │  outbox             │   →→→    │  dead_letter_queue  │
//! └─────────────────────┘  Events  └─────────────────────┘
//! ```
//!
//! # Monotonic writes
//!
//! [`PostgresSearchStore`] enforces the strictly-newer rule inside the upsert
//! itself (`ON CONFLICT ... DO UPDATE ... WHERE`), so two search-service
//! replicas applying the same auction concurrently cannot regress it.
//!
//! # Schema
//!
//! See `migrations/` in this crate. Deleted auctions keep a tombstone row.

use chrono::{DateTime, Duration, Utc};
use gavel_core::auction::{AuctionId, AuctionStatus};
use gavel_core::projection::{
    IndexEntry, SearchDocument, SearchStore, SearchStoreError, Tombstone,
};
use gavel_core::query::{ENDING_SOON_WINDOW_HOURS, FilterBy, OrderBy, SearchPage, SearchQuery};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use std::future::Future;
use std::pin::Pin;
use uuid::Uuid;

type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, SearchStoreError>> + Send + 'a>>;

const DOCUMENT_COLUMNS: &str = "id, make, model, color, mileage, year, created_at, auction_end, \
     status, reserve_price, seller, winner, sold_amount, current_high_bid, updated_at, \
     last_applied_at, tombstone";

/// PostgreSQL-backed search store.
///
/// # Example
///
/// ```ignore
/// use gavel_projections::PostgresSearchStore;
///
/// let store = PostgresSearchStore::connect("postgres://localhost/search").await?;
/// store.migrate().await?;
/// let indexer = SearchIndexer::new(Arc::new(store));
/// ```
#[derive(Clone)]
pub struct PostgresSearchStore {
    pool: PgPool,
}

impl PostgresSearchStore {
    /// Create a store using an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to the search database.
    ///
    /// # Errors
    ///
    /// Returns [`SearchStoreError::Storage`] if the connection fails.
    pub async fn connect(database_url: &str) -> Result<Self, SearchStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| SearchStoreError::Storage(format!("Failed to connect: {e}")))?;

        Ok(Self::new(pool))
    }

    /// Create the search tables if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns [`SearchStoreError::Storage`] if migration fails.
    pub async fn migrate(&self) -> Result<(), SearchStoreError> {
        let mut migrator = sqlx::migrate!("./migrations");
        // The dead-letter table shares this database under its own migrator.
        migrator.set_ignore_missing(true);
        migrator
            .run(&self.pool)
            .await
            .map_err(|e| SearchStoreError::Storage(format!("Migration failed: {e}")))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn storage(context: &str) -> impl FnOnce(sqlx::Error) -> SearchStoreError + '_ {
    move |e| SearchStoreError::Storage(format!("{context}: {e}"))
}

fn decode(e: sqlx::Error) -> SearchStoreError {
    SearchStoreError::Serialization(e.to_string())
}

fn document_from_row(row: &PgRow) -> Result<SearchDocument, SearchStoreError> {
    let status: String = row.try_get("status").map_err(decode)?;
    Ok(SearchDocument {
        id: AuctionId::from_uuid(row.try_get("id").map_err(decode)?),
        make: row.try_get("make").map_err(decode)?,
        model: row.try_get("model").map_err(decode)?,
        color: row.try_get("color").map_err(decode)?,
        mileage: row.try_get("mileage").map_err(decode)?,
        year: row.try_get("year").map_err(decode)?,
        created_at: row.try_get("created_at").map_err(decode)?,
        auction_end: row.try_get("auction_end").map_err(decode)?,
        status: AuctionStatus::parse(&status).map_err(SearchStoreError::Serialization)?,
        reserve_price: row.try_get("reserve_price").map_err(decode)?,
        seller: row.try_get("seller").map_err(decode)?,
        winner: row.try_get("winner").map_err(decode)?,
        sold_amount: row.try_get("sold_amount").map_err(decode)?,
        current_high_bid: row.try_get("current_high_bid").map_err(decode)?,
        updated_at: row.try_get("updated_at").map_err(decode)?,
        last_applied_at: row.try_get("last_applied_at").map_err(decode)?,
    })
}

fn entry_from_row(row: &PgRow) -> Result<IndexEntry, SearchStoreError> {
    if row.try_get::<bool, _>("tombstone").map_err(decode)? {
        let id: Uuid = row.try_get("id").map_err(decode)?;
        return Ok(IndexEntry::Tombstone(Tombstone {
            auction_id: AuctionId::from_uuid(id),
            deleted_at: row.try_get("last_applied_at").map_err(decode)?,
        }));
    }
    document_from_row(row).map(IndexEntry::Document)
}

/// Escape `%`, `_` and the escape character itself for `ILIKE`.
fn like_pattern(term: &str) -> String {
    let mut pattern = String::with_capacity(term.len() + 2);
    pattern.push('%');
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

/// Append the `WHERE` clause shared by the page and count queries.
fn push_filters(builder: &mut QueryBuilder<'_, Postgres>, query: &SearchQuery, now: DateTime<Utc>) {
    builder.push(" WHERE NOT tombstone");

    if let Some(term) = &query.term {
        let pattern = like_pattern(term);
        builder
            .push(" AND (make ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR model ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR color ILIKE ")
            .push_bind(pattern)
            .push(")");
    }

    match query.filter_by {
        FilterBy::Finished => {
            builder.push(" AND auction_end < ").push_bind(now);
        }
        FilterBy::EndingSoon => {
            builder
                .push(" AND auction_end > ")
                .push_bind(now)
                .push(" AND auction_end < ")
                .push_bind(now + Duration::hours(ENDING_SOON_WINDOW_HOURS));
        }
        FilterBy::Live => {
            builder.push(" AND auction_end > ").push_bind(now);
        }
    }

    if let Some(seller) = &query.seller {
        builder.push(" AND seller = ").push_bind(seller.clone());
    }
    if let Some(winner) = &query.winner {
        builder.push(" AND winner = ").push_bind(winner.clone());
    }
}

const fn order_clause(order_by: OrderBy) -> &'static str {
    match order_by {
        OrderBy::Make => " ORDER BY make COLLATE \"C\", model COLLATE \"C\", id",
        OrderBy::New => " ORDER BY created_at DESC, id",
        OrderBy::AuctionEnd => " ORDER BY auction_end, id",
    }
}

impl SearchStore for PostgresSearchStore {
    fn get(&self, id: AuctionId) -> StoreFuture<'_, Option<IndexEntry>> {
        Box::pin(async move {
            let row = sqlx::query(&format!(
                "SELECT {DOCUMENT_COLUMNS} FROM search_documents WHERE id = $1"
            ))
            .bind(*id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage("Failed to load document"))?;

            row.as_ref().map(entry_from_row).transpose()
        })
    }

    fn upsert_if_newer(&self, document: SearchDocument) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let result = sqlx::query(
                "INSERT INTO search_documents
                     (id, make, model, color, mileage, year, created_at, auction_end, status,
                      reserve_price, seller, winner, sold_amount, current_high_bid, updated_at,
                      last_applied_at, tombstone)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, FALSE)
                 ON CONFLICT (id) DO UPDATE SET
                     make = EXCLUDED.make,
                     model = EXCLUDED.model,
                     color = EXCLUDED.color,
                     mileage = EXCLUDED.mileage,
                     year = EXCLUDED.year,
                     created_at = EXCLUDED.created_at,
                     auction_end = EXCLUDED.auction_end,
                     status = EXCLUDED.status,
                     reserve_price = EXCLUDED.reserve_price,
                     seller = EXCLUDED.seller,
                     winner = EXCLUDED.winner,
                     sold_amount = EXCLUDED.sold_amount,
                     current_high_bid = EXCLUDED.current_high_bid,
                     updated_at = EXCLUDED.updated_at,
                     last_applied_at = EXCLUDED.last_applied_at,
                     tombstone = FALSE
                 WHERE search_documents.last_applied_at < EXCLUDED.last_applied_at",
            )
            .bind(*document.id.as_uuid())
            .bind(&document.make)
            .bind(&document.model)
            .bind(&document.color)
            .bind(document.mileage)
            .bind(document.year)
            .bind(document.created_at)
            .bind(document.auction_end)
            .bind(document.status.as_str())
            .bind(document.reserve_price)
            .bind(&document.seller)
            .bind(&document.winner)
            .bind(document.sold_amount)
            .bind(document.current_high_bid)
            .bind(document.updated_at)
            .bind(document.last_applied_at)
            .execute(&self.pool)
            .await
            .map_err(storage("Failed to upsert document"))?;

            Ok(result.rows_affected() == 1)
        })
    }

    fn remove(&self, id: AuctionId, deleted_at: DateTime<Utc>) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(storage("Failed to begin transaction"))?;

            let existing: Option<(bool,)> =
                sqlx::query_as("SELECT tombstone FROM search_documents WHERE id = $1 FOR UPDATE")
                    .bind(*id.as_uuid())
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(storage("Failed to lock document"))?;

            sqlx::query(
                "INSERT INTO search_documents (id, last_applied_at, tombstone)
                 VALUES ($1, $2, TRUE)
                 ON CONFLICT (id) DO UPDATE SET
                     make = NULL, model = NULL, color = NULL, mileage = NULL, year = NULL,
                     created_at = NULL, auction_end = NULL, status = NULL, reserve_price = NULL,
                     seller = NULL, winner = NULL, sold_amount = NULL, current_high_bid = NULL,
                     updated_at = NULL,
                     last_applied_at = CASE
                         WHEN search_documents.tombstone
                             THEN GREATEST(search_documents.last_applied_at, EXCLUDED.last_applied_at)
                         ELSE EXCLUDED.last_applied_at
                     END,
                     tombstone = TRUE",
            )
            .bind(*id.as_uuid())
            .bind(deleted_at)
            .execute(&mut *tx)
            .await
            .map_err(storage("Failed to write tombstone"))?;

            tx.commit()
                .await
                .map_err(storage("Failed to commit tombstone"))?;

            Ok(matches!(existing, Some((false,))))
        })
    }

    fn watermark(&self) -> StoreFuture<'_, Option<DateTime<Utc>>> {
        Box::pin(async move {
            sqlx::query_scalar("SELECT MAX(last_applied_at) FROM search_documents WHERE NOT tombstone")
                .fetch_one(&self.pool)
                .await
                .map_err(storage("Failed to read watermark"))
        })
    }

    fn search(&self, query: &SearchQuery, now: DateTime<Utc>) -> StoreFuture<'_, SearchPage> {
        let query = query.clone();
        Box::pin(async move {
            let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM search_documents");
            push_filters(&mut count, &query, now);
            let total: i64 = count
                .build_query_scalar()
                .fetch_one(&self.pool)
                .await
                .map_err(storage("Failed to count search results"))?;

            let mut page = QueryBuilder::<Postgres>::new(format!(
                "SELECT {DOCUMENT_COLUMNS} FROM search_documents"
            ));
            push_filters(&mut page, &query, now);
            page.push(order_clause(query.order_by))
                .push(" LIMIT ")
                .push_bind(i64::from(query.page_size()))
                .push(" OFFSET ")
                .push_bind(i64::try_from(query.offset()).unwrap_or(i64::MAX));
            let rows = page
                .build()
                .fetch_all(&self.pool)
                .await
                .map_err(storage("Failed to run search"))?;

            let results = rows
                .iter()
                .map(document_from_row)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(SearchPage::new(
                results,
                u64::try_from(total).unwrap_or_default(),
                query.page_size(),
            ))
        })
    }

    fn count(&self) -> StoreFuture<'_, i64> {
        Box::pin(async move {
            sqlx::query_scalar("SELECT COUNT(*) FROM search_documents WHERE NOT tombstone")
                .fetch_one(&self.pool)
                .await
                .map_err(storage("Failed to count documents"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Behavior against a real database is covered in tests/postgres_search.rs.

    #[test]
    fn like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern("to"), "%to%");
        assert_eq!(like_pattern("50%_off\\"), "%50\\%\\_off\\\\%");
    }

    #[test]
    fn make_ordering_is_bytewise() {
        assert!(order_clause(OrderBy::Make).contains("COLLATE \"C\""));
        assert!(order_clause(OrderBy::AuctionEnd).ends_with(", id"));
    }
}
