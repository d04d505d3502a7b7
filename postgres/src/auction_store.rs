//! `PostgreSQL` implementation of the authoritative [`AuctionStore`].
//!
//! Every mutation is one transaction: the `auctions` row change and the
//! matching outbox row commit together or not at all.

use crate::outbox;
use chrono::{DateTime, Utc};
use gavel_core::auction::{
    next_modified_at, validate_new_auction, AuctionFinished, AuctionId, AuctionPatch,
    AuctionRecord, AuctionStatus, AuctionStore, AuctionStoreError, NewAuction, StoreFuture,
};
use gavel_core::environment::{truncate_micros, Clock};
use gavel_core::event::EventEnvelope;
use gavel_core::outbox::OutboxError;
use gavel_core::validation::validate_record;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use std::sync::Arc;
use uuid::Uuid;

const SELECT_COLUMNS: &str = r"
    SELECT id, make, model, color, mileage, year, created_at, auction_end,
           status, reserve_price, seller, winner, sold_amount, current_high_bid,
           updated_at
    FROM auctions
";

fn db_err(e: sqlx::Error) -> AuctionStoreError {
    AuctionStoreError::Database(e.to_string())
}

fn outbox_err(e: OutboxError) -> AuctionStoreError {
    match e {
        OutboxError::Database(msg) => AuctionStoreError::Database(msg),
        OutboxError::CorruptRow { reason, .. } => AuctionStoreError::Serialization(reason),
    }
}

/// Auction records and their outbox in one `PostgreSQL` database.
///
/// # Example
///
/// ```no_run
/// use gavel_core::environment::SystemClock;
/// use gavel_postgres::{PostgresAuctionStore, PostgresOutboxStore};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = PostgresAuctionStore::connect("postgres://localhost/auctions", SystemClock).await?;
/// store.migrate().await?;
/// let outbox = PostgresOutboxStore::new(store.pool().clone());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct PostgresAuctionStore {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

impl PostgresAuctionStore {
    /// Create a store over an existing pool.
    #[must_use]
    pub fn new(pool: PgPool, clock: impl Clock + 'static) -> Self {
        Self {
            pool,
            clock: Arc::new(clock),
        }
    }

    /// Connect to `database_url`.
    ///
    /// # Errors
    ///
    /// Returns [`AuctionStoreError::Database`] if the connection fails.
    pub async fn connect(
        database_url: &str,
        clock: impl Clock + 'static,
    ) -> Result<Self, AuctionStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| AuctionStoreError::Database(format!("Failed to connect: {e}")))?;
        Ok(Self::new(pool, clock))
    }

    /// Create the auction and outbox tables if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns [`AuctionStoreError::Database`] if migration fails.
    pub async fn migrate(&self) -> Result<(), AuctionStoreError> {
        sqlx::migrate!("./migrations/auction")
            .run(&self.pool)
            .await
            .map_err(|e| AuctionStoreError::Database(format!("Migration failed: {e}")))
    }

    /// The underlying pool, shared with [`crate::PostgresOutboxStore`].
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, AuctionStoreError> {
        self.pool.begin().await.map_err(db_err)
    }

    async fn create_auction(
        &self,
        mut request: NewAuction,
    ) -> Result<AuctionRecord, AuctionStoreError> {
        let now = self.clock.now();
        request.auction_end = truncate_micros(request.auction_end);
        let id = AuctionId::new();
        validate_new_auction(id, &request, now)?;
        let record = AuctionRecord::open(id, request, now);

        let mut tx = self.begin().await?;
        sqlx::query(
            r"
            INSERT INTO auctions (
                id, make, model, color, mileage, year, created_at, auction_end,
                status, reserve_price, seller, winner, sold_amount, current_high_bid,
                updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ",
        )
        .bind(record.id.as_uuid())
        .bind(&record.make)
        .bind(&record.model)
        .bind(&record.color)
        .bind(record.mileage)
        .bind(record.year)
        .bind(record.created_at)
        .bind(record.auction_end)
        .bind(record.status.as_str())
        .bind(record.reserve_price)
        .bind(&record.seller)
        .bind(record.winner.as_deref())
        .bind(record.sold_amount)
        .bind(record.current_high_bid)
        .bind(record.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        outbox::append(&mut tx, &EventEnvelope::created(&record))
            .await
            .map_err(outbox_err)?;
        tx.commit().await.map_err(db_err)?;

        tracing::info!(auction_id = %record.id, make = %record.make, model = %record.model, "Auction created");
        Ok(record)
    }

    async fn update_auction(
        &self,
        id: AuctionId,
        patch: AuctionPatch,
    ) -> Result<AuctionRecord, AuctionStoreError> {
        let mut tx = self.begin().await?;
        let mut record = lock_record(&mut tx, id).await?;
        if !record.apply_patch(&patch) {
            return Ok(record);
        }
        record.updated_at = next_modified_at(record.updated_at, self.clock.now());
        validate_record(&record)?;

        write_record(&mut tx, &record).await?;
        outbox::append(&mut tx, &EventEnvelope::updated(&record))
            .await
            .map_err(outbox_err)?;
        tx.commit().await.map_err(db_err)?;

        tracing::info!(auction_id = %id, "Auction updated");
        Ok(record)
    }

    async fn delete_auction(&self, id: AuctionId) -> Result<(), AuctionStoreError> {
        let mut tx = self.begin().await?;
        let record = lock_record(&mut tx, id).await?;
        let deleted_at = next_modified_at(record.updated_at, self.clock.now());

        sqlx::query("DELETE FROM auctions WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        outbox::append(&mut tx, &EventEnvelope::deleted(id, deleted_at))
            .await
            .map_err(outbox_err)?;
        tx.commit().await.map_err(db_err)?;

        tracing::info!(auction_id = %id, "Auction deleted");
        Ok(())
    }

    async fn settle_auction(
        &self,
        notice: AuctionFinished,
    ) -> Result<Option<AuctionRecord>, AuctionStoreError> {
        let mut tx = self.begin().await?;
        let mut record = lock_record(&mut tx, notice.auction_id).await?;
        if !record.settle(&notice) {
            tracing::debug!(auction_id = %record.id, status = %record.status, "Auction already settled");
            return Ok(None);
        }
        record.updated_at = next_modified_at(record.updated_at, self.clock.now());

        write_record(&mut tx, &record).await?;
        outbox::append(&mut tx, &EventEnvelope::finished(&record))
            .await
            .map_err(outbox_err)?;
        tx.commit().await.map_err(db_err)?;

        tracing::info!(auction_id = %record.id, status = %record.status, "Auction settled");
        Ok(Some(record))
    }

    async fn fetch_one(&self, id: AuctionId) -> Result<Option<AuctionRecord>, AuctionStoreError> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(row_to_record).transpose()
    }

    async fn fetch_all(&self) -> Result<Vec<AuctionRecord>, AuctionStoreError> {
        let rows = sqlx::query(&format!("{SELECT_COLUMNS} ORDER BY make COLLATE \"C\", id"))
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(row_to_record).collect()
    }

    async fn fetch_modified_after(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<AuctionRecord>, AuctionStoreError> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE updated_at > $1 ORDER BY updated_at, id"
        ))
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_record).collect()
    }
}

/// Load a record and hold its row lock until the transaction ends.
async fn lock_record(
    conn: &mut PgConnection,
    id: AuctionId,
) -> Result<AuctionRecord, AuctionStoreError> {
    let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = $1 FOR UPDATE"))
        .bind(id.as_uuid())
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err)?;
    match row {
        Some(row) => row_to_record(&row),
        None => Err(AuctionStoreError::NotFound(id)),
    }
}

async fn write_record(
    conn: &mut PgConnection,
    record: &AuctionRecord,
) -> Result<(), AuctionStoreError> {
    sqlx::query(
        r"
        UPDATE auctions
        SET make = $2, model = $3, color = $4, mileage = $5, year = $6,
            status = $7, winner = $8, sold_amount = $9, current_high_bid = $10,
            updated_at = $11
        WHERE id = $1
        ",
    )
    .bind(record.id.as_uuid())
    .bind(&record.make)
    .bind(&record.model)
    .bind(&record.color)
    .bind(record.mileage)
    .bind(record.year)
    .bind(record.status.as_str())
    .bind(record.winner.as_deref())
    .bind(record.sold_amount)
    .bind(record.current_high_bid)
    .bind(record.updated_at)
    .execute(&mut *conn)
    .await
    .map_err(db_err)?;
    Ok(())
}

fn row_to_record(row: &PgRow) -> Result<AuctionRecord, AuctionStoreError> {
    let id: Uuid = row.try_get("id").map_err(db_err)?;
    let status: String = row.try_get("status").map_err(db_err)?;

    Ok(AuctionRecord {
        id: AuctionId::from_uuid(id),
        make: row.try_get("make").map_err(db_err)?,
        model: row.try_get("model").map_err(db_err)?,
        color: row.try_get("color").map_err(db_err)?,
        mileage: row.try_get("mileage").map_err(db_err)?,
        year: row.try_get("year").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        auction_end: row.try_get("auction_end").map_err(db_err)?,
        status: AuctionStatus::parse(&status).map_err(AuctionStoreError::Database)?,
        reserve_price: row.try_get("reserve_price").map_err(db_err)?,
        seller: row.try_get("seller").map_err(db_err)?,
        winner: row.try_get("winner").map_err(db_err)?,
        sold_amount: row.try_get("sold_amount").map_err(db_err)?,
        current_high_bid: row.try_get("current_high_bid").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

impl AuctionStore for PostgresAuctionStore {
    fn create(&self, request: NewAuction) -> StoreFuture<'_, AuctionRecord, AuctionStoreError> {
        Box::pin(self.create_auction(request))
    }

    fn update(
        &self,
        id: AuctionId,
        patch: AuctionPatch,
    ) -> StoreFuture<'_, AuctionRecord, AuctionStoreError> {
        Box::pin(self.update_auction(id, patch))
    }

    fn delete(&self, id: AuctionId) -> StoreFuture<'_, (), AuctionStoreError> {
        Box::pin(self.delete_auction(id))
    }

    fn settle(
        &self,
        notice: AuctionFinished,
    ) -> StoreFuture<'_, Option<AuctionRecord>, AuctionStoreError> {
        Box::pin(self.settle_auction(notice))
    }

    fn get(&self, id: AuctionId) -> StoreFuture<'_, Option<AuctionRecord>, AuctionStoreError> {
        Box::pin(self.fetch_one(id))
    }

    fn list(&self) -> StoreFuture<'_, Vec<AuctionRecord>, AuctionStoreError> {
        Box::pin(self.fetch_all())
    }

    fn modified_since(
        &self,
        since: DateTime<Utc>,
    ) -> StoreFuture<'_, Vec<AuctionRecord>, AuctionStoreError> {
        Box::pin(self.fetch_modified_after(since))
    }
}
