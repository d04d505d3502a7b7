//! `PostgreSQL` outbox table.
//!
//! [`append`] is called by the auction store inside its own transaction.
//! [`PostgresOutboxStore`] is the dispatcher's side: it reads pending rows in
//! sequence order and moves them out of the pending state.

use chrono::{DateTime, Utc};
use gavel_core::event::EventEnvelope;
use gavel_core::outbox::{DeliveryState, OutboxEntry, OutboxError, OutboxStore};
use sqlx::postgres::{PgConnection, PgPool, PgRow};
use sqlx::Row;
use std::future::Future;
use std::pin::Pin;

/// Insert an outbox row for `envelope` on the caller's connection.
///
/// Pass the connection of an open transaction; the row becomes visible to
/// the dispatcher only if that transaction commits.
///
/// # Errors
///
/// - [`OutboxError::CorruptRow`] if the envelope cannot be encoded
/// - [`OutboxError::Database`] if the insert fails
pub async fn append(conn: &mut PgConnection, envelope: &EventEnvelope) -> Result<i64, OutboxError> {
    let serialized = envelope.to_serialized().map_err(|e| OutboxError::CorruptRow {
        sequence_id: 0,
        reason: e.to_string(),
    })?;

    let (sequence_id,): (i64,) = sqlx::query_as(
        r"
        INSERT INTO outbox (event_type, payload)
        VALUES ($1, $2)
        RETURNING sequence_id
        ",
    )
    .bind(&serialized.event_type)
    .bind(&serialized.data)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| OutboxError::Database(e.to_string()))?;

    tracing::debug!(
        sequence_id,
        event_type = %serialized.event_type,
        auction_id = %envelope.auction_id,
        "Outbox entry appended"
    );

    Ok(sequence_id)
}

/// Dispatcher-side [`OutboxStore`] over the outbox table.
#[derive(Clone)]
pub struct PostgresOutboxStore {
    pool: PgPool,
}

impl PostgresOutboxStore {
    /// Create an outbox store over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn pending(&self, limit: usize) -> Result<Vec<OutboxEntry>, OutboxError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            r"
            SELECT sequence_id, event_type, payload, created_at, state
            FROM outbox
            WHERE state = 'pending'
            ORDER BY sequence_id ASC
            LIMIT $1
            ",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| OutboxError::Database(e.to_string()))?;

        rows.iter().map(row_to_entry).collect()
    }

    async fn transition(
        &self,
        sequence_id: i64,
        to: DeliveryState,
        reason: Option<&str>,
    ) -> Result<bool, OutboxError> {
        let result = sqlx::query(
            r"
            UPDATE outbox
            SET state = $1,
                delivered_at = CASE WHEN $1 = 'delivered' THEN NOW() ELSE delivered_at END,
                failure_reason = $2
            WHERE sequence_id = $3 AND state = 'pending'
            ",
        )
        .bind(to.as_str())
        .bind(reason)
        .bind(sequence_id)
        .execute(&self.pool)
        .await
        .map_err(|e| OutboxError::Database(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }

    async fn pending_count(&self) -> Result<i64, OutboxError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM outbox WHERE state = 'pending'")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| OutboxError::Database(e.to_string()))?;
        Ok(count)
    }
}

fn row_to_entry(row: &PgRow) -> Result<OutboxEntry, OutboxError> {
    let get_err = |e: sqlx::Error| OutboxError::Database(e.to_string());

    let sequence_id: i64 = row.try_get("sequence_id").map_err(get_err)?;
    let state: String = row.try_get("state").map_err(get_err)?;
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(get_err)?;

    Ok(OutboxEntry {
        sequence_id,
        event_type: row.try_get("event_type").map_err(get_err)?,
        payload: row.try_get("payload").map_err(get_err)?,
        created_at,
        state: DeliveryState::parse(&state)
            .map_err(|reason| OutboxError::CorruptRow { sequence_id, reason })?,
    })
}

impl OutboxStore for PostgresOutboxStore {
    fn fetch_pending(
        &self,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxEntry>, OutboxError>> + Send + '_>> {
        Box::pin(self.pending(limit))
    }

    fn mark_delivered(
        &self,
        sequence_id: i64,
    ) -> Pin<Box<dyn Future<Output = Result<bool, OutboxError>> + Send + '_>> {
        Box::pin(self.transition(sequence_id, DeliveryState::Delivered, None))
    }

    fn mark_failed(
        &self,
        sequence_id: i64,
        reason: &str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, OutboxError>> + Send + '_>> {
        let reason = reason.to_string();
        Box::pin(async move {
            self.transition(sequence_id, DeliveryState::Failed, Some(&reason))
                .await
        })
    }

    fn count_pending(&self) -> Pin<Box<dyn Future<Output = Result<i64, OutboxError>> + Send + '_>> {
        Box::pin(self.pending_count())
    }
}
