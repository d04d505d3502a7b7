//! Dead-letter queue for events the search consumer cannot apply.
//!
//! Parked events keep their raw bytes, the topic they arrived on and the
//! last error, so an operator can inspect them and replay or discard each
//! one. The table lives in the search database next to the read model.

use chrono::{DateTime, Utc};
use gavel_core::event::SerializedEvent;
use gavel_core::poison::{
    DeadLetterStatus, FailureKind, NewPoisonedEvent, PoisonStore, PoisonStoreError, PoisonedEvent,
};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use std::future::Future;
use std::pin::Pin;

/// `PostgreSQL`-backed [`PoisonStore`].
///
/// # Example
///
/// ```no_run
/// use gavel_core::poison::PoisonStore;
/// use gavel_postgres::PostgresPoisonStore;
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// let dlq = PostgresPoisonStore::new(pool);
/// dlq.migrate().await?;
///
/// for entry in dlq.list_pending(100).await? {
///     println!("{} parked on {}: {}", entry.id, entry.topic, entry.error_message);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct PostgresPoisonStore {
    pool: PgPool,
}

impl PostgresPoisonStore {
    /// Create a dead-letter store over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the dead-letter table if it does not exist.
    ///
    /// Safe to run against a database that has other migrators applied.
    ///
    /// # Errors
    ///
    /// Returns [`PoisonStoreError::Database`] if migration fails.
    pub async fn migrate(&self) -> Result<(), PoisonStoreError> {
        let mut migrator = sqlx::migrate!("./migrations/dead_letter");
        migrator.set_ignore_missing(true);
        migrator
            .run(&self.pool)
            .await
            .map_err(|e| PoisonStoreError::Database(format!("Migration failed: {e}")))
    }

    async fn insert(&self, entry: NewPoisonedEvent) -> Result<i64, PoisonStoreError> {
        let (id,): (i64,) = sqlx::query_as(
            r"
            INSERT INTO dead_letter_queue (
                topic, event_type, event_version, event_key, event_data,
                failure_kind, error_message, attempts
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id
            ",
        )
        .bind(&entry.topic)
        .bind(&entry.event.event_type)
        .bind(i32::from(entry.event.event_version))
        .bind(&entry.event.key)
        .bind(&entry.event.data)
        .bind(entry.kind.as_str())
        .bind(&entry.error_message)
        .bind(i32::try_from(entry.attempts).unwrap_or(i32::MAX))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| PoisonStoreError::Database(e.to_string()))?;

        tracing::warn!(
            dlq_id = id,
            topic = %entry.topic,
            event_type = %entry.event.event_type,
            key = %entry.event.key,
            kind = entry.kind.as_str(),
            error = %entry.error_message,
            attempts = entry.attempts,
            "Event added to dead-letter queue"
        );

        metrics::counter!(
            "consumer.dead_letter.parked",
            "event_type" => entry.event.event_type.clone(),
            "kind" => entry.kind.as_str()
        )
        .increment(1);

        Ok(id)
    }

    async fn pending(&self, limit: i64) -> Result<Vec<PoisonedEvent>, PoisonStoreError> {
        let rows = sqlx::query(
            r"
            SELECT
                id, topic, event_type, event_version, event_key, event_data,
                failure_kind, error_message, attempts, parked_at, status,
                resolved_at, resolution_notes
            FROM dead_letter_queue
            WHERE status = 'pending'
            ORDER BY parked_at ASC, id ASC
            LIMIT $1
            ",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| PoisonStoreError::Database(e.to_string()))?;

        rows.iter().map(row_to_poisoned_event).collect()
    }

    async fn close(
        &self,
        id: i64,
        status: DeadLetterStatus,
        notes: Option<String>,
    ) -> Result<(), PoisonStoreError> {
        let result = sqlx::query(
            r"
            UPDATE dead_letter_queue
            SET status = $1,
                resolved_at = NOW(),
                resolution_notes = $2
            WHERE id = $3
            ",
        )
        .bind(status.as_str())
        .bind(notes.as_deref())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| PoisonStoreError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(PoisonStoreError::NotFound(id));
        }

        match status {
            DeadLetterStatus::Discarded => {
                tracing::warn!(dlq_id = id, notes = ?notes, "Dead-letter entry discarded");
                metrics::counter!("consumer.dead_letter.discarded").increment(1);
            },
            _ => {
                tracing::info!(dlq_id = id, status = status.as_str(), "Dead-letter entry closed");
                metrics::counter!("consumer.dead_letter.resolved").increment(1);
            },
        }

        Ok(())
    }

    async fn pending_count(&self) -> Result<i64, PoisonStoreError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM dead_letter_queue WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| PoisonStoreError::Database(e.to_string()))?;
        Ok(count)
    }
}

fn row_to_poisoned_event(row: &PgRow) -> Result<PoisonedEvent, PoisonStoreError> {
    let get_err = |e: sqlx::Error| PoisonStoreError::Database(e.to_string());

    let version: i32 = row.try_get("event_version").map_err(get_err)?;
    let attempts: i32 = row.try_get("attempts").map_err(get_err)?;
    let kind: String = row.try_get("failure_kind").map_err(get_err)?;
    let status: String = row.try_get("status").map_err(get_err)?;
    let parked_at: DateTime<Utc> = row.try_get("parked_at").map_err(get_err)?;

    Ok(PoisonedEvent {
        id: row.try_get("id").map_err(get_err)?,
        topic: row.try_get("topic").map_err(get_err)?,
        event: SerializedEvent::new(
            row.try_get("event_type").map_err(get_err)?,
            u16::try_from(version)
                .map_err(|_| PoisonStoreError::Database(format!("Invalid event version: {version}")))?,
            row.try_get("event_key").map_err(get_err)?,
            row.try_get("event_data").map_err(get_err)?,
        ),
        kind: FailureKind::parse(&kind).map_err(PoisonStoreError::Database)?,
        error_message: row.try_get("error_message").map_err(get_err)?,
        attempts: u32::try_from(attempts).unwrap_or(0),
        parked_at,
        status: DeadLetterStatus::parse(&status).map_err(PoisonStoreError::Database)?,
        resolved_at: row.try_get("resolved_at").map_err(get_err)?,
        resolution_notes: row.try_get("resolution_notes").map_err(get_err)?,
    })
}

impl PoisonStore for PostgresPoisonStore {
    fn park(
        &self,
        entry: NewPoisonedEvent,
    ) -> Pin<Box<dyn Future<Output = Result<i64, PoisonStoreError>> + Send + '_>> {
        Box::pin(self.insert(entry))
    }

    fn list_pending(
        &self,
        limit: i64,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<PoisonedEvent>, PoisonStoreError>> + Send + '_>>
    {
        Box::pin(self.pending(limit))
    }

    fn mark_resolved(
        &self,
        id: i64,
        notes: Option<String>,
    ) -> Pin<Box<dyn Future<Output = Result<(), PoisonStoreError>> + Send + '_>> {
        Box::pin(self.close(id, DeadLetterStatus::Resolved, notes))
    }

    fn mark_discarded(
        &self,
        id: i64,
        notes: Option<String>,
    ) -> Pin<Box<dyn Future<Output = Result<(), PoisonStoreError>> + Send + '_>> {
        Box::pin(self.close(id, DeadLetterStatus::Discarded, notes))
    }

    fn count_pending(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<i64, PoisonStoreError>> + Send + '_>> {
        Box::pin(self.pending_count())
    }
}
