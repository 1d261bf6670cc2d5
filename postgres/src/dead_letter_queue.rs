//! Dead Letter Queue (DLQ) for inbound messages.
//!
//! Provides persistent storage of messages that exhausted ingestion
//! redelivery, with a triage workflow for operators: inspect, reprocess,
//! resolve or discard.

use chrono::{DateTime, Utc};
use exception_collector_core::dead_letter::{DeadLetter, DeadLetterError, DeadLetterSink};
use sqlx::{PgPool, Row};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors from DLQ triage operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DLQError {
    /// The database rejected the operation.
    #[error("Database error: {0}")]
    Database(String),

    /// No entry with this id.
    #[error("DLQ entry not found: {0}")]
    NotFound(i64),

    /// A stored status label could not be decoded.
    #[error("Invalid DLQ status: {0}")]
    InvalidStatus(String),
}

/// Status of a failed message in the Dead Letter Queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DLQStatus {
    /// Waiting for an operator
    Pending,
    /// Being replayed
    Reprocessing,
    /// Successfully replayed or otherwise handled
    Resolved,
    /// Permanently discarded (cannot be fixed)
    Discarded,
}

impl DLQStatus {
    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Reprocessing => "reprocessing",
            Self::Resolved => "resolved",
            Self::Discarded => "discarded",
        }
    }

    /// Parse status from database string.
    ///
    /// # Errors
    ///
    /// Returns error if the string doesn't match a known status.
    pub fn parse(s: &str) -> Result<Self, DLQError> {
        match s {
            "pending" => Ok(Self::Pending),
            "reprocessing" => Ok(Self::Reprocessing),
            "resolved" => Ok(Self::Resolved),
            "discarded" => Ok(Self::Discarded),
            _ => Err(DLQError::InvalidStatus(s.to_string())),
        }
    }
}

/// An entry in the Dead Letter Queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedEvent {
    /// Unique identifier for this DLQ entry
    pub id: i64,

    /// The original message and its failure metadata
    pub letter: DeadLetter,

    /// Current triage status
    pub status: DLQStatus,

    /// When the entry was resolved or discarded
    pub resolved_at: Option<DateTime<Utc>>,

    /// Who resolved it
    pub resolved_by: Option<String>,

    /// Notes about the resolution
    pub resolution_notes: Option<String>,
}

/// `PostgreSQL`-based Dead Letter Queue.
///
/// Writing the same `(topic, partition, offset)` twice refreshes the
/// failure metadata instead of adding a second entry, so a redelivered
/// message that fails again does not pile up.
///
/// # Example
///
/// ```no_run
/// use exception_collector_postgres::{DLQStatus, PostgresDeadLetterQueue};
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// let dlq = PostgresDeadLetterQueue::new(pool);
///
/// let pending = dlq.list_pending(100).await?;
/// println!("Pending failures: {}", pending.len());
///
/// dlq.update_status(pending[0].id, DLQStatus::Reprocessing).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct PostgresDeadLetterQueue {
    pool: PgPool,
}

impl PostgresDeadLetterQueue {
    /// Create a new Dead Letter Queue with the given connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Add a failed message to the DLQ.
    ///
    /// # Returns
    ///
    /// The id of the created (or refreshed) entry.
    ///
    /// # Errors
    ///
    /// Returns [`DLQError::Database`] if the insert fails.
    pub async fn add_entry(&self, letter: &DeadLetter) -> Result<i64, DLQError> {
        let attempts = i32::try_from(letter.attempts).unwrap_or(i32::MAX);
        let (id,): (i64,) = sqlx::query_as(
            r"
            INSERT INTO failed_events (
                topic, partition_id, message_offset, message_key, payload,
                transaction_id, error_message, attempts, first_failed_at, last_failed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (topic, partition_id, message_offset) DO UPDATE
            SET error_message = EXCLUDED.error_message,
                attempts = failed_events.attempts + EXCLUDED.attempts,
                last_failed_at = EXCLUDED.last_failed_at,
                status = 'pending'
            RETURNING id
            ",
        )
        .bind(&letter.topic)
        .bind(letter.partition)
        .bind(letter.offset)
        .bind(letter.key.as_deref())
        .bind(letter.payload.as_slice())
        .bind(letter.transaction_id.as_deref())
        .bind(&letter.error)
        .bind(attempts)
        .bind(letter.first_failed_at)
        .bind(letter.last_failed_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| DLQError::Database(e.to_string()))?;

        tracing::warn!(
            dlq_id = id,
            topic = %letter.topic,
            partition = letter.partition,
            offset = letter.offset,
            transaction_id = ?letter.transaction_id,
            error = %letter.error,
            attempts = letter.attempts,
            "Message added to Dead Letter Queue"
        );

        metrics::counter!("dlq_added_total", "topic" => letter.topic.clone()).increment(1);

        Ok(id)
    }

    /// List pending entries, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`DLQError::Database`] if the query fails.
    pub async fn list_pending(&self, limit: usize) -> Result<Vec<FailedEvent>, DLQError> {
        self.list_by_status(DLQStatus::Pending, limit).await
    }

    /// List entries by status, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`DLQError::Database`] if the query fails.
    pub async fn list_by_status(
        &self,
        status: DLQStatus,
        limit: usize,
    ) -> Result<Vec<FailedEvent>, DLQError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            r"
            SELECT
                id, topic, partition_id, message_offset, message_key, payload,
                transaction_id, error_message, attempts, first_failed_at, last_failed_at,
                status, resolved_at, resolved_by, resolution_notes
            FROM failed_events
            WHERE status = $1
            ORDER BY first_failed_at ASC
            LIMIT $2
            ",
        )
        .bind(status.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DLQError::Database(e.to_string()))?;

        rows.iter().map(Self::row_to_failed_event).collect()
    }

    /// Get a specific entry by id.
    ///
    /// # Errors
    ///
    /// Returns [`DLQError::NotFound`] if there is no such entry.
    pub async fn get_by_id(&self, id: i64) -> Result<FailedEvent, DLQError> {
        let row = sqlx::query(
            r"
            SELECT
                id, topic, partition_id, message_offset, message_key, payload,
                transaction_id, error_message, attempts, first_failed_at, last_failed_at,
                status, resolved_at, resolved_by, resolution_notes
            FROM failed_events
            WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| DLQError::Database(e.to_string()))?
        .ok_or(DLQError::NotFound(id))?;

        Self::row_to_failed_event(&row)
    }

    /// Update the status of an entry.
    ///
    /// # Errors
    ///
    /// Returns [`DLQError::NotFound`] if there is no such entry.
    pub async fn update_status(&self, id: i64, status: DLQStatus) -> Result<(), DLQError> {
        let result = sqlx::query("UPDATE failed_events SET status = $1 WHERE id = $2")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| DLQError::Database(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(DLQError::NotFound(id));
        }

        tracing::info!(dlq_id = id, status = status.as_str(), "DLQ entry status updated");
        Ok(())
    }

    /// Mark an entry as resolved.
    ///
    /// # Errors
    ///
    /// Returns [`DLQError::NotFound`] if there is no such entry.
    pub async fn mark_resolved(
        &self,
        id: i64,
        resolved_by: &str,
        notes: Option<&str>,
    ) -> Result<(), DLQError> {
        let result = sqlx::query(
            r"
            UPDATE failed_events
            SET status = 'resolved',
                resolved_at = NOW(),
                resolved_by = $1,
                resolution_notes = $2
            WHERE id = $3
            ",
        )
        .bind(resolved_by)
        .bind(notes)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| DLQError::Database(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(DLQError::NotFound(id));
        }

        tracing::info!(dlq_id = id, resolved_by, "DLQ entry marked as resolved");
        metrics::counter!("dlq_resolved_total").increment(1);
        Ok(())
    }

    /// Mark an entry as permanently discarded.
    ///
    /// # Errors
    ///
    /// Returns [`DLQError::NotFound`] if there is no such entry.
    pub async fn mark_discarded(&self, id: i64, reason: &str) -> Result<(), DLQError> {
        let result = sqlx::query(
            r"
            UPDATE failed_events
            SET status = 'discarded',
                resolved_at = NOW(),
                resolution_notes = $1
            WHERE id = $2
            ",
        )
        .bind(reason)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| DLQError::Database(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(DLQError::NotFound(id));
        }

        tracing::warn!(dlq_id = id, reason, "DLQ entry marked as discarded");
        metrics::counter!("dlq_discarded_total").increment(1);
        Ok(())
    }

    /// Number of pending entries, for health checks.
    ///
    /// # Errors
    ///
    /// Returns [`DLQError::Database`] if the query fails.
    pub async fn count_pending(&self) -> Result<i64, DLQError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM failed_events WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| DLQError::Database(e.to_string()))?;
        Ok(count)
    }

    fn row_to_failed_event(row: &sqlx::postgres::PgRow) -> Result<FailedEvent, DLQError> {
        let get_err = |e: sqlx::Error| DLQError::Database(e.to_string());
        let status: String = row.try_get("status").map_err(get_err)?;
        let attempts: i32 = row.try_get("attempts").map_err(get_err)?;
        let attempts = u32::try_from(attempts)
            .map_err(|_| DLQError::Database(format!("negative attempt count {attempts}")))?;

        Ok(FailedEvent {
            id: row.try_get("id").map_err(get_err)?,
            letter: DeadLetter {
                topic: row.try_get("topic").map_err(get_err)?,
                partition: row.try_get("partition_id").map_err(get_err)?,
                offset: row.try_get("message_offset").map_err(get_err)?,
                key: row.try_get("message_key").map_err(get_err)?,
                payload: row.try_get("payload").map_err(get_err)?,
                transaction_id: row.try_get("transaction_id").map_err(get_err)?,
                error: row.try_get("error_message").map_err(get_err)?,
                attempts,
                first_failed_at: row.try_get("first_failed_at").map_err(get_err)?,
                last_failed_at: row.try_get("last_failed_at").map_err(get_err)?,
            },
            status: DLQStatus::parse(&status)?,
            resolved_at: row.try_get("resolved_at").map_err(get_err)?,
            resolved_by: row.try_get("resolved_by").map_err(get_err)?,
            resolution_notes: row.try_get("resolution_notes").map_err(get_err)?,
        })
    }
}

impl DeadLetterSink for PostgresDeadLetterQueue {
    fn send(
        &self,
        letter: DeadLetter,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeadLetterError>> + Send + '_>> {
        Box::pin(async move {
            self.add_entry(&letter)
                .await
                .map(|_| ())
                .map_err(|e| DeadLetterError::Unavailable(e.to_string()))
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;

    #[test]
    fn dlq_status_roundtrip() {
        for status in &[
            DLQStatus::Pending,
            DLQStatus::Reprocessing,
            DLQStatus::Resolved,
            DLQStatus::Discarded,
        ] {
            let parsed = DLQStatus::parse(status.as_str()).expect("valid status should parse");
            assert_eq!(*status, parsed);
        }
    }

    #[test]
    fn dlq_status_invalid() {
        assert_eq!(
            DLQStatus::parse("processing"),
            Err(DLQError::InvalidStatus("processing".to_string()))
        );
    }
}
