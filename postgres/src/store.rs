//! `PostgreSQL` exception store.
//!
//! Exceptions live in `interface_exceptions` with a `version` column used for
//! optimistic concurrency: every write is `UPDATE ... WHERE version = $n`.
//! Retry attempts live in `retry_attempts`; opening and completing an
//! attempt lock the owning exception row (`SELECT ... FOR UPDATE`) so the
//! attempt and the exception change in one transaction. A partial unique
//! index keeps at most one open attempt per exception.

use chrono::{DateTime, Utc};
use exception_collector_core::exception::{InterfaceException, RetryAttempt};
use exception_collector_core::ids::{AttemptId, TransactionId, Version};
use exception_collector_core::store::{ExceptionStore, InsertOutcome, StoreError, StoreFuture};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Row};
use std::str::FromStr;

const EXCEPTION_COLUMNS: &str = "transaction_id, interface_type, external_id, operation, \
    exception_reason, category, severity, status, customer_id, location_code, retryable, \
    retry_count, acknowledged_by, acknowledged_at, acknowledgment_notes, resolved_by, \
    resolved_at, resolution_method, resolution_notes, last_retry_at, occurred_at, \
    processed_at, correlation_id, enrichment, version";

const ATTEMPT_COLUMNS: &str = "transaction_id, attempt_number, status, initiated_by, \
    initiated_at, completed_at, result_success, result_message, error_details";

fn database(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn decode<T: FromStr>(value: &str) -> Result<T, StoreError>
where
    T::Err: std::fmt::Display,
{
    T::from_str(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn to_db_version(version: Version) -> Result<i64, StoreError> {
    i64::try_from(version.value())
        .map_err(|_| StoreError::Serialization(format!("version {version} exceeds BIGINT")))
}

fn from_db_version(version: i64) -> Result<Version, StoreError> {
    u64::try_from(version)
        .map(Version::new)
        .map_err(|_| StoreError::Serialization(format!("negative version {version}")))
}

fn to_db_count(count: u32) -> Result<i32, StoreError> {
    i32::try_from(count)
        .map_err(|_| StoreError::Serialization(format!("count {count} exceeds INTEGER")))
}

fn from_db_count(count: i32) -> Result<u32, StoreError> {
    u32::try_from(count)
        .map_err(|_| StoreError::Serialization(format!("negative count {count}")))
}

/// Bind every exception column except `version` as `$1..$24`.
fn bind_exception<'q>(
    query: Query<'q, Postgres, PgArguments>,
    e: &'q InterfaceException,
) -> Result<Query<'q, Postgres, PgArguments>, StoreError> {
    Ok(query
        .bind(e.transaction_id.as_str())
        .bind(e.interface_type.as_str())
        .bind(e.external_id.as_deref())
        .bind(e.operation.as_str())
        .bind(e.exception_reason.as_str())
        .bind(e.category.as_str())
        .bind(e.severity.as_str())
        .bind(e.status.as_str())
        .bind(e.customer_id.as_deref())
        .bind(e.location_code.as_deref())
        .bind(e.retryable)
        .bind(to_db_count(e.retry_count)?)
        .bind(e.acknowledged_by.as_deref())
        .bind(e.acknowledged_at)
        .bind(e.acknowledgment_notes.as_deref())
        .bind(e.resolved_by.as_deref())
        .bind(e.resolved_at)
        .bind(e.resolution_method.map(|m| m.as_str()))
        .bind(e.resolution_notes.as_deref())
        .bind(e.last_retry_at)
        .bind(e.timestamp)
        .bind(e.processed_at)
        .bind(e.correlation_id.as_deref())
        .bind(e.enrichment.clone()))
}

fn exception_from_row(row: &PgRow) -> Result<InterfaceException, StoreError> {
    let text = |column: &str| row.try_get::<String, _>(column).map_err(database);
    let resolution_method: Option<String> = row.try_get("resolution_method").map_err(database)?;
    let version: i64 = row.try_get("version").map_err(database)?;

    Ok(InterfaceException {
        transaction_id: TransactionId::new(text("transaction_id")?),
        interface_type: decode(&text("interface_type")?)?,
        external_id: row.try_get("external_id").map_err(database)?,
        operation: text("operation")?,
        exception_reason: text("exception_reason")?,
        category: decode(&text("category")?)?,
        severity: decode(&text("severity")?)?,
        status: decode(&text("status")?)?,
        customer_id: row.try_get("customer_id").map_err(database)?,
        location_code: row.try_get("location_code").map_err(database)?,
        retryable: row.try_get("retryable").map_err(database)?,
        retry_count: from_db_count(row.try_get("retry_count").map_err(database)?)?,
        acknowledged_by: row.try_get("acknowledged_by").map_err(database)?,
        acknowledged_at: row.try_get("acknowledged_at").map_err(database)?,
        acknowledgment_notes: row.try_get("acknowledgment_notes").map_err(database)?,
        resolved_by: row.try_get("resolved_by").map_err(database)?,
        resolved_at: row.try_get("resolved_at").map_err(database)?,
        resolution_method: resolution_method.as_deref().map(decode).transpose()?,
        resolution_notes: row.try_get("resolution_notes").map_err(database)?,
        last_retry_at: row.try_get("last_retry_at").map_err(database)?,
        timestamp: row.try_get("occurred_at").map_err(database)?,
        processed_at: row.try_get("processed_at").map_err(database)?,
        correlation_id: row.try_get("correlation_id").map_err(database)?,
        enrichment: row.try_get("enrichment").map_err(database)?,
        version: from_db_version(version)?,
    })
}

fn attempt_from_row(row: &PgRow) -> Result<RetryAttempt, StoreError> {
    let status: String = row.try_get("status").map_err(database)?;
    Ok(RetryAttempt {
        transaction_id: TransactionId::new(
            row.try_get::<String, _>("transaction_id").map_err(database)?,
        ),
        attempt_number: from_db_count(row.try_get("attempt_number").map_err(database)?)?,
        status: decode(&status)?,
        initiated_by: row.try_get("initiated_by").map_err(database)?,
        initiated_at: row.try_get("initiated_at").map_err(database)?,
        completed_at: row.try_get("completed_at").map_err(database)?,
        result_success: row.try_get("result_success").map_err(database)?,
        result_message: row.try_get("result_message").map_err(database)?,
        error_details: row.try_get("error_details").map_err(database)?,
    })
}

/// `PostgreSQL`-backed [`ExceptionStore`].
///
/// # Example
///
/// ```no_run
/// use exception_collector_postgres::PostgresExceptionStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = PostgresExceptionStore::new("postgres://localhost/exceptions").await?;
/// store.migrate().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct PostgresExceptionStore {
    pool: PgPool,
}

impl PostgresExceptionStore {
    /// Connect to `database_url`.
    ///
    /// # Errors
    ///
    /// [`StoreError::Database`] if the connection fails.
    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await.map_err(database)?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run the bundled migrations.
    ///
    /// # Errors
    ///
    /// [`StoreError::Database`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("Migration failed: {e}")))?;
        Ok(())
    }

    async fn insert(&self, exception: &InterfaceException) -> Result<InsertOutcome, StoreError> {
        let sql = format!(
            "INSERT INTO interface_exceptions ({EXCEPTION_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, \
                     $17, $18, $19, $20, $21, $22, $23, $24, $25) \
             ON CONFLICT (transaction_id) DO NOTHING \
             RETURNING {EXCEPTION_COLUMNS}"
        );
        let inserted = bind_exception(sqlx::query(&sql), exception)?
            .bind(to_db_version(exception.version)?)
            .fetch_optional(&self.pool)
            .await
            .map_err(database)?;

        if let Some(row) = inserted {
            return Ok(InsertOutcome::Inserted(exception_from_row(&row)?));
        }

        let existing = self
            .fetch(&exception.transaction_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(exception.transaction_id.clone()))?;
        Ok(InsertOutcome::Duplicate(existing))
    }

    async fn fetch(
        &self,
        transaction_id: &TransactionId,
    ) -> Result<Option<InterfaceException>, StoreError> {
        let sql = format!(
            "SELECT {EXCEPTION_COLUMNS} FROM interface_exceptions WHERE transaction_id = $1"
        );
        sqlx::query(&sql)
            .bind(transaction_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(database)?
            .as_ref()
            .map(exception_from_row)
            .transpose()
    }

    /// Versioned write inside `tx`; the caller has already checked the
    /// version under a row lock.
    async fn write_locked(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        exception: &InterfaceException,
        expected: Version,
    ) -> Result<InterfaceException, StoreError> {
        let sql = format!(
            "UPDATE interface_exceptions SET \
                interface_type = $2, external_id = $3, operation = $4, exception_reason = $5, \
                category = $6, severity = $7, status = $8, customer_id = $9, \
                location_code = $10, retryable = $11, retry_count = $12, \
                acknowledged_by = $13, acknowledged_at = $14, acknowledgment_notes = $15, \
                resolved_by = $16, resolved_at = $17, resolution_method = $18, \
                resolution_notes = $19, last_retry_at = $20, occurred_at = $21, \
                processed_at = $22, correlation_id = $23, enrichment = $24, \
                version = version + 1, updated_at = now() \
             WHERE transaction_id = $1 AND version = $25 \
             RETURNING {EXCEPTION_COLUMNS}"
        );
        let row = bind_exception(sqlx::query(&sql), exception)?
            .bind(to_db_version(expected)?)
            .fetch_optional(&mut **tx)
            .await
            .map_err(database)?
            .ok_or_else(|| StoreError::NotFound(exception.transaction_id.clone()))?;
        exception_from_row(&row)
    }

    /// Lock the exception row and check its version.
    async fn lock_version(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        transaction_id: &TransactionId,
        expected: Version,
    ) -> Result<(), StoreError> {
        let current: Option<(i64,)> = sqlx::query_as(
            "SELECT version FROM interface_exceptions WHERE transaction_id = $1 FOR UPDATE",
        )
        .bind(transaction_id.as_str())
        .fetch_optional(&mut **tx)
        .await
        .map_err(database)?;

        let Some((actual,)) = current else {
            return Err(StoreError::NotFound(transaction_id.clone()));
        };
        let actual = from_db_version(actual)?;
        if actual != expected {
            return Err(StoreError::Conflict {
                transaction_id: transaction_id.clone(),
                expected,
                actual,
            });
        }
        Ok(())
    }

    async fn conflict_or_missing(
        &self,
        transaction_id: &TransactionId,
        expected: Version,
    ) -> StoreError {
        match self.fetch(transaction_id).await {
            Ok(Some(current)) => StoreError::Conflict {
                transaction_id: transaction_id.clone(),
                expected,
                actual: current.version,
            },
            Ok(None) => StoreError::NotFound(transaction_id.clone()),
            Err(error) => error,
        }
    }

    async fn update_versioned(
        &self,
        exception: &InterfaceException,
        expected: Version,
    ) -> Result<InterfaceException, StoreError> {
        let mut tx = self.pool.begin().await.map_err(database)?;
        match Self::write_locked(&mut tx, exception, expected).await {
            Ok(stored) => {
                tx.commit().await.map_err(database)?;
                Ok(stored)
            }
            Err(StoreError::NotFound(_)) => {
                let _ = tx.rollback().await;
                Err(self
                    .conflict_or_missing(&exception.transaction_id, expected)
                    .await)
            }
            Err(other) => Err(other),
        }
    }

    async fn begin(
        &self,
        exception: &InterfaceException,
        expected: Version,
        initiated_by: &str,
        initiated_at: DateTime<Utc>,
    ) -> Result<(InterfaceException, RetryAttempt), StoreError> {
        let transaction_id = &exception.transaction_id;
        let mut tx = self.pool.begin().await.map_err(database)?;
        Self::lock_version(&mut tx, transaction_id, expected).await?;

        let open: Option<(i32,)> = sqlx::query_as(
            "SELECT attempt_number FROM retry_attempts \
             WHERE transaction_id = $1 AND completed_at IS NULL",
        )
        .bind(transaction_id.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(database)?;
        if let Some((attempt_number,)) = open {
            return Err(StoreError::AttemptInProgress {
                transaction_id: transaction_id.clone(),
                attempt_number: from_db_count(attempt_number)?,
            });
        }

        let (next,): (i32,) = sqlx::query_as(
            "SELECT COALESCE(MAX(attempt_number), 0) + 1 FROM retry_attempts WHERE transaction_id = $1",
        )
        .bind(transaction_id.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(database)?;

        let attempt = RetryAttempt::pending(
            transaction_id.clone(),
            from_db_count(next)?,
            initiated_by,
            initiated_at,
        );
        let sql = format!(
            "INSERT INTO retry_attempts ({ATTEMPT_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) RETURNING {ATTEMPT_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(attempt.transaction_id.as_str())
            .bind(next)
            .bind(attempt.status.as_str())
            .bind(attempt.initiated_by.as_str())
            .bind(attempt.initiated_at)
            .bind(attempt.completed_at)
            .bind(attempt.result_success)
            .bind(attempt.result_message.as_deref())
            .bind(attempt.error_details.as_deref())
            .fetch_one(&mut *tx)
            .await
            .map_err(database)?;
        let attempt = attempt_from_row(&row)?;

        let stored = Self::write_locked(&mut tx, exception, expected).await?;
        tx.commit().await.map_err(database)?;

        tracing::debug!(
            transaction_id = %stored.transaction_id,
            attempt_number = attempt.attempt_number,
            "Retry attempt persisted"
        );
        Ok((stored, attempt))
    }

    /// Seal `attempt` inside `tx` if it is still open.
    async fn seal_locked(
        &self,
        tx: &mut sqlx::Transaction<'_, Postgres>,
        attempt: &RetryAttempt,
    ) -> Result<RetryAttempt, StoreError> {
        let sql = format!(
            "UPDATE retry_attempts SET \
                status = $3, completed_at = $4, result_success = $5, \
                result_message = $6, error_details = $7 \
             WHERE transaction_id = $1 AND attempt_number = $2 AND completed_at IS NULL \
             RETURNING {ATTEMPT_COLUMNS}"
        );
        let sealed = sqlx::query(&sql)
            .bind(attempt.transaction_id.as_str())
            .bind(to_db_count(attempt.attempt_number)?)
            .bind(attempt.status.as_str())
            .bind(attempt.completed_at)
            .bind(attempt.result_success)
            .bind(attempt.result_message.as_deref())
            .bind(attempt.error_details.as_deref())
            .fetch_optional(&mut **tx)
            .await
            .map_err(database)?;

        match sealed {
            Some(row) => attempt_from_row(&row),
            None => {
                let id = attempt.id();
                let exists = self.fetch_attempt(&id).await?.is_some();
                Err(if exists {
                    StoreError::AttemptSealed(id)
                } else {
                    StoreError::AttemptNotFound(id)
                })
            }
        }
    }

    async fn complete(
        &self,
        attempt: &RetryAttempt,
        exception: &InterfaceException,
        expected: Version,
    ) -> Result<(InterfaceException, RetryAttempt), StoreError> {
        let mut tx = self.pool.begin().await.map_err(database)?;
        Self::lock_version(&mut tx, &exception.transaction_id, expected).await?;
        let sealed = self.seal_locked(&mut tx, attempt).await?;
        let stored = Self::write_locked(&mut tx, exception, expected).await?;
        tx.commit().await.map_err(database)?;
        Ok((stored, sealed))
    }

    async fn seal(&self, attempt: &RetryAttempt) -> Result<RetryAttempt, StoreError> {
        let mut tx = self.pool.begin().await.map_err(database)?;
        let sealed = self.seal_locked(&mut tx, attempt).await?;
        tx.commit().await.map_err(database)?;
        Ok(sealed)
    }

    async fn fetch_attempt(&self, id: &AttemptId) -> Result<Option<RetryAttempt>, StoreError> {
        let sql = format!(
            "SELECT {ATTEMPT_COLUMNS} FROM retry_attempts \
             WHERE transaction_id = $1 AND attempt_number = $2"
        );
        sqlx::query(&sql)
            .bind(id.transaction_id.as_str())
            .bind(to_db_count(id.attempt_number)?)
            .fetch_optional(&self.pool)
            .await
            .map_err(database)?
            .as_ref()
            .map(attempt_from_row)
            .transpose()
    }

    async fn fetch_attempts(
        &self,
        transaction_id: &TransactionId,
    ) -> Result<Vec<RetryAttempt>, StoreError> {
        let sql = format!(
            "SELECT {ATTEMPT_COLUMNS} FROM retry_attempts \
             WHERE transaction_id = $1 ORDER BY attempt_number ASC"
        );
        sqlx::query(&sql)
            .bind(transaction_id.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(database)?
            .iter()
            .map(attempt_from_row)
            .collect()
    }
}

impl ExceptionStore for PostgresExceptionStore {
    fn insert_if_absent(&self, exception: InterfaceException) -> StoreFuture<'_, InsertOutcome> {
        Box::pin(async move { self.insert(&exception).await })
    }

    fn get(&self, transaction_id: TransactionId) -> StoreFuture<'_, Option<InterfaceException>> {
        Box::pin(async move { self.fetch(&transaction_id).await })
    }

    fn update(
        &self,
        exception: InterfaceException,
        expected: Version,
    ) -> StoreFuture<'_, InterfaceException> {
        Box::pin(async move { self.update_versioned(&exception, expected).await })
    }

    fn begin_attempt(
        &self,
        exception: InterfaceException,
        expected: Version,
        initiated_by: String,
        initiated_at: DateTime<Utc>,
    ) -> StoreFuture<'_, (InterfaceException, RetryAttempt)> {
        Box::pin(async move {
            self.begin(&exception, expected, &initiated_by, initiated_at)
                .await
        })
    }

    fn complete_attempt(
        &self,
        attempt: RetryAttempt,
        exception: InterfaceException,
        expected: Version,
    ) -> StoreFuture<'_, (InterfaceException, RetryAttempt)> {
        Box::pin(async move { self.complete(&attempt, &exception, expected).await })
    }

    fn seal_attempt(&self, attempt: RetryAttempt) -> StoreFuture<'_, RetryAttempt> {
        Box::pin(async move { self.seal(&attempt).await })
    }

    fn get_attempt(&self, id: AttemptId) -> StoreFuture<'_, Option<RetryAttempt>> {
        Box::pin(async move { self.fetch_attempt(&id).await })
    }

    fn list_attempts(&self, transaction_id: TransactionId) -> StoreFuture<'_, Vec<RetryAttempt>> {
        Box::pin(async move { self.fetch_attempts(&transaction_id).await })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn counts_and_versions_convert_within_range() {
        assert_eq!(to_db_count(7), Ok(7));
        assert!(to_db_count(u32::MAX).is_err());
        assert_eq!(from_db_count(3), Ok(3));
        assert!(from_db_count(-1).is_err());
        assert_eq!(to_db_version(Version::new(42)), Ok(42));
        assert!(to_db_version(Version::new(u64::MAX)).is_err());
        assert_eq!(from_db_version(3), Ok(Version::new(3)));
        assert_eq!(
            from_db_version(-1),
            Err(StoreError::Serialization("negative version -1".into()))
        );
    }

    #[test]
    fn unknown_labels_are_serialization_errors() {
        let err = decode::<exception_collector_core::exception::ExceptionStatus>("SNOOZED")
            .unwrap_err();
        assert!(matches!(err, StoreError::Serialization(_)));
    }
}
