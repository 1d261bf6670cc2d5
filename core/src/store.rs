//! The exception store: single source of truth for exceptions and attempts.
//!
//! Every mutation path (ingestion, retry bookkeeping, manual acknowledge and
//! resolve) goes through the versioned writes defined here. A write names
//! the version it read; if the stored version moved on, the write fails with
//! [`StoreError::Conflict`] and nothing changes.
//!
//! # Implementations
//!
//! - `PostgresExceptionStore` (production)
//! - `InMemoryExceptionStore` (tests)

use crate::exception::{InterfaceException, RetryAttempt};
use crate::ids::{AttemptId, TransactionId, Version};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors from exception store operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Optimistic concurrency conflict: the record moved past the version
    /// the writer read.
    #[error("Concurrency conflict on {transaction_id}: expected version {expected}, found {actual}")]
    Conflict {
        /// Record being written.
        transaction_id: TransactionId,
        /// Version the writer read.
        expected: Version,
        /// Version currently stored.
        actual: Version,
    },

    /// No exception with this transaction id.
    #[error("Exception not found: {0}")]
    NotFound(TransactionId),

    /// No retry attempt with this id.
    #[error("Retry attempt not found: {0}")]
    AttemptNotFound(AttemptId),

    /// The exception already has an open attempt.
    #[error("Retry attempt {attempt_number} for {transaction_id} is still open")]
    AttemptInProgress {
        /// Owning exception.
        transaction_id: TransactionId,
        /// Number of the open attempt.
        attempt_number: u32,
    },

    /// The attempt was already sealed.
    #[error("Retry attempt {0} is already completed")]
    AttemptSealed(AttemptId),

    /// Backend failure (connection, query, constraint).
    #[error("Database error: {0}")]
    Database(String),

    /// A stored row could not be decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Backend failures may succeed when tried again later.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

/// Result of an idempotent insert.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    /// The record was new and is now stored.
    Inserted(InterfaceException),
    /// A record with this transaction id already existed; it is returned
    /// unchanged.
    Duplicate(InterfaceException),
}

/// Boxed future returned by [`ExceptionStore`] methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Durable keyed storage for exceptions and their retry attempts.
///
/// # Dyn Compatibility
///
/// Methods return boxed futures so the store can be shared as
/// `Arc<dyn ExceptionStore>` between the ingestion workers and the
/// request-serving path.
pub trait ExceptionStore: Send + Sync {
    /// Insert `exception` unless its transaction id is already present.
    ///
    /// Concurrent inserts of the same transaction id yield exactly one
    /// [`InsertOutcome::Inserted`]; every other caller sees
    /// [`InsertOutcome::Duplicate`].
    ///
    /// # Errors
    ///
    /// [`StoreError::Database`] on backend failure.
    fn insert_if_absent(&self, exception: InterfaceException) -> StoreFuture<'_, InsertOutcome>;

    /// Load an exception.
    ///
    /// # Errors
    ///
    /// [`StoreError::Database`] on backend failure.
    fn get(&self, transaction_id: TransactionId) -> StoreFuture<'_, Option<InterfaceException>>;

    /// Replace a stored exception if it is still at `expected`.
    ///
    /// Returns the stored record, now at `expected.next()`.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Conflict`] if the stored version differs
    /// - [`StoreError::NotFound`] if there is no such record
    fn update(
        &self,
        exception: InterfaceException,
        expected: Version,
    ) -> StoreFuture<'_, InterfaceException>;

    /// Open a retry attempt and write `exception` in one atomic step.
    ///
    /// The attempt number is `max(existing) + 1`. Fails if another attempt
    /// is still open, so concurrent callers never share a number.
    ///
    /// # Errors
    ///
    /// - [`StoreError::AttemptInProgress`] if an attempt is open
    /// - [`StoreError::Conflict`] if the exception moved past `expected`
    /// - [`StoreError::NotFound`] if there is no such record
    fn begin_attempt(
        &self,
        exception: InterfaceException,
        expected: Version,
        initiated_by: String,
        initiated_at: DateTime<Utc>,
    ) -> StoreFuture<'_, (InterfaceException, RetryAttempt)>;

    /// Seal an open attempt and write its exception in one atomic step.
    ///
    /// # Errors
    ///
    /// - [`StoreError::AttemptNotFound`] / [`StoreError::AttemptSealed`]
    /// - [`StoreError::Conflict`] if the exception moved past `expected`
    fn complete_attempt(
        &self,
        attempt: RetryAttempt,
        exception: InterfaceException,
        expected: Version,
    ) -> StoreFuture<'_, (InterfaceException, RetryAttempt)>;

    /// Seal an open attempt without touching its exception.
    ///
    /// # Errors
    ///
    /// [`StoreError::AttemptNotFound`] / [`StoreError::AttemptSealed`]
    fn seal_attempt(&self, attempt: RetryAttempt) -> StoreFuture<'_, RetryAttempt>;

    /// Load one attempt.
    ///
    /// # Errors
    ///
    /// [`StoreError::Database`] on backend failure.
    fn get_attempt(&self, id: AttemptId) -> StoreFuture<'_, Option<RetryAttempt>>;

    /// All attempts of an exception, ordered by attempt number.
    ///
    /// # Errors
    ///
    /// [`StoreError::Database`] on backend failure.
    fn list_attempts(&self, transaction_id: TransactionId) -> StoreFuture<'_, Vec<RetryAttempt>>;
}
