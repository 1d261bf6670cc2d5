//! In-memory exception store.
//!
//! Same contract as the Postgres store: versioned writes, idempotent insert,
//! gapless attempt numbering with at most one open attempt. A single lock
//! makes every multi-record operation atomic.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity

use exception_collector_core::exception::{InterfaceException, RetryAttempt};
use exception_collector_core::ids::{AttemptId, TransactionId, Version};
use exception_collector_core::store::{ExceptionStore, InsertOutcome, StoreError, StoreFuture};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

#[derive(Debug, Default)]
struct State {
    exceptions: HashMap<TransactionId, InterfaceException>,
    attempts: HashMap<TransactionId, Vec<RetryAttempt>>,
}

/// `HashMap`-backed [`ExceptionStore`] for fast, deterministic tests.
///
/// # Failure injection
///
/// [`fail_next`](Self::fail_next) makes the next `n` write operations fail
/// with [`StoreError::Database`], for exercising redelivery paths.
///
/// # Example
///
/// ```
/// use exception_collector_testing::{InMemoryExceptionStore, fixtures};
/// use exception_collector_core::store::{ExceptionStore, InsertOutcome};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryExceptionStore::new();
/// let outcome = store.insert_if_absent(fixtures::exception("T1")).await?;
/// assert!(matches!(outcome, InsertOutcome::Inserted(_)));
/// assert_eq!(store.len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryExceptionStore {
    state: Arc<RwLock<State>>,
    failures: Arc<AtomicU32>,
}

impl InMemoryExceptionStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` writes fail with a database error.
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Store a record as-is, bypassing version checks.
    pub fn put(&self, exception: InterfaceException) {
        self.state
            .write()
            .unwrap()
            .exceptions
            .insert(exception.transaction_id.clone(), exception);
    }

    /// Number of stored exceptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().unwrap().exceptions.len()
    }

    /// Whether the store holds no exceptions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of one exception.
    #[must_use]
    pub fn snapshot(&self, transaction_id: &str) -> Option<InterfaceException> {
        self.state
            .read()
            .unwrap()
            .exceptions
            .get(&TransactionId::new(transaction_id))
            .cloned()
    }

    /// Snapshot of the attempts of one exception.
    #[must_use]
    pub fn attempts(&self, transaction_id: &str) -> Vec<RetryAttempt> {
        self.state
            .read()
            .unwrap()
            .attempts
            .get(&TransactionId::new(transaction_id))
            .cloned()
            .unwrap_or_default()
    }

    fn injected_failure(&self) -> Result<(), StoreError> {
        let took = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if took {
            Err(StoreError::Database("injected failure".to_string()))
        } else {
            Ok(())
        }
    }
}

fn check_version(stored: &InterfaceException, expected: Version) -> Result<(), StoreError> {
    if stored.version == expected {
        Ok(())
    } else {
        Err(StoreError::Conflict {
            transaction_id: stored.transaction_id.clone(),
            expected,
            actual: stored.version,
        })
    }
}

fn find_open_attempt<'a>(
    attempts: &'a mut [RetryAttempt],
    id: &AttemptId,
) -> Result<&'a mut RetryAttempt, StoreError> {
    let slot = attempts
        .iter_mut()
        .find(|a| a.attempt_number == id.attempt_number)
        .ok_or_else(|| StoreError::AttemptNotFound(id.clone()))?;
    if !slot.is_open() {
        return Err(StoreError::AttemptSealed(id.clone()));
    }
    Ok(slot)
}

impl ExceptionStore for InMemoryExceptionStore {
    fn insert_if_absent(&self, exception: InterfaceException) -> StoreFuture<'_, InsertOutcome> {
        Box::pin(async move {
            self.injected_failure()?;
            let mut state = self.state.write().unwrap();
            if let Some(existing) = state.exceptions.get(&exception.transaction_id) {
                return Ok(InsertOutcome::Duplicate(existing.clone()));
            }
            state
                .exceptions
                .insert(exception.transaction_id.clone(), exception.clone());
            Ok(InsertOutcome::Inserted(exception))
        })
    }

    fn get(&self, transaction_id: TransactionId) -> StoreFuture<'_, Option<InterfaceException>> {
        Box::pin(async move {
            Ok(self
                .state
                .read()
                .unwrap()
                .exceptions
                .get(&transaction_id)
                .cloned())
        })
    }

    fn update(
        &self,
        mut exception: InterfaceException,
        expected: Version,
    ) -> StoreFuture<'_, InterfaceException> {
        Box::pin(async move {
            self.injected_failure()?;
            let mut state = self.state.write().unwrap();
            let stored = state
                .exceptions
                .get_mut(&exception.transaction_id)
                .ok_or_else(|| StoreError::NotFound(exception.transaction_id.clone()))?;
            check_version(stored, expected)?;
            exception.version = expected.next();
            *stored = exception.clone();
            Ok(exception)
        })
    }

    fn begin_attempt(
        &self,
        mut exception: InterfaceException,
        expected: Version,
        initiated_by: String,
        initiated_at: DateTime<Utc>,
    ) -> StoreFuture<'_, (InterfaceException, RetryAttempt)> {
        Box::pin(async move {
            self.injected_failure()?;
            let mut guard = self.state.write().unwrap();
            let state = &mut *guard;
            let id = exception.transaction_id.clone();
            let stored = state
                .exceptions
                .get_mut(&id)
                .ok_or_else(|| StoreError::NotFound(id.clone()))?;
            check_version(stored, expected)?;

            let attempts = state.attempts.entry(id.clone()).or_default();
            if let Some(open) = attempts.iter().find(|a| a.is_open()) {
                return Err(StoreError::AttemptInProgress {
                    transaction_id: id,
                    attempt_number: open.attempt_number,
                });
            }
            let number = attempts.iter().map(|a| a.attempt_number).max().unwrap_or(0) + 1;
            let attempt = RetryAttempt::pending(id, number, initiated_by, initiated_at);
            attempts.push(attempt.clone());

            exception.version = expected.next();
            *stored = exception.clone();
            Ok((exception, attempt))
        })
    }

    fn complete_attempt(
        &self,
        attempt: RetryAttempt,
        mut exception: InterfaceException,
        expected: Version,
    ) -> StoreFuture<'_, (InterfaceException, RetryAttempt)> {
        Box::pin(async move {
            self.injected_failure()?;
            let mut guard = self.state.write().unwrap();
            let state = &mut *guard;
            let id = attempt.id();
            let stored = state
                .exceptions
                .get_mut(&id.transaction_id)
                .ok_or_else(|| StoreError::NotFound(id.transaction_id.clone()))?;
            let attempts = state
                .attempts
                .get_mut(&id.transaction_id)
                .ok_or_else(|| StoreError::AttemptNotFound(id.clone()))?;
            let slot = find_open_attempt(attempts, &id)?;
            check_version(stored, expected)?;

            *slot = attempt.clone();
            exception.version = expected.next();
            *stored = exception.clone();
            Ok((exception, attempt))
        })
    }

    fn seal_attempt(&self, attempt: RetryAttempt) -> StoreFuture<'_, RetryAttempt> {
        Box::pin(async move {
            let mut state = self.state.write().unwrap();
            let id = attempt.id();
            let attempts = state
                .attempts
                .get_mut(&id.transaction_id)
                .ok_or_else(|| StoreError::AttemptNotFound(id.clone()))?;
            let slot = find_open_attempt(attempts, &id)?;
            *slot = attempt.clone();
            Ok(attempt)
        })
    }

    fn get_attempt(&self, id: AttemptId) -> StoreFuture<'_, Option<RetryAttempt>> {
        Box::pin(async move {
            Ok(self
                .state
                .read()
                .unwrap()
                .attempts
                .get(&id.transaction_id)
                .and_then(|list| list.iter().find(|a| a.attempt_number == id.attempt_number))
                .cloned())
        })
    }

    fn list_attempts(&self, transaction_id: TransactionId) -> StoreFuture<'_, Vec<RetryAttempt>> {
        Box::pin(async move {
            let mut attempts = self
                .state
                .read()
                .unwrap()
                .attempts
                .get(&transaction_id)
                .cloned()
                .unwrap_or_default();
            attempts.sort_by_key(|a| a.attempt_number);
            Ok(attempts)
        })
    }
}
