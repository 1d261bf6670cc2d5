//! Retry attempt bookkeeping.
//!
//! The orchestrator records attempt boundaries; it never runs the business
//! operation itself. Opening an attempt and completing it each happen in
//! one atomic store write together with the owning exception, so attempt
//! numbers stay gapless (`1, 2, 3, …`) and at most one attempt per exception
//! is open at any time.
//!
//! When a [`RetryExecutor`] is configured, [`RetryOrchestrator::initiate_retry`]
//! also spawns the execution and feeds its outcome into
//! [`RetryOrchestrator::complete_retry`].

use crate::fanout::FanoutPublisher;
use crate::metrics::{LifecycleMetrics, RetryMetrics};
use exception_collector_core::environment::{Clock, SystemClock};
use exception_collector_core::error::CollectorError;
use exception_collector_core::events::ChangeEvent;
use exception_collector_core::exception::{ExceptionStatus, InterfaceException, RetryAttempt};
use exception_collector_core::ids::{AttemptId, TransactionId};
use exception_collector_core::lifecycle::{ActionKind, LifecycleAction, transition};
use exception_collector_core::retry::RetryExecutor;
use exception_collector_core::store::ExceptionStore;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Run `operation`; on an optimistic conflict, run it exactly once more.
///
/// `operation` must reload what it writes, so the second run applies the
/// change on top of the winner's version.
pub(crate) async fn with_conflict_retry<T, F, Fut>(mut operation: F) -> Result<T, CollectorError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CollectorError>>,
{
    match operation().await {
        Err(CollectorError::OptimisticConcurrencyConflict {
            transaction_id,
            expected,
            actual,
        }) => {
            LifecycleMetrics::record_conflict();
            debug!(
                %transaction_id,
                %expected,
                %actual,
                "Concurrent modification, reapplying once"
            );
            operation().await
        }
        other => other,
    }
}

/// Load an exception or fail with [`CollectorError::NotFound`].
pub(crate) async fn load(
    store: &dyn ExceptionStore,
    transaction_id: &TransactionId,
) -> Result<InterfaceException, CollectorError> {
    store
        .get(transaction_id.clone())
        .await?
        .ok_or_else(|| CollectorError::NotFound(transaction_id.clone()))
}

/// A freshly opened attempt.
#[derive(Debug)]
pub struct InitiatedRetry {
    /// The exception as written together with the attempt.
    pub exception: InterfaceException,
    /// The open attempt.
    pub attempt: RetryAttempt,
    /// Background execution, when an executor is configured.
    pub execution: Option<JoinHandle<Result<CompletedRetry, CollectorError>>>,
}

/// A sealed attempt and its exception after completion.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedRetry {
    /// The exception after the "retry completes" transition.
    pub exception: InterfaceException,
    /// The sealed attempt.
    pub attempt: RetryAttempt,
}

/// Opens, completes and cancels retry attempts.
///
/// Cheap to clone; clones share every collaborator.
#[derive(Clone)]
pub struct RetryOrchestrator {
    store: Arc<dyn ExceptionStore>,
    fanout: FanoutPublisher,
    clock: Arc<dyn Clock>,
    executor: Option<Arc<dyn RetryExecutor>>,
}

impl RetryOrchestrator {
    /// Create an orchestrator over `store` publishing through `fanout`.
    #[must_use]
    pub fn new(store: Arc<dyn ExceptionStore>, fanout: FanoutPublisher) -> Self {
        Self {
            store,
            fanout,
            clock: Arc::new(SystemClock),
            executor: None,
        }
    }

    /// Use `clock` for attempt timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Run attempts through `executor`.
    #[must_use]
    pub fn with_executor(mut self, executor: Arc<dyn RetryExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Open attempt `max(existing) + 1` for `transaction_id`.
    ///
    /// The exception's status is unchanged until the attempt completes;
    /// only `last_retry_at` moves.
    ///
    /// # Errors
    ///
    /// - [`CollectorError::NotFound`] for an unknown transaction id
    /// - [`CollectorError::InvalidTransition`] if the status forbids a retry
    ///   or the exception is not retryable
    /// - [`CollectorError::RetryInProgress`] if an attempt is still open
    /// - [`CollectorError::OptimisticConcurrencyConflict`] if the record kept
    ///   changing across both tries
    pub async fn initiate_retry(
        &self,
        transaction_id: &TransactionId,
        actor: &str,
    ) -> Result<InitiatedRetry, CollectorError> {
        let (exception, attempt) = self.open_attempt(transaction_id, actor).await?;
        Ok(self.start(exception, attempt))
    }

    /// Persist a new open attempt without announcing or running it.
    pub(crate) async fn open_attempt(
        &self,
        transaction_id: &TransactionId,
        actor: &str,
    ) -> Result<(InterfaceException, RetryAttempt), CollectorError> {
        let (exception, attempt) =
            with_conflict_retry(|| self.try_initiate(transaction_id, actor)).await?;

        RetryMetrics::record_initiated();
        LifecycleMetrics::record_transition(ActionKind::Retry);
        info!(
            transaction_id = %exception.transaction_id,
            attempt_number = attempt.attempt_number,
            actor,
            "Retry attempt opened"
        );
        Ok((exception, attempt))
    }

    /// Announce a persisted attempt and hand it to the executor.
    pub(crate) fn start(&self, exception: InterfaceException, attempt: RetryAttempt) -> InitiatedRetry {
        self.fanout.publish(ChangeEvent::retry_initiated(
            exception.clone(),
            attempt.clone(),
            attempt.initiated_at,
        ));

        let execution = self.executor.as_ref().map(|executor| {
            let executor = Arc::clone(executor);
            let orchestrator = self.clone();
            let (exception, attempt) = (exception.clone(), attempt.clone());
            tokio::spawn(async move {
                let id = attempt.id();
                let outcome = executor.execute(exception, attempt).await;
                orchestrator
                    .complete_retry(&id, outcome.success, outcome.error_details)
                    .await
            })
        });

        InitiatedRetry {
            exception,
            attempt,
            execution,
        }
    }

    async fn try_initiate(
        &self,
        transaction_id: &TransactionId,
        actor: &str,
    ) -> Result<(InterfaceException, RetryAttempt), CollectorError> {
        let current = load(self.store.as_ref(), transaction_id).await?;
        let now = self.clock.now();
        let next = transition(&current, LifecycleAction::InitiateRetry, actor, now)?;
        Ok(self
            .store
            .begin_attempt(next, current.version, actor.to_string(), now)
            .await?)
    }

    /// Seal attempt `id` with the executor's outcome.
    ///
    /// Applies the "retry completes" transition and counts the attempt in
    /// `retry_count`. If the exception reached a terminal status while the
    /// attempt ran, the attempt is still sealed and counted but the status
    /// stays as it is.
    ///
    /// Publishes `RetryCompleted`, plus `Resolved` when the retry resolved the
    /// exception.
    ///
    /// # Errors
    ///
    /// - [`CollectorError::AttemptNotFound`] / [`CollectorError::AttemptSealed`]
    /// - [`CollectorError::NotFound`] if the exception vanished
    /// - [`CollectorError::OptimisticConcurrencyConflict`] if the record kept
    ///   changing across both tries
    pub async fn complete_retry(
        &self,
        id: &AttemptId,
        success: bool,
        error_details: Option<String>,
    ) -> Result<CompletedRetry, CollectorError> {
        let (completed, previous_status) = with_conflict_retry(|| {
            self.try_complete(id, success, error_details.as_deref())
        })
        .await?;

        RetryMetrics::record_completed(success);
        LifecycleMetrics::record_transition(ActionKind::CompleteRetry);
        info!(
            transaction_id = %completed.exception.transaction_id,
            attempt_number = completed.attempt.attempt_number,
            success,
            status = %completed.exception.status,
            retry_count = completed.exception.retry_count,
            "Retry attempt completed"
        );

        let at = completed.attempt.completed_at.unwrap_or_else(|| self.clock.now());
        self.fanout.publish(ChangeEvent::retry_completed(
            completed.exception.clone(),
            completed.attempt.clone(),
            at,
        ));
        let newly_resolved = completed.exception.status == ExceptionStatus::Resolved
            && previous_status != ExceptionStatus::Resolved;
        if newly_resolved {
            self.fanout
                .publish(ChangeEvent::resolved(completed.exception.clone(), at));
        }
        Ok(completed)
    }

    async fn try_complete(
        &self,
        id: &AttemptId,
        success: bool,
        error_details: Option<&str>,
    ) -> Result<(CompletedRetry, ExceptionStatus), CollectorError> {
        let attempt = self
            .store
            .get_attempt(id.clone())
            .await?
            .ok_or_else(|| CollectorError::AttemptNotFound(id.clone()))?;
        if !attempt.is_open() {
            return Err(CollectorError::AttemptSealed(id.clone()));
        }

        let current = load(self.store.as_ref(), &id.transaction_id).await?;
        let now = self.clock.now();

        let next = if current.is_terminal() {
            warn!(
                transaction_id = %current.transaction_id,
                attempt_number = id.attempt_number,
                status = %current.status,
                "Retry completed after exception reached a terminal status"
            );
            let mut next = current.clone();
            next.retry_count = next.retry_count.saturating_add(1);
            next
        } else {
            transition(
                &current,
                LifecycleAction::CompleteRetry { success },
                &attempt.initiated_by,
                now,
            )?
        };
        let sealed = attempt.completed(success, error_details.map(str::to_string), now);

        let (exception, attempt) = self
            .store
            .complete_attempt(sealed, next, current.version)
            .await?;
        Ok((CompletedRetry { exception, attempt }, current.status))
    }

    /// Withdraw an open attempt without an outcome.
    ///
    /// The exception is not touched and the attempt does not count towards
    /// `retry_count`.
    ///
    /// # Errors
    ///
    /// [`CollectorError::AttemptNotFound`] / [`CollectorError::AttemptSealed`]
    pub async fn cancel_retry(
        &self,
        transaction_id: &TransactionId,
        attempt_number: u32,
        actor: &str,
    ) -> Result<RetryAttempt, CollectorError> {
        let id = AttemptId::new(transaction_id.clone(), attempt_number);
        let attempt = self
            .store
            .get_attempt(id.clone())
            .await?
            .ok_or_else(|| CollectorError::AttemptNotFound(id.clone()))?;
        if !attempt.is_open() {
            return Err(CollectorError::AttemptSealed(id));
        }

        let cancelled = self
            .store
            .seal_attempt(attempt.cancelled(actor, self.clock.now()))
            .await?;
        RetryMetrics::record_cancelled();
        info!(%transaction_id, attempt_number, actor, "Retry attempt cancelled");
        Ok(cancelled)
    }

    /// Every attempt of an exception, oldest first.
    ///
    /// # Errors
    ///
    /// [`CollectorError::TransientProcessing`] on store failure.
    pub async fn retry_history(
        &self,
        transaction_id: &TransactionId,
    ) -> Result<Vec<RetryAttempt>, CollectorError> {
        Ok(self.store.list_attempts(transaction_id.clone()).await?)
    }

    /// The most recent attempt, if any.
    ///
    /// # Errors
    ///
    /// [`CollectorError::TransientProcessing`] on store failure.
    pub async fn latest_attempt(
        &self,
        transaction_id: &TransactionId,
    ) -> Result<Option<RetryAttempt>, CollectorError> {
        Ok(self.retry_history(transaction_id).await?.pop())
    }

    /// Whether a retry could be opened right now.
    ///
    /// # Errors
    ///
    /// [`CollectorError::TransientProcessing`] on store failure.
    pub async fn can_retry(&self, transaction_id: &TransactionId) -> Result<bool, CollectorError> {
        let Some(exception) = self.store.get(transaction_id.clone()).await? else {
            return Ok(false);
        };
        if !exception.retryable || exception.is_terminal() {
            return Ok(false);
        }
        let history = self.retry_history(transaction_id).await?;
        Ok(!history.iter().any(RetryAttempt::is_open))
    }
}

impl std::fmt::Debug for RetryOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryOrchestrator")
            .field("fanout", &self.fanout)
            .field("executor", &self.executor.is_some())
            .finish_non_exhaustive()
    }
}
