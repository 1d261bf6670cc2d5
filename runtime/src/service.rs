//! Collaborator-facing operations.
//!
//! [`ExceptionService`] is the single entry point for the API layer and the
//! ingestion path. Every externally triggered mutation runs as:
//!
//! 1. rate-limit check for `(actor, operation)`
//! 2. load, apply the lifecycle transition, write against the version read
//! 3. on a version conflict, reload and reapply once
//! 4. hand the change event to fan-out
//!
//! under a request-scoped deadline.

use crate::backoff::BackoffPolicy;
use crate::dead_letter::InMemoryDeadLetterQueue;
use crate::error::BuildError;
use crate::fanout::{FanoutPublisher, SubscriptionHub};
use crate::ingestion::{IngestionConsumer, Processed};
use crate::metrics::LifecycleMetrics;
use crate::orchestrator::{self, CompletedRetry, InitiatedRetry, RetryOrchestrator, with_conflict_retry};
use crate::rate_limiter::{MutationRateLimiter, RateLimitConfig};
use exception_collector_core::dead_letter::DeadLetterSink;
use exception_collector_core::environment::{Clock, SystemClock};
use exception_collector_core::error::CollectorError;
use exception_collector_core::events::ChangeEvent;
use exception_collector_core::exception::{InterfaceException, ResolutionMethod, RetryAttempt};
use exception_collector_core::ids::{AttemptId, TransactionId};
use exception_collector_core::inbound::InboundEvent;
use exception_collector_core::lifecycle::{ActionKind, LifecycleAction, MutationKind, is_permitted, transition};
use exception_collector_core::retry::RetryExecutor;
use exception_collector_core::store::ExceptionStore;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Deadline applied when a request does not carry its own.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Who is calling, and how long they are willing to wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    /// Authenticated actor; recorded as `acknowledged_by`, `resolved_by`, ...
    pub actor: String,
    /// Deadline for the whole operation.
    pub timeout: Option<Duration>,
    /// Correlation id for logs.
    pub request_id: Option<String>,
}

impl RequestContext {
    /// Context for `actor` with the service's default deadline.
    #[must_use]
    pub fn new(actor: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            timeout: None,
            request_id: None,
        }
    }

    /// Override the deadline.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Attach a request id.
    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

/// Exception lifecycle operations for the API layer.
///
/// Cheap to clone; clones share the store, limiter and fan-out.
#[derive(Clone)]
pub struct ExceptionService {
    store: Arc<dyn ExceptionStore>,
    ingestion: IngestionConsumer,
    orchestrator: RetryOrchestrator,
    limiter: Arc<MutationRateLimiter>,
    fanout: FanoutPublisher,
    clock: Arc<dyn Clock>,
    request_timeout: Duration,
}

impl ExceptionService {
    /// Create a builder.
    #[must_use]
    pub fn builder() -> ExceptionServiceBuilder {
        ExceptionServiceBuilder::default()
    }

    /// The broker-facing ingestion path, sharing this service's store and
    /// fan-out.
    #[must_use]
    pub const fn ingestion(&self) -> &IngestionConsumer {
        &self.ingestion
    }

    /// Retry attempt bookkeeping.
    #[must_use]
    pub const fn orchestrator(&self) -> &RetryOrchestrator {
        &self.orchestrator
    }

    /// The mutation rate limiter.
    #[must_use]
    pub const fn limiter(&self) -> &Arc<MutationRateLimiter> {
        &self.limiter
    }

    /// In-process change subscriptions.
    #[must_use]
    pub const fn subscriptions(&self) -> &SubscriptionHub {
        self.fanout.hub()
    }

    /// Capture one decoded inbound event.
    ///
    /// # Errors
    ///
    /// - [`CollectorError::Malformed`] when normalization fails
    /// - [`CollectorError::TransientProcessing`] when the store fails
    /// - [`CollectorError::Timeout`] past the default deadline
    pub async fn ingest(&self, event: &InboundEvent) -> Result<Processed, CollectorError> {
        self.within(None, self.ingestion.ingest_event(event)).await
    }

    /// Load an exception.
    ///
    /// # Errors
    ///
    /// [`CollectorError::TransientProcessing`] on store failure.
    pub async fn get(
        &self,
        transaction_id: &TransactionId,
    ) -> Result<Option<InterfaceException>, CollectorError> {
        self.within(None, async {
            Ok::<_, CollectorError>(self.store.get(transaction_id.clone()).await?)
        })
        .await
    }

    /// Take ownership of an exception.
    ///
    /// # Errors
    ///
    /// - [`CollectorError::RateLimitExceeded`]
    /// - [`CollectorError::NotFound`]
    /// - [`CollectorError::InvalidTransition`] unless `NEW` or `RETRIED_FAILED`
    /// - [`CollectorError::OptimisticConcurrencyConflict`] if the record kept
    ///   changing across both tries
    /// - [`CollectorError::Timeout`]
    pub async fn acknowledge(
        &self,
        ctx: &RequestContext,
        transaction_id: &TransactionId,
        notes: Option<String>,
    ) -> Result<InterfaceException, CollectorError> {
        self.limiter.check_limit(&ctx.actor, MutationKind::Acknowledge)?;
        let action = LifecycleAction::Acknowledge { notes };
        let stored = self.within(ctx.timeout, self.apply(ctx, transaction_id, &action)).await?;
        let at = stored.acknowledged_at.unwrap_or_else(|| self.clock.now());
        self.fanout.publish(ChangeEvent::acknowledged(stored.clone(), at));
        Ok(stored)
    }

    /// Resolve an exception by hand.
    ///
    /// # Errors
    ///
    /// - [`CollectorError::RateLimitExceeded`]
    /// - [`CollectorError::NotFound`]
    /// - [`CollectorError::InvalidTransition`] once `RESOLVED` or `CLOSED`
    /// - [`CollectorError::OptimisticConcurrencyConflict`] if the record kept
    ///   changing across both tries
    /// - [`CollectorError::Timeout`]
    pub async fn resolve(
        &self,
        ctx: &RequestContext,
        transaction_id: &TransactionId,
        method: ResolutionMethod,
        notes: Option<String>,
    ) -> Result<InterfaceException, CollectorError> {
        self.limiter.check_limit(&ctx.actor, MutationKind::Resolve)?;
        let action = LifecycleAction::Resolve { method, notes };
        let stored = self.within(ctx.timeout, self.apply(ctx, transaction_id, &action)).await?;
        let at = stored.resolved_at.unwrap_or_else(|| self.clock.now());
        self.fanout.publish(ChangeEvent::resolved(stored.clone(), at));
        Ok(stored)
    }

    /// Open a retry attempt, and run it if an executor is configured.
    ///
    /// Only opening the attempt runs under the deadline; the executor is
    /// started after it. A deadline that fires while the store is committing
    /// can leave the attempt open without an execution. Later retries then
    /// fail with [`CollectorError::RetryInProgress`] until the attempt is
    /// completed or withdrawn with [`ExceptionService::cancel_retry`].
    ///
    /// # Errors
    ///
    /// - [`CollectorError::RateLimitExceeded`]
    /// - [`CollectorError::NotFound`]
    /// - [`CollectorError::InvalidTransition`] for terminal or non-retryable
    ///   exceptions
    /// - [`CollectorError::RetryInProgress`]
    /// - [`CollectorError::Timeout`]
    pub async fn retry(
        &self,
        ctx: &RequestContext,
        transaction_id: &TransactionId,
    ) -> Result<InitiatedRetry, CollectorError> {
        self.limiter.check_limit(&ctx.actor, MutationKind::Retry)?;
        let (exception, attempt) = self
            .within(
                ctx.timeout,
                self.orchestrator.open_attempt(transaction_id, &ctx.actor),
            )
            .await?;
        Ok(self.orchestrator.start(exception, attempt))
    }

    /// Withdraw an open retry attempt.
    ///
    /// # Errors
    ///
    /// - [`CollectorError::RateLimitExceeded`]
    /// - [`CollectorError::AttemptNotFound`] / [`CollectorError::AttemptSealed`]
    /// - [`CollectorError::Timeout`]
    pub async fn cancel_retry(
        &self,
        ctx: &RequestContext,
        transaction_id: &TransactionId,
        attempt_number: u32,
    ) -> Result<RetryAttempt, CollectorError> {
        self.limiter.check_limit(&ctx.actor, MutationKind::CancelRetry)?;
        self.within(
            ctx.timeout,
            self.orchestrator
                .cancel_retry(transaction_id, attempt_number, &ctx.actor),
        )
        .await
    }

    /// Record an executor outcome reported from outside the process.
    ///
    /// Not rate limited: the caller is the executor, not an operator.
    ///
    /// # Errors
    ///
    /// See [`RetryOrchestrator::complete_retry`], plus [`CollectorError::Timeout`].
    pub async fn complete_retry(
        &self,
        id: &AttemptId,
        success: bool,
        error_details: Option<String>,
    ) -> Result<CompletedRetry, CollectorError> {
        self.within(
            None,
            self.orchestrator.complete_retry(id, success, error_details),
        )
        .await
    }

    /// Every retry attempt of an exception, oldest first.
    ///
    /// # Errors
    ///
    /// [`CollectorError::TransientProcessing`] on store failure.
    pub async fn retry_history(
        &self,
        transaction_id: &TransactionId,
    ) -> Result<Vec<RetryAttempt>, CollectorError> {
        self.within(None, self.orchestrator.retry_history(transaction_id))
            .await
    }

    /// Whether `acknowledge` would be accepted by the lifecycle table.
    ///
    /// # Errors
    ///
    /// [`CollectorError::TransientProcessing`] on store failure.
    pub async fn can_acknowledge(&self, transaction_id: &TransactionId) -> Result<bool, CollectorError> {
        self.permits(transaction_id, ActionKind::Acknowledge).await
    }

    /// Whether `resolve` would be accepted by the lifecycle table.
    ///
    /// # Errors
    ///
    /// [`CollectorError::TransientProcessing`] on store failure.
    pub async fn can_resolve(&self, transaction_id: &TransactionId) -> Result<bool, CollectorError> {
        self.permits(transaction_id, ActionKind::Resolve).await
    }

    /// Whether a retry could be opened right now.
    ///
    /// # Errors
    ///
    /// [`CollectorError::TransientProcessing`] on store failure.
    pub async fn can_retry(&self, transaction_id: &TransactionId) -> Result<bool, CollectorError> {
        self.within(None, self.orchestrator.can_retry(transaction_id))
            .await
    }

    async fn permits(
        &self,
        transaction_id: &TransactionId,
        action: ActionKind,
    ) -> Result<bool, CollectorError> {
        let exception = self.get(transaction_id).await?;
        Ok(exception.is_some_and(|e| is_permitted(Some(e.status), action)))
    }

    async fn apply(
        &self,
        ctx: &RequestContext,
        transaction_id: &TransactionId,
        action: &LifecycleAction,
    ) -> Result<InterfaceException, CollectorError> {
        let stored =
            with_conflict_retry(|| self.try_apply(transaction_id, action.clone(), &ctx.actor))
                .await?;

        LifecycleMetrics::record_transition(action.kind());
        info!(
            %transaction_id,
            action = %action.kind(),
            actor = %ctx.actor,
            request_id = ctx.request_id.as_deref(),
            status = %stored.status,
            "Exception updated"
        );
        Ok(stored)
    }

    async fn try_apply(
        &self,
        transaction_id: &TransactionId,
        action: LifecycleAction,
        actor: &str,
    ) -> Result<InterfaceException, CollectorError> {
        let current = orchestrator::load(self.store.as_ref(), transaction_id).await?;
        let next = transition(&current, action, actor, self.clock.now())?;
        Ok(self.store.update(next, current.version).await?)
    }

    async fn within<T, Fut>(&self, timeout: Option<Duration>, operation: Fut) -> Result<T, CollectorError>
    where
        Fut: Future<Output = Result<T, CollectorError>>,
    {
        let limit = timeout.unwrap_or(self.request_timeout);
        tokio::time::timeout(limit, operation).await.unwrap_or_else(|_| {
            warn!(timeout_ms = limit.as_millis(), "Operation timed out");
            Err(CollectorError::Timeout(limit))
        })
    }
}

impl std::fmt::Debug for ExceptionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExceptionService")
            .field("orchestrator", &self.orchestrator)
            .field("fanout", &self.fanout)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

/// Builder for [`ExceptionService`].
#[derive(Default)]
pub struct ExceptionServiceBuilder {
    store: Option<Arc<dyn ExceptionStore>>,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
    fanout: Option<FanoutPublisher>,
    clock: Option<Arc<dyn Clock>>,
    policy: Option<BackoffPolicy>,
    rate_limit: Option<RateLimitConfig>,
    executor: Option<Arc<dyn RetryExecutor>>,
    request_timeout: Option<Duration>,
}

impl ExceptionServiceBuilder {
    /// Set the exception store (required).
    #[must_use]
    pub fn store(mut self, store: Arc<dyn ExceptionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the ingestion dead-letter sink (default: in-memory queue).
    #[must_use]
    pub fn dead_letters(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = Some(sink);
        self
    }

    /// Set the fan-out publisher (default: hub only, no external publishers).
    #[must_use]
    pub fn fanout(mut self, fanout: FanoutPublisher) -> Self {
        self.fanout = Some(fanout);
        self
    }

    /// Set the clock (default: system clock).
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Set the ingestion redelivery policy.
    #[must_use]
    pub fn policy(mut self, policy: BackoffPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Set the mutation rate limits.
    #[must_use]
    pub fn rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit = Some(config);
        self
    }

    /// Run retries through `executor`.
    #[must_use]
    pub fn executor(mut self, executor: Arc<dyn RetryExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Set the default request deadline.
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Build the service.
    ///
    /// # Errors
    ///
    /// [`BuildError::Missing`] if the store is not set.
    pub fn build(self) -> Result<ExceptionService, BuildError> {
        let store = self.store.ok_or(BuildError::Missing("store"))?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let fanout = self.fanout.unwrap_or_default();
        let dead_letters = self
            .dead_letters
            .unwrap_or_else(|| Arc::new(InMemoryDeadLetterQueue::default()));

        let ingestion = IngestionConsumer::builder()
            .store(Arc::clone(&store))
            .dead_letters(dead_letters)
            .fanout(fanout.clone())
            .clock(Arc::clone(&clock))
            .policy(self.policy.unwrap_or_default())
            .build()?;

        let mut orchestrator = RetryOrchestrator::new(Arc::clone(&store), fanout.clone())
            .with_clock(Arc::clone(&clock));
        if let Some(executor) = self.executor {
            orchestrator = orchestrator.with_executor(executor);
        }

        let limiter = MutationRateLimiter::new(self.rate_limit.unwrap_or_default(), Arc::clone(&clock));

        Ok(ExceptionService {
            store,
            ingestion,
            orchestrator,
            limiter: Arc::new(limiter),
            fanout,
            clock,
            request_timeout: self.request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use exception_collector_core::error::RateWindow;
    use exception_collector_core::events::ChangeKind;
    use exception_collector_core::exception::{ExceptionSeverity, ExceptionStatus, InterfaceType};
    use exception_collector_core::ids::Version;
    use exception_collector_core::lifecycle::InvalidTransitionError;
    use exception_collector_core::store::{InsertOutcome, StoreError, StoreFuture};
    use exception_collector_core::retry::RetryOutcome;
    use exception_collector_testing::ScriptedRetryExecutor;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use tokio::sync::oneshot;
    use exception_collector_testing::{
        InMemoryExceptionStore, RecordingPublisher, fixtures, test_clock,
    };
    use chrono::{DateTime, Utc};

    struct Harness {
        service: ExceptionService,
        store: InMemoryExceptionStore,
        publisher: RecordingPublisher,
    }

    fn harness() -> Harness {
        let store = InMemoryExceptionStore::new();
        let publisher = RecordingPublisher::new();
        let service = ExceptionService::builder()
            .store(Arc::new(store.clone()))
            .fanout(FanoutPublisher::default().with_publisher(Arc::new(publisher.clone())))
            .clock(Arc::new(test_clock()))
            .build()
            .unwrap();
        Harness {
            service,
            store,
            publisher,
        }
    }

    fn t1() -> TransactionId {
        TransactionId::new("T1")
    }

    #[tokio::test]
    async fn order_rejection_walks_the_lifecycle() {
        let h = harness();
        let alice = RequestContext::new("alice");
        let bob = RequestContext::new("bob").with_request_id("req-7");

        let event = fixtures::order_rejected_because("T1", "Order already exists for external ID");
        let captured = h.service.ingest(&event).await.unwrap();
        let Processed::Captured(exception) = captured else {
            panic!("expected a new exception");
        };
        assert_eq!(exception.interface_type, InterfaceType::Order);
        assert_eq!(exception.status, ExceptionStatus::New);
        assert_eq!(exception.severity, ExceptionSeverity::Medium);
        assert!(!exception.retryable);

        let acked = h
            .service
            .acknowledge(&alice, &t1(), Some("looking".into()))
            .await
            .unwrap();
        assert_eq!(acked.status, ExceptionStatus::Acknowledged);
        assert_eq!(acked.acknowledged_by.as_deref(), Some("alice"));
        assert_eq!(acked.acknowledgment_notes.as_deref(), Some("looking"));
        assert!(!h.service.can_acknowledge(&t1()).await.unwrap());
        assert!(h.service.can_resolve(&t1()).await.unwrap());

        let resolved = h
            .service
            .resolve(&bob, &t1(), ResolutionMethod::ManualResolution, None)
            .await
            .unwrap();
        assert_eq!(resolved.status, ExceptionStatus::Resolved);
        assert_eq!(resolved.resolved_by.as_deref(), Some("bob"));
        assert_eq!(resolved.version, Version::new(2));

        let again = h
            .service
            .resolve(&bob, &t1(), ResolutionMethod::ManualResolution, None)
            .await
            .unwrap_err();
        assert!(matches!(
            again,
            CollectorError::InvalidTransition(InvalidTransitionError::NotPermitted {
                from: ExceptionStatus::Resolved,
                action: ActionKind::Resolve,
                ..
            })
        ));
        assert!(!h.service.can_resolve(&t1()).await.unwrap());

        assert!(h.publisher.wait_for(3, Duration::from_secs(1)).await);
        assert_eq!(
            h.publisher.kinds(),
            vec![
                ChangeKind::Captured,
                ChangeKind::Acknowledged,
                ChangeKind::Resolved
            ]
        );
        let events = h.publisher.events();
        assert_eq!(Some(events[1].occurred_at), acked.acknowledged_at);
        assert_eq!(Some(events[2].occurred_at), resolved.resolved_at);
    }

    #[tokio::test]
    async fn acknowledged_retry_resolves_with_one_completed_attempt() {
        let h = harness();
        let alice = RequestContext::new("alice");

        let event = InboundEvent::from_slice(
            br#"{"eventType":"OrderRejected","payload":{"transactionId":"T1"}}"#,
        )
        .unwrap();
        let Processed::Captured(captured) = h.service.ingest(&event).await.unwrap() else {
            panic!("expected a new exception");
        };
        assert_eq!(captured.status, ExceptionStatus::New);
        assert_eq!(captured.retry_count, 0);

        let acked = h
            .service
            .acknowledge(&alice, &t1(), Some("note".into()))
            .await
            .unwrap();
        assert_eq!(acked.status, ExceptionStatus::Acknowledged);
        assert_eq!(acked.acknowledged_by.as_deref(), Some("alice"));

        let initiated = h.service.retry(&alice, &t1()).await.unwrap();
        assert_eq!(initiated.attempt.attempt_number, 1);
        assert!(initiated.execution.is_none());
        assert_eq!(
            h.store.snapshot("T1").unwrap().status,
            ExceptionStatus::Acknowledged
        );

        let completed = h
            .service
            .complete_retry(&initiated.attempt.id(), true, None)
            .await
            .unwrap();
        assert_eq!(completed.exception.status, ExceptionStatus::Resolved);
        assert_eq!(completed.exception.retry_count, 1);
        assert_eq!(
            completed.exception.resolution_method,
            Some(ResolutionMethod::RetrySuccess)
        );
        assert_eq!(h.store.snapshot("T1").unwrap().retry_count, 1);
        assert_eq!(h.service.retry_history(&t1()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_retry_then_manual_resolution() {
        let h = harness();
        h.store.put(fixtures::exception("T1"));
        let alice = RequestContext::new("alice");

        let initiated = h.service.retry(&alice, &t1()).await.unwrap();
        assert_eq!(initiated.attempt.attempt_number, 1);
        let completed = h
            .service
            .complete_retry(&initiated.attempt.id(), false, Some("timeout upstream".into()))
            .await
            .unwrap();
        assert_eq!(completed.exception.status, ExceptionStatus::RetriedFailed);
        assert!(h.service.can_acknowledge(&t1()).await.unwrap());

        let resolved = h
            .service
            .resolve(&alice, &t1(), ResolutionMethod::CustomerResolved, Some("fixed by customer".into()))
            .await
            .unwrap();
        assert_eq!(resolved.retry_count, 1);
        assert_eq!(resolved.resolution_method, Some(ResolutionMethod::CustomerResolved));

        let err = h.service.retry(&alice, &t1()).await.unwrap_err();
        assert!(matches!(err, CollectorError::InvalidTransition(_)));
        assert_eq!(h.service.retry_history(&t1()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn thirty_first_acknowledge_in_a_minute_is_rejected() {
        let h = harness();
        let alice = RequestContext::new("alice");
        for i in 0..31 {
            h.store.put(fixtures::exception(&format!("T{i}")));
        }

        for i in 0..30 {
            h.service
                .acknowledge(&alice, &TransactionId::new(format!("T{i}")), None)
                .await
                .unwrap();
        }
        let err = h
            .service
            .acknowledge(&alice, &TransactionId::new("T30"), None)
            .await
            .unwrap_err();
        let CollectorError::RateLimitExceeded {
            actor,
            operation,
            window,
            limit,
            ..
        } = err
        else {
            panic!("expected rate limit, got {err}");
        };
        assert_eq!(actor, "alice");
        assert_eq!(operation, MutationKind::Acknowledge);
        assert_eq!(window, RateWindow::Minute);
        assert_eq!(limit, 30);
        assert_eq!(
            h.store.snapshot("T30").unwrap().status,
            ExceptionStatus::New
        );

        // Other actors and other operations have their own budgets.
        h.service
            .acknowledge(&RequestContext::new("bob"), &TransactionId::new("T30"), None)
            .await
            .unwrap();
        h.service
            .resolve(&alice, &TransactionId::new("T0"), ResolutionMethod::ManualResolution, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unknown_exception_is_not_found() {
        let h = harness();
        let missing = TransactionId::new("missing");
        let err = h
            .service
            .acknowledge(&RequestContext::new("alice"), &missing, None)
            .await
            .unwrap_err();
        assert_eq!(err, CollectorError::NotFound(missing.clone()));
        assert!(h.service.get(&missing).await.unwrap().is_none());
        assert!(!h.service.can_acknowledge(&missing).await.unwrap());
    }

    #[tokio::test]
    async fn failing_publisher_does_not_affect_the_write() {
        let h = harness();
        h.publisher.set_failing(true);
        h.store.put(fixtures::exception("T1"));

        let acked = h
            .service
            .acknowledge(&RequestContext::new("alice"), &t1(), None)
            .await
            .unwrap();
        assert_eq!(acked.status, ExceptionStatus::Acknowledged);
        assert_eq!(
            h.store.snapshot("T1").unwrap().status,
            ExceptionStatus::Acknowledged
        );
    }

    #[tokio::test]
    async fn subscribers_see_captured_events() {
        let h = harness();
        let mut critical = h
            .service
            .subscriptions()
            .subscribe(|e| e.kind == ChangeKind::Captured);

        h.service.ingest(&fixtures::order_rejected("T1")).await.unwrap();
        let event = critical.recv().await.unwrap();
        assert_eq!(event.transaction_id(), &t1());
    }

    /// Store whose reads take longer than any sensible deadline.
    struct SlowStore(InMemoryExceptionStore);

    impl ExceptionStore for SlowStore {
        fn insert_if_absent(&self, exception: InterfaceException) -> StoreFuture<'_, InsertOutcome> {
            self.0.insert_if_absent(exception)
        }

        fn get(&self, transaction_id: TransactionId) -> StoreFuture<'_, Option<InterfaceException>> {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                self.0.get(transaction_id).await
            })
        }

        fn update(
            &self,
            exception: InterfaceException,
            expected: Version,
        ) -> StoreFuture<'_, InterfaceException> {
            self.0.update(exception, expected)
        }

        fn begin_attempt(
            &self,
            exception: InterfaceException,
            expected: Version,
            initiated_by: String,
            initiated_at: DateTime<Utc>,
        ) -> StoreFuture<'_, (InterfaceException, RetryAttempt)> {
            self.0
                .begin_attempt(exception, expected, initiated_by, initiated_at)
        }

        fn complete_attempt(
            &self,
            attempt: RetryAttempt,
            exception: InterfaceException,
            expected: Version,
        ) -> StoreFuture<'_, (InterfaceException, RetryAttempt)> {
            self.0.complete_attempt(attempt, exception, expected)
        }

        fn seal_attempt(&self, attempt: RetryAttempt) -> StoreFuture<'_, RetryAttempt> {
            self.0.seal_attempt(attempt)
        }

        fn get_attempt(&self, id: AttemptId) -> StoreFuture<'_, Option<RetryAttempt>> {
            self.0.get_attempt(id)
        }

        fn list_attempts(&self, transaction_id: TransactionId) -> StoreFuture<'_, Vec<RetryAttempt>> {
            self.0.list_attempts(transaction_id)
        }
    }

    /// Store that can hold back the next `update` until released, fail
    /// updates with a conflict, or stall after committing a new attempt.
    #[derive(Default)]
    struct RacingStore {
        inner: InMemoryExceptionStore,
        conflicts: AtomicU32,
        updates: AtomicU32,
        slow_commits: AtomicBool,
        gate: std::sync::Mutex<Option<(oneshot::Sender<()>, oneshot::Receiver<()>)>>,
    }

    impl RacingStore {
        fn new(inner: InMemoryExceptionStore) -> Self {
            Self {
                inner,
                ..Self::default()
            }
        }

        fn fail_updates(&self, count: u32) {
            self.conflicts.store(count, Ordering::SeqCst);
        }

        /// Hold back the next update. The first receiver fires once the
        /// update is waiting; sending on the returned sender lets it go.
        fn hold_next_update(&self) -> (oneshot::Receiver<()>, oneshot::Sender<()>) {
            let (paused_tx, paused_rx) = oneshot::channel();
            let (release_tx, release_rx) = oneshot::channel();
            *self.gate.lock().unwrap() = Some((paused_tx, release_rx));
            (paused_rx, release_tx)
        }
    }

    impl ExceptionStore for RacingStore {
        fn insert_if_absent(&self, exception: InterfaceException) -> StoreFuture<'_, InsertOutcome> {
            self.inner.insert_if_absent(exception)
        }

        fn get(&self, transaction_id: TransactionId) -> StoreFuture<'_, Option<InterfaceException>> {
            self.inner.get(transaction_id)
        }

        fn update(
            &self,
            exception: InterfaceException,
            expected: Version,
        ) -> StoreFuture<'_, InterfaceException> {
            Box::pin(async move {
                self.updates.fetch_add(1, Ordering::SeqCst);
                let gate = self.gate.lock().unwrap().take();
                if let Some((paused, release)) = gate {
                    let _ = paused.send(());
                    let _ = release.await;
                }
                let injected = self
                    .conflicts
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if injected {
                    return Err(StoreError::Conflict {
                        transaction_id: exception.transaction_id.clone(),
                        expected,
                        actual: expected.next(),
                    });
                }
                self.inner.update(exception, expected).await
            })
        }

        fn begin_attempt(
            &self,
            exception: InterfaceException,
            expected: Version,
            initiated_by: String,
            initiated_at: DateTime<Utc>,
        ) -> StoreFuture<'_, (InterfaceException, RetryAttempt)> {
            Box::pin(async move {
                let opened = self
                    .inner
                    .begin_attempt(exception, expected, initiated_by, initiated_at)
                    .await;
                if opened.is_ok() && self.slow_commits.load(Ordering::SeqCst) {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
                opened
            })
        }

        fn complete_attempt(
            &self,
            attempt: RetryAttempt,
            exception: InterfaceException,
            expected: Version,
        ) -> StoreFuture<'_, (InterfaceException, RetryAttempt)> {
            self.inner.complete_attempt(attempt, exception, expected)
        }

        fn seal_attempt(&self, attempt: RetryAttempt) -> StoreFuture<'_, RetryAttempt> {
            self.inner.seal_attempt(attempt)
        }

        fn get_attempt(&self, id: AttemptId) -> StoreFuture<'_, Option<RetryAttempt>> {
            self.inner.get_attempt(id)
        }

        fn list_attempts(&self, transaction_id: TransactionId) -> StoreFuture<'_, Vec<RetryAttempt>> {
            self.inner.list_attempts(transaction_id)
        }
    }

    fn racing_service(store: &Arc<RacingStore>) -> ExceptionService {
        ExceptionService::builder()
            .store(Arc::clone(store) as Arc<dyn ExceptionStore>)
            .clock(Arc::new(test_clock()))
            .build()
            .unwrap()
    }

    /// Acknowledge T1 while a retry completion overtakes it; returns the
    /// acknowledge outcome and the number of update calls it made.
    async fn acknowledge_overtaken_by_retry(
        success: bool,
    ) -> (Result<InterfaceException, CollectorError>, u32, InMemoryExceptionStore) {
        let inner = InMemoryExceptionStore::new();
        inner.put(fixtures::exception("T1"));
        let store = Arc::new(RacingStore::new(inner.clone()));
        let service = racing_service(&store);
        let alice = RequestContext::new("alice");

        let initiated = service.retry(&alice, &t1()).await.unwrap();
        let (paused, release) = store.hold_next_update();

        let acknowledging = {
            let service = service.clone();
            tokio::spawn(async move {
                service
                    .acknowledge(&RequestContext::new("bob"), &t1(), None)
                    .await
            })
        };
        paused.await.unwrap();
        service
            .complete_retry(&initiated.attempt.id(), success, None)
            .await
            .unwrap();
        release.send(()).unwrap();

        let outcome = acknowledging.await.unwrap();
        (outcome, store.updates.load(Ordering::SeqCst), inner)
    }

    #[tokio::test]
    async fn acknowledge_losing_to_a_successful_retry_is_rejected_on_reapply() {
        let (outcome, updates, store) = acknowledge_overtaken_by_retry(true).await;

        assert!(matches!(
            outcome,
            Err(CollectorError::InvalidTransition(InvalidTransitionError::NotPermitted {
                from: ExceptionStatus::Resolved,
                action: ActionKind::Acknowledge,
                ..
            }))
        ));
        assert_eq!(updates, 1);
        let stored = store.snapshot("T1").unwrap();
        assert_eq!(stored.status, ExceptionStatus::Resolved);
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.acknowledged_by, None);
    }

    #[tokio::test]
    async fn acknowledge_losing_to_a_failed_retry_succeeds_on_reapply() {
        let (outcome, updates, store) = acknowledge_overtaken_by_retry(false).await;

        let acked = outcome.unwrap();
        assert_eq!(acked.status, ExceptionStatus::Acknowledged);
        assert_eq!(acked.acknowledged_by.as_deref(), Some("bob"));
        assert_eq!(acked.retry_count, 1);
        assert_eq!(updates, 2);
        assert_eq!(store.snapshot("T1").unwrap(), acked);
    }

    #[tokio::test]
    async fn one_conflict_is_reapplied_and_a_second_is_surfaced() {
        let inner = InMemoryExceptionStore::new();
        inner.put(fixtures::exception("T1"));
        inner.put(fixtures::exception("T2"));
        let store = Arc::new(RacingStore::new(inner.clone()));
        let service = racing_service(&store);
        let alice = RequestContext::new("alice");

        store.fail_updates(1);
        let acked = service.acknowledge(&alice, &t1(), None).await.unwrap();
        assert_eq!(acked.status, ExceptionStatus::Acknowledged);
        assert_eq!(store.updates.load(Ordering::SeqCst), 2);

        store.fail_updates(2);
        let err = service
            .acknowledge(&alice, &TransactionId::new("T2"), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CollectorError::OptimisticConcurrencyConflict { .. }
        ));
        assert_eq!(store.updates.load(Ordering::SeqCst), 4);
        assert_eq!(inner.snapshot("T2").unwrap().status, ExceptionStatus::New);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_timed_out_after_commit_stays_open_until_cancelled() {
        let inner = InMemoryExceptionStore::new();
        inner.put(fixtures::exception("T1"));
        let store = Arc::new(RacingStore::new(inner.clone()));
        store.slow_commits.store(true, Ordering::SeqCst);
        let executor = ScriptedRetryExecutor::new([RetryOutcome::succeeded()]);
        let service = ExceptionService::builder()
            .store(Arc::clone(&store) as Arc<dyn ExceptionStore>)
            .clock(Arc::new(test_clock()))
            .executor(Arc::new(executor.clone()))
            .build()
            .unwrap();
        let ctx = RequestContext::new("alice").with_timeout(Duration::from_secs(2));

        let err = service.retry(&ctx, &t1()).await.unwrap_err();
        assert_eq!(err, CollectorError::Timeout(Duration::from_secs(2)));
        assert_eq!(executor.call_count(), 0);
        let history = service.retry_history(&t1()).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].is_open());

        let err = service.retry(&ctx, &t1()).await.unwrap_err();
        assert!(matches!(
            err,
            CollectorError::RetryInProgress { attempt_number: 1, .. }
        ));

        service.cancel_retry(&ctx, &t1(), 1).await.unwrap();
        store.slow_commits.store(false, Ordering::SeqCst);
        let initiated = service.retry(&ctx, &t1()).await.unwrap();
        assert_eq!(initiated.attempt.attempt_number, 2);
        let completed = initiated.execution.unwrap().await.unwrap().unwrap();
        assert_eq!(completed.exception.status, ExceptionStatus::Resolved);
        assert_eq!(completed.exception.retry_count, 1);
        assert_eq!(executor.executed_attempts(), vec![2]);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_store_times_out() {
        let store = InMemoryExceptionStore::new();
        store.put(fixtures::exception("T1"));
        let service = ExceptionService::builder()
            .store(Arc::new(SlowStore(store.clone())))
            .clock(Arc::new(test_clock()))
            .request_timeout(Duration::from_secs(5))
            .build()
            .unwrap();

        let ctx = RequestContext::new("alice").with_timeout(Duration::from_secs(2));
        let err = service.acknowledge(&ctx, &t1(), None).await.unwrap_err();
        assert_eq!(err, CollectorError::Timeout(Duration::from_secs(2)));

        let err = service.get(&t1()).await.unwrap_err();
        assert_eq!(err, CollectorError::Timeout(Duration::from_secs(5)));
        assert_eq!(store.snapshot("T1").unwrap().status, ExceptionStatus::New);
    }

    #[test]
    fn builder_requires_store() {
        let err = ExceptionService::builder().build().unwrap_err();
        assert_eq!(err, BuildError::Missing("store"));
    }
}
