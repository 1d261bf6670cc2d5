//! The exception lifecycle state machine.
//!
//! One table decides which actions each status accepts. [`transition`] is
//! the single pure function that both the ingestion path and externally
//! triggered operations go through.
//!
//! | From | Action | To |
//! |---|---|---|
//! | (none) | ingest | `NEW` |
//! | `NEW`, `RETRIED_FAILED` | acknowledge | `ACKNOWLEDGED` |
//! | `NEW`, `ACKNOWLEDGED`, `RETRIED_FAILED` | retry (retryable only) | unchanged |
//! | any non-terminal | retry completes, success | `RESOLVED` |
//! | any non-terminal | retry completes, failure | `RETRIED_FAILED` |
//! | `NEW`, `ACKNOWLEDGED`, `RETRIED_FAILED` | resolve | `RESOLVED` |
//!
//! Transitions do not touch [`Version`](crate::ids::Version); the store
//! bumps it when the result is written.

use crate::exception::{ExceptionStatus, InterfaceException, ResolutionMethod};
use crate::ids::{TransactionId, Version};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Kind of lifecycle action, without its arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// First capture of a failure event.
    Ingest,
    /// Operator takes ownership.
    Acknowledge,
    /// Open a retry attempt.
    Retry,
    /// A retry attempt reports its outcome.
    CompleteRetry,
    /// Operator resolves by hand.
    Resolve,
}

impl ActionKind {
    /// Every action kind.
    pub const ALL: [Self; 5] = [
        Self::Ingest,
        Self::Acknowledge,
        Self::Retry,
        Self::CompleteRetry,
        Self::Resolve,
    ];

    /// Verb used in error messages and metric labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ingest => "ingest",
            Self::Acknowledge => "acknowledge",
            Self::Retry => "retry",
            Self::CompleteRetry => "complete_retry",
            Self::Resolve => "resolve",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lifecycle action with its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleAction {
    /// Capture. Only valid when no record exists yet.
    Ingest,
    /// Take ownership.
    Acknowledge {
        /// Operator notes.
        notes: Option<String>,
    },
    /// Open a retry attempt.
    InitiateRetry,
    /// Record the outcome of the open attempt.
    CompleteRetry {
        /// Whether the retried operation succeeded.
        success: bool,
    },
    /// Resolve by hand.
    Resolve {
        /// How it was resolved.
        method: ResolutionMethod,
        /// Operator notes.
        notes: Option<String>,
    },
}

impl LifecycleAction {
    /// The argument-free kind.
    #[must_use]
    pub const fn kind(&self) -> ActionKind {
        match self {
            Self::Ingest => ActionKind::Ingest,
            Self::Acknowledge { .. } => ActionKind::Acknowledge,
            Self::InitiateRetry => ActionKind::Retry,
            Self::CompleteRetry { .. } => ActionKind::CompleteRetry,
            Self::Resolve { .. } => ActionKind::Resolve,
        }
    }
}

/// A lifecycle action the table rejects.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidTransitionError {
    /// The current status does not accept the action.
    #[error("Cannot {action} exception {transaction_id} in status {from}")]
    NotPermitted {
        /// Target exception.
        transaction_id: TransactionId,
        /// Status the record was in.
        from: ExceptionStatus,
        /// Rejected action.
        action: ActionKind,
    },

    /// Retry was requested for a non-retryable exception.
    #[error("Cannot retry exception {transaction_id}: not retryable")]
    NotRetryable {
        /// Target exception.
        transaction_id: TransactionId,
    },
}

impl InvalidTransitionError {
    /// The action that was rejected.
    #[must_use]
    pub const fn action(&self) -> ActionKind {
        match self {
            Self::NotPermitted { action, .. } => *action,
            Self::NotRetryable { .. } => ActionKind::Retry,
        }
    }
}

/// The transition table, status-only.
///
/// `from` is `None` when no record exists yet. The retryable precondition
/// of `retry` is checked by [`transition`], not here.
#[must_use]
pub const fn is_permitted(from: Option<ExceptionStatus>, action: ActionKind) -> bool {
    use ExceptionStatus as S;

    match (from, action) {
        (None, ActionKind::Ingest) => true,
        (None, _) | (Some(_), ActionKind::Ingest) => false,
        (Some(S::New | S::RetriedFailed), ActionKind::Acknowledge) => true,
        (
            Some(S::New | S::Acknowledged | S::RetriedFailed),
            ActionKind::Retry | ActionKind::CompleteRetry | ActionKind::Resolve,
        ) => true,
        (Some(_), _) => false,
    }
}

/// Stamp a normalized candidate as a freshly captured exception.
///
/// Status becomes `NEW`, the version starts at [`Version::INITIAL`] and all
/// lifecycle fields are cleared.
#[must_use]
pub fn ingest(mut candidate: InterfaceException) -> InterfaceException {
    candidate.status = ExceptionStatus::New;
    candidate.version = Version::INITIAL;
    candidate.retry_count = 0;
    candidate.acknowledged_by = None;
    candidate.acknowledged_at = None;
    candidate.acknowledgment_notes = None;
    candidate.resolved_by = None;
    candidate.resolved_at = None;
    candidate.resolution_method = None;
    candidate.resolution_notes = None;
    candidate.last_retry_at = None;
    candidate
}

/// Apply `action` by `actor` at `at` to an existing exception.
///
/// Returns the updated record; the input is never modified. For
/// [`LifecycleAction::CompleteRetry`] the actor is the one who initiated
/// the attempt and `retry_count` grows by one.
///
/// # Errors
///
/// Returns [`InvalidTransitionError`] when the table rejects the
/// combination, or when a retry is requested for a non-retryable exception.
///
/// # Examples
///
/// ```ignore
/// let acked = transition(&exception, LifecycleAction::Acknowledge { notes: None }, "alice", now)?;
/// assert_eq!(acked.status, ExceptionStatus::Acknowledged);
/// ```
pub fn transition(
    exception: &InterfaceException,
    action: LifecycleAction,
    actor: &str,
    at: DateTime<Utc>,
) -> Result<InterfaceException, InvalidTransitionError> {
    let kind = action.kind();
    if !is_permitted(Some(exception.status), kind) {
        return Err(InvalidTransitionError::NotPermitted {
            transaction_id: exception.transaction_id.clone(),
            from: exception.status,
            action: kind,
        });
    }

    let mut next = exception.clone();
    match action {
        // Unreachable past the table check; kept for exhaustiveness.
        LifecycleAction::Ingest => {}
        LifecycleAction::Acknowledge { notes } => {
            next.status = ExceptionStatus::Acknowledged;
            next.acknowledged_by = Some(actor.to_string());
            next.acknowledged_at = Some(at);
            next.acknowledgment_notes = notes;
        }
        LifecycleAction::InitiateRetry => {
            if !exception.retryable {
                return Err(InvalidTransitionError::NotRetryable {
                    transaction_id: exception.transaction_id.clone(),
                });
            }
            next.last_retry_at = Some(at);
        }
        LifecycleAction::CompleteRetry { success } => {
            next.retry_count = exception.retry_count.saturating_add(1);
            if success {
                next.status = ExceptionStatus::Resolved;
                next.resolved_by = Some(actor.to_string());
                next.resolved_at = Some(at);
                next.resolution_method = Some(ResolutionMethod::RetrySuccess);
            } else {
                next.status = ExceptionStatus::RetriedFailed;
            }
        }
        LifecycleAction::Resolve { method, notes } => {
            next.status = ExceptionStatus::Resolved;
            next.resolved_by = Some(actor.to_string());
            next.resolved_at = Some(at);
            next.resolution_method = Some(method);
            next.resolution_notes = notes;
        }
    }
    Ok(next)
}

/// Externally triggered mutations, as seen by the rate limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    /// `acknowledge`
    Acknowledge,
    /// `resolve`
    Resolve,
    /// `retry`
    Retry,
    /// `cancel_retry`
    CancelRetry,
}

impl MutationKind {
    /// Label used in limiter keys and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Acknowledge => "acknowledge",
            Self::Resolve => "resolve",
            Self::Retry => "retry",
            Self::CancelRetry => "cancel_retry",
        }
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::exception::{ExceptionCategory, ExceptionSeverity, InterfaceType};
    use proptest::prelude::*;

    fn at() -> DateTime<Utc> {
        "2025-01-01T00:00:00Z".parse().unwrap()
    }

    fn exception(status: ExceptionStatus, retryable: bool) -> InterfaceException {
        InterfaceException {
            transaction_id: TransactionId::new("T1"),
            interface_type: InterfaceType::Order,
            external_id: Some("ORD-1".into()),
            operation: "CREATE_ORDER".into(),
            exception_reason: "Service unavailable".into(),
            category: ExceptionCategory::NetworkError,
            severity: ExceptionSeverity::High,
            status,
            customer_id: None,
            location_code: None,
            retryable,
            retry_count: 0,
            acknowledged_by: None,
            acknowledged_at: None,
            acknowledgment_notes: None,
            resolved_by: None,
            resolved_at: None,
            resolution_method: None,
            resolution_notes: None,
            last_retry_at: None,
            timestamp: at(),
            processed_at: at(),
            correlation_id: None,
            enrichment: None,
            version: Version::new(3),
        }
    }

    fn action_for(kind: ActionKind, success: bool) -> LifecycleAction {
        match kind {
            ActionKind::Ingest => LifecycleAction::Ingest,
            ActionKind::Acknowledge => LifecycleAction::Acknowledge { notes: None },
            ActionKind::Retry => LifecycleAction::InitiateRetry,
            ActionKind::CompleteRetry => LifecycleAction::CompleteRetry { success },
            ActionKind::Resolve => LifecycleAction::Resolve {
                method: ResolutionMethod::ManualResolution,
                notes: None,
            },
        }
    }

    #[test]
    fn acknowledge_stamps_actor() {
        let acked = transition(
            &exception(ExceptionStatus::New, true),
            LifecycleAction::Acknowledge {
                notes: Some("note".into()),
            },
            "alice",
            at(),
        )
        .unwrap();

        assert_eq!(acked.status, ExceptionStatus::Acknowledged);
        assert_eq!(acked.acknowledged_by.as_deref(), Some("alice"));
        assert_eq!(acked.acknowledgment_notes.as_deref(), Some("note"));
        assert_eq!(acked.version, Version::new(3));
    }

    #[test]
    fn acknowledge_twice_is_rejected() {
        let err = transition(
            &exception(ExceptionStatus::Acknowledged, true),
            LifecycleAction::Acknowledge { notes: None },
            "bob",
            at(),
        )
        .unwrap_err();
        assert_eq!(err.action(), ActionKind::Acknowledge);
    }

    #[test]
    fn retry_outcomes() {
        let base = exception(ExceptionStatus::Acknowledged, true);

        let started = transition(&base, LifecycleAction::InitiateRetry, "alice", at()).unwrap();
        assert_eq!(started.status, ExceptionStatus::Acknowledged);
        assert_eq!(started.last_retry_at, Some(at()));

        let failed = transition(
            &started,
            LifecycleAction::CompleteRetry { success: false },
            "alice",
            at(),
        )
        .unwrap();
        assert_eq!(failed.status, ExceptionStatus::RetriedFailed);
        assert_eq!(failed.retry_count, 1);

        let resolved = transition(
            &failed,
            LifecycleAction::CompleteRetry { success: true },
            "alice",
            at(),
        )
        .unwrap();
        assert_eq!(resolved.status, ExceptionStatus::Resolved);
        assert_eq!(resolved.retry_count, 2);
        assert_eq!(resolved.resolution_method, Some(ResolutionMethod::RetrySuccess));
    }

    #[test]
    fn non_retryable_cannot_retry() {
        let err = transition(
            &exception(ExceptionStatus::New, false),
            LifecycleAction::InitiateRetry,
            "alice",
            at(),
        )
        .unwrap_err();
        assert!(matches!(err, InvalidTransitionError::NotRetryable { .. }));
    }

    #[test]
    fn resolve_on_resolved_is_rejected() {
        let err = transition(
            &exception(ExceptionStatus::Resolved, true),
            action_for(ActionKind::Resolve, true),
            "alice",
            at(),
        )
        .unwrap_err();
        assert_eq!(
            err,
            InvalidTransitionError::NotPermitted {
                transaction_id: TransactionId::new("T1"),
                from: ExceptionStatus::Resolved,
                action: ActionKind::Resolve,
            }
        );
    }

    #[test]
    fn ingest_resets_lifecycle_fields() {
        let mut candidate = exception(ExceptionStatus::Resolved, true);
        candidate.retry_count = 4;
        candidate.resolved_by = Some("x".into());
        let fresh = ingest(candidate);
        assert_eq!(fresh.status, ExceptionStatus::New);
        assert_eq!(fresh.version, Version::INITIAL);
        assert_eq!(fresh.retry_count, 0);
        assert!(fresh.resolved_by.is_none());
        assert!(is_permitted(None, ActionKind::Ingest));
    }

    fn any_status() -> impl Strategy<Value = ExceptionStatus> {
        prop::sample::select(ExceptionStatus::ALL.to_vec())
    }

    fn any_action() -> impl Strategy<Value = ActionKind> {
        prop::sample::select(ActionKind::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn table_decides_every_pair(
            status in any_status(),
            kind in any_action(),
            success in any::<bool>(),
        ) {
            let before = exception(status, true);
            let result = transition(&before, action_for(kind, success), "actor", at());

            if is_permitted(Some(status), kind) {
                let after = result.unwrap();
                let expected = match kind {
                    ActionKind::Acknowledge => ExceptionStatus::Acknowledged,
                    ActionKind::Resolve => ExceptionStatus::Resolved,
                    ActionKind::CompleteRetry if success => ExceptionStatus::Resolved,
                    ActionKind::CompleteRetry => ExceptionStatus::RetriedFailed,
                    ActionKind::Retry | ActionKind::Ingest => status,
                };
                prop_assert_eq!(after.status, expected);
            } else {
                prop_assert!(result.is_err());
                prop_assert_eq!(before.status, status);
            }
        }

        #[test]
        fn terminal_states_accept_nothing(status in any_status(), kind in any_action()) {
            if status.is_terminal() {
                prop_assert!(!is_permitted(Some(status), kind));
            }
        }
    }
}
