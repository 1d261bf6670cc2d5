//! Error taxonomy returned to collaborators.
//!
//! Ingestion maps these onto ack / no-ack decisions; the request path hands
//! them to the API layer as typed results.

use crate::ids::{AttemptId, TransactionId, Version};
use crate::inbound::MalformedEventError;
use crate::lifecycle::{InvalidTransitionError, MutationKind};
use crate::store::StoreError;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Rate limiter window that rejected a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateWindow {
    /// One-minute window.
    Minute,
    /// One-hour window.
    Hour,
}

impl RateWindow {
    /// Window length.
    #[must_use]
    pub const fn duration(self) -> Duration {
        match self {
            Self::Minute => Duration::from_secs(60),
            Self::Hour => Duration::from_secs(3600),
        }
    }
}

impl fmt::Display for RateWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Minute => "minute",
            Self::Hour => "hour",
        })
    }
}

/// Every failure the collector reports.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollectorError {
    /// Terminal: the inbound event can never be processed.
    #[error(transparent)]
    Malformed(#[from] MalformedEventError),

    /// Worth retrying later (store or broker unavailable).
    #[error("Transient processing failure: {0}")]
    TransientProcessing(String),

    /// The lifecycle table rejected the action.
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransitionError),

    /// Another retry attempt is still open; wait for it.
    #[error("Retry attempt {attempt_number} for {transaction_id} is still in progress")]
    RetryInProgress {
        /// Target exception.
        transaction_id: TransactionId,
        /// Number of the open attempt.
        attempt_number: u32,
    },

    /// Too many mutations by this actor; back off for `retry_after`.
    #[error("Rate limit of {limit} {operation} calls per {window} exceeded for {actor}; retry after {retry_after:?}")]
    RateLimitExceeded {
        /// Calling actor.
        actor: String,
        /// Gated operation.
        operation: MutationKind,
        /// Window that overflowed.
        window: RateWindow,
        /// Ceiling of that window.
        limit: u32,
        /// Time until the window rolls over.
        retry_after: Duration,
    },

    /// The record changed between read and write; may be retried once.
    #[error("Concurrent modification of {transaction_id}: expected version {expected}, found {actual}")]
    OptimisticConcurrencyConflict {
        /// Target exception.
        transaction_id: TransactionId,
        /// Version the writer read.
        expected: Version,
        /// Version stored.
        actual: Version,
    },

    /// No exception with this transaction id.
    #[error("Exception not found: {0}")]
    NotFound(TransactionId),

    /// No retry attempt with this id.
    #[error("Retry attempt not found: {0}")]
    AttemptNotFound(AttemptId),

    /// The retry attempt was already sealed.
    #[error("Retry attempt {0} is already completed")]
    AttemptSealed(AttemptId),

    /// The request-scoped deadline expired.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
}

impl CollectorError {
    /// Retrying the same message or request later may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::TransientProcessing(_) | Self::OptimisticConcurrencyConflict { .. } | Self::Timeout(_)
        )
    }

    /// Short label for metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed",
            Self::TransientProcessing(_) => "transient",
            Self::InvalidTransition(_) => "invalid_transition",
            Self::RetryInProgress { .. } => "retry_in_progress",
            Self::RateLimitExceeded { .. } => "rate_limited",
            Self::OptimisticConcurrencyConflict { .. } => "conflict",
            Self::NotFound(_) => "not_found",
            Self::AttemptNotFound(_) => "attempt_not_found",
            Self::AttemptSealed(_) => "attempt_sealed",
            Self::Timeout(_) => "timeout",
        }
    }
}

impl From<StoreError> for CollectorError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Conflict {
                transaction_id,
                expected,
                actual,
            } => Self::OptimisticConcurrencyConflict {
                transaction_id,
                expected,
                actual,
            },
            StoreError::NotFound(id) => Self::NotFound(id),
            StoreError::AttemptNotFound(id) => Self::AttemptNotFound(id),
            StoreError::AttemptSealed(id) => Self::AttemptSealed(id),
            StoreError::AttemptInProgress {
                transaction_id,
                attempt_number,
            } => Self::RetryInProgress {
                transaction_id,
                attempt_number,
            },
            StoreError::Database(msg) | StoreError::Serialization(msg) => {
                Self::TransientProcessing(msg)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_onto_taxonomy() {
        let conflict: CollectorError = StoreError::Conflict {
            transaction_id: TransactionId::new("T1"),
            expected: Version::new(1),
            actual: Version::new(2),
        }
        .into();
        assert!(matches!(
            conflict,
            CollectorError::OptimisticConcurrencyConflict { .. }
        ));
        assert!(conflict.is_transient());

        let busy: CollectorError = StoreError::AttemptInProgress {
            transaction_id: TransactionId::new("T1"),
            attempt_number: 2,
        }
        .into();
        assert_eq!(busy.kind(), "retry_in_progress");

        let down: CollectorError = StoreError::Database("pool timed out".into()).into();
        assert_eq!(down, CollectorError::TransientProcessing("pool timed out".into()));
    }

    #[test]
    fn rate_limit_message_names_window() {
        let err = CollectorError::RateLimitExceeded {
            actor: "alice".into(),
            operation: MutationKind::Acknowledge,
            window: RateWindow::Minute,
            limit: 30,
            retry_after: Duration::from_secs(12),
        };
        assert!(err.to_string().contains("30 acknowledge calls per minute"));
        assert!(!err.is_transient());
    }
}
