//! Lifecycle change events and their outbound wire envelope.

use crate::exception::{InterfaceException, RetryAttempt};
use crate::ids::TransactionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;

/// Value of `source` on every outbound envelope.
pub const EVENT_SOURCE: &str = "exception-collector-service";

/// Value of `eventVersion` on every outbound envelope.
pub const EVENT_VERSION: &str = "1.0";

/// What changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    /// A new exception was captured.
    Captured,
    /// An operator acknowledged it.
    Acknowledged,
    /// It reached `RESOLVED`.
    Resolved,
    /// A retry attempt was opened.
    RetryInitiated,
    /// A retry attempt was sealed.
    RetryCompleted,
}

impl ChangeKind {
    /// Outbound `eventType`.
    #[must_use]
    pub const fn event_type(self) -> &'static str {
        match self {
            Self::Captured => "ExceptionCaptured",
            Self::Acknowledged => "ExceptionAcknowledged",
            Self::Resolved => "ExceptionResolved",
            Self::RetryInitiated => "RetryInitiated",
            Self::RetryCompleted => "RetryCompleted",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.event_type())
    }
}

/// A lifecycle change, carrying the full current exception.
///
/// Retry events also carry the attempt they concern. `occurred_at` is the
/// time of the originating transition and anchors the delivery deadline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    /// What changed.
    pub kind: ChangeKind,
    /// The exception after the change.
    pub exception: InterfaceException,
    /// The attempt, for retry events.
    pub attempt: Option<RetryAttempt>,
    /// When the transition was persisted.
    pub occurred_at: DateTime<Utc>,
}

impl ChangeEvent {
    /// `ExceptionCaptured`
    #[must_use]
    pub const fn captured(exception: InterfaceException, at: DateTime<Utc>) -> Self {
        Self {
            kind: ChangeKind::Captured,
            exception,
            attempt: None,
            occurred_at: at,
        }
    }

    /// `ExceptionAcknowledged`
    #[must_use]
    pub const fn acknowledged(exception: InterfaceException, at: DateTime<Utc>) -> Self {
        Self {
            kind: ChangeKind::Acknowledged,
            exception,
            attempt: None,
            occurred_at: at,
        }
    }

    /// `ExceptionResolved`
    #[must_use]
    pub const fn resolved(exception: InterfaceException, at: DateTime<Utc>) -> Self {
        Self {
            kind: ChangeKind::Resolved,
            exception,
            attempt: None,
            occurred_at: at,
        }
    }

    /// `RetryInitiated`
    #[must_use]
    pub const fn retry_initiated(
        exception: InterfaceException,
        attempt: RetryAttempt,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: ChangeKind::RetryInitiated,
            exception,
            attempt: Some(attempt),
            occurred_at: at,
        }
    }

    /// `RetryCompleted`
    #[must_use]
    pub const fn retry_completed(
        exception: InterfaceException,
        attempt: RetryAttempt,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: ChangeKind::RetryCompleted,
            exception,
            attempt: Some(attempt),
            occurred_at: at,
        }
    }

    /// The exception this event is about.
    #[must_use]
    pub const fn transaction_id(&self) -> &TransactionId {
        &self.exception.transaction_id
    }

    /// Build the outbound envelope.
    ///
    /// `causation_id` is the id of the inbound event or request that
    /// triggered the change, when known.
    #[must_use]
    pub fn to_envelope(&self, causation_id: Option<String>) -> OutboundEnvelope {
        OutboundEnvelope {
            event_id: uuid::Uuid::new_v4().to_string(),
            event_type: self.kind.event_type().to_string(),
            event_version: EVENT_VERSION.to_string(),
            occurred_on: self.occurred_at,
            source: EVENT_SOURCE.to_string(),
            correlation_id: self.exception.transaction_id.to_string(),
            causation_id,
            payload: self.payload(),
        }
    }

    fn payload(&self) -> Value {
        let e = &self.exception;
        match self.kind {
            ChangeKind::Captured => json!({
                "transactionId": e.transaction_id,
                "interfaceType": e.interface_type,
                "externalId": e.external_id,
                "operation": e.operation,
                "severity": e.severity,
                "category": e.category,
                "exceptionReason": e.exception_reason,
                "customerId": e.customer_id,
                "locationCode": e.location_code,
                "retryable": e.retryable,
            }),
            ChangeKind::Acknowledged => json!({
                "transactionId": e.transaction_id,
                "status": e.status,
                "acknowledgedBy": e.acknowledged_by,
                "acknowledgedAt": e.acknowledged_at,
                "notes": e.acknowledgment_notes,
            }),
            ChangeKind::Resolved => json!({
                "transactionId": e.transaction_id,
                "resolutionMethod": e.resolution_method,
                "resolvedBy": e.resolved_by,
                "resolvedAt": e.resolved_at,
                "totalRetryAttempts": e.retry_count,
                "resolutionNotes": e.resolution_notes,
            }),
            ChangeKind::RetryInitiated | ChangeKind::RetryCompleted => {
                let attempt = self.attempt.as_ref();
                json!({
                    "transactionId": e.transaction_id,
                    "status": e.status,
                    "retryCount": e.retry_count,
                    "attemptNumber": attempt.map(|a| a.attempt_number),
                    "attemptStatus": attempt.map(|a| a.status),
                    "initiatedBy": attempt.map(|a| a.initiated_by.as_str()),
                    "initiatedAt": attempt.map(|a| a.initiated_at),
                    "completedAt": attempt.and_then(|a| a.completed_at),
                    "success": attempt.and_then(|a| a.result_success),
                    "errorDetails": attempt.and_then(|a| a.error_details.as_deref()),
                })
            }
        }
    }
}

/// Outbound lifecycle event in the shared envelope style.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundEnvelope {
    /// Random UUID.
    pub event_id: String,
    /// One of the [`ChangeKind`] event types.
    pub event_type: String,
    /// Always [`EVENT_VERSION`].
    pub event_version: String,
    /// Time of the originating transition.
    pub occurred_on: DateTime<Utc>,
    /// Always [`EVENT_SOURCE`].
    pub source: String,
    /// The exception's transaction id.
    pub correlation_id: String,
    /// Triggering event or request id.
    pub causation_id: Option<String>,
    /// Kind-specific body.
    pub payload: Value,
}
