//! Canonical exception and retry-attempt records.
//!
//! Every inbound failure shape is normalized into an [`InterfaceException`].
//! [`RetryAttempt`] records belong to exactly one exception and become
//! immutable once `completed_at` is set.

use crate::ids::{AttemptId, TransactionId, Version};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error returned when a stored enum label cannot be decoded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown {kind} value: {value}")]
pub struct UnknownVariant {
    /// Enum being decoded.
    pub kind: &'static str,
    /// Offending label.
    pub value: String,
}

/// Declares a label-backed enum with `as_str`, `Display` and `FromStr`.
macro_rules! labelled_enum {
    (
        $(#[$meta:meta])*
        $name:ident as $kind:literal {
            $( $(#[$vmeta:meta])* $variant:ident => $label:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(
                $(#[$vmeta])*
                #[serde(rename = $label)]
                $variant,
            )+
        }

        impl $name {
            /// Every variant, in declaration order.
            pub const ALL: &'static [Self] = &[$(Self::$variant),+];

            /// Stable wire/storage label.
            #[must_use]
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $label,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_uppercase().as_str() {
                    $($label => Ok(Self::$variant),)+
                    _ => Err(UnknownVariant {
                        kind: $kind,
                        value: s.to_string(),
                    }),
                }
            }
        }
    };
}

labelled_enum! {
    /// Upstream interface that reported the failure.
    InterfaceType as "interface type" {
        /// Partner order intake.
        Order => "ORDER",
        /// Donor collection.
        Collection => "COLLECTION",
        /// Product distribution.
        Distribution => "DISTRIBUTION",
        /// Schema/field validation failures from any interface.
        Validation => "VALIDATION",
    }
}

labelled_enum! {
    /// Operator-facing urgency.
    ExceptionSeverity as "severity" {
        /// Informational.
        Low => "LOW",
        /// Default.
        Medium => "MEDIUM",
        /// Customer-visible or blocking.
        High => "HIGH",
        /// Platform-level failure.
        Critical => "CRITICAL",
    }
}

labelled_enum! {
    /// Broad cause of the failure.
    ExceptionCategory as "category" {
        /// Domain rule rejected the operation.
        BusinessRule => "BUSINESS_RULE",
        /// Input failed validation.
        Validation => "VALIDATION",
        /// Timeout or connectivity failure.
        NetworkError => "NETWORK_ERROR",
        /// Caller lacked permission.
        Authorization => "AUTHORIZATION",
        /// Caller could not be authenticated.
        Authentication => "AUTHENTICATION",
        /// Internal failure of the upstream service.
        SystemError => "SYSTEM_ERROR",
        /// A dependency of the upstream service failed.
        ExternalService => "EXTERNAL_SERVICE",
    }
}

labelled_enum! {
    /// Lifecycle state of an exception.
    ExceptionStatus as "status" {
        /// Captured, nobody has looked at it yet.
        New => "NEW",
        /// An operator has taken ownership.
        Acknowledged => "ACKNOWLEDGED",
        /// The latest retry attempt failed.
        RetriedFailed => "RETRIED_FAILED",
        /// Terminal: fixed by retry or by hand.
        Resolved => "RESOLVED",
        /// Terminal: archived.
        Closed => "CLOSED",
    }
}

impl ExceptionStatus {
    /// `RESOLVED` and `CLOSED` accept no further lifecycle actions.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Resolved | Self::Closed)
    }
}

labelled_enum! {
    /// How a resolved exception was resolved.
    ResolutionMethod as "resolution method" {
        /// A retry attempt succeeded.
        RetrySuccess => "RETRY_SUCCESS",
        /// An operator fixed it by hand.
        ManualResolution => "MANUAL_RESOLUTION",
        /// The customer fixed it on their side.
        CustomerResolved => "CUSTOMER_RESOLVED",
        /// Resolved by automation outside the retry path.
        Automated => "AUTOMATED",
    }
}

labelled_enum! {
    /// State of one retry attempt.
    RetryStatus as "retry status" {
        /// Initiated, outcome not yet known.
        Pending => "PENDING",
        /// The retried operation succeeded.
        Success => "SUCCESS",
        /// The retried operation failed.
        Failed => "FAILED",
        /// Withdrawn before an outcome arrived.
        Cancelled => "CANCELLED",
    }
}

/// One recorded failure of an upstream business operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceException {
    /// Idempotency key.
    pub transaction_id: TransactionId,
    /// Reporting interface.
    pub interface_type: InterfaceType,
    /// Business identifier in the upstream system (order id, collection id, ...).
    pub external_id: Option<String>,
    /// Operation that failed, e.g. `CREATE_ORDER`.
    pub operation: String,
    /// Human-readable failure reason.
    pub exception_reason: String,
    /// Derived cause category.
    pub category: ExceptionCategory,
    /// Derived urgency.
    pub severity: ExceptionSeverity,
    /// Lifecycle state.
    pub status: ExceptionStatus,
    /// Customer or donor correlation attribute.
    pub customer_id: Option<String>,
    /// Location correlation attribute.
    pub location_code: Option<String>,
    /// Whether retrying the operation can ever help.
    pub retryable: bool,
    /// Number of retry attempts completed with an outcome.
    pub retry_count: u32,
    /// Operator who acknowledged.
    pub acknowledged_by: Option<String>,
    /// When it was acknowledged.
    pub acknowledged_at: Option<DateTime<Utc>>,
    /// Free-form acknowledgment notes.
    pub acknowledgment_notes: Option<String>,
    /// Who resolved it (operator, or the retry initiator).
    pub resolved_by: Option<String>,
    /// When it was resolved.
    pub resolved_at: Option<DateTime<Utc>>,
    /// How it was resolved.
    pub resolution_method: Option<ResolutionMethod>,
    /// Free-form resolution notes.
    pub resolution_notes: Option<String>,
    /// When the latest retry was initiated.
    pub last_retry_at: Option<DateTime<Utc>>,
    /// Source event time.
    pub timestamp: DateTime<Utc>,
    /// Ingestion time.
    pub processed_at: DateTime<Utc>,
    /// Correlation id carried by the inbound envelope.
    pub correlation_id: Option<String>,
    /// Snapshot of the originating business object, if any.
    pub enrichment: Option<serde_json::Value>,
    /// Optimistic concurrency version.
    pub version: Version,
}

impl InterfaceException {
    /// True once the exception is `RESOLVED` or `CLOSED`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// One retry execution of a failed operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryAttempt {
    /// Owning exception.
    pub transaction_id: TransactionId,
    /// 1-based, gapless per exception.
    pub attempt_number: u32,
    /// Attempt state.
    pub status: RetryStatus,
    /// Actor that asked for the retry.
    pub initiated_by: String,
    /// When the attempt was opened.
    pub initiated_at: DateTime<Utc>,
    /// Set once; the attempt is sealed from then on.
    pub completed_at: Option<DateTime<Utc>>,
    /// Outcome reported by the executor.
    pub result_success: Option<bool>,
    /// Short outcome message.
    pub result_message: Option<String>,
    /// Free-form failure detail.
    pub error_details: Option<String>,
}

impl RetryAttempt {
    /// Open a new pending attempt.
    #[must_use]
    pub fn pending(
        transaction_id: TransactionId,
        attempt_number: u32,
        initiated_by: impl Into<String>,
        initiated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            transaction_id,
            attempt_number,
            status: RetryStatus::Pending,
            initiated_by: initiated_by.into(),
            initiated_at,
            completed_at: None,
            result_success: None,
            result_message: None,
            error_details: None,
        }
    }

    /// Composite identifier.
    #[must_use]
    pub fn id(&self) -> AttemptId {
        AttemptId::new(self.transaction_id.clone(), self.attempt_number)
    }

    /// An attempt stays open until `completed_at` is set.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.completed_at.is_none()
    }

    /// Seal with an executor outcome.
    #[must_use]
    pub fn completed(
        mut self,
        success: bool,
        error_details: Option<String>,
        at: DateTime<Utc>,
    ) -> Self {
        self.status = if success {
            RetryStatus::Success
        } else {
            RetryStatus::Failed
        };
        self.result_success = Some(success);
        self.result_message = Some(
            if success {
                "Retry completed successfully"
            } else {
                "Retry failed"
            }
            .to_string(),
        );
        self.error_details = error_details;
        self.completed_at = Some(at);
        self
    }

    /// Seal as withdrawn without an outcome.
    #[must_use]
    pub fn cancelled(mut self, actor: &str, at: DateTime<Utc>) -> Self {
        self.status = RetryStatus::Cancelled;
        self.result_success = Some(false);
        self.result_message = Some(format!("Retry cancelled by {actor}"));
        self.completed_at = Some(at);
        self
    }

    /// Whether this attempt counts towards `retry_count`.
    #[must_use]
    pub const fn has_outcome(&self) -> bool {
        matches!(self.status, RetryStatus::Success | RetryStatus::Failed)
    }
}
