//! Boundary to the collaborator that re-runs a failed business operation.
//!
//! The collector only records attempt boundaries. Whatever actually
//! resubmits the order, collection or distribution lives behind
//! [`RetryExecutor`] and reports a boolean outcome.

use crate::exception::{InterfaceException, RetryAttempt};
use std::future::Future;
use std::pin::Pin;

/// What the executor reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryOutcome {
    /// Whether the retried operation succeeded.
    pub success: bool,
    /// Free-form detail on failure.
    pub error_details: Option<String>,
}

impl RetryOutcome {
    /// A successful outcome.
    #[must_use]
    pub const fn succeeded() -> Self {
        Self {
            success: true,
            error_details: None,
        }
    }

    /// A failed outcome with detail.
    #[must_use]
    pub fn failed(details: impl Into<String>) -> Self {
        Self {
            success: false,
            error_details: Some(details.into()),
        }
    }
}

/// Re-runs the operation behind an exception.
pub trait RetryExecutor: Send + Sync {
    /// Execute `attempt` of `exception`.
    ///
    /// Infallible by signature: transport or upstream errors are reported
    /// as a failed [`RetryOutcome`].
    fn execute(
        &self,
        exception: InterfaceException,
        attempt: RetryAttempt,
    ) -> Pin<Box<dyn Future<Output = RetryOutcome> + Send + '_>>;
}
