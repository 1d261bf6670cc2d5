//! Outbound delivery of lifecycle changes.
//!
//! A [`LifecyclePublisher`] pushes [`ChangeEvent`]s to one destination (a
//! broker topic, a websocket hub, a test recorder). Fan-out across several
//! publishers and the delivery deadline are handled by the runtime; a
//! publisher only reports whether its own delivery worked.

use crate::events::ChangeEvent;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Errors from a single publisher.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// The destination could not be reached.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The destination refused the event.
    #[error("Publish failed for '{destination}': {reason}")]
    PublishFailed {
        /// Topic or channel name.
        destination: String,
        /// Reason reported by the destination.
        reason: String,
    },

    /// The event could not be encoded.
    #[error("Serialization failed: {0}")]
    Serialization(String),
}

/// One destination for lifecycle change events.
pub trait LifecyclePublisher: Send + Sync {
    /// Short name used in logs and metric labels.
    fn name(&self) -> &'static str;

    /// Deliver one event.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError`] if delivery failed. Callers log and swallow
    /// it; a failed publish never undoes the change it reports.
    fn publish(
        &self,
        event: Arc<ChangeEvent>,
    ) -> Pin<Box<dyn Future<Output = Result<(), PublishError>> + Send + '_>>;
}
