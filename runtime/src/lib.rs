//! # Exception Collector Runtime
//!
//! Async machinery around the pure lifecycle model in
//! `exception-collector-core`.
//!
//! ## Core Components
//!
//! - **Ingestion**: decode, normalize and idempotently store inbound failure
//!   events, with bounded redelivery and dead-lettering
//! - **Dispatcher**: one ordered worker per broker partition
//! - **Service**: rate-limited, versioned acknowledge / resolve / retry
//! - **Orchestrator**: gapless retry attempt bookkeeping
//! - **Fan-out**: best-effort change delivery to subscribers and publishers
//!
//! ## Example
//!
//! ```ignore
//! use exception_collector_runtime::{ExceptionService, RequestContext};
//!
//! let service = ExceptionService::builder()
//!     .store(Arc::new(store))
//!     .fanout(fanout)
//!     .build()?;
//!
//! let ctx = RequestContext::new("alice");
//! let acked = service.acknowledge(&ctx, &transaction_id, None).await?;
//! ```

/// Exponential backoff for redelivery and dead-letter writes
pub mod backoff;

/// Bounded in-memory dead-letter queue
pub mod dead_letter;

/// Per-partition ordered dispatch
pub mod dispatcher;

/// Change event fan-out and subscriptions
pub mod fanout;

/// Inbound failure event ingestion
pub mod ingestion;

/// Prometheus metrics for observability
pub mod metrics;

/// Retry attempt bookkeeping
pub mod orchestrator;

/// Per-actor mutation rate limiting
pub mod rate_limiter;

/// Collaborator-facing operations
pub mod service;

/// Error types for runtime wiring
pub mod error {
    use thiserror::Error;

    /// A builder was missing a required collaborator.
    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    pub enum BuildError {
        /// The named field was never set.
        #[error("{0} is required")]
        Missing(&'static str),
    }

    /// Errors from [`PartitionDispatcher`](crate::dispatcher::PartitionDispatcher).
    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    pub enum DispatchError {
        /// Dispatcher is shutting down and not accepting new messages
        #[error("Dispatcher is shutting down")]
        ShutdownInProgress,

        /// The partition worker exited and its queue is closed
        #[error("Worker for {topic}[{partition}] is gone")]
        WorkerGone {
            /// Topic of the partition.
            topic: String,
            /// Partition number.
            partition: i32,
        },

        /// Shutdown timed out waiting for workers to drain
        ///
        /// Unacknowledged messages are redelivered by the broker.
        #[error("Shutdown timed out with {0} partition workers still running")]
        ShutdownTimeout(usize),
    }
}

pub use backoff::{BackoffPolicy, retry_with_backoff};
pub use dead_letter::InMemoryDeadLetterQueue;
pub use dispatcher::PartitionDispatcher;
pub use error::{BuildError, DispatchError};
pub use fanout::{FanoutPublisher, Subscription, SubscriptionHub};
pub use ingestion::{Disposition, IngestionConsumer, Processed};
pub use metrics::{MetricsError, MetricsServer};
pub use orchestrator::{CompletedRetry, InitiatedRetry, RetryOrchestrator};
pub use rate_limiter::{MutationRateLimiter, RateLimitConfig, RateLimitStatus};
pub use service::{ExceptionService, RequestContext};
