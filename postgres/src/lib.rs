//! `PostgreSQL` storage for the interface exception collector.
//!
//! This crate provides:
//!
//! - [`PostgresExceptionStore`]: the [`ExceptionStore`] used by ingestion and
//!   the request path, with versioned writes and atomic retry-attempt
//!   numbering
//! - [`PostgresDeadLetterQueue`]: a [`DeadLetterSink`] backed by the
//!   `failed_events` table, with an operator triage workflow
//!
//! Schema migrations ship in `migrations/` and run through
//! [`PostgresExceptionStore::migrate`].
//!
//! # Example
//!
//! ```ignore
//! use exception_collector_postgres::{PostgresDeadLetterQueue, PostgresExceptionStore};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = PostgresExceptionStore::new("postgres://localhost/exceptions").await?;
//!     store.migrate().await?;
//!     let dlq = PostgresDeadLetterQueue::new(store.pool().clone());
//!     Ok(())
//! }
//! ```
//!
//! [`ExceptionStore`]: exception_collector_core::store::ExceptionStore
//! [`DeadLetterSink`]: exception_collector_core::dead_letter::DeadLetterSink

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod dead_letter_queue;
pub mod store;

pub use dead_letter_queue::{DLQError, DLQStatus, FailedEvent, PostgresDeadLetterQueue};
pub use store::PostgresExceptionStore;
