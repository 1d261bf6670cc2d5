//! # Exception Collector Core
//!
//! Domain types and pure rules for collecting interface exceptions: failure
//! notifications emitted by upstream order, collection, distribution and
//! validation interfaces.
//!
//! ## Contents
//!
//! - [`inbound`]: inbound envelope and the normalizer
//! - [`classify`]: category, severity and retryability rules
//! - [`exception`]: the canonical exception and retry-attempt records
//! - [`lifecycle`]: the transition table and the pure `transition` function
//! - [`events`]: lifecycle change events and their outbound envelope
//! - [`store`], [`publisher`], [`dead_letter`], [`message`], [`retry`]:
//!   boundaries to storage, fan-out destinations, dead-letter sinks, the
//!   broker and the retry executor
//! - [`error`]: the error taxonomy handed to collaborators
//!
//! Nothing in this crate performs I/O. Runtimes and adapters live in
//! sibling crates.

pub use chrono::{DateTime, Utc};

pub mod classify;
pub mod dead_letter;
pub mod error;
pub mod events;
pub mod exception;
pub mod ids;
pub mod inbound;
pub mod lifecycle;
pub mod message;
pub mod publisher;
pub mod retry;
pub mod store;

/// Environment module - injected dependencies.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time for testability.
    ///
    /// Production code uses [`SystemClock`]; tests inject a fixed or
    /// manually advanced clock.
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
