//! # Exception Collector Testing
//!
//! Test doubles for the exception collector.
//!
//! This crate provides:
//! - Clocks: [`FixedClock`], [`ManualClock`]
//! - [`InMemoryExceptionStore`] with failure injection
//! - Recording publisher, acknowledger, dead-letter sink and a scripted
//!   retry executor
//! - Inbound event [`fixtures`]
//!
//! ## Example
//!
//! ```ignore
//! use exception_collector_testing::{fixtures, InMemoryExceptionStore, test_clock};
//!
//! #[tokio::test]
//! async fn ingests_once() {
//!     let store = Arc::new(InMemoryExceptionStore::new());
//!     let consumer = IngestionConsumer::builder()
//!         .store(store.clone())
//!         .clock(Arc::new(test_clock()))
//!         .build()?;
//!     consumer.process(&fixtures::message(0, 0, &fixtures::order_rejected("T1"))).await?;
//!     assert_eq!(store.len(), 1);
//! }
//! ```

use chrono::{DateTime, Utc};
use exception_collector_core::environment::Clock;

pub mod fixtures;
pub mod recorders;
pub mod store;

/// Mock implementations of Environment traits.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{Arc, RwLock};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use exception_collector_testing::mocks::FixedClock;
    /// use exception_collector_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when told to.
    ///
    /// Clones share the same time, so a test can keep one handle and give
    /// another to the code under test.
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<RwLock<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Start at `time`.
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(RwLock::new(time)),
            }
        }

        /// Move forward by `by`.
        pub fn advance(&self, by: chrono::Duration) {
            let mut time = self
                .time
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            *time += by;
        }

        /// Jump to `time`.
        pub fn set(&self, time: DateTime<Utc>) {
            *self
                .time
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner) = time;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self
                .time
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(test_epoch())
    }

    /// 2025-01-01 00:00:00 UTC
    #[must_use]
    pub fn test_epoch() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_735_689_600, 0).unwrap_or_default()
    }
}

/// Install a test-friendly tracing subscriber; later calls are no-ops.
///
/// Honors `RUST_LOG`, defaulting to `warn`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

// Re-export commonly used items
pub use mocks::{FixedClock, ManualClock, test_clock, test_epoch};
pub use recorders::{
    RecordingAcknowledger, RecordingDeadLetterSink, RecordingPublisher, ScriptedRetryExecutor,
};
pub use store::InMemoryExceptionStore;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        assert_eq!(clock.now(), clock.now());
        assert_eq!(clock.now().to_rfc3339(), "2025-01-01T00:00:00+00:00");
    }

    #[test]
    fn manual_clock_advances_all_clones() {
        let clock = ManualClock::new(test_epoch());
        let handle = clock.clone();
        handle.advance(chrono::Duration::seconds(90));
        assert_eq!((clock.now() - test_epoch()).num_seconds(), 90);
    }
}
