//! Recording doubles for the collector's outbound boundaries.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity

use exception_collector_core::dead_letter::{DeadLetter, DeadLetterError, DeadLetterSink};
use exception_collector_core::events::{ChangeEvent, ChangeKind};
use exception_collector_core::exception::{InterfaceException, RetryAttempt};
use exception_collector_core::message::{AckError, Acknowledgment, InboundMessage};
use exception_collector_core::publisher::{LifecyclePublisher, PublishError};
use exception_collector_core::retry::{RetryExecutor, RetryOutcome};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Captures published change events.
///
/// Can be switched into a failing mode, or made slow, to check that
/// fan-out problems never reach the triggering mutation.
#[derive(Clone, Debug, Default)]
pub struct RecordingPublisher {
    events: Arc<RwLock<Vec<Arc<ChangeEvent>>>>,
    failing: Arc<AtomicBool>,
    delay: Option<Duration>,
}

impl RecordingPublisher {
    /// Create a publisher that records every event.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a publisher that sleeps before recording each event.
    #[must_use]
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// Toggle failing mode.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Every event recorded so far.
    #[must_use]
    pub fn events(&self) -> Vec<Arc<ChangeEvent>> {
        self.events.read().unwrap().clone()
    }

    /// Kinds of the recorded events, in order.
    #[must_use]
    pub fn kinds(&self) -> Vec<ChangeKind> {
        self.events.read().unwrap().iter().map(|e| e.kind).collect()
    }

    /// Wait until at least `count` events are recorded or `timeout` passes.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.events.read().unwrap().len() >= count {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl LifecyclePublisher for RecordingPublisher {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn publish(
        &self,
        event: Arc<ChangeEvent>,
    ) -> Pin<Box<dyn Future<Output = Result<(), PublishError>> + Send + '_>> {
        Box::pin(async move {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(PublishError::ConnectionFailed("recorder set to fail".into()));
            }
            self.events.write().unwrap().push(event);
            Ok(())
        })
    }
}

/// Records acknowledged message coordinates.
#[derive(Clone, Debug, Default)]
pub struct RecordingAcknowledger {
    acked: Arc<RwLock<Vec<(String, i32, i64)>>>,
}

impl RecordingAcknowledger {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `(topic, partition, offset)` of every acknowledged message.
    #[must_use]
    pub fn acked(&self) -> Vec<(String, i32, i64)> {
        self.acked.read().unwrap().clone()
    }

    /// Offsets acknowledged on one partition, in order.
    #[must_use]
    pub fn offsets(&self, partition: i32) -> Vec<i64> {
        self.acked
            .read()
            .unwrap()
            .iter()
            .filter(|(_, p, _)| *p == partition)
            .map(|(_, _, o)| *o)
            .collect()
    }
}

impl Acknowledgment for RecordingAcknowledger {
    fn acknowledge(&self, message: &InboundMessage) -> Result<(), AckError> {
        self.acked
            .write()
            .unwrap()
            .push((message.topic.clone(), message.partition, message.offset));
        Ok(())
    }
}

/// Captures dead letters; can be made unavailable.
#[derive(Clone, Debug, Default)]
pub struct RecordingDeadLetterSink {
    letters: Arc<RwLock<Vec<DeadLetter>>>,
    failing: Arc<AtomicBool>,
}

impl RecordingDeadLetterSink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle unavailability.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Every dead letter received.
    #[must_use]
    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters.read().unwrap().clone()
    }
}

impl DeadLetterSink for RecordingDeadLetterSink {
    fn send(
        &self,
        letter: DeadLetter,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeadLetterError>> + Send + '_>> {
        Box::pin(async move {
            if self.failing.load(Ordering::SeqCst) {
                return Err(DeadLetterError::Unavailable("recorder set to fail".into()));
            }
            self.letters.write().unwrap().push(letter);
            Ok(())
        })
    }
}

/// Retry executor returning scripted outcomes.
///
/// Outcomes are consumed in order; once the script runs out every call
/// succeeds.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRetryExecutor {
    script: Arc<RwLock<VecDeque<RetryOutcome>>>,
    calls: Arc<RwLock<Vec<(InterfaceException, RetryAttempt)>>>,
}

impl ScriptedRetryExecutor {
    /// Create an executor with the given outcomes.
    #[must_use]
    pub fn new(outcomes: impl IntoIterator<Item = RetryOutcome>) -> Self {
        Self {
            script: Arc::new(RwLock::new(outcomes.into_iter().collect())),
            calls: Arc::default(),
        }
    }

    /// Number of executions so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.read().unwrap().len()
    }

    /// Attempt numbers executed, in order.
    #[must_use]
    pub fn executed_attempts(&self) -> Vec<u32> {
        self.calls
            .read()
            .unwrap()
            .iter()
            .map(|(_, a)| a.attempt_number)
            .collect()
    }
}

impl RetryExecutor for ScriptedRetryExecutor {
    fn execute(
        &self,
        exception: InterfaceException,
        attempt: RetryAttempt,
    ) -> Pin<Box<dyn Future<Output = RetryOutcome> + Send + '_>> {
        Box::pin(async move {
            self.calls.write().unwrap().push((exception, attempt));
            self.script
                .write()
                .unwrap()
                .pop_front()
                .unwrap_or_else(RetryOutcome::succeeded)
        })
    }
}
