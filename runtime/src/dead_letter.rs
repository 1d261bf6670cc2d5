//! Bounded in-memory dead-letter queue.
//!
//! Holds dead-lettered inbound messages for inspection and manual replay in
//! single-process deployments and tests. Unlike a lossy buffer it never
//! evicts: once full it refuses new letters, so the ingestion worker keeps
//! the message unacknowledged instead of losing it.

use exception_collector_core::dead_letter::{DeadLetter, DeadLetterError, DeadLetterSink};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

/// In-memory [`DeadLetterSink`].
///
/// # Example
///
/// ```ignore
/// let dlq = InMemoryDeadLetterQueue::new(1000);
/// consumer_builder.dead_letters(Arc::new(dlq.clone()));
///
/// // later, operator tooling
/// for letter in dlq.drain() {
///     println!("{}[{}]@{}: {}", letter.topic, letter.partition, letter.offset, letter.error);
/// }
/// ```
#[derive(Debug, Clone)]
pub struct InMemoryDeadLetterQueue {
    queue: Arc<Mutex<VecDeque<DeadLetter>>>,
    max_size: usize,
}

impl InMemoryDeadLetterQueue {
    /// Create a queue holding at most `max_size` letters.
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: Arc::new(Mutex::new(VecDeque::new())),
            max_size,
        }
    }

    /// Append a letter.
    ///
    /// # Errors
    ///
    /// [`DeadLetterError::Full`] when the queue is at capacity.
    pub fn push(&self, letter: DeadLetter) -> Result<(), DeadLetterError> {
        let mut queue = self
            .queue
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if queue.len() >= self.max_size {
            metrics::counter!("dlq_rejected_total").increment(1);
            tracing::error!(
                max_size = self.max_size,
                topic = %letter.topic,
                partition = letter.partition,
                offset = letter.offset,
                "Dead-letter queue full, refusing message"
            );
            return Err(DeadLetterError::Full {
                max_size: self.max_size,
            });
        }

        tracing::warn!(
            topic = %letter.topic,
            partition = letter.partition,
            offset = letter.offset,
            attempts = letter.attempts,
            error = %letter.error,
            "Message added to dead-letter queue"
        );
        queue.push_back(letter);

        #[allow(clippy::cast_precision_loss)]
        metrics::gauge!("dlq_size").set(queue.len() as f64);
        Ok(())
    }

    /// Current number of letters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return every letter, oldest first.
    pub fn drain(&self) -> Vec<DeadLetter> {
        let mut queue = self
            .queue
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let letters: Vec<_> = queue.drain(..).collect();
        metrics::gauge!("dlq_size").set(0.0);
        tracing::info!(count = letters.len(), "Drained dead-letter queue");
        letters
    }

    /// Oldest letter, if any.
    #[must_use]
    pub fn peek(&self) -> Option<DeadLetter> {
        self.queue
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .front()
            .cloned()
    }

    /// Configured capacity.
    #[must_use]
    pub const fn max_size(&self) -> usize {
        self.max_size
    }
}

impl Default for InMemoryDeadLetterQueue {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl DeadLetterSink for InMemoryDeadLetterQueue {
    fn send(
        &self,
        letter: DeadLetter,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeadLetterError>> + Send + '_>> {
        let result = self.push(letter);
        Box::pin(async move { result })
    }
}
