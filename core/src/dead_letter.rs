//! Dead-letter records for inbound messages that exhausted redelivery.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors writing to a dead-letter destination.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeadLetterError {
    /// The destination is unavailable.
    #[error("Dead-letter destination unavailable: {0}")]
    Unavailable(String),

    /// The destination is full.
    #[error("Dead-letter destination is full (max {max_size})")]
    Full {
        /// Configured capacity.
        max_size: usize,
    },
}

/// An inbound message that failed every processing attempt.
///
/// Carries the raw bytes so an operator can replay it unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Source topic.
    pub topic: String,
    /// Source partition.
    pub partition: i32,
    /// Source offset.
    pub offset: i64,
    /// Message key, if any.
    pub key: Option<Vec<u8>>,
    /// Raw message body.
    pub payload: Vec<u8>,
    /// Transaction id, when the body could be read far enough to find one.
    pub transaction_id: Option<String>,
    /// Last processing error.
    pub error: String,
    /// Processing attempts made (first delivery plus redeliveries).
    pub attempts: u32,
    /// First failure.
    pub first_failed_at: DateTime<Utc>,
    /// Last failure.
    pub last_failed_at: DateTime<Utc>,
}

/// Destination for dead-lettered messages.
pub trait DeadLetterSink: Send + Sync {
    /// Persist one dead letter.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError`] if the record could not be stored.
    fn send(
        &self,
        letter: DeadLetter,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeadLetterError>> + Send + '_>>;
}
