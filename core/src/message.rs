//! Broker-neutral view of one inbound message and its acknowledgment.

use std::fmt;
use thiserror::Error;

/// One message pulled from a partitioned topic.
#[derive(Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Source topic.
    pub topic: String,
    /// Source partition.
    pub partition: i32,
    /// Offset within the partition.
    pub offset: i64,
    /// Message key.
    pub key: Option<Vec<u8>>,
    /// Message body; tombstones have none.
    pub payload: Option<Vec<u8>>,
}

impl InboundMessage {
    /// Build a message from its parts.
    #[must_use]
    pub fn new(
        topic: impl Into<String>,
        partition: i32,
        offset: i64,
        payload: Option<Vec<u8>>,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            key: None,
            payload,
        }
    }

    /// Attach a key.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }
}

impl fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundMessage")
            .field("topic", &self.topic)
            .field("partition", &self.partition)
            .field("offset", &self.offset)
            .field("payload_len", &self.payload.as_ref().map(Vec::len))
            .finish_non_exhaustive()
    }
}

/// Acknowledgment could not be recorded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Failed to acknowledge {topic}[{partition}]@{offset}: {reason}")]
pub struct AckError {
    /// Topic of the message.
    pub topic: String,
    /// Partition of the message.
    pub partition: i32,
    /// Offset of the message.
    pub offset: i64,
    /// Broker message.
    pub reason: String,
}

/// Marks a message as done so the broker will not redeliver it.
///
/// Called only after the message is durably handled: persisted,
/// recognized as a duplicate, dropped as malformed, or dead-lettered.
pub trait Acknowledgment: Send + Sync {
    /// Acknowledge `message`.
    ///
    /// # Errors
    ///
    /// Returns [`AckError`] if the broker rejected the commit.
    fn acknowledge(&self, message: &InboundMessage) -> Result<(), AckError>;
}
