//! Inbound partition consumer with manual offset commits.

use crate::RedpandaError;
use exception_collector_core::message::{AckError, Acknowledgment, InboundMessage};
use exception_collector_runtime::{DispatchError, PartitionDispatcher};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::{Offset, TopicPartitionList};
use std::future::Future;
use std::sync::Arc;

/// Default consumer group.
pub const DEFAULT_CONSUMER_GROUP: &str = "interface-exception-collector";

/// Copy a broker message into the broker-neutral [`InboundMessage`].
#[must_use]
pub fn inbound_from<M: Message>(message: &M) -> InboundMessage {
    InboundMessage {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(<[u8]>::to_vec),
        payload: message.payload().map(<[u8]>::to_vec),
    }
}

/// Reads the inbound failure topics and hands every message to a
/// [`PartitionDispatcher`].
///
/// # Example
///
/// ```no_run
/// use exception_collector_redpanda::RedpandaConsumer;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let consumer = RedpandaConsumer::builder()
///     .brokers("localhost:9092")
///     .consumer_group("exception-collector")
///     .topics(["OrderRejected", "OrderCancelled"])
///     .auto_offset_reset("earliest")
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RedpandaConsumer {
    consumer: Arc<StreamConsumer>,
    topics: Vec<String>,
    group: String,
}

impl RedpandaConsumer {
    /// Create a new builder.
    #[must_use]
    pub fn builder() -> RedpandaConsumerBuilder {
        RedpandaConsumerBuilder::default()
    }

    /// Subscribed topics.
    #[must_use]
    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    /// Consumer group id.
    #[must_use]
    pub fn group(&self) -> &str {
        &self.group
    }

    /// An [`Acknowledgment`] that commits through this consumer.
    #[must_use]
    pub fn committer(&self) -> Arc<dyn Acknowledgment> {
        Arc::new(OffsetCommitter {
            consumer: Arc::clone(&self.consumer),
        })
    }

    /// Pump messages into `dispatcher` until `shutdown` completes.
    ///
    /// Broker receive errors are logged and the loop keeps going; the
    /// client reconnects on its own.
    ///
    /// # Errors
    ///
    /// [`RedpandaError::Dispatch`] if a partition worker has died. Its
    /// uncommitted messages are redelivered after restart.
    pub async fn run<S>(
        &self,
        dispatcher: &mut PartitionDispatcher,
        shutdown: S,
    ) -> Result<(), RedpandaError>
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        tracing::info!(topics = ?self.topics, group = %self.group, "Consuming inbound topics");

        loop {
            let inbound = tokio::select! {
                () = &mut shutdown => {
                    tracing::info!("Consumer loop stopping");
                    return Ok(());
                }
                received = self.consumer.recv() => match received {
                    Ok(message) => inbound_from(&message),
                    Err(error) => {
                        tracing::warn!(%error, "Failed to receive message");
                        continue;
                    }
                },
            };

            tracing::trace!(
                topic = %inbound.topic,
                partition = inbound.partition,
                offset = inbound.offset,
                "Received message"
            );

            match dispatcher.dispatch(inbound).await {
                Ok(()) => {}
                Err(DispatchError::ShutdownInProgress) => return Ok(()),
                Err(error) => {
                    tracing::error!(%error, "Dispatch failed");
                    return Err(error.into());
                }
            }
        }
    }
}

impl std::fmt::Debug for RedpandaConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedpandaConsumer")
            .field("topics", &self.topics)
            .field("group", &self.group)
            .finish_non_exhaustive()
    }
}

/// Builder for a [`RedpandaConsumer`].
#[derive(Default)]
pub struct RedpandaConsumerBuilder {
    brokers: Option<String>,
    consumer_group: Option<String>,
    topics: Vec<String>,
    auto_offset_reset: Option<String>,
    session_timeout_ms: Option<u32>,
}

impl RedpandaConsumerBuilder {
    /// Comma-separated bootstrap servers.
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Consumer group id. Default: [`DEFAULT_CONSUMER_GROUP`].
    #[must_use]
    pub fn consumer_group(mut self, group: impl Into<String>) -> Self {
        self.consumer_group = Some(group.into());
        self
    }

    /// Inbound topics to subscribe to.
    #[must_use]
    pub fn topics<I, T>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.topics = topics.into_iter().map(Into::into).collect();
        self
    }

    /// Where a new group starts reading: `"earliest"` or `"latest"`.
    ///
    /// Default: `"earliest"`
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Group session timeout. Default: 6000 ms.
    #[must_use]
    pub const fn session_timeout_ms(mut self, timeout: u32) -> Self {
        self.session_timeout_ms = Some(timeout);
        self
    }

    /// Create the consumer and subscribe.
    ///
    /// # Errors
    ///
    /// - [`RedpandaError::NotConfigured`] without brokers or topics
    /// - [`RedpandaError::ConnectionFailed`] if the client cannot be created
    /// - [`RedpandaError::SubscriptionFailed`] if subscribing fails
    pub fn build(self) -> Result<RedpandaConsumer, RedpandaError> {
        let brokers = self.brokers.ok_or(RedpandaError::NotConfigured("brokers"))?;
        if self.topics.is_empty() {
            return Err(RedpandaError::NotConfigured("topics"));
        }
        let group = self
            .consumer_group
            .unwrap_or_else(|| DEFAULT_CONSUMER_GROUP.to_string());
        let auto_offset_reset = self
            .auto_offset_reset
            .unwrap_or_else(|| "earliest".to_string());
        let session_timeout = self.session_timeout_ms.unwrap_or(6000).to_string();

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("group.id", &group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &auto_offset_reset)
            .set("session.timeout.ms", &session_timeout)
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| RedpandaError::ConnectionFailed(format!("Failed to create consumer: {e}")))?;

        let topic_refs: Vec<&str> = self.topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topic_refs)
            .map_err(|e| RedpandaError::SubscriptionFailed {
                topics: self.topics.clone(),
                reason: e.to_string(),
            })?;

        tracing::info!(
            brokers = %brokers,
            group = %group,
            topics = ?self.topics,
            auto_offset_reset = %auto_offset_reset,
            manual_commit = true,
            "RedpandaConsumer created"
        );

        Ok(RedpandaConsumer {
            consumer: Arc::new(consumer),
            topics: self.topics,
            group,
        })
    }
}

/// Commits `offset + 1` for an acknowledged message.
pub struct OffsetCommitter {
    consumer: Arc<StreamConsumer>,
}

impl Acknowledgment for OffsetCommitter {
    fn acknowledge(&self, message: &InboundMessage) -> Result<(), AckError> {
        let failed = |reason: String| AckError {
            topic: message.topic.clone(),
            partition: message.partition,
            offset: message.offset,
            reason,
        };

        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(
                &message.topic,
                message.partition,
                Offset::Offset(message.offset + 1),
            )
            .map_err(|e| failed(e.to_string()))?;

        self.consumer
            .commit(&offsets, CommitMode::Async)
            .map_err(|e| {
                tracing::warn!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    error = %e,
                    "Failed to commit offset (message may be redelivered)"
                );
                failed(e.to_string())
            })
    }
}

impl std::fmt::Debug for OffsetCommitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OffsetCommitter").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use rdkafka::Timestamp;
    use rdkafka::message::OwnedMessage;

    #[test]
    fn consumer_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<RedpandaConsumer>();
        assert_send_sync::<OffsetCommitter>();
    }

    #[test]
    fn inbound_copies_coordinates_and_bytes() {
        let message = OwnedMessage::new(
            Some(b"{\"eventType\":\"OrderRejected\"}".to_vec()),
            Some(b"T1".to_vec()),
            "OrderRejected".to_string(),
            Timestamp::NotAvailable,
            3,
            42,
            None,
        );

        let inbound = inbound_from(&message);
        assert_eq!(inbound.topic, "OrderRejected");
        assert_eq!(inbound.partition, 3);
        assert_eq!(inbound.offset, 42);
        assert_eq!(inbound.key.as_deref(), Some(&b"T1"[..]));
        assert_eq!(
            inbound.payload.as_deref(),
            Some(&b"{\"eventType\":\"OrderRejected\"}"[..])
        );
    }

    #[test]
    fn tombstone_has_no_payload() {
        let message = OwnedMessage::new(
            None,
            None,
            "OrderRejected".to_string(),
            Timestamp::NotAvailable,
            0,
            7,
            None,
        );
        let inbound = inbound_from(&message);
        assert!(inbound.payload.is_none());
        assert!(inbound.key.is_none());
    }

    #[test]
    fn build_requires_brokers_and_topics() {
        let err = RedpandaConsumer::builder().topics(["OrderRejected"]).build().unwrap_err();
        assert!(matches!(err, RedpandaError::NotConfigured("brokers")));

        let err = RedpandaConsumer::builder().brokers("localhost:9092").build().unwrap_err();
        assert!(matches!(err, RedpandaError::NotConfigured("topics")));
    }
}
