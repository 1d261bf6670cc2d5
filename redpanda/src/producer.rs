//! Outbound producers: dead-letter topics and lifecycle events.

use crate::RedpandaError;
use exception_collector_core::dead_letter::{DeadLetter, DeadLetterError, DeadLetterSink};
use exception_collector_core::events::{ChangeEvent, ChangeKind};
use exception_collector_core::publisher::{LifecyclePublisher, PublishError};
use rdkafka::config::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Suffix appended to the source topic for dead letters.
pub const DEFAULT_DEAD_LETTER_SUFFIX: &str = ".DLT";

/// A configured rdkafka producer shared by the outbound adapters.
///
/// # Example
///
/// ```no_run
/// use exception_collector_redpanda::RedpandaProducer;
/// use std::time::Duration;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let producer = RedpandaProducer::builder()
///     .brokers("localhost:9092")
///     .producer_acks("all")
///     .timeout(Duration::from_secs(5))
///     .build()?;
///
/// let dead_letters = producer.dead_letter_sink();
/// let publisher = producer.lifecycle_publisher();
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RedpandaProducer {
    producer: FutureProducer,
    timeout: Duration,
}

impl RedpandaProducer {
    /// Create a producer with default settings.
    ///
    /// # Errors
    ///
    /// [`RedpandaError::ConnectionFailed`] if the client cannot be created.
    pub fn new(brokers: &str) -> Result<Self, RedpandaError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a new builder.
    #[must_use]
    pub fn builder() -> RedpandaProducerBuilder {
        RedpandaProducerBuilder::default()
    }

    /// A dead-letter sink writing to `<topic>.DLT`.
    #[must_use]
    pub fn dead_letter_sink(&self) -> KafkaDeadLetterSink {
        KafkaDeadLetterSink {
            producer: self.clone(),
            suffix: DEFAULT_DEAD_LETTER_SUFFIX.to_string(),
        }
    }

    /// A lifecycle publisher using the default topic per event type.
    #[must_use]
    pub fn lifecycle_publisher(&self) -> KafkaLifecyclePublisher {
        KafkaLifecyclePublisher {
            producer: self.clone(),
            topics: HashMap::new(),
        }
    }

    async fn send(
        &self,
        topic: &str,
        key: Option<&[u8]>,
        payload: &[u8],
        headers: Option<OwnedHeaders>,
    ) -> Result<(i32, i64), String> {
        let mut record = FutureRecord::<[u8], [u8]>::to(topic).payload(payload);
        if let Some(key) = key {
            record = record.key(key);
        }
        if let Some(headers) = headers {
            record = record.headers(headers);
        }

        self.producer
            .send(record, Timeout::After(self.timeout))
            .await
            .map_err(|(error, _)| error.to_string())
    }
}

impl std::fmt::Debug for RedpandaProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedpandaProducer")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Builder for a [`RedpandaProducer`].
#[derive(Default)]
pub struct RedpandaProducerBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
}

impl RedpandaProducerBuilder {
    /// Comma-separated bootstrap servers.
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// `"0"`, `"1"` or `"all"`. Default: `"all"`
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// `"none"`, `"gzip"`, `"snappy"`, `"lz4"` or `"zstd"`. Default: `"none"`
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Send timeout. Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Build the producer.
    ///
    /// # Errors
    ///
    /// - [`RedpandaError::NotConfigured`] without brokers
    /// - [`RedpandaError::ConnectionFailed`] if the client cannot be created
    pub fn build(self) -> Result<RedpandaProducer, RedpandaError> {
        let brokers = self.brokers.ok_or(RedpandaError::NotConfigured("brokers"))?;
        let acks = self.producer_acks.as_deref().unwrap_or("all");
        let compression = self.compression.as_deref().unwrap_or("none");
        let timeout = self.timeout.unwrap_or(Duration::from_secs(5));

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", acks)
            .set("compression.type", compression)
            .create()
            .map_err(|e| RedpandaError::ConnectionFailed(format!("Failed to create producer: {e}")))?;

        tracing::info!(brokers = %brokers, acks, compression, "RedpandaProducer created");

        Ok(RedpandaProducer { producer, timeout })
    }
}

/// Failure metadata carried as headers on a dead-letter record.
#[must_use]
pub fn dead_letter_headers(letter: &DeadLetter) -> OwnedHeaders {
    let partition = letter.partition.to_string();
    let offset = letter.offset.to_string();
    let attempts = letter.attempts.to_string();
    let first = letter.first_failed_at.to_rfc3339();
    let last = letter.last_failed_at.to_rfc3339();

    let mut headers = OwnedHeaders::new()
        .insert(Header { key: "dlt-original-topic", value: Some(letter.topic.as_str()) })
        .insert(Header { key: "dlt-original-partition", value: Some(partition.as_str()) })
        .insert(Header { key: "dlt-original-offset", value: Some(offset.as_str()) })
        .insert(Header { key: "dlt-exception-message", value: Some(letter.error.as_str()) })
        .insert(Header { key: "dlt-attempts", value: Some(attempts.as_str()) })
        .insert(Header { key: "dlt-first-failed-at", value: Some(first.as_str()) })
        .insert(Header { key: "dlt-last-failed-at", value: Some(last.as_str()) });
    if let Some(transaction_id) = &letter.transaction_id {
        headers = headers.insert(Header {
            key: "dlt-transaction-id",
            value: Some(transaction_id.as_str()),
        });
    }
    headers
}

/// Dead-letter sink writing the raw message to `<topic><suffix>`.
///
/// The key and payload are copied unchanged so the record can be replayed
/// onto the source topic.
#[derive(Debug, Clone)]
pub struct KafkaDeadLetterSink {
    producer: RedpandaProducer,
    suffix: String,
}

impl KafkaDeadLetterSink {
    /// Override the topic suffix.
    #[must_use]
    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    /// Destination topic for a letter from `topic`.
    #[must_use]
    pub fn topic_for(&self, topic: &str) -> String {
        format!("{topic}{}", self.suffix)
    }
}

impl DeadLetterSink for KafkaDeadLetterSink {
    fn send(
        &self,
        letter: DeadLetter,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeadLetterError>> + Send + '_>> {
        Box::pin(async move {
            let topic = self.topic_for(&letter.topic);
            let headers = dead_letter_headers(&letter);

            match self
                .producer
                .send(&topic, letter.key.as_deref(), &letter.payload, Some(headers))
                .await
            {
                Ok((partition, offset)) => {
                    tracing::warn!(
                        dlt_topic = %topic,
                        dlt_partition = partition,
                        dlt_offset = offset,
                        source_partition = letter.partition,
                        source_offset = letter.offset,
                        transaction_id = ?letter.transaction_id,
                        "Message dead-lettered"
                    );
                    Ok(())
                }
                Err(reason) => {
                    tracing::error!(dlt_topic = %topic, %reason, "Failed to write dead letter");
                    Err(DeadLetterError::Unavailable(reason))
                }
            }
        })
    }
}

/// Publishes lifecycle envelopes, one topic per event type.
///
/// Topics default to the event type (`ExceptionCaptured`,
/// `ExceptionResolved`, ...). The record key is the transaction id so all
/// changes of one exception land on the same partition.
#[derive(Debug, Clone)]
pub struct KafkaLifecyclePublisher {
    producer: RedpandaProducer,
    topics: HashMap<ChangeKind, String>,
}

impl KafkaLifecyclePublisher {
    /// Route `kind` to `topic`.
    #[must_use]
    pub fn with_topic(mut self, kind: ChangeKind, topic: impl Into<String>) -> Self {
        self.topics.insert(kind, topic.into());
        self
    }

    /// Destination topic for `kind`.
    #[must_use]
    pub fn topic_for(&self, kind: ChangeKind) -> &str {
        self.topics
            .get(&kind)
            .map_or_else(|| kind.event_type(), String::as_str)
    }
}

impl LifecyclePublisher for KafkaLifecyclePublisher {
    fn name(&self) -> &'static str {
        "kafka"
    }

    fn publish(
        &self,
        event: Arc<ChangeEvent>,
    ) -> Pin<Box<dyn Future<Output = Result<(), PublishError>> + Send + '_>> {
        Box::pin(async move {
            let topic = self.topic_for(event.kind);
            let envelope = event.to_envelope(None);
            let payload = serde_json::to_vec(&envelope)
                .map_err(|e| PublishError::Serialization(e.to_string()))?;
            let key = event.exception.transaction_id.as_str().as_bytes();

            match self.producer.send(topic, Some(key), &payload, None).await {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        topic,
                        partition,
                        offset,
                        event_type = %envelope.event_type,
                        transaction_id = %event.exception.transaction_id,
                        "Lifecycle event published"
                    );
                    Ok(())
                }
                Err(reason) => Err(PublishError::PublishFailed {
                    destination: topic.to_string(),
                    reason,
                }),
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rdkafka::message::Headers;

    fn letter(transaction_id: Option<&str>) -> DeadLetter {
        let at = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        DeadLetter {
            topic: "OrderRejected".to_string(),
            partition: 1,
            offset: 99,
            key: Some(b"T1".to_vec()),
            payload: b"{}".to_vec(),
            transaction_id: transaction_id.map(str::to_string),
            error: "pool timed out".to_string(),
            attempts: 6,
            first_failed_at: at,
            last_failed_at: at,
        }
    }

    fn header_map(headers: &OwnedHeaders) -> HashMap<String, String> {
        headers
            .iter()
            .map(|h| {
                (
                    h.key.to_string(),
                    String::from_utf8_lossy(h.value.unwrap_or_default()).into_owned(),
                )
            })
            .collect()
    }

    #[test]
    fn dead_letter_headers_carry_failure_metadata() {
        let headers = header_map(&dead_letter_headers(&letter(Some("T1"))));
        assert_eq!(headers["dlt-original-topic"], "OrderRejected");
        assert_eq!(headers["dlt-original-partition"], "1");
        assert_eq!(headers["dlt-original-offset"], "99");
        assert_eq!(headers["dlt-exception-message"], "pool timed out");
        assert_eq!(headers["dlt-attempts"], "6");
        assert_eq!(headers["dlt-transaction-id"], "T1");
        assert!(headers["dlt-first-failed-at"].starts_with("2025-01-01T00:00:00"));
    }

    #[test]
    fn unreadable_letters_have_no_transaction_header() {
        let headers = header_map(&dead_letter_headers(&letter(None)));
        assert!(!headers.contains_key("dlt-transaction-id"));
        assert_eq!(headers.len(), 7);
    }

    #[test]
    fn producer_build_requires_brokers() {
        let err = RedpandaProducer::builder().build().unwrap_err();
        assert!(matches!(err, RedpandaError::NotConfigured("brokers")));
    }

    #[test]
    fn topics_route_by_suffix_and_kind() {
        // librdkafka creates the client without contacting the broker.
        let producer = RedpandaProducer::new("localhost:9092").unwrap();

        let sink = producer.dead_letter_sink();
        assert_eq!(sink.topic_for("OrderRejected"), "OrderRejected.DLT");
        let sink = sink.with_suffix("-dlq");
        assert_eq!(sink.topic_for("OrderRejected"), "OrderRejected-dlq");

        let publisher = producer
            .lifecycle_publisher()
            .with_topic(ChangeKind::Resolved, "exception-resolved");
        assert_eq!(publisher.topic_for(ChangeKind::Captured), "ExceptionCaptured");
        assert_eq!(publisher.topic_for(ChangeKind::Resolved), "exception-resolved");
        assert_eq!(publisher.name(), "kafka");
    }
}
