//! Redpanda adapters for the interface exception collector.
//!
//! The collector talks to the broker in three places, each built on rdkafka
//! (Kafka protocol, so Redpanda, Apache Kafka or MSK all work):
//!
//! - [`RedpandaConsumer`]: pulls failure events from the inbound topics and
//!   feeds them to a [`PartitionDispatcher`]. Auto-commit is off; the
//!   [`OffsetCommitter`] commits an offset only after ingestion has handled
//!   the message durably.
//! - [`KafkaDeadLetterSink`]: writes exhausted messages to `<topic>.DLT`
//!   with the failure metadata in headers.
//! - [`KafkaLifecyclePublisher`]: publishes lifecycle change envelopes keyed
//!   by transaction id.
//!
//! # Delivery Semantics
//!
//! **At-least-once** on the inbound side:
//! - An offset is committed after the message was persisted, recognized as a
//!   duplicate, dropped as malformed, or dead-lettered
//! - A crash before the commit means redelivery, which ingestion absorbs
//!   through its idempotent insert
//! - Messages of one partition are handled in order
//!
//! # Example
//!
//! ```no_run
//! use exception_collector_redpanda::{RedpandaConsumer, RedpandaProducer};
//! use exception_collector_runtime::{IngestionConsumer, PartitionDispatcher};
//! use std::sync::Arc;
//!
//! # async fn example(ingestion: IngestionConsumer) -> Result<(), Box<dyn std::error::Error>> {
//! let producer = RedpandaProducer::new("localhost:9092")?;
//! let dead_letters = Arc::new(producer.dead_letter_sink());
//!
//! let consumer = RedpandaConsumer::builder()
//!     .brokers("localhost:9092")
//!     .topics(["OrderRejected", "DistributionFailed"])
//!     .build()?;
//!
//! let mut dispatcher = PartitionDispatcher::new(ingestion, consumer.committer());
//! consumer.run(&mut dispatcher, async {
//!     let _ = tokio::signal::ctrl_c().await;
//! }).await?;
//! # Ok(())
//! # }
//! ```
//!
//! [`PartitionDispatcher`]: exception_collector_runtime::PartitionDispatcher

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod consumer;
pub mod producer;

use thiserror::Error;

pub use consumer::{OffsetCommitter, RedpandaConsumer, RedpandaConsumerBuilder, inbound_from};
pub use producer::{
    DEFAULT_DEAD_LETTER_SUFFIX, KafkaDeadLetterSink, KafkaLifecyclePublisher, RedpandaProducer,
    RedpandaProducerBuilder, dead_letter_headers,
};

/// Errors creating or running a broker client.
#[derive(Error, Debug)]
pub enum RedpandaError {
    /// A required builder field was not set.
    #[error("{0} not configured")]
    NotConfigured(&'static str),

    /// The client could not be created.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Subscribing to the inbound topics failed.
    #[error("Subscription to {topics:?} failed: {reason}")]
    SubscriptionFailed {
        /// Requested topics.
        topics: Vec<String>,
        /// Broker message.
        reason: String,
    },

    /// The dispatcher refused a message.
    #[error(transparent)]
    Dispatch(#[from] exception_collector_runtime::DispatchError),
}
