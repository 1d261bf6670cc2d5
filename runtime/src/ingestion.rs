//! Inbound failure event ingestion.
//!
//! [`IngestionConsumer::handle`] owns the whole life of one broker message:
//!
//! 1. Decode and normalize. Malformed events are acknowledged and dropped.
//! 2. Insert-if-absent keyed by transaction id. Duplicates are acknowledged
//!    without a state change, apart from filling in a missing enrichment
//!    snapshot.
//! 3. Acknowledge only after the write is durable.
//! 4. On any other failure, redeliver under the [`BackoffPolicy`]; once the
//!    policy is exhausted, write a [`DeadLetter`] and acknowledge. If even
//!    the dead-letter write fails the message stays unacknowledged.
//!
//! New exceptions are handed to the [`FanoutPublisher`] as `Captured`.

use crate::backoff::{BackoffPolicy, retry_with_backoff};
use crate::error::BuildError;
use crate::fanout::FanoutPublisher;
use crate::metrics::{IngestionMetrics, LifecycleMetrics};
use chrono::{DateTime, Utc};
use exception_collector_core::dead_letter::{DeadLetter, DeadLetterSink};
use exception_collector_core::environment::{Clock, SystemClock};
use exception_collector_core::error::CollectorError;
use exception_collector_core::events::ChangeEvent;
use exception_collector_core::exception::InterfaceException;
use exception_collector_core::ids::TransactionId;
use exception_collector_core::inbound::{InboundEvent, MalformedEventError, normalize};
use exception_collector_core::lifecycle::{self, ActionKind};
use exception_collector_core::message::{Acknowledgment, InboundMessage};
use exception_collector_core::store::{ExceptionStore, InsertOutcome};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Successful processing of one inbound event.
#[derive(Debug, Clone, PartialEq)]
pub enum Processed {
    /// A new exception was stored.
    Captured(InterfaceException),
    /// The transaction id was already known.
    Duplicate(InterfaceException),
}

impl Processed {
    /// The stored exception.
    #[must_use]
    pub const fn exception(&self) -> &InterfaceException {
        match self {
            Self::Captured(exception) | Self::Duplicate(exception) => exception,
        }
    }
}

/// Final fate of one broker message.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// Stored as a new exception; acknowledged.
    Captured(InterfaceException),
    /// Already stored; acknowledged.
    Duplicate(InterfaceException),
    /// Malformed; acknowledged and dropped.
    Dropped(MalformedEventError),
    /// Redeliveries exhausted; written to the dead-letter sink and
    /// acknowledged.
    DeadLettered {
        /// Processing attempts made, including the first.
        attempts: u32,
        /// Last processing error.
        error: String,
    },
    /// Dead-letter sink unavailable; **not** acknowledged.
    Stalled(String),
}

impl Disposition {
    /// Whether the message was acknowledged.
    #[must_use]
    pub const fn is_acknowledged(&self) -> bool {
        !matches!(self, Self::Stalled(_))
    }
}

/// Turns inbound broker messages into stored exceptions.
///
/// Cheap to clone; clones share every collaborator.
#[derive(Clone)]
pub struct IngestionConsumer {
    store: Arc<dyn ExceptionStore>,
    dead_letters: Arc<dyn DeadLetterSink>,
    fanout: Option<FanoutPublisher>,
    clock: Arc<dyn Clock>,
    policy: BackoffPolicy,
}

impl IngestionConsumer {
    /// Create a builder.
    #[must_use]
    pub fn builder() -> IngestionConsumerBuilder {
        IngestionConsumerBuilder::default()
    }

    /// The redelivery policy.
    #[must_use]
    pub const fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Process one message to its final disposition and acknowledge it
    /// unless stalled.
    ///
    /// Never fails: every error is mapped onto a [`Disposition`].
    pub async fn handle(&self, message: &InboundMessage, ack: &dyn Acknowledgment) -> Disposition {
        let mut attempt: u32 = 0;
        let mut first_failed_at: Option<DateTime<Utc>> = None;

        let disposition = loop {
            match self.process(message).await {
                Ok(Processed::Captured(exception)) => break Disposition::Captured(exception),
                Ok(Processed::Duplicate(exception)) => break Disposition::Duplicate(exception),
                Err(CollectorError::Malformed(reason)) => {
                    IngestionMetrics::record_malformed();
                    warn!(
                        topic = %message.topic,
                        partition = message.partition,
                        offset = message.offset,
                        %reason,
                        "Dropping malformed event"
                    );
                    break Disposition::Dropped(reason);
                }
                Err(error) => {
                    let failed_at = self.clock.now();
                    let first = *first_failed_at.get_or_insert(failed_at);

                    if attempt >= self.policy.max_attempts {
                        break self
                            .dead_letter(message, &error, attempt + 1, first, failed_at)
                            .await;
                    }

                    attempt += 1;
                    let delay = self.policy.delay_for_attempt(attempt);
                    IngestionMetrics::record_redelivery();
                    warn!(
                        topic = %message.topic,
                        partition = message.partition,
                        offset = message.offset,
                        attempt,
                        delay_ms = delay.as_millis(),
                        %error,
                        "Processing failed, redelivering"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        };

        if disposition.is_acknowledged() {
            if let Err(error) = ack.acknowledge(message) {
                error!(%error, "Failed to acknowledge message");
            }
        }
        disposition
    }

    /// Process one message once, without redelivery.
    ///
    /// # Errors
    ///
    /// - [`CollectorError::Malformed`] for an empty, undecodable or invalid event
    /// - [`CollectorError::TransientProcessing`] when the store fails
    pub async fn process(&self, message: &InboundMessage) -> Result<Processed, CollectorError> {
        let body = message
            .payload
            .as_deref()
            .ok_or_else(|| MalformedEventError::InvalidEnvelope("message has no body".to_string()))?;
        let event = InboundEvent::from_slice(body)?;
        self.ingest_event(&event).await
    }

    /// Normalize and store one decoded event.
    ///
    /// # Errors
    ///
    /// - [`CollectorError::Malformed`] when normalization fails
    /// - [`CollectorError::TransientProcessing`] when the store fails
    pub async fn ingest_event(&self, event: &InboundEvent) -> Result<Processed, CollectorError> {
        let now = self.clock.now();
        let candidate = lifecycle::ingest(normalize(event, now)?);
        let enrichment = candidate.enrichment.clone();

        match self.store.insert_if_absent(candidate).await? {
            InsertOutcome::Inserted(stored) => {
                IngestionMetrics::record_ingested();
                LifecycleMetrics::record_transition(ActionKind::Ingest);
                info!(
                    transaction_id = %stored.transaction_id,
                    interface_type = %stored.interface_type,
                    severity = %stored.severity,
                    retryable = stored.retryable,
                    "Exception captured"
                );
                if let Some(fanout) = &self.fanout {
                    fanout.publish(ChangeEvent::captured(stored.clone(), now));
                }
                Ok(Processed::Captured(stored))
            }
            InsertOutcome::Duplicate(existing) => {
                IngestionMetrics::record_duplicate();
                debug!(
                    transaction_id = %existing.transaction_id,
                    status = %existing.status,
                    "Duplicate delivery"
                );
                Ok(Processed::Duplicate(
                    self.fill_enrichment(existing, enrichment).await,
                ))
            }
        }
    }

    /// Attach an enrichment snapshot to a record that has none.
    ///
    /// Best effort: a lost race or a store error leaves the record as it was.
    async fn fill_enrichment(
        &self,
        existing: InterfaceException,
        enrichment: Option<Value>,
    ) -> InterfaceException {
        let (None, Some(enrichment)) = (&existing.enrichment, enrichment) else {
            return existing;
        };

        let mut enriched = existing.clone();
        enriched.enrichment = Some(enrichment);
        match self.store.update(enriched, existing.version).await {
            Ok(stored) => {
                debug!(transaction_id = %stored.transaction_id, "Enrichment filled from redelivery");
                stored
            }
            Err(error) => {
                debug!(
                    transaction_id = %existing.transaction_id,
                    %error,
                    "Enrichment update skipped"
                );
                existing
            }
        }
    }

    async fn dead_letter(
        &self,
        message: &InboundMessage,
        error: &CollectorError,
        attempts: u32,
        first_failed_at: DateTime<Utc>,
        last_failed_at: DateTime<Utc>,
    ) -> Disposition {
        let letter = DeadLetter {
            topic: message.topic.clone(),
            partition: message.partition,
            offset: message.offset,
            key: message.key.clone(),
            payload: message.payload.clone().unwrap_or_default(),
            transaction_id: message
                .payload
                .as_deref()
                .and_then(|body| InboundEvent::from_slice(body).ok())
                .and_then(|event| event.transaction_id())
                .map(TransactionId::into_inner),
            error: error.to_string(),
            attempts,
            first_failed_at,
            last_failed_at,
        };

        match retry_with_backoff(&self.policy, || self.dead_letters.send(letter.clone())).await {
            Ok(()) => {
                IngestionMetrics::record_dead_lettered();
                error!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    transaction_id = ?letter.transaction_id,
                    attempts,
                    %error,
                    "Redeliveries exhausted, message dead-lettered"
                );
                Disposition::DeadLettered {
                    attempts,
                    error: error.to_string(),
                }
            }
            Err(sink_error) => {
                error!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    %error,
                    %sink_error,
                    "Dead-letter write failed, leaving message unacknowledged"
                );
                Disposition::Stalled(sink_error.to_string())
            }
        }
    }
}

impl std::fmt::Debug for IngestionConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionConsumer")
            .field("policy", &self.policy)
            .field("fanout", &self.fanout)
            .finish_non_exhaustive()
    }
}

/// Builder for [`IngestionConsumer`].
#[derive(Default)]
pub struct IngestionConsumerBuilder {
    store: Option<Arc<dyn ExceptionStore>>,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
    fanout: Option<FanoutPublisher>,
    clock: Option<Arc<dyn Clock>>,
    policy: Option<BackoffPolicy>,
}

impl IngestionConsumerBuilder {
    /// Set the exception store (required).
    #[must_use]
    pub fn store(mut self, store: Arc<dyn ExceptionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the dead-letter sink (required).
    #[must_use]
    pub fn dead_letters(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = Some(sink);
        self
    }

    /// Publish `Captured` events through `fanout`.
    #[must_use]
    pub fn fanout(mut self, fanout: FanoutPublisher) -> Self {
        self.fanout = Some(fanout);
        self
    }

    /// Set the clock (default: system clock).
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Set the redelivery policy (default: [`BackoffPolicy::default`]).
    #[must_use]
    pub fn policy(mut self, policy: BackoffPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Build the consumer.
    ///
    /// # Errors
    ///
    /// [`BuildError::Missing`] if the store or dead-letter sink is not set.
    pub fn build(self) -> Result<IngestionConsumer, BuildError> {
        Ok(IngestionConsumer {
            store: self.store.ok_or(BuildError::Missing("store"))?,
            dead_letters: self.dead_letters.ok_or(BuildError::Missing("dead_letters"))?,
            fanout: self.fanout,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            policy: self.policy.unwrap_or_default(),
        })
    }
}
