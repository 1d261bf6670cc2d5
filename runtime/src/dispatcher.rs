//! One sequential ingestion worker per broker partition.
//!
//! Messages of a `(topic, partition)` are handled strictly in delivery
//! order by a dedicated task; different partitions run concurrently. Each
//! worker owns a bounded queue, so a slow store pushes back on the broker
//! loop through [`PartitionDispatcher::dispatch`].
//!
//! A [`Disposition::Stalled`] message is retried by its worker after the
//! policy's `max_delay`, holding back the rest of that partition until it is
//! written somewhere durable.

use crate::error::DispatchError;
use crate::ingestion::{Disposition, IngestionConsumer};
use exception_collector_core::message::{Acknowledgment, InboundMessage};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Default per-partition queue depth.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

struct Worker {
    sender: mpsc::Sender<InboundMessage>,
    handle: JoinHandle<()>,
}

/// Routes inbound messages to per-partition workers.
///
/// # Example
///
/// ```rust,ignore
/// let mut dispatcher = PartitionDispatcher::new(consumer, Arc::new(committer));
/// while let Some(message) = source.next().await {
///     dispatcher.dispatch(message).await?;
/// }
/// dispatcher.shutdown(Duration::from_secs(30)).await?;
/// ```
pub struct PartitionDispatcher {
    consumer: IngestionConsumer,
    ack: Arc<dyn Acknowledgment>,
    capacity: usize,
    workers: HashMap<(String, i32), Worker>,
    stop: watch::Sender<bool>,
}

impl PartitionDispatcher {
    /// Create a dispatcher acknowledging through `ack`.
    #[must_use]
    pub fn new(consumer: IngestionConsumer, ack: Arc<dyn Acknowledgment>) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            consumer,
            ack,
            capacity: DEFAULT_QUEUE_CAPACITY,
            workers: HashMap::new(),
            stop,
        }
    }

    /// Override the per-partition queue depth.
    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Number of partitions with a live worker.
    #[must_use]
    pub fn active_partitions(&self) -> usize {
        self.workers.len()
    }

    /// Queue `message` on its partition's worker, spawning the worker on
    /// first use. Waits while that queue is full.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::ShutdownInProgress`] after [`shutdown`](Self::shutdown) began
    /// - [`DispatchError::WorkerGone`] if the partition worker has exited
    pub async fn dispatch(&mut self, message: InboundMessage) -> Result<(), DispatchError> {
        if *self.stop.borrow() {
            return Err(DispatchError::ShutdownInProgress);
        }

        let key = (message.topic.clone(), message.partition);
        if !self.workers.contains_key(&key) {
            let worker = self.spawn_worker(&key.0, key.1);
            self.workers.insert(key.clone(), worker);
        }

        let Some(worker) = self.workers.get(&key) else {
            return Err(DispatchError::WorkerGone {
                topic: key.0,
                partition: key.1,
            });
        };
        if worker.sender.send(message).await.is_err() {
            self.workers.remove(&key);
            return Err(DispatchError::WorkerGone {
                topic: key.0,
                partition: key.1,
            });
        }
        Ok(())
    }

    /// Stop a partition's worker after it drains its queue, e.g. when the
    /// broker revokes the partition.
    pub async fn release(&mut self, topic: &str, partition: i32) {
        if let Some(worker) = self.workers.remove(&(topic.to_string(), partition)) {
            drop(worker.sender);
            if let Err(error) = worker.handle.await {
                tracing::error!(topic, partition, %error, "Partition worker failed");
            }
            tracing::info!(topic, partition, "Partition released");
        }
    }

    /// Drain every queue and wait for the workers to finish.
    ///
    /// Stalled messages are abandoned unacknowledged so the broker
    /// redelivers them after restart.
    ///
    /// # Errors
    ///
    /// [`DispatchError::ShutdownTimeout`] if workers are still running when
    /// `timeout` expires.
    pub async fn shutdown(&mut self, timeout: Duration) -> Result<(), DispatchError> {
        tracing::info!(workers = self.workers.len(), "Initiating dispatcher shutdown");
        self.stop.send_replace(true);

        let handles: Vec<_> = self
            .workers
            .drain()
            .map(|(_, worker)| {
                drop(worker.sender);
                worker.handle
            })
            .collect();
        let total = handles.len();

        let drained = tokio::time::timeout(timeout, async {
            for handle in handles {
                if let Err(error) = handle.await {
                    tracing::error!(%error, "Partition worker failed");
                }
            }
        })
        .await;

        if drained.is_err() {
            tracing::error!(workers = total, "Dispatcher shutdown timed out");
            return Err(DispatchError::ShutdownTimeout(total));
        }
        tracing::info!("Dispatcher shutdown complete");
        Ok(())
    }

    fn spawn_worker(&self, topic: &str, partition: i32) -> Worker {
        let (sender, mut receiver) = mpsc::channel::<InboundMessage>(self.capacity);
        let consumer = self.consumer.clone();
        let ack = Arc::clone(&self.ack);
        let mut stop = self.stop.subscribe();
        let topic = topic.to_string();

        let handle = tokio::spawn(async move {
            tracing::info!(%topic, partition, "Partition worker started");
            'messages: while let Some(message) = receiver.recv().await {
                loop {
                    let disposition = consumer.handle(&message, ack.as_ref()).await;
                    let Disposition::Stalled(reason) = disposition else {
                        continue 'messages;
                    };
                    let pause = consumer.policy().max_delay;
                    tracing::warn!(
                        %topic,
                        partition,
                        offset = message.offset,
                        %reason,
                        pause_ms = pause.as_millis(),
                        "Partition stalled on dead-letter failure"
                    );
                    tokio::select! {
                        _ = stop.wait_for(|stopped| *stopped) => break 'messages,
                        () = tokio::time::sleep(pause) => {}
                    }
                }
            }
            tracing::info!(%topic, partition, "Partition worker stopped");
        });

        Worker { sender, handle }
    }
}

impl std::fmt::Debug for PartitionDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionDispatcher")
            .field("capacity", &self.capacity)
            .field("partitions", &self.workers.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
