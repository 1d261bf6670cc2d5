//! Best-effort fan-out of lifecycle change events.
//!
//! Persistence is the transactional boundary; everything here happens after
//! it. [`FanoutPublisher::publish`] never blocks the caller:
//!
//! - in-process subscribers get the event through the [`SubscriptionHub`]
//!   before `publish` returns, and
//! - every configured external [`LifecyclePublisher`] gets it from a spawned
//!   task, bounded by the delivery SLA.
//!
//! Each external publisher sees events in `publish` order: a delivery waits
//! for the previous one to the same publisher to finish or time out.
//!
//! No failure on this path ever reaches the mutation that triggered it.

use crate::metrics::FanoutMetrics;
use async_stream::stream;
use exception_collector_core::events::ChangeEvent;
use exception_collector_core::publisher::LifecyclePublisher;
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::Stream;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Default delivery SLA.
pub const DEFAULT_SLA: Duration = Duration::from_secs(2);

type Predicate = Arc<dyn Fn(&ChangeEvent) -> bool + Send + Sync>;

type Delivery = Shared<BoxFuture<'static, ()>>;

/// In-process publish/subscribe for change events.
///
/// Backed by a Tokio broadcast channel. Subscribers that fall behind by
/// more than the channel capacity skip the missed events.
#[derive(Clone, Debug)]
pub struct SubscriptionHub {
    sender: broadcast::Sender<Arc<ChangeEvent>>,
}

impl SubscriptionHub {
    /// Create a hub buffering up to `capacity` events per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to events matching `predicate`.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let mut critical = hub.subscribe(|e| e.exception.severity == ExceptionSeverity::Critical);
    /// while let Some(event) = critical.recv().await {
    ///     page_on_call(&event);
    /// }
    /// ```
    pub fn subscribe<F>(&self, predicate: F) -> Subscription
    where
        F: Fn(&ChangeEvent) -> bool + Send + Sync + 'static,
    {
        Subscription {
            receiver: self.sender.subscribe(),
            predicate: Arc::new(predicate),
        }
    }

    /// Subscribe to every event.
    #[must_use]
    pub fn subscribe_all(&self) -> Subscription {
        self.subscribe(|_| true)
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Hand `event` to every live subscription; returns how many received it.
    ///
    /// Having no subscribers is not an error.
    pub fn broadcast(&self, event: Arc<ChangeEvent>) -> usize {
        self.sender.send(event).unwrap_or(0)
    }
}

impl Default for SubscriptionHub {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// A filtered view onto the hub.
pub struct Subscription {
    receiver: broadcast::Receiver<Arc<ChangeEvent>>,
    predicate: Predicate,
}

impl Subscription {
    /// Next matching event, or `None` once the hub is gone.
    pub async fn recv(&mut self) -> Option<Arc<ChangeEvent>> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if (self.predicate)(&event) => return Some(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Subscriber lagged, {} events skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Turn the subscription into a stream of matching events.
    pub fn into_stream(mut self) -> impl Stream<Item = Arc<ChangeEvent>> + Send {
        stream! {
            while let Some(event) = self.recv().await {
                yield event;
            }
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

/// One external publisher and the tail of its delivery queue.
struct Lane {
    publisher: Arc<dyn LifecyclePublisher>,
    tail: Mutex<Option<Delivery>>,
}

impl Lane {
    fn new(publisher: Arc<dyn LifecyclePublisher>) -> Self {
        Self {
            publisher,
            tail: Mutex::new(None),
        }
    }

    /// Queue `event` behind the previous delivery on this lane.
    fn enqueue(&self, event: Arc<ChangeEvent>, started: Instant, sla: Duration) -> Delivery {
        let mut tail = self.tail.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = tail.take();
        let publisher = Arc::clone(&self.publisher);

        let delivery = async move {
            if let Some(previous) = previous {
                previous.await;
            }
            deliver_one(publisher.as_ref(), event, started, sla).await;
        }
        .boxed()
        .shared();

        tokio::spawn(delivery.clone());
        *tail = Some(delivery.clone());
        delivery
    }
}

/// Delivers change events after persistence.
///
/// Cheap to clone; clones share the hub and the per-publisher queues.
#[derive(Clone)]
pub struct FanoutPublisher {
    hub: SubscriptionHub,
    lanes: Arc<Vec<Arc<Lane>>>,
    sla: Duration,
}

impl FanoutPublisher {
    /// Create a publisher around `hub` with no external publishers.
    #[must_use]
    pub fn new(hub: SubscriptionHub) -> Self {
        Self {
            hub,
            lanes: Arc::new(Vec::new()),
            sla: DEFAULT_SLA,
        }
    }

    /// Add an external publisher.
    #[must_use]
    pub fn with_publisher(mut self, publisher: Arc<dyn LifecyclePublisher>) -> Self {
        Arc::make_mut(&mut self.lanes).push(Arc::new(Lane::new(publisher)));
        self
    }

    /// Override the delivery SLA.
    #[must_use]
    pub const fn with_sla(mut self, sla: Duration) -> Self {
        self.sla = sla;
        self
    }

    /// The in-process hub.
    #[must_use]
    pub const fn hub(&self) -> &SubscriptionHub {
        &self.hub
    }

    /// Configured SLA.
    #[must_use]
    pub const fn sla(&self) -> Duration {
        self.sla
    }

    /// Deliver `event`; never fails and never blocks the caller.
    ///
    /// Subscribers have it once this returns. The returned handle completes
    /// once every external publisher has finished, failed or timed out.
    /// Callers normally drop it.
    pub fn publish(&self, event: ChangeEvent) -> JoinHandle<()> {
        let started = Instant::now();
        let event = Arc::new(event);

        let receivers = self.hub.broadcast(Arc::clone(&event));
        tracing::debug!(
            transaction_id = %event.transaction_id(),
            event_type = event.kind.event_type(),
            receivers,
            "Change event broadcast"
        );

        let deliveries: Vec<Delivery> = self
            .lanes
            .iter()
            .map(|lane| lane.enqueue(Arc::clone(&event), started, self.sla))
            .collect();
        tokio::spawn(async move {
            futures::future::join_all(deliveries).await;
        })
    }
}

async fn deliver_one(
    publisher: &dyn LifecyclePublisher,
    event: Arc<ChangeEvent>,
    started: Instant,
    sla: Duration,
) {
    let name = publisher.name();
    let transaction_id = event.transaction_id().clone();
    let event_type = event.kind.event_type();
    let remaining = sla.saturating_sub(started.elapsed());

    match tokio::time::timeout(remaining, publisher.publish(event)).await {
        Ok(Ok(())) => {
            let latency = started.elapsed();
            FanoutMetrics::record_published(name, latency);
            if latency > sla {
                FanoutMetrics::record_sla_breach(name);
                tracing::warn!(
                    publisher = name,
                    %transaction_id,
                    event_type,
                    latency_ms = latency.as_millis(),
                    "Fan-out delivery exceeded SLA"
                );
            }
        }
        Ok(Err(error)) => {
            FanoutMetrics::record_failure(name);
            tracing::warn!(
                publisher = name,
                %transaction_id,
                event_type,
                %error,
                "Fan-out delivery failed"
            );
        }
        Err(_) => {
            FanoutMetrics::record_failure(name);
            FanoutMetrics::record_sla_breach(name);
            tracing::warn!(
                publisher = name,
                %transaction_id,
                event_type,
                sla_ms = sla.as_millis(),
                "Fan-out delivery abandoned after SLA"
            );
        }
    }
}

impl std::fmt::Debug for FanoutPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutPublisher")
            .field(
                "publishers",
                &self.lanes.iter().map(|lane| lane.publisher.name()).collect::<Vec<_>>(),
            )
            .field("sla", &self.sla)
            .finish_non_exhaustive()
    }
}

impl Default for FanoutPublisher {
    fn default() -> Self {
        Self::new(SubscriptionHub::default())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use exception_collector_core::events::ChangeKind;
    use exception_collector_core::exception::ExceptionSeverity;
    use exception_collector_testing::{RecordingPublisher, fixtures, test_epoch};
    use futures::StreamExt;

    fn captured(tx: &str) -> ChangeEvent {
        ChangeEvent::captured(fixtures::exception(tx), test_epoch())
    }

    #[tokio::test]
    async fn subscribers_receive_matching_events() {
        let hub = SubscriptionHub::new(16);
        let mut only_t2 = hub.subscribe(|e| e.transaction_id().as_str() == "T2");
        let mut all = hub.subscribe_all();
        let fanout = FanoutPublisher::new(hub.clone());

        fanout.publish(captured("T1")).await.unwrap();
        fanout.publish(captured("T2")).await.unwrap();

        assert_eq!(all.recv().await.unwrap().transaction_id().as_str(), "T1");
        assert_eq!(all.recv().await.unwrap().transaction_id().as_str(), "T2");
        assert_eq!(only_t2.recv().await.unwrap().transaction_id().as_str(), "T2");
    }

    #[tokio::test]
    async fn no_subscribers_is_fine() {
        let fanout = FanoutPublisher::default();
        assert_eq!(fanout.hub().subscriber_count(), 0);
        fanout.publish(captured("T1")).await.unwrap();
    }

    #[tokio::test]
    async fn external_publishers_receive_events() {
        let recorder = RecordingPublisher::new();
        let fanout = FanoutPublisher::default().with_publisher(Arc::new(recorder.clone()));

        fanout.publish(captured("T1")).await.unwrap();
        assert_eq!(recorder.kinds(), vec![ChangeKind::Captured]);
    }

    #[tokio::test]
    async fn failing_publisher_does_not_stop_others() {
        let broken = RecordingPublisher::new();
        broken.set_failing(true);
        let healthy = RecordingPublisher::new();
        let fanout = FanoutPublisher::default()
            .with_publisher(Arc::new(broken.clone()))
            .with_publisher(Arc::new(healthy.clone()));

        fanout.publish(captured("T1")).await.unwrap();
        assert!(broken.events().is_empty());
        assert_eq!(healthy.events().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_publisher_is_abandoned_at_sla() {
        let slow = RecordingPublisher::with_delay(Duration::from_secs(5));
        let fanout = FanoutPublisher::default()
            .with_publisher(Arc::new(slow.clone()))
            .with_sla(Duration::from_secs(2));

        let started = Instant::now();
        fanout.publish(captured("T1")).await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_secs(2));
        assert!(slow.events().is_empty());
    }

    #[tokio::test]
    async fn subscription_stream_yields_filtered_events() {
        let hub = SubscriptionHub::new(16);
        let stream = hub
            .subscribe(|e| e.exception.severity >= ExceptionSeverity::High)
            .into_stream();
        let fanout = FanoutPublisher::new(hub.clone());

        let mut low = fixtures::exception("T-low");
        low.severity = ExceptionSeverity::Low;
        fanout.publish(ChangeEvent::captured(low, test_epoch())).await.unwrap();
        fanout.publish(captured("T-high")).await.unwrap();
        drop(fanout);
        drop(hub);

        let received: Vec<_> = stream
            .map(|e| e.transaction_id().as_str().to_string())
            .collect()
            .await;
        assert_eq!(received, vec!["T-high".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn lifecycle_events_keep_their_order() {
        let recorder = RecordingPublisher::new();
        let hub = SubscriptionHub::new(2048);
        let mut subscriber = hub.subscribe_all();
        let fanout = FanoutPublisher::new(hub).with_publisher(Arc::new(recorder.clone()));

        let mut last = None;
        for i in 0..300 {
            let exception = fixtures::exception(&format!("T{i}"));
            fanout.publish(ChangeEvent::captured(exception.clone(), test_epoch()));
            fanout.publish(ChangeEvent::acknowledged(exception.clone(), test_epoch()));
            last = Some(fanout.publish(ChangeEvent::resolved(exception, test_epoch())));
        }
        last.unwrap().await.unwrap();

        let expected: Vec<_> = (0..300)
            .flat_map(|i| {
                let tx = format!("T{i}");
                [
                    (tx.clone(), ChangeKind::Captured),
                    (tx.clone(), ChangeKind::Acknowledged),
                    (tx, ChangeKind::Resolved),
                ]
            })
            .collect();
        let delivered: Vec<_> = recorder
            .events()
            .iter()
            .map(|e| (e.transaction_id().as_str().to_string(), e.kind))
            .collect();
        assert_eq!(delivered, expected);

        for (tx, kind) in &expected {
            let event = subscriber.recv().await.unwrap();
            assert_eq!((event.transaction_id().as_str(), event.kind), (tx.as_str(), *kind));
        }
    }

    #[tokio::test]
    async fn subscribers_have_the_event_when_publish_returns() {
        let hub = SubscriptionHub::new(16);
        let mut all = hub.subscribe_all();
        let fanout = FanoutPublisher::new(hub)
            .with_publisher(Arc::new(RecordingPublisher::with_delay(Duration::from_secs(60))));

        drop(fanout.publish(captured("T1")));
        let event = all.receiver.try_recv().unwrap();
        assert_eq!(event.transaction_id().as_str(), "T1");
    }
}
