//! Event consumer loop.
//!
//! Every [`EventConsumer::subscribe`] call binds its own exclusive queue and
//! drives it from a dedicated task. Deliveries are settled one at a time:
//!
//! 1. A body that does not decode is dead-lettered and acknowledged.
//! 2. The handler runs under a timeout; failures are retried in place after a
//!    fixed delay, so later deliveries never overtake an earlier one.
//! 3. Success is acknowledged. Exhausted attempts are dead-lettered and the
//!    delivery is rejected without requeue.
//!
//! A delivery stream that ends on its own means the broker dropped the queue.
//! The task then stops with an error that [`SubscriptionHandle::finished`]
//! reports, and the client is marked disconnected.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use futures::stream::BoxStream;
use metrics::{counter, gauge, histogram};
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::client::BrokerClient;
use super::dead_letter::{DeadLetterEntry, DeadLetterLog, DeadLetterReason};
use super::transport::{BrokerError, Delivery};
use crate::application::error::HandlerError;

const METRIC_EVENTS_ACKED: &str = "ripple_events_acked_total";
const METRIC_EVENTS_POISON: &str = "ripple_events_poison_total";
const METRIC_EVENT_HANDLE_MS: &str = "ripple_event_handle_ms";
const METRIC_SUBSCRIPTIONS_ACTIVE: &str = "ripple_subscriptions_active";

/// Reacts to one decoded event type.
///
/// Deliveries are at-least-once, so `handle` must be safe to repeat.
#[async_trait]
pub trait EventHandler<E>: Send + Sync + 'static {
    /// Stable name for logs and metrics.
    fn name(&self) -> &'static str;

    async fn handle(&self, event: &E) -> Result<(), HandlerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryPolicy {
    pub handler_timeout: Duration,
    /// Handler invocations per delivery, including the first.
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            handler_timeout: Duration::from_secs(30),
            max_attempts: 3,
            retry_delay: Duration::from_millis(1000),
        }
    }
}

#[derive(Clone)]
pub struct EventConsumer {
    client: Arc<BrokerClient>,
    policy: DeliveryPolicy,
    dead_letters: Arc<DeadLetterLog>,
}

impl EventConsumer {
    pub fn new(
        client: Arc<BrokerClient>,
        policy: DeliveryPolicy,
        dead_letters: Arc<DeadLetterLog>,
    ) -> Self {
        Self {
            client,
            policy,
            dead_letters,
        }
    }

    pub fn dead_letters(&self) -> &Arc<DeadLetterLog> {
        &self.dead_letters
    }

    /// Bind a private queue to `routing_key` and start feeding `handler`.
    ///
    /// Returns after the queue is bound, so events published afterwards reach
    /// the handler.
    pub async fn subscribe<E, H>(
        &self,
        routing_key: &str,
        handler: Arc<H>,
    ) -> Result<SubscriptionHandle, BrokerError>
    where
        E: DeserializeOwned + Send + Sync + 'static,
        H: EventHandler<E> + ?Sized,
    {
        let channel = self.client.channel().await?;
        let subscription = channel
            .bind_exclusive_queue(self.client.exchange(), routing_key)
            .await?;
        let queue = subscription.queue.clone();

        info!(
            routing_key,
            queue = %queue,
            handler = handler.name(),
            "Subscription started"
        );

        let worker = Worker::<E, H> {
            client: Arc::clone(&self.client),
            queue: queue.clone(),
            handler,
            policy: self.policy,
            dead_letters: Arc::clone(&self.dead_letters),
            _event: PhantomData,
        };
        let task = tokio::spawn(worker.run(subscription.deliveries));

        Ok(SubscriptionHandle {
            routing_key: routing_key.to_string(),
            queue,
            task: Some(task),
        })
    }
}

/// Owns the task driving one subscription.
#[derive(Debug)]
pub struct SubscriptionHandle {
    routing_key: String,
    queue: String,
    // Taken once the task has been observed to stop.
    task: Option<JoinHandle<BrokerError>>,
}

impl SubscriptionHandle {
    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Resolves when the task stops without [`shutdown`](Self::shutdown)
    /// being called. Cancel-safe.
    pub async fn finished(&mut self) -> BrokerError {
        let Some(task) = self.task.as_mut() else {
            return std::future::pending().await;
        };
        let reason = match task.await {
            Ok(err) => err.to_string(),
            Err(join) => format!("consumer task failed: {join}"),
        };
        self.task = None;
        BrokerError::SubscriptionLost {
            routing_key: self.routing_key.clone(),
            reason,
        }
    }

    /// Stop consuming. A delivery being handled is abandoned unsettled and
    /// goes back to the broker with the queue.
    pub async fn shutdown(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
        info!(routing_key = %self.routing_key, queue = %self.queue, "Subscription stopped");
    }
}

/// Wait for the first of `subscriptions` to stop on its own. Never resolves
/// for an empty slice.
pub async fn first_lost(subscriptions: &mut [SubscriptionHandle]) -> BrokerError {
    let mut pending: FuturesUnordered<_> = subscriptions
        .iter_mut()
        .map(SubscriptionHandle::finished)
        .collect();
    match pending.next().await {
        Some(err) => err,
        None => std::future::pending().await,
    }
}

/// Keeps the active-subscription gauge balanced, including when the task is aborted.
struct ActiveSubscription;

impl ActiveSubscription {
    fn enter() -> Self {
        gauge!(METRIC_SUBSCRIPTIONS_ACTIVE).increment(1.0);
        Self
    }
}

impl Drop for ActiveSubscription {
    fn drop(&mut self) {
        gauge!(METRIC_SUBSCRIPTIONS_ACTIVE).decrement(1.0);
    }
}

struct Worker<E, H: ?Sized> {
    client: Arc<BrokerClient>,
    queue: String,
    handler: Arc<H>,
    policy: DeliveryPolicy,
    dead_letters: Arc<DeadLetterLog>,
    _event: PhantomData<fn() -> E>,
}

impl<E, H> Worker<E, H>
where
    E: DeserializeOwned + Send + Sync + 'static,
    H: EventHandler<E> + ?Sized,
{
    async fn run(
        self,
        mut deliveries: BoxStream<'static, Result<Delivery, BrokerError>>,
    ) -> BrokerError {
        let _active = ActiveSubscription::enter();
        let mut last_error = None;
        while let Some(item) = deliveries.next().await {
            match item {
                Ok(delivery) => self.process(delivery).await,
                Err(err) => {
                    warn!(queue = %self.queue, error = %err, "Delivery stream error");
                    last_error = Some(err);
                }
            }
        }
        error!(
            queue = %self.queue,
            handler = self.handler.name(),
            "Delivery stream ended unexpectedly"
        );
        self.client.mark_lost().await;
        last_error.unwrap_or(BrokerError::Closed)
    }

    async fn process(&self, delivery: Delivery) {
        let handler = self.handler.name();
        let event: E = match serde_json::from_slice(&delivery.body) {
            Ok(event) => event,
            Err(err) => {
                counter!(METRIC_EVENTS_POISON, "handler" => handler).increment(1);
                self.dead_letter(&delivery, DeadLetterReason::Poison, 0, err.to_string());
                self.settle(&delivery, delivery.ack().await, "ack");
                return;
            }
        };

        let started_at = Instant::now();
        let attempts = self.policy.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let outcome = timeout(self.policy.handler_timeout, self.handler.handle(&event)).await;
            match outcome {
                Ok(Ok(())) => {
                    histogram!(METRIC_EVENT_HANDLE_MS, "handler" => handler)
                        .record(started_at.elapsed().as_secs_f64() * 1000.0);
                    counter!(METRIC_EVENTS_ACKED, "handler" => handler).increment(1);
                    debug!(
                        queue = %self.queue,
                        routing_key = %delivery.routing_key,
                        handler,
                        attempt,
                        "Event handled"
                    );
                    self.settle(&delivery, delivery.ack().await, "ack");
                    return;
                }
                Ok(Err(err)) => last_error = err.to_string(),
                Err(_) => {
                    last_error = format!(
                        "handler timed out after {} ms",
                        self.policy.handler_timeout.as_millis()
                    );
                }
            }

            warn!(
                queue = %self.queue,
                routing_key = %delivery.routing_key,
                handler,
                attempt,
                remaining = attempts - attempt,
                error = %last_error,
                "Event handling failed"
            );
            if attempt < attempts {
                tokio::time::sleep(self.policy.retry_delay).await;
            }
        }

        histogram!(METRIC_EVENT_HANDLE_MS, "handler" => handler)
            .record(started_at.elapsed().as_secs_f64() * 1000.0);
        self.dead_letter(
            &delivery,
            DeadLetterReason::HandlerExhausted,
            attempts,
            last_error,
        );
        self.settle(&delivery, delivery.reject(false).await, "reject");
    }

    fn dead_letter(
        &self,
        delivery: &Delivery,
        reason: DeadLetterReason,
        attempts: u32,
        error: String,
    ) {
        self.dead_letters.record(DeadLetterEntry {
            queue: &self.queue,
            routing_key: &delivery.routing_key,
            body: &delivery.body,
            reason,
            attempts,
            error,
        });
    }

    fn settle(&self, delivery: &Delivery, result: Result<(), BrokerError>, op: &'static str) {
        if let Err(err) = result {
            warn!(
                queue = %self.queue,
                routing_key = %delivery.routing_key,
                op,
                error = %err,
                "Failed to settle delivery"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde::Deserialize;

    use super::*;
    use crate::broker::client::RetryPolicy;
    use crate::broker::memory::InMemoryBroker;
    use crate::broker::publisher::EventPublisher;

    #[derive(Debug, Deserialize)]
    struct Ping {
        n: u32,
    }

    /// Fails the first `failures` calls, then records every `n` it sees.
    struct Flaky {
        failures: AtomicU32,
        seen: std::sync::Mutex<Vec<u32>>,
        calls: AtomicU32,
    }

    impl Flaky {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures: AtomicU32::new(failures),
                seen: std::sync::Mutex::new(Vec::new()),
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl EventHandler<Ping> for Flaky {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn handle(&self, event: &Ping) -> Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
            if failing.is_ok() {
                return Err(HandlerError::failed("injected failure"));
            }
            self.seen.lock().expect("seen lock").push(event.n);
            Ok(())
        }
    }

    struct Stuck;

    #[async_trait]
    impl EventHandler<Ping> for Stuck {
        fn name(&self) -> &'static str {
            "stuck"
        }

        async fn handle(&self, _event: &Ping) -> Result<(), HandlerError> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    fn setup(broker: &InMemoryBroker) -> (EventConsumer, EventPublisher) {
        let client = Arc::new(BrokerClient::new(
            Arc::new(broker.clone()),
            "post_exchange",
            RetryPolicy {
                max_retries: 1,
                delay: Duration::ZERO,
            },
        ));
        let consumer = EventConsumer::new(
            Arc::clone(&client),
            DeliveryPolicy {
                handler_timeout: Duration::from_secs(1),
                max_attempts: 3,
                retry_delay: Duration::from_millis(10),
            },
            Arc::new(DeadLetterLog::default()),
        );
        (consumer, EventPublisher::new(client))
    }

    async fn wait_settled(broker: &InMemoryBroker, count: u64) {
        for _ in 0..2000 {
            if broker.settled() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("only {} of {count} deliveries settled", broker.settled());
    }

    #[tokio::test]
    async fn success_is_acknowledged_in_order() {
        let broker = InMemoryBroker::new();
        let (consumer, publisher) = setup(&broker);
        let handler = Flaky::new(0);
        let _sub = consumer
            .subscribe::<Ping, _>("ping.#", Arc::clone(&handler))
            .await
            .expect("subscribe");

        for n in 0..5 {
            publisher
                .publish("ping.sent", &serde_json::json!({ "n": n }))
                .await
                .expect("publish");
        }
        wait_settled(&broker, 5).await;

        assert_eq!(*handler.seen.lock().expect("seen lock"), vec![0, 1, 2, 3, 4]);
        assert_eq!(broker.acked(), 5);
        assert!(consumer.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn transient_failures_are_retried_in_place() {
        let broker = InMemoryBroker::new();
        let (consumer, publisher) = setup(&broker);
        let handler = Flaky::new(2);
        let _sub = consumer
            .subscribe::<Ping, _>("ping.sent", Arc::clone(&handler))
            .await
            .expect("subscribe");

        publisher
            .publish("ping.sent", &serde_json::json!({ "n": 1 }))
            .await
            .expect("publish");
        publisher
            .publish("ping.sent", &serde_json::json!({ "n": 2 }))
            .await
            .expect("publish");
        wait_settled(&broker, 2).await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 4);
        assert_eq!(*handler.seen.lock().expect("seen lock"), vec![1, 2]);
        assert_eq!(broker.acked(), 2);
    }

    #[tokio::test]
    async fn exhausted_attempts_are_dead_lettered_and_rejected() {
        let broker = InMemoryBroker::new();
        let (consumer, publisher) = setup(&broker);
        let handler = Flaky::new(u32::MAX);
        let _sub = consumer
            .subscribe::<Ping, _>("ping.sent", Arc::clone(&handler))
            .await
            .expect("subscribe");

        publisher
            .publish("ping.sent", &serde_json::json!({ "n": 1 }))
            .await
            .expect("publish");
        wait_settled(&broker, 1).await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(broker.rejected(), 1);
        assert_eq!(broker.acked(), 0);
        let letters = consumer.dead_letters().snapshot();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].reason, DeadLetterReason::HandlerExhausted);
        assert_eq!(letters[0].attempts, 3);
    }

    #[tokio::test]
    async fn poison_messages_are_acknowledged_and_dropped() {
        let broker = InMemoryBroker::new();
        let (consumer, publisher) = setup(&broker);
        let handler = Flaky::new(0);
        let _sub = consumer
            .subscribe::<Ping, _>("ping.sent", Arc::clone(&handler))
            .await
            .expect("subscribe");

        publisher
            .publish("ping.sent", &serde_json::json!({ "unexpected": true }))
            .await
            .expect("publish");
        publisher
            .publish("ping.sent", &serde_json::json!({ "n": 9 }))
            .await
            .expect("publish");
        wait_settled(&broker, 2).await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(broker.acked(), 2);
        let letters = consumer.dead_letters().snapshot();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].reason, DeadLetterReason::Poison);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_handler_times_out() {
        let broker = InMemoryBroker::new();
        let (consumer, publisher) = setup(&broker);
        let _sub = consumer
            .subscribe::<Ping, _>("ping.sent", Arc::new(Stuck))
            .await
            .expect("subscribe");

        publisher
            .publish("ping.sent", &serde_json::json!({ "n": 1 }))
            .await
            .expect("publish");
        wait_settled(&broker, 1).await;

        assert_eq!(broker.rejected(), 1);
        assert!(consumer.dead_letters().snapshot()[0].error.contains("timed out"));
    }

    #[tokio::test]
    async fn every_subscription_gets_its_own_queue() {
        let broker = InMemoryBroker::new();
        let (consumer, publisher) = setup(&broker);
        let first = Flaky::new(0);
        let second = Flaky::new(0);
        let a = consumer
            .subscribe::<Ping, _>("ping.sent", Arc::clone(&first))
            .await
            .expect("subscribe");
        let b = consumer
            .subscribe::<Ping, _>("ping.sent", Arc::clone(&second))
            .await
            .expect("subscribe");
        assert_ne!(a.queue(), b.queue());

        publisher
            .publish("ping.sent", &serde_json::json!({ "n": 7 }))
            .await
            .expect("publish");
        wait_settled(&broker, 2).await;

        assert_eq!(*first.seen.lock().expect("seen lock"), vec![7]);
        assert_eq!(*second.seen.lock().expect("seen lock"), vec![7]);
    }

    #[tokio::test]
    async fn shutdown_stops_the_task() {
        let broker = InMemoryBroker::new();
        let (consumer, _publisher) = setup(&broker);
        let sub = consumer
            .subscribe::<Ping, _>("ping.sent", Flaky::new(0))
            .await
            .expect("subscribe");
        assert!(!sub.is_finished());

        sub.shutdown().await;
    }

    #[tokio::test]
    async fn dropped_queue_is_reported_as_lost() {
        let broker = InMemoryBroker::new();
        let (consumer, _publisher) = setup(&broker);
        let mut subs = vec![
            consumer
                .subscribe::<Ping, _>("ping.sent", Flaky::new(0))
                .await
                .expect("subscribe"),
        ];

        // Closing the channel deletes its queues, as a lost connection does.
        let channel = consumer.client.channel().await.expect("channel");
        channel.close().await.expect("close");

        let err = timeout(Duration::from_secs(5), first_lost(&mut subs))
            .await
            .expect("loss is reported");
        assert!(matches!(
            &err,
            BrokerError::SubscriptionLost { routing_key, .. } if routing_key == "ping.sent"
        ));
        assert!(subs[0].is_finished());
        assert!(!consumer.client.is_connected().await);

        for sub in subs {
            sub.shutdown().await;
        }
    }

    #[tokio::test]
    async fn shutdown_is_not_reported_as_lost() {
        let broker = InMemoryBroker::new();
        let (consumer, _publisher) = setup(&broker);
        let mut subs = vec![
            consumer
                .subscribe::<Ping, _>("ping.sent", Flaky::new(0))
                .await
                .expect("subscribe"),
        ];

        let watch = timeout(Duration::from_millis(50), first_lost(&mut subs)).await;
        assert!(watch.is_err(), "a healthy subscription keeps running");

        for sub in subs {
            sub.shutdown().await;
        }
        assert!(consumer.client.is_connected().await);
    }
}
