//! In-process topic exchange.
//!
//! Used by tests and by single-process deployments (`broker.url = "memory://"`).
//! Semantics follow a non-durable AMQP topic exchange: publishing to an
//! undeclared exchange fails, messages nobody is bound for are dropped, and
//! closing a channel deletes the exclusive queues it declared.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use tokio::sync::mpsc;
use tracing::debug;

use super::topic::topic_matches;
use super::transport::{Acker, BrokerError, Channel, Connector, Delivery, QueueSubscription};
use crate::util::lock::mutex_lock;

const SOURCE: &str = "broker::memory";

#[derive(Debug, Clone)]
struct Message {
    routing_key: String,
    body: Vec<u8>,
    redelivered: bool,
}

struct Binding {
    channel_id: u64,
    queue: String,
    exchange: String,
    pattern: String,
    sender: mpsc::UnboundedSender<Message>,
}

#[derive(Default)]
struct State {
    exchanges: HashSet<String>,
    bindings: Vec<Binding>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    unreachable: AtomicBool,
    failing_connects: AtomicU32,
    connect_attempts: AtomicU32,
    exchange_declares: AtomicU32,
    next_id: AtomicU64,
    published: AtomicU64,
    acked: AtomicU64,
    rejected: AtomicU64,
}

/// Handle to one in-process broker. Clones share the same exchanges.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A broker that refuses every connection.
    pub fn unreachable() -> Self {
        let broker = Self::new();
        broker.shared.unreachable.store(true, Ordering::SeqCst);
        broker
    }

    /// Make the next `count` connection attempts fail.
    pub fn fail_next_connects(&self, count: u32) {
        self.shared.failing_connects.store(count, Ordering::SeqCst);
    }

    pub fn connect_attempts(&self) -> u32 {
        self.shared.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn exchange_declares(&self) -> u32 {
        self.shared.exchange_declares.load(Ordering::SeqCst)
    }

    pub fn published(&self) -> u64 {
        self.shared.published.load(Ordering::SeqCst)
    }

    pub fn acked(&self) -> u64 {
        self.shared.acked.load(Ordering::SeqCst)
    }

    pub fn rejected(&self) -> u64 {
        self.shared.rejected.load(Ordering::SeqCst)
    }

    /// Deliveries settled either way.
    pub fn settled(&self) -> u64 {
        self.acked() + self.rejected()
    }

    pub fn queue_count(&self) -> usize {
        mutex_lock(&self.shared.state, SOURCE, "queue_count")
            .bindings
            .len()
    }

    fn next_id(&self) -> u64 {
        self.shared.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[async_trait]
impl Connector for InMemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn Channel>, BrokerError> {
        self.shared.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if self.shared.unreachable.load(Ordering::SeqCst) {
            return Err(BrokerError::connect("connection refused"));
        }
        let failing = self
            .shared
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(BrokerError::connect("connection refused"));
        }

        Ok(Arc::new(MemoryChannel {
            id: self.next_id(),
            broker: self.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}

struct MemoryChannel {
    id: u64,
    broker: InMemoryBroker,
    closed: AtomicBool,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(BrokerError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn declare_topic_exchange(&self, exchange: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.broker
            .shared
            .exchange_declares
            .fetch_add(1, Ordering::SeqCst);
        mutex_lock(&self.broker.shared.state, SOURCE, "declare")
            .exchanges
            .insert(exchange.to_string());
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let state = mutex_lock(&self.broker.shared.state, SOURCE, "publish");
        if !state.exchanges.contains(exchange) {
            return Err(BrokerError::channel(format!(
                "no exchange '{exchange}' declared"
            )));
        }

        let mut routed = 0usize;
        for binding in state
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange && topic_matches(&b.pattern, routing_key))
        {
            let message = Message {
                routing_key: routing_key.to_string(),
                body: body.clone(),
                redelivered: false,
            };
            if binding.sender.send(message).is_ok() {
                routed += 1;
            }
        }
        self.broker.shared.published.fetch_add(1, Ordering::SeqCst);
        debug!(exchange, routing_key, routed, "Message routed");
        Ok(())
    }

    async fn bind_exclusive_queue(
        &self,
        exchange: &str,
        pattern: &str,
    ) -> Result<QueueSubscription, BrokerError> {
        self.ensure_open()?;
        let queue = format!("amq.gen-{}", self.broker.next_id());
        let (sender, receiver) = mpsc::unbounded_channel();
        // Only the binding holds a strong sender, so deleting the queue ends
        // the stream.
        let requeue_to = sender.downgrade();

        {
            let mut state = mutex_lock(&self.broker.shared.state, SOURCE, "bind");
            if !state.exchanges.contains(exchange) {
                return Err(BrokerError::channel(format!(
                    "no exchange '{exchange}' declared"
                )));
            }
            state.bindings.push(Binding {
                channel_id: self.id,
                queue: queue.clone(),
                exchange: exchange.to_string(),
                pattern: pattern.to_string(),
                sender,
            });
        }

        let broker = self.broker.clone();
        let deliveries = stream::unfold(receiver, |mut receiver| async move {
            let message = receiver.recv().await?;
            Some((message, receiver))
        })
        .map(move |message| {
            let acker = MemoryAcker {
                broker: broker.clone(),
                requeue_to: requeue_to.clone(),
                message: message.clone(),
            };
            Ok(Delivery::new(
                message.routing_key,
                message.body,
                message.redelivered,
                Box::new(acker),
            ))
        })
        .boxed();

        Ok(QueueSubscription { queue, deliveries })
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut state = mutex_lock(&self.broker.shared.state, SOURCE, "close");
        let (closed, kept): (Vec<Binding>, Vec<Binding>) = state
            .bindings
            .drain(..)
            .partition(|b| b.channel_id == self.id);
        state.bindings = kept;
        let queues: Vec<String> = closed.into_iter().map(|b| b.queue).collect();
        debug!(channel = self.id, ?queues, "Channel closed, exclusive queues deleted");
        Ok(())
    }
}

struct MemoryAcker {
    broker: InMemoryBroker,
    requeue_to: mpsc::WeakUnboundedSender<Message>,
    message: Message,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.broker.shared.acked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<(), BrokerError> {
        self.broker.shared.rejected.fetch_add(1, Ordering::SeqCst);
        if requeue {
            let mut message = self.message.clone();
            message.redelivered = true;
            // A deleted queue takes its requeued messages with it.
            if let Some(sender) = self.requeue_to.upgrade() {
                let _ = sender.send(message);
            }
        }
        Ok(())
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            let mut state = mutex_lock(&self.broker.shared.state, SOURCE, "drop");
            state.bindings.retain(|b| b.channel_id != self.id);
        }
    }
}
