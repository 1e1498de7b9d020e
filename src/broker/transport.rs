//! Transport seam between the broker client and a concrete message broker.
//!
//! The AMQP adapter speaks to RabbitMQ through `lapin`; the in-memory adapter
//! implements the same topic-exchange semantics inside the process.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker unreachable after {attempts} attempts: {last_error}")]
    ConnectionExhausted { attempts: u32, last_error: String },
    #[error("broker connection failed: {0}")]
    Connect(String),
    #[error("broker channel error: {0}")]
    Channel(String),
    #[error("failed to encode event payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("broker channel is closed")]
    Closed,
    #[error("subscription for `{routing_key}` stopped: {reason}")]
    SubscriptionLost { routing_key: String, reason: String },
}

impl BrokerError {
    pub fn connect(err: impl fmt::Display) -> Self {
        Self::Connect(err.to_string())
    }

    pub fn channel(err: impl fmt::Display) -> Self {
        Self::Channel(err.to_string())
    }
}

/// Opens connections to a broker.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection and return a channel on it.
    async fn connect(&self) -> Result<Arc<dyn Channel>, BrokerError>;

    /// Human-readable target, safe for logs.
    fn describe(&self) -> String;
}

/// An open channel. Closing it removes every exclusive queue it declared.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Declare a non-durable topic exchange. Repeated declares are no-ops.
    async fn declare_topic_exchange(&self, exchange: &str) -> Result<(), BrokerError>;

    /// Publish without waiting for a broker confirmation.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
    ) -> Result<(), BrokerError>;

    /// Declare an exclusive, server-named queue, bind it to `exchange` with
    /// `pattern`, and start consuming from it.
    async fn bind_exclusive_queue(
        &self,
        exchange: &str,
        pattern: &str,
    ) -> Result<QueueSubscription, BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// Settles one delivery with the broker.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<(), BrokerError>;
    async fn reject(&self, requeue: bool) -> Result<(), BrokerError>;
}

/// Consumer side of a bound queue.
pub struct QueueSubscription {
    pub queue: String,
    pub deliveries: BoxStream<'static, Result<Delivery, BrokerError>>,
}

impl fmt::Debug for QueueSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueSubscription")
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

pub struct Delivery {
    pub routing_key: String,
    pub body: Vec<u8>,
    pub redelivered: bool,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(
        routing_key: impl Into<String>,
        body: Vec<u8>,
        redelivered: bool,
        acker: Box<dyn Acker>,
    ) -> Self {
        Self {
            routing_key: routing_key.into(),
            body,
            redelivered,
            acker,
        }
    }

    pub async fn ack(&self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }

    pub async fn reject(&self, requeue: bool) -> Result<(), BrokerError> {
        self.acker.reject(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("body_len", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish_non_exhaustive()
    }
}
