//! Topic publish/subscribe over a shared exchange.
//!
//! - **Transport**: [`Connector`] / [`Channel`] implemented for RabbitMQ
//!   ([`AmqpConnector`]) and in process ([`InMemoryBroker`]).
//! - **Client**: [`BrokerClient`] owns the connection and its bounded
//!   startup retry.
//! - **Publishing**: [`EventPublisher`], fire-and-forget JSON.
//! - **Consuming**: [`EventConsumer`] runs one sequential loop per
//!   subscription with timeout, in-place retry and a dead-letter log.

mod amqp;
mod client;
mod consumer;
mod dead_letter;
mod memory;
mod publisher;
mod topic;
mod transport;

use std::sync::Arc;

pub use amqp::AmqpConnector;
pub use client::{BrokerClient, RetryPolicy};
pub use consumer::{DeliveryPolicy, EventConsumer, EventHandler, SubscriptionHandle, first_lost};
pub use dead_letter::{DeadLetter, DeadLetterEntry, DeadLetterLog, DeadLetterReason};
pub use memory::InMemoryBroker;
pub use publisher::EventPublisher;
pub use topic::topic_matches;
pub use transport::{Acker, BrokerError, Channel, Connector, Delivery, QueueSubscription};

/// URL selecting the in-process broker.
pub const MEMORY_URL: &str = "memory://";

/// Pick a connector for `url`: `memory://` stays in process, anything else is
/// dialed over AMQP.
pub fn connector_for(url: &str) -> Arc<dyn Connector> {
    if url == MEMORY_URL {
        Arc::new(InMemoryBroker::new())
    } else {
        Arc::new(AmqpConnector::new(url))
    }
}
