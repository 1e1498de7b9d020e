use std::sync::Arc;

use metrics::counter;
use ripple_events::DomainEvent;
use serde::Serialize;
use tracing::{debug, warn};

use super::client::BrokerClient;
use super::transport::BrokerError;

const METRIC_EVENTS_PUBLISHED: &str = "ripple_events_published_total";
const METRIC_EVENTS_PUBLISH_FAILED: &str = "ripple_events_publish_failed_total";

/// Publishes JSON payloads to the shared exchange.
#[derive(Clone)]
pub struct EventPublisher {
    client: Arc<BrokerClient>,
}

impl EventPublisher {
    pub fn new(client: Arc<BrokerClient>) -> Self {
        Self { client }
    }

    /// Serialize `payload` and publish it under `routing_key`.
    ///
    /// Returns once the broker accepted the frame; no confirmation is awaited
    /// and a message no queue is bound for is dropped by the broker.
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        routing_key: &str,
        payload: &T,
    ) -> Result<(), BrokerError> {
        self.send(routing_key, serde_json::to_vec(payload)).await
    }

    pub async fn publish_event(&self, event: &DomainEvent) -> Result<(), BrokerError> {
        self.send(event.routing_key(), event.to_json()).await
    }

    async fn send(
        &self,
        routing_key: &str,
        encoded: Result<Vec<u8>, serde_json::Error>,
    ) -> Result<(), BrokerError> {
        let result = match encoded {
            Ok(body) => self.deliver(routing_key, body).await,
            Err(err) => Err(err.into()),
        };

        match result {
            Ok(()) => {
                counter!(METRIC_EVENTS_PUBLISHED, "routing_key" => routing_key.to_string())
                    .increment(1);
                Ok(())
            }
            Err(err) => {
                counter!(METRIC_EVENTS_PUBLISH_FAILED, "routing_key" => routing_key.to_string())
                    .increment(1);
                warn!(routing_key, error = %err, "Event publish failed");
                Err(err)
            }
        }
    }

    async fn deliver(&self, routing_key: &str, body: Vec<u8>) -> Result<(), BrokerError> {
        let size = body.len();
        let channel = self.client.channel().await?;
        channel
            .publish(self.client.exchange(), routing_key, body)
            .await?;
        debug!(routing_key, exchange = self.client.exchange(), size, "Event published");
        Ok(())
    }
}
