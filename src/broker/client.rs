//! Broker connection lifecycle.
//!
//! A [`BrokerClient`] starts unconnected. The first call to [`connect`] or
//! [`channel`] dials the broker with a bounded retry budget and declares the
//! shared exchange once on the new connection. Concurrent callers wait on the
//! same attempt. There is no transparent reconnect after a mid-session drop.
//!
//! [`connect`]: BrokerClient::connect
//! [`channel`]: BrokerClient::channel

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{info, warn};

use super::transport::{BrokerError, Channel, Connector};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total connection attempts before giving up. Zero is treated as one.
    pub max_retries: u32,
    /// Pause between consecutive attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            delay: Duration::from_millis(5000),
        }
    }
}

pub struct BrokerClient {
    connector: Arc<dyn Connector>,
    exchange: String,
    retry: RetryPolicy,
    channel: Mutex<Option<Arc<dyn Channel>>>,
}

impl BrokerClient {
    pub fn new(connector: Arc<dyn Connector>, exchange: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            connector,
            exchange: exchange.into(),
            retry,
            channel: Mutex::new(None),
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Connect if not yet connected and return the shared channel.
    ///
    /// Fails with [`BrokerError::ConnectionExhausted`] once every attempt in
    /// the retry budget has failed.
    pub async fn connect(&self) -> Result<Arc<dyn Channel>, BrokerError> {
        let mut slot = self.channel.lock().await;
        if let Some(channel) = slot.as_ref() {
            return Ok(Arc::clone(channel));
        }

        let channel = self.establish().await?;
        *slot = Some(Arc::clone(&channel));
        Ok(channel)
    }

    /// The shared channel, connecting lazily when absent.
    pub async fn channel(&self) -> Result<Arc<dyn Channel>, BrokerError> {
        self.connect().await
    }

    pub async fn is_connected(&self) -> bool {
        self.channel.lock().await.is_some()
    }

    /// Forget a connection the broker dropped, so health reports it as down.
    pub async fn mark_lost(&self) {
        if self.channel.lock().await.take().is_some() {
            warn!(broker = %self.connector.describe(), "Broker connection lost");
        }
    }

    /// Close the connection. Exclusive queues bound through it are deleted.
    pub async fn close(&self) -> Result<(), BrokerError> {
        let Some(channel) = self.channel.lock().await.take() else {
            return Ok(());
        };
        channel.close().await?;
        info!(broker = %self.connector.describe(), "Broker connection closed");
        Ok(())
    }

    async fn establish(&self) -> Result<Arc<dyn Channel>, BrokerError> {
        let attempts = self.retry.max_retries.max(1);
        let target = self.connector.describe();
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.try_open().await {
                Ok(channel) => {
                    info!(
                        broker = %target,
                        exchange = %self.exchange,
                        attempt,
                        "Broker connected, exchange declared"
                    );
                    return Ok(channel);
                }
                Err(err) => {
                    let remaining = attempts - attempt;
                    warn!(
                        broker = %target,
                        attempt,
                        remaining,
                        error = %err,
                        "Broker connection attempt failed"
                    );
                    last_error = err.to_string();
                    if remaining > 0 {
                        tokio::time::sleep(self.retry.delay).await;
                    }
                }
            }
        }

        Err(BrokerError::ConnectionExhausted {
            attempts,
            last_error,
        })
    }

    async fn try_open(&self) -> Result<Arc<dyn Channel>, BrokerError> {
        let channel = self.connector.connect().await?;
        if let Err(err) = channel.declare_topic_exchange(&self.exchange).await {
            let _ = channel.close().await;
            return Err(err);
        }
        Ok(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::InMemoryBroker;

    fn client(broker: &InMemoryBroker, max_retries: u32) -> BrokerClient {
        BrokerClient::new(
            Arc::new(broker.clone()),
            "post_exchange",
            RetryPolicy {
                max_retries,
                delay: Duration::from_millis(5000),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_within_retry_budget() {
        let broker = InMemoryBroker::new();
        broker.fail_next_connects(2);
        let client = client(&broker, 5);

        client.connect().await.expect("third attempt succeeds");

        assert_eq!(broker.connect_attempts(), 3);
        assert_eq!(broker.exchange_declares(), 1);
        assert!(client.is_connected().await);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausting_the_budget_is_an_error() {
        let broker = InMemoryBroker::unreachable();
        let client = client(&broker, 5);
        let started = tokio::time::Instant::now();

        let err = client.connect().await.err().expect("must fail");

        assert!(matches!(
            err,
            BrokerError::ConnectionExhausted { attempts: 5, .. }
        ));
        assert_eq!(broker.connect_attempts(), 5);
        // Four pauses between five attempts.
        assert_eq!(started.elapsed(), Duration::from_millis(4 * 5000));
        assert!(!client.is_connected().await);
    }

    #[tokio::test]
    async fn channel_is_shared_and_declared_once() {
        let broker = InMemoryBroker::new();
        let client = Arc::new(client(&broker, 1));

        let (a, b) = tokio::join!(client.channel(), client.channel());
        a.expect("first");
        b.expect("second");
        client.channel().await.expect("third");

        assert_eq!(broker.connect_attempts(), 1);
        assert_eq!(broker.exchange_declares(), 1);
    }

    #[tokio::test]
    async fn close_drops_the_connection() {
        let broker = InMemoryBroker::new();
        let client = client(&broker, 1);
        client.connect().await.expect("connect");

        client.close().await.expect("close");
        assert!(!client.is_connected().await);

        client.channel().await.expect("reconnects lazily");
        assert_eq!(broker.connect_attempts(), 2);
    }
}
