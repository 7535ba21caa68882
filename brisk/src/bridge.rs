//! Cross-process broadcast bridge
//!
//! A group may be tied to an external pub/sub topic of the same name. Anything
//! published on the topic, by this process or another one, is forwarded into
//! the group's broadcast feed and from there to every local member.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::error::BridgeError;
use crate::transport::Frame;

/// External pub/sub backend
#[async_trait]
pub trait PubSubBridge: Send + Sync + 'static {
    /// Forward every payload published on `topic` into `feed`
    ///
    /// Forwarding stops when the returned subscription is dropped.
    async fn subscribe(
        &self,
        topic: &str,
        feed: mpsc::Sender<Frame>,
    ) -> Result<Subscription, BridgeError>;

    /// Publish a payload on `topic`
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BridgeError>;
}

/// Handle to a running topic subscription
///
/// Dropping it stops forwarding.
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    token: CancellationToken,
}

impl Subscription {
    /// Create a subscription and the token its forwarding task watches
    #[must_use]
    pub fn new(topic: impl Into<String>) -> (Self, CancellationToken) {
        let token = CancellationToken::new();
        let subscription = Self {
            topic: topic.into(),
            token: token.clone(),
        };
        (subscription, token)
    }

    /// Subscribed topic
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Push an external payload into a group feed
///
/// Waits for feed capacity. Returns `false` once the group is gone.
pub async fn forward(feed: &mpsc::Sender<Frame>, payload: Vec<u8>) -> bool {
    let frame = match String::from_utf8(payload) {
        Ok(text) => Frame::Text(text),
        Err(e) => Frame::Binary(e.into_bytes()),
    };
    feed.send(frame).await.is_ok()
}

/// Retry `connect` with exponential backoff
pub(crate) async fn connect_with_retries<T, F, Fut>(
    backend: &str,
    max_retries: u32,
    base_delay: Duration,
    mut connect: F,
) -> Result<T, BridgeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BridgeError>>,
{
    let mut attempt = 0;

    loop {
        match connect().await {
            Ok(conn) => {
                if attempt > 0 {
                    tracing::info!(backend, "Connection established after {} attempt(s)", attempt + 1);
                }
                return Ok(conn);
            }
            Err(e) => {
                attempt += 1;

                if attempt > max_retries {
                    tracing::error!(backend, "Failed to connect after {} attempts: {}", max_retries + 1, e);
                    return Err(e);
                }

                let delay = base_delay * 2_u32.pow(attempt.saturating_sub(1));
                tracing::warn!(backend, "Connection attempt {} failed: {}. Retrying in {:?}...", attempt, e, delay);
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Single-process bridge over a tokio broadcast channel
///
/// Clones share the channel, so two servers holding clones of one
/// `MemoryBridge` see each other's publications.
#[derive(Debug, Clone)]
pub struct MemoryBridge {
    tx: broadcast::Sender<(String, Vec<u8>)>,
}

impl MemoryBridge {
    /// Create a bridge buffering up to `capacity` publications per subscriber
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }
}

impl Default for MemoryBridge {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl PubSubBridge for MemoryBridge {
    async fn subscribe(
        &self,
        topic: &str,
        feed: mpsc::Sender<Frame>,
    ) -> Result<Subscription, BridgeError> {
        let mut rx = self.tx.subscribe();
        let (subscription, token) = Subscription::new(topic);
        let topic = topic.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok((t, payload)) if t == topic => {
                            if !forward(&feed, payload).await {
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(topic = %topic, skipped, "Bridge subscriber lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            tracing::debug!(topic = %topic, "Memory bridge subscription ended");
        });

        Ok(subscription)
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BridgeError> {
        // No subscribers is not an error
        let _ = self.tx.send((topic.to_string(), payload));
        Ok(())
    }
}

#[cfg(feature = "redis")]
pub use self::redis_bridge::RedisBridge;

#[cfg(feature = "redis")]
mod redis_bridge {
    use async_trait::async_trait;
    use futures::StreamExt;
    use redis::AsyncCommands;
    use std::time::Duration;
    use tokio::sync::mpsc;

    use super::{connect_with_retries, forward, PubSubBridge, Subscription};
    use crate::config::RedisConfig;
    use crate::error::BridgeError;
    use crate::transport::Frame;

    /// Redis pub/sub bridge
    ///
    /// Every subscription holds its own pub/sub connection; publishing goes
    /// through one shared multiplexed connection.
    #[derive(Clone)]
    pub struct RedisBridge {
        client: redis::Client,
        publisher: redis::aio::MultiplexedConnection,
    }

    impl RedisBridge {
        /// Connect, retrying with exponential backoff
        pub async fn connect(config: &RedisConfig) -> Result<Self, BridgeError> {
            let client = redis::Client::open(config.url.as_str())?;
            let publisher = connect_with_retries(
                "redis",
                config.max_retries,
                Duration::from_secs(config.retry_delay_secs),
                || {
                    let client = client.clone();
                    async move { Ok(client.get_multiplexed_async_connection().await?) }
                },
            )
            .await?;

            tracing::info!("Redis bridge connected to {}", config.url);
            Ok(Self { client, publisher })
        }
    }

    #[async_trait]
    impl PubSubBridge for RedisBridge {
        async fn subscribe(
            &self,
            topic: &str,
            feed: mpsc::Sender<Frame>,
        ) -> Result<Subscription, BridgeError> {
            let mut pubsub = self.client.get_async_pubsub().await?;
            pubsub.subscribe(topic).await?;

            let (subscription, token) = Subscription::new(topic);
            let topic = topic.to_string();

            tokio::spawn(async move {
                let mut messages = pubsub.into_on_message();
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        message = messages.next() => match message {
                            Some(message) => {
                                if !forward(&feed, message.get_payload_bytes().to_vec()).await {
                                    break;
                                }
                            }
                            None => {
                                tracing::warn!(topic = %topic, "Redis subscription stream ended");
                                break;
                            }
                        },
                    }
                }
            });

            Ok(subscription)
        }

        async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BridgeError> {
            let mut conn = self.publisher.clone();
            conn.publish::<_, _, ()>(topic, payload).await?;
            Ok(())
        }
    }
}

#[cfg(feature = "nats")]
pub use self::nats_bridge::NatsBridge;

#[cfg(feature = "nats")]
mod nats_bridge {
    use async_trait::async_trait;
    use futures::StreamExt;
    use std::time::Duration;
    use tokio::sync::mpsc;

    use super::{connect_with_retries, forward, PubSubBridge, Subscription};
    use crate::config::NatsConfig;
    use crate::error::BridgeError;
    use crate::transport::Frame;

    /// NATS core pub/sub bridge
    #[derive(Clone)]
    pub struct NatsBridge {
        client: async_nats::Client,
    }

    impl NatsBridge {
        /// Connect, retrying with exponential backoff
        pub async fn connect(config: &NatsConfig) -> Result<Self, BridgeError> {
            let client = connect_with_retries(
                "nats",
                config.max_retries,
                Duration::from_secs(config.retry_delay_secs),
                || async {
                    let mut opts = async_nats::ConnectOptions::new();
                    if let Some(name) = &config.name {
                        opts = opts.name(name);
                    }
                    opts.connect(&config.url)
                        .await
                        .map_err(|e| BridgeError::Nats(format!("connect to {}: {}", config.url, e)))
                },
            )
            .await?;

            tracing::info!("NATS bridge connected to {}", config.url);
            Ok(Self { client })
        }
    }

    #[async_trait]
    impl PubSubBridge for NatsBridge {
        async fn subscribe(
            &self,
            topic: &str,
            feed: mpsc::Sender<Frame>,
        ) -> Result<Subscription, BridgeError> {
            let mut subscriber = self
                .client
                .subscribe(topic.to_string())
                .await
                .map_err(|e| BridgeError::Nats(format!("subscribe to {}: {}", topic, e)))?;

            let (subscription, token) = Subscription::new(topic);
            let topic = topic.to_string();

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        message = subscriber.next() => match message {
                            Some(message) => {
                                if !forward(&feed, message.payload.to_vec()).await {
                                    break;
                                }
                            }
                            None => {
                                tracing::warn!(topic = %topic, "NATS subscription ended");
                                break;
                            }
                        },
                    }
                }
                let _ = subscriber.unsubscribe().await;
            });

            Ok(subscription)
        }

        async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BridgeError> {
            self.client
                .publish(topic.to_string(), payload.into())
                .await
                .map_err(|e| BridgeError::Nats(format!("publish to {}: {}", topic, e)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_bridge_routes_by_topic() {
        let bridge = MemoryBridge::new(16);
        let (a_tx, mut a_rx) = mpsc::channel(4);
        let (b_tx, mut b_rx) = mpsc::channel(4);

        let _a = bridge.subscribe("a", a_tx).await.unwrap();
        let _b = bridge.subscribe("b", b_tx).await.unwrap();

        bridge.publish("a", b"hello".to_vec()).await.unwrap();

        assert_eq!(a_rx.recv().await, Some(Frame::Text("hello".into())));
        assert!(tokio::time::timeout(Duration::from_millis(50), b_rx.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_dropping_subscription_stops_forwarding() {
        let bridge = MemoryBridge::new(16);
        let (tx, mut rx) = mpsc::channel(4);

        let subscription = bridge.subscribe("a", tx).await.unwrap();
        assert_eq!(subscription.topic(), "a");
        drop(subscription);

        // the forwarding task owned the only sender
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_non_utf8_payload_becomes_binary() {
        let (tx, mut rx) = mpsc::channel(1);
        assert!(forward(&tx, vec![0xff, 0x00]).await);
        assert_eq!(rx.recv().await, Some(Frame::Binary(vec![0xff, 0x00])));
    }

    #[tokio::test]
    async fn test_connect_with_retries_gives_up() {
        let mut calls = 0;
        let result: Result<(), _> =
            connect_with_retries("test", 2, Duration::from_millis(1), || {
                calls += 1;
                async { Err(BridgeError::Closed) }
            })
            .await;
        assert!(matches!(result, Err(BridgeError::Closed)));
        assert_eq!(calls, 3);
    }
}
