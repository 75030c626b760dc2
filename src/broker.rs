//! Pub/sub broker seam
//!
//! The fan-out bus only needs two things from shared infrastructure:
//! publish a text payload on a named channel, and receive everything
//! published on channels matching a glob pattern. `MemoryBroker` covers a
//! single process (and tests that run several gateways side by side);
//! `RedisBroker` covers real multi-process deployments.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, warn};

use crate::error::BrokerError;

/// Buffer between a broker subscription and its consumer
const SUBSCRIPTION_BUFFER: usize = 1024;

/// Capacity of the in-process broadcast ring
const MEMORY_BROKER_CAPACITY: usize = 4096;

/// One message received from a pattern subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub channel: String,
    pub payload: String,
}

/// Stream of messages for one pattern subscription
pub type Subscription = mpsc::Receiver<BrokerMessage>;

#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish `payload` on `channel`
    async fn publish(&self, channel: &str, payload: String) -> Result<(), BrokerError>;

    /// Subscribe to every channel matching any of `patterns` (`*` globs)
    async fn psubscribe(&self, patterns: &[&str]) -> Result<Subscription, BrokerError>;

    fn name(&self) -> &'static str;
}

/// Glob match supporting `*` (any run of characters)
pub fn pattern_matches(pattern: &str, channel: &str) -> bool {
    let p = pattern.as_bytes();
    let c = channel.as_bytes();
    let (mut pi, mut ci) = (0, 0);
    let mut star: Option<usize> = None;
    let mut mark = 0;

    while ci < c.len() {
        if pi < p.len() && p[pi] == b'*' {
            star = Some(pi);
            pi += 1;
            mark = ci;
        } else if pi < p.len() && p[pi] == c[ci] {
            pi += 1;
            ci += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            mark += 1;
            ci = mark;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == b'*' {
        pi += 1;
    }
    pi == p.len()
}

/// In-process broker backed by a `tokio::sync::broadcast` channel
///
/// Clones share the same channel, so several gateways built from clones of
/// one `MemoryBroker` behave like processes attached to one shared broker.
#[derive(Clone)]
pub struct MemoryBroker {
    sender: broadcast::Sender<BrokerMessage>,
    reachable: Arc<AtomicBool>,
    /// Bumped to cut every open subscription
    disconnects: Arc<watch::Sender<u64>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(MEMORY_BROKER_CAPACITY);
        let (disconnects, _) = watch::channel(0);
        Self {
            sender,
            reachable: Arc::new(AtomicBool::new(true)),
            disconnects: Arc::new(disconnects),
        }
    }

    /// Simulate the broker becoming unreachable (or recovering)
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Simulate a dropped subscriber connection
    ///
    /// Every subscription open right now ends; later `psubscribe` calls are
    /// unaffected.
    pub fn disconnect_subscribers(&self) {
        self.disconnects.send_modify(|generation| *generation += 1);
    }

    fn check_reachable(&self) -> Result<(), BrokerError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::Unavailable("memory broker offline".to_string()))
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), BrokerError> {
        self.check_reachable()?;
        // send() returns Err if there are no subscribers, that's fine
        let _ = self.sender.send(BrokerMessage {
            channel: channel.to_string(),
            payload,
        });
        Ok(())
    }

    async fn psubscribe(&self, patterns: &[&str]) -> Result<Subscription, BrokerError> {
        self.check_reachable()?;
        let patterns: Vec<String> = patterns.iter().map(|p| p.to_string()).collect();
        let mut source = self.sender.subscribe();
        let mut disconnected = self.disconnects.subscribe();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);

        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    _ = disconnected.changed() => break,
                    received = source.recv() => received,
                };
                match received {
                    Ok(msg) => {
                        if !patterns.iter().any(|p| pattern_matches(p, &msg.channel)) {
                            continue;
                        }
                        if tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Memory broker subscriber lagged, {} messages skipped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("Memory broker subscription ended");
        });

        Ok(rx)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(feature = "redis")]
pub use self::redis_broker::RedisBroker;

#[cfg(feature = "redis")]
mod redis_broker {
    use async_trait::async_trait;
    use futures_util::StreamExt;
    use redis::AsyncCommands;
    use tokio::sync::mpsc;
    use tracing::warn;

    use super::{Broker, BrokerMessage, Subscription, SUBSCRIPTION_BUFFER};
    use crate::error::BrokerError;

    /// Redis PUBLISH / PSUBSCRIBE broker
    pub struct RedisBroker {
        client: redis::Client,
        publisher: redis::aio::MultiplexedConnection,
    }

    impl RedisBroker {
        pub async fn connect(url: &str) -> Result<Self, BrokerError> {
            let client = redis::Client::open(url)?;
            let publisher = client.get_multiplexed_async_connection().await?;
            Ok(Self { client, publisher })
        }
    }

    #[async_trait]
    impl Broker for RedisBroker {
        async fn publish(&self, channel: &str, payload: String) -> Result<(), BrokerError> {
            let mut conn = self.publisher.clone();
            let _receivers: i64 = conn.publish(channel, payload).await?;
            Ok(())
        }

        async fn psubscribe(&self, patterns: &[&str]) -> Result<Subscription, BrokerError> {
            let mut pubsub = self.client.get_async_pubsub().await?;
            for pattern in patterns {
                pubsub.psubscribe(*pattern).await?;
            }
            let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);

            tokio::spawn(async move {
                let mut stream = pubsub.into_on_message();
                while let Some(msg) = stream.next().await {
                    let payload: String = match msg.get_payload() {
                        Ok(p) => p,
                        Err(e) => {
                            warn!("Non-text payload on {}: {}", msg.get_channel_name(), e);
                            continue;
                        }
                    };
                    let message = BrokerMessage {
                        channel: msg.get_channel_name().to_string(),
                        payload,
                    };
                    if tx.send(message).await.is_err() {
                        break;
                    }
                }
                warn!("Redis subscription ended");
            });

            Ok(rx)
        }

        fn name(&self) -> &'static str {
            "redis"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_matches() {
        assert!(pattern_matches("room:*", "room:5"));
        assert!(pattern_matches("user-status:*", "user-status:12"));
        assert!(!pattern_matches("room:*", "user-status:12"));
        assert!(pattern_matches("*:5", "room:5"));
        assert!(pattern_matches("room:5", "room:5"));
        assert!(!pattern_matches("room:5", "room:50"));
        assert!(pattern_matches("a*b*c", "axxbyyc"));
        assert!(!pattern_matches("a*b*c", "axxbyy"));
    }

    #[tokio::test]
    async fn test_memory_broker_filters_by_pattern() {
        let broker = MemoryBroker::new();
        let mut sub = broker.psubscribe(&["room:*"]).await.unwrap();

        broker.publish("user-status:1", "skip".to_string()).await.unwrap();
        broker.publish("room:5", "first".to_string()).await.unwrap();
        broker.publish("room:5", "second".to_string()).await.unwrap();

        let first = sub.recv().await.unwrap();
        assert_eq!(first.channel, "room:5");
        assert_eq!(first.payload, "first");
        assert_eq!(sub.recv().await.unwrap().payload, "second");
    }

    #[tokio::test]
    async fn test_clones_share_channel() {
        let broker = MemoryBroker::new();
        let other = broker.clone();
        let mut sub = other.psubscribe(&["room:*"]).await.unwrap();

        broker.publish("room:1", "x".to_string()).await.unwrap();
        assert_eq!(sub.recv().await.unwrap().payload, "x");
    }

    #[tokio::test]
    async fn test_unreachable_broker_rejects_publish() {
        let broker = MemoryBroker::new();
        broker.set_reachable(false);
        let err = broker.publish("room:1", "x".to_string()).await.unwrap_err();
        assert!(matches!(err, BrokerError::Unavailable(_)));
        assert!(broker.psubscribe(&["room:*"]).await.is_err());
    }

    #[tokio::test]
    async fn test_disconnect_ends_open_subscriptions_only() {
        let broker = MemoryBroker::new();
        let mut old = broker.psubscribe(&["room:*"]).await.unwrap();
        broker.disconnect_subscribers();
        assert!(old.recv().await.is_none());

        let mut fresh = broker.psubscribe(&["room:*"]).await.unwrap();
        broker.publish("room:1", "after".to_string()).await.unwrap();
        assert_eq!(fresh.recv().await.unwrap().payload, "after");
    }
}
