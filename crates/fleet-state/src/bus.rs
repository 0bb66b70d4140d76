//! Topic broadcast bus abstraction.
//!
//! The control plane and node daemons speak only [`Bus`]; the same code runs
//! over [`LocalBus`] (in-process loopback, used by tests and single-process
//! clusters) and the gossipsub-backed bus in `fleet-net`.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use tracing::warn;

use crate::envelope::Envelope;
use crate::error::Result;

/// Per-topic channel depth. Absorbs short bursts; a consumer that lags
/// behind this far starts losing the oldest messages.
const TOPIC_CAPACITY: usize = 256;

/// Publish/subscribe over named topics. Delivery is best-effort and
/// unordered across topics; per-sender ordering comes from envelope
/// sequence numbers, not from the transport.
#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, topic: &str, envelope: Envelope) -> Result<()>;
    async fn subscribe(&self, topic: &str) -> Result<BusSubscription>;
}

/// A live subscription to one topic.
pub struct BusSubscription {
    topic: String,
    inner: broadcast::Receiver<Envelope>,
}

impl BusSubscription {
    pub fn new(topic: String, inner: broadcast::Receiver<Envelope>) -> Self {
        Self { topic, inner }
    }

    /// Receive the next envelope. Returns `None` once the bus is gone.
    /// Lagged stretches are skipped with a warning rather than surfaced —
    /// every consumer tolerates missed messages by design of the protocol.
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            match self.inner.recv().await {
                Ok(env) => return Some(env),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(topic = %self.topic, skipped = n, "subscription lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

// ── LocalBus ─────────────────────────────────────────────────────────────────

/// In-process loopback bus: every subscriber on a topic sees every publish,
/// including the publisher's own.
pub struct LocalBus {
    topics: Mutex<HashMap<String, broadcast::Sender<Envelope>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
        }
    }

    async fn sender_for(&self, topic: &str) -> broadcast::Sender<Envelope> {
        let mut topics = self.topics.lock().await;
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Bus for LocalBus {
    async fn publish(&self, topic: &str, envelope: Envelope) -> Result<()> {
        let sender = self.sender_for(topic).await;
        // A publish with no live subscribers is not an error on a broadcast
        // bus; the message simply falls on the floor.
        let _ = sender.send(envelope);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<BusSubscription> {
        let sender = self.sender_for(topic).await;
        Ok(BusSubscription::new(topic.to_string(), sender.subscribe()))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(seq: u64) -> Envelope {
        Envelope::new("test", "sender-a", seq, &"hello").unwrap()
    }

    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let bus = LocalBus::new();
        let mut sub_a = bus.subscribe("topic.x").await.unwrap();
        let mut sub_b = bus.subscribe("topic.x").await.unwrap();

        bus.publish("topic.x", envelope(1)).await.unwrap();

        assert_eq!(sub_a.recv().await.unwrap().sequence, 1);
        assert_eq!(sub_b.recv().await.unwrap().sequence, 1);
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let bus = LocalBus::new();
        let mut sub = bus.subscribe("topic.a").await.unwrap();

        bus.publish("topic.b", envelope(1)).await.unwrap();
        bus.publish("topic.a", envelope(2)).await.unwrap();

        assert_eq!(sub.recv().await.unwrap().sequence, 2);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let bus = LocalBus::new();
        bus.publish("topic.empty", envelope(1)).await.unwrap();
    }
}
