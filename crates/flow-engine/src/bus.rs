//! In-process pub/sub message bus
//!
//! Topic-based fan-out with MQTT-style wildcards: `+` matches exactly one
//! path level, a trailing `#` matches the rest. Delivery to subscribers is
//! a bounded, non-blocking send: a subscriber that is not draining its
//! channel loses messages (counted and logged) instead of stalling the
//! publisher. This is a deliberate backpressure policy.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::connector::Connector;
use crate::model::Message;

/// Handle identifying one subscription
pub type SubscriptionId = u64;

/// Conventional registry name of the bus connector instance
pub const BUS_CONNECTOR: &str = "bus";

/// Buffered messages per subscriber before drops start
const SUBSCRIPTION_BUFFER: usize = 10;

struct BusSubscription {
    id: SubscriptionId,
    pattern: String,
    tx: mpsc::Sender<Message>,
}

/// Topic-based pub/sub fan-out
#[derive(Default)]
pub struct MessageBus {
    subscriptions: Mutex<Vec<BusSubscription>>,
    next_id: AtomicU64,
    dropped: AtomicU64,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a topic pattern; returns the subscription handle and the
    /// receiving end of the bounded delivery channel
    pub fn subscribe(&self, pattern: &str) -> (SubscriptionId, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscriptions.lock().push(BusSubscription {
            id,
            pattern: pattern.to_string(),
            tx,
        });
        (id, rx)
    }

    /// Remove a subscription
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscriptions.lock().retain(|s| s.id != id);
    }

    /// Publish a message to every subscriber whose pattern matches its topic
    ///
    /// Returns the number of subscribers the message was handed to. Full
    /// subscriber channels drop the message.
    pub fn publish(&self, msg: Message) -> usize {
        let mut delivered = 0;
        let subscriptions = self.subscriptions.lock();
        for sub in subscriptions.iter() {
            if !Self::topic_matches(&sub.pattern, &msg.topic) {
                continue;
            }
            match sub.tx.try_send(msg.clone()) {
                Ok(()) => delivered += 1,
                Err(_) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    log::warn!(
                        "bus: message on '{}' dropped for slow subscriber '{}'",
                        msg.topic,
                        sub.pattern
                    );
                }
            }
        }
        delivered
    }

    /// Messages dropped because a subscriber channel was full or closed
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Match a topic against a subscription pattern
    pub fn topic_matches(pattern: &str, topic: &str) -> bool {
        if pattern == topic {
            return true;
        }
        let mut pattern_parts = pattern.split('/');
        let mut topic_parts = topic.split('/');
        loop {
            match (pattern_parts.next(), topic_parts.next()) {
                (Some("#"), _) => return true,
                (Some("+"), Some(_)) => {}
                (Some(p), Some(t)) if p == t => {}
                (None, None) => return true,
                _ => return false,
            }
        }
    }
}

/// The message bus wrapped as a registrable connector
pub struct MessageBusConnector {
    bus: Arc<MessageBus>,
}

impl MessageBusConnector {
    pub fn new() -> Self {
        Self {
            bus: Arc::new(MessageBus::new()),
        }
    }

    /// Shared handle to the underlying bus
    pub fn bus(&self) -> Arc<MessageBus> {
        self.bus.clone()
    }
}

impl Default for MessageBusConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector for MessageBusConnector {
    fn connector_type(&self) -> &str {
        "message_bus"
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Variable;

    fn msg(topic: &str) -> Message {
        Message {
            topic: topic.to_string(),
            service: "switch".to_string(),
            interface: "evt.binary.report".to_string(),
            payload: Variable::new("bool", serde_json::json!(true)),
            ..Default::default()
        }
    }

    #[test]
    fn test_topic_matching() {
        assert!(MessageBus::topic_matches("a/b/c", "a/b/c"));
        assert!(MessageBus::topic_matches("a/+/c", "a/b/c"));
        assert!(MessageBus::topic_matches("a/#", "a/b/c"));
        assert!(MessageBus::topic_matches("#", "a/b/c"));
        assert!(!MessageBus::topic_matches("a/b", "a/b/c"));
        assert!(!MessageBus::topic_matches("a/+/c", "a/b/d"));
        assert!(!MessageBus::topic_matches("a/b/c/d", "a/b/c"));
    }

    #[tokio::test]
    async fn test_publish_reaches_matching_subscriber() {
        let bus = MessageBus::new();
        let (_id, mut rx) = bus.subscribe("evt/dev/+/switch");
        let (_other, mut other_rx) = bus.subscribe("evt/dev/9/dimmer");

        let delivered = bus.publish(msg("evt/dev/1/switch"));
        assert_eq!(delivered, 1);

        let received = rx.recv().await.unwrap();
        assert_eq!(received.topic, "evt/dev/1/switch");
        assert!(other_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_messages() {
        let bus = MessageBus::new();
        let (_id, mut rx) = bus.subscribe("evt/#");

        for _ in 0..SUBSCRIPTION_BUFFER + 3 {
            bus.publish(msg("evt/dev/1/switch"));
        }
        assert_eq!(bus.dropped_count(), 3);

        // The buffered messages are still there
        for _ in 0..SUBSCRIPTION_BUFFER {
            assert!(rx.recv().await.is_some());
        }
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let bus = MessageBus::new();
        let (id, mut rx) = bus.subscribe("evt/#");
        bus.unsubscribe(id);
        assert_eq!(bus.publish(msg("evt/dev/1/switch")), 0);
        assert!(rx.recv().await.is_none());
    }
}
