// =============================================================================
// Event Bus — in-process topic-based pub/sub
// =============================================================================
//
// Best-effort fan-out: `publish` enqueues a clone of the envelope onto every
// subscriber's bounded mailbox and returns immediately. A slow subscriber
// whose mailbox is full loses the message (logged); the publisher is never
// stalled. Per-topic ordering follows publish order for a single publisher.
//
// No durability. Publishing to a topic with no subscribers is logged at
// debug level and otherwise ignored.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::types::now_ms;

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The bus payload. Immutable once published; subscribers receive clones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: String,
    /// Event kind from the closed set in [`crate::types::kinds`].
    pub kind: String,
    pub payload: serde_json::Value,
    pub timestamp_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl Envelope {
    pub fn new(
        topic: impl Into<String>,
        kind: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            topic: topic.into(),
            kind: kind.into(),
            payload,
            timestamp_ms: now_ms(),
            correlation_id: None,
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Identifies a subscription for `unsubscribe`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionId {
    pub topic: String,
    pub id: u64,
}

struct SubscriberEntry {
    id: u64,
    label: String,
    tx: mpsc::Sender<Envelope>,
}

/// In-process topic registry. Cheap to share via `Arc`.
pub struct EventBus {
    subscribers: RwLock<HashMap<String, Vec<SubscriberEntry>>>,
    next_id: AtomicU64,
    mailbox_capacity: usize,
}

impl EventBus {
    pub fn new(mailbox_capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            mailbox_capacity,
        }
    }

    /// Register a subscriber on `topic`. Returns the subscription id and the
    /// receiving half of the subscriber's bounded mailbox.
    ///
    /// `label` appears in drop warnings so slow consumers can be identified.
    pub fn subscribe(
        &self,
        topic: &str,
        label: &str,
    ) -> (SubscriptionId, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(self.mailbox_capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        self.subscribers
            .write()
            .entry(topic.to_string())
            .or_default()
            .push(SubscriberEntry {
                id,
                label: label.to_string(),
                tx,
            });

        debug!(topic, label, id, "bus subscriber registered");
        (
            SubscriptionId {
                topic: topic.to_string(),
                id,
            },
            rx,
        )
    }

    /// Remove a subscription. Unknown ids are a no-op.
    pub fn unsubscribe(&self, sub: &SubscriptionId) {
        let mut map = self.subscribers.write();
        if let Some(entries) = map.get_mut(&sub.topic) {
            entries.retain(|e| e.id != sub.id);
            if entries.is_empty() {
                map.remove(&sub.topic);
            }
        }
        debug!(topic = %sub.topic, id = sub.id, "bus subscriber removed");
    }

    /// Fan the envelope out to every subscriber of its topic.
    ///
    /// Returns the number of mailboxes that accepted the message. Never
    /// blocks: full mailboxes drop the message with a warning, and closed
    /// mailboxes are pruned lazily.
    pub fn publish(&self, envelope: Envelope) -> usize {
        let topic = envelope.topic.clone();
        let mut delivered = 0;
        let mut dead: Vec<u64> = Vec::new();

        {
            let map = self.subscribers.read();
            let Some(entries) = map.get(&topic) else {
                debug!(topic = %topic, kind = %envelope.kind, "publish to topic with no subscribers");
                return 0;
            };

            for entry in entries {
                match entry.tx.try_send(envelope.clone()) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(
                            topic = %topic,
                            subscriber = %entry.label,
                            kind = %envelope.kind,
                            "subscriber mailbox full — message dropped"
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        dead.push(entry.id);
                    }
                }
            }
        }

        if !dead.is_empty() {
            let mut map = self.subscribers.write();
            if let Some(entries) = map.get_mut(&topic) {
                entries.retain(|e| !dead.contains(&e.id));
                if entries.is_empty() {
                    map.remove(&topic);
                }
            }
            debug!(topic = %topic, count = dead.len(), "pruned closed bus subscribers");
        }

        delivered
    }

    /// Number of live subscribers on a topic (diagnostics).
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.subscribers.read().get(topic).map_or(0, Vec::len)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(topic: &str, n: u64) -> Envelope {
        Envelope::new(topic, "chat.message", json!({ "n": n }))
    }

    #[tokio::test]
    async fn publish_delivers_in_order() {
        let bus = EventBus::new(16);
        let (_sub, mut rx) = bus.subscribe("chat", "test");

        for n in 0..5 {
            assert_eq!(bus.publish(envelope("chat", n)), 1);
        }

        for n in 0..5 {
            let msg = rx.recv().await.unwrap();
            assert_eq!(msg.payload["n"], n);
        }
    }

    #[tokio::test]
    async fn fan_out_reaches_all_subscribers() {
        let bus = EventBus::new(16);
        let (_a, mut rx_a) = bus.subscribe("followers", "a");
        let (_b, mut rx_b) = bus.subscribe("followers", "b");

        assert_eq!(bus.publish(envelope("followers", 7)), 2);
        assert_eq!(rx_a.recv().await.unwrap().payload["n"], 7);
        assert_eq!(rx_b.recv().await.unwrap().payload["n"], 7);
    }

    #[tokio::test]
    async fn full_mailbox_drops_without_blocking() {
        let bus = EventBus::new(2);
        let (_sub, mut rx) = bus.subscribe("chat", "slow");

        assert_eq!(bus.publish(envelope("chat", 1)), 1);
        assert_eq!(bus.publish(envelope("chat", 2)), 1);
        // Mailbox is full now; this one is dropped.
        assert_eq!(bus.publish(envelope("chat", 3)), 0);

        assert_eq!(rx.recv().await.unwrap().payload["n"], 1);
        assert_eq!(rx.recv().await.unwrap().payload["n"], 2);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = EventBus::new(4);
        let (sub, mut rx) = bus.subscribe("chat", "test");
        bus.unsubscribe(&sub);

        assert_eq!(bus.publish(envelope("chat", 1)), 0);
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn unknown_topic_is_ignored() {
        let bus = EventBus::new(4);
        assert_eq!(bus.publish(envelope("nobody:listens", 1)), 0);
    }

    #[tokio::test]
    async fn dropped_receiver_is_pruned() {
        let bus = EventBus::new(4);
        let (_sub, rx) = bus.subscribe("chat", "gone");
        drop(rx);

        assert_eq!(bus.publish(envelope("chat", 1)), 0);
        assert_eq!(bus.subscriber_count("chat"), 0);
    }
}
