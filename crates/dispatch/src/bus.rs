//! The pub/sub collaborator used for fan-out that doesn't belong on a
//! direct return path: session-mode changes, available-commands, and
//! (eventually) anything a UI layer wants to tail.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::broadcast;

/// One channel per subject; callers choose their own subject naming
/// convention (`session.{id}.mode`, `session.{id}.commands`, ...).
#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, subject: &str, payload: serde_json::Value);
    fn subscribe(&self, subject: &str) -> broadcast::Receiver<serde_json::Value>;
}

const CHANNEL_CAPACITY: usize = 256;

/// Keeps a `broadcast::Sender` per subject rather than one global
/// channel. A subject with no subscribers still accepts publishes;
/// they're simply dropped.
pub struct InMemoryBus {
    senders: Mutex<HashMap<String, broadcast::Sender<serde_json::Value>>>,
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self {
            senders: Mutex::new(HashMap::new()),
        }
    }

    fn sender_for(&self, subject: &str) -> broadcast::Sender<serde_json::Value> {
        self.senders
            .lock()
            .entry(subject.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl Bus for InMemoryBus {
    async fn publish(&self, subject: &str, payload: serde_json::Value) {
        // No receivers is not an error: a subject nobody has subscribed
        // to yet simply has nowhere for the message to land.
        let _ = self.sender_for(subject).send(payload);
    }

    fn subscribe(&self, subject: &str) -> broadcast::Receiver<serde_json::Value> {
        self.sender_for(subject).subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_payload() {
        let bus = InMemoryBus::new();
        let mut rx = bus.subscribe("session.s1.mode");
        bus.publish("session.s1.mode", serde_json::json!({"mode": "plan"})).await;
        let received = rx.recv().await.unwrap();
        assert_eq!(received, serde_json::json!({"mode": "plan"}));
    }

    #[tokio::test]
    async fn distinct_subjects_do_not_cross_talk() {
        let bus = InMemoryBus::new();
        let mut a = bus.subscribe("a");
        let mut b = bus.subscribe("b");
        bus.publish("a", serde_json::json!(1)).await;
        assert_eq!(a.recv().await.unwrap(), serde_json::json!(1));
        assert!(b.try_recv().is_err());
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_error() {
        let bus = InMemoryBus::new();
        bus.publish("nobody.listening", serde_json::json!("x")).await;
    }
}
