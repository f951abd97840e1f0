use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEvent {
    pub event: String,
    pub payload: serde_json::Value,
}

/// Event fan-out keyed by event name, with an extra wildcard channel that
/// sees everything.
///
/// Subscribers receive broadcast channels rather than registering callbacks
/// so that consumers can `select!` over events next to their other I/O.
/// Per-channel delivery order matches publish order; a slow subscriber that
/// lags past the channel capacity loses the oldest events, never the stream
/// position of other subscribers.
pub struct EventBus {
    channels: RwLock<HashMap<String, broadcast::Sender<BusEvent>>>,
    wildcard: broadcast::Sender<BusEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (wildcard, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            channels: RwLock::new(HashMap::new()),
            wildcard,
        }
    }

    pub async fn publish(&self, event: &str, payload: serde_json::Value) {
        let bus_event = BusEvent {
            event: event.to_string(),
            payload,
        };

        // send() errors only when no receiver exists, which is fine.
        let _ = self.wildcard.send(bus_event.clone());

        let channels = self.channels.read().await;
        if let Some(tx) = channels.get(event) {
            let _ = tx.send(bus_event);
        }
    }

    /// Subscribe to events with a specific name. The channel is created on
    /// first subscription and kept for the lifetime of the bus.
    pub async fn subscribe(&self, event: &str) -> broadcast::Receiver<BusEvent> {
        let mut channels = self.channels.write().await;
        channels
            .entry(event.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<BusEvent> {
        self.wildcard.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn named_subscriber_receives_matching_events_only() {
        let bus = EventBus::new();
        let mut chat_rx = bus.subscribe("chat").await;

        bus.publish("presence", json!({"x": 1})).await;
        bus.publish("chat", json!({"sessionKey": "s1"})).await;

        let event = chat_rx.recv().await.unwrap();
        assert_eq!(event.event, "chat");
        assert_eq!(event.payload["sessionKey"], "s1");
        assert!(chat_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn wildcard_subscriber_sees_everything() {
        let bus = EventBus::new();
        let mut all_rx = bus.subscribe_all();

        bus.publish("a", json!(1)).await;
        bus.publish("b", json!(2)).await;

        assert_eq!(all_rx.recv().await.unwrap().event, "a");
        assert_eq!(all_rx.recv().await.unwrap().event, "b");
    }

    #[tokio::test]
    async fn events_preserve_publish_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe("chat").await;

        for i in 0..10 {
            bus.publish("chat", json!({"seq": i})).await;
        }
        for i in 0..10 {
            assert_eq!(rx.recv().await.unwrap().payload["seq"], i);
        }
    }
}
