//! Broadcast event bus for deliberation lifecycle events.
//!
//! Fan-out is lossy by design: publishing with no subscribers is fine, and
//! a slow subscriber only lags its own receiver. The status view, not the
//! bus, is the authoritative query surface.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::debug;

use super::types::DeliberationEvent;

/// Channel capacity for broadcast.
const CHANNEL_CAPACITY: usize = 256;

/// Shared reference to an [`EventBus`].
pub type SharedEventBus = Arc<EventBus>;

/// Event bus over a tokio broadcast channel.
pub struct EventBus {
    sender: broadcast::Sender<DeliberationEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Create a shared reference to this bus.
    pub fn shared(self) -> SharedEventBus {
        Arc::new(self)
    }

    /// Publish an event to all subscribers. No receivers is not an error.
    pub fn publish(&self, event: DeliberationEvent) {
        let event_type = event.event_type();
        match self.sender.send(event) {
            Ok(count) => debug!(event_type, receivers = count, "event published"),
            Err(_) => debug!(event_type, "event published (no receivers)"),
        }
    }

    /// Subscribe to receive events from this point on.
    pub fn subscribe(&self) -> broadcast::Receiver<DeliberationEvent> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
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
    use chrono::Utc;

    #[tokio::test]
    async fn test_publish_and_receive() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(DeliberationEvent::Finalized {
            deliberation_id: "d-1".to_string(),
            timestamp: Utc::now(),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type(), "finalized");
    }

    #[test]
    fn test_publish_without_subscribers_is_ok() {
        let bus = EventBus::new();
        bus.publish(DeliberationEvent::Finalized {
            deliberation_id: "d-1".to_string(),
            timestamp: Utc::now(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }
}
