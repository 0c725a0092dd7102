//! Event bus for worker and pool diagnostics
//!
//! Pub/sub over a bounded Tokio broadcast channel. Publishing never blocks and
//! never fails: with no subscribers the event is dropped, and slow subscribers
//! observe `Lagged` on their receiver rather than backpressuring publishers.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use super::types::SwarmEvent;

/// Channel capacity for broadcast
const CHANNEL_CAPACITY: usize = 256;

/// Shared reference to an EventBus
pub type SharedEventBus = Arc<EventBus>;

/// Event bus over a bounded broadcast channel
pub struct EventBus {
    sender: broadcast::Sender<SwarmEvent>,
}

impl EventBus {
    /// Create a new event bus
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Create a shared reference to this event bus
    pub fn shared(self) -> SharedEventBus {
        Arc::new(self)
    }

    /// Publish an event to all subscribers
    pub fn publish(&self, event: SwarmEvent) {
        let event_type = event.event_type();
        match self.sender.send(event) {
            Ok(count) => debug!(event_type, receivers = count, "event published"),
            Err(_) => debug!(event_type, "event published (no receivers)"),
        }
    }

    /// Subscribe to receive events
    pub fn subscribe(&self) -> broadcast::Receiver<SwarmEvent> {
        self.sender.subscribe()
    }

    /// Get the number of current subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Event filter for selective subscription
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Filter by worker id
    pub worker_id: Option<String>,
    /// Filter by task id
    pub task_id: Option<String>,
    /// Filter by event types
    pub event_types: Option<Vec<String>>,
}

impl EventFilter {
    /// Create a new empty filter (matches all events)
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter by worker id
    pub fn worker(mut self, worker_id: &str) -> Self {
        self.worker_id = Some(worker_id.to_string());
        self
    }

    /// Filter by task id
    pub fn task(mut self, task_id: &str) -> Self {
        self.task_id = Some(task_id.to_string());
        self
    }

    /// Filter by event types
    pub fn types(mut self, event_types: Vec<&str>) -> Self {
        self.event_types = Some(event_types.into_iter().map(String::from).collect());
        self
    }

    /// Check if an event matches this filter
    pub fn matches(&self, event: &SwarmEvent) -> bool {
        if let Some(ref wid) = self.worker_id {
            if event.worker_id() != Some(wid.as_str()) {
                return false;
            }
        }
        if let Some(ref tid) = self.task_id {
            if event.task_id() != Some(tid.as_str()) {
                return false;
            }
        }
        if let Some(ref types) = self.event_types {
            if !types.iter().any(|t| t == event.event_type()) {
                return false;
            }
        }
        true
    }
}

/// Filtered event receiver that only yields matching events
pub struct FilteredReceiver {
    receiver: broadcast::Receiver<SwarmEvent>,
    filter: EventFilter,
}

impl FilteredReceiver {
    /// Create a new filtered receiver
    pub fn new(receiver: broadcast::Receiver<SwarmEvent>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    /// Receive the next matching event
    pub async fn recv(&mut self) -> Result<SwarmEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}

/// Extension trait for subscribing with filters
pub trait EventBusExt {
    /// Subscribe with a filter
    fn subscribe_filtered(&self, filter: EventFilter) -> FilteredReceiver;
}

impl EventBusExt for EventBus {
    fn subscribe_filtered(&self, filter: EventFilter) -> FilteredReceiver {
        FilteredReceiver::new(self.subscribe(), filter)
    }
}

impl EventBusExt for SharedEventBus {
    fn subscribe_filtered(&self, filter: EventFilter) -> FilteredReceiver {
        FilteredReceiver::new(self.subscribe(), filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn task_started(worker_id: &str, task_id: &str) -> SwarmEvent {
        SwarmEvent::TaskStarted {
            worker_id: worker_id.to_string(),
            task_id: task_id.to_string(),
            task_type: "testing".to_string(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe();

        bus.publish(task_started("w-1", "t-1"));

        let received = receiver.recv().await.unwrap();
        assert_eq!(received.event_type(), "task_started");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::new();
        bus.publish(task_started("w-1", "t-1"));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = EventBus::new().shared();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        assert_eq!(bus.subscriber_count(), 2);
        bus.publish(task_started("w-1", "t-1"));

        assert_eq!(rx1.recv().await.unwrap().event_type(), "task_started");
        assert_eq!(rx2.recv().await.unwrap().event_type(), "task_started");
    }

    #[test]
    fn test_event_filter_matching() {
        let filter = EventFilter::new()
            .worker("w-1")
            .types(vec!["task_started", "task_completed"]);

        assert!(filter.matches(&task_started("w-1", "t-1")));
        assert!(!filter.matches(&task_started("w-2", "t-1")));
        assert!(!filter.matches(&SwarmEvent::WorkerShutdown {
            worker_id: "w-1".to_string(),
            timestamp: Utc::now(),
        }));
    }

    #[tokio::test]
    async fn test_filtered_receiver_skips_non_matching() {
        let bus = EventBus::new();
        let mut filtered = bus.subscribe_filtered(EventFilter::new().task("target"));

        bus.publish(task_started("w-1", "other"));
        bus.publish(task_started("w-1", "target"));

        let event = filtered.recv().await.unwrap();
        assert_eq!(event.task_id(), Some("target"));
    }
}
