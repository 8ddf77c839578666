//! Event bus for cross-component notification
//!
//! Device gateways publish property updates here, and every task publishes
//! its progress snapshot here. Subscribers pick the topics they care about.
//!
//! # Features
//!
//! - **Sequence Numbers**: each event gets a unique, monotonically increasing ID
//! - **Topic Filtering**: subscribe to one topic instead of the whole stream
//! - **Overflow Handling**: a lagging subscriber skips ahead, and the drop is
//!   logged and counted
//!
//! The bus is a broadcast channel, so events are delivered in publish order to
//! every subscriber and a subscriber only sees events published after it
//! subscribed.

use crate::autofocus::AutofocusEvent;
use crate::capture::CaptureEvent;
use crate::darv::DarvEvent;
use crate::device::{DeviceEvent, PropertyUpdate};
use crate::flat_wizard::FlatWizardEvent;
use crate::polar_align::TppaEvent;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Default event buffer size.
///
/// Sized for bursts such as a device streaming exposure countdowns while
/// several tasks republish progress. A receiver that falls further behind
/// than this gets a `Lagged` error and skips to the latest events.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 4096;

/// Event topics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    Device,
    Capture,
    Autofocus,
    FlatWizard,
    PolarAlignment,
    Darv,
}

/// Event payloads
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    Device(DeviceEvent),
    Capture(CaptureEvent),
    Autofocus(AutofocusEvent),
    FlatWizard(FlatWizardEvent),
    PolarAlignment(TppaEvent),
    Darv(DarvEvent),
}

impl EventPayload {
    pub fn topic(&self) -> Topic {
        match self {
            EventPayload::Device(_) => Topic::Device,
            EventPayload::Capture(_) => Topic::Capture,
            EventPayload::Autofocus(_) => Topic::Autofocus,
            EventPayload::FlatWizard(_) => Topic::FlatWizard,
            EventPayload::PolarAlignment(_) => Topic::PolarAlignment,
            EventPayload::Darv(_) => Topic::Darv,
        }
    }
}

/// An event as delivered to subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEvent {
    /// Unique, monotonically increasing
    pub event_id: u64,
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
    pub payload: EventPayload,
}

/// Event bus statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventBusStats {
    pub events_published: u64,
    pub events_dropped: u64,
    pub subscriber_count: usize,
}

/// Broadcast event bus
#[derive(Debug)]
pub struct EventBus {
    sender: broadcast::Sender<BusEvent>,
    sequence: AtomicU64,
    events_published: AtomicU64,
    events_dropped: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            sequence: AtomicU64::new(1),
            events_published: AtomicU64::new(0),
            events_dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    /// Publish a payload to all subscribers.
    /// Returns the event ID assigned to it.
    pub fn publish(&self, payload: EventPayload) -> u64 {
        let event_id = self.next_sequence();
        let event = BusEvent {
            event_id,
            timestamp: chrono::Utc::now().timestamp_millis(),
            payload,
        };
        self.events_published.fetch_add(1, Ordering::Relaxed);

        // No receivers is fine
        let _ = self.sender.send(event);

        event_id
    }

    /// Publish a device property update
    pub fn publish_update(&self, update: PropertyUpdate) -> u64 {
        self.publish(EventPayload::Device(DeviceEvent::Updated(update)))
    }

    /// Subscribe to every topic
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
            topic: None,
            dropped: self.events_dropped.clone(),
        }
    }

    /// Subscribe to one topic
    pub fn subscribe_topic(&self, topic: Topic) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
            topic: Some(topic),
            dropped: self.events_dropped.clone(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn stats(&self) -> EventBusStats {
        EventBusStats {
            events_published: self.events_published.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            subscriber_count: self.sender.receiver_count(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

/// Thread-safe shared event bus
pub type SharedEventBus = Arc<EventBus>;

/// Receiving end of the bus, optionally filtered to one topic
#[derive(Debug)]
pub struct Subscription {
    receiver: broadcast::Receiver<BusEvent>,
    topic: Option<Topic>,
    dropped: Arc<AtomicU64>,
}

impl Subscription {
    /// Next matching event. `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if self.topic.map_or(true, |t| t == event.payload.topic()) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    self.dropped.fetch_add(skipped, Ordering::Relaxed);
                    tracing::warn!("Event subscriber lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next property update
    pub async fn recv_update(&mut self) -> Option<PropertyUpdate> {
        loop {
            let event = self.recv().await?;
            if let EventPayload::Device(DeviceEvent::Updated(update)) = event.payload {
                return Some(update);
            }
        }
    }

    /// Matching event already queued, without waiting
    pub fn try_recv(&mut self) -> Option<BusEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if self.topic.map_or(true, |t| t == event.payload.topic()) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    self.dropped.fetch_add(skipped, Ordering::Relaxed);
                }
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceProperty, FocuserProperty, PropertyState};

    fn position(value: i32) -> PropertyUpdate {
        PropertyUpdate::new(
            "focuser",
            DeviceProperty::Focuser(FocuserProperty::Position(value)),
            PropertyState::Ok,
        )
    }

    #[tokio::test]
    async fn test_sequence_numbers_increase() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe();
        let first = bus.publish_update(position(1));
        let second = bus.publish_update(position(2));
        assert!(second > first);

        assert_eq!(sub.recv().await.map(|e| e.event_id), Some(first));
        assert_eq!(sub.recv().await.map(|e| e.event_id), Some(second));
    }

    #[tokio::test]
    async fn test_topic_filter() {
        let bus = EventBus::default();
        let mut darv = bus.subscribe_topic(Topic::Darv);
        let mut devices = bus.subscribe_topic(Topic::Device);

        bus.publish_update(position(7));

        assert!(darv.try_recv().is_none());
        assert_eq!(devices.recv_update().await, Some(position(7)));
    }

    #[tokio::test]
    async fn test_lagging_subscriber_counts_drops() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe();
        for i in 0..5 {
            bus.publish_update(position(i));
        }
        // Oldest events were overwritten; the subscriber resumes at the newest
        assert_eq!(sub.recv_update().await, Some(position(3)));
        assert_eq!(bus.stats().events_dropped, 3);
        assert_eq!(bus.stats().events_published, 5);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::default();
        bus.publish_update(position(1));
        assert_eq!(bus.subscriber_count(), 0);
    }
}
