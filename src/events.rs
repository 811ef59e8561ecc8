//! Event bus module
//!
//! In-process publish/subscribe over typed events. Publishing is
//! non-blocking: each subscriber owns a bounded queue and events are
//! dropped for a subscriber whose queue is full, so a slow consumer can
//! never stall the supervisor.

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};
use tokio::sync::mpsc;

/// Kinds of events the supervisor emits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Connected,
    Disconnected,
    Reconnecting,
    Failover,
    MetricsUpdate,
    Error,
    StateChange,
    PrimaryChange,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EventType::Connected => "connected",
            EventType::Disconnected => "disconnected",
            EventType::Reconnecting => "reconnecting",
            EventType::Failover => "failover",
            EventType::MetricsUpdate => "metrics_update",
            EventType::Error => "error",
            EventType::StateChange => "state_change",
            EventType::PrimaryChange => "primary_change",
        };
        write!(f, "{}", name)
    }
}

/// Immutable event value delivered to subscribers
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub event_type: EventType,
    /// Id of the connection the event concerns; empty for pool-wide events
    pub conn_id: String,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    /// Event-specific payload (e.g. old/new ids for a failover)
    pub data: serde_json::Value,
}

impl Event {
    pub fn new(
        event_type: EventType,
        conn_id: impl Into<String>,
        message: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            event_type,
            conn_id: conn_id.into(),
            timestamp: Utc::now(),
            message: message.into(),
            data,
        }
    }
}

/// Predicate deciding whether a subscriber receives an event
pub type EventFilter = Box<dyn Fn(&Event) -> bool + Send + Sync>;

struct SubscriberEntry {
    tx: mpsc::Sender<Event>,
    filter: Option<EventFilter>,
}

/// In-process event fan-out with bounded per-subscriber queues
///
/// Subscribers are keyed by id. Dropping the sender on unsubscribe/close
/// signals end-of-stream to the consumer's receiver.
pub struct EventBus {
    subscribers: RwLock<HashMap<String, SubscriberEntry>>,
    capacity: usize,
    closed: AtomicBool,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Register a subscriber and return its event stream.
    ///
    /// An existing live registration under the same id is kept; callers
    /// must unsubscribe before reusing an id. When the id is taken the
    /// returned receiver yields end-of-stream immediately.
    pub fn subscribe(&self, id: impl Into<String>, filter: Option<EventFilter>) -> mpsc::Receiver<Event> {
        let id = id.into();
        let (tx, rx) = mpsc::channel(self.capacity);

        if self.closed.load(Ordering::SeqCst) {
            warn!("Subscribe on closed event bus: {}", id);
            return rx;
        }

        let mut subs = self.subscribers.write().unwrap();
        match subs.entry(id) {
            std::collections::hash_map::Entry::Occupied(entry) => {
                warn!(
                    "Subscriber id already registered, keeping prior registration: {}",
                    entry.key()
                );
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(SubscriberEntry { tx, filter });
            }
        }

        rx
    }

    /// Deliver an event to every matching subscriber.
    ///
    /// Never blocks: a subscriber whose queue is full loses the event and
    /// no other subscriber is affected. Publish after close is a no-op.
    pub fn publish(&self, event: Event) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        let subs = self.subscribers.read().unwrap();
        for (id, entry) in subs.iter() {
            if let Some(filter) = &entry.filter {
                if !filter(&event) {
                    continue;
                }
            }

            match entry.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!("Subscriber {} queue full, dropping {} event", id, event.event_type);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("Subscriber {} receiver gone, dropping {} event", id, event.event_type);
                }
            }
        }
    }

    /// Remove a subscriber. Its receiver observes end-of-stream once any
    /// already-queued events are drained; nothing further is delivered.
    pub fn unsubscribe(&self, id: &str) {
        let mut subs = self.subscribers.write().unwrap();
        if subs.remove(id).is_none() {
            debug!("Unsubscribe for unknown subscriber: {}", id);
        }
    }

    /// Close every subscriber stream and clear the registry.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut subs = self.subscribers.write().unwrap();
        subs.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().unwrap().len()
    }
}

/// Bounded in-memory ring of recent events
///
/// Off the hot path; the daemon appends events here so operators can
/// retrieve recent history by type without replaying the log file.
pub struct EventLogger {
    events: Mutex<VecDeque<Event>>,
    capacity: usize,
}

impl EventLogger {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Append an event, evicting the oldest once at capacity.
    pub fn log(&self, event: Event) {
        let mut events = self.events.lock().unwrap();
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Most recent events, oldest first, at most `limit`.
    pub fn recent(&self, limit: usize) -> Vec<Event> {
        let events = self.events.lock().unwrap();
        let skip = events.len().saturating_sub(limit);
        events.iter().skip(skip).cloned().collect()
    }

    /// Recent events of one type, oldest first.
    pub fn by_type(&self, event_type: EventType) -> Vec<Event> {
        let events = self.events.lock().unwrap();
        events
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(event_type: EventType, conn_id: &str) -> Event {
        Event::new(event_type, conn_id, "test", serde_json::json!({}))
    }

    #[tokio::test]
    async fn subscriber_receives_published_events() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe("sub", None);

        bus.publish(event(EventType::Connected, "ssh-1"));

        let received = rx.recv().await.expect("event should be delivered");
        assert_eq!(received.event_type, EventType::Connected);
        assert_eq!(received.conn_id, "ssh-1");
    }

    #[tokio::test]
    async fn filter_limits_delivery_to_matching_events() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe(
            "filtered",
            Some(Box::new(|e: &Event| e.conn_id == "ssh-2")),
        );

        bus.publish(event(EventType::Connected, "ssh-1"));
        bus.publish(event(EventType::Connected, "ssh-2"));

        let received = rx.recv().await.expect("matching event should arrive");
        assert_eq!(received.conn_id, "ssh-2");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_queue_drops_events_without_blocking() {
        let bus = EventBus::new(1);
        let mut rx = bus.subscribe("slow", None);

        // Publisher must return promptly for every publish even though the
        // subscriber never reads.
        for i in 0..100 {
            bus.publish(event(EventType::MetricsUpdate, &format!("c-{}", i)));
        }

        // Exactly one event fit the queue.
        let first = rx.try_recv().expect("one event should be buffered");
        assert_eq!(first.conn_id, "c-0");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribe_ends_the_stream() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe("gone", None);

        bus.unsubscribe("gone");
        bus.publish(event(EventType::Connected, "ssh-1"));

        // End-of-stream, not a pending event.
        assert!(rx.recv().await.is_none());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn duplicate_subscribe_keeps_prior_registration() {
        let bus = EventBus::new(4);
        let mut first = bus.subscribe("dup", None);
        let mut second = bus.subscribe("dup", None);

        bus.publish(event(EventType::Connected, "ssh-1"));

        assert!(first.recv().await.is_some());
        assert!(second.recv().await.is_none());
    }

    #[tokio::test]
    async fn close_silences_the_bus() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe("sub", None);

        bus.close();
        bus.publish(event(EventType::Connected, "ssh-1"));

        assert!(rx.recv().await.is_none());

        // Subscribing after close yields an immediately-closed stream.
        let mut late = bus.subscribe("late", None);
        assert!(late.recv().await.is_none());
    }

    #[test]
    fn event_logger_evicts_oldest_at_capacity() {
        let logger = EventLogger::new(3);
        for i in 0..5 {
            logger.log(event(EventType::Connected, &format!("c-{}", i)));
        }

        let recent = logger.recent(10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].conn_id, "c-2");
        assert_eq!(recent[2].conn_id, "c-4");
    }

    #[test]
    fn event_logger_filters_by_type() {
        let logger = EventLogger::new(8);
        logger.log(event(EventType::Connected, "a"));
        logger.log(event(EventType::Failover, "b"));
        logger.log(event(EventType::Connected, "c"));

        let failovers = logger.by_type(EventType::Failover);
        assert_eq!(failovers.len(), 1);
        assert_eq!(failovers[0].conn_id, "b");
    }
}
