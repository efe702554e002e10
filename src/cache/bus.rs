//! Event Bus
//!
//! Fan-out of [`CacheEvent`]s to independent subscribers.
//!
//! # Delivery rules
//!
//! - `publish` never blocks and never fails
//! - Each subscriber has its own bounded FIFO queue
//! - On overflow the oldest Informational event is dropped, then the oldest
//!   Operational one
//! - Critical events are never dropped: if a queue holds nothing but Critical
//!   events the overflow goes to the [`EventFallback`] store
//! - Dropping a [`Subscription`] unregisters it

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::adapters::InMemoryFallback;
use crate::domain::events::{CacheEvent, EventType, Severity};
use crate::domain::ports::EventFallback;

// =============================================================================
// Filters
// =============================================================================

/// Selects which events a subscriber receives
#[derive(Debug, Clone)]
pub struct SubscriptionFilter {
    types: Option<HashSet<EventType>>,
    min_severity: Severity,
}

impl Default for SubscriptionFilter {
    fn default() -> Self {
        Self::all()
    }
}

impl SubscriptionFilter {
    /// Receive every event
    pub fn all() -> Self {
        Self {
            types: None,
            min_severity: Severity::Informational,
        }
    }

    /// Receive only the listed event types
    pub fn types(types: impl IntoIterator<Item = EventType>) -> Self {
        Self {
            types: Some(types.into_iter().collect()),
            min_severity: Severity::Informational,
        }
    }

    /// Drop events below `severity`
    pub fn min_severity(mut self, severity: Severity) -> Self {
        self.min_severity = severity;
        self
    }

    pub fn matches(&self, event: &CacheEvent) -> bool {
        if event.severity < self.min_severity {
            return false;
        }
        self.types
            .as_ref()
            .map(|t| t.contains(&event.event_type))
            .unwrap_or(true)
    }
}

// =============================================================================
// Subscriber Queue
// =============================================================================

struct SubscriberQueue {
    name: String,
    filter: SubscriptionFilter,
    capacity: usize,
    events: Mutex<VecDeque<CacheEvent>>,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
    persisted: AtomicU64,
}

/// What happened to an event offered to a full queue
enum Overflow {
    None,
    Dropped(Severity),
    Persist(CacheEvent),
}

impl SubscriberQueue {
    fn push(&self, event: CacheEvent) -> Overflow {
        let mut events = self.events.lock();
        events.push_back(event);
        if events.len() <= self.capacity {
            return Overflow::None;
        }

        for severity in [Severity::Informational, Severity::Operational] {
            if let Some(idx) = events.iter().position(|e| e.severity == severity) {
                events.remove(idx);
                return Overflow::Dropped(severity);
            }
        }

        // Only Critical events left; the newest one overflows to the fallback
        match events.pop_back() {
            Some(event) => Overflow::Persist(event),
            None => Overflow::None,
        }
    }

    fn pop(&self) -> Option<CacheEvent> {
        self.events.lock().pop_front()
    }
}

// =============================================================================
// Bus
// =============================================================================

/// Counters for the whole bus
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BusStats {
    pub subscribers: usize,
    pub published: u64,
    pub dropped: u64,
    pub persisted: u64,
}

struct BusInner {
    subscribers: RwLock<HashMap<u64, Arc<SubscriberQueue>>>,
    next_id: AtomicU64,
    capacity: usize,
    fallback: Arc<dyn EventFallback>,
    published: AtomicU64,
    dropped: AtomicU64,
    persisted: AtomicU64,
}

/// Publish/subscribe hub for cache events
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("capacity", &self.inner.capacity)
            .field("stats", &self.stats())
            .finish()
    }
}

impl EventBus {
    /// Create a bus with an in-memory critical-event fallback
    pub fn new(capacity: usize) -> Self {
        Self::with_fallback(capacity, Arc::new(InMemoryFallback::new()))
    }

    /// Create a bus persisting critical overflow to `fallback`
    pub fn with_fallback(capacity: usize, fallback: Arc<dyn EventFallback>) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                capacity: capacity.max(1),
                fallback,
                published: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                persisted: AtomicU64::new(0),
            }),
        }
    }

    /// Register a subscriber
    pub fn subscribe(&self, name: impl Into<String>, filter: SubscriptionFilter) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(SubscriberQueue {
            name: name.into(),
            filter,
            capacity: self.inner.capacity,
            events: Mutex::new(VecDeque::with_capacity(self.inner.capacity.min(1024))),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            persisted: AtomicU64::new(0),
        });
        self.inner.subscribers.write().insert(id, queue.clone());
        debug!(subscriber = %queue.name, id, "Subscriber registered");

        Subscription {
            id,
            queue,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Offer an event to every matching subscriber
    pub fn publish(&self, event: CacheEvent) {
        self.inner.published.fetch_add(1, Ordering::Relaxed);

        let subscribers: Vec<Arc<SubscriberQueue>> =
            self.inner.subscribers.read().values().cloned().collect();

        for queue in subscribers {
            if queue.closed.load(Ordering::Acquire) || !queue.filter.matches(&event) {
                continue;
            }
            match queue.push(event.clone()) {
                Overflow::None => {}
                Overflow::Dropped(severity) => {
                    queue.dropped.fetch_add(1, Ordering::Relaxed);
                    self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(subscriber = %queue.name, %severity, "Event queue full, dropped oldest event");
                }
                Overflow::Persist(critical) => {
                    queue.persisted.fetch_add(1, Ordering::Relaxed);
                    self.inner.persisted.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        subscriber = %queue.name,
                        event_type = %critical.event_type,
                        "Event queue saturated with critical events, persisting to fallback"
                    );
                    self.inner.fallback.persist(&queue.name, critical);
                }
            }
            queue.notify.notify_one();
        }
    }

    /// Wake every subscriber and make `recv` return `None` once drained
    pub fn close(&self) {
        for queue in self.inner.subscribers.read().values() {
            queue.closed.store(true, Ordering::Release);
            queue.notify.notify_one();
        }
    }

    /// Number of registered subscribers
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }

    /// The critical-event fallback store
    pub fn fallback(&self) -> &Arc<dyn EventFallback> {
        &self.inner.fallback
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            subscribers: self.subscriber_count(),
            published: self.inner.published.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
            persisted: self.inner.persisted.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Subscription
// =============================================================================

/// Receiving end of a subscriber queue. Unregisters itself when dropped.
pub struct Subscription {
    id: u64,
    queue: Arc<SubscriberQueue>,
    bus: Weak<BusInner>,
}

impl Subscription {
    /// Subscriber name given at registration
    pub fn name(&self) -> &str {
        &self.queue.name
    }

    /// Wait for the next event; `None` once the bus is closed and the queue drained
    pub async fn recv(&self) -> Option<CacheEvent> {
        loop {
            if let Some(event) = self.queue.pop() {
                return Some(event);
            }
            if self.queue.closed.load(Ordering::Acquire) || self.bus.strong_count() == 0 {
                return None;
            }
            self.queue.notify.notified().await;
        }
    }

    /// Take the next event without waiting
    pub fn try_recv(&self) -> Option<CacheEvent> {
        self.queue.pop()
    }

    /// Events currently queued
    pub fn pending(&self) -> usize {
        self.queue.events.lock().len()
    }

    /// Events dropped from this queue
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    /// Critical events diverted to the fallback store
    pub fn persisted(&self) -> u64 {
        self.queue.persisted.load(Ordering::Relaxed)
    }

    /// Take this subscriber's events from the fallback store
    pub fn drain_fallback(&self) -> Vec<CacheEvent> {
        self.bus
            .upgrade()
            .map(|bus| bus.fallback.drain(&self.queue.name))
            .unwrap_or_default()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.subscribers.write().remove(&self.id);
            debug!(subscriber = %self.queue.name, id = self.id, "Subscriber unregistered");
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("name", &self.queue.name)
            .field("pending", &self.pending())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn info(key: &str) -> CacheEvent {
        CacheEvent::get(key, true, Duration::from_micros(10))
    }

    fn critical(node: &str) -> CacheEvent {
        CacheEvent::node_down(node, "test")
    }

    fn operational(node: &str) -> CacheEvent {
        CacheEvent::node_recovered(node)
    }

    #[tokio::test]
    async fn test_fifo_delivery() {
        let bus = EventBus::new(16);
        let sub = bus.subscribe("s", SubscriptionFilter::all());

        bus.publish(info("a"));
        bus.publish(info("b"));
        bus.publish(info("c"));

        assert_eq!(sub.recv().await.unwrap().key(), Some("a"));
        assert_eq!(sub.recv().await.unwrap().key(), Some("b"));
        assert_eq!(sub.try_recv().unwrap().key(), Some("c"));
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn test_filters() {
        let bus = EventBus::new(16);
        let nodes = bus.subscribe("nodes", SubscriptionFilter::types([EventType::NodeDown]));
        let serious =
            bus.subscribe("serious", SubscriptionFilter::all().min_severity(Severity::Operational));

        bus.publish(info("k"));
        bus.publish(operational("n1"));
        bus.publish(critical("n1"));

        assert_eq!(nodes.pending(), 1);
        assert_eq!(nodes.try_recv().unwrap().event_type, EventType::NodeDown);
        assert_eq!(serious.pending(), 2);
    }

    #[test]
    fn test_drops_oldest_informational_first() {
        let bus = EventBus::new(3);
        let sub = bus.subscribe("s", SubscriptionFilter::all());

        bus.publish(operational("n1"));
        bus.publish(info("old"));
        bus.publish(critical("n2"));
        bus.publish(info("new"));

        assert_eq!(sub.dropped(), 1);
        let remaining: Vec<_> = std::iter::from_fn(|| sub.try_recv()).collect();
        assert_eq!(remaining.len(), 3);
        assert_eq!(remaining[0].event_type, EventType::NodeRecovered);
        assert_eq!(remaining[1].event_type, EventType::NodeDown);
        assert_eq!(remaining[2].key(), Some("new"));
    }

    #[test]
    fn test_drops_operational_when_no_informational() {
        let bus = EventBus::new(2);
        let sub = bus.subscribe("s", SubscriptionFilter::all());

        bus.publish(operational("n1"));
        bus.publish(critical("n2"));
        bus.publish(critical("n3"));

        assert_eq!(sub.dropped(), 1);
        let remaining: Vec<_> = std::iter::from_fn(|| sub.try_recv()).collect();
        assert!(remaining.iter().all(|e| e.is_critical()));
        assert_eq!(remaining.len(), 2);
    }

    #[test]
    fn test_critical_never_dropped() {
        let bus = EventBus::new(2);
        let sub = bus.subscribe("s", SubscriptionFilter::all());

        for i in 0..5 {
            bus.publish(critical(&format!("n{}", i)));
        }

        assert_eq!(sub.dropped(), 0);
        assert_eq!(sub.pending(), 2);
        assert_eq!(sub.persisted(), 3);
        assert_eq!(bus.stats().persisted, 3);

        let overflow = sub.drain_fallback();
        let nodes: Vec<_> = overflow.iter().filter_map(|e| e.node_id()).collect();
        assert_eq!(nodes, vec!["n2", "n3", "n4"]);
    }

    #[test]
    fn test_informational_rejected_by_full_critical_queue() {
        let bus = EventBus::new(1);
        let sub = bus.subscribe("s", SubscriptionFilter::all());

        bus.publish(critical("n1"));
        bus.publish(info("k"));

        assert_eq!(sub.dropped(), 1);
        assert_eq!(sub.try_recv().unwrap().event_type, EventType::NodeDown);
        assert!(bus.fallback().is_empty());
    }

    #[test]
    fn test_drop_unsubscribes() {
        let bus = EventBus::new(4);
        let sub = bus.subscribe("s", SubscriptionFilter::all());
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(info("k"));
    }

    #[tokio::test]
    async fn test_recv_wakes_on_publish() {
        let bus = EventBus::new(4);
        let sub = bus.subscribe("s", SubscriptionFilter::all());

        let publisher = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            publisher.publish(critical("n1"));
        });

        let event = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.node_id(), Some("n1"));
    }

    #[tokio::test]
    async fn test_close_ends_recv() {
        let bus = EventBus::new(4);
        let sub = bus.subscribe("s", SubscriptionFilter::all());
        bus.publish(info("last"));
        bus.close();

        assert!(sub.recv().await.is_some());
        assert!(sub.recv().await.is_none());
    }
}
