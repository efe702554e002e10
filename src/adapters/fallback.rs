//! In-memory critical event fallback.
//!
//! Keeps the overflow of saturated subscriber queues, grouped per subscriber,
//! until the subscriber drains it.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::domain::events::CacheEvent;
use crate::domain::ports::EventFallback;

/// Process-local `EventFallback`
#[derive(Debug, Default)]
pub struct InMemoryFallback {
    events: Mutex<HashMap<String, Vec<CacheEvent>>>,
}

impl InMemoryFallback {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventFallback for InMemoryFallback {
    fn persist(&self, subscriber: &str, event: CacheEvent) {
        self.events
            .lock()
            .entry(subscriber.to_string())
            .or_default()
            .push(event);
    }

    fn drain(&self, subscriber: &str) -> Vec<CacheEvent> {
        self.events.lock().remove(subscriber).unwrap_or_default()
    }

    fn len(&self) -> usize {
        self.events.lock().values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persist_and_drain_per_subscriber() {
        let fallback = InMemoryFallback::new();
        fallback.persist("a", CacheEvent::node_down("n1", "x"));
        fallback.persist("a", CacheEvent::node_down("n2", "x"));
        fallback.persist("b", CacheEvent::node_down("n3", "x"));
        assert_eq!(fallback.len(), 3);

        let a = fallback.drain("a");
        assert_eq!(a.len(), 2);
        assert_eq!(a[0].node_id(), Some("n1"));
        assert_eq!(fallback.len(), 1);
        assert!(fallback.drain("a").is_empty());
    }
}
