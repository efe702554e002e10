//! Event Logger Adapter
//!
//! Mirrors bus events into the tracing/logging system. Useful for
//! development, debugging and audit trails.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::bus::Subscription;
use crate::domain::events::{CacheEvent, Severity};

/// Logs every event received on a subscription.
///
/// Critical events log at warn, Operational at info and Informational at
/// debug unless `info_level` raises them.
#[derive(Debug, Clone, Default)]
pub struct EventLogger {
    info_level: bool,
}

impl EventLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log Informational events at info level instead of debug
    pub fn info_level() -> Self {
        Self { info_level: true }
    }

    /// Log a single event
    pub fn log(&self, event: &CacheEvent) {
        let event_type = event.event_type;
        let json = serde_json::to_string(event).unwrap_or_else(|_| format!("{:?}", event));

        match event.severity {
            Severity::Critical => warn!(event_type = %event_type, event = %json, "Cache event"),
            Severity::Operational => info!(event_type = %event_type, event = %json, "Cache event"),
            Severity::Informational if self.info_level => {
                info!(event_type = %event_type, event = %json, "Cache event")
            }
            Severity::Informational => {
                debug!(event_type = %event_type, event = %json, "Cache event")
            }
        }
    }

    /// Drain `subscription` until the bus closes or `shutdown` fires
    pub fn spawn(self, subscription: Subscription, shutdown: CancellationToken) -> JoinHandle<u64> {
        tokio::spawn(async move {
            let mut logged = 0u64;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    next = subscription.recv() => match next {
                        Some(event) => {
                            self.log(&event);
                            logged += 1;
                        }
                        None => break,
                    },
                }
            }
            debug!(subscriber = subscription.name(), logged, "Event logger stopped");
            logged
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::bus::{EventBus, SubscriptionFilter};
    use std::time::Duration;

    #[tokio::test]
    async fn test_logger_drains_until_close() {
        let bus = EventBus::new(16);
        let sub = bus.subscribe("logger", SubscriptionFilter::all());
        let handle = EventLogger::new().spawn(sub, CancellationToken::new());

        bus.publish(CacheEvent::node_down("n1", "refused"));
        bus.publish(CacheEvent::get("k", false, Duration::from_micros(5)));
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.close();

        let logged = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(logged, 2);
    }

    #[tokio::test]
    async fn test_logger_stops_on_cancel() {
        let bus = EventBus::new(16);
        let sub = bus.subscribe("logger", SubscriptionFilter::all());
        let token = CancellationToken::new();
        let handle = EventLogger::info_level().spawn(sub, token.clone());

        token.cancel();
        let logged = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(logged, 0);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
