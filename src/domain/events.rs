//! Domain Events
//!
//! Immutable records of lifecycle and health changes inside the cache engine.
//! Events are published on the [`EventBus`](crate::cache::EventBus) and consumed
//! by external monitoring; the engine never mutates an event after creation.
//!
//! # Example
//!
//! ```
//! use ringcache::domain::events::{CacheEvent, EventType, Severity};
//!
//! let event = CacheEvent::node_down("node-a", "connection refused");
//! assert_eq!(event.event_type, EventType::NodeDown);
//! assert_eq!(event.severity, Severity::Critical);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Kind of event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    Get,
    Set,
    Delete,
    NodeDown,
    NodeRecovered,
    Rebalance,
    Backup,
    Restore,
    Error,
    /// Summary of one eviction pass
    Eviction,
}

impl EventType {
    /// Default severity for this kind of event
    pub fn default_severity(&self) -> Severity {
        match self {
            EventType::NodeDown | EventType::Error => Severity::Critical,
            EventType::NodeRecovered
            | EventType::Rebalance
            | EventType::Backup
            | EventType::Restore
            | EventType::Eviction => Severity::Operational,
            EventType::Get | EventType::Set | EventType::Delete => Severity::Informational,
        }
    }

    /// Get the event type name.
    pub fn name(&self) -> &'static str {
        match self {
            EventType::Get => "Get",
            EventType::Set => "Set",
            EventType::Delete => "Delete",
            EventType::NodeDown => "NodeDown",
            EventType::NodeRecovered => "NodeRecovered",
            EventType::Rebalance => "Rebalance",
            EventType::Backup => "Backup",
            EventType::Restore => "Restore",
            EventType::Error => "Error",
            EventType::Eviction => "Eviction",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Event severity, ordered from least to most important
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Informational,
    Operational,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Informational => write!(f, "informational"),
            Severity::Operational => write!(f, "operational"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// Event payload. Every field is optional; producers fill what applies.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_us: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Whether a read found the key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hit: Option<bool>,
    /// Entries removed (eviction, flush, migration, restore)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    /// Bytes freed by an eviction pass
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
}

/// Event emitted by the cache engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEvent {
    pub event_type: EventType,
    pub severity: Severity,
    pub payload: EventPayload,
    pub timestamp: DateTime<Utc>,
}

impl CacheEvent {
    /// Create an event with the default severity for its type
    pub fn new(event_type: EventType, payload: EventPayload) -> Self {
        Self {
            event_type,
            severity: event_type.default_severity(),
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Override the severity
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Whether this event is critical
    pub fn is_critical(&self) -> bool {
        self.severity == Severity::Critical
    }

    /// Key the event refers to, if any
    pub fn key(&self) -> Option<&str> {
        self.payload.key.as_deref()
    }

    /// Node the event refers to, if any
    pub fn node_id(&self) -> Option<&str> {
        self.payload.node_id.as_deref()
    }
}

// =============================================================================
// Event Builders
// =============================================================================

impl CacheEvent {
    /// A read completed (hit or miss).
    pub fn get(key: impl Into<String>, hit: bool, latency: Duration) -> Self {
        Self::new(
            EventType::Get,
            EventPayload {
                key: Some(key.into()),
                hit: Some(hit),
                latency_us: Some(latency.as_micros() as u64),
                ..Default::default()
            },
        )
    }

    /// A write reached quorum.
    pub fn set(key: impl Into<String>, acks: usize, latency: Duration) -> Self {
        Self::new(
            EventType::Set,
            EventPayload {
                key: Some(key.into()),
                count: Some(acks as u64),
                latency_us: Some(latency.as_micros() as u64),
                ..Default::default()
            },
        )
    }

    /// A tombstone reached quorum.
    pub fn delete(key: impl Into<String>, existed: bool, latency: Duration) -> Self {
        Self::new(
            EventType::Delete,
            EventPayload {
                key: Some(key.into()),
                hit: Some(existed),
                latency_us: Some(latency.as_micros() as u64),
                ..Default::default()
            },
        )
    }

    /// A node's breaker opened.
    pub fn node_down(node_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(
            EventType::NodeDown,
            EventPayload {
                node_id: Some(node_id.into()),
                detail: Some(reason.into()),
                ..Default::default()
            },
        )
    }

    /// A node's breaker closed after a successful probe.
    pub fn node_recovered(node_id: impl Into<String>) -> Self {
        Self::new(
            EventType::NodeRecovered,
            EventPayload {
                node_id: Some(node_id.into()),
                ..Default::default()
            },
        )
    }

    /// The ring topology changed.
    pub fn rebalance(node_id: impl Into<String>, detail: impl Into<String>, moved: u64) -> Self {
        Self::new(
            EventType::Rebalance,
            EventPayload {
                node_id: Some(node_id.into()),
                detail: Some(detail.into()),
                count: Some(moved),
                ..Default::default()
            },
        )
    }

    /// An eviction pass finished.
    pub fn eviction(removed: u64, bytes_freed: u64, duration: Duration) -> Self {
        Self::new(
            EventType::Eviction,
            EventPayload {
                count: Some(removed),
                bytes: Some(bytes_freed),
                latency_us: Some(duration.as_micros() as u64),
                ..Default::default()
            },
        )
    }

    /// A backup snapshot was written.
    pub fn backup(location: impl Into<String>, entries: u64) -> Self {
        Self::new(
            EventType::Backup,
            EventPayload {
                detail: Some(location.into()),
                count: Some(entries),
                ..Default::default()
            },
        )
    }

    /// A backup snapshot was restored.
    pub fn restore(location: impl Into<String>, entries: u64) -> Self {
        Self::new(
            EventType::Restore,
            EventPayload {
                detail: Some(location.into()),
                count: Some(entries),
                ..Default::default()
            },
        )
    }

    /// Quorum degraded or lost on an operation.
    pub fn quorum_degraded(key: impl Into<String>, acks: usize, required: usize) -> Self {
        Self::new(
            EventType::Error,
            EventPayload {
                key: Some(key.into()),
                count: Some(acks as u64),
                detail: Some(format!("{} of {} acknowledgements", acks, required)),
                ..Default::default()
            },
        )
        .with_severity(Severity::Operational)
    }

    /// Node-level failure observed on a call.
    pub fn node_error(node_id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(
            EventType::Error,
            EventPayload {
                node_id: Some(node_id.into()),
                detail: Some(detail.into()),
                ..Default::default()
            },
        )
    }

    /// Payload-level failure (integrity, encryption, serialization).
    pub fn payload_error(key: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(
            EventType::Error,
            EventPayload {
                key: Some(key.into()),
                detail: Some(detail.into()),
                ..Default::default()
            },
        )
    }
}
