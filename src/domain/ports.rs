//! Domain Ports (Port/Adapter Pattern)
//!
//! Abstractions the cache engine depends on. Adapters implement these traits to
//! connect the engine to a concrete key-value store (Redis-style,
//! Memcached-style, in-memory) or to a durable event fallback.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Cache Engine                            │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │        BackendStore        │      EventFallback      │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Adapters                              │
//! │  InMemoryBackend │ FaultyBackend │ InMemoryFallback         │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use super::events::CacheEvent;
use crate::error::Result;

// =============================================================================
// Value Objects
// =============================================================================

/// Storage usage reported by a backend node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendUsage {
    /// Number of stored keys
    pub entries: u64,
    /// Bytes of stored values
    pub used_bytes: u64,
}

/// Outcome of a conditional versioned write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionalWrite {
    /// The value was stored
    Stored,
    /// An equal or newer version was already present; nothing was written
    Superseded,
}

// =============================================================================
// Backend Store Port
// =============================================================================

/// Key-value protocol client for one physical backend node.
///
/// The engine depends only on this trait, never on a backend's wire format.
/// Implementations must treat values as opaque bytes and swap them atomically:
/// a concurrent reader sees either the old or the new value, never a mix.
///
/// "Key not found" is `Ok(None)` / `Ok(false)`, not an error. Connection
/// failures must surface as [`Error::NodeUnavailable`](crate::Error::NodeUnavailable).
#[async_trait]
pub trait BackendStore: Send + Sync {
    /// Get the value stored under `key`
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Store `value` under `key`, expiring after `ttl` if given
    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()>;

    /// Delete `key`, returning whether it existed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Check if `key` exists
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Get several keys at once, in the order requested
    async fn multi_get(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push(self.get(key).await?);
        }
        Ok(values)
    }

    /// Store `value` only if no value with `version` or newer is present.
    ///
    /// Backends with server-side scripting or CAS should override this so the
    /// check and the swap are atomic. The default stores unconditionally; the
    /// engine performs its own version check before calling it.
    async fn set_versioned(
        &self,
        key: &str,
        value: Bytes,
        _version: u64,
        ttl: Option<Duration>,
    ) -> Result<ConditionalWrite> {
        self.set(key, value, ttl).await?;
        Ok(ConditionalWrite::Stored)
    }

    /// List stored keys (used by eviction, migration and backup scans)
    async fn keys(&self) -> Result<Vec<String>>;

    /// Report storage usage
    async fn usage(&self) -> Result<BackendUsage>;

    /// Remove every key, returning how many were removed
    async fn flush(&self) -> Result<u64>;

    /// Liveness probe
    async fn ping(&self) -> Result<()>;
}

// =============================================================================
// Event Fallback Port
// =============================================================================

/// Durable sink for critical events that could not be queued.
///
/// The event bus never drops a critical event; when a subscriber's queue is
/// saturated with critical events the overflow is handed to this store.
pub trait EventFallback: Send + Sync {
    /// Persist an event that did not fit in `subscriber`'s queue
    fn persist(&self, subscriber: &str, event: CacheEvent);

    /// Take all persisted events for `subscriber`, oldest first
    fn drain(&self, subscriber: &str) -> Vec<CacheEvent>;

    /// Number of persisted events across all subscribers
    fn len(&self) -> usize;

    /// Whether the store is empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
