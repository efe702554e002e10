//! In-Memory Backend Store
//!
//! A `BackendStore` held entirely in process memory. Used by the standalone
//! binary, by tests, and as a reference for what real adapters must guarantee.
//!
//! # Design
//!
//! - DashMap for sharded concurrent access
//! - Whole-value swaps, so readers never see a partial value
//! - Native TTL, evaluated lazily on access like Redis/Memcached
//! - Atomic `set_versioned` through the DashMap entry API

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;

use crate::domain::ports::{BackendStore, BackendUsage, ConditionalWrite};
use crate::error::Result;

#[derive(Debug, Clone)]
struct StoredValue {
    data: Bytes,
    version: Option<u64>,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }
}

/// In-memory key-value node
pub struct InMemoryBackend {
    storage: DashMap<String, StoredValue>,
    total_bytes: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

/// Operation counters for an in-memory node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InMemoryBackendStats {
    pub reads: u64,
    pub writes: u64,
    pub deletes: u64,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self {
            storage: DashMap::new(),
            total_bytes: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
        }
    }
}

impl InMemoryBackend {
    /// Create a new in-memory backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Operation counters
    pub fn stats(&self) -> InMemoryBackendStats {
        InMemoryBackendStats {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        }
    }

    fn expiry(ttl: Option<Duration>) -> Option<Instant> {
        ttl.map(|ttl| Instant::now() + ttl)
    }

    fn account_replace(&self, old: Option<&StoredValue>, new_len: usize) {
        let new_len = new_len as u64;
        match old {
            Some(old) => {
                let old_len = old.data.len() as u64;
                if new_len > old_len {
                    self.total_bytes
                        .fetch_add(new_len - old_len, Ordering::Relaxed);
                } else {
                    self.total_bytes
                        .fetch_sub(old_len - new_len, Ordering::Relaxed);
                }
            }
            None => {
                self.total_bytes.fetch_add(new_len, Ordering::Relaxed);
            }
        }
    }

    fn remove_entry(&self, key: &str) -> Option<StoredValue> {
        let removed = self.storage.remove(key).map(|(_, v)| v);
        if let Some(old) = &removed {
            self.total_bytes
                .fetch_sub(old.data.len() as u64, Ordering::Relaxed);
        }
        removed
    }

    /// Current value of `key`, dropping it if it has expired
    fn live_value(&self, key: &str) -> Option<StoredValue> {
        let now = Instant::now();
        let value = self.storage.get(key).map(|v| v.clone())?;
        if value.is_expired(now) {
            if let Some((_, v)) = self.storage.remove_if(key, |_, v| v.is_expired(now)) {
                self.total_bytes
                    .fetch_sub(v.data.len() as u64, Ordering::Relaxed);
            }
            return None;
        }
        Some(value)
    }
}

#[async_trait]
impl BackendStore for InMemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.live_value(key).map(|v| v.data))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let new_len = value.len();
        let stored = StoredValue {
            data: value,
            version: None,
            expires_at: Self::expiry(ttl),
        };
        let old = self.storage.insert(key.to_string(), stored);
        self.account_replace(old.as_ref(), new_len);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.deletes.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        Ok(self
            .remove_entry(key)
            .map(|v| !v.is_expired(now))
            .unwrap_or(false))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.live_value(key).is_some())
    }

    async fn multi_get(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>> {
        self.reads.fetch_add(keys.len() as u64, Ordering::Relaxed);
        Ok(keys
            .iter()
            .map(|k| self.live_value(k).map(|v| v.data))
            .collect())
    }

    async fn set_versioned(
        &self,
        key: &str,
        value: Bytes,
        version: u64,
        ttl: Option<Duration>,
    ) -> Result<ConditionalWrite> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let new_len = value.len();
        let stored = StoredValue {
            data: value,
            version: Some(version),
            expires_at: Self::expiry(ttl),
        };

        match self.storage.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                let newer_present = !current.is_expired(now)
                    && current.version.map(|v| v >= version).unwrap_or(false);
                if newer_present {
                    return Ok(ConditionalWrite::Superseded);
                }
                let old = occupied.insert(stored);
                self.account_replace(Some(&old), new_len);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(stored);
                self.account_replace(None, new_len);
            }
        }
        Ok(ConditionalWrite::Stored)
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let now = Instant::now();
        Ok(self
            .storage
            .iter()
            .filter(|e| !e.value().is_expired(now))
            .map(|e| e.key().clone())
            .collect())
    }

    async fn usage(&self) -> Result<BackendUsage> {
        Ok(BackendUsage {
            entries: self.storage.len() as u64,
            used_bytes: self.total_bytes.load(Ordering::Relaxed),
        })
    }

    async fn flush(&self) -> Result<u64> {
        let removed = self.storage.len() as u64;
        self.storage.clear();
        self.total_bytes.store(0, Ordering::Relaxed);
        Ok(removed)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let backend = InMemoryBackend::new();
        backend
            .set("k1", Bytes::from_static(b"hello"), None)
            .await
            .unwrap();

        assert_eq!(
            backend.get("k1").await.unwrap(),
            Some(Bytes::from_static(b"hello"))
        );
        assert!(backend.exists("k1").await.unwrap());
        assert_eq!(backend.usage().await.unwrap().used_bytes, 5);

        assert!(backend.delete("k1").await.unwrap());
        assert!(!backend.delete("k1").await.unwrap());
        assert_eq!(backend.get("k1").await.unwrap(), None);
        assert_eq!(backend.usage().await.unwrap().used_bytes, 0);
    }

    #[tokio::test]
    async fn test_size_accounting_on_overwrite() {
        let backend = InMemoryBackend::new();
        backend.set("k", Bytes::from(vec![0u8; 100]), None).await.unwrap();
        backend.set("k", Bytes::from(vec![0u8; 40]), None).await.unwrap();
        let usage = backend.usage().await.unwrap();
        assert_eq!(usage.entries, 1);
        assert_eq!(usage.used_bytes, 40);
    }

    #[tokio::test]
    async fn test_native_ttl() {
        let backend = InMemoryBackend::new();
        backend
            .set("short", Bytes::from_static(b"x"), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert!(backend.exists("short").await.unwrap());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!backend.exists("short").await.unwrap());
        assert!(backend.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_set_versioned_rejects_older() {
        let backend = InMemoryBackend::new();
        let stored = backend
            .set_versioned("k", Bytes::from_static(b"v5"), 5, None)
            .await
            .unwrap();
        assert_eq!(stored, ConditionalWrite::Stored);

        let stale = backend
            .set_versioned("k", Bytes::from_static(b"v3"), 3, None)
            .await
            .unwrap();
        assert_eq!(stale, ConditionalWrite::Superseded);
        assert_eq!(
            backend.get("k").await.unwrap(),
            Some(Bytes::from_static(b"v5"))
        );

        let newer = backend
            .set_versioned("k", Bytes::from_static(b"v9"), 9, None)
            .await
            .unwrap();
        assert_eq!(newer, ConditionalWrite::Stored);
        assert_eq!(
            backend.get("k").await.unwrap(),
            Some(Bytes::from_static(b"v9"))
        );
    }

    #[tokio::test]
    async fn test_multi_get_and_flush() {
        let backend = InMemoryBackend::new();
        backend.set("a", Bytes::from_static(b"1"), None).await.unwrap();
        backend.set("b", Bytes::from_static(b"2"), None).await.unwrap();

        let values = backend
            .multi_get(&["a".to_string(), "missing".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(values[0], Some(Bytes::from_static(b"1")));
        assert_eq!(values[1], None);
        assert_eq!(values[2], Some(Bytes::from_static(b"2")));

        assert_eq!(backend.flush().await.unwrap(), 2);
        assert_eq!(backend.usage().await.unwrap(), BackendUsage::default());
    }
}
