//! Fault-Injecting Backend
//!
//! Wraps another `BackendStore` and lets tests (or chaos drills against the
//! standalone binary) take a node down, add latency, or fail a fixed number
//! of calls.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::domain::ports::{BackendStore, BackendUsage, ConditionalWrite};
use crate::error::{Error, Result};

/// Backend wrapper with switchable failure modes
pub struct FaultyBackend {
    node_id: String,
    inner: Arc<dyn BackendStore>,
    down: AtomicBool,
    fail_next: AtomicU32,
    latency_ms: AtomicU64,
    calls: AtomicU64,
}

impl FaultyBackend {
    /// Wrap `inner`, reporting failures as coming from `node_id`
    pub fn new(node_id: impl Into<String>, inner: Arc<dyn BackendStore>) -> Self {
        Self {
            node_id: node_id.into(),
            inner,
            down: AtomicBool::new(false),
            fail_next: AtomicU32::new(0),
            latency_ms: AtomicU64::new(0),
            calls: AtomicU64::new(0),
        }
    }

    /// Make every call fail with `NodeUnavailable` until `set_down(false)`
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Whether the node is currently forced down
    pub fn is_down(&self) -> bool {
        self.down.load(Ordering::SeqCst)
    }

    /// Fail the next `n` calls
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of calls that reached this wrapper
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    async fn gate(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        if self.is_down() {
            return Err(Error::unavailable(&self.node_id, "connection refused"));
        }

        let consumed = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if consumed.is_ok() {
            return Err(Error::unavailable(&self.node_id, "injected failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl BackendStore for FaultyBackend {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.gate().await?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()> {
        self.gate().await?;
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.gate().await?;
        self.inner.delete(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.gate().await?;
        self.inner.exists(key).await
    }

    async fn multi_get(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>> {
        self.gate().await?;
        self.inner.multi_get(keys).await
    }

    async fn set_versioned(
        &self,
        key: &str,
        value: Bytes,
        version: u64,
        ttl: Option<Duration>,
    ) -> Result<ConditionalWrite> {
        self.gate().await?;
        self.inner.set_versioned(key, value, version, ttl).await
    }

    async fn keys(&self) -> Result<Vec<String>> {
        self.gate().await?;
        self.inner.keys().await
    }

    async fn usage(&self) -> Result<BackendUsage> {
        self.gate().await?;
        self.inner.usage().await
    }

    async fn flush(&self) -> Result<u64> {
        self.gate().await?;
        self.inner.flush().await
    }

    async fn ping(&self) -> Result<()> {
        self.gate().await?;
        self.inner.ping().await
    }
}
