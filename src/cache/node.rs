//! Backend Node Handle
//!
//! Everything the engine knows about one physical node: its backend client,
//! circuit breaker and connection pool. Every backend call goes through
//! [`NodeHandle::guarded`], which applies the breaker, borrows a pooled
//! connection and enforces the per-call timeout.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::breaker::{BreakerSnapshot, BreakerState, CircuitBreaker};
use super::bus::EventBus;
use super::entry::{Record, RecordHeader};
use super::pool::{ConnectionPool, PoolStats};
use crate::config::{BreakerConfig, NodeConfig, PoolConfig};
use crate::domain::ports::{BackendStore, BackendUsage, ConditionalWrite};
use crate::error::{Error, Result};

/// Health of a node, derived from its breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeState {
    Healthy,
    Degraded,
    Down,
}

impl From<BreakerState> for NodeState {
    fn from(state: BreakerState) -> Self {
        match state {
            BreakerState::Closed => NodeState::Healthy,
            BreakerState::HalfOpen => NodeState::Degraded,
            BreakerState::Open => NodeState::Down,
        }
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Healthy => write!(f, "healthy"),
            NodeState::Degraded => write!(f, "degraded"),
            NodeState::Down => write!(f, "down"),
        }
    }
}

/// Health report for one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeHealth {
    pub id: String,
    pub address: String,
    pub weight: u32,
    pub state: NodeState,
    pub consecutive_failures: u32,
    pub opened_total: u64,
    pub connections_in_use: usize,
    pub pool_closed: bool,
}

/// Outcome of a versioned write on one node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeWrite {
    pub outcome: ConditionalWrite,
    /// Header of the record the node held before the write
    pub previous: Option<RecordHeader>,
}

/// A backend node with its breaker and pool
pub struct NodeHandle {
    id: String,
    address: String,
    weight: u32,
    backend: Arc<dyn BackendStore>,
    breaker: CircuitBreaker,
    pool: ConnectionPool,
    call_timeout: Duration,
    down_grace_period: Duration,
}

impl std::fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeHandle")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("state", &self.state())
            .finish()
    }
}

impl NodeHandle {
    pub fn new(
        config: &NodeConfig,
        backend: Arc<dyn BackendStore>,
        breaker: &BreakerConfig,
        pool: &PoolConfig,
        events: Option<EventBus>,
    ) -> Self {
        let mut cb = CircuitBreaker::new(&config.id, breaker.clone());
        if let Some(bus) = events {
            cb = cb.with_events(bus);
        }
        Self {
            id: config.id.clone(),
            address: config.address.clone(),
            weight: config.weight,
            backend,
            breaker: cb,
            pool: ConnectionPool::new(&config.id, pool),
            call_timeout: breaker.call_timeout,
            down_grace_period: pool.down_grace_period,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn state(&self) -> NodeState {
        self.breaker.state().into()
    }

    /// Whether a call would currently be admitted without probing
    pub fn is_available(&self) -> bool {
        self.breaker.state() == BreakerState::Closed
    }

    /// Whether the node has been down past the pool grace period
    pub fn past_grace_period(&self) -> bool {
        self.breaker
            .down_for()
            .map(|d| d >= self.down_grace_period)
            .unwrap_or(false)
    }

    pub fn health(&self) -> NodeHealth {
        let breaker: BreakerSnapshot = self.breaker.snapshot();
        let pool: PoolStats = self.pool.stats();
        NodeHealth {
            id: self.id.clone(),
            address: self.address.clone(),
            weight: self.weight,
            state: breaker.state.into(),
            consecutive_failures: breaker.consecutive_failures,
            opened_total: breaker.opened_total,
            connections_in_use: pool.in_use,
            pool_closed: pool.closed,
        }
    }

    /// Run one backend call under the breaker, a pooled connection and the
    /// per-call timeout.
    ///
    /// `call` is only polled once the breaker and pool admit it.
    pub async fn guarded<T>(
        &self,
        operation: &str,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        self.guarded_for(operation, self.call_timeout, call).await
    }

    async fn guarded_for<T>(
        &self,
        operation: &str,
        budget: Duration,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let permit = self.breaker.try_acquire()?;
        if permit.is_probe() {
            self.pool.reopen();
        }

        // Pool exhaustion is local back-pressure, not a node fault
        let _conn = self.pool.acquire().await?;

        let result = match tokio::time::timeout(budget, call).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                operation: format!("{} on {}", operation, self.id),
                elapsed: budget,
            }),
        };
        permit.record(&result);
        result
    }

    pub async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.guarded("get", self.backend.get(key)).await
    }

    pub async fn multi_get(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>> {
        self.guarded("multi_get", self.backend.multi_get(keys)).await
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        self.guarded("exists", self.backend.exists(key)).await
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        self.guarded("delete", self.backend.delete(key)).await
    }

    pub async fn keys(&self) -> Result<Vec<String>> {
        self.guarded("keys", self.backend.keys()).await
    }

    pub async fn usage(&self) -> Result<BackendUsage> {
        self.guarded("usage", self.backend.usage()).await
    }

    pub async fn flush(&self) -> Result<u64> {
        self.guarded("flush", self.backend.flush()).await
    }

    pub async fn ping(&self) -> Result<()> {
        self.guarded("ping", self.backend.ping()).await
    }

    /// Read and parse the record stored under `key`
    pub async fn read_record(&self, key: &str) -> Result<Option<Record>> {
        match self.get(key).await? {
            Some(bytes) => Record::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Store `record` unless the node already holds an equal or newer live
    /// version.
    ///
    /// The version check runs here first; backends that override
    /// `set_versioned` repeat it atomically. The check and the write share
    /// one call timeout.
    pub async fn write_record(&self, key: &str, record: &Record) -> Result<NodeWrite> {
        let started = Instant::now();
        let previous = self
            .get(key)
            .await?
            .and_then(|current| Record::peek_header(&current).ok());

        let superseded = |previous| NodeWrite {
            outcome: ConditionalWrite::Superseded,
            previous,
        };
        if let Some(header) = previous {
            if header.version >= record.version() && !header.is_expired() {
                return Ok(superseded(previous));
            }
        }

        let ttl = record.header.remaining_ttl();
        if ttl == Some(Duration::ZERO) {
            // Already expired; nothing worth storing
            return Ok(superseded(previous));
        }
        let outcome = self
            .guarded_for(
                "set",
                self.call_timeout.saturating_sub(started.elapsed()),
                self.backend
                    .set_versioned(key, record.encode(), record.version(), ttl),
            )
            .await?;
        Ok(NodeWrite { outcome, previous })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{FaultyBackend, InMemoryBackend};
    use crate::cache::entry::{Priority, RecordHeader};
    use assert_matches::assert_matches;

    fn record(version: u64) -> Record {
        Record::seal(
            RecordHeader::value(version, Priority::Normal, None),
            Bytes::from(format!("v{}", version)),
        )
    }

    fn node(backend: Arc<dyn BackendStore>) -> NodeHandle {
        NodeHandle::new(
            &NodeConfig::new("n1", "mem://n1"),
            backend,
            &BreakerConfig {
                failure_threshold: 2,
                call_timeout: Duration::from_millis(50),
                ..Default::default()
            },
            &PoolConfig::default(),
            None,
        )
    }

    #[tokio::test]
    async fn test_write_record_respects_versions() {
        let node = node(Arc::new(InMemoryBackend::new()));
        let first = node.write_record("k", &record(5)).await.unwrap();
        assert_eq!(first.outcome, ConditionalWrite::Stored);
        assert!(first.previous.is_none());

        let stale = node.write_record("k", &record(3)).await.unwrap();
        assert_eq!(stale.outcome, ConditionalWrite::Superseded);
        assert_eq!(stale.previous.map(|h| h.version), Some(5));
        assert_eq!(node.read_record("k").await.unwrap().unwrap().version(), 5);

        let newer = node.write_record("k", &record(8)).await.unwrap();
        assert_eq!(newer.outcome, ConditionalWrite::Stored);
        assert_eq!(node.read_record("k").await.unwrap().unwrap().version(), 8);
    }

    #[tokio::test]
    async fn test_failures_open_breaker() {
        let faulty = Arc::new(FaultyBackend::new("n1", Arc::new(InMemoryBackend::new())));
        let node = node(faulty.clone());
        faulty.set_down(true);

        assert_matches!(node.get("k").await, Err(Error::NodeUnavailable { .. }));
        assert_matches!(node.get("k").await, Err(Error::NodeUnavailable { .. }));
        assert_eq!(node.state(), NodeState::Down);

        let calls = faulty.calls();
        assert_matches!(node.get("k").await, Err(Error::CircuitOpen { .. }));
        // fail fast: the backend was not touched
        assert_eq!(faulty.calls(), calls);
    }

    #[tokio::test]
    async fn test_slow_call_times_out() {
        let faulty = Arc::new(FaultyBackend::new("n1", Arc::new(InMemoryBackend::new())));
        faulty.set_latency(Duration::from_millis(200));
        let node = node(faulty);

        assert_matches!(node.ping().await, Err(Error::Timeout { .. }));
        assert_eq!(node.health().consecutive_failures, 1);
        assert_eq!(node.pool().in_use(), 0);
    }

    #[tokio::test]
    async fn test_write_bounded_by_one_call_timeout() {
        let faulty = Arc::new(FaultyBackend::new("n1", Arc::new(InMemoryBackend::new())));
        faulty.set_latency(Duration::from_millis(30));
        let node = node(faulty);

        // 30ms read plus 30ms write does not fit in the 50ms budget
        let started = Instant::now();
        assert_matches!(
            node.write_record("k", &record(1)).await,
            Err(Error::Timeout { .. })
        );
        assert!(started.elapsed() < Duration::from_millis(90));
    }

    #[tokio::test]
    async fn test_not_found_is_success() {
        let node = node(Arc::new(InMemoryBackend::new()));
        for _ in 0..5 {
            assert!(node.get("missing").await.unwrap().is_none());
        }
        assert_eq!(node.state(), NodeState::Healthy);
    }

    #[tokio::test]
    async fn test_expired_record_not_written() {
        let node = node(Arc::new(InMemoryBackend::new()));
        let expired = Record::seal(
            RecordHeader::value(1, Priority::Normal, Some(1)),
            Bytes::from_static(b"old"),
        );
        assert_eq!(
            node.write_record("k", &expired).await.unwrap().outcome,
            ConditionalWrite::Superseded
        );
        assert!(node.get("k").await.unwrap().is_none());
    }
}
