//! Distributed Cache Facade
//!
//! The public entry point. Validates input, runs values through the
//! serialization pipeline, delegates placement and quorum to the replication
//! manager, and records latency and outcome of every call.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use ringcache::cache::DistributedCache;
//! use ringcache::config::{EngineConfig, NodeConfig};
//!
//! # async fn demo() -> ringcache::Result<()> {
//! let mut config = EngineConfig::default();
//! config.nodes = vec![
//!     NodeConfig::new("a", "mem://a"),
//!     NodeConfig::new("b", "mem://b"),
//!     NodeConfig::new("c", "mem://c"),
//! ];
//! let cache = DistributedCache::in_memory(config)?;
//!
//! cache.set("page:42", b"<html>".to_vec(), Some(Duration::from_secs(60))).await?;
//! assert!(cache.get("page:42").await?.is_some());
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use super::backup::{BackupInfo, BackupManager, RestoreReport};
use super::bus::{BusStats, EventBus, Subscription, SubscriptionFilter};
use super::entry::{EntryOptions, Priority};
use super::eviction::{EvictionReport, EvictionScheduler};
use super::health::{ClusterHealth, HealthMonitor};
use super::metrics::{CacheMetrics, EvictionCounts, LatencyTracker, MetricsSnapshot, Operation};
use super::migration::{MigrationReport, Migrator};
use super::node::{NodeHandle, NodeHealth};
use super::pipeline::{self, Pipeline};
use super::replication::{ReplicationManager, ReplicationSettings, WriteReceipt};
use super::ring::HashRing;
use super::topology::{Topology, TopologySnapshot};
use crate::adapters::InMemoryBackend;
use crate::config::{EngineConfig, NodeConfig};
use crate::domain::events::CacheEvent;
use crate::domain::ports::{BackendStore, EventFallback};
use crate::error::{Error, Result};

// =============================================================================
// Options and Stats
// =============================================================================

/// Per-call write options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetOptions {
    pub ttl: Option<Duration>,
    pub priority: Priority,
    /// Encrypt even if the key does not look sensitive
    pub encrypt: bool,
    /// Compress when the payload qualifies; off stores the bytes as given
    pub compress: bool,
    /// Overrides the configured operation timeout
    pub timeout: Option<Duration>,
}

impl Default for SetOptions {
    fn default() -> Self {
        Self {
            ttl: None,
            priority: Priority::default(),
            encrypt: false,
            compress: true,
            timeout: None,
        }
    }
}

impl SetOptions {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn encrypted(mut self) -> Self {
        self.encrypt = true;
        self
    }

    pub fn without_compression(mut self) -> Self {
        self.compress = false;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn entry(&self) -> EntryOptions {
        EntryOptions {
            ttl: self.ttl,
            priority: self.priority,
            encrypt: self.encrypt,
            compress: self.compress,
        }
    }
}

/// Point-in-time view of the cache
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hit_rate: f64,
    pub node_health: Vec<NodeHealth>,
    pub eviction_counts: EvictionCounts,
    pub counters: MetricsSnapshot,
    pub bus: BusStats,
    pub topology_generation: u64,
}

/// Handles of the background loops started by
/// [`DistributedCache::start_background`]
#[derive(Debug)]
pub struct BackgroundTasks {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    pub fn token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Number of running loops
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Stop every loop and wait for it to finish
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
    }
}

// =============================================================================
// Builder
// =============================================================================

type BackendFactory = Box<dyn Fn(&NodeConfig) -> Arc<dyn BackendStore> + Send + Sync>;

/// Assembles a [`DistributedCache`] from configuration and backend clients
pub struct CacheBuilder {
    config: EngineConfig,
    backends: HashMap<String, Arc<dyn BackendStore>>,
    extra_nodes: Vec<NodeConfig>,
    factory: Option<BackendFactory>,
    fallback: Option<Arc<dyn EventFallback>>,
}

impl CacheBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            backends: HashMap::new(),
            extra_nodes: Vec::new(),
            factory: None,
            fallback: None,
        }
    }

    /// Use `backend` for `node`, adding the node if the config does not list it
    pub fn node(mut self, node: NodeConfig, backend: Arc<dyn BackendStore>) -> Self {
        if !self.config.nodes.iter().any(|n| n.id == node.id)
            && !self.extra_nodes.iter().any(|n| n.id == node.id)
        {
            self.extra_nodes.push(node.clone());
        }
        self.backends.insert(node.id, backend);
        self
    }

    /// Build clients for configured nodes that got no explicit backend
    pub fn backend_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(&NodeConfig) -> Arc<dyn BackendStore> + Send + Sync + 'static,
    {
        self.factory = Some(Box::new(factory));
        self
    }

    /// Store overflowing critical events in `fallback`
    pub fn event_fallback(mut self, fallback: Arc<dyn EventFallback>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn build(mut self) -> Result<DistributedCache> {
        self.config.validate()?;
        let config = self.config;
        let events = match self.fallback {
            Some(fallback) => EventBus::with_fallback(config.bus.queue_capacity, fallback),
            None => EventBus::new(config.bus.queue_capacity),
        };

        let declared: Vec<NodeConfig> = config
            .nodes
            .iter()
            .chain(self.extra_nodes.iter())
            .cloned()
            .collect();
        let required = config.ring.replication_factor;
        if declared.len() < required {
            return Err(Error::Topology {
                available: declared.len(),
                required,
            });
        }

        let mut handles = HashMap::new();
        for node in &declared {
            if handles.contains_key(&node.id) {
                return Err(Error::Config(format!("duplicate node id {}", node.id)));
            }
            let backend = match (self.backends.remove(&node.id), &self.factory) {
                (Some(backend), _) => backend,
                (None, Some(factory)) => factory(node),
                (None, None) => {
                    return Err(Error::Config(format!(
                        "no backend client for node {}",
                        node.id
                    )))
                }
            };
            handles.insert(
                node.id.clone(),
                Arc::new(NodeHandle::new(
                    node,
                    backend,
                    &config.breaker,
                    &config.pool,
                    Some(events.clone()),
                )),
            );
        }

        let ring = HashRing::new(
            declared.iter().map(|n| (n.id.clone(), n.weight)),
            config.ring.virtual_nodes,
            required,
        );
        let topology = Arc::new(Topology::new(TopologySnapshot::new(ring, handles, 1)));
        DistributedCache::assemble(config, topology, events)
    }
}

// =============================================================================
// Distributed Cache
// =============================================================================

/// Replicated, partitioned cache over a set of backend nodes
pub struct DistributedCache {
    config: EngineConfig,
    pipeline: Pipeline,
    replication: Arc<ReplicationManager>,
    eviction: Arc<EvictionScheduler>,
    health: Arc<HealthMonitor>,
    backups: Arc<BackupManager>,
    migrator: Migrator,
    events: EventBus,
    metrics: Arc<CacheMetrics>,
    /// Serializes topology changes
    admin: Mutex<()>,
}

impl std::fmt::Debug for DistributedCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.replication.topology().load();
        f.debug_struct("DistributedCache")
            .field("nodes", &snapshot.len())
            .field("generation", &snapshot.generation())
            .finish()
    }
}

impl DistributedCache {
    pub fn builder(config: EngineConfig) -> CacheBuilder {
        CacheBuilder::new(config)
    }

    /// Cache whose configured nodes are all in-process memory stores
    pub fn in_memory(config: EngineConfig) -> Result<Self> {
        CacheBuilder::new(config)
            .backend_factory(|_| Arc::new(InMemoryBackend::new()))
            .build()
    }

    fn assemble(config: EngineConfig, topology: Arc<Topology>, events: EventBus) -> Result<Self> {
        let metrics = Arc::new(CacheMetrics::new());
        let pipeline = Pipeline::new(&config.pipeline)?;
        let replication = Arc::new(ReplicationManager::new(
            topology.clone(),
            ReplicationSettings::from_config(&config),
            events.clone(),
            metrics.clone(),
        ));
        let eviction = Arc::new(EvictionScheduler::new(
            replication.clone(),
            config.eviction.clone(),
            events.clone(),
            metrics.clone(),
        ));
        let health = Arc::new(HealthMonitor::new(topology, config.health.probe_interval));
        let backups = Arc::new(BackupManager::new(
            config.backup.clone(),
            config.eviction.scan_batch,
            events.clone(),
        ));

        info!(
            nodes = replication.topology().load().len(),
            replication_factor = config.ring.replication_factor,
            write_quorum = config.write_quorum(),
            read_quorum = config.replication.read_quorum,
            "Distributed cache ready"
        );

        Ok(Self {
            migrator: Migrator::new(config.eviction.scan_batch),
            config,
            pipeline,
            replication,
            eviction,
            health,
            backups,
            events,
            metrics,
            admin: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self, name: impl Into<String>, filter: SubscriptionFilter) -> Subscription {
        self.events.subscribe(name, filter)
    }

    pub fn metrics(&self) -> &Arc<CacheMetrics> {
        &self.metrics
    }

    /// Current topology snapshot
    pub fn topology(&self) -> Arc<TopologySnapshot> {
        self.replication.topology().load()
    }

    // =========================================================================
    // Validation
    // =========================================================================

    fn validate_key(&self, key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidInput("key must not be empty".into()));
        }
        if key.len() > self.config.limits.max_key_len {
            return Err(Error::InvalidInput(format!(
                "key of {} bytes exceeds the {} byte limit",
                key.len(),
                self.config.limits.max_key_len
            )));
        }
        Ok(())
    }

    fn validate_write(&self, key: &str, value: &[u8], options: &SetOptions) -> Result<()> {
        self.validate_key(key)?;
        if options.ttl == Some(Duration::ZERO) {
            return Err(Error::InvalidInput("ttl must be positive".into()));
        }
        if value.len() > self.config.limits.max_value_size {
            return Err(Error::InvalidInput(format!(
                "value of {} bytes exceeds the {} byte limit",
                value.len(),
                self.config.limits.max_value_size
            )));
        }
        Ok(())
    }

    fn observe<T>(&self, op: Operation, tracker: &LatencyTracker, result: &Result<T>) {
        self.metrics.record_latency(op, tracker.elapsed());
        if let Err(e) = result {
            self.metrics.record_error(e);
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Value of `key`, or `None` if no reachable replica has it
    pub async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.get_with(key, None).await
    }

    /// [`get`](Self::get) with an explicit deadline
    pub async fn get_with(&self, key: &str, timeout: Option<Duration>) -> Result<Option<Bytes>> {
        self.validate_key(key)?;
        let tracker = LatencyTracker::start();

        let result = match self.replication.read_record(key, timeout).await {
            Ok(Some(record)) => self.pipeline.decode(key, &record).map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(e),
        };
        self.observe(Operation::Get, &tracker, &result);

        if let Ok(value) = &result {
            if value.is_some() {
                self.metrics.record_hit();
            } else {
                self.metrics.record_miss();
            }
            self.events
                .publish(CacheEvent::get(key, value.is_some(), tracker.elapsed()));
        }
        result
    }

    /// Deserialize the value of `key` with serde_json
    pub async fn get_value<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await? {
            Some(raw) => pipeline::deserialize(&raw).map(Some),
            None => Ok(None),
        }
    }

    /// Whether `key` holds a live value on any reachable replica
    pub async fn exists(&self, key: &str) -> Result<bool> {
        self.exists_with(key, None).await
    }

    /// [`exists`](Self::exists) with an explicit deadline
    pub async fn exists_with(&self, key: &str, timeout: Option<Duration>) -> Result<bool> {
        self.validate_key(key)?;
        let tracker = LatencyTracker::start();

        let result = self
            .replication
            .read_record(key, timeout)
            .await
            .map(|record| record.is_some());
        self.observe(Operation::Exists, &tracker, &result);

        if result.is_ok() {
            self.metrics.record_exists();
        }
        result
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Store `value` under `key`, expiring after `ttl` if given
    pub async fn set(
        &self,
        key: &str,
        value: impl AsRef<[u8]>,
        ttl: Option<Duration>,
    ) -> Result<WriteReceipt> {
        let options = SetOptions {
            ttl,
            ..Default::default()
        };
        self.set_with(key, value, options).await
    }

    /// [`set`](Self::set) with priority, compression, encryption and deadline options
    pub async fn set_with(
        &self,
        key: &str,
        value: impl AsRef<[u8]>,
        options: SetOptions,
    ) -> Result<WriteReceipt> {
        let value = value.as_ref();
        self.validate_write(key, value, &options)?;
        let tracker = LatencyTracker::start();

        let result = async {
            let version = self.replication.next_version();
            let record = self.pipeline.encode(key, value, version, &options.entry())?;
            self.replication
                .write_record(key, record, options.timeout)
                .await
        }
        .await;
        self.observe(Operation::Set, &tracker, &result);

        if let Ok(receipt) = &result {
            self.metrics.record_set();
            self.events
                .publish(CacheEvent::set(key, receipt.acks, tracker.elapsed()));
        }
        result
    }

    /// Serialize `value` with serde_json and store it
    pub async fn set_value<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<WriteReceipt> {
        let raw = pipeline::serialize(value)?;
        self.set(key, raw, ttl).await
    }

    /// Delete `key`, returning whether any replica held a live value
    pub async fn delete(&self, key: &str) -> Result<bool> {
        self.delete_with(key, None).await
    }

    /// [`delete`](Self::delete) with an explicit deadline
    pub async fn delete_with(&self, key: &str, timeout: Option<Duration>) -> Result<bool> {
        self.validate_key(key)?;
        let tracker = LatencyTracker::start();

        let tombstone = self.pipeline.tombstone(
            self.replication.next_version(),
            self.replication.settings().tombstone_ttl,
        );
        let result = self
            .replication
            .delete(key, tombstone, timeout)
            .await
            .map(|receipt| receipt.replaced_live);
        self.observe(Operation::Delete, &tracker, &result);

        if let Ok(existed) = result {
            self.metrics.record_delete();
            self.events
                .publish(CacheEvent::delete(key, existed, tracker.elapsed()));
        }
        result
    }

    // =========================================================================
    // Stats
    // =========================================================================

    pub fn stats(&self) -> CacheStats {
        let snapshot = self.topology();
        CacheStats {
            hit_rate: self.metrics.hit_ratio(),
            node_health: snapshot.nodes().map(|n| n.health()).collect(),
            eviction_counts: self.metrics.eviction_counts(),
            counters: self.metrics.snapshot(),
            bus: self.events.stats(),
            topology_generation: snapshot.generation(),
        }
    }

    pub fn health(&self) -> ClusterHealth {
        self.health.report()
    }

    // =========================================================================
    // Administration
    // =========================================================================

    /// Remove every entry from every node, returning how many were removed
    #[instrument(skip(self))]
    pub async fn flush(&self) -> Result<u64> {
        let snapshot = self.topology();
        let results = futures::future::join_all(snapshot.nodes().map(|n| n.flush())).await;

        let mut removed = 0;
        let mut first_error = None;
        for (node, result) in snapshot.nodes().zip(results) {
            match result {
                Ok(n) => removed += n,
                Err(e) => {
                    warn!(node = node.id(), error = %e, "Flush failed on node");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                info!(removed, "Cache flushed");
                Ok(removed)
            }
        }
    }

    /// Add a node, rebalance the ring and migrate the keys it now owns
    #[instrument(skip(self, backend), fields(node = %node.id))]
    pub async fn add_node(
        &self,
        node: NodeConfig,
        backend: Arc<dyn BackendStore>,
    ) -> Result<MigrationReport> {
        let _admin = self.admin.lock().await;
        let old = self.topology();
        let ring = old.ring().with_node(&node.id, node.weight)?;

        let mut nodes: HashMap<String, Arc<NodeHandle>> =
            old.nodes().map(|n| (n.id().to_string(), n.clone())).collect();
        nodes.insert(
            node.id.clone(),
            Arc::new(NodeHandle::new(
                &node,
                backend,
                &self.config.breaker,
                &self.config.pool,
                Some(self.events.clone()),
            )),
        );

        let new = TopologySnapshot::new(ring, nodes, old.generation() + 1);
        self.replication.topology().swap(new);
        self.rebalance(&old, &node.id, "added").await
    }

    /// Remove a node, rebalance the ring and re-replicate its keys
    #[instrument(skip(self))]
    pub async fn remove_node(&self, node_id: &str) -> Result<MigrationReport> {
        let _admin = self.admin.lock().await;
        let old = self.topology();
        let ring = old.ring().without_node(node_id)?;
        let required = self.config.ring.replication_factor;
        if ring.len() < required {
            return Err(Error::Topology {
                available: ring.len(),
                required,
            });
        }

        let removed = old.node(node_id)?.clone();
        let nodes: HashMap<String, Arc<NodeHandle>> = old
            .nodes()
            .filter(|n| n.id() != node_id)
            .map(|n| (n.id().to_string(), n.clone()))
            .collect();

        let new = TopologySnapshot::new(ring, nodes, old.generation() + 1);
        self.replication.topology().swap(new);
        let report = self.rebalance(&old, node_id, "removed").await;
        removed.pool().close();
        report
    }

    async fn rebalance(
        &self,
        old: &TopologySnapshot,
        node_id: &str,
        change: &str,
    ) -> Result<MigrationReport> {
        let new = self.topology();
        let report = self.migrator.rebalance(old, &new).await;
        self.metrics.record_migration(report.copied);
        self.events.publish(CacheEvent::rebalance(
            node_id,
            format!(
                "node {}, {:.1}% of keyspace changed owner, {} copied, {} unreachable",
                change,
                report.ownership_change * 100.0,
                report.copied,
                report.unreachable.len()
            ),
            report.copied,
        ));
        Ok(report)
    }

    /// Run an eviction pass now
    pub async fn force_eviction_pass(&self) -> Result<EvictionReport> {
        self.eviction.run_pass().await
    }

    /// Write a backup snapshot now
    pub async fn backup(&self) -> Result<BackupInfo> {
        self.backups.backup(&self.replication).await
    }

    /// Restore a snapshot by file name
    pub async fn restore(&self, file_name: &str) -> Result<RestoreReport> {
        self.backups.restore(&self.replication, file_name).await
    }

    /// Snapshots on disk, newest first
    pub async fn list_backups(&self) -> Result<Vec<BackupInfo>> {
        self.backups.list().await
    }

    /// Start the eviction scheduler, the health monitor and, if configured,
    /// periodic backups
    pub fn start_background(&self) -> BackgroundTasks {
        let shutdown = CancellationToken::new();
        let mut handles = vec![
            tokio::spawn(self.eviction.clone().run(shutdown.child_token())),
            tokio::spawn(self.health.clone().run(shutdown.child_token())),
        ];
        if let Some(every) = self.config.backup.interval {
            handles.push(tokio::spawn(self.backups.clone().run(
                self.replication.clone(),
                every,
                shutdown.child_token(),
            )));
        }
        BackgroundTasks { shutdown, handles }
    }
}
