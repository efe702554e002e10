//! Replication Manager
//!
//! Fans reads and writes out to a key's replica set.
//!
//! # Writes
//!
//! The record is encoded once and written to every replica concurrently
//! (one spawned task per node). The call returns as soon as `W` replicas
//! acknowledge; the remaining writes keep running in the background. There
//! is no rollback: replicas that did take a failed write are reconciled
//! later by read-repair through version ordering.
//!
//! # Reads
//!
//! Replicas are consulted in ring order, primary first, until `read_quorum`
//! replies are in and at least one holds a record (a miss falls through to
//! the next replica). Failed or open-circuit replicas are replaced by the
//! next one. The highest version wins; replicas that answered with an older
//! version or nothing are repaired in the background.
//!
//! # Deletes
//!
//! A delete is a tombstone write with its own version, so a stale replica
//! cannot resurrect the value through read-repair.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use super::bus::EventBus;
use super::entry::{Record, RecordHeader, VersionClock};
use super::metrics::CacheMetrics;
use super::node::{NodeHandle, NodeState, NodeWrite};
use super::topology::{Topology, TopologySnapshot};
use crate::config::EngineConfig;
use crate::domain::events::CacheEvent;
use crate::domain::ports::ConditionalWrite;
use crate::error::{Error, Result};

// =============================================================================
// Settings and Reports
// =============================================================================

/// Effective replication settings
#[derive(Debug, Clone)]
pub struct ReplicationSettings {
    pub replication_factor: usize,
    pub write_quorum: usize,
    pub read_quorum: usize,
    pub operation_timeout: Duration,
    pub strict_topology: bool,
    pub repair_remaining: bool,
    pub tombstone_ttl: Duration,
}

impl ReplicationSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            replication_factor: config.ring.replication_factor,
            write_quorum: config.write_quorum(),
            read_quorum: config.replication.read_quorum,
            operation_timeout: config.replication.operation_timeout,
            strict_topology: config.replication.strict_topology,
            repair_remaining: config.replication.repair_remaining,
            tombstone_ttl: config.replication.tombstone_ttl,
        }
    }
}

/// Outcome of a replicated write, as known when the call returned
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReceipt {
    pub version: u64,
    /// Replicas that stored the record or already held a newer one
    pub acks: usize,
    pub required: usize,
    /// Size of the replica set
    pub replicas: usize,
    /// Replicas that already held an equal or newer version
    pub superseded: usize,
    /// `(node, reason)` for replicas that failed before the call returned
    pub failed: Vec<(String, String)>,
    /// Whether any acknowledging replica held a live value before this write
    pub replaced_live: bool,
}

impl WriteReceipt {
    fn new(version: u64, required: usize, replicas: usize) -> Self {
        Self {
            version,
            acks: 0,
            required,
            replicas,
            superseded: 0,
            failed: Vec::new(),
            replaced_live: false,
        }
    }

    fn ack(&mut self, write: NodeWrite) {
        self.acks += 1;
        if write.outcome == ConditionalWrite::Superseded {
            self.superseded += 1;
        }
        if write
            .previous
            .map(|h| !h.tombstone && !h.is_expired())
            .unwrap_or(false)
        {
            self.replaced_live = true;
        }
    }

    fn fail(&mut self, node: String, error: &Error) {
        self.failed.push((node, error.to_string()));
    }

    /// Whether every replica acknowledged before the call returned
    pub fn is_complete(&self) -> bool {
        self.acks == self.replicas
    }
}

/// Result of a conditional purge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    /// Replicas the key was removed from
    pub removed: usize,
    pub bytes_freed: u64,
}

#[derive(Default)]
struct GatheredReads {
    replies: Vec<(Arc<NodeHandle>, Option<Record>)>,
    failures: Vec<(String, Error)>,
    consulted: usize,
}

// =============================================================================
// Replication Manager
// =============================================================================

/// Quorum reads and writes over the current topology
pub struct ReplicationManager {
    topology: Arc<Topology>,
    settings: ReplicationSettings,
    clock: VersionClock,
    events: EventBus,
    metrics: Arc<CacheMetrics>,
}

impl std::fmt::Debug for ReplicationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationManager")
            .field("settings", &self.settings)
            .finish()
    }
}

impl ReplicationManager {
    pub fn new(
        topology: Arc<Topology>,
        settings: ReplicationSettings,
        events: EventBus,
        metrics: Arc<CacheMetrics>,
    ) -> Self {
        Self {
            topology,
            settings,
            clock: VersionClock::new(),
            events,
            metrics,
        }
    }

    pub fn settings(&self) -> &ReplicationSettings {
        &self.settings
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    /// Next write version
    pub fn next_version(&self) -> u64 {
        self.clock.next()
    }

    fn candidates(&self, snapshot: &TopologySnapshot, key: &str) -> Result<Vec<Arc<NodeHandle>>> {
        let candidates = snapshot.candidates(key)?;
        if self.settings.strict_topology {
            let healthy = candidates
                .iter()
                .filter(|n| n.state() == NodeState::Healthy)
                .count();
            if healthy < self.settings.replication_factor {
                return Err(Error::Topology {
                    available: healthy,
                    required: self.settings.replication_factor,
                });
            }
        }
        Ok(candidates)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Write `record` to the replica set of `key`, returning once `W`
    /// replicas acknowledge.
    #[instrument(skip(self, record), fields(version = record.version()))]
    pub async fn write_record(
        &self,
        key: &str,
        record: Record,
        timeout: Option<Duration>,
    ) -> Result<WriteReceipt> {
        let deadline = timeout.unwrap_or(self.settings.operation_timeout);
        let started = Instant::now();
        let snapshot = self.topology.load();
        let candidates = self.candidates(&snapshot, key)?;
        let required = self.settings.write_quorum;

        let mut pending: FuturesUnordered<JoinHandle<(String, Result<NodeWrite>)>> = candidates
            .iter()
            .map(|node| {
                let node = node.clone();
                let key = key.to_string();
                let record = record.clone();
                tokio::spawn(async move {
                    let result = node.write_record(&key, &record).await;
                    (node.id().to_string(), result)
                })
            })
            .collect();

        let mut receipt = WriteReceipt::new(record.version(), required, candidates.len());
        let gather = async {
            while let Some(joined) = pending.next().await {
                match joined {
                    Ok((_, Ok(write))) => receipt.ack(write),
                    Ok((node, Err(e))) => {
                        debug!(%node, error = %e, "Replica write failed");
                        receipt.fail(node, &e);
                    }
                    Err(e) => receipt.fail("unknown".into(), &Error::Internal(e.to_string())),
                }
                if receipt.acks >= required {
                    break;
                }
            }
        };
        let timed_out = tokio::time::timeout(deadline, gather).await.is_err();
        // Dropping the handles detaches the remaining writes; they finish in the background
        drop(pending);

        if receipt.acks >= required {
            if !receipt.failed.is_empty() {
                self.metrics.record_degraded_write();
            }
            return Ok(receipt);
        }

        warn!(
            key,
            acks = receipt.acks,
            required,
            failed = receipt.failed.len(),
            "Write quorum not reached"
        );
        self.events
            .publish(CacheEvent::quorum_degraded(key, receipt.acks, required));

        // Only a caller-supplied deadline surfaces as a timeout
        if timed_out && timeout.is_some() {
            Err(Error::Timeout {
                operation: format!("write {}", key),
                elapsed: started.elapsed(),
            })
        } else {
            Err(Error::QuorumNotReached {
                acks: receipt.acks,
                required,
            })
        }
    }

    /// Write a tombstone for `key`
    pub async fn delete(
        &self,
        key: &str,
        tombstone: Record,
        timeout: Option<Duration>,
    ) -> Result<WriteReceipt> {
        debug_assert!(tombstone.is_tombstone());
        self.write_record(key, tombstone, timeout).await
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Read the newest live record for `key`, repairing stale replicas
    #[instrument(skip(self))]
    pub async fn read_record(&self, key: &str, timeout: Option<Duration>) -> Result<Option<Record>> {
        let deadline = timeout.unwrap_or(self.settings.operation_timeout);
        let started = Instant::now();
        let snapshot = self.topology.load();
        let candidates = self.candidates(&snapshot, key)?;

        let mut gathered = GatheredReads::default();
        let outcome =
            tokio::time::timeout(deadline, self.gather_reads(key, &candidates, &mut gathered)).await;
        match outcome {
            Ok(result) => result?,
            Err(_) if timeout.is_some() => {
                return Err(Error::Timeout {
                    operation: format!("read {}", key),
                    elapsed: started.elapsed(),
                })
            }
            Err(_) => debug!(
                key,
                replies = gathered.replies.len(),
                "Read deadline reached, answering from the replies so far"
            ),
        }

        if gathered.replies.is_empty() {
            let mut reasons: Vec<String> = gathered
                .failures
                .iter()
                .map(|(node, e)| format!("{}: {}", node, e))
                .collect();
            let answered = gathered.failures.len();
            if answered < gathered.consulted {
                reasons.push(format!(
                    "{} silent after {:?}",
                    gathered.consulted - answered,
                    started.elapsed()
                ));
            }
            let primary = candidates
                .first()
                .map(|n| n.id().to_string())
                .unwrap_or_default();
            return Err(Error::unavailable(
                primary,
                format!("no replica reachable ({})", reasons.join("; ")),
            ));
        }

        let newest = gathered
            .replies
            .iter()
            .filter_map(|(_, record)| record.as_ref())
            .max_by_key(|r| r.version())
            .cloned();

        let Some(newest) = newest else {
            return Ok(None);
        };
        self.clock.observe(newest.version());

        if !newest.header.is_expired() {
            self.repair(key, &newest, &gathered.replies);
            if self.settings.repair_remaining && gathered.consulted < candidates.len() {
                self.repair_unconsulted(key, &newest, &candidates[gathered.consulted..]);
            }
        }

        Ok(newest.is_live().then_some(newest))
    }

    /// Collect replies into `out`, which stays valid if the future is
    /// dropped at the deadline.
    async fn gather_reads(
        &self,
        key: &str,
        candidates: &[Arc<NodeHandle>],
        out: &mut GatheredReads,
    ) -> Result<()> {
        let want = self.settings.read_quorum.min(candidates.len()).max(1);
        let mut in_flight = FuturesUnordered::new();
        let mut found = false;
        let GatheredReads {
            replies,
            failures,
            consulted: next,
        } = out;

        loop {
            // Keep reading past misses until something is found or replicas run out
            let needed = if found || replies.len() < want {
                want
            } else {
                replies.len() + 1
            };
            while in_flight.len() + replies.len() < needed && *next < candidates.len() {
                in_flight.push(spawn_read(candidates[*next].clone(), *next, key));
                *next += 1;
            }
            if in_flight.is_empty() {
                break;
            }

            let Some(joined) = in_flight.next().await else {
                break;
            };
            match joined {
                Ok((idx, Ok(bytes))) => {
                    let node: &Arc<NodeHandle> = &candidates[idx];
                    let record = match bytes {
                        Some(bytes) => Some(self.parse_reply(key, node, &bytes)?),
                        None => None,
                    };
                    found |= record.is_some();
                    replies.push((node.clone(), record));
                }
                Ok((idx, Err(e))) => {
                    debug!(node = candidates[idx].id(), error = %e, "Replica read failed, trying next");
                    failures.push((candidates[idx].id().to_string(), e));
                }
                Err(e) => failures.push(("unknown".into(), Error::Internal(e.to_string()))),
            }

            if found && replies.len() >= want {
                break;
            }
        }

        Ok(())
    }

    fn parse_reply(&self, key: &str, node: &NodeHandle, bytes: &bytes::Bytes) -> Result<Record> {
        let parsed = Record::decode(bytes).and_then(|record| {
            record.verify(key)?;
            Ok(record)
        });
        if let Err(e) = &parsed {
            warn!(key, node = node.id(), error = %e, "Corrupt record on replica");
            self.events
                .publish(CacheEvent::payload_error(key, format!("{} on {}", e, node.id())));
        }
        parsed
    }

    /// Fire-and-forget repair of replicas that answered with an older version
    fn repair(&self, key: &str, newest: &Record, replies: &[(Arc<NodeHandle>, Option<Record>)]) {
        let stale: Vec<Arc<NodeHandle>> = replies
            .iter()
            .filter(|(_, record)| {
                record
                    .as_ref()
                    .map(|r| r.version() < newest.version())
                    .unwrap_or(true)
            })
            .map(|(node, _)| node.clone())
            .collect();

        if stale.is_empty() {
            return;
        }
        self.metrics.record_read_repair(stale.len() as u64);
        for node in stale {
            let key = key.to_string();
            let record = newest.clone();
            tokio::spawn(async move {
                match node.write_record(&key, &record).await {
                    Ok(_) => debug!(%key, node = node.id(), "Read-repair applied"),
                    Err(e) => debug!(%key, node = node.id(), error = %e, "Read-repair failed"),
                }
            });
        }
    }

    /// Background check of replicas the read did not consult
    fn repair_unconsulted(&self, key: &str, newest: &Record, nodes: &[Arc<NodeHandle>]) {
        let nodes = nodes.to_vec();
        let key = key.to_string();
        let record = newest.clone();
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            for node in nodes {
                let current = match node.get(&key).await {
                    Ok(current) => current,
                    Err(_) => continue,
                };
                let stale = current
                    .as_deref()
                    .map(|b| {
                        Record::peek_header(b)
                            .map(|h| h.version < record.version())
                            .unwrap_or(true)
                    })
                    .unwrap_or(true);
                if stale && node.write_record(&key, &record).await.is_ok() {
                    metrics.record_read_repair(1);
                    debug!(%key, node = node.id(), "Background repair applied");
                }
            }
        });
    }

    // =========================================================================
    // Purge
    // =========================================================================

    /// Hard-delete `key` from its replica set (and from `also`) wherever the
    /// stored header satisfies `predicate`.
    pub async fn purge_if<P>(
        &self,
        key: &str,
        also: Option<&Arc<NodeHandle>>,
        predicate: P,
    ) -> Result<PurgeReport>
    where
        P: Fn(&RecordHeader) -> bool,
    {
        let snapshot = self.topology.load();
        let mut nodes = snapshot.candidates(key).unwrap_or_default();
        if let Some(extra) = also {
            if !nodes.iter().any(|n| n.id() == extra.id()) {
                nodes.push(extra.clone());
            }
        }

        let predicate = &predicate;
        let attempts = nodes.iter().map(|node| async move {
            let Some(bytes) = node.get(key).await? else {
                return Ok::<_, Error>(None);
            };
            let matches = Record::peek_header(&bytes)
                .map(|h| predicate(&h))
                .unwrap_or(false);
            if matches && node.delete(key).await? {
                Ok(Some(bytes.len() as u64))
            } else {
                Ok(None)
            }
        });

        let deadline = self.settings.operation_timeout;
        let results = tokio::time::timeout(deadline, futures::future::join_all(attempts))
            .await
            .map_err(|_| Error::Timeout {
                operation: format!("purge {}", key),
                elapsed: deadline,
            })?;

        let mut report = PurgeReport::default();
        for result in results {
            match result {
                Ok(Some(bytes)) => {
                    report.removed += 1;
                    report.bytes_freed += bytes;
                }
                Ok(None) => {}
                Err(e) => debug!(key, error = %e, "Purge skipped unreachable replica"),
            }
        }
        Ok(report)
    }

    /// Hard-delete `key` from every replica
    pub async fn purge(&self, key: &str) -> Result<PurgeReport> {
        self.purge_if(key, None, |_| true).await
    }
}

fn spawn_read(
    node: Arc<NodeHandle>,
    idx: usize,
    key: &str,
) -> JoinHandle<(usize, Result<Option<bytes::Bytes>>)> {
    let key = key.to_string();
    tokio::spawn(async move { (idx, node.get(&key).await) })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{FaultyBackend, InMemoryBackend};
    use crate::cache::entry::{EntryOptions, Priority};
    use crate::cache::pipeline::Pipeline;
    use crate::cache::ring::HashRing;
    use crate::config::{BreakerConfig, NodeConfig, PipelineConfig, PoolConfig};
    use crate::cache::bus::SubscriptionFilter;
    use crate::domain::events::EventType;
    use crate::domain::ports::BackendStore;
    use assert_matches::assert_matches;
    use bytes::Bytes;
    use std::collections::HashMap;

    struct Fixture {
        manager: ReplicationManager,
        pipeline: Pipeline,
        faulty: HashMap<String, Arc<FaultyBackend>>,
        bus: EventBus,
    }

    fn fixture(ids: &[&str], rf: usize, w: usize, r: usize) -> Fixture {
        let bus = EventBus::new(64);
        let breaker = BreakerConfig {
            failure_threshold: 3,
            call_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let mut faulty = HashMap::new();
        let mut nodes = HashMap::new();
        for id in ids {
            let backend = Arc::new(FaultyBackend::new(*id, Arc::new(InMemoryBackend::new())));
            faulty.insert(id.to_string(), backend.clone());
            nodes.insert(
                id.to_string(),
                Arc::new(NodeHandle::new(
                    &NodeConfig::new(*id, *id),
                    backend,
                    &breaker,
                    &PoolConfig::default(),
                    Some(bus.clone()),
                )),
            );
        }
        let ring = HashRing::new(ids.iter().map(|id| (*id, 1)), 64, rf);
        let topology = Arc::new(Topology::new(TopologySnapshot::new(ring, nodes, 1)));
        let settings = ReplicationSettings {
            replication_factor: rf,
            write_quorum: w,
            read_quorum: r,
            operation_timeout: Duration::from_millis(500),
            strict_topology: false,
            repair_remaining: true,
            tombstone_ttl: Duration::from_secs(60),
        };
        Fixture {
            manager: ReplicationManager::new(
                topology,
                settings,
                bus.clone(),
                Arc::new(CacheMetrics::new()),
            ),
            pipeline: Pipeline::new(&PipelineConfig::default()).unwrap(),
            faulty,
            bus,
        }
    }

    impl Fixture {
        fn record(&self, key: &str, value: &str) -> Record {
            self.pipeline
                .encode(
                    key,
                    value.as_bytes(),
                    self.manager.next_version(),
                    &EntryOptions::default(),
                )
                .unwrap()
        }

        fn replicas(&self, key: &str) -> Vec<String> {
            self.manager
                .topology()
                .load()
                .partition(key)
                .unwrap()
                .nodes()
                .map(str::to_string)
                .collect()
        }

        async fn stored_version(&self, node: &str, key: &str) -> Option<u64> {
            let snapshot = self.manager.topology().load();
            snapshot
                .node(node)
                .unwrap()
                .read_record(key)
                .await
                .unwrap()
                .map(|r| r.version())
        }

        async fn value(&self, key: &str) -> Option<Bytes> {
            self.manager
                .read_record(key, None)
                .await
                .unwrap()
                .map(|r| self.pipeline.decode(key, &r).unwrap())
        }
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let fx = fixture(&["a", "b", "c"], 2, 2, 1);
        let receipt = fx
            .manager
            .write_record("page:1", fx.record("page:1", "hello"), None)
            .await
            .unwrap();
        assert_eq!(receipt.acks, 2);
        assert!(!receipt.replaced_live);
        assert_eq!(fx.value("page:1").await.unwrap().as_ref(), b"hello");
    }

    #[tokio::test]
    async fn test_quorum_not_reached() {
        let fx = fixture(&["a", "b", "c"], 3, 3, 1);
        fx.faulty["b"].set_down(true);
        let sub = fx.bus.subscribe("t", SubscriptionFilter::types([EventType::Error]));

        let result = fx
            .manager
            .write_record("k", fx.record("k", "v"), None)
            .await;
        assert_matches!(
            result,
            Err(Error::QuorumNotReached {
                acks: 2,
                required: 3
            })
        );
        assert_eq!(sub.pending(), 1);
    }

    #[tokio::test]
    async fn test_read_falls_back_to_replica() {
        let fx = fixture(&["a", "b", "c"], 2, 2, 1);
        fx.manager
            .write_record("k", fx.record("k", "v1"), None)
            .await
            .unwrap();

        let primary = fx.replicas("k")[0].clone();
        fx.faulty[&primary].set_down(true);
        assert_eq!(fx.value("k").await.unwrap().as_ref(), b"v1");
    }

    #[tokio::test]
    async fn test_all_replicas_down() {
        let fx = fixture(&["a", "b"], 2, 1, 1);
        for f in fx.faulty.values() {
            f.set_down(true);
        }
        assert_matches!(
            fx.manager.read_record("k", None).await,
            Err(Error::NodeUnavailable { .. })
        );
        assert_matches!(
            fx.manager.write_record("k", fx.record("k", "v"), None).await,
            Err(Error::QuorumNotReached { acks: 0, .. })
        );
    }

    #[tokio::test]
    async fn test_hung_replica_counts_against_quorum() {
        let fx = fixture(&["a", "b", "c"], 2, 2, 1);
        let replica = fx.replicas("k")[1].clone();
        fx.faulty[&replica].set_latency(Duration::from_secs(5));

        assert_matches!(
            fx.manager.write_record("k", fx.record("k", "v"), None).await,
            Err(Error::QuorumNotReached {
                acks: 1,
                required: 2
            })
        );
    }

    #[tokio::test]
    async fn test_operation_deadline_reports_quorum_and_unavailable() {
        let mut fx = fixture(&["a", "b"], 2, 2, 1);
        fx.manager.settings.operation_timeout = Duration::from_millis(30);
        for f in fx.faulty.values() {
            f.set_latency(Duration::from_secs(5));
        }

        assert_matches!(
            fx.manager.write_record("k", fx.record("k", "v"), None).await,
            Err(Error::QuorumNotReached {
                acks: 0,
                required: 2
            })
        );
        assert_matches!(
            fx.manager.read_record("k", None).await,
            Err(Error::NodeUnavailable { .. })
        );
    }

    #[tokio::test]
    async fn test_caller_deadline_is_timeout() {
        let fx = fixture(&["a", "b"], 2, 2, 1);
        for f in fx.faulty.values() {
            f.set_latency(Duration::from_secs(5));
        }
        let deadline = Some(Duration::from_millis(30));

        assert_matches!(
            fx.manager.write_record("k", fx.record("k", "v"), deadline).await,
            Err(Error::Timeout { .. })
        );
        assert_matches!(
            fx.manager.read_record("k", deadline).await,
            Err(Error::Timeout { .. })
        );
    }

    #[tokio::test]
    async fn test_miss_falls_through_and_repairs() {
        let fx = fixture(&["a", "b", "c"], 2, 1, 1);
        let replicas = fx.replicas("k");
        let (primary, replica) = (&replicas[0], &replicas[1]);

        // value only on the replica
        fx.faulty[primary].set_down(true);
        fx.manager
            .write_record("k", fx.record("k", "v"), None)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        fx.faulty[primary].set_down(false);
        assert!(fx.stored_version(replica, "k").await.is_some());

        // primary misses, replica answers, primary gets repaired
        assert_eq!(fx.value("k").await.unwrap().as_ref(), b"v");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            fx.stored_version(primary, "k").await,
            fx.stored_version(replica, "k").await
        );
    }

    #[tokio::test]
    async fn test_highest_version_wins() {
        let fx = fixture(&["a", "b"], 2, 2, 2);
        let old = fx.record("k", "old");
        let new = fx.record("k", "new");
        let snapshot = fx.manager.topology().load();
        snapshot.node("a").unwrap().write_record("k", &old).await.unwrap();
        snapshot.node("b").unwrap().write_record("k", &new).await.unwrap();

        assert_eq!(fx.value("k").await.unwrap().as_ref(), b"new");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fx.stored_version("a", "k").await, Some(new.version()));
    }

    #[tokio::test]
    async fn test_tombstone_prevents_resurrection() {
        let fx = fixture(&["a", "b"], 2, 1, 2);
        fx.manager
            .write_record("k", fx.record("k", "v"), None)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // b misses the delete
        fx.faulty["b"].set_down(true);
        let tombstone = fx
            .pipeline
            .tombstone(fx.manager.next_version(), Duration::from_secs(60));
        let receipt = fx.manager.delete("k", tombstone, None).await.unwrap();
        assert!(receipt.replaced_live);
        fx.faulty["b"].set_down(false);

        // stale b must not bring the value back; it gets the tombstone instead
        assert!(fx.manager.read_record("k", None).await.unwrap().is_none());
        tokio::time::sleep(Duration::from_millis(50)).await;
        let b = fx.manager.topology().load().node("b").unwrap().read_record("k").await.unwrap();
        assert!(b.unwrap().is_tombstone());
    }

    #[tokio::test]
    async fn test_integrity_error_surfaces() {
        let fx = fixture(&["a"], 1, 1, 1);
        let record = fx.record("k", "v");
        let mut bytes = bytes::BytesMut::from(record.encode().as_ref());
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fx.faulty["a"].set("k", bytes.freeze(), None).await.unwrap();

        assert_matches!(
            fx.manager.read_record("k", None).await,
            Err(Error::Integrity { .. })
        );
    }

    #[tokio::test]
    async fn test_strict_topology() {
        let mut fx = fixture(&["a", "b"], 2, 1, 1);
        fx.manager.settings.strict_topology = true;
        fx.faulty["a"].fail_next(3);
        for _ in 0..3 {
            let _ = fx.manager.topology().load().node("a").unwrap().ping().await;
        }
        assert_matches!(
            fx.manager.read_record("k", None).await,
            Err(Error::Topology {
                available: 1,
                required: 2
            })
        );
    }

    #[tokio::test]
    async fn test_purge_if() {
        let fx = fixture(&["a", "b"], 2, 2, 1);
        let record = fx
            .pipeline
            .encode(
                "k",
                b"v",
                fx.manager.next_version(),
                &EntryOptions::default().with_priority(Priority::Low),
            )
            .unwrap();
        fx.manager.write_record("k", record, None).await.unwrap();

        let none = fx
            .manager
            .purge_if("k", None, |h| h.priority == Priority::High)
            .await
            .unwrap();
        assert_eq!(none.removed, 0);

        let report = fx.manager.purge("k").await.unwrap();
        assert_eq!(report.removed, 2);
        assert!(report.bytes_freed > 0);
        assert!(fx.manager.read_record("k", None).await.unwrap().is_none());
    }
}
