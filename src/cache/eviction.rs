//! Eviction Scheduler
//!
//! Background pass over every node, independent of request traffic:
//!
//! 1. Expired values and expired tombstones are purged from their whole
//!    replica set.
//! 2. A node above its high watermark sheds live entries in ascending
//!    priority, oldest version first, until it drops below the low
//!    watermark. Pinned entries are never evicted.
//!
//! Every removal goes through the replication manager so replicas stay
//! consistent. One `Eviction` event summarizes each pass.
//!
//! Backends with native TTL usually drop expired records on their own; the
//! sweep catches the ones that do not, and tombstones written without a TTL.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::bus::EventBus;
use super::entry::{Priority, Record, RecordHeader};
use super::metrics::{CacheMetrics, EvictionCounts};
use super::node::NodeHandle;
use super::replication::ReplicationManager;
use crate::config::EvictionConfig;
use crate::domain::events::CacheEvent;
use crate::error::Result;

/// Outcome of one eviction pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub counts: EvictionCounts,
    pub nodes_scanned: usize,
    /// Nodes that could not be scanned (down or erroring)
    pub nodes_skipped: usize,
    pub duration: Duration,
}

/// A live entry that pressure eviction may remove
#[derive(Debug, Clone, PartialEq, Eq)]
struct Victim {
    key: String,
    priority: Priority,
    version: u64,
    stored_size: u64,
}

/// Periodic TTL and pressure eviction
pub struct EvictionScheduler {
    replication: Arc<ReplicationManager>,
    config: EvictionConfig,
    events: EventBus,
    metrics: Arc<CacheMetrics>,
    /// Serializes scheduled and forced passes
    pass_lock: Mutex<()>,
}

impl EvictionScheduler {
    pub fn new(
        replication: Arc<ReplicationManager>,
        config: EvictionConfig,
        events: EventBus,
        metrics: Arc<CacheMetrics>,
    ) -> Self {
        Self {
            replication,
            config,
            events,
            metrics,
            pass_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &EvictionConfig {
        &self.config
    }

    /// Run passes on the configured interval until `shutdown` fires
    #[instrument(skip_all, name = "eviction_scheduler")]
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(interval = ?self.config.interval, "Starting eviction scheduler");

        let mut tick = interval(self.config.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        tick.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Eviction scheduler shutting down");
                    break;
                }
                _ = tick.tick() => {
                    if let Err(e) = self.run_pass().await {
                        error!("Eviction pass failed: {}", e);
                    }
                }
            }
        }
    }

    /// Run one pass now
    #[instrument(skip(self))]
    pub async fn run_pass(&self) -> Result<EvictionReport> {
        let _guard = self.pass_lock.lock().await;
        let started = Instant::now();
        let snapshot = self.replication.topology().load();

        let mut report = EvictionReport::default();
        report.counts.passes = 1;
        // Keys already purged across their replica set this pass
        let mut purged: HashSet<String> = HashSet::new();

        for node in snapshot.nodes() {
            match self.sweep_node(node, &mut purged, &mut report.counts).await {
                Ok(()) => report.nodes_scanned += 1,
                Err(e) => {
                    debug!(node = node.id(), error = %e, "Skipping node in eviction pass");
                    report.nodes_skipped += 1;
                }
            }
        }

        report.duration = started.elapsed();
        self.metrics.record_eviction_pass(&report.counts);
        self.events.publish(CacheEvent::eviction(
            report.counts.removed(),
            report.counts.bytes_freed,
            report.duration,
        ));

        if report.counts.removed() > 0 {
            info!(
                expired = report.counts.expired,
                tombstones = report.counts.tombstones,
                pressure = report.counts.pressure,
                bytes_freed = report.counts.bytes_freed,
                "Eviction pass complete"
            );
        }
        Ok(report)
    }

    async fn sweep_node(
        &self,
        node: &Arc<NodeHandle>,
        purged: &mut HashSet<String>,
        counts: &mut EvictionCounts,
    ) -> Result<()> {
        let keys = node.keys().await?;
        let mut victims = Vec::new();

        for batch in keys.chunks(self.config.scan_batch.max(1)) {
            let values = node.multi_get(batch).await?;
            for (key, value) in batch.iter().zip(values) {
                let Some(bytes) = value else { continue };
                let Ok(header) = Record::peek_header(&bytes) else {
                    warn!(node = node.id(), key = %key, "Unreadable record header");
                    continue;
                };

                if header.is_expired() {
                    if purged.contains(key) {
                        continue;
                    }
                    let report = self
                        .replication
                        .purge_if(key, Some(node), RecordHeader::is_expired)
                        .await?;
                    if report.removed > 0 {
                        if header.tombstone {
                            counts.tombstones += 1;
                        } else {
                            counts.expired += 1;
                        }
                        counts.bytes_freed += report.bytes_freed;
                    }
                    purged.insert(key.clone());
                } else if !header.tombstone && header.priority.is_evictable() {
                    victims.push(Victim {
                        key: key.clone(),
                        priority: header.priority,
                        version: header.version,
                        stored_size: bytes.len() as u64,
                    });
                }
            }
        }

        let Some(to_free) = self.pressure_target(node).await? else {
            return Ok(());
        };
        debug!(node = node.id(), to_free, "Node above high watermark");

        victims.sort_by_key(|v| (v.priority, v.version));
        let mut freed_here = 0u64;
        for victim in victims {
            if freed_here >= to_free {
                break;
            }
            if purged.contains(&victim.key) {
                continue;
            }
            // Only the version that was scanned; a newer write survives
            let (priority, version) = (victim.priority, victim.version);
            let report = self
                .replication
                .purge_if(&victim.key, Some(node), move |h| {
                    !h.tombstone && h.version == version && h.priority == priority
                })
                .await?;
            if report.removed > 0 {
                counts.pressure += 1;
                counts.bytes_freed += report.bytes_freed;
                freed_here += victim.stored_size;
            }
            purged.insert(victim.key);
        }

        if freed_here < to_free {
            warn!(
                node = node.id(),
                freed = freed_here,
                wanted = to_free,
                "Could not reach low watermark; remaining entries are pinned"
            );
        }
        Ok(())
    }

    /// Bytes to free on `node`, if it is above the high watermark
    async fn pressure_target(&self, node: &NodeHandle) -> Result<Option<u64>> {
        let Some(capacity) = self.config.capacity_bytes else {
            return Ok(None);
        };
        let usage = node.usage().await?;
        Ok(bytes_to_free(
            usage.used_bytes,
            capacity,
            self.config.high_watermark,
            self.config.low_watermark,
        ))
    }
}

/// Bytes to remove to get from `used` down to the low watermark, once `used`
/// exceeds the high watermark
fn bytes_to_free(used: u64, capacity: u64, high: f64, low: f64) -> Option<u64> {
    let high_mark = (capacity as f64 * high) as u64;
    if used <= high_mark {
        return None;
    }
    let low_mark = (capacity as f64 * low) as u64;
    Some(used.saturating_sub(low_mark))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryBackend;
    use crate::cache::bus::SubscriptionFilter;
    use crate::cache::entry::EntryOptions;
    use crate::cache::pipeline::Pipeline;
    use crate::cache::replication::ReplicationSettings;
    use crate::cache::ring::HashRing;
    use crate::cache::topology::{Topology, TopologySnapshot};
    use crate::config::{BreakerConfig, NodeConfig, PipelineConfig, PoolConfig};
    use crate::domain::events::EventType;
    use crate::domain::ports::BackendStore;
    use std::collections::HashMap;

    struct Fixture {
        scheduler: EvictionScheduler,
        replication: Arc<ReplicationManager>,
        backends: HashMap<String, Arc<InMemoryBackend>>,
        pipeline: Pipeline,
        bus: EventBus,
    }

    fn fixture(ids: &[&str], rf: usize, config: EvictionConfig) -> Fixture {
        let bus = EventBus::new(64);
        let backends: HashMap<String, Arc<InMemoryBackend>> = ids
            .iter()
            .map(|id| (id.to_string(), Arc::new(InMemoryBackend::new())))
            .collect();
        let nodes: HashMap<String, Arc<NodeHandle>> = ids
            .iter()
            .map(|id| {
                (
                    id.to_string(),
                    Arc::new(NodeHandle::new(
                        &NodeConfig::new(*id, *id),
                        backends[*id].clone(),
                        &BreakerConfig::default(),
                        &PoolConfig::default(),
                        None,
                    )),
                )
            })
            .collect();
        let ring = HashRing::new(ids.iter().map(|id| (*id, 1)), 64, rf);
        let topology = Arc::new(Topology::new(TopologySnapshot::new(ring, nodes, 1)));
        let metrics = Arc::new(CacheMetrics::new());
        let replication = Arc::new(ReplicationManager::new(
            topology,
            ReplicationSettings {
                replication_factor: rf,
                write_quorum: rf,
                read_quorum: 1,
                operation_timeout: Duration::from_secs(1),
                strict_topology: false,
                repair_remaining: false,
                tombstone_ttl: Duration::from_secs(60),
            },
            bus.clone(),
            metrics.clone(),
        ));
        Fixture {
            scheduler: EvictionScheduler::new(replication.clone(), config, bus.clone(), metrics),
            replication,
            backends,
            pipeline: Pipeline::new(&PipelineConfig::default()).unwrap(),
            bus,
        }
    }

    impl Fixture {
        async fn put(&self, key: &str, size: usize, options: EntryOptions) {
            let value = vec![b'x'; size];
            let record = self
                .pipeline
                .encode(key, &value, self.replication.next_version(), &options)
                .unwrap();
            self.replication.write_record(key, record, None).await.unwrap();
        }

        /// Store on every node without a backend TTL
        async fn put_without_native_ttl(&self, key: &str, record: &Record) {
            for backend in self.backends.values() {
                backend.set(key, record.encode(), None).await.unwrap();
            }
        }

        async fn present(&self, key: &str) -> bool {
            self.replication.read_record(key, None).await.unwrap().is_some()
        }
    }

    #[test]
    fn test_bytes_to_free() {
        assert_eq!(bytes_to_free(800, 1000, 0.9, 0.8), None);
        assert_eq!(bytes_to_free(900, 1000, 0.9, 0.8), None);
        assert_eq!(bytes_to_free(950, 1000, 0.9, 0.8), Some(150));
    }

    #[tokio::test]
    async fn test_expired_entries_purged() {
        let fx = fixture(&["a", "b"], 2, EvictionConfig::default());
        let short = fx
            .pipeline
            .encode(
                "short",
                b"value",
                fx.replication.next_version(),
                &EntryOptions::default().with_ttl(Duration::from_millis(30)),
            )
            .unwrap();
        fx.put_without_native_ttl("short", &short).await;
        fx.put("long", 10, EntryOptions::default()).await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        let sub = fx.bus.subscribe("t", SubscriptionFilter::types([EventType::Eviction]));
        let report = fx.scheduler.run_pass().await.unwrap();

        assert_eq!(report.counts.expired, 1);
        assert_eq!(report.counts.pressure, 0);
        assert_eq!(report.nodes_scanned, 2);
        assert!(report.counts.bytes_freed > 0);
        assert!(fx.present("long").await);
        for backend in fx.backends.values() {
            assert!(backend.get("short").await.unwrap().is_none());
        }

        // one summary event per pass
        let event = sub.try_recv().unwrap();
        assert_eq!(event.payload.count, Some(1));
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_expired_tombstones_purged() {
        let fx = fixture(&["a"], 1, EvictionConfig::default());
        let tombstone = fx
            .pipeline
            .tombstone(fx.replication.next_version(), Duration::from_millis(20));
        fx.put_without_native_ttl("gone", &tombstone).await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        let report = fx.scheduler.run_pass().await.unwrap();
        assert_eq!(report.counts.tombstones, 1);
        let node = fx.replication.topology().load().node("a").unwrap().clone();
        assert!(node.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pressure_evicts_by_priority_and_age() {
        let config = EvictionConfig {
            capacity_bytes: Some(1000),
            high_watermark: 0.5,
            low_watermark: 0.45,
            ..Default::default()
        };
        let fx = fixture(&["a"], 1, config);
        // 110 stored bytes each: 660 used, 210 to free
        fx.put("pinned", 48, EntryOptions::default().with_priority(Priority::Pinned))
            .await;
        fx.put("high", 48, EntryOptions::default().with_priority(Priority::High))
            .await;
        fx.put("old-normal", 48, EntryOptions::default()).await;
        fx.put("low", 48, EntryOptions::default().with_priority(Priority::Low))
            .await;
        fx.put("new-normal", 48, EntryOptions::default()).await;
        fx.put("pinned-2", 48, EntryOptions::default().with_priority(Priority::Pinned))
            .await;

        let report = fx.scheduler.run_pass().await.unwrap();
        assert_eq!(report.counts.pressure, 2);
        assert!(!fx.present("low").await);
        assert!(!fx.present("old-normal").await);
        assert!(fx.present("new-normal").await);
        assert!(fx.present("pinned").await);
        assert!(fx.present("pinned-2").await);
        assert!(fx.present("high").await);
    }

    #[tokio::test]
    async fn test_only_pinned_left() {
        let config = EvictionConfig {
            capacity_bytes: Some(100),
            high_watermark: 0.5,
            low_watermark: 0.2,
            ..Default::default()
        };
        let fx = fixture(&["a"], 1, config);
        fx.put("p", 200, EntryOptions::default().with_priority(Priority::Pinned))
            .await;

        let report = fx.scheduler.run_pass().await.unwrap();
        assert_eq!(report.counts.removed(), 0);
        assert!(fx.present("p").await);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let fx = fixture(
            &["a"],
            1,
            EvictionConfig {
                interval: Duration::from_millis(10),
                ..Default::default()
            },
        );
        let scheduler = Arc::new(fx.scheduler);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(scheduler.clone().run(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(55)).await;
        shutdown.cancel();
        handle.await.unwrap();
        assert!(scheduler.metrics.eviction_counts().passes >= 2);
    }
}
