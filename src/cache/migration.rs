//! Rebalance Data Migration
//!
//! After a topology change, copies every record to the nodes that became
//! its replicas and drops the copies on nodes that stopped being replicas.
//! Copies go through the versioned node write, so a migration never
//! overwrites a newer value written concurrently by a client.
//!
//! A source copy is only removed once every new owner has acknowledged the
//! record. Nodes leaving the cluster are read from but never modified.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use super::entry::Record;
use super::node::NodeHandle;
use super::ring::HashRing;
use super::topology::TopologySnapshot;
use crate::domain::ports::ConditionalWrite;
use crate::error::Result;

/// Outcome of a rebalance migration
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MigrationReport {
    /// Records inspected across all source nodes
    pub scanned: u64,
    /// Records stored on a new owner
    pub copied: u64,
    /// Stale copies removed from nodes that no longer own the key
    pub removed: u64,
    /// Copies or removals that failed
    pub failed: u64,
    /// Source nodes that could not be scanned
    pub unreachable: Vec<String>,
    /// Fraction of hash space whose primary changed
    pub ownership_change: f64,
    pub duration: Duration,
}

impl MigrationReport {
    fn merge(&mut self, other: NodeMigration) {
        self.scanned += other.scanned;
        self.copied += other.copied;
        self.removed += other.removed;
        self.failed += other.failed;
    }
}

#[derive(Debug, Default)]
struct NodeMigration {
    scanned: u64,
    copied: u64,
    removed: u64,
    failed: u64,
}

/// Moves records between snapshots
#[derive(Debug, Clone)]
pub struct Migrator {
    batch_size: usize,
}

impl Migrator {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }

    /// Migrate from `old` to `new`, scanning every node of the old snapshot
    #[instrument(skip_all, fields(from = old.generation(), to = new.generation()))]
    pub async fn rebalance(&self, old: &TopologySnapshot, new: &TopologySnapshot) -> MigrationReport {
        let started = Instant::now();
        let mut report = MigrationReport {
            ownership_change: HashRing::ownership_change(old.ring(), new.ring()),
            ..Default::default()
        };

        let sources: Vec<&Arc<NodeHandle>> = old.nodes().collect();
        let results = futures::future::join_all(
            sources
                .iter()
                .map(|source| self.migrate_from(source, old, new)),
        )
        .await;

        for (source, result) in sources.iter().zip(results) {
            match result {
                Ok(node_report) => report.merge(node_report),
                Err(e) => {
                    warn!(node = source.id(), error = %e, "Cannot scan node for migration");
                    report.unreachable.push(source.id().to_string());
                }
            }
        }

        report.duration = started.elapsed();
        info!(
            scanned = report.scanned,
            copied = report.copied,
            removed = report.removed,
            failed = report.failed,
            ownership_change = report.ownership_change,
            "Rebalance migration complete"
        );
        report
    }

    async fn migrate_from(
        &self,
        source: &Arc<NodeHandle>,
        old: &TopologySnapshot,
        new: &TopologySnapshot,
    ) -> Result<NodeMigration> {
        let mut stats = NodeMigration::default();
        let keys = source.keys().await?;
        let source_stays = new.node(source.id()).is_ok();

        for batch in keys.chunks(self.batch_size) {
            let values = source.multi_get(batch).await?;
            for (key, value) in batch.iter().zip(values) {
                let Some(bytes) = value else { continue };
                let Ok(record) = Record::decode(&bytes) else {
                    debug!(node = source.id(), key = %key, "Skipping unreadable record");
                    continue;
                };
                if record.header.is_expired() {
                    continue;
                }
                stats.scanned += 1;

                let Ok(new_owners) = new.candidates(key) else {
                    continue;
                };
                let old_owners: HashSet<String> = old
                    .partition(key)
                    .map(|p| p.nodes().map(str::to_owned).collect())
                    .unwrap_or_default();

                let mut all_acked = true;
                for target in &new_owners {
                    if old_owners.contains(target.id()) || target.id() == source.id() {
                        continue;
                    }
                    match target.write_record(key, &record).await {
                        Ok(write) => {
                            if write.outcome == ConditionalWrite::Stored {
                                stats.copied += 1;
                            }
                        }
                        Err(e) => {
                            debug!(key = %key, target = target.id(), error = %e, "Migration copy failed");
                            stats.failed += 1;
                            all_acked = false;
                        }
                    }
                }

                let still_owner = new_owners.iter().any(|n| n.id() == source.id());
                if source_stays && !still_owner && all_acked {
                    match source.delete(key).await {
                        Ok(true) => stats.removed += 1,
                        Ok(false) => {}
                        Err(e) => {
                            debug!(key = %key, error = %e, "Could not drop stale copy");
                            stats.failed += 1;
                        }
                    }
                }
            }
        }
        Ok(stats)
    }
}
