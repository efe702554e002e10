//! Distributed Cache Engine
//!
//! Partitions keys over a set of backend nodes with a consistent hash ring,
//! replicates every key to `R` nodes and answers reads and writes through
//! quorums.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                        DistributedCache (facade)                          │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  Pipeline             │ ReplicationManager    │ Background               │
//! │  ┌────────────────┐   │ ┌─────────────────┐   │ ┌────────────────────┐   │
//! │  │ serde_json     │   │ │ W-of-R writes   │   │ │ EvictionScheduler  │   │
//! │  │ lz4 / zlib     │   │ │ R-of-N reads    │   │ │ HealthMonitor      │   │
//! │  │ AES-256-GCM    │   │ │ read repair     │   │ │ BackupManager      │   │
//! │  │ SHA-256 check  │   │ └─────────────────┘   │ └────────────────────┘   │
//! │  └────────────────┘   │          │            │                          │
//! │                       │   Topology snapshot (HashRing + NodeHandles)     │
//! │                       │          │                                       │
//! │                       │   NodeHandle = breaker + pool + BackendStore     │
//! └──────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                EventBus ──▶ subscribers / fallback store
//! ```
//!
//! # Consistency
//!
//! - Every record carries a version; replicas keep the highest one
//! - Deletes write tombstones so an older value cannot come back
//! - Reads return the highest version seen and repair stale replicas
//! - Topology changes swap an immutable snapshot; in-flight operations keep
//!   the snapshot they started with

pub mod backup;
pub mod breaker;
pub mod bus;
pub mod compression;
pub mod encryption;
pub mod entry;
pub mod eviction;
pub mod health;
pub mod manager;
pub mod metrics;
pub mod migration;
pub mod node;
pub mod pipeline;
pub mod pool;
pub mod replication;
pub mod ring;
pub mod topology;

#[cfg(test)]
mod proptest;

pub use backup::{BackupInfo, BackupManager, RestoreReport};
pub use breaker::{BreakerState, CircuitBreaker};
pub use bus::{BusStats, EventBus, Subscription, SubscriptionFilter};
pub use compression::{CompressionAlgorithm, CompressionManager};
pub use encryption::Keyring;
pub use entry::{EntryOptions, Priority, Record, RecordHeader};
pub use eviction::{EvictionReport, EvictionScheduler};
pub use health::{ClusterHealth, HealthMonitor, HealthStatus};
pub use manager::{BackgroundTasks, CacheBuilder, CacheStats, DistributedCache, SetOptions};
pub use metrics::{CacheMetrics, EvictionCounts, MetricsSnapshot};
pub use migration::{MigrationReport, Migrator};
pub use node::{NodeHandle, NodeHealth, NodeState};
pub use pipeline::Pipeline;
pub use replication::{ReplicationManager, WriteReceipt};
pub use ring::{HashRing, Partition};
pub use topology::{Topology, TopologySnapshot};
