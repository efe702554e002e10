//! ringcache - Distributed Cache Engine
//!
//! A cache spread over a set of backend nodes. Keys are placed with a
//! consistent hash ring and replicated to `R` nodes; writes wait for `W`
//! acknowledgements and reads return the newest version among the replicas
//! they reach, repairing stale ones on the way.
//!
//! # Architecture
//!
//! ```text
//! caller ──▶ DistributedCache ──▶ Pipeline ──▶ ReplicationManager ──▶ NodeHandle ──▶ BackendStore
//!                 │                                                     (breaker + pool)
//!                 └──▶ EventBus ──▶ subscribers (EventLogger, ...)
//! ```
//!
//! # Features
//!
//! - Weighted consistent hashing with virtual nodes
//! - Quorum replication with versioned writes, tombstones and read repair
//! - Per-node circuit breakers and bounded connection pools
//! - Transparent LZ4/zlib compression and AES-256-GCM encryption
//! - TTL, tombstone and watermark eviction
//! - Online node addition and removal with data migration
//! - JSON snapshot backup and restore
//! - Event bus with bounded subscriber queues
//! - Prometheus metrics
//!
//! # Modules
//!
//! - [`adapters`] - Backend stores, event fallback, logging and metrics exporters
//! - [`cache`] - The engine: ring, replication, pipeline and background tasks
//! - [`config`] - YAML configuration
//! - [`domain`] - Ports and events
//! - [`error`] - Error types

pub mod adapters;
pub mod cache;
pub mod config;
pub mod domain;
pub mod error;

// Re-export commonly used types
pub use cache::{CacheStats, DistributedCache, SetOptions, WriteReceipt};
pub use config::{EngineConfig, NodeConfig};
pub use error::{Error, Result};

/// Crate version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
