//! Topology Snapshots
//!
//! The ring and the node handles it refers to, published together as one
//! immutable snapshot. Readers load the current snapshot lock-free; admin
//! operations build a new one and swap it in atomically. Node handles are
//! shared between snapshots, so breaker and pool state survive a swap.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;

use super::node::{NodeHandle, NodeState};
use super::ring::{HashRing, Partition};
use crate::error::{Error, Result};

/// One consistent view of ring and nodes
#[derive(Debug)]
pub struct TopologySnapshot {
    ring: HashRing,
    nodes: HashMap<String, Arc<NodeHandle>>,
    generation: u64,
}

impl TopologySnapshot {
    pub fn new(ring: HashRing, nodes: HashMap<String, Arc<NodeHandle>>, generation: u64) -> Self {
        Self {
            ring,
            nodes,
            generation,
        }
    }

    pub fn ring(&self) -> &HashRing {
        &self.ring
    }

    /// Incremented on every swap
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn node(&self, id: &str) -> Result<&Arc<NodeHandle>> {
        self.nodes
            .get(id)
            .ok_or_else(|| Error::NodeNotFound(id.to_string()))
    }

    /// Nodes in ring declaration order
    pub fn nodes(&self) -> impl Iterator<Item = &Arc<NodeHandle>> {
        self.ring.nodes().iter().filter_map(|n| self.nodes.get(&n.id))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn healthy_count(&self) -> usize {
        self.nodes
            .values()
            .filter(|n| n.state() == NodeState::Healthy)
            .count()
    }

    pub fn partition(&self, key: &str) -> Result<Partition> {
        self.ring.lookup(key)
    }

    /// Replica set for `key`, primary first
    pub fn candidates(&self, key: &str) -> Result<Vec<Arc<NodeHandle>>> {
        let partition = self.ring.lookup(key)?;
        partition
            .nodes()
            .map(|id| self.node(id).cloned())
            .collect()
    }
}

/// Atomically swappable topology
#[derive(Debug)]
pub struct Topology {
    current: ArcSwap<TopologySnapshot>,
}

impl Topology {
    pub fn new(snapshot: TopologySnapshot) -> Self {
        Self {
            current: ArcSwap::from_pointee(snapshot),
        }
    }

    /// Current snapshot
    pub fn load(&self) -> Arc<TopologySnapshot> {
        self.current.load_full()
    }

    /// Publish `snapshot`, returning the one it replaced
    pub fn swap(&self, snapshot: TopologySnapshot) -> Arc<TopologySnapshot> {
        self.current.swap(Arc::new(snapshot))
    }
}
