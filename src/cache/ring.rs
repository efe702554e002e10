//! Consistent Hash Ring
//!
//! Maps keys to an ordered list of nodes. Each node owns `weight × V`
//! virtual points placed at `hash("{node_id}#{i}")`; a key belongs to the
//! first point clockwise from its own hash, and its replicas are the next
//! distinct physical nodes after that.
//!
//! The hash is the first 8 bytes (big-endian) of SHA-256, so placement is
//! identical across processes, platforms and releases.
//!
//! Rings are immutable. Adding or removing a node builds a new ring; only
//! that node's virtual points change owner, so roughly `1/N` of keys move.

use std::collections::{HashMap, HashSet};

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Stable 64-bit hash used for both keys and virtual points
pub fn hash_key(data: &[u8]) -> u64 {
    let digest = Sha256::digest(data);
    let mut first = [0u8; 8];
    first.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(first)
}

/// A physical node on the ring
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingNode {
    pub id: String,
    pub weight: u32,
}

/// Where a key lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub primary: String,
    /// Replica nodes in ring order, excluding the primary
    pub replicas: Vec<String>,
    /// Ring range `(start, end]` of the owning virtual point
    pub range: (u64, u64),
}

impl Partition {
    /// Primary followed by replicas
    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.primary.as_str()).chain(self.replicas.iter().map(String::as_str))
    }
}

/// Immutable consistent hash ring
#[derive(Debug, Clone)]
pub struct HashRing {
    /// Sorted `(point hash, index into nodes)`
    points: Vec<(u64, usize)>,
    nodes: Vec<RingNode>,
    virtual_nodes: u32,
    replication_factor: usize,
}

impl HashRing {
    /// Build a ring from `(id, weight)` pairs
    pub fn new<I, S>(nodes: I, virtual_nodes: u32, replication_factor: usize) -> Self
    where
        I: IntoIterator<Item = (S, u32)>,
        S: Into<String>,
    {
        let mut seen = HashSet::new();
        let nodes: Vec<RingNode> = nodes
            .into_iter()
            .map(|(id, weight)| RingNode {
                id: id.into(),
                weight: weight.max(1),
            })
            .filter(|n| seen.insert(n.id.clone()))
            .collect();

        let mut points = Vec::with_capacity(
            nodes.iter().map(|n| (n.weight * virtual_nodes) as usize).sum(),
        );
        for (idx, node) in nodes.iter().enumerate() {
            for i in 0..node.weight * virtual_nodes {
                let point = hash_key(format!("{}#{}", node.id, i).as_bytes());
                points.push((point, idx));
            }
        }
        // Identical hashes are ordered by node id so every process agrees
        points.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| nodes[a.1].id.cmp(&nodes[b.1].id)));

        Self {
            points,
            nodes,
            virtual_nodes,
            replication_factor,
        }
    }

    /// Ring with `id` added
    pub fn with_node(&self, id: &str, weight: u32) -> Result<Self> {
        if self.contains(id) {
            return Err(Error::InvalidInput(format!("node {} is already in the ring", id)));
        }
        let nodes = self
            .nodes
            .iter()
            .map(|n| (n.id.clone(), n.weight))
            .chain(std::iter::once((id.to_string(), weight)));
        Ok(Self::new(nodes, self.virtual_nodes, self.replication_factor))
    }

    /// Ring with `id` removed
    pub fn without_node(&self, id: &str) -> Result<Self> {
        if !self.contains(id) {
            return Err(Error::NodeNotFound(id.to_string()));
        }
        let nodes = self
            .nodes
            .iter()
            .filter(|n| n.id != id)
            .map(|n| (n.id.clone(), n.weight));
        Ok(Self::new(nodes, self.virtual_nodes, self.replication_factor))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn replication_factor(&self) -> usize {
        self.replication_factor
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.iter().any(|n| n.id == id)
    }

    pub fn nodes(&self) -> &[RingNode] {
        &self.nodes
    }

    /// Number of virtual points
    pub fn point_count(&self) -> usize {
        self.points.len()
    }

    /// Index into `points` of the first point clockwise from `hash`
    fn successor(&self, hash: u64) -> usize {
        let idx = self.points.partition_point(|(p, _)| *p < hash);
        if idx == self.points.len() {
            0
        } else {
            idx
        }
    }

    /// Up to `n` distinct nodes clockwise from `key`'s hash
    pub fn preference_list(&self, key: &str, n: usize) -> Vec<&str> {
        if self.points.is_empty() {
            return Vec::new();
        }
        let n = n.min(self.nodes.len());
        let start = self.successor(hash_key(key.as_bytes()));
        let mut chosen: Vec<usize> = Vec::with_capacity(n);

        for offset in 0..self.points.len() {
            if chosen.len() == n {
                break;
            }
            let (_, node_idx) = self.points[(start + offset) % self.points.len()];
            if !chosen.contains(&node_idx) {
                chosen.push(node_idx);
            }
        }
        chosen.into_iter().map(|i| self.nodes[i].id.as_str()).collect()
    }

    /// Primary owner of `key`
    pub fn primary(&self, key: &str) -> Option<&str> {
        self.preference_list(key, 1).into_iter().next()
    }

    /// Primary plus `R - 1` replicas for `key`.
    ///
    /// Fails with `Topology` if the ring holds fewer than `R` nodes.
    pub fn lookup(&self, key: &str) -> Result<Partition> {
        if self.nodes.len() < self.replication_factor || self.points.is_empty() {
            return Err(Error::Topology {
                available: self.nodes.len(),
                required: self.replication_factor.max(1),
            });
        }

        let idx = self.successor(hash_key(key.as_bytes()));
        let end = self.points[idx].0;
        let start = if idx == 0 {
            self.points[self.points.len() - 1].0
        } else {
            self.points[idx - 1].0
        };

        let mut nodes = self
            .preference_list(key, self.replication_factor.max(1))
            .into_iter()
            .map(str::to_string);
        let primary = nodes.next().ok_or_else(|| Error::Internal("empty preference list".into()))?;

        Ok(Partition {
            primary,
            replicas: nodes.collect(),
            range: (start, end),
        })
    }

    /// Fraction of the hash space each node is primary for
    pub fn ownership_shares(&self) -> HashMap<String, f64> {
        let mut shares: HashMap<String, f64> = HashMap::new();
        if self.points.is_empty() {
            return shares;
        }
        let space = u64::MAX as f64 + 1.0;
        for (i, (point, node_idx)) in self.points.iter().enumerate() {
            let prev = if i == 0 {
                self.points[self.points.len() - 1].0
            } else {
                self.points[i - 1].0
            };
            let span = point.wrapping_sub(prev) as f64;
            let span = if self.points.len() == 1 { space } else { span };
            *shares.entry(self.nodes[*node_idx].id.clone()).or_default() += span / space;
        }
        shares
    }

    /// Owner of the point at `idx`, by id
    fn owner(&self, idx: usize) -> &str {
        &self.nodes[self.points[idx].1].id
    }

    /// Exact fraction of the hash space whose primary differs between rings
    pub fn ownership_change(old: &HashRing, new: &HashRing) -> f64 {
        match (old.points.is_empty(), new.points.is_empty()) {
            (true, true) => return 0.0,
            (true, false) | (false, true) => return 1.0,
            _ => {}
        }

        let mut boundaries: Vec<u64> = old
            .points
            .iter()
            .chain(new.points.iter())
            .map(|(p, _)| *p)
            .collect();
        boundaries.sort_unstable();
        boundaries.dedup();

        let space: u128 = 1u128 << 64;
        let mut changed: u128 = 0;

        // Segment (b[i-1], b[i]] is owned by each ring's successor of b[i]
        for pair in boundaries.windows(2) {
            let (lo, hi) = (pair[0], pair[1]);
            if old.owner(old.successor(hi)) != new.owner(new.successor(hi)) {
                changed += (hi - lo) as u128;
            }
        }

        // Wrap-around segment (b_last, MAX] ∪ [0, b_0] belongs to each ring's first point
        let first = boundaries[0];
        let last = boundaries[boundaries.len() - 1];
        if old.owner(0) != new.owner(0) {
            changed += space - last as u128 + first as u128;
        }

        changed as f64 / space as f64
    }
}

// =============================================================================
// Tests
// =============================================================================
