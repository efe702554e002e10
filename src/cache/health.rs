//! Node Health Monitor
//!
//! Pings every node on a fixed interval. Pings go through the node's breaker,
//! so a ping against a node whose cooldown has elapsed is the half-open probe
//! that brings it back. Nodes that stay down past the grace period get their
//! connection pool closed.
//!
//! Also builds the cluster health report served on `/healthz` and `/readyz`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::node::{NodeHealth, NodeState};
use super::topology::{Topology, TopologySnapshot};
use crate::error::Error;

// =============================================================================
// Health Report
// =============================================================================

/// Cluster health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// Every node is healthy
    Healthy,
    /// Some nodes are degraded or down, at least one is healthy
    Degraded,
    /// No healthy node left
    Unhealthy,
}

impl HealthStatus {
    /// Check if status is healthy or degraded (serving)
    pub fn is_operational(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "Healthy"),
            HealthStatus::Degraded => write!(f, "Degraded"),
            HealthStatus::Unhealthy => write!(f, "Unhealthy"),
        }
    }
}

/// Health of the whole node set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterHealth {
    pub status: HealthStatus,
    pub healthy_nodes: usize,
    pub total_nodes: usize,
    pub generation: u64,
    pub nodes: Vec<NodeHealth>,
}

impl ClusterHealth {
    pub fn from_snapshot(snapshot: &TopologySnapshot) -> Self {
        let nodes: Vec<NodeHealth> = snapshot.nodes().map(|n| n.health()).collect();
        let healthy_nodes = nodes
            .iter()
            .filter(|n| n.state == NodeState::Healthy)
            .count();
        let status = if nodes.is_empty() || healthy_nodes == 0 {
            HealthStatus::Unhealthy
        } else if healthy_nodes == nodes.len() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };
        Self {
            status,
            healthy_nodes,
            total_nodes: nodes.len(),
            generation: snapshot.generation(),
            nodes,
        }
    }
}

// =============================================================================
// Health Monitor
// =============================================================================

/// Result of pinging one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Up,
    /// Breaker open and cooling down; no network call made
    Skipped,
    Failed(String),
}

/// Periodic node prober
pub struct HealthMonitor {
    topology: Arc<Topology>,
    probe_interval: Duration,
    started: Instant,
}

impl HealthMonitor {
    pub fn new(topology: Arc<Topology>, probe_interval: Duration) -> Self {
        Self {
            topology,
            probe_interval,
            started: Instant::now(),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn report(&self) -> ClusterHealth {
        ClusterHealth::from_snapshot(&self.topology.load())
    }

    /// Probe until `shutdown` fires
    #[instrument(skip_all, name = "health_monitor")]
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(interval = ?self.probe_interval, "Starting health monitor");
        let mut tick = interval(self.probe_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Health monitor shutting down");
                    break;
                }
                _ = tick.tick() => {
                    self.probe_all().await;
                }
            }
        }
    }

    /// Ping every node once, closing pools of nodes down past the grace period
    pub async fn probe_all(&self) -> Vec<(String, ProbeOutcome)> {
        let snapshot = self.topology.load();
        let probes = snapshot.nodes().map(|node| async move {
            let outcome = match node.ping().await {
                Ok(()) => ProbeOutcome::Up,
                Err(Error::CircuitOpen { .. }) => ProbeOutcome::Skipped,
                Err(e) => ProbeOutcome::Failed(e.to_string()),
            };
            if node.past_grace_period() {
                node.pool().close();
            }
            if let ProbeOutcome::Failed(reason) = &outcome {
                debug!(node = node.id(), %reason, "Health probe failed");
            }
            (node.id().to_string(), outcome)
        });
        futures::future::join_all(probes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{FaultyBackend, InMemoryBackend};
    use crate::cache::node::NodeHandle;
    use crate::cache::ring::HashRing;
    use crate::config::{BreakerConfig, NodeConfig, PoolConfig};
    use std::collections::HashMap;

    fn monitor(faulty: &Arc<FaultyBackend>) -> HealthMonitor {
        let breaker = BreakerConfig {
            failure_threshold: 1,
            cooldown: Duration::from_millis(50),
            ..Default::default()
        };
        let pool = PoolConfig {
            down_grace_period: Duration::from_millis(20),
            ..Default::default()
        };
        let mut nodes = HashMap::new();
        nodes.insert(
            "a".to_string(),
            Arc::new(NodeHandle::new(
                &NodeConfig::new("a", "mem://a"),
                faulty.clone(),
                &breaker,
                &pool,
                None,
            )),
        );
        nodes.insert(
            "b".to_string(),
            Arc::new(NodeHandle::new(
                &NodeConfig::new("b", "mem://b"),
                Arc::new(InMemoryBackend::new()),
                &breaker,
                &pool,
                None,
            )),
        );
        let ring = HashRing::new([("a", 1), ("b", 1)], 16, 2);
        HealthMonitor::new(
            Arc::new(Topology::new(TopologySnapshot::new(ring, nodes, 1))),
            Duration::from_millis(10),
        )
    }

    #[tokio::test]
    async fn test_report_reflects_breakers() {
        let faulty = Arc::new(FaultyBackend::new("a", Arc::new(InMemoryBackend::new())));
        let monitor = monitor(&faulty);
        assert_eq!(monitor.report().status, HealthStatus::Healthy);

        faulty.set_down(true);
        let outcomes: HashMap<_, _> = monitor.probe_all().await.into_iter().collect();
        assert!(matches!(outcomes["a"], ProbeOutcome::Failed(_)));
        assert_eq!(outcomes["b"], ProbeOutcome::Up);

        let report = monitor.report();
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.healthy_nodes, 1);
        assert!(report.status.is_operational());
    }

    #[tokio::test]
    async fn test_pool_closed_then_reopened_by_probe() {
        let faulty = Arc::new(FaultyBackend::new("a", Arc::new(InMemoryBackend::new())));
        let monitor = monitor(&faulty);
        faulty.set_down(true);
        monitor.probe_all().await;

        // still cooling down: no network call
        let calls = faulty.calls();
        let outcomes: HashMap<_, _> = monitor.probe_all().await.into_iter().collect();
        assert_eq!(outcomes["a"], ProbeOutcome::Skipped);
        assert_eq!(faulty.calls(), calls);

        tokio::time::sleep(Duration::from_millis(30)).await;
        monitor.probe_all().await;
        let a = monitor.report().nodes.into_iter().find(|n| n.id == "a").unwrap();
        assert!(a.pool_closed);

        faulty.set_down(false);
        tokio::time::sleep(Duration::from_millis(60)).await;
        let outcomes: HashMap<_, _> = monitor.probe_all().await.into_iter().collect();
        assert_eq!(outcomes["a"], ProbeOutcome::Up);
        let a = monitor.report().nodes.into_iter().find(|n| n.id == "a").unwrap();
        assert_eq!(a.state, NodeState::Healthy);
        assert!(!a.pool_closed);
    }
}
