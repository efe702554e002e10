//! Prometheus Metrics Exporter
//!
//! Publishes [`CacheStats`] in the Prometheus text format. Values are copied
//! from a stats snapshot on every scrape, so the exporter holds no counters
//! of its own.

use prometheus::{Encoder, Gauge, GaugeVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::cache::{CacheStats, NodeState};
use crate::error::{Error, Result};

const NAMESPACE: &str = "ringcache";

fn prom_err(e: prometheus::Error) -> Error {
    Error::Internal(format!("prometheus: {}", e))
}

/// Renders cache statistics for a `/metrics` endpoint
pub struct PrometheusExporter {
    registry: Registry,
    operations: IntGaugeVec,
    failures: IntGaugeVec,
    hit_ratio: Gauge,
    latency_seconds: GaugeVec,
    replica_maintenance: IntGaugeVec,
    node_up: IntGaugeVec,
    node_failures: IntGaugeVec,
    node_connections: IntGaugeVec,
    evicted: IntGaugeVec,
    evicted_bytes: IntGauge,
    eviction_passes: IntGauge,
    bus_events: IntGaugeVec,
    topology_generation: IntGauge,
}

impl std::fmt::Debug for PrometheusExporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusExporter").finish_non_exhaustive()
    }
}

impl PrometheusExporter {
    /// Create an exporter with its own registry
    pub fn new() -> Result<Self> {
        Self::with_registry(Registry::new())
    }

    /// Register the cache metrics in `registry`
    pub fn with_registry(registry: Registry) -> Result<Self> {
        let opts = |name: &str, help: &str| Opts::new(name, help).namespace(NAMESPACE);

        let operations = IntGaugeVec::new(
            opts("operations", "Cache operations since start"),
            &["op"],
        )
        .map_err(prom_err)?;
        let failures = IntGaugeVec::new(
            opts("failures", "Failed or degraded operations since start"),
            &["kind"],
        )
        .map_err(prom_err)?;
        let hit_ratio = Gauge::with_opts(opts("hit_ratio", "Hits over hits plus misses"))
            .map_err(prom_err)?;
        let latency_seconds = GaugeVec::new(
            opts("latency_seconds", "Moving average operation latency"),
            &["op"],
        )
        .map_err(prom_err)?;
        let replica_maintenance = IntGaugeVec::new(
            opts("replica_maintenance", "Replicas repaired or migrated since start"),
            &["kind"],
        )
        .map_err(prom_err)?;
        let node_up = IntGaugeVec::new(
            opts("node_up", "1 if the node breaker is closed"),
            &["node"],
        )
        .map_err(prom_err)?;
        let node_failures = IntGaugeVec::new(
            opts("node_consecutive_failures", "Consecutive failed calls per node"),
            &["node"],
        )
        .map_err(prom_err)?;
        let node_connections = IntGaugeVec::new(
            opts("node_connections_in_use", "Pool connections checked out per node"),
            &["node"],
        )
        .map_err(prom_err)?;
        let evicted = IntGaugeVec::new(
            opts("evicted_entries", "Entries removed by the eviction scheduler"),
            &["reason"],
        )
        .map_err(prom_err)?;
        let evicted_bytes = IntGauge::with_opts(opts("evicted_bytes", "Bytes freed by eviction"))
            .map_err(prom_err)?;
        let eviction_passes =
            IntGauge::with_opts(opts("eviction_passes", "Completed eviction passes"))
                .map_err(prom_err)?;
        let bus_events = IntGaugeVec::new(
            opts("bus_events", "Event bus deliveries by outcome"),
            &["outcome"],
        )
        .map_err(prom_err)?;
        let topology_generation = IntGauge::with_opts(opts(
            "topology_generation",
            "Generation of the active topology snapshot",
        ))
        .map_err(prom_err)?;

        registry.register(Box::new(operations.clone())).map_err(prom_err)?;
        registry.register(Box::new(failures.clone())).map_err(prom_err)?;
        registry.register(Box::new(hit_ratio.clone())).map_err(prom_err)?;
        registry.register(Box::new(latency_seconds.clone())).map_err(prom_err)?;
        registry
            .register(Box::new(replica_maintenance.clone()))
            .map_err(prom_err)?;
        registry.register(Box::new(node_up.clone())).map_err(prom_err)?;
        registry.register(Box::new(node_failures.clone())).map_err(prom_err)?;
        registry
            .register(Box::new(node_connections.clone()))
            .map_err(prom_err)?;
        registry.register(Box::new(evicted.clone())).map_err(prom_err)?;
        registry.register(Box::new(evicted_bytes.clone())).map_err(prom_err)?;
        registry.register(Box::new(eviction_passes.clone())).map_err(prom_err)?;
        registry.register(Box::new(bus_events.clone())).map_err(prom_err)?;
        registry
            .register(Box::new(topology_generation.clone()))
            .map_err(prom_err)?;

        Ok(Self {
            registry,
            operations,
            failures,
            hit_ratio,
            latency_seconds,
            replica_maintenance,
            node_up,
            node_failures,
            node_connections,
            evicted,
            evicted_bytes,
            eviction_passes,
            bus_events,
            topology_generation,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Copy a stats snapshot into the registered metrics
    pub fn update(&self, stats: &CacheStats) {
        let c = &stats.counters;
        for (op, value) in [
            ("get", c.gets),
            ("hit", c.hits),
            ("miss", c.misses),
            ("exists", c.exists),
            ("set", c.sets),
            ("delete", c.deletes),
        ] {
            self.operations.with_label_values(&[op]).set(value as i64);
        }
        for (kind, value) in [
            ("error", c.errors),
            ("quorum", c.quorum_failures),
            ("timeout", c.timeouts),
            ("degraded_write", c.degraded_writes),
        ] {
            self.failures.with_label_values(&[kind]).set(value as i64);
        }
        self.hit_ratio.set(stats.hit_rate);
        for (op, value) in [
            ("get", c.get_latency),
            ("exists", c.exists_latency),
            ("set", c.set_latency),
            ("delete", c.delete_latency),
        ] {
            self.latency_seconds
                .with_label_values(&[op])
                .set(value.as_secs_f64());
        }
        self.replica_maintenance
            .with_label_values(&["read_repair"])
            .set(c.read_repairs as i64);
        self.replica_maintenance
            .with_label_values(&["migrated"])
            .set(c.migrated_entries as i64);

        // Drop series of nodes that left the cluster
        self.node_up.reset();
        self.node_failures.reset();
        self.node_connections.reset();
        for node in &stats.node_health {
            let labels = [node.id.as_str()];
            self.node_up
                .with_label_values(&labels)
                .set(i64::from(node.state == NodeState::Healthy));
            self.node_failures
                .with_label_values(&labels)
                .set(i64::from(node.consecutive_failures));
            self.node_connections
                .with_label_values(&labels)
                .set(node.connections_in_use as i64);
        }

        let e = &stats.eviction_counts;
        for (reason, value) in [
            ("expired", e.expired),
            ("tombstone", e.tombstones),
            ("pressure", e.pressure),
        ] {
            self.evicted.with_label_values(&[reason]).set(value as i64);
        }
        self.evicted_bytes.set(e.bytes_freed as i64);
        self.eviction_passes.set(e.passes as i64);

        for (outcome, value) in [
            ("published", stats.bus.published),
            ("dropped", stats.bus.dropped),
            ("persisted", stats.bus.persisted),
        ] {
            self.bus_events.with_label_values(&[outcome]).set(value as i64);
        }
        self.topology_generation.set(stats.topology_generation as i64);
    }

    /// Text exposition of everything in the registry
    pub fn encode(&self) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(prom_err)?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}
