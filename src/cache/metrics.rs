//! Cache Metrics Collection
//!
//! Operation counters and latency averages for the cache facade, plus the
//! cumulative counters of the eviction scheduler.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Which facade operation a latency sample belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Get,
    Exists,
    Set,
    Delete,
}

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    // Reads
    gets: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    exists: AtomicU64,

    // Writes
    sets: AtomicU64,
    deletes: AtomicU64,

    // Failures
    errors: AtomicU64,
    quorum_failures: AtomicU64,
    timeouts: AtomicU64,
    degraded_writes: AtomicU64,

    // Replica maintenance
    read_repairs: AtomicU64,
    migrated_entries: AtomicU64,

    // Operation latencies (microseconds, exponential moving average)
    get_latency_us: AtomicU64,
    exists_latency_us: AtomicU64,
    set_latency_us: AtomicU64,
    delete_latency_us: AtomicU64,

    // Eviction
    eviction_passes: AtomicU64,
    evicted_expired: AtomicU64,
    evicted_tombstones: AtomicU64,
    evicted_pressure: AtomicU64,
    evicted_bytes: AtomicU64,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.gets.fetch_add(1, Ordering::Relaxed);
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.gets.fetch_add(1, Ordering::Relaxed);
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_exists(&self) {
        self.exists.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_set(&self) {
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    /// Write acknowledged by at least W but fewer than all replicas
    pub fn record_degraded_write(&self) {
        self.degraded_writes.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a failed operation by error kind
    pub fn record_error(&self, error: &crate::Error) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        match error {
            crate::Error::QuorumNotReached { .. } => {
                self.quorum_failures.fetch_add(1, Ordering::Relaxed);
            }
            crate::Error::Timeout { .. } => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    pub fn record_read_repair(&self, replicas: u64) {
        self.read_repairs.fetch_add(replicas, Ordering::Relaxed);
    }

    pub fn record_migration(&self, entries: u64) {
        self.migrated_entries.fetch_add(entries, Ordering::Relaxed);
    }

    pub fn record_latency(&self, op: Operation, duration: Duration) {
        let target = match op {
            Operation::Get => &self.get_latency_us,
            Operation::Exists => &self.exists_latency_us,
            Operation::Set => &self.set_latency_us,
            Operation::Delete => &self.delete_latency_us,
        };
        Self::update_latency_ema(target, duration);
    }

    fn update_latency_ema(target: &AtomicU64, duration: Duration) {
        let new_us = duration.as_micros() as u64;
        let alpha = 0.1; // EMA smoothing factor

        loop {
            let current = target.load(Ordering::Relaxed);
            let updated = if current == 0 {
                new_us.max(1)
            } else {
                ((1.0 - alpha) * current as f64 + alpha * new_us as f64) as u64
            };

            if target
                .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    pub fn latency(&self, op: Operation) -> Duration {
        let us = match op {
            Operation::Get => &self.get_latency_us,
            Operation::Exists => &self.exists_latency_us,
            Operation::Set => &self.set_latency_us,
            Operation::Delete => &self.delete_latency_us,
        };
        Duration::from_micros(us.load(Ordering::Relaxed))
    }

    pub fn record_eviction_pass(&self, outcome: &EvictionCounts) {
        self.eviction_passes.fetch_add(1, Ordering::Relaxed);
        self.evicted_expired
            .fetch_add(outcome.expired, Ordering::Relaxed);
        self.evicted_tombstones
            .fetch_add(outcome.tombstones, Ordering::Relaxed);
        self.evicted_pressure
            .fetch_add(outcome.pressure, Ordering::Relaxed);
        self.evicted_bytes
            .fetch_add(outcome.bytes_freed, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    pub fn eviction_counts(&self) -> EvictionCounts {
        EvictionCounts {
            passes: self.eviction_passes.load(Ordering::Relaxed),
            expired: self.evicted_expired.load(Ordering::Relaxed),
            tombstones: self.evicted_tombstones.load(Ordering::Relaxed),
            pressure: self.evicted_pressure.load(Ordering::Relaxed),
            bytes_freed: self.evicted_bytes.load(Ordering::Relaxed),
        }
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            gets: self.gets.load(Ordering::Relaxed),
            hits: self.hits(),
            misses: self.misses(),
            exists: self.exists.load(Ordering::Relaxed),
            hit_ratio: self.hit_ratio(),
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            quorum_failures: self.quorum_failures.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            degraded_writes: self.degraded_writes.load(Ordering::Relaxed),
            read_repairs: self.read_repairs.load(Ordering::Relaxed),
            migrated_entries: self.migrated_entries.load(Ordering::Relaxed),
            get_latency: self.latency(Operation::Get),
            exists_latency: self.latency(Operation::Exists),
            set_latency: self.latency(Operation::Set),
            delete_latency: self.latency(Operation::Delete),
        }
    }
}

/// Eviction totals (cumulative in stats, per pass in reports)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EvictionCounts {
    pub passes: u64,
    pub expired: u64,
    pub tombstones: u64,
    pub pressure: u64,
    pub bytes_freed: u64,
}

impl EvictionCounts {
    pub fn removed(&self) -> u64 {
        self.expired + self.tombstones + self.pressure
    }
}

/// Snapshot of operation metrics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub gets: u64,
    pub hits: u64,
    pub misses: u64,
    pub exists: u64,
    pub hit_ratio: f64,
    pub sets: u64,
    pub deletes: u64,
    pub errors: u64,
    pub quorum_failures: u64,
    pub timeouts: u64,
    pub degraded_writes: u64,
    pub read_repairs: u64,
    pub migrated_entries: u64,
    pub get_latency: Duration,
    pub exists_latency: Duration,
    pub set_latency: Duration,
    pub delete_latency: Duration,
}

/// Latency tracker helper
pub struct LatencyTracker {
    start: Instant,
}

impl LatencyTracker {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_tracking() {
        let metrics = CacheMetrics::new();

        metrics.record_hit();
        metrics.record_hit();
        metrics.record_miss();

        assert_eq!(metrics.hits(), 2);
        assert_eq!(metrics.misses(), 1);
        assert!((metrics.hit_ratio() - 0.666).abs() < 0.01);
        assert_eq!(metrics.snapshot().gets, 3);
    }

    #[test]
    fn test_latency_tracking() {
        let metrics = CacheMetrics::new();

        metrics.record_latency(Operation::Get, Duration::from_micros(100));
        assert_eq!(metrics.latency(Operation::Get), Duration::from_micros(100));

        // EMA should smooth values
        metrics.record_latency(Operation::Get, Duration::from_micros(200));
        let latency = metrics.latency(Operation::Get).as_micros();
        assert!(latency > 100 && latency < 200);
        assert_eq!(metrics.latency(Operation::Set), Duration::ZERO);
    }

    #[test]
    fn test_error_classification() {
        let metrics = CacheMetrics::new();
        metrics.record_error(&crate::Error::QuorumNotReached {
            acks: 1,
            required: 2,
        });
        metrics.record_error(&crate::Error::Timeout {
            operation: "get".into(),
            elapsed: Duration::from_secs(1),
        });
        metrics.record_error(&crate::Error::InvalidInput("x".into()));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.errors, 3);
        assert_eq!(snapshot.quorum_failures, 1);
        assert_eq!(snapshot.timeouts, 1);
    }

    #[test]
    fn test_eviction_totals_accumulate() {
        let metrics = CacheMetrics::new();
        let pass = EvictionCounts {
            passes: 1,
            expired: 2,
            tombstones: 1,
            pressure: 3,
            bytes_freed: 600,
        };
        metrics.record_eviction_pass(&pass);
        metrics.record_eviction_pass(&pass);

        let totals = metrics.eviction_counts();
        assert_eq!(totals.passes, 2);
        assert_eq!(totals.removed(), 12);
        assert_eq!(totals.bytes_freed, 1200);
    }
}
