//! Per-Node Connection Pool
//!
//! Bounds concurrent calls to one node with a semaphore. A connection is an
//! RAII guard: the slot returns to the pool on every exit path, including
//! cancellation by an operation deadline.
//!
//! The health monitor closes a pool once its node has been down longer than
//! the grace period; the next breaker probe reopens it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, info};

use crate::config::PoolConfig;
use crate::error::{Error, Result};

/// Pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub max_connections: usize,
    pub in_use: usize,
    pub acquired_total: u64,
    pub acquire_timeouts: u64,
    pub closed: bool,
}

/// Bounded pool of connection slots for one node
pub struct ConnectionPool {
    node_id: String,
    max_connections: usize,
    acquire_timeout: Duration,
    slots: Semaphore,
    closed: AtomicBool,
    acquired_total: AtomicU64,
    acquire_timeouts: AtomicU64,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("node_id", &self.node_id)
            .field("stats", &self.stats())
            .finish()
    }
}

impl ConnectionPool {
    pub fn new(node_id: impl Into<String>, config: &PoolConfig) -> Self {
        let max_connections = config.max_connections.max(1);
        Self {
            node_id: node_id.into(),
            max_connections,
            acquire_timeout: config.acquire_timeout,
            slots: Semaphore::new(max_connections),
            closed: AtomicBool::new(false),
            acquired_total: AtomicU64::new(0),
            acquire_timeouts: AtomicU64::new(0),
        }
    }

    /// Take a connection, waiting at most the acquire timeout
    pub async fn acquire(&self) -> Result<PooledConnection<'_>> {
        if self.is_closed() {
            return Err(Error::unavailable(&self.node_id, "connection pool closed"));
        }

        let permit = match tokio::time::timeout(self.acquire_timeout, self.slots.acquire()).await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(Error::unavailable(&self.node_id, "connection pool closed"));
            }
            Err(_) => {
                self.acquire_timeouts.fetch_add(1, Ordering::Relaxed);
                debug!(node = %self.node_id, "Connection pool exhausted");
                return Err(Error::Timeout {
                    operation: format!("acquire connection to {}", self.node_id),
                    elapsed: self.acquire_timeout,
                });
            }
        };

        self.acquired_total.fetch_add(1, Ordering::Relaxed);
        Ok(PooledConnection {
            _permit: permit,
            node_id: &self.node_id,
        })
    }

    /// Refuse new connections until [`reopen`](Self::reopen)
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!(node = %self.node_id, "Closing connection pool for down node");
        }
    }

    pub fn reopen(&self) {
        if self.closed.swap(false, Ordering::AcqRel) {
            info!(node = %self.node_id, "Reopening connection pool");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn in_use(&self) -> usize {
        self.max_connections - self.slots.available_permits()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            max_connections: self.max_connections,
            in_use: self.in_use(),
            acquired_total: self.acquired_total.load(Ordering::Relaxed),
            acquire_timeouts: self.acquire_timeouts.load(Ordering::Relaxed),
            closed: self.is_closed(),
        }
    }
}

/// A checked-out connection slot, returned to the pool on drop
#[derive(Debug)]
pub struct PooledConnection<'a> {
    _permit: SemaphorePermit<'a>,
    node_id: &'a str,
}

impl PooledConnection<'_> {
    pub fn node_id(&self) -> &str {
        self.node_id
    }
}
