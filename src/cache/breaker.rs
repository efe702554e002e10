//! Per-Node Circuit Breaker
//!
//! ```text
//!            F consecutive failures
//!            or failure rate > threshold
//!   Closed ─────────────────────────────▶ Open
//!     ▲                                    │ cooldown elapsed
//!     │ probe succeeds                     ▼
//!     └──────────────────────────────── HalfOpen
//!                                          │ probe fails
//!                                          └──────▶ Open (cooldown restarts)
//! ```
//!
//! While Open, calls are rejected with `CircuitOpen` without touching the
//! node. HalfOpen admits exactly one probe; an abandoned probe (its permit
//! dropped without a verdict) frees the slot for the next caller.
//!
//! Every transition into Open publishes one Critical `NodeDown` event and
//! every HalfOpen → Closed publishes one `NodeRecovered` event.
//!
//! The failure-rate window is a ring of fixed time buckets, so its size does
//! not depend on the request rate.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use super::bus::EventBus;
use crate::config::BreakerConfig;
use crate::domain::events::CacheEvent;
use crate::error::{Error, Result};

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Snapshot of a breaker for stats
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub window_calls: usize,
    pub window_failure_rate: f64,
    /// Times the breaker has opened
    pub opened_total: u64,
    /// How long the breaker has been Open or HalfOpen
    pub open_for: Option<Duration>,
}

const WINDOW_BUCKETS: usize = 30;

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    /// Absolute bucket number since the window origin
    slot: u64,
    calls: u32,
    failures: u32,
}

/// Call outcomes over the last `window`, counted per bucket
struct SlidingWindow {
    origin: Instant,
    span: Duration,
    buckets: [Bucket; WINDOW_BUCKETS],
}

impl SlidingWindow {
    fn new(window: Duration) -> Self {
        Self {
            origin: Instant::now(),
            span: (window / WINDOW_BUCKETS as u32).max(Duration::from_millis(1)),
            buckets: [Bucket::default(); WINDOW_BUCKETS],
        }
    }

    fn slot(&self, now: Instant) -> u64 {
        (now.duration_since(self.origin).as_nanos() / self.span.as_nanos()) as u64
    }

    fn record(&mut self, now: Instant, failed: bool) {
        let slot = self.slot(now);
        let bucket = &mut self.buckets[(slot % WINDOW_BUCKETS as u64) as usize];
        if bucket.slot != slot {
            *bucket = Bucket {
                slot,
                ..Default::default()
            };
        }
        bucket.calls = bucket.calls.saturating_add(1);
        if failed {
            bucket.failures = bucket.failures.saturating_add(1);
        }
    }

    /// `(calls, failures)` in the buckets still inside the window
    fn totals(&self, now: Instant) -> (u64, u64) {
        let current = self.slot(now);
        self.buckets
            .iter()
            .filter(|b| b.calls > 0 && current.saturating_sub(b.slot) < WINDOW_BUCKETS as u64)
            .fold((0, 0), |(calls, failures), b| {
                (calls + u64::from(b.calls), failures + u64::from(b.failures))
            })
    }

    fn clear(&mut self) {
        self.buckets = [Bucket::default(); WINDOW_BUCKETS];
    }
}

struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    window: SlidingWindow,
    /// Start of the current cooldown
    opened_at: Option<Instant>,
    /// First transition out of Closed in the current outage
    down_since: Option<Instant>,
    probe_in_flight: bool,
}

/// What to announce after releasing the lock
enum Announcement {
    None,
    Down(String),
    Recovered,
}

/// Circuit breaker guarding one node
pub struct CircuitBreaker {
    node_id: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    events: Option<EventBus>,
    opened_total: AtomicU64,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("node_id", &self.node_id)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(node_id: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            node_id: node_id.into(),
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                window: SlidingWindow::new(config.window),
                opened_at: None,
                down_since: None,
                probe_in_flight: false,
            }),
            config,
            events: None,
            opened_total: AtomicU64::new(0),
        }
    }

    /// Publish NodeDown/NodeRecovered on `bus`
    pub fn with_events(mut self, bus: EventBus) -> Self {
        self.events = Some(bus);
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Whether an Open breaker's cooldown has elapsed
    pub fn probe_due(&self) -> bool {
        let inner = self.inner.lock();
        inner.state == BreakerState::Open
            && inner
                .opened_at
                .map(|at| at.elapsed() >= self.config.cooldown)
                .unwrap_or(true)
    }

    /// How long the node has been out of Closed
    pub fn down_for(&self) -> Option<Duration> {
        self.inner.lock().down_since.map(|at| at.elapsed())
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        let (calls, failures) = inner.window.totals(Instant::now());
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            window_calls: calls as usize,
            window_failure_rate: if calls == 0 {
                0.0
            } else {
                failures as f64 / calls as f64
            },
            opened_total: self.opened_total.load(Ordering::Relaxed),
            open_for: inner.down_since.map(|at| at.elapsed()),
        }
    }

    /// Ask to make a call. Fails fast with `CircuitOpen` while Open.
    pub fn try_acquire(&self) -> Result<CallPermit<'_>> {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => Ok(CallPermit::new(self, false)),
            BreakerState::Open => {
                let cooled = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.cooldown)
                    .unwrap_or(true);
                if !cooled {
                    return Err(self.open_error());
                }
                inner.state = BreakerState::HalfOpen;
                inner.probe_in_flight = true;
                info!(node = %self.node_id, "Circuit half-open, probing node");
                Ok(CallPermit::new(self, true))
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    return Err(self.open_error());
                }
                inner.probe_in_flight = true;
                Ok(CallPermit::new(self, true))
            }
        }
    }

    fn open_error(&self) -> Error {
        Error::CircuitOpen {
            node_id: self.node_id.clone(),
        }
    }

    fn open(&self, inner: &mut BreakerInner, now: Instant) {
        inner.state = BreakerState::Open;
        inner.opened_at = Some(now);
        inner.down_since.get_or_insert(now);
        inner.probe_in_flight = false;
        inner.consecutive_failures = 0;
        inner.window.clear();
        self.opened_total.fetch_add(1, Ordering::Relaxed);
    }

    fn on_success(&self, probe: bool) {
        let announcement = {
            let mut inner = self.inner.lock();
            let now = Instant::now();
            match inner.state {
                BreakerState::Closed => {
                    inner.consecutive_failures = 0;
                    inner.window.record(now, false);
                    Announcement::None
                }
                BreakerState::HalfOpen if probe => {
                    inner.state = BreakerState::Closed;
                    inner.probe_in_flight = false;
                    inner.consecutive_failures = 0;
                    inner.window.clear();
                    inner.opened_at = None;
                    inner.down_since = None;
                    Announcement::Recovered
                }
                // Late result of a call admitted before the breaker opened
                _ => Announcement::None,
            }
        };
        self.announce(announcement);
    }

    fn on_failure(&self, probe: bool, reason: &str) {
        let announcement = {
            let mut inner = self.inner.lock();
            let now = Instant::now();
            match inner.state {
                BreakerState::Closed => {
                    inner.consecutive_failures += 1;
                    inner.window.record(now, true);

                    let (calls, failures) = inner.window.totals(now);
                    let rate_tripped = calls >= u64::from(self.config.min_calls_in_window)
                        && failures as f64 / calls as f64 > self.config.failure_rate_threshold;

                    if inner.consecutive_failures >= self.config.failure_threshold || rate_tripped
                    {
                        let detail = if rate_tripped {
                            format!("failure rate {}/{} in window: {}", failures, calls, reason)
                        } else {
                            format!(
                                "{} consecutive failures: {}",
                                inner.consecutive_failures, reason
                            )
                        };
                        self.open(&mut inner, now);
                        Announcement::Down(detail)
                    } else {
                        Announcement::None
                    }
                }
                BreakerState::HalfOpen if probe => {
                    self.open(&mut inner, now);
                    Announcement::Down(format!("probe failed: {}", reason))
                }
                _ => Announcement::None,
            }
        };
        self.announce(announcement);
    }

    fn release_probe(&self) {
        let mut inner = self.inner.lock();
        if inner.state == BreakerState::HalfOpen {
            inner.probe_in_flight = false;
        }
    }

    fn announce(&self, announcement: Announcement) {
        match announcement {
            Announcement::None => {}
            Announcement::Down(reason) => {
                warn!(node = %self.node_id, %reason, "Circuit opened, node marked down");
                if let Some(bus) = &self.events {
                    bus.publish(CacheEvent::node_down(&self.node_id, reason));
                }
            }
            Announcement::Recovered => {
                info!(node = %self.node_id, "Circuit closed, node recovered");
                if let Some(bus) = &self.events {
                    bus.publish(CacheEvent::node_recovered(&self.node_id));
                }
            }
        }
    }
}

// =============================================================================
// Call Permit
// =============================================================================

/// Admission for one call. Report the outcome with [`record`](Self::record);
/// dropping an unreported probe frees the probe slot.
#[derive(Debug)]
#[must_use = "a permit must record the call outcome"]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl<'a> CallPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, probe: bool) -> Self {
        Self {
            breaker,
            probe,
            settled: false,
        }
    }

    /// Whether this call is the HalfOpen probe
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.probe);
    }

    pub fn failure(mut self, reason: &str) {
        self.settled = true;
        self.breaker.on_failure(self.probe, reason);
    }

    /// Classify `result` and record it.
    ///
    /// Node faults (unreachable, timeout) are failures. A reply of any other
    /// kind, including "not found" and payload errors, proves the node is
    /// up: it closes a probe and is otherwise not counted against the node.
    pub fn record<T>(self, result: &Result<T>) {
        match result {
            Ok(_) => self.success(),
            Err(e) if e.is_node_fault() => self.failure(&e.to_string()),
            Err(_) if self.probe => self.success(),
            Err(_) => {}
        }
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.breaker.release_probe();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
