//! Infrastructure Adapters
//!
//! Implementations of the domain ports plus the outward-facing exporters,
//! following the Port/Adapter (Hexagonal) architecture pattern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │            BackendStore │ EventFallback                     │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ InMemoryBackend │ FaultyBackend │ InMemoryFallback         │ │
//! │  │ EventLogger │ PrometheusExporter                           │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use ringcache::adapters::{FaultyBackend, InMemoryBackend};
//!
//! // A node that tests can take down on demand
//! let node = Arc::new(FaultyBackend::new("a", Arc::new(InMemoryBackend::new())));
//! node.set_down(true);
//! ```

mod event_logger;
mod fallback;
mod faulty;
mod memory;
mod prometheus;

pub use event_logger::EventLogger;
pub use fallback::InMemoryFallback;
pub use faulty::FaultyBackend;
pub use memory::{InMemoryBackend, InMemoryBackendStats};
pub use prometheus::PrometheusExporter;
