//! Domain Layer
//!
//! Core abstractions the engine is written against.
//!
//! - **Ports** (`ports.rs`) - Trait abstractions for backend stores and event fallback
//! - **Events** (`events.rs`) - Immutable lifecycle and health events
//!
//! # Usage
//!
//! ```ignore
//! use ringcache::domain::ports::BackendStore;
//!
//! async fn warm<B: BackendStore>(store: &B) -> ringcache::Result<u64> {
//!     Ok(store.usage().await?.entries)
//! }
//! ```

pub mod events;
pub mod ports;

pub use events::{CacheEvent, EventPayload, EventType, Severity};
pub use ports::{BackendStore, BackendUsage, ConditionalWrite, EventFallback};
