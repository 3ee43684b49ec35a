//! # recordflow
//!
//! A reactive stream adapter for real-time record services.
//!
//! A record service hands out mutable, subscribable, shared JSON documents
//! over a callback/event API. recordflow wraps that API in cancellable
//! streams and futures: observe a record as a push-based sequence of
//! snapshots, write and delete with single-shot async operations, and let
//! drop-based teardown release every registration exactly once.

pub mod client;
pub mod error;
pub mod record;
pub mod service;

#[cfg(feature = "memory")]
pub mod memory;

// Re-exports for convenience
pub use client::Client;
pub use error::{RecordError, RecordResult};
pub use record::{Record, Snapshot, Updates};
pub use service::{EventKind, ListenerId, RecordEvent, RecordHandle, RecordService};

#[cfg(feature = "memory")]
pub use memory::{MemoryHandle, MemoryService};
