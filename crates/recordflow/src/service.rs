//! The interface consumed from the record service.
//!
//! The service owns connections, synchronization, and conflict resolution;
//! this crate only adapts its callback/event API into streams. Callback
//! registration is modelled as handing the service an unbounded sender and
//! getting a [`ListenerId`] back; deregistration returns the id.

use std::future::Future;

use serde_json::Value as JsonValue;
use tokio::sync::{broadcast, mpsc};

use crate::error::{RecordError, RecordResult};

/// Identifier for one listener registration on a record handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Kinds of lifecycle events a record handle can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Delete,
    Error,
}

/// Payload delivered to lifecycle-event listeners.
#[derive(Debug, Clone)]
pub enum RecordEvent {
    /// The underlying record was deleted.
    Deleted,
    /// The record reported an error.
    Error(RecordError),
}

/// A provider of shared, subscribable records.
///
/// Implemented by the in-process [`MemoryService`](crate::memory::MemoryService)
/// and by whatever client library speaks to a remote service.
pub trait RecordService: Send + Sync + 'static {
    type Handle: RecordHandle;

    /// Acquire a handle to the named record.
    ///
    /// Handles are reference counted by the service; every handle must be
    /// released with [`RecordHandle::discard`] when no longer needed.
    fn get_record(&self, name: &str) -> Self::Handle;

    /// Overwrite the whole record.
    fn set_data(
        &self,
        name: &str,
        value: JsonValue,
    ) -> impl Future<Output = RecordResult<()>> + Send;

    /// Update a single top-level field of the record.
    fn set_field(
        &self,
        name: &str,
        field: &str,
        value: JsonValue,
    ) -> impl Future<Output = RecordResult<()>> + Send;

    /// Check whether the named record exists.
    fn has(&self, name: &str) -> impl Future<Output = RecordResult<bool>> + Send;

    /// Subscribe to the service's out-of-band error channel.
    ///
    /// The channel is long-lived state owned by the service; dropping the
    /// receiver is the deregistration.
    fn errors(&self) -> broadcast::Receiver<RecordError>;
}

/// A reference to one live record.
pub trait RecordHandle: Send + Sync + Unpin + 'static {
    /// Register a change listener, optionally scoped to a dot-separated path
    /// inside the record. With `trigger_now` the current value is replayed
    /// into the sink immediately, before any future change.
    fn subscribe(
        &self,
        path: Option<&str>,
        trigger_now: bool,
        sink: mpsc::UnboundedSender<JsonValue>,
    ) -> ListenerId;

    /// Remove a change listener registered with [`subscribe`](Self::subscribe).
    fn unsubscribe(&self, id: ListenerId);

    /// Register a listener for record lifecycle events.
    fn on(&self, kind: EventKind, sink: mpsc::UnboundedSender<RecordEvent>) -> ListenerId;

    /// Remove a lifecycle-event listener registered with [`on`](Self::on).
    fn off(&self, kind: EventKind, id: ListenerId);

    /// Ask the service to delete the underlying record. Confirmation arrives
    /// as a [`RecordEvent::Deleted`] event, not as a return value.
    fn delete(&self);

    /// Release this handle's reference.
    fn discard(&self);
}
