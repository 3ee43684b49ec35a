//! The stream adapter around one named record.

use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::client::Client;
use crate::error::{RecordError, RecordResult};
use crate::service::{EventKind, ListenerId, RecordEvent, RecordHandle, RecordService};

pub mod updates;

pub use updates::{Snapshot, Updates};

/// Stream adapter for one named record
///
/// A `Record` is a lightweight reference: constructing it performs no I/O and
/// registers nothing. Each operation acquires its own handle and listeners
/// from the service and releases them when it terminates or is dropped, so
/// independent calls never share lifecycle state.
pub struct Record<S: RecordService> {
    client: Client<S>,
    name: String,
    id: String,
}

impl<S: RecordService> Record<S> {
    pub(crate) fn new(client: Client<S>, name: String) -> Self {
        let id = name.rsplit('/').next().unwrap_or_default().to_string();
        Self { client, name, id }
    }

    /// Full record name, e.g. `"users/42"`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Last `/`-separated segment of the name, e.g. `"42"`.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Observe the record as a stream of [`Snapshot`]s.
    ///
    /// The current value is replayed immediately, then every change follows,
    /// optionally scoped to a dot-separated `path` inside the record. The
    /// stream ends with one `Err` item if the service reports an out-of-band
    /// error; dropping it releases all registrations.
    pub fn observe(&self, path: Option<&str>) -> Updates<S::Handle> {
        let handle = self.client.service().get_record(&self.name);
        let errors = self.client.errors();
        let (tx, rx) = mpsc::unbounded_channel();
        let listener = handle.subscribe(path, true, tx);
        debug!("observing record '{}' with listener {:?}", self.name, listener);
        Updates::new(self.id.clone(), self.name.clone(), handle, listener, rx, errors)
    }

    /// Overwrite the whole record.
    pub async fn set<V: Serialize>(&self, value: V) -> RecordResult<()> {
        let value = serde_json::to_value(value).map_err(RecordError::serialization)?;
        self.client.service().set_data(&self.name, value).await
    }

    /// Update a single top-level field of the record.
    pub async fn set_field<V: Serialize>(&self, field: &str, value: V) -> RecordResult<()> {
        let value = serde_json::to_value(value).map_err(RecordError::serialization)?;
        self.client.service().set_field(&self.name, field, value).await
    }

    /// Check whether the record exists.
    ///
    /// Succeeds with the boolean answer or fails with the service error,
    /// never both.
    pub async fn exists(&self) -> RecordResult<bool> {
        self.client.service().has(&self.name).await
    }

    /// Single-shot read of the current value.
    ///
    /// Subscribes like [`observe`](Self::observe), takes the first snapshot,
    /// and releases the subscription before returning.
    pub async fn snapshot(&self) -> RecordResult<Snapshot> {
        let mut updates = self.observe(None);
        match updates.next().await {
            Some(item) => item,
            None => Err(RecordError::Disconnected),
        }
    }

    /// Delete the record.
    ///
    /// Resolves `Ok(true)` once the service confirms the deletion. Errors
    /// from the record or from the service's out-of-band channel fail the
    /// call. All listeners are released on every termination path, including
    /// cancellation by drop.
    pub async fn remove(&self) -> RecordResult<bool> {
        let handle = self.client.service().get_record(&self.name);
        let mut errors = self.client.errors();
        let (tx, mut events) = mpsc::unbounded_channel();
        let deleted = handle.on(EventKind::Delete, tx.clone());
        let errored = handle.on(EventKind::Error, tx);
        let guard = EventListenerGuard {
            handle,
            deleted,
            errored,
        };

        debug!("deleting record '{}'", self.name);
        guard.handle.delete();

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(RecordEvent::Deleted) => return Ok(true),
                    Some(RecordEvent::Error(err)) => return Err(err),
                    None => return Err(RecordError::Disconnected),
                },
                err = errors.recv() => match err {
                    Ok(err) => return Err(err),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return Err(RecordError::Disconnected),
                },
            }
        }
    }
}

/// Releases the two lifecycle-event listeners and the handle reference held
/// by [`Record::remove`], on success, error, and cancellation alike.
struct EventListenerGuard<H: RecordHandle> {
    handle: H,
    deleted: ListenerId,
    errored: ListenerId,
}

impl<H: RecordHandle> Drop for EventListenerGuard<H> {
    fn drop(&mut self) {
        self.handle.off(EventKind::Delete, self.deleted);
        self.handle.off(EventKind::Error, self.errored);
        self.handle.discard();
    }
}
