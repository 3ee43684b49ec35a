use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::Stream;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

use crate::error::{RecordError, RecordResult};
use crate::service::{ListenerId, RecordHandle};

/// One observed value of a record
///
/// The adapter injects the identity fields into every snapshot, regardless
/// of the shape of the underlying payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Last path segment of the record name.
    pub id: String,
    /// Full record name.
    #[serde(rename = "_name")]
    pub name: String,
    /// Payload as delivered by the service.
    #[serde(flatten)]
    pub data: JsonValue,
}

impl Snapshot {
    pub(crate) fn new(id: String, name: String, data: JsonValue) -> Self {
        Self { id, name, data }
    }

    /// Deserialize the payload into a concrete type.
    ///
    /// When the payload is an object the identity fields are merged in under
    /// `id` and `_name`, so target types may bind them.
    pub fn to_typed<T: DeserializeOwned>(&self) -> RecordResult<T> {
        let mut value = self.data.clone();
        if let Some(map) = value.as_object_mut() {
            map.insert("id".to_string(), JsonValue::String(self.id.clone()));
            map.insert("_name".to_string(), JsonValue::String(self.name.clone()));
        }
        serde_json::from_value(value).map_err(RecordError::serialization)
    }
}

/// Owns the registrations made for one subscription and releases them
/// exactly once, in drop or on terminal events, whichever comes first.
struct ListenerGuard<H: RecordHandle> {
    handle: Option<H>,
    listener: ListenerId,
}

impl<H: RecordHandle> ListenerGuard<H> {
    fn release(&mut self) {
        if let Some(handle) = self.handle.take() {
            debug!("releasing change listener {:?}", self.listener);
            handle.unsubscribe(self.listener);
            handle.discard();
        }
    }
}

impl<H: RecordHandle> Drop for ListenerGuard<H> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Push stream of record updates returned by [`Record::observe`]
///
/// Every item is a [`Snapshot`] carrying the record's identity fields. An
/// out-of-band service error yields one `Err` item and ends the stream. The
/// stream does not complete on its own while the service keeps the listener
/// alive; dropping it releases the data listener, the handle reference, and
/// the error-channel subscription synchronously.
///
/// [`Record::observe`]: crate::record::Record::observe
pub struct Updates<H: RecordHandle> {
    id: String,
    name: String,
    items: mpsc::UnboundedReceiver<JsonValue>,
    errors: Option<BroadcastStream<RecordError>>,
    guard: ListenerGuard<H>,
    done: bool,
}

impl<H: RecordHandle> Updates<H> {
    pub(crate) fn new(
        id: String,
        name: String,
        handle: H,
        listener: ListenerId,
        items: mpsc::UnboundedReceiver<JsonValue>,
        errors: broadcast::Receiver<RecordError>,
    ) -> Self {
        Self {
            id,
            name,
            items,
            errors: Some(BroadcastStream::new(errors)),
            guard: ListenerGuard {
                handle: Some(handle),
                listener,
            },
            done: false,
        }
    }

    /// Full name of the observed record.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn finish(&mut self) {
        self.done = true;
        self.errors = None;
        self.guard.release();
    }
}

impl<H: RecordHandle> Stream for Updates<H> {
    type Item = RecordResult<Snapshot>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        // Out-of-band service errors terminate the stream.
        if let Some(errors) = this.errors.as_mut() {
            loop {
                match Pin::new(&mut *errors).poll_next(cx) {
                    Poll::Ready(Some(Ok(err))) => {
                        this.finish();
                        return Poll::Ready(Some(Err(err)));
                    }
                    // A lagged receiver skipped stale notifications; keep going.
                    Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(_)))) => continue,
                    Poll::Ready(None) | Poll::Pending => break,
                }
            }
        }

        match this.items.poll_recv(cx) {
            Poll::Ready(Some(data)) => {
                let snapshot = Snapshot::new(this.id.clone(), this.name.clone(), data);
                Poll::Ready(Some(Ok(snapshot)))
            }
            Poll::Ready(None) => {
                // The service dropped the listener channel.
                this.finish();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use futures_util::StreamExt;
    use serde_json::json;
    use tokio_test::{assert_pending, task};

    use super::*;
    use crate::service::{EventKind, RecordEvent};

    #[derive(Default)]
    struct Released {
        unsubscribed: AtomicUsize,
        discarded: AtomicUsize,
    }

    #[derive(Clone)]
    struct NoopHandle(Arc<Released>);

    impl RecordHandle for NoopHandle {
        fn subscribe(
            &self,
            _path: Option<&str>,
            _trigger_now: bool,
            _sink: mpsc::UnboundedSender<JsonValue>,
        ) -> ListenerId {
            ListenerId::new(0)
        }

        fn unsubscribe(&self, _id: ListenerId) {
            self.0.unsubscribed.fetch_add(1, Ordering::SeqCst);
        }

        fn on(&self, _kind: EventKind, _sink: mpsc::UnboundedSender<RecordEvent>) -> ListenerId {
            ListenerId::new(0)
        }

        fn off(&self, _kind: EventKind, _id: ListenerId) {}

        fn delete(&self) {}

        fn discard(&self) {
            self.0.discarded.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn updates_under_test() -> (
        Arc<Released>,
        mpsc::UnboundedSender<JsonValue>,
        broadcast::Sender<RecordError>,
        Updates<NoopHandle>,
    ) {
        let released = Arc::new(Released::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let (err_tx, err_rx) = broadcast::channel(8);
        let updates = Updates::new(
            "42".to_string(),
            "users/42".to_string(),
            NoopHandle(released.clone()),
            ListenerId::new(7),
            rx,
            err_rx,
        );
        (released, tx, err_tx, updates)
    }

    #[tokio::test]
    async fn annotates_every_payload() {
        let (_released, tx, _err_tx, mut updates) = updates_under_test();

        tx.send(json!({"title": "groceries"})).unwrap();
        tx.send(json!("bare string")).unwrap();

        let first = updates.next().await.unwrap().unwrap();
        assert_eq!(first.id, "42");
        assert_eq!(first.name, "users/42");
        assert_eq!(first.data, json!({"title": "groceries"}));

        let second = updates.next().await.unwrap().unwrap();
        assert_eq!(second.id, "42");
        assert_eq!(second.data, json!("bare string"));
    }

    #[tokio::test]
    async fn stays_pending_without_events() {
        let (_released, _tx, _err_tx, mut updates) = updates_under_test();

        let mut next = task::spawn(updates.next());
        assert_pending!(next.poll());
    }

    #[tokio::test]
    async fn drop_releases_registrations_once() {
        let (released, _tx, err_tx, updates) = updates_under_test();
        assert_eq!(err_tx.receiver_count(), 1);

        drop(updates);

        assert_eq!(released.unsubscribed.load(Ordering::SeqCst), 1);
        assert_eq!(released.discarded.load(Ordering::SeqCst), 1);
        assert_eq!(err_tx.receiver_count(), 0);
    }

    #[tokio::test]
    async fn service_error_terminates_and_releases_eagerly() {
        let (released, _tx, err_tx, mut updates) = updates_under_test();

        err_tx
            .send(RecordError::Service {
                message: "connection lost".to_string(),
            })
            .unwrap();

        let item = updates.next().await.unwrap();
        assert_eq!(
            item,
            Err(RecordError::Service {
                message: "connection lost".to_string(),
            })
        );

        // teardown already ran, before the stream itself was dropped
        assert_eq!(released.unsubscribed.load(Ordering::SeqCst), 1);
        assert_eq!(released.discarded.load(Ordering::SeqCst), 1);
        assert_eq!(err_tx.receiver_count(), 0);

        assert!(updates.next().await.is_none());
        assert_eq!(released.unsubscribed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn closed_listener_channel_ends_the_stream() {
        let (released, tx, _err_tx, mut updates) = updates_under_test();

        drop(tx);

        assert!(updates.next().await.is_none());
        assert_eq!(released.unsubscribed.load(Ordering::SeqCst), 1);
        assert_eq!(released.discarded.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn snapshot_deserializes_with_identity_fields() {
        #[derive(serde::Deserialize)]
        struct User {
            id: String,
            name: String,
        }

        let snapshot = Snapshot::new(
            "42".to_string(),
            "users/42".to_string(),
            json!({"name": "Alice"}),
        );

        let user: User = snapshot.to_typed().unwrap();
        assert_eq!(user.id, "42");
        assert_eq!(user.name, "Alice");
    }
}
