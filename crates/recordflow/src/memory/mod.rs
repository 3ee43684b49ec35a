//! In-process record service.
//!
//! Backs the tests and the demo. Records live in a [`DashMap`], change
//! listeners are per-listener unbounded channels, and out-of-band errors go
//! over a broadcast channel. There is no synchronization, transport, or
//! persistence here; it is a local stand-in for a real service.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use serde_json::{Map as JsonMap, Value as JsonValue};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

use crate::error::{RecordError, RecordResult};
use crate::service::{EventKind, ListenerId, RecordEvent, RecordHandle, RecordService};

struct ChangeListener {
    id: ListenerId,
    path: Option<String>,
    sink: mpsc::UnboundedSender<JsonValue>,
}

struct EventListener {
    id: ListenerId,
    kind: EventKind,
    sink: mpsc::UnboundedSender<RecordEvent>,
}

struct MemoryRecord {
    name: String,
    data: Mutex<JsonValue>,
    subscribers: Mutex<Vec<ChangeListener>>,
    listeners: Mutex<Vec<EventListener>>,
    refs: AtomicUsize,
}

impl MemoryRecord {
    fn new(name: String) -> Self {
        Self {
            name,
            data: Mutex::new(JsonValue::Null),
            subscribers: Mutex::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
            refs: AtomicUsize::new(0),
        }
    }

    /// Fan the current value out to every change listener, scoped to each
    /// listener's path. Listeners whose receiver is gone are dropped.
    fn notify(&self) {
        let data = self.data.lock().unwrap().clone();
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|sub| {
            let view = match &sub.path {
                Some(path) => value_at_path(&data, path),
                None => data.clone(),
            };
            sub.sink.send(view).is_ok()
        });
    }

    fn emit(&self, event: RecordEvent) {
        let listeners = self.listeners.lock().unwrap();
        for listener in listeners.iter() {
            let matches = matches!(
                (listener.kind, &event),
                (EventKind::Delete, RecordEvent::Deleted) | (EventKind::Error, RecordEvent::Error(_))
            );
            if matches {
                let _ = listener.sink.send(event.clone());
            }
        }
    }
}

struct Shared {
    records: DashMap<String, Arc<MemoryRecord>>,
    errors_tx: broadcast::Sender<RecordError>,
    next_listener: AtomicU64,
}

impl Shared {
    fn next_listener_id(&self) -> ListenerId {
        ListenerId::new(self.next_listener.fetch_add(1, Ordering::Relaxed))
    }
}

/// In-memory implementation of [`RecordService`]
///
/// Cloning is cheap; all clones share the same records and error channel.
#[derive(Clone)]
pub struct MemoryService {
    shared: Arc<Shared>,
}

impl MemoryService {
    pub fn new() -> Self {
        let (errors_tx, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(Shared {
                records: DashMap::new(),
                errors_tx,
                next_listener: AtomicU64::new(1),
            }),
        }
    }

    /// Inject an out-of-band service error, as a lost connection would.
    pub fn emit_error(&self, err: RecordError) {
        if self.shared.errors_tx.send(err).is_err() {
            debug!("no subscribers for service error");
        }
    }

    /// Number of records currently held.
    pub fn record_count(&self) -> usize {
        self.shared.records.len()
    }

    /// Number of live change listeners on the named record.
    pub fn subscriber_count(&self, name: &str) -> usize {
        self.shared
            .records
            .get(name)
            .map(|record| record.subscribers.lock().unwrap().len())
            .unwrap_or(0)
    }

    /// Number of outstanding handles to the named record.
    pub fn handle_count(&self, name: &str) -> usize {
        self.shared
            .records
            .get(name)
            .map(|record| record.refs.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    fn record(&self, name: &str) -> Arc<MemoryRecord> {
        self.shared
            .records
            .entry(name.to_string())
            .or_insert_with(|| {
                info!("creating record '{}'", name);
                Arc::new(MemoryRecord::new(name.to_string()))
            })
            .clone()
    }
}

impl Default for MemoryService {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordService for MemoryService {
    type Handle = MemoryHandle;

    fn get_record(&self, name: &str) -> MemoryHandle {
        let record = self.record(name);
        record.refs.fetch_add(1, Ordering::AcqRel);
        MemoryHandle {
            shared: self.shared.clone(),
            record,
        }
    }

    async fn set_data(&self, name: &str, value: JsonValue) -> RecordResult<()> {
        let record = self.record(name);
        *record.data.lock().unwrap() = value;
        debug!("wrote record '{}'", name);
        record.notify();
        Ok(())
    }

    async fn set_field(&self, name: &str, field: &str, value: JsonValue) -> RecordResult<()> {
        let record = self.record(name);
        {
            let mut data = record.data.lock().unwrap();
            merge_field(&mut data, field, value);
        }
        debug!("wrote field '{}' of record '{}'", field, name);
        record.notify();
        Ok(())
    }

    async fn has(&self, name: &str) -> RecordResult<bool> {
        Ok(self.shared.records.contains_key(name))
    }

    fn errors(&self) -> broadcast::Receiver<RecordError> {
        self.shared.errors_tx.subscribe()
    }
}

/// Handle to one record in a [`MemoryService`]
pub struct MemoryHandle {
    shared: Arc<Shared>,
    record: Arc<MemoryRecord>,
}

impl RecordHandle for MemoryHandle {
    fn subscribe(
        &self,
        path: Option<&str>,
        trigger_now: bool,
        sink: mpsc::UnboundedSender<JsonValue>,
    ) -> ListenerId {
        let id = self.shared.next_listener_id();
        if trigger_now {
            let data = self.record.data.lock().unwrap().clone();
            let view = match path {
                Some(path) => value_at_path(&data, path),
                None => data,
            };
            let _ = sink.send(view);
        }
        self.record.subscribers.lock().unwrap().push(ChangeListener {
            id,
            path: path.map(str::to_string),
            sink,
        });
        debug!("record '{}' gained change listener {:?}", self.record.name, id);
        id
    }

    fn unsubscribe(&self, id: ListenerId) {
        self.record
            .subscribers
            .lock()
            .unwrap()
            .retain(|sub| sub.id != id);
        debug!("record '{}' lost change listener {:?}", self.record.name, id);
    }

    fn on(&self, kind: EventKind, sink: mpsc::UnboundedSender<RecordEvent>) -> ListenerId {
        let id = self.shared.next_listener_id();
        self.record
            .listeners
            .lock()
            .unwrap()
            .push(EventListener { id, kind, sink });
        id
    }

    fn off(&self, kind: EventKind, id: ListenerId) {
        self.record
            .listeners
            .lock()
            .unwrap()
            .retain(|listener| !(listener.kind == kind && listener.id == id));
    }

    fn delete(&self) {
        info!("deleting record '{}'", self.record.name);
        self.shared.records.remove(&self.record.name);
        self.record.emit(RecordEvent::Deleted);
        // closing the change channels ends any open observer stream
        self.record.subscribers.lock().unwrap().clear();
    }

    fn discard(&self) {
        let before = self.record.refs.fetch_sub(1, Ordering::AcqRel);
        debug!(
            "record '{}' handle discarded ({} remaining)",
            self.record.name,
            before.saturating_sub(1)
        );
    }
}

fn value_at_path(data: &JsonValue, path: &str) -> JsonValue {
    let mut current = data;
    for segment in path.split('.') {
        match current.get(segment) {
            Some(value) => current = value,
            None => return JsonValue::Null,
        }
    }
    current.clone()
}

fn merge_field(data: &mut JsonValue, field: &str, value: JsonValue) {
    if !data.is_object() {
        *data = JsonValue::Object(JsonMap::new());
    }
    if let Some(map) = data.as_object_mut() {
        map.insert(field.to_string(), value);
    }
}
