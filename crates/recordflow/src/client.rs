use std::sync::Arc;

use tokio::sync::broadcast;

use crate::error::RecordError;
use crate::record::Record;
use crate::service::RecordService;

/// Shared client context for a record service
///
/// The client is the long-lived object an application holds on to. It owns
/// the service reference, hands out [`Record`] adapters, and exposes the
/// service's out-of-band error channel. Cloning is cheap and all clones share
/// the same service.
pub struct Client<S: RecordService> {
    service: Arc<S>,
}

impl<S: RecordService> Clone for Client<S> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
        }
    }
}

impl<S: RecordService> Client<S> {
    /// Create a new client wrapping the given service.
    pub fn new(service: S) -> Self {
        Self {
            service: Arc::new(service),
        }
    }

    /// Get the underlying service.
    pub fn service(&self) -> &S {
        &self.service
    }

    /// Subscribe to the service's out-of-band error channel.
    pub fn errors(&self) -> broadcast::Receiver<RecordError> {
        self.service.errors()
    }

    /// Get a stream adapter for the named record.
    ///
    /// Constructing the adapter performs no I/O; registrations happen per
    /// operation.
    pub fn record(&self, name: impl Into<String>) -> Record<S> {
        Record::new(self.clone(), name.into())
    }
}
