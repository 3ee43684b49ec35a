use thiserror::Error;

/// Result type for recordflow operations
pub type RecordResult<T> = Result<T, RecordError>;

/// Errors surfaced by record operations
///
/// Errors travel broadcast channels on their way to stream consumers, so the
/// type is `Clone` and carries `serde_json` failures as plain strings.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecordError {
    #[error("record service error: {message}")]
    Service { message: String },

    #[error("write to record '{name}' failed: {message}")]
    WriteFailed { name: String, message: String },

    #[error("delete of record '{name}' failed: {message}")]
    DeleteFailed { name: String, message: String },

    #[error("record not found: {name}")]
    NotFound { name: String },

    #[error("connection to the record service was lost")]
    Disconnected,

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl RecordError {
    pub(crate) fn serialization(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
