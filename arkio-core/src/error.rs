use thiserror::Error;

pub type Result<T> = std::result::Result<T, ArkError>;

#[derive(Error, Debug)]
pub enum ArkError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Staging capacity exhausted: needed {needed} bytes, {available} available")]
    CapacityExhausted { needed: u64, available: u64 },

    #[error("Copy failed: {0}")]
    Copy(String),

    #[error("Bag validation failed: {0}")]
    Validation(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ArkError {
    /// Whether this error terminates a task instead of requeueing it.
    ///
    /// Missing records, invalid bags and malformed identifiers cannot be
    /// repaired by retrying; everything else is assumed transient.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ArkError::NotFound(_)
                | ArkError::Validation(_)
                | ArkError::InvalidRequest(_)
                | ArkError::HashMismatch { .. }
                | ArkError::Config(_)
        )
    }
}
