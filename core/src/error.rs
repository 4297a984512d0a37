use thiserror::Error;

use crate::storage::ShardState;

pub type MemDbResult<T> = Result<T, MemDbError>;

#[derive(Error, Debug)]
pub enum MemDbError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Shard {shard} is not ready (state: {state:?})")]
    NotReady { shard: String, state: ShardState },

    #[error("Timed out waiting for lock on {0}")]
    LockTimeout(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Lock on {key} is not held by connection {conn}")]
    LockNotHeld { key: String, conn: String },

    #[error("Index key {0:?} not supported")]
    UnsupportedIndexKey(String),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Corrupted record: {0}")]
    Corrupted(String),

    #[error("Document already exists: {0}")]
    AlreadyExists(String),

    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    #[error("Connection not found: {0}")]
    ConnectionNotFound(String),

    #[error("Shard not found: {0}")]
    ShardNotFound(String),

    #[error("No index on field {field} of collection {collection}")]
    IndexNotFound { collection: String, field: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MemDbError {
    /// Short error kind name, stable across message changes
    pub fn kind(&self) -> &'static str {
        match self {
            MemDbError::Io(_) => "io_error",
            MemDbError::Serialization(_) => "serialization_error",
            MemDbError::NotReady { .. } => "not_ready",
            MemDbError::LockTimeout(_) => "lock_timeout",
            MemDbError::InvalidState(_) => "invalid_state",
            MemDbError::LockNotHeld { .. } => "lock_not_held",
            MemDbError::UnsupportedIndexKey(_) => "unsupported_index_key",
            MemDbError::BackendUnavailable(_) => "backend_unavailable",
            MemDbError::Corrupted(_) => "corrupted",
            MemDbError::AlreadyExists(_) => "already_exists",
            MemDbError::DocumentNotFound(_) => "document_not_found",
            MemDbError::ConnectionNotFound(_) => "connection_not_found",
            MemDbError::ShardNotFound(_) => "shard_not_found",
            MemDbError::IndexNotFound { .. } => "index_not_found",
            MemDbError::InvalidInput(_) => "invalid_input",
            MemDbError::Config(_) => "config_error",
            MemDbError::Internal(_) => "internal_error",
        }
    }

    /// Whether retrying the same call later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MemDbError::LockTimeout(_) | MemDbError::BackendUnavailable(_)
        )
    }
}
