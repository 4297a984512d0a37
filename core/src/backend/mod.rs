//! Persistent backends behind the document cache
//!
//! The cache only needs key-level get/set/delete; nothing is assumed to be
//! transactional across keys.

pub mod file;
pub mod memory;

pub use file::FileBackend;
pub use memory::MemoryBackend;

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::BackendConfig;
use crate::document::Document;
use crate::error::MemDbResult;

#[async_trait]
pub trait Backend: Send + Sync {
    /// Load a document, `None` when the key has never been written or was deleted
    async fn get(&self, key: &str) -> MemDbResult<Option<Document>>;

    async fn set(&self, key: &str, doc: &Document) -> MemDbResult<()>;

    /// Deleting a missing key succeeds
    async fn delete(&self, key: &str) -> MemDbResult<()>;
}

/// Build the backend described by `config`
pub fn open_backend(config: &BackendConfig) -> MemDbResult<Arc<dyn Backend>> {
    match config {
        BackendConfig::Memory => Ok(Arc::new(MemoryBackend::new())),
        BackendConfig::File { data_dir } => Ok(Arc::new(FileBackend::new(data_dir)?)),
    }
}
