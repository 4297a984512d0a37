//! MemDB - sharded in-memory document store core

pub mod backend;
pub mod collection;
pub mod config;
pub mod document;
pub mod error;
pub mod server;
pub mod storage;

pub use backend::{Backend, FileBackend, MemoryBackend};
pub use collection::Collection;
pub use config::{BackendConfig, CollectionConfig, DatabaseConfig, ShardConfig};
pub use document::{ConnId, Document, FieldChange, Patch, UpdateOptions};
pub use error::{MemDbError, MemDbResult};
pub use server::Database;
pub use storage::{Shard, ShardState};

#[cfg(test)]
mod tests;
