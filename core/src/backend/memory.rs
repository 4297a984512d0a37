use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::Backend;
use crate::document::Document;
use crate::error::{MemDbError, MemDbResult};

/// In-process backend. Share one instance through an `Arc` to let several
/// shards or databases see the same durable state.
pub struct MemoryBackend {
    records: DashMap<String, Document>,
    available: AtomicBool,
    writes: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            available: AtomicBool::new(true),
            writes: AtomicU64::new(0),
        }
    }

    /// Make every following call fail with `BackendUnavailable` (or recover)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of successful `set`/`delete` calls so far
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Synchronous peek for tests and tooling, bypassing availability
    pub fn snapshot(&self, key: &str) -> Option<Document> {
        self.records.get(key).map(|r| r.value().clone())
    }

    fn check_available(&self, op: &str, key: &str) -> MemDbResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(MemDbError::BackendUnavailable(format!("{} {}", op, key)))
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn get(&self, key: &str) -> MemDbResult<Option<Document>> {
        self.check_available("get", key)?;
        Ok(self.snapshot(key))
    }

    async fn set(&self, key: &str, doc: &Document) -> MemDbResult<()> {
        self.check_available("set", key)?;
        self.records.insert(key.to_string(), doc.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, key: &str) -> MemDbResult<()> {
        self.check_available("delete", key)?;
        self.records.remove(key);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
