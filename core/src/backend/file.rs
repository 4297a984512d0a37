//! File-per-document backend
//!
//! Each key maps to `<data_dir>/<hex(key)>.doc`. A record is a little-endian
//! CRC32 of the payload followed by the JSON payload. Writes land in a temp
//! file first and are renamed into place.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use super::Backend;
use crate::document::Document;
use crate::error::{MemDbError, MemDbResult};

const CHECKSUM_LEN: usize = 4;

/// Manages document files under one directory
pub struct FileBackend {
    data_dir: PathBuf,
    tmp_seq: AtomicU64,
}

impl FileBackend {
    /// Create a new file backend, creating `data_dir` if needed
    pub fn new<P: AsRef<Path>>(data_dir: P) -> MemDbResult<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_dir)?;

        Ok(Self {
            data_dir,
            tmp_seq: AtomicU64::new(0),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.data_dir.join(format!("{}.doc", hex::encode(key)))
    }

    fn encode(doc: &Document) -> MemDbResult<Vec<u8>> {
        let payload = serde_json::to_vec(doc)?;
        let mut record = Vec::with_capacity(CHECKSUM_LEN + payload.len());
        record.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        record.extend_from_slice(&payload);
        Ok(record)
    }

    fn decode(key: &str, record: &[u8]) -> MemDbResult<Document> {
        if record.len() < CHECKSUM_LEN {
            return Err(MemDbError::Corrupted(format!("{}: truncated record", key)));
        }

        let (checksum, payload) = record.split_at(CHECKSUM_LEN);
        let expected = u32::from_le_bytes([checksum[0], checksum[1], checksum[2], checksum[3]]);
        if crc32fast::hash(payload) != expected {
            return Err(MemDbError::Corrupted(format!("{}: checksum mismatch", key)));
        }

        Ok(serde_json::from_slice(payload)?)
    }
}

fn unavailable(op: &str, key: &str, err: std::io::Error) -> MemDbError {
    MemDbError::BackendUnavailable(format!("{} {}: {}", op, key, err))
}

#[async_trait]
impl Backend for FileBackend {
    async fn get(&self, key: &str) -> MemDbResult<Option<Document>> {
        match tokio::fs::read(self.record_path(key)).await {
            Ok(record) => Self::decode(key, &record).map(Some),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(unavailable("get", key, e)),
        }
    }

    async fn set(&self, key: &str, doc: &Document) -> MemDbResult<()> {
        let record = Self::encode(doc)?;
        let path = self.record_path(key);
        let seq = self.tmp_seq.fetch_add(1, Ordering::Relaxed);
        let tmp_path = path.with_extension(format!("tmp{}", seq));

        tokio::fs::write(&tmp_path, &record)
            .await
            .map_err(|e| unavailable("set", key, e))?;
        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| unavailable("set", key, e))?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> MemDbResult<()> {
        match tokio::fs::remove_file(self.record_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(unavailable("delete", key, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn player() -> Document {
        let mut doc = Document::new();
        doc.insert("_id".into(), json!("p1"));
        doc.insert("name".into(), json!("rain"));
        doc.insert("age".into(), json!(30));
        doc
    }

    #[tokio::test]
    async fn test_file_backend() {
        let temp_dir = tempdir().unwrap();
        let backend = FileBackend::new(temp_dir.path()).unwrap();

        assert_eq!(backend.get("player:p1").await.unwrap(), None);

        backend.set("player:p1", &player()).await.unwrap();
        assert_eq!(backend.get("player:p1").await.unwrap(), Some(player()));

        // Reopen over the same directory
        let reopened = FileBackend::new(temp_dir.path()).unwrap();
        assert_eq!(reopened.get("player:p1").await.unwrap(), Some(player()));

        backend.delete("player:p1").await.unwrap();
        backend.delete("player:p1").await.unwrap();
        assert_eq!(backend.get("player:p1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_detects_corruption() {
        let temp_dir = tempdir().unwrap();
        let backend = FileBackend::new(temp_dir.path()).unwrap();
        backend.set("player:p1", &player()).await.unwrap();

        let path = backend.record_path("player:p1");
        let mut record = std::fs::read(&path).unwrap();
        let last = record.len() - 1;
        record[last] ^= 0xff;
        std::fs::write(&path, &record).unwrap();

        let err = backend.get("player:p1").await.unwrap_err();
        assert_eq!(err.kind(), "corrupted");
    }
}
