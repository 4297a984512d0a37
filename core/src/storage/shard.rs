//! Shard: lock table, document cache and background persistence for a
//! partition of the keyspace
//!
//! Keys passed to a shard are fully qualified (`collection:id`). Mutations
//! require the caller to hold the key's lock and publish one [`FieldChange`]
//! per changed field to subscribers of the key's collection before returning.

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::cache::DocumentCache;
use super::events::{ChangeFeed, ChangeListener, Subscription};
use super::eviction::EvictionSweeper;
use super::lock::LockTable;
use super::persistence::{self, PersistenceScheduler};
use crate::backend::Backend;
use crate::config::ShardConfig;
use crate::document::{
    self, ConnId, Document, FieldChange, Patch, UpdateOptions, apply_patch, insert_changes,
    remove_changes,
};
use crate::error::{MemDbError, MemDbResult};
use serde_json::Value;

/// Shard lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    /// Lost without flushing, reachable only from `Running`
    Crashed,
}

struct Background {
    persistence: PersistenceScheduler,
    eviction: Option<EvictionSweeper>,
}

impl Background {
    async fn shutdown(self) {
        self.persistence.shutdown().await;
        if let Some(eviction) = self.eviction {
            eviction.shutdown().await;
        }
    }
}

pub struct Shard {
    id: String,
    config: ShardConfig,
    state: RwLock<ShardState>,
    locks: Arc<LockTable>,
    cache: Arc<DocumentCache>,
    feed: Arc<ChangeFeed>,
    /// Keys changed by each open transaction
    transactions: Mutex<HashMap<ConnId, HashSet<String>>>,
    background: Mutex<Option<Background>>,
}

impl Shard {
    pub fn new(config: ShardConfig, backend: Arc<dyn Backend>) -> Self {
        Self {
            id: config.id.clone(),
            locks: Arc::new(LockTable::new(config.lock_timeout())),
            cache: Arc::new(DocumentCache::new(backend)),
            feed: Arc::new(ChangeFeed::new()),
            transactions: Mutex::new(HashMap::new()),
            background: Mutex::new(None),
            state: RwLock::new(ShardState::Created),
            config,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &ShardConfig {
        &self.config
    }

    pub fn state(&self) -> ShardState {
        *self.state.read()
    }

    fn ensure_running(&self) -> MemDbResult<()> {
        let state = self.state();
        if state == ShardState::Running {
            Ok(())
        } else {
            Err(MemDbError::NotReady {
                shard: self.id.clone(),
                state,
            })
        }
    }

    fn ensure_locked(&self, conn: ConnId, key: &str) -> MemDbResult<()> {
        if self.locks.is_locked(conn, key) {
            Ok(())
        } else {
            Err(MemDbError::LockNotHeld {
                key: key.to_string(),
                conn: conn.to_string(),
            })
        }
    }

    // Lifecycle

    /// Start serving. The cache starts empty and fills lazily from the backend.
    pub async fn start(&self) -> MemDbResult<()> {
        {
            let mut state = self.state.write();
            match *state {
                ShardState::Created | ShardState::Stopped => *state = ShardState::Starting,
                other => {
                    return Err(MemDbError::InvalidState(format!(
                        "cannot start shard {} from {:?}",
                        self.id, other
                    )));
                }
            }
        }
        tracing::info!("shard[{}] starting", self.id);

        self.locks.clear();
        self.cache.clear();
        self.transactions.lock().clear();

        let persistence = PersistenceScheduler::spawn(
            self.id.clone(),
            Arc::clone(&self.cache),
            self.config.persistent_delay(),
        );

        let eviction = match (self.config.idle_timeout(), self.config.gc_interval()) {
            (Some(idle_timeout), Some(period)) => Some(EvictionSweeper::spawn(
                self.id.clone(),
                Arc::clone(&self.cache),
                Arc::clone(&self.locks),
                idle_timeout,
                period,
            )),
            _ => {
                tracing::debug!("shard[{}] idle eviction disabled", self.id);
                None
            }
        };

        *self.background.lock() = Some(Background {
            persistence,
            eviction,
        });
        *self.state.write() = ShardState::Running;

        tracing::info!("shard[{}] started", self.id);
        Ok(())
    }

    /// Stop serving. Open transactions are rolled back and dirty entries are
    /// flushed first, unless `force` is set (or the shard crashed), in which
    /// case unflushed writes are discarded.
    pub async fn stop(&self, force: bool) -> MemDbResult<()> {
        let crashed = {
            let mut state = self.state.write();
            match *state {
                ShardState::Running => {
                    *state = ShardState::Stopping;
                    false
                }
                ShardState::Crashed => {
                    *state = ShardState::Stopping;
                    true
                }
                ShardState::Stopped => return Ok(()),
                other => {
                    return Err(MemDbError::InvalidState(format!(
                        "cannot stop shard {} from {:?}",
                        self.id, other
                    )));
                }
            }
        };
        tracing::info!("shard[{}] stopping (force: {})", self.id, force);

        let background = self.background.lock().take();
        if let Some(background) = background {
            background.shutdown().await;
        }

        let open: Vec<(ConnId, HashSet<String>)> = self.transactions.lock().drain().collect();
        for (conn, keys) in open {
            tracing::warn!("shard[{}] rolling back open transaction {}", self.id, conn);
            keys.iter().for_each(|key| self.cache.revert(key));
        }

        let result = if force || crashed {
            let discarded = self.cache.dirty_keys().len();
            if discarded > 0 {
                tracing::warn!("shard[{}] discarding {} unflushed documents", self.id, discarded);
            }
            Ok(())
        } else {
            persistence::drain(&self.id, &self.cache).await.map(|flushed| {
                tracing::debug!("shard[{}] flushed {} documents on stop", self.id, flushed);
            })
        };

        self.locks.clear();
        self.cache.clear();
        *self.state.write() = ShardState::Stopped;

        tracing::info!("shard[{}] stopped", self.id);
        result
    }

    /// Simulate sudden process loss: background work stops and everything not
    /// yet flushed is lost. Only valid while running.
    pub async fn force_crash(&self) -> MemDbResult<()> {
        {
            let mut state = self.state.write();
            if *state != ShardState::Running {
                return Err(MemDbError::InvalidState(format!(
                    "cannot crash shard {} from {:?}",
                    self.id, *state
                )));
            }
            *state = ShardState::Crashed;
        }

        let background = self.background.lock().take();
        if let Some(background) = background {
            background.shutdown().await;
        }

        tracing::warn!(
            "shard[{}] crashed with {} unflushed documents",
            self.id,
            self.cache.dirty_keys().len()
        );
        self.transactions.lock().clear();
        self.locks.clear();
        self.cache.clear();
        Ok(())
    }

    // Locking

    pub async fn lock(&self, conn: ConnId, key: &str) -> MemDbResult<()> {
        self.ensure_running()?;
        self.locks.lock(conn, key).await
    }

    pub fn is_locked(&self, conn: ConnId, key: &str) -> bool {
        self.locks.is_locked(conn, key)
    }

    // Mutations

    /// Create a document. Fails if one already exists under `key`.
    pub async fn insert(&self, conn: ConnId, key: &str, doc: Document) -> MemDbResult<()> {
        self.ensure_running()?;
        self.ensure_locked(conn, key)?;

        let changes = self
            .cache
            .modify(key, |value| {
                if value.is_some() {
                    return Err(MemDbError::AlreadyExists(key.to_string()));
                }
                let changes = insert_changes(&doc);
                *value = Some(doc);
                Ok(changes)
            })
            .await?;

        self.track(conn, key);
        self.publish(conn, key, changes);
        Ok(())
    }

    /// Merge `patch` into the document, creating it when `opts.upsert` is set
    pub async fn update(
        &self,
        conn: ConnId,
        key: &str,
        patch: &Patch,
        opts: UpdateOptions,
    ) -> MemDbResult<()> {
        self.ensure_running()?;
        self.ensure_locked(conn, key)?;

        let changes = self
            .cache
            .modify(key, |value| {
                if let Some(doc) = value.as_mut() {
                    return Ok(apply_patch(doc, patch));
                }
                if !opts.upsert {
                    return Err(MemDbError::DocumentNotFound(key.to_string()));
                }
                let mut doc = Document::new();
                let changes = apply_patch(&mut doc, patch);
                *value = Some(doc);
                Ok(changes)
            })
            .await?;

        self.track(conn, key);
        self.publish(conn, key, changes);
        Ok(())
    }

    /// Delete the document; removing a missing document does nothing
    pub async fn remove(&self, conn: ConnId, key: &str) -> MemDbResult<()> {
        self.ensure_running()?;
        self.ensure_locked(conn, key)?;

        if self.cache.read(key).await?.is_none() {
            return Ok(());
        }

        let changes = self
            .cache
            .modify(key, |value| {
                Ok(value.take().map(|doc| remove_changes(&doc)).unwrap_or_default())
            })
            .await?;

        self.track(conn, key);
        self.publish(conn, key, changes);
        Ok(())
    }

    /// Undo changes made to `key` since `value` was read, within the open
    /// transaction. No field changes are published.
    pub fn restore(&self, conn: ConnId, key: &str, value: Option<Document>) -> MemDbResult<()> {
        self.ensure_running()?;
        self.ensure_locked(conn, key)?;
        self.cache.restore(key, value);
        Ok(())
    }

    // Reads

    /// Current value, including uncommitted changes. Loads from the backend on a miss.
    pub async fn find(
        &self,
        _conn: ConnId,
        key: &str,
        fields: Option<&[String]>,
    ) -> MemDbResult<Option<Document>> {
        self.ensure_running()?;
        let doc = self.cache.read(key).await?;
        Ok(doc.map(|doc| document::project(doc, fields)))
    }

    /// Last committed value. Loads from the backend on a miss.
    pub async fn find_cached(&self, _conn: ConnId, key: &str) -> MemDbResult<Option<Document>> {
        self.ensure_running()?;
        self.cache.read_committed(key).await
    }

    // Transactions

    /// Make the connection's changes visible to flushing and release its locks
    pub fn commit(&self, conn: ConnId) -> MemDbResult<()> {
        self.ensure_running()?;

        let keys = self.transactions.lock().remove(&conn).unwrap_or_default();
        let mut scheduled = 0;
        for key in &keys {
            if self.cache.commit(key) {
                self.schedule_flush(key);
                scheduled += 1;
            }
        }
        let released = self.locks.release_all(conn);

        tracing::debug!(
            "shard[{}].commit({}) => {} changed, {} scheduled, {} unlocked",
            self.id,
            conn,
            keys.len(),
            scheduled,
            released.len()
        );
        Ok(())
    }

    /// Revert the connection's changes and release its locks
    pub fn rollback(&self, conn: ConnId) -> MemDbResult<()> {
        self.ensure_running()?;

        let keys = self.transactions.lock().remove(&conn).unwrap_or_default();
        keys.iter().for_each(|key| self.cache.revert(key));
        let released = self.locks.release_all(conn);

        tracing::debug!(
            "shard[{}].rollback({}) => {} reverted, {} unlocked",
            self.id,
            conn,
            keys.len(),
            released.len()
        );
        Ok(())
    }

    // Change feed

    pub fn subscribe(&self, collection: &str, listener: Arc<dyn ChangeListener>) -> Subscription {
        self.feed.subscribe(collection, listener)
    }

    // Cache introspection

    /// Whether `key` is resident in memory, without loading it
    pub fn is_cached(&self, key: &str) -> bool {
        self.cache.contains(key)
    }

    pub fn is_dirty(&self, key: &str) -> bool {
        self.cache.is_dirty(key)
    }

    fn track(&self, conn: ConnId, key: &str) {
        self.transactions
            .lock()
            .entry(conn)
            .or_default()
            .insert(key.to_string());
    }

    fn schedule_flush(&self, key: &str) {
        match self.background.lock().as_ref() {
            Some(background) => background.persistence.schedule(key.to_string()),
            None => tracing::warn!("shard[{}] has no persistence task for {}", self.id, key),
        }
    }

    fn publish(&self, conn: ConnId, key: &str, changes: Vec<(String, Option<Value>, Option<Value>)>) {
        let Some((collection, id)) = document::split_key(key) else {
            return;
        };

        for (field, old_value, new_value) in changes {
            self.feed.publish(
                collection,
                &FieldChange {
                    conn,
                    id: id.to_string(),
                    field,
                    old_value,
                    new_value,
                },
            );
        }
    }
}

impl Drop for Shard {
    fn drop(&mut self) {
        if let Some(background) = self.background.get_mut().take() {
            // Dropping the handles detaches the tasks; cancel them instead
            background.persistence.cancel();
            if let Some(eviction) = &background.eviction {
                eviction.cancel();
            }
        }
    }
}
