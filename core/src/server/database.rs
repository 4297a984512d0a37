//! Database: shards, collections and connections
//!
//! Collections are routed to shards by configuration; unconfigured
//! collections are created on first use, without indexes, on the first shard.
//! Each shard commits independently, so a connection that touched several
//! shards gets one commit per shard.

use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use super::ConnectionManager;
use crate::backend::{Backend, open_backend};
use crate::collection::Collection;
use crate::config::{DatabaseConfig, validate_client_collection_name};
use crate::document::{ConnId, Document, Patch, UpdateOptions};
use crate::error::{MemDbError, MemDbResult};
use crate::storage::Shard;

pub struct Database {
    config: DatabaseConfig,
    backend: Arc<dyn Backend>,
    /// In configuration order
    shards: Vec<Arc<Shard>>,
    shard_ids: HashMap<String, usize>,
    collections: DashMap<String, Arc<Collection>>,
    connections: ConnectionManager,
}

impl Database {
    /// Build a database over an existing backend, e.g. one shared with
    /// another database instance
    pub fn new(config: DatabaseConfig, backend: Arc<dyn Backend>) -> MemDbResult<Self> {
        config.validate()?;

        let shards: Vec<Arc<Shard>> = config
            .shards
            .iter()
            .map(|shard| Arc::new(Shard::new(shard.clone(), Arc::clone(&backend))))
            .collect();
        let shard_ids = shards
            .iter()
            .enumerate()
            .map(|(i, shard)| (shard.id().to_string(), i))
            .collect();

        let db = Self {
            config,
            backend,
            shards,
            shard_ids,
            collections: DashMap::new(),
            connections: ConnectionManager::new(),
        };

        for (name, collection) in &db.config.collections {
            let shard = match &collection.shard {
                Some(id) => db.shard(id)?,
                None => db.default_shard()?,
            };
            let created = Collection::new(name, shard, &collection.indexes)?;
            db.collections.insert(name.clone(), Arc::new(created));
        }

        Ok(db)
    }

    /// Build a database with the backend described by its configuration
    pub fn open(config: DatabaseConfig) -> MemDbResult<Self> {
        let backend = open_backend(&config.backend)?;
        Self::new(config, backend)
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn shard(&self, id: &str) -> MemDbResult<Arc<Shard>> {
        self.shard_ids
            .get(id)
            .map(|&i| Arc::clone(&self.shards[i]))
            .ok_or_else(|| MemDbError::ShardNotFound(id.to_string()))
    }

    pub fn shards(&self) -> impl Iterator<Item = &Arc<Shard>> {
        self.shards.iter()
    }

    fn default_shard(&self) -> MemDbResult<Arc<Shard>> {
        self.shards
            .first()
            .cloned()
            .ok_or_else(|| MemDbError::Config("no shards configured".into()))
    }

    /// Collection by name, created with defaults if not configured. Index
    /// collections are only reachable through their owning collection.
    pub fn collection(&self, name: &str) -> MemDbResult<Arc<Collection>> {
        validate_client_collection_name(name)?;
        if let Some(collection) = self.collections.get(name) {
            return Ok(Arc::clone(collection.value()));
        }

        let created = Arc::new(Collection::new(name, self.default_shard()?, &[])?);
        tracing::debug!(
            "collection[{}] created on shard[{}]",
            name,
            created.shard().id()
        );

        let collection = self
            .collections
            .entry(name.to_string())
            .or_insert(created);
        Ok(Arc::clone(collection.value()))
    }

    /// Resolve `name` for `conn` and record the owning shard as touched
    fn route(&self, conn: ConnId, name: &str) -> MemDbResult<Arc<Collection>> {
        let collection = self.collection(name)?;
        self.connections.touch(conn, collection.shard().id())?;
        Ok(collection)
    }

    // Lifecycle

    pub async fn start(&self) -> MemDbResult<()> {
        for shard in &self.shards {
            shard.start().await?;
        }
        tracing::info!("database started with {} shards", self.shards.len());
        Ok(())
    }

    /// Stop every shard, returning the first failure after all were stopped
    pub async fn stop(&self, force: bool) -> MemDbResult<()> {
        let mut first_error = None;
        for shard in &self.shards {
            if let Err(e) = shard.stop(force).await {
                tracing::error!("failed to stop shard[{}]: {}", shard.id(), e);
                first_error.get_or_insert(e);
            }
        }
        tracing::info!("database stopped");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // Connections

    pub fn connect(&self) -> ConnId {
        let conn = self.connections.open();
        tracing::debug!("connection {} opened", conn);
        conn
    }

    /// Roll back the connection's open work and forget it
    pub fn disconnect(&self, conn: ConnId) -> MemDbResult<()> {
        let touched = self.connections.close(conn)?;
        let result = self.fan_out(conn, touched, Shard::rollback);
        tracing::debug!("connection {} closed", conn);
        result
    }

    pub fn commit(&self, conn: ConnId) -> MemDbResult<()> {
        let touched = self.connections.take_touched(conn)?;
        self.fan_out(conn, touched, Shard::commit)
    }

    pub fn rollback(&self, conn: ConnId) -> MemDbResult<()> {
        let touched = self.connections.take_touched(conn)?;
        self.fan_out(conn, touched, Shard::rollback)
    }

    /// Run `op` on every shard in `touched`. Every shard is visited even
    /// when one fails, so locks are always released.
    fn fan_out(
        &self,
        conn: ConnId,
        touched: impl IntoIterator<Item = String>,
        op: impl Fn(&Shard, ConnId) -> MemDbResult<()>,
    ) -> MemDbResult<()> {
        let mut first_error = None;
        for id in touched {
            let result = self.shard(&id).and_then(|shard| op(shard.as_ref(), conn));
            if let Err(e) = result {
                tracing::warn!("connection {} on shard[{}]: {}", conn, id, e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // Document operations

    pub async fn insert(
        &self,
        conn: ConnId,
        collection: &str,
        id: &str,
        doc: Document,
    ) -> MemDbResult<()> {
        self.route(conn, collection)?.insert(conn, id, doc).await
    }

    pub async fn update(
        &self,
        conn: ConnId,
        collection: &str,
        id: &str,
        patch: Patch,
        opts: UpdateOptions,
    ) -> MemDbResult<()> {
        self.route(conn, collection)?
            .update(conn, id, patch, opts)
            .await
    }

    pub async fn remove(&self, conn: ConnId, collection: &str, id: &str) -> MemDbResult<()> {
        self.route(conn, collection)?.remove(conn, id).await
    }

    pub async fn find(
        &self,
        conn: ConnId,
        collection: &str,
        id: &str,
        fields: Option<&[String]>,
    ) -> MemDbResult<Option<Document>> {
        self.route(conn, collection)?.find(conn, id, fields).await
    }

    pub async fn find_for_update(
        &self,
        conn: ConnId,
        collection: &str,
        id: &str,
        fields: Option<&[String]>,
    ) -> MemDbResult<Option<Document>> {
        self.route(conn, collection)?
            .find_for_update(conn, id, fields)
            .await
    }

    pub async fn find_by_index(
        &self,
        conn: ConnId,
        collection: &str,
        field: &str,
        value: &Value,
        fields: Option<&[String]>,
    ) -> MemDbResult<Vec<Document>> {
        self.route(conn, collection)?
            .find_by_index(conn, field, value, fields)
            .await
    }

    pub async fn find_cached(
        &self,
        conn: ConnId,
        collection: &str,
        id: &str,
    ) -> MemDbResult<Option<Document>> {
        self.route(conn, collection)?.find_cached(conn, id).await
    }

    pub async fn lock(&self, conn: ConnId, collection: &str, id: &str) -> MemDbResult<()> {
        self.route(conn, collection)?.lock(conn, id).await
    }
}
