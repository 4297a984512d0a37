//! Named document collections over a shard, with secondary index maintenance
//!
//! Every indexed field is backed by an index collection named
//! `__index_<collection>_<field>`. Its documents are keyed by the canonical
//! JSON text of an indexed value and map each document id holding that value
//! to `true`. Index updates are queued from the shard's change feed and
//! completed before the mutating call returns. A call whose index updates
//! fail leaves no trace of itself in the open transaction.

use futures::future::try_join_all;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::config::validate_collection_name;
use crate::document::{
    ConnId, Document, FieldChange, ID_FIELD, INDEX_PREFIX, Patch, UpdateOptions, index_key,
    storage_key,
};
use crate::error::{MemDbError, MemDbResult};
use crate::storage::{ChangeListener, Shard, Subscription};

/// Name of the collection backing the index on `field` of `collection`
pub fn index_collection_name(collection: &str, field: &str) -> String {
    format!("{}{}_{}", INDEX_PREFIX, collection, field)
}

#[derive(Debug, Clone, PartialEq)]
enum IndexOp {
    Add { field: String, value: Value },
    Discard { field: String, value: Value },
}

type PendingOps = Arc<Mutex<HashMap<(ConnId, String), Vec<IndexOp>>>>;

/// Keys written by one call, with their values from before the call
type Savepoint = Mutex<Vec<(String, Option<Document>)>>;

/// Turns field changes on indexed fields into pending index operations
struct IndexListener {
    fields: HashSet<String>,
    pending: PendingOps,
}

impl ChangeListener for IndexListener {
    fn on_change(&self, change: &FieldChange) {
        if !self.fields.contains(&change.field) {
            return;
        }

        let mut pending = self.pending.lock();
        let ops = pending.entry((change.conn, change.id.clone())).or_default();
        if let Some(value) = &change.old_value {
            ops.push(IndexOp::Discard {
                field: change.field.clone(),
                value: value.clone(),
            });
        }
        if let Some(value) = &change.new_value {
            ops.push(IndexOp::Add {
                field: change.field.clone(),
                value: value.clone(),
            });
        }
    }
}

pub struct Collection {
    name: String,
    shard: Arc<Shard>,
    indexes: HashMap<String, Collection>,
    pending: PendingOps,
    _subscription: Option<Subscription>,
}

impl Collection {
    pub fn new(name: &str, shard: Arc<Shard>, indexes: &[String]) -> MemDbResult<Self> {
        validate_collection_name(name)?;

        let mut index_collections = HashMap::new();
        for field in indexes {
            if field.is_empty() {
                return Err(MemDbError::InvalidInput(format!(
                    "empty index field on collection {}",
                    name
                )));
            }
            let index = Collection::new(
                &index_collection_name(name, field),
                Arc::clone(&shard),
                &[],
            )?;
            index_collections.insert(field.clone(), index);
        }

        let pending: PendingOps = Arc::new(Mutex::new(HashMap::new()));
        let subscription = (!index_collections.is_empty()).then(|| {
            let listener = IndexListener {
                fields: index_collections.keys().cloned().collect(),
                pending: Arc::clone(&pending),
            };
            shard.subscribe(name, Arc::new(listener))
        });

        Ok(Self {
            name: name.to_string(),
            shard,
            indexes: index_collections,
            pending,
            _subscription: subscription,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shard(&self) -> &Arc<Shard> {
        &self.shard
    }

    fn key(&self, id: &str) -> String {
        storage_key(&self.name, id)
    }

    pub async fn lock(&self, conn: ConnId, id: &str) -> MemDbResult<()> {
        self.shard.lock(conn, &self.key(id)).await
    }

    /// Insert `doc` under `id`. The id is stored in the document's `_id` field.
    pub async fn insert(&self, conn: ConnId, id: &str, mut doc: Document) -> MemDbResult<()> {
        tracing::debug!(
            "shard[{}].collection[{}].insert({}, {}, {:?})",
            self.shard.id(),
            self.name,
            conn,
            id,
            doc
        );

        self.check_indexable(id)?;
        doc.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
        let key = self.key(id);
        self.shard.lock(conn, &key).await?;
        let savepoint = self.savepoint(conn, &key).await?;
        let result = self.shard.insert(conn, &key, doc).await;
        self.complete(conn, id, savepoint, result).await
    }

    /// Apply a field patch; `None` values delete fields
    pub async fn update(
        &self,
        conn: ConnId,
        id: &str,
        mut patch: Patch,
        opts: UpdateOptions,
    ) -> MemDbResult<()> {
        tracing::debug!(
            "shard[{}].collection[{}].update({}, {}, {:?}, {:?})",
            self.shard.id(),
            self.name,
            conn,
            id,
            patch,
            opts
        );

        self.check_indexable(id)?;
        patch.insert(ID_FIELD.to_string(), Some(Value::String(id.to_string())));
        let key = self.key(id);
        self.shard.lock(conn, &key).await?;
        let savepoint = self.savepoint(conn, &key).await?;
        let result = self.shard.update(conn, &key, &patch, opts).await;
        self.complete(conn, id, savepoint, result).await
    }

    pub async fn remove(&self, conn: ConnId, id: &str) -> MemDbResult<()> {
        tracing::debug!(
            "shard[{}].collection[{}].remove({}, {})",
            self.shard.id(),
            self.name,
            conn,
            id
        );

        self.check_indexable(id)?;
        let key = self.key(id);
        self.shard.lock(conn, &key).await?;
        let savepoint = self.savepoint(conn, &key).await?;
        let result = self.shard.remove(conn, &key).await;
        self.complete(conn, id, savepoint, result).await
    }

    pub async fn find(
        &self,
        conn: ConnId,
        id: &str,
        fields: Option<&[String]>,
    ) -> MemDbResult<Option<Document>> {
        let doc = self.shard.find(conn, &self.key(id), fields).await?;
        tracing::debug!(
            "shard[{}].collection[{}].find({}, {}, {:?}) => {:?}",
            self.shard.id(),
            self.name,
            conn,
            id,
            fields,
            doc
        );
        Ok(doc)
    }

    /// Lock the document, then read it
    pub async fn find_for_update(
        &self,
        conn: ConnId,
        id: &str,
        fields: Option<&[String]>,
    ) -> MemDbResult<Option<Document>> {
        self.lock(conn, id).await?;
        self.find(conn, id, fields).await
    }

    /// Last committed version of the document
    pub async fn find_cached(&self, conn: ConnId, id: &str) -> MemDbResult<Option<Document>> {
        let doc = self.shard.find_cached(conn, &self.key(id)).await?;
        tracing::debug!(
            "shard[{}].collection[{}].find_cached({}, {}) => {:?}",
            self.shard.id(),
            self.name,
            conn,
            id,
            doc
        );
        Ok(doc)
    }

    /// Documents whose `field` equals `value`, ordered by id
    pub async fn find_by_index(
        &self,
        conn: ConnId,
        field: &str,
        value: &Value,
        fields: Option<&[String]>,
    ) -> MemDbResult<Vec<Document>> {
        let index = self
            .indexes
            .get(field)
            .ok_or_else(|| MemDbError::IndexNotFound {
                collection: self.name.clone(),
                field: field.to_string(),
            })?;

        let Some(entry) = index.find(conn, &index_key(value), None).await? else {
            return Ok(Vec::new());
        };

        let mut docs = Vec::new();
        for id in entry.keys().filter(|id| id.as_str() != ID_FIELD) {
            if let Some(doc) = self.find(conn, id, fields).await? {
                docs.push(doc);
            }
        }

        tracing::debug!(
            "shard[{}].collection[{}].find_by_index({}, {}, {}) => {} documents",
            self.shard.id(),
            self.name,
            conn,
            field,
            value,
            docs.len()
        );
        Ok(docs)
    }

    /// The reserved id field cannot be an index entry member
    fn check_indexable(&self, id: &str) -> MemDbResult<()> {
        if id == ID_FIELD && !self.indexes.is_empty() {
            return Err(MemDbError::UnsupportedIndexKey(id.to_string()));
        }
        Ok(())
    }

    /// Remember the current value of `key` so a failed call can be undone.
    /// Collections without indexes never need to undo.
    async fn savepoint(&self, conn: ConnId, key: &str) -> MemDbResult<Savepoint> {
        let savepoint = Savepoint::default();
        if !self.indexes.is_empty() {
            let before = self.shard.find(conn, key, None).await?;
            savepoint.lock().push((key.to_string(), before));
        }
        Ok(savepoint)
    }

    /// Run the index operations queued by a mutation of `id`. If the mutation
    /// or any index operation fails, every key written by this call is put
    /// back and the transaction stays open.
    async fn complete(
        &self,
        conn: ConnId,
        id: &str,
        savepoint: Savepoint,
        result: MemDbResult<()>,
    ) -> MemDbResult<()> {
        let ops = self
            .pending
            .lock()
            .remove(&(conn, id.to_string()))
            .unwrap_or_default();
        result?;

        if ops.is_empty() {
            return Ok(());
        }

        let applied = try_join_all(
            ops.into_iter()
                .map(|op| self.apply_index_op(conn, id, op, &savepoint)),
        )
        .await;

        if let Err(e) = applied {
            self.undo(conn, savepoint);
            return Err(e);
        }
        Ok(())
    }

    fn undo(&self, conn: ConnId, savepoint: Savepoint) {
        let saved = savepoint.into_inner();
        tracing::debug!(
            "shard[{}].collection[{}] undoing {} keys for {}",
            self.shard.id(),
            self.name,
            saved.len(),
            conn
        );

        for (key, value) in saved.into_iter().rev() {
            if let Err(e) = self.shard.restore(conn, &key, value) {
                tracing::warn!("shard[{}] failed to undo {}: {}", self.shard.id(), key, e);
            }
        }
    }

    async fn apply_index_op(
        &self,
        conn: ConnId,
        id: &str,
        op: IndexOp,
        savepoint: &Savepoint,
    ) -> MemDbResult<()> {
        match op {
            IndexOp::Add { field, value } => {
                let index = self.index(&field)?;
                index
                    .add_to_entry(conn, &index_key(&value), id, savepoint)
                    .await
            }
            IndexOp::Discard { field, value } => {
                let index = self.index(&field)?;
                index
                    .remove_from_entry(conn, &index_key(&value), id, savepoint)
                    .await
            }
        }
    }

    fn index(&self, field: &str) -> MemDbResult<&Collection> {
        self.indexes.get(field).ok_or_else(|| MemDbError::IndexNotFound {
            collection: self.name.clone(),
            field: field.to_string(),
        })
    }

    // Index entry maintenance. These go straight to the shard since index
    // collections carry no indexes of their own.

    async fn add_to_entry(
        &self,
        conn: ConnId,
        entry: &str,
        id: &str,
        savepoint: &Savepoint,
    ) -> MemDbResult<()> {
        let key = self.key(entry);
        self.shard.lock(conn, &key).await?;
        let before = self.shard.find(conn, &key, None).await?;
        savepoint.lock().push((key.clone(), before));

        let mut patch = Patch::new();
        patch.insert(ID_FIELD.to_string(), Some(Value::String(entry.to_string())));
        patch.insert(id.to_string(), Some(Value::Bool(true)));
        self.shard
            .update(conn, &key, &patch, UpdateOptions::upsert())
            .await
    }

    async fn remove_from_entry(
        &self,
        conn: ConnId,
        entry: &str,
        id: &str,
        savepoint: &Savepoint,
    ) -> MemDbResult<()> {
        let key = self.key(entry);
        self.shard.lock(conn, &key).await?;

        let Some(doc) = self.shard.find(conn, &key, None).await? else {
            return Ok(());
        };
        savepoint.lock().push((key.clone(), Some(doc.clone())));

        if doc.keys().all(|field| field == ID_FIELD || field == id) {
            self.shard.remove(conn, &key).await
        } else {
            let mut patch = Patch::new();
            patch.insert(id.to_string(), None);
            self.shard
                .update(conn, &key, &patch, UpdateOptions::default())
                .await
        }
    }
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.name)
            .field("shard", &self.shard.id())
            .field("indexes", &self.indexes.keys().collect::<Vec<_>>())
            .finish()
    }
}
