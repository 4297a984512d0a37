//! Document model shared by every layer of the store
//!
//! Documents are schema-less JSON objects. Field-level changes use `None` as
//! the "absent" sentinel, meaning the field is deleted.

use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// A stored document
pub type Document = serde_json::Map<String, Value>;

/// Field-level update; a `None` value deletes the field
pub type Patch = BTreeMap<String, Option<Value>>;

/// Reserved field carrying the document id
pub const ID_FIELD: &str = "_id";

/// Separator between collection name and document id in storage keys
pub const KEY_SEPARATOR: char = ':';

/// Name prefix reserved for index collections
pub const INDEX_PREFIX: &str = "__index_";

/// Opaque transaction handle handed out by `Database::connect`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(Uuid);

impl ConnId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single uncommitted field change published by a shard
#[derive(Debug, Clone, PartialEq)]
pub struct FieldChange {
    pub conn: ConnId,
    pub id: String,
    pub field: String,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
}

/// Options for `update`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOptions {
    /// Create the document when it does not exist
    pub upsert: bool,
}

impl UpdateOptions {
    pub fn upsert() -> Self {
        Self { upsert: true }
    }
}

/// Storage key for a document: `collection:id`
pub fn storage_key(collection: &str, id: &str) -> String {
    format!("{}{}{}", collection, KEY_SEPARATOR, id)
}

/// Split a storage key back into `(collection, id)`
pub fn split_key(key: &str) -> Option<(&str, &str)> {
    key.split_once(KEY_SEPARATOR)
}

/// Key under which an indexed value is stored in an index collection.
///
/// Canonical JSON text, so `"1"` and `1` land in different entries.
pub fn index_key(value: &Value) -> String {
    value.to_string()
}

/// Build a patch that sets every field of `doc`
pub fn set_fields(doc: &Document) -> Patch {
    doc.iter()
        .map(|(field, value)| (field.clone(), Some(value.clone())))
        .collect()
}

/// Restrict a document to `fields`. The id field is always kept.
pub fn project(doc: Document, fields: Option<&[String]>) -> Document {
    match fields {
        None => doc,
        Some(fields) => doc
            .into_iter()
            .filter(|(field, _)| field == ID_FIELD || fields.iter().any(|f| f == field))
            .collect(),
    }
}

/// Field changes produced by creating `doc` from nothing
pub(crate) fn insert_changes(doc: &Document) -> Vec<(String, Option<Value>, Option<Value>)> {
    doc.iter()
        .map(|(field, value)| (field.clone(), None, Some(value.clone())))
        .collect()
}

/// Field changes produced by deleting `doc`
pub(crate) fn remove_changes(doc: &Document) -> Vec<(String, Option<Value>, Option<Value>)> {
    doc.iter()
        .map(|(field, value)| (field.clone(), Some(value.clone()), None))
        .collect()
}

/// Apply `patch` to `doc` in place, returning the fields that actually changed
pub(crate) fn apply_patch(
    doc: &mut Document,
    patch: &Patch,
) -> Vec<(String, Option<Value>, Option<Value>)> {
    let mut changes = Vec::new();

    for (field, new_value) in patch {
        let old_value = doc.get(field).cloned();
        if old_value == *new_value {
            continue;
        }

        match new_value {
            Some(value) => {
                doc.insert(field.clone(), value.clone());
            }
            None => {
                doc.remove(field);
            }
        }

        changes.push((field.clone(), old_value, new_value.clone()));
    }

    changes
}
