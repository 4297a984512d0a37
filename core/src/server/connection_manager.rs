//! Connection bookkeeping
//!
//! Tracks open connection handles and the shards each one has touched since
//! its last commit or rollback.

use dashmap::DashMap;
use std::collections::HashSet;

use crate::document::ConnId;
use crate::error::{MemDbError, MemDbResult};

#[derive(Default)]
pub struct ConnectionManager {
    connections: DashMap<ConnId, HashSet<String>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection
    pub fn open(&self) -> ConnId {
        let conn = ConnId::new();
        self.connections.insert(conn, HashSet::new());
        conn
    }

    /// Forget a connection, returning the shards it still has work on
    pub fn close(&self, conn: ConnId) -> MemDbResult<HashSet<String>> {
        self.connections
            .remove(&conn)
            .map(|(_, shards)| shards)
            .ok_or_else(|| MemDbError::ConnectionNotFound(conn.to_string()))
    }

    /// Record that `conn` has work on `shard`
    pub fn touch(&self, conn: ConnId, shard: &str) -> MemDbResult<()> {
        let mut shards = self
            .connections
            .get_mut(&conn)
            .ok_or_else(|| MemDbError::ConnectionNotFound(conn.to_string()))?;
        if !shards.contains(shard) {
            shards.insert(shard.to_string());
        }
        Ok(())
    }

    /// Take the shards touched by `conn`, leaving the connection open
    pub fn take_touched(&self, conn: ConnId) -> MemDbResult<HashSet<String>> {
        let mut shards = self
            .connections
            .get_mut(&conn)
            .ok_or_else(|| MemDbError::ConnectionNotFound(conn.to_string()))?;
        Ok(std::mem::take(&mut *shards))
    }

    pub fn contains(&self, conn: ConnId) -> bool {
        self.connections.contains_key(&conn)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
