//! Per-shard document lock table

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::sync::oneshot;

use crate::document::ConnId;
use crate::error::{MemDbError, MemDbResult};

#[derive(Debug)]
struct LockInfo {
    holder: ConnId,
    waiters: VecDeque<(ConnId, oneshot::Sender<()>)>,
}

#[derive(Debug, Default)]
struct LockState {
    locks: HashMap<String, LockInfo>,
    held: HashMap<ConnId, HashSet<String>>,
}

impl LockState {
    fn grant(&mut self, key: &str, conn: ConnId) {
        self.locks.insert(
            key.to_string(),
            LockInfo {
                holder: conn,
                waiters: VecDeque::new(),
            },
        );
        self.held.entry(conn).or_default().insert(key.to_string());
    }

    /// Pass `key` to the next waiter still listening, or drop the entry.
    fn hand_over(&mut self, key: &str) {
        let next = match self.locks.get_mut(key) {
            Some(info) => loop {
                match info.waiters.pop_front() {
                    Some((conn, tx)) => {
                        // A closed receiver means the waiter gave up
                        if tx.send(()).is_ok() {
                            info.holder = conn;
                            break Some(conn);
                        }
                    }
                    None => break None,
                }
            },
            None => return,
        };

        match next {
            Some(conn) => {
                self.held.entry(conn).or_default().insert(key.to_string());
            }
            None => {
                self.locks.remove(key);
            }
        }
    }

    fn release(&mut self, key: &str, conn: ConnId) {
        if let Some(keys) = self.held.get_mut(&conn) {
            keys.remove(key);
            if keys.is_empty() {
                self.held.remove(&conn);
            }
        }
        self.hand_over(key);
    }
}

/// Exclusive per-key locks owned by connections.
///
/// At most one connection holds a key; others queue in FIFO order.
pub struct LockTable {
    state: Mutex<LockState>,
    timeout: Option<Duration>,
}

impl LockTable {
    /// `timeout` bounds how long `lock` waits; `None` waits forever
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            state: Mutex::new(LockState::default()),
            timeout,
        }
    }

    /// Acquire `key` for `conn`, suspending while another connection holds it.
    ///
    /// Re-locking a key already held by `conn` is a no-op.
    pub async fn lock(&self, conn: ConnId, key: &str) -> MemDbResult<()> {
        let rx = {
            let mut state = self.state.lock();
            if let Some(info) = state.locks.get_mut(key) {
                if info.holder == conn {
                    return Ok(());
                }
                tracing::debug!("{} waiting for lock on {} held by {}", conn, key, info.holder);
                let (tx, rx) = oneshot::channel();
                info.waiters.push_back((conn, tx));
                rx
            } else {
                state.grant(key, conn);
                return Ok(());
            }
        };

        let granted = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, rx).await.ok(),
            None => Some(rx.await),
        };

        match granted {
            Some(Ok(())) => Ok(()),
            Some(Err(_)) => Err(MemDbError::Internal(format!(
                "lock wait on {} aborted",
                key
            ))),
            None => {
                let mut state = self.state.lock();
                if let Some(info) = state.locks.get_mut(key) {
                    // Granted between the timer firing and this check
                    if info.holder == conn {
                        return Ok(());
                    }
                    info.waiters.retain(|(waiter, _)| *waiter != conn);
                }
                Err(MemDbError::LockTimeout(key.to_string()))
            }
        }
    }

    /// Release `key` if `conn` holds it
    pub fn unlock(&self, key: &str, conn: ConnId) -> bool {
        let mut state = self.state.lock();
        match state.locks.get(key).map(|info| info.holder) {
            Some(holder) if holder == conn => {
                state.release(key, conn);
                true
            }
            Some(holder) => {
                tracing::warn!("{} tried to unlock {} held by {}", conn, key, holder);
                false
            }
            None => {
                tracing::warn!("{} tried to unlock {} which is not locked", conn, key);
                false
            }
        }
    }

    /// Release every key held by `conn` and cancel its pending waits.
    /// Returns the released keys.
    pub fn release_all(&self, conn: ConnId) -> Vec<String> {
        let mut state = self.state.lock();
        let keys: Vec<String> = state
            .held
            .remove(&conn)
            .map(|keys| keys.into_iter().collect())
            .unwrap_or_default();

        for key in &keys {
            if state.locks.get(key).is_some_and(|info| info.holder == conn) {
                state.hand_over(key);
            }
        }

        for info in state.locks.values_mut() {
            info.waiters.retain(|(waiter, _)| *waiter != conn);
        }

        keys
    }

    /// Whether `conn` currently holds `key`
    pub fn is_locked(&self, conn: ConnId, key: &str) -> bool {
        self.holder(key) == Some(conn)
    }

    /// Whether any connection holds `key`
    pub fn is_held(&self, key: &str) -> bool {
        self.state.lock().locks.contains_key(key)
    }

    pub fn holder(&self, key: &str) -> Option<ConnId> {
        self.state.lock().locks.get(key).map(|info| info.holder)
    }

    #[cfg(test)]
    pub fn held_keys(&self, conn: ConnId) -> Vec<String> {
        self.state
            .lock()
            .held
            .get(&conn)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop all locks; pending waiters fail
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.locks.clear();
        state.held.clear();
    }
}
