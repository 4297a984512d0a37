//! Delayed flushing of dirty cache entries

use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::time::DelayQueue;

use super::cache::{DocumentCache, FlushOutcome};
use crate::error::{MemDbError, MemDbResult};

/// Floor for the retry delay after a failed flush
const MIN_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Background task flushing each dirty key `delay` after it turned dirty.
///
/// Keys scheduled again before their flush coalesce into that flush.
pub struct PersistenceScheduler {
    tx: mpsc::UnboundedSender<String>,
    shutdown_token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PersistenceScheduler {
    pub fn spawn(shard_id: String, cache: Arc<DocumentCache>, delay: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown_token = CancellationToken::new();

        let handle = tokio::spawn(run_flusher(
            shard_id,
            cache,
            delay,
            rx,
            shutdown_token.clone(),
        ));

        Self {
            tx,
            shutdown_token,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn schedule(&self, key: String) {
        if self.tx.send(key).is_err() {
            tracing::warn!("persistence scheduler stopped, flush not scheduled");
        }
    }

    /// Signal the task to stop without waiting for it
    pub fn cancel(&self) {
        self.shutdown_token.cancel();
    }

    /// Stop the background task without flushing anything
    pub async fn shutdown(&self) {
        self.shutdown_token.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            tracing::error!("persistence task failed: {}", e);
        }
    }
}

async fn run_flusher(
    shard_id: String,
    cache: Arc<DocumentCache>,
    delay: Duration,
    mut rx: mpsc::UnboundedReceiver<String>,
    shutdown_token: CancellationToken,
) {
    let retry_delay = delay.max(MIN_RETRY_DELAY);
    let mut queue: DelayQueue<String> = DelayQueue::new();
    let mut pending: HashSet<String> = HashSet::new();

    loop {
        tokio::select! {
            biased;

            _ = shutdown_token.cancelled() => break,

            Some(key) = rx.recv() => {
                if pending.insert(key.clone()) {
                    queue.insert(key, delay);
                }
            }

            Some(expired) = queue.next() => {
                let key = expired.into_inner();
                match cache.flush(&key).await {
                    Ok(FlushOutcome::Clean) => {
                        tracing::trace!("shard[{}] flushed {}", shard_id, key);
                        pending.remove(&key);
                    }
                    Ok(FlushOutcome::StillDirty) => {
                        queue.insert(key, delay);
                    }
                    Err(e) => {
                        tracing::warn!("shard[{}] flush of {} failed, retrying: {}", shard_id, key, e);
                        queue.insert(key, retry_delay);
                    }
                }
            }
        }
    }

    tracing::debug!("shard[{}] persistence task stopped with {} pending", shard_id, pending.len());
}

/// Flush every dirty entry now. Returns the first failure after trying all keys.
pub async fn drain(shard_id: &str, cache: &DocumentCache) -> MemDbResult<usize> {
    let mut flushed = 0;
    let mut first_error: Option<MemDbError> = None;

    for key in cache.dirty_keys() {
        match cache.flush(&key).await {
            Ok(_) => flushed += 1,
            Err(e) => {
                tracing::error!("shard[{}] failed to flush {} on stop: {}", shard_id, key, e);
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(flushed),
    }
}
