//! Periodic eviction of idle clean entries

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

use super::cache::DocumentCache;
use super::lock::LockTable;

pub struct EvictionSweeper {
    shutdown_token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl EvictionSweeper {
    /// Sweep every `period`, evicting entries idle longer than `idle_timeout`
    pub fn spawn(
        shard_id: String,
        cache: Arc<DocumentCache>,
        locks: Arc<LockTable>,
        idle_timeout: Duration,
        period: Duration,
    ) -> Self {
        let shutdown_token = CancellationToken::new();
        let token = shutdown_token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = cache.evict_idle(idle_timeout, |key| locks.is_held(key));
                        if !evicted.is_empty() {
                            tracing::debug!(
                                "shard[{}] evicted {} idle documents, {} cached",
                                shard_id,
                                evicted.len(),
                                cache.len()
                            );
                        }
                    }
                    _ = token.cancelled() => {
                        break;
                    }
                }
            }
        });

        Self {
            shutdown_token,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Signal the task to stop without waiting for it
    pub fn cancel(&self) {
        self.shutdown_token.cancel();
    }

    pub async fn shutdown(&self) {
        self.shutdown_token.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            tracing::error!("eviction task failed: {}", e);
        }
    }
}
