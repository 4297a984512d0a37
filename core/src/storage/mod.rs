//! Per-shard transactional storage: locks, document cache and background persistence

pub mod cache;
pub mod eviction;
pub mod events;
pub mod lock;
pub mod persistence;
pub mod shard;

pub use cache::{CacheEntry, DocumentCache, FlushOutcome};
pub use events::{ChangeFeed, ChangeListener, Subscription};
pub use lock::LockTable;
pub use shard::{Shard, ShardState};
