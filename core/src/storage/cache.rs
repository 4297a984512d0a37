//! Write-back document cache

use crate::backend::Backend;
use crate::document::Document;
use crate::error::MemDbResult;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cached state of one document key
#[derive(Debug, Clone)]
pub struct CacheEntry {
	/// Current value, including changes of an open transaction. `None` = absent.
	value: Option<Document>,
	/// Value as of the last commit, kept while a transaction has changed the entry
	committed: Option<Option<Document>>,
	dirty: bool,
	/// Bumped on every commit so a flush can tell whether it is still current
	version: u64,
	last_access: Instant,
}

impl CacheEntry {
	fn loaded(value: Option<Document>) -> Self {
		Self {
			value,
			committed: None,
			dirty: false,
			version: 0,
			last_access: Instant::now(),
		}
	}

	fn touch(&mut self) {
		self.last_access = Instant::now();
	}

	/// The value other connections may rely on
	pub fn committed_value(&self) -> Option<&Document> {
		match &self.committed {
			Some(previous) => previous.as_ref(),
			None => self.value.as_ref(),
		}
	}

	pub fn is_dirty(&self) -> bool {
		self.dirty
	}

	pub fn has_uncommitted(&self) -> bool {
		self.committed.is_some()
	}

	fn is_evictable(&self, idle_timeout: Duration, now: Instant) -> bool {
		!self.dirty
			&& self.committed.is_none()
			&& now.saturating_duration_since(self.last_access) > idle_timeout
	}
}

/// Result of flushing one key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
	/// Entry is clean (flushed now, or nothing to do)
	Clean,
	/// A newer commit landed while the flush was in flight
	StillDirty,
}

/// In-memory documents of one shard, loaded lazily from the backend
pub struct DocumentCache {
	entries: DashMap<String, CacheEntry>,
	backend: Arc<dyn Backend>,
}

impl DocumentCache {
	pub fn new(backend: Arc<dyn Backend>) -> Self {
		Self {
			entries: DashMap::new(),
			backend,
		}
	}

	/// Run `f` on the entry for `key`, loading a clean entry from the backend on a miss
	async fn with_entry<R>(&self, key: &str, f: impl FnOnce(&mut CacheEntry) -> R) -> MemDbResult<R> {
		if let Some(mut entry) = self.entries.get_mut(key) {
			entry.touch();
			return Ok(f(&mut entry));
		}

		let value = self.backend.get(key).await?;
		tracing::trace!("loaded {} from backend (found: {})", key, value.is_some());

		// Another task may have filled the entry while we were loading; theirs wins
		let mut entry = self
			.entries
			.entry(key.to_string())
			.or_insert_with(|| CacheEntry::loaded(value));
		entry.touch();
		Ok(f(&mut entry))
	}

	/// Current value, uncommitted changes included
	pub async fn read(&self, key: &str) -> MemDbResult<Option<Document>> {
		self.with_entry(key, |entry| entry.value.clone()).await
	}

	/// Last committed value
	pub async fn read_committed(&self, key: &str) -> MemDbResult<Option<Document>> {
		self.with_entry(key, |entry| entry.committed_value().cloned())
			.await
	}

	/// Apply `f` to the value of `key` as part of an open transaction.
	///
	/// When `f` fails the entry is left untouched. The first successful change
	/// of a transaction keeps the pre-transaction value for `revert`.
	pub async fn modify<R>(
		&self,
		key: &str,
		f: impl FnOnce(&mut Option<Document>) -> MemDbResult<R>,
	) -> MemDbResult<R> {
		self.with_entry(key, |entry| {
			let mut value = entry.value.clone();
			let result = f(&mut value)?;

			let previous = std::mem::replace(&mut entry.value, value);
			if entry.committed.is_none() {
				entry.committed = Some(previous);
			}
			Ok(result)
		})
		.await?
	}

	/// Make the transaction's change to `key` durable-pending.
	///
	/// Returns true when the entry just turned dirty and needs a flush scheduled.
	pub fn commit(&self, key: &str) -> bool {
		match self.entries.get_mut(key) {
			Some(mut entry) => {
				if entry.committed.take().is_none() {
					return false;
				}
				entry.version += 1;
				entry.touch();
				let was_dirty = entry.dirty;
				entry.dirty = true;
				!was_dirty
			}
			None => false,
		}
	}

	/// Restore the pre-transaction value of `key`
	pub fn revert(&self, key: &str) {
		if let Some(mut entry) = self.entries.get_mut(key)
			&& let Some(previous) = entry.committed.take()
		{
			entry.value = previous;
		}
	}

	/// Put `value` back as the current value of `key`, undoing later changes
	/// of the open transaction. Nothing is left uncommitted when `value` is
	/// the pre-transaction value.
	pub fn restore(&self, key: &str, value: Option<Document>) {
		if let Some(mut entry) = self.entries.get_mut(key) {
			if entry.committed.as_ref() == Some(&value) {
				entry.committed = None;
			}
			entry.value = value;
			entry.touch();
		}
	}

	/// Write the committed value of `key` to the backend and clear dirty
	pub async fn flush(&self, key: &str) -> MemDbResult<FlushOutcome> {
		let (value, version) = match self.entries.get(key) {
			Some(entry) if entry.dirty => (entry.committed_value().cloned(), entry.version),
			_ => return Ok(FlushOutcome::Clean),
		};

		match &value {
			Some(doc) => self.backend.set(key, doc).await?,
			None => self.backend.delete(key).await?,
		}

		match self.entries.get_mut(key) {
			Some(mut entry) if entry.version == version => {
				entry.dirty = false;
				Ok(FlushOutcome::Clean)
			}
			Some(_) => Ok(FlushOutcome::StillDirty),
			None => Ok(FlushOutcome::Clean),
		}
	}

	pub fn dirty_keys(&self) -> Vec<String> {
		self.entries
			.iter()
			.filter(|entry| entry.is_dirty())
			.map(|entry| entry.key().clone())
			.collect()
	}

	/// Drop clean entries idle for longer than `idle_timeout`.
	///
	/// Keys for which `is_locked` returns true are kept.
	pub fn evict_idle(&self, idle_timeout: Duration, is_locked: impl Fn(&str) -> bool) -> Vec<String> {
		let now = Instant::now();
		let candidates: Vec<String> = self
			.entries
			.iter()
			.filter(|entry| entry.is_evictable(idle_timeout, now))
			.map(|entry| entry.key().clone())
			.collect();

		let mut evicted = Vec::new();
		for key in candidates {
			if is_locked(&key) {
				continue;
			}
			if self
				.entries
				.remove_if(&key, |_, entry| entry.is_evictable(idle_timeout, now))
				.is_some()
			{
				evicted.push(key);
			}
		}
		evicted
	}

	/// Copy of the cached entry, without touching it or the backend
	pub fn peek(&self, key: &str) -> Option<CacheEntry> {
		self.entries.get(key).map(|entry| entry.value().clone())
	}

	pub fn contains(&self, key: &str) -> bool {
		self.entries.contains_key(key)
	}

	pub fn is_dirty(&self, key: &str) -> bool {
		self.entries.get(key).is_some_and(|entry| entry.is_dirty())
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	/// Forget every entry, flushed or not
	pub fn clear(&self) {
		self.entries.clear();
	}
}
