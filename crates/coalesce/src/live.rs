use std::hash::{BuildHasher, Hash};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::{FxBuildHasher, FxHashMap};

use crate::node::Node;

const SHARDS: usize = 32;

#[repr(align(64))]
struct Shard<K, V> {
	entries: Mutex<FxHashMap<K, Arc<Node<K, V>>>>,
}

/// Newest pending node for every coalescing key.
///
/// Entries are spread over independently locked shards so producers offering
/// unrelated keys rarely contend. Each lock is held only for a single hash
/// map operation.
pub(crate) struct LiveMap<K, V> {
	shards: Box<[Shard<K, V>]>,
	hasher: FxBuildHasher,
}

impl<K, V> LiveMap<K, V>
where
	K: Hash + Eq,
{
	pub(crate) fn new() -> Self {
		let shards = (0..SHARDS)
			.map(|_| Shard {
				entries: Mutex::new(FxHashMap::default()),
			})
			.collect();
		Self {
			shards,
			hasher: FxBuildHasher,
		}
	}

	fn shard(&self, key: &K) -> &Shard<K, V> {
		let idx = self.hasher.hash_one(key) as usize & (SHARDS - 1);
		&self.shards[idx]
	}

	/// Removes and returns the live node for `key`.
	pub(crate) fn take(&self, key: &K) -> Option<Arc<Node<K, V>>> {
		self.shard(key).entries.lock().remove(key)
	}

	/// Makes `node` the live node for `key`, replacing whatever was there.
	pub(crate) fn publish(&self, key: K, node: Arc<Node<K, V>>) {
		let replaced = self.shard(&key).entries.lock().insert(key, node);
		// Dropped outside the lock; this may be the last count of a node.
		drop(replaced);
	}

	/// Removes the entry for `key` only while it still refers to `node`.
	pub(crate) fn retire(&self, key: &K, node: *const Node<K, V>) {
		let mut entries = self.shard(key).entries.lock();
		let current = entries.get(key).is_some_and(|live| Arc::as_ptr(live) == node);
		let retired = if current { entries.remove(key) } else { None };
		drop(entries);
		drop(retired);
	}

	#[cfg(test)]
	pub(crate) fn len(&self) -> usize {
		self.shards.iter().map(|shard| shard.entries.lock().len()).sum()
	}
}
