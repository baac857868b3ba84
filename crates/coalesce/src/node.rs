use std::cell::UnsafeCell;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

/// One enqueue event in the chain.
///
/// The chain holds one strong count of every linked node as a raw pointer
/// obtained from [`Arc::into_raw`]; the live-key map holds another while the
/// node is the newest pending value for its key.
pub(crate) struct Node<K, V> {
	/// Coalescing key, `None` for values delivered individually.
	pub(crate) key: Option<K>,
	/// Written before the node is linked, then touched only by the consumer.
	value: UnsafeCell<Option<V>>,
	/// Set once the value is delivered or superseded.
	removed: AtomicBool,
	/// Written once by the producer that links the successor.
	next: AtomicPtr<Node<K, V>>,
}

// SAFETY: `value` is handed over through the release store on `next` and
// afterwards accessed only by the single consumer. Producers touch `removed`
// and `next`, which are atomic.
unsafe impl<K: Send, V: Send> Send for Node<K, V> {}
unsafe impl<K: Send + Sync, V: Send> Sync for Node<K, V> {}

impl<K, V> Node<K, V> {
	pub(crate) fn new(key: Option<K>, value: V) -> Arc<Self> {
		Arc::new(Self {
			key,
			value: UnsafeCell::new(Some(value)),
			removed: AtomicBool::new(false),
			next: AtomicPtr::new(ptr::null_mut()),
		})
	}

	/// Consumed placeholder the chain starts from.
	pub(crate) fn sentinel() -> Arc<Self> {
		Arc::new(Self {
			key: None,
			value: UnsafeCell::new(None),
			removed: AtomicBool::new(true),
			next: AtomicPtr::new(ptr::null_mut()),
		})
	}

	pub(crate) fn is_removed(&self) -> bool {
		self.removed.load(Ordering::Acquire)
	}

	pub(crate) fn mark_removed(&self) {
		self.removed.store(true, Ordering::Release);
	}

	pub(crate) fn next(&self) -> *mut Self {
		self.next.load(Ordering::Acquire)
	}

	/// Links `successor` behind this node.
	///
	/// # Safety
	///
	/// The caller must own this node as the previous tail obtained from the
	/// tail swap, so no other producer links onto it.
	pub(crate) unsafe fn link(&self, successor: *mut Self) {
		self.next.store(successor, Ordering::Release);
	}

	/// Detaches the payload.
	///
	/// # Safety
	///
	/// Only the consumer may call this, after observing the node through an
	/// acquire load of its predecessor's `next`.
	pub(crate) unsafe fn take_value(&self) -> Option<V> {
		unsafe { (*self.value.get()).take() }
	}
}
