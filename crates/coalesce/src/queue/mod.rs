//! Lock-free coalescing queue.
//!
//! # Structure
//!
//! ```text
//!  head (consumer)                                 tail (producers)
//!    │                                                   │
//!    ▼                                                   ▼
//! [sentinel] ──▶ [a] ──▶ [k:v1 ✗] ──▶ [m] ──▶ [k:v3] ──▶ null
//!                                              ▲
//!                            live map: k ──────┘
//! ```
//!
//! Producers append at `tail` with an atomic swap and then link the previous
//! tail to the new node. Offering a key that is still pending marks the older
//! node removed (`✗`) instead of unlinking it; the consumer skips removed
//! nodes while walking from `head`. Coalescing therefore moves a key to the
//! position of its latest offer.
//!
//! # Consumer contract
//!
//! [`poll`](CoalescingQueue::poll), [`take`](CoalescingQueue::take) and
//! [`drain_to`](CoalescingQueue::drain_to) must not run concurrently with each
//! other. Producers may call [`offer`](CoalescingQueue::offer) from any number
//! of threads at any time.
//!
//! # Weak coalescing under contention
//!
//! Two concurrent offers for one key may both link nodes while only the later
//! one stays in the live map. The other node is then delivered as a regular
//! value. Only the newest offer for a key is guaranteed to become visible.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering, fence};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::TakeError;
use crate::live::LiveMap;
use crate::node::Node;
use crate::policy::{ByValue, CoalescePolicy, KeyFn};
use crate::waiter::{Backoff, Phase, WaiterSlot};

#[cfg(test)]
mod tests;

#[repr(align(64))]
struct CachePadded<T>(T);

type NodeOf<V, P> = Node<<P as CoalescePolicy<V>>::Key, V>;

/// Multi-producer, single-consumer FIFO that coalesces pending values by key.
pub struct CoalescingQueue<V, P = ByValue>
where
	P: CoalescePolicy<V>,
{
	/// Last node the consumer passed. Written only by the consumer.
	head: CachePadded<AtomicPtr<NodeOf<V, P>>>,
	/// Most recently appended node.
	tail: CachePadded<AtomicPtr<NodeOf<V, P>>>,
	live: LiveMap<P::Key, V>,
	waiter: WaiterSlot,
	interrupted: AtomicBool,
	policy: P,
	_owns: PhantomData<Arc<NodeOf<V, P>>>,
}

impl<V> CoalescingQueue<V, ByValue>
where
	ByValue: CoalescePolicy<V>,
{
	/// Creates a queue that uses every value as its own coalescing key.
	pub fn new() -> Self {
		Self::with_policy(ByValue)
	}
}

impl<V> Default for CoalescingQueue<V, ByValue>
where
	ByValue: CoalescePolicy<V>,
{
	fn default() -> Self {
		Self::new()
	}
}

impl<V, F, K> CoalescingQueue<V, KeyFn<F>>
where
	F: Fn(&V) -> K + Send + Sync,
	K: std::hash::Hash + Eq + Clone + Send + Sync,
{
	/// Creates a queue that coalesces values with equal `key_fn` results.
	pub fn with_key(key_fn: F) -> Self {
		Self::with_policy(KeyFn::new(key_fn))
	}
}

impl<V, P> CoalescingQueue<V, P>
where
	P: CoalescePolicy<V>,
{
	/// Creates a queue with a custom coalescing policy.
	pub fn with_policy(policy: P) -> Self {
		let sentinel = Arc::into_raw(Node::sentinel()).cast_mut();
		Self {
			head: CachePadded(AtomicPtr::new(sentinel)),
			tail: CachePadded(AtomicPtr::new(sentinel)),
			live: LiveMap::new(),
			waiter: WaiterSlot::default(),
			interrupted: AtomicBool::new(false),
			policy,
			_owns: PhantomData,
		}
	}

	/// Returns the coalescing policy.
	pub fn policy(&self) -> &P {
		&self.policy
	}

	/// Appends `value`, superseding any pending value with the same key.
	///
	/// Never blocks and never fails. Wakes the consumer if it is parked in
	/// [`take`](Self::take).
	pub fn offer(&self, value: V) {
		let key = self.policy.coalesce_key(&value);
		if let Some(key) = key.as_ref()
			&& let Some(stale) = self.live.take(key)
		{
			stale.mark_removed();
		}

		let node = Node::new(key, value);
		let raw = Arc::into_raw(Arc::clone(&node)).cast_mut();
		let prev = self.tail.0.swap(raw, Ordering::AcqRel);
		// SAFETY: the swap handed `prev` to this producer alone. The consumer
		// cannot move `head` past `prev` before its `next` is set, so it is alive.
		unsafe { (*prev).link(raw) };

		if let Some(key) = node.key.clone() {
			self.live.publish(key, node);
		}

		// Pairs with the fence in `take` between publishing the waiter and
		// re-checking the chain.
		fence(Ordering::SeqCst);
		self.waiter.wake();
	}

	/// Removes the next live value without blocking.
	///
	/// Superseded nodes in front of it are reclaimed on the way.
	pub fn poll(&self) -> Option<V> {
		loop {
			let head = self.head.0.load(Ordering::Acquire);
			// SAFETY: the chain keeps `head` alive until the consumer advances.
			let next = unsafe { (*head).next() };
			if next.is_null() {
				return None;
			}
			// SAFETY: `next` is linked behind `head` and owned by the chain.
			let node = unsafe { &*next };

			if node.is_removed() {
				if self.advance(head, next) {
					// SAFETY: consumer side, `next` observed through an acquire load.
					drop(unsafe { node.take_value() });
				}
				continue;
			}

			if self.advance(head, next) {
				// SAFETY: as above.
				let value = unsafe { node.take_value() };
				self.retire(node);
				if value.is_some() {
					return value;
				}
			}
		}
	}

	/// Waits up to `timeout` for the next live value.
	///
	/// Returns `Ok(None)` once the timeout elapses and
	/// [`TakeError::Interrupted`] if [`interrupt`](Self::interrupt) was called
	/// before or during the wait. The waiter registration is always cleared
	/// before returning.
	pub fn take(&self, timeout: Duration) -> Result<Option<V>, TakeError> {
		let deadline = Instant::now().checked_add(timeout);
		let me = Arc::new(thread::current());
		let mut backoff = Backoff::new();

		loop {
			if self.interrupted.swap(false, Ordering::AcqRel) {
				self.waiter.retract(&me);
				tracing::trace!("coalesce.take.interrupted");
				return Err(TakeError::Interrupted);
			}

			if let Some(value) = self.poll() {
				self.waiter.retract(&me);
				return Ok(Some(value));
			}

			if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
				self.waiter.retract(&me);
				tracing::trace!(?timeout, "coalesce.take.timeout");
				return Ok(None);
			}

			self.waiter.publish(&me);
			// Without this fence the producer's link-then-wake may interleave
			// with publish-then-poll so that neither side sees the other.
			fence(Ordering::SeqCst);

			if let Some(value) = self.poll() {
				self.waiter.retract(&me);
				return Ok(Some(value));
			}
			if self.interrupted.load(Ordering::Acquire) {
				continue;
			}

			if backoff.snooze(deadline) == Phase::Park {
				self.waiter.retract(&me);
			}
		}
	}

	/// Moves up to `max` live values into `sink` in chain order.
	///
	/// Superseded nodes passed along the way are reclaimed, and `head` moves
	/// once to the last node visited. Returns the number of values moved.
	pub fn drain_to<S>(&self, sink: &mut S, max: usize) -> usize
	where
		S: Extend<V>,
	{
		let start = self.head.0.load(Ordering::Acquire);
		let mut cur = start;
		let mut moved = 0;

		while moved < max {
			// SAFETY: every node from `start` on is still owned by the chain.
			let next = unsafe { (*cur).next() };
			if next.is_null() {
				break;
			}
			// SAFETY: as above.
			let node = unsafe { &*next };
			// SAFETY: consumer side, `next` observed through an acquire load.
			let value = unsafe { node.take_value() };
			if !node.is_removed() {
				self.retire(node);
				if let Some(value) = value {
					sink.extend(Some(value));
					moved += 1;
				}
			}
			cur = next;
		}

		if cur != start {
			let swapped = self.head.0.compare_exchange(start, cur, Ordering::AcqRel, Ordering::Acquire).is_ok();
			debug_assert!(swapped, "concurrent consumers on a coalescing queue");
			if swapped {
				let mut node = start;
				while node != cur {
					// SAFETY: `node` is behind the new head and still holds its chain count.
					let next = unsafe { (*node).next() };
					unsafe { Self::release(node) };
					node = next;
				}
			}
		}

		moved
	}

	/// Moves every live value into `sink`.
	pub fn drain_all<S>(&self, sink: &mut S) -> usize
	where
		S: Extend<V>,
	{
		self.drain_to(sink, usize::MAX)
	}

	/// Best-effort emptiness check.
	///
	/// May report a queue holding only superseded nodes as non-empty.
	pub fn is_empty(&self) -> bool {
		let head = self.head.0.load(Ordering::Acquire);
		// SAFETY: the chain keeps `head` alive.
		unsafe { (*head).next().is_null() }
	}

	/// Interrupts the consumer.
	///
	/// The current or next [`take`](Self::take) returns
	/// [`TakeError::Interrupted`] and clears the request.
	pub fn interrupt(&self) {
		self.interrupted.store(true, Ordering::Release);
		fence(Ordering::SeqCst);
		self.waiter.wake();
	}

	/// Marks a delivered node and drops its live-map entry.
	fn retire(&self, node: &NodeOf<V, P>) {
		node.mark_removed();
		if let Some(key) = node.key.as_ref() {
			self.live.retire(key, node);
		}
	}

	/// Moves `head` from `from` to `to` and drops the chain's count of `from`.
	fn advance(&self, from: *mut NodeOf<V, P>, to: *mut NodeOf<V, P>) -> bool {
		match self.head.0.compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire) {
			Ok(_) => {
				// SAFETY: `from` is now behind `head`; nothing reaches it via the chain.
				unsafe { Self::release(from) };
				true
			}
			Err(_) => false,
		}
	}

	/// # Safety
	///
	/// `node` must come from `Arc::into_raw` and its chain count must not be
	/// released twice.
	unsafe fn release(node: *mut NodeOf<V, P>) {
		drop(unsafe { Arc::from_raw(node.cast_const()) });
	}
}

impl<V, P> Drop for CoalescingQueue<V, P>
where
	P: CoalescePolicy<V>,
{
	fn drop(&mut self) {
		let mut node = *self.head.0.get_mut();
		while !node.is_null() {
			// SAFETY: exclusive access; each chain node holds exactly one chain count.
			let next = unsafe { (*node).next() };
			unsafe { Self::release(node) };
			node = next;
		}
	}
}

impl<V, P> fmt::Debug for CoalescingQueue<V, P>
where
	P: CoalescePolicy<V> + fmt::Debug,
{
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("CoalescingQueue")
			.field("policy", &self.policy)
			.field("is_empty", &self.is_empty())
			.finish_non_exhaustive()
	}
}
