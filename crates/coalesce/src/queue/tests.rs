use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Barrier};
use std::time::Duration;

use proptest::prelude::*;
use rstest::rstest;
use serial_test::serial;

use super::*;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Msg {
	key: u64,
	value: u64,
}

fn msg(key: u64, value: u64) -> Msg {
	Msg { key, value }
}

fn msg_key(m: &Msg) -> u64 {
	m.key
}

fn keyed() -> CoalescingQueue<Msg, KeyFn<fn(&Msg) -> u64>> {
	CoalescingQueue::with_key(msg_key as fn(&Msg) -> u64)
}

fn poll_all<V, P: CoalescePolicy<V>>(queue: &CoalescingQueue<V, P>) -> Vec<V> {
	std::iter::from_fn(|| queue.poll()).collect()
}

// ── Ordering and coalescing ──

#[test]
fn delivers_distinct_keys_in_offer_order() {
	let queue = CoalescingQueue::new();
	queue.offer("a");
	queue.offer("b");
	queue.offer("c");

	assert_eq!(queue.poll(), Some("a"));
	assert_eq!(queue.poll(), Some("b"));
	assert_eq!(queue.poll(), Some("c"));
	assert_eq!(queue.poll(), None);
}

#[test]
fn coalescing_replaces_content_and_moves_position() {
	let queue = keyed();
	queue.offer(msg(1, 10));
	queue.offer(msg(2, 20));
	queue.offer(msg(1, 30));

	assert_eq!(poll_all(&queue), vec![msg(2, 20), msg(1, 30)]);
}

#[test]
fn repeated_offers_of_one_value_collapse() {
	let queue = CoalescingQueue::new();
	for _ in 0..5 {
		queue.offer(7u32);
	}
	assert!(!queue.is_empty());
	assert_eq!(queue.poll(), Some(7));
	assert_eq!(queue.poll(), None);
	assert!(queue.is_empty());
}

#[test]
fn delivered_key_can_be_offered_again() {
	let queue = keyed();
	queue.offer(msg(1, 10));
	assert_eq!(queue.poll(), Some(msg(1, 10)));

	queue.offer(msg(1, 11));
	queue.offer(msg(2, 20));
	assert_eq!(poll_all(&queue), vec![msg(1, 11), msg(2, 20)]);
	assert_eq!(queue.live.len(), 0);
}

struct SkipOdd;

impl CoalescePolicy<u32> for SkipOdd {
	type Key = u32;

	fn key(&self, value: &u32) -> u32 {
		*value
	}

	fn is_coalescing_supported(&self, value: &u32) -> bool {
		value % 2 == 0
	}
}

#[test]
fn opted_out_values_are_delivered_individually() {
	let queue = CoalescingQueue::with_policy(SkipOdd);
	queue.offer(1);
	queue.offer(2);
	queue.offer(1);
	queue.offer(2);

	assert_eq!(poll_all(&queue), vec![1, 1, 2]);
}

// ── drain_to ──

#[test]
fn drain_to_leaves_queue_empty() {
	let queue = keyed();
	for i in 0..10 {
		queue.offer(msg(i % 4, i));
	}

	let mut sink = Vec::new();
	assert_eq!(queue.drain_all(&mut sink), 4);
	assert_eq!(sink, vec![msg(2, 6), msg(3, 7), msg(0, 8), msg(1, 9)]);
	assert_eq!(queue.poll(), None);
	assert!(queue.is_empty());
}

#[test]
fn drain_to_respects_max() {
	let queue = CoalescingQueue::new();
	for i in 0..5u32 {
		queue.offer(i);
	}

	let mut sink = Vec::new();
	assert_eq!(queue.drain_to(&mut sink, 2), 2);
	assert_eq!(sink, vec![0, 1]);
	assert_eq!(queue.drain_to(&mut sink, 0), 0);
	assert_eq!(queue.drain_to(&mut sink, 10), 3);
	assert_eq!(sink, vec![0, 1, 2, 3, 4]);
}

#[test]
fn drain_to_consumes_trailing_superseded_nodes() {
	let queue = keyed();
	queue.offer(msg(1, 1));
	queue.offer(msg(2, 2));
	queue.offer(msg(2, 3));
	assert_eq!(queue.poll(), Some(msg(1, 1)));
	assert_eq!(queue.poll(), Some(msg(2, 3)));

	// Supersede a key whose live node sits behind a removed one.
	queue.offer(msg(3, 4));
	queue.offer(msg(3, 5));
	let mut sink = Vec::new();
	assert_eq!(queue.drain_all(&mut sink), 1);
	assert_eq!(sink, vec![msg(3, 5)]);
	assert!(queue.is_empty());
}

// ── Reclamation ──

#[test]
fn dropping_queue_drops_pending_values() {
	let token = Arc::new(());
	{
		let queue = CoalescingQueue::with_key(|_: &Arc<()>| 0u8);
		queue.offer(Arc::clone(&token));
		queue.offer(Arc::clone(&token));
		// The superseded value stays in the chain until the consumer passes it.
		assert_eq!(Arc::strong_count(&token), 3);
	}
	assert_eq!(Arc::strong_count(&token), 1);
}

#[test]
fn superseded_values_are_released_when_passed() {
	let token = Arc::new(());
	let queue = CoalescingQueue::with_key(|_: &Arc<()>| ());
	queue.offer(Arc::clone(&token));
	queue.offer(Arc::clone(&token));
	assert_eq!(Arc::strong_count(&token), 3);

	drop(queue.poll());
	assert_eq!(Arc::strong_count(&token), 1);
}

// ── take ──

#[test]
fn take_returns_available_value_immediately() {
	let queue = CoalescingQueue::new();
	queue.offer(1u8);
	assert_eq!(queue.take(Duration::from_secs(5)), Ok(Some(1)));
	assert!(!queue.waiter.is_occupied());
}

#[test]
#[serial]
fn take_honors_timeout() {
	let queue = CoalescingQueue::<u8>::new();
	let timeout = Duration::from_millis(100);
	let started = Instant::now();

	assert_eq!(queue.take(timeout), Ok(None));
	let elapsed = started.elapsed();
	assert!(elapsed >= timeout, "returned early after {elapsed:?}");
	assert!(elapsed < timeout * 10, "returned late after {elapsed:?}");
	assert!(!queue.waiter.is_occupied());
}

#[test]
#[serial]
fn take_wakes_on_offer() {
	let queue = Arc::new(CoalescingQueue::new());
	let consumer = {
		let queue = Arc::clone(&queue);
		thread::spawn(move || {
			let started = Instant::now();
			let value = queue.take(Duration::from_secs(30));
			(value, started.elapsed())
		})
	};

	thread::sleep(Duration::from_millis(100));
	queue.offer(42u32);

	let (value, elapsed) = consumer.join().expect("consumer panicked");
	assert_eq!(value, Ok(Some(42)));
	assert!(elapsed < Duration::from_secs(5), "woke after {elapsed:?}");
}

#[test]
#[serial]
fn interrupt_aborts_parked_take() {
	let queue = Arc::new(CoalescingQueue::<u32>::new());
	let consumer = {
		let queue = Arc::clone(&queue);
		thread::spawn(move || {
			let started = Instant::now();
			let result = queue.take(Duration::from_secs(30));
			(result, started.elapsed())
		})
	};

	thread::sleep(Duration::from_millis(100));
	queue.interrupt();

	let (result, elapsed) = consumer.join().expect("consumer panicked");
	assert_eq!(result, Err(TakeError::Interrupted));
	assert!(elapsed < Duration::from_secs(5), "interrupted after {elapsed:?}");
	assert!(!queue.waiter.is_occupied());
}

#[test]
fn interrupt_is_consumed_by_one_take() {
	let queue = CoalescingQueue::<u32>::new();
	queue.interrupt();
	assert_eq!(queue.take(Duration::from_secs(5)), Err(TakeError::Interrupted));
	assert_eq!(queue.take(Duration::ZERO), Ok(None));
}

// ── Concurrency ──

#[rstest]
#[case(1, 10_000)]
#[case(4, 5_000)]
#[case(8, 2_000)]
fn concurrent_unique_keys_are_delivered_exactly_once(#[case] producers: usize, #[case] per_producer: usize) {
	let queue = Arc::new(CoalescingQueue::new());
	let done = Arc::new(AtomicUsize::new(0));
	let barrier = Arc::new(Barrier::new(producers));

	let handles: Vec<_> = (0..producers)
		.map(|id| {
			let queue = Arc::clone(&queue);
			let done = Arc::clone(&done);
			let barrier = Arc::clone(&barrier);
			thread::spawn(move || {
				barrier.wait();
				for seq in 0..per_producer {
					queue.offer((id * per_producer + seq) as u64);
				}
				done.fetch_add(1, Ordering::Release);
			})
		})
		.collect();

	let mut received = Vec::with_capacity(producers * per_producer);
	let mut batch = Vec::new();
	loop {
		let finished = done.load(Ordering::Acquire) == producers;
		if let Ok(Some(value)) = queue.take(Duration::from_millis(10)) {
			received.push(value);
		}
		queue.drain_to(&mut batch, 256);
		received.append(&mut batch);
		if finished && queue.is_empty() {
			break;
		}
	}

	for handle in handles {
		handle.join().expect("producer panicked");
	}

	assert_eq!(received.len(), producers * per_producer);
	let unique: HashSet<_> = received.iter().copied().collect();
	assert_eq!(unique.len(), received.len(), "duplicate delivery");

	// Per-producer order survives interleaving.
	let mut last_seen: HashMap<u64, u64> = HashMap::new();
	for value in received {
		let producer = value / per_producer as u64;
		if let Some(prev) = last_seen.insert(producer, value) {
			assert!(prev < value, "producer {producer} reordered: {prev} then {value}");
		}
	}
}

#[rstest]
#[case(2)]
#[case(6)]
fn contended_key_converges_to_latest_offer(#[case] producers: usize) {
	const OFFERS: u64 = 5_000;
	let queue = Arc::new(CoalescingQueue::with_key(|_: &(usize, u64)| ()));
	let done = Arc::new(AtomicUsize::new(0));

	let handles: Vec<_> = (0..producers)
		.map(|id| {
			let queue = Arc::clone(&queue);
			let done = Arc::clone(&done);
			thread::spawn(move || {
				for seq in 0..OFFERS {
					queue.offer((id, seq));
				}
				done.fetch_add(1, Ordering::Release);
			})
		})
		.collect();

	let mut received = Vec::new();
	while done.load(Ordering::Acquire) < producers {
		if let Some(value) = queue.poll() {
			received.push(value);
		}
	}
	for handle in handles {
		handle.join().expect("producer panicked");
	}

	received.extend(std::iter::from_fn(|| queue.poll()));
	assert!(queue.is_empty());

	// The last node linked is some producer's final offer and nothing
	// supersedes it, so it is always the last value delivered.
	let &(last_id, last_seq) = received.last().expect("final offer delivered");
	assert!(last_id < producers);
	assert_eq!(last_seq, OFFERS - 1);
	assert!(received.len() <= producers * OFFERS as usize);

	let mut last_seen: HashMap<usize, u64> = HashMap::new();
	for &(id, seq) in &received {
		if let Some(prev) = last_seen.insert(id, seq) {
			assert!(prev < seq, "producer {id} delivered {prev} then {seq}");
		}
	}
}

// ── Model stress (deterministic xorshift) ──

struct Xorshift64(u64);

impl Xorshift64 {
	fn next(&mut self) -> u64 {
		let mut x = self.0;
		x ^= x << 13;
		x ^= x >> 7;
		x ^= x << 17;
		self.0 = x;
		x
	}
}

/// Single-threaded reference: offering a pending key moves it to the back.
#[derive(Default)]
struct CoalescingModel {
	queue: VecDeque<Msg>,
}

impl CoalescingModel {
	fn offer(&mut self, m: Msg) {
		self.queue.retain(|pending| pending.key != m.key);
		self.queue.push_back(m);
	}

	fn poll(&mut self) -> Option<Msg> {
		self.queue.pop_front()
	}
}

#[test]
fn stress_single_thread_matches_model() {
	const OPS: u64 = 20_000;
	let queue = keyed();
	let mut model = CoalescingModel::default();
	let mut rng = Xorshift64(0xFEED_FACE);

	for i in 0..OPS {
		match rng.next() % 10 {
			0..=5 => {
				let m = msg(rng.next() % 8, i);
				queue.offer(m.clone());
				model.offer(m);
			}
			6..=8 => assert_eq!(queue.poll(), model.poll(), "op {i}: poll"),
			_ => {
				let max = (rng.next() % 4) as usize;
				let mut real = Vec::new();
				queue.drain_to(&mut real, max);
				let expected: Vec<_> = std::iter::from_fn(|| model.poll()).take(max).collect();
				assert_eq!(real, expected, "op {i}: drain_to({max})");
			}
		}
	}

	let remaining: Vec<_> = model.queue.drain(..).collect();
	assert_eq!(poll_all(&queue), remaining, "final drain mismatch");
}

proptest! {
	#[test]
	fn drain_matches_model(ops in prop::collection::vec((0u64..6, any::<u64>()), 0..64), max in 0usize..16) {
		let queue = keyed();
		let mut model = CoalescingModel::default();
		for (key, value) in ops {
			queue.offer(msg(key, value));
			model.offer(msg(key, value));
		}

		let mut drained = Vec::new();
		let moved = queue.drain_to(&mut drained, max);
		let expected: Vec<_> = std::iter::from_fn(|| model.poll()).take(max).collect();
		prop_assert_eq!(moved, expected.len());
		prop_assert_eq!(drained, expected);

		let rest: Vec<_> = model.queue.drain(..).collect();
		prop_assert_eq!(poll_all(&queue), rest);
		prop_assert!(queue.is_empty());
	}
}
