use std::sync::Arc;
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;

/// Single-slot mailbox for the parked consumer.
///
/// The consumer publishes its handle before re-checking the queue; producers
/// swap the slot empty and unpark whatever they found. Both transitions are
/// atomic so a handle is unparked at most once per publication.
#[derive(Default)]
pub(crate) struct WaiterSlot {
	slot: ArcSwapOption<Thread>,
}

impl WaiterSlot {
	/// Registers `thread` as the waiter.
	pub(crate) fn publish(&self, thread: &Arc<Thread>) {
		self.slot.store(Some(Arc::clone(thread)));
	}

	/// Empties the slot and unparks the registered thread, if any.
	pub(crate) fn wake(&self) -> bool {
		match self.slot.swap(None) {
			Some(thread) => {
				thread.unpark();
				true
			}
			None => false,
		}
	}

	/// Empties the slot if it still holds `thread`.
	pub(crate) fn retract(&self, thread: &Arc<Thread>) -> bool {
		let prev = self.slot.compare_and_swap(Arc::as_ptr(thread), None::<Arc<Thread>>);
		(*prev).as_ref().is_some_and(|cur| Arc::ptr_eq(cur, thread))
	}

	#[cfg(test)]
	pub(crate) fn is_occupied(&self) -> bool {
		self.slot.load().is_some()
	}
}

const SPIN_LIMIT: u32 = 64;
const YIELD_LIMIT: u32 = SPIN_LIMIT + 16;
const PARK_MIN: Duration = Duration::from_micros(50);
const PARK_MAX: Duration = Duration::from_millis(10);

/// Wait step chosen by [`Backoff::snooze`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
	Spin,
	Yield,
	Park,
}

/// Spin, then yield, then park with a doubling timeout.
#[derive(Debug)]
pub(crate) struct Backoff {
	step: u32,
	park: Duration,
}

impl Backoff {
	pub(crate) const fn new() -> Self {
		Self { step: 0, park: PARK_MIN }
	}

	pub(crate) const fn phase(&self) -> Phase {
		if self.step < SPIN_LIMIT {
			Phase::Spin
		} else if self.step < YIELD_LIMIT {
			Phase::Yield
		} else {
			Phase::Park
		}
	}

	/// Waits one step without sleeping past `deadline`.
	pub(crate) fn snooze(&mut self, deadline: Option<Instant>) -> Phase {
		let phase = self.phase();
		match phase {
			Phase::Spin => {
				for _ in 0..1u32 << (self.step / 8).min(6) {
					std::hint::spin_loop();
				}
			}
			Phase::Yield => thread::yield_now(),
			Phase::Park => {
				let park = match deadline {
					Some(deadline) => self.park.min(deadline.saturating_duration_since(Instant::now())),
					None => self.park,
				};
				thread::park_timeout(park);
				self.park = (self.park * 2).min(PARK_MAX);
			}
		}
		self.step = self.step.saturating_add(1);
		phase
	}
}
