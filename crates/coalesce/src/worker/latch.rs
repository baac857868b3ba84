use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// One-shot latch: released once, waited on by any number of threads.
#[derive(Debug, Default)]
pub(crate) struct Latch {
	released: Mutex<bool>,
	cond: Condvar,
}

impl Latch {
	pub(crate) fn release(&self) {
		*self.released.lock() = true;
		self.cond.notify_all();
	}

	pub(crate) fn is_released(&self) -> bool {
		*self.released.lock()
	}

	/// Returns true if the latch was released within `timeout`.
	pub(crate) fn wait(&self, timeout: Duration) -> bool {
		let mut released = self.released.lock();
		if !*released {
			self.cond.wait_while_for(&mut released, |released| !*released, timeout);
		}
		*released
	}
}

/// Marker ordered behind every value enqueued before it.
///
/// Released by the drain thread once all earlier values have been handed to
/// the batch handler.
#[derive(Debug, Clone)]
pub struct Checkpoint {
	latch: Arc<Latch>,
}

impl Checkpoint {
	pub(crate) fn new() -> Self {
		Self {
			latch: Arc::new(Latch::default()),
		}
	}

	pub(crate) fn release(&self) {
		self.latch.release();
	}

	/// Returns true once the drain thread has passed this checkpoint.
	pub fn is_reached(&self) -> bool {
		self.latch.is_released()
	}

	/// Waits for the drain thread to pass this checkpoint.
	pub fn wait(&self, timeout: Duration) -> bool {
		self.latch.wait(timeout)
	}
}

#[cfg(test)]
mod tests {
	use std::thread;

	use super::*;

	#[test]
	fn wait_times_out_while_held() {
		let latch = Latch::default();
		assert!(!latch.wait(Duration::from_millis(10)));
	}

	#[test]
	fn release_unblocks_waiters() {
		let checkpoint = Checkpoint::new();
		let waiter = {
			let checkpoint = checkpoint.clone();
			thread::spawn(move || checkpoint.wait(Duration::from_secs(10)))
		};
		checkpoint.release();
		assert!(waiter.join().expect("waiter panicked"));
		assert!(checkpoint.is_reached());
	}
}
