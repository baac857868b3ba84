use std::io;
use std::time::Duration;

use thiserror::Error;

/// Failure of a blocking [`take`](crate::CoalescingQueue::take).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TakeError {
	/// The queue was interrupted while the consumer waited.
	#[error("take interrupted")]
	Interrupted,
}

/// Failure of the drain worker lifecycle.
#[derive(Debug, Error)]
pub enum WorkerError {
	/// The worker thread could not be started.
	#[error("failed to spawn drain worker thread")]
	Spawn(#[source] io::Error),
	/// The worker thread did not exit in time.
	#[error("drain worker did not exit within {0:?}")]
	ExitTimeout(Duration),
	/// The worker is shutting down and no longer accepts work.
	#[error("drain worker is shutting down")]
	ShuttingDown,
	/// The drain thread panicked; carries the panic message.
	#[error("drain worker panicked: {0}")]
	Panicked(String),
}
