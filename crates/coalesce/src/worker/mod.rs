//! Dedicated drain thread that batches queued values for a handler.
//!
//! The worker owns a [`CoalescingQueue`] and a named OS thread. The thread
//! waits for work with [`CoalescingQueue::take`], tops the batch up with
//! [`CoalescingQueue::drain_to`] and hands it to a [`BatchHandler`] when the
//! batch is full, when a [`Checkpoint`] is reached, or when the queue stays
//! quiet for a poll interval. Shutdown flushes whatever is still queued.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::WorkerConfig;
use crate::error::{TakeError, WorkerError};
use crate::policy::{ByValue, CoalescePolicy};
use crate::queue::CoalescingQueue;

mod latch;

pub use latch::Checkpoint;
use latch::Latch;

/// Receives batches from the drain thread.
pub trait BatchHandler<V>: Send + 'static {
	type Error: fmt::Display;

	/// Processes one batch. The worker clears `batch` afterwards.
	fn handle(&mut self, batch: &mut Vec<V>) -> Result<(), Self::Error>;
}

impl<V, F, E> BatchHandler<V> for F
where
	F: FnMut(&mut Vec<V>) -> Result<(), E> + Send + 'static,
	E: fmt::Display,
{
	type Error = E;

	fn handle(&mut self, batch: &mut Vec<V>) -> Result<(), E> {
		self(batch)
	}
}

/// Entry carried by the worker queue.
#[derive(Debug)]
pub enum WorkOp<V> {
	/// A value for the batch handler.
	Item(V),
	/// Released once every earlier item has been handled.
	Checkpoint(Checkpoint),
}

/// Coalesces items by the wrapped policy; checkpoints never coalesce.
#[derive(Debug, Clone, Default)]
pub struct WorkPolicy<P> {
	inner: P,
}

impl<V, P> CoalescePolicy<WorkOp<V>> for WorkPolicy<P>
where
	P: CoalescePolicy<V>,
{
	type Key = Option<P::Key>;

	fn key(&self, op: &WorkOp<V>) -> Self::Key {
		match op {
			WorkOp::Item(value) => Some(self.inner.key(value)),
			WorkOp::Checkpoint(_) => None,
		}
	}

	fn is_coalescing_supported(&self, op: &WorkOp<V>) -> bool {
		match op {
			WorkOp::Item(value) => self.inner.is_coalescing_supported(value),
			WorkOp::Checkpoint(_) => false,
		}
	}
}

struct Shared<V, P>
where
	P: CoalescePolicy<V>,
{
	queue: CoalescingQueue<WorkOp<V>, WorkPolicy<P>>,
	running: AtomicBool,
	exited: Latch,
}

/// Background thread draining a coalescing queue into batches.
pub struct DrainWorker<V, P = ByValue>
where
	P: CoalescePolicy<V>,
{
	shared: Arc<Shared<V, P>>,
	thread: Mutex<Option<JoinHandle<()>>>,
	exit_timeout: Duration,
}

impl<V, P> DrainWorker<V, P>
where
	V: Send + 'static,
	P: CoalescePolicy<V> + 'static,
{
	/// Starts the drain thread.
	pub fn spawn<H>(config: WorkerConfig, policy: P, handler: H) -> Result<Self, WorkerError>
	where
		H: BatchHandler<V>,
	{
		let shared = Arc::new(Shared {
			queue: CoalescingQueue::with_policy(WorkPolicy { inner: policy }),
			running: AtomicBool::new(true),
			exited: Latch::default(),
		});

		let batch_size = config.effective_batch_size();
		let poll_interval = config.poll_interval();
		let thread_shared = Arc::clone(&shared);
		tracing::trace!(thread = %config.thread_name, batch_size, "worker.spawn_named_thread");
		let handle = thread::Builder::new()
			.name(config.thread_name.clone())
			.spawn(move || {
				let _exit = ExitSignal(&thread_shared.exited);
				drain_loop(&thread_shared, handler, batch_size, poll_interval);
			})
			.map_err(WorkerError::Spawn)?;

		Ok(Self {
			shared,
			thread: Mutex::new(Some(handle)),
			exit_timeout: config.exit_timeout(),
		})
	}

	/// Queues `value`, superseding a pending value with the same key.
	pub fn enqueue(&self, value: V) -> Result<(), WorkerError> {
		self.ensure_running()?;
		self.shared.queue.offer(WorkOp::Item(value));
		Ok(())
	}

	/// Queues a checkpoint behind every value enqueued so far.
	pub fn checkpoint(&self) -> Result<Checkpoint, WorkerError> {
		self.ensure_running()?;
		let checkpoint = Checkpoint::new();
		self.shared.queue.offer(WorkOp::Checkpoint(checkpoint.clone()));
		Ok(checkpoint)
	}

	/// Returns true until shutdown is requested.
	pub fn is_running(&self) -> bool {
		self.shared.running.load(Ordering::Acquire)
	}

	/// Stops the drain thread after it flushes pending values.
	///
	/// Idempotent. Values enqueued concurrently with the shutdown request may
	/// be dropped. The call that joins a panicked drain thread returns
	/// [`WorkerError::Panicked`].
	pub fn shutdown(&self, timeout: Duration) -> Result<(), WorkerError> {
		if self.shared.running.swap(false, Ordering::AcqRel) {
			tracing::debug!("worker.shutdown");
			self.shared.queue.interrupt();
		}
		if !self.shared.exited.wait(timeout) {
			return Err(WorkerError::ExitTimeout(timeout));
		}
		let handle = self.thread.lock().take();
		handle.map_or(Ok(()), join)
	}

	fn ensure_running(&self) -> Result<(), WorkerError> {
		if self.is_running() {
			Ok(())
		} else {
			Err(WorkerError::ShuttingDown)
		}
	}
}

impl<V, P> Drop for DrainWorker<V, P>
where
	P: CoalescePolicy<V>,
{
	fn drop(&mut self) {
		if self.shared.running.swap(false, Ordering::AcqRel) {
			self.shared.queue.interrupt();
		}
		if !self.shared.exited.wait(self.exit_timeout) {
			tracing::warn!(timeout = ?self.exit_timeout, "worker.exit_timeout");
			return;
		}
		if let Some(handle) = self.thread.get_mut().take() {
			let _ = join(handle);
		}
	}
}

fn join(handle: JoinHandle<()>) -> Result<(), WorkerError> {
	handle.join().map_err(|payload| {
		let message = panic_message(payload.as_ref());
		tracing::warn!(panic = %message, "worker.join_failed");
		WorkerError::Panicked(message)
	})
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
	if let Some(message) = payload.downcast_ref::<&str>() {
		(*message).to_string()
	} else if let Some(message) = payload.downcast_ref::<String>() {
		message.clone()
	} else {
		"non-string panic payload".to_string()
	}
}

impl<V, P> fmt::Debug for DrainWorker<V, P>
where
	P: CoalescePolicy<V>,
{
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("DrainWorker")
			.field("running", &self.shared.running.load(Ordering::Relaxed))
			.field("exit_timeout", &self.exit_timeout)
			.finish_non_exhaustive()
	}
}

/// Releases the exit latch even when the handler panics.
struct ExitSignal<'a>(&'a Latch);

impl Drop for ExitSignal<'_> {
	fn drop(&mut self) {
		if thread::panicking() {
			tracing::error!("worker.panicked");
		}
		self.0.release();
		tracing::debug!("worker.exited");
	}
}

fn drain_loop<V, P, H>(shared: &Shared<V, P>, mut handler: H, batch_size: usize, poll_interval: Duration)
where
	P: CoalescePolicy<V>,
	H: BatchHandler<V>,
{
	let mut ops = Vec::with_capacity(batch_size);
	let mut items = Vec::with_capacity(batch_size);

	while shared.running.load(Ordering::Acquire) {
		match shared.queue.take(poll_interval) {
			Ok(Some(op)) => {
				ops.push(op);
				let room = batch_size.saturating_sub(ops.len());
				shared.queue.drain_to(&mut ops, room);
				let has_checkpoint = ops.iter().any(|op| matches!(op, WorkOp::Checkpoint(_)));
				if ops.len() >= batch_size || has_checkpoint {
					flush(&mut ops, &mut items, &mut handler);
				}
			}
			Ok(None) => flush(&mut ops, &mut items, &mut handler),
			Err(TakeError::Interrupted) => {}
		}
	}

	flush(&mut ops, &mut items, &mut handler);
	while shared.queue.drain_to(&mut ops, batch_size) > 0 {
		flush(&mut ops, &mut items, &mut handler);
	}
}

/// Hands queued items to the handler, releasing checkpoints in order.
fn flush<V, H>(ops: &mut Vec<WorkOp<V>>, items: &mut Vec<V>, handler: &mut H)
where
	H: BatchHandler<V>,
{
	for op in ops.drain(..) {
		match op {
			WorkOp::Item(value) => items.push(value),
			WorkOp::Checkpoint(checkpoint) => {
				dispatch(items, handler);
				checkpoint.release();
			}
		}
	}
	dispatch(items, handler);
}

fn dispatch<V, H>(items: &mut Vec<V>, handler: &mut H)
where
	H: BatchHandler<V>,
{
	if items.is_empty() {
		return;
	}
	let len = items.len();
	if let Err(err) = handler.handle(items) {
		tracing::warn!(error = %err, items = len, "worker.batch_failed");
	}
	items.clear();
}
