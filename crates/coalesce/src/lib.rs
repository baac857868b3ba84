//! Multi-producer, single-consumer queue that coalesces pending values by key.
//!
//! Offering a value whose key is still waiting in the queue supersedes the
//! earlier occurrence: only the newest value is delivered, at the position of
//! its latest offer. Producers never block; the single consumer can poll,
//! drain in bulk, or park in [`CoalescingQueue::take`] until work arrives.
//!
//! [`DrainWorker`] runs the consumer side on a dedicated thread and hands
//! batches to a [`BatchHandler`].

/// Configuration for the drain worker.
pub mod config;
/// Error types.
pub mod error;
mod live;
mod node;
/// Coalescing key policies.
pub mod policy;
/// The queue itself.
pub mod queue;
mod waiter;
/// Batching drain thread.
pub mod worker;

pub use config::WorkerConfig;
pub use error::{TakeError, WorkerError};
pub use policy::{ByValue, CoalescePolicy, KeyFn};
pub use queue::CoalescingQueue;
pub use worker::{BatchHandler, Checkpoint, DrainWorker, WorkOp, WorkPolicy};
