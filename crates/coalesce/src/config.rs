use std::time::Duration;

use serde::Deserialize;

const DEFAULT_THREAD_NAME: &str = "coalesce drain worker";
const DEFAULT_BATCH_SIZE: usize = 4096;
const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
const DEFAULT_EXIT_TIMEOUT_MS: u64 = 5 * 60 * 1000;

/// Settings for a [`DrainWorker`](crate::DrainWorker).
///
/// Deserializable so embedders can load it from their own config files;
/// missing fields fall back to the defaults.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
	/// Name of the dedicated drain thread.
	pub thread_name: String,
	/// Upper bound on values handed to the handler at once.
	pub batch_size: usize,
	/// How long the drain thread waits for work before flushing a partial batch.
	pub poll_interval_ms: u64,
	/// How long dropping the worker waits for the thread to finish.
	pub exit_timeout_ms: u64,
}

impl Default for WorkerConfig {
	fn default() -> Self {
		Self {
			thread_name: DEFAULT_THREAD_NAME.to_string(),
			batch_size: DEFAULT_BATCH_SIZE,
			poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
			exit_timeout_ms: DEFAULT_EXIT_TIMEOUT_MS,
		}
	}
}

impl WorkerConfig {
	/// Sets the drain thread name.
	pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
		self.thread_name = name.into();
		self
	}

	/// Sets the largest batch handed to the handler.
	pub fn with_batch_size(mut self, batch_size: usize) -> Self {
		self.batch_size = batch_size;
		self
	}

	/// Sets how long the drain thread waits before flushing a partial batch.
	pub fn with_poll_interval(mut self, interval: Duration) -> Self {
		self.poll_interval_ms = duration_ms(interval);
		self
	}

	/// Sets how long dropping the worker waits for the thread to exit.
	pub fn with_exit_timeout(mut self, timeout: Duration) -> Self {
		self.exit_timeout_ms = duration_ms(timeout);
		self
	}

	/// Batch size clamped to at least one value.
	pub fn effective_batch_size(&self) -> usize {
		self.batch_size.max(1)
	}

	/// Poll interval as a [`Duration`].
	pub fn poll_interval(&self) -> Duration {
		Duration::from_millis(self.poll_interval_ms)
	}

	/// Exit timeout as a [`Duration`].
	pub fn exit_timeout(&self) -> Duration {
		Duration::from_millis(self.exit_timeout_ms)
	}
}

fn duration_ms(duration: Duration) -> u64 {
	u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn missing_fields_use_defaults() {
		let config: WorkerConfig = serde_json::from_str(r#"{ "batch_size": 16 }"#).expect("valid config");
		assert_eq!(config.batch_size, 16);
		assert_eq!(config.thread_name, DEFAULT_THREAD_NAME);
		assert_eq!(config.poll_interval(), Duration::from_millis(DEFAULT_POLL_INTERVAL_MS));
	}

	#[test]
	fn unknown_fields_are_rejected() {
		let parsed = serde_json::from_str::<WorkerConfig>(r#"{ "batch": 16 }"#);
		assert!(parsed.is_err());
	}

	#[test]
	fn zero_batch_size_is_clamped() {
		let config = WorkerConfig::default().with_batch_size(0);
		assert_eq!(config.effective_batch_size(), 1);
	}
}
