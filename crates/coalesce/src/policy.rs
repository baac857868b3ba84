use std::fmt;
use std::hash::Hash;

/// Decides which pending values collapse into one another.
///
/// Two values with equal keys coalesce: offering the second supersedes the
/// first while it is still waiting in the queue. Values for which
/// [`is_coalescing_supported`](Self::is_coalescing_supported) returns `false`
/// never enter the live-key map and are always delivered individually.
pub trait CoalescePolicy<V>: Send + Sync {
	/// Key under which pending values are tracked.
	type Key: Hash + Eq + Clone + Send + Sync;

	/// Derives the coalescing key of `value`.
	fn key(&self, value: &V) -> Self::Key;

	/// Returns false to opt `value` out of coalescing.
	fn is_coalescing_supported(&self, _value: &V) -> bool {
		true
	}

	/// Key to track `value` under, or `None` when it is delivered individually.
	fn coalesce_key(&self, value: &V) -> Option<Self::Key> {
		self.is_coalescing_supported(value).then(|| self.key(value))
	}
}

/// Uses each value as its own coalescing key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ByValue;

impl<V> CoalescePolicy<V> for ByValue
where
	V: Hash + Eq + Clone + Send + Sync,
{
	type Key = V;

	fn key(&self, value: &V) -> V {
		value.clone()
	}
}

/// Derives coalescing keys with a closure.
#[derive(Clone)]
pub struct KeyFn<F> {
	key_fn: F,
}

impl<F> KeyFn<F> {
	/// Wraps a key extractor.
	pub const fn new(key_fn: F) -> Self {
		Self { key_fn }
	}
}

impl<F> fmt::Debug for KeyFn<F> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("KeyFn").finish_non_exhaustive()
	}
}

impl<V, K, F> CoalescePolicy<V> for KeyFn<F>
where
	F: Fn(&V) -> K + Send + Sync,
	K: Hash + Eq + Clone + Send + Sync,
{
	type Key = K;

	fn key(&self, value: &V) -> K {
		(self.key_fn)(value)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	struct EvenOnly;

	impl CoalescePolicy<u32> for EvenOnly {
		type Key = u32;

		fn key(&self, value: &u32) -> u32 {
			*value
		}

		fn is_coalescing_supported(&self, value: &u32) -> bool {
			value % 2 == 0
		}
	}

	#[test]
	fn by_value_keys_on_the_value_itself() {
		assert_eq!(ByValue.coalesce_key(&"a"), Some("a"));
	}

	#[test]
	fn key_fn_extracts_with_closure() {
		let policy = KeyFn::new(|pair: &(u8, u32)| pair.0);
		assert_eq!(policy.coalesce_key(&(7, 99)), Some(7));
	}

	#[test]
	fn opted_out_values_have_no_key() {
		assert_eq!(EvenOnly.coalesce_key(&4), Some(4));
		assert_eq!(EvenOnly.coalesce_key(&5), None);
	}
}
