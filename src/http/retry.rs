//! Retry policy with exponential backoff and bounded jitter.

// std
use std::cell::RefCell;
// crates.io
use rand::{Rng, SeedableRng, rngs::SmallRng};
use serde::{Deserialize, Serialize};
use tokio::time;
// self
use crate::_prelude::*;

thread_local! {
	static SMALL_RNG: RefCell<SmallRng> = RefCell::new(SmallRng::from_rng(&mut rand::rng()));
}

/// Default number of retries after the initial attempt.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Default initial backoff delay.
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);
/// Default backoff ceiling.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
/// Default exponential growth factor.
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
/// Jitter applied symmetrically around the computed backoff.
pub const JITTER_RATIO: f64 = 0.2;

/// Retry configuration shared by every endpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
	/// Retries permitted after the initial attempt; zero means exactly one
	/// attempt with no sleep.
	pub max_attempts: u32,
	/// Delay before the first retry.
	pub initial_delay: Duration,
	/// Upper bound applied to exponential growth.
	pub max_delay: Duration,
	/// Exponential growth factor, strictly greater than 1.
	pub backoff_multiplier: f64,
}
impl RetryPolicy {
	/// Validate invariants for retry configuration.
	pub fn validate(&self) -> Result<()> {
		if self.initial_delay.is_zero() {
			return Err(Error::Validation {
				field: "retry_policy.initial_delay",
				reason: "Must be greater than zero.".into(),
			});
		}
		if self.max_delay < self.initial_delay {
			return Err(Error::Validation {
				field: "retry_policy.max_delay",
				reason: "Must be greater than or equal to initial_delay.".into(),
			});
		}
		if self.backoff_multiplier <= 1.0 {
			return Err(Error::Validation {
				field: "retry_policy.backoff_multiplier",
				reason: "Must be strictly greater than 1.0.".into(),
			});
		}

		Ok(())
	}

	/// Jitter-free backoff for a 1-indexed attempt: `min(D·k^(i−1), M)`.
	pub fn base_backoff(&self, attempt: u32) -> Duration {
		let exponent = attempt.saturating_sub(1).min(64);
		let scaled = self.initial_delay.mul_f64(self.backoff_multiplier.powi(exponent as i32));

		scaled.min(self.max_delay)
	}

	/// Backoff for a 1-indexed attempt with ±20% jitter applied.
	pub fn backoff(&self, attempt: u32) -> Duration {
		let base = self.base_backoff(attempt);
		let factor = SMALL_RNG.with(|cell| {
			cell.borrow_mut().random_range((1.0 - JITTER_RATIO)..=(1.0 + JITTER_RATIO))
		});

		base.mul_f64(factor)
	}
}
impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			max_attempts: DEFAULT_MAX_ATTEMPTS,
			initial_delay: DEFAULT_INITIAL_DELAY,
			max_delay: DEFAULT_MAX_DELAY,
			backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
		}
	}
}

/// Drives an async operation through the retry schedule.
///
/// Only errors reporting [`Error::is_retriable`] are re-attempted; everything
/// else surfaces immediately. On exhaustion the last error is returned.
#[derive(Clone, Debug)]
pub struct RetryExecutor {
	policy: RetryPolicy,
}
impl RetryExecutor {
	/// Create an executor for the supplied policy.
	pub fn new(policy: RetryPolicy) -> Self {
		Self { policy }
	}

	/// Run `operation`, retrying per policy.
	pub async fn execute<T, Fut, Op>(&self, mut operation: Op) -> Result<T>
	where
		Fut: Future<Output = Result<T>>,
		Op: FnMut() -> Fut,
	{
		let mut attempt = 0u32;

		loop {
			attempt += 1;

			match operation().await {
				Ok(value) => return Ok(value),
				Err(err) => {
					if !err.is_retriable() || attempt > self.policy.max_attempts {
						if attempt > 1 {
							tracing::debug!(attempts = attempt, error = %err, "retry budget exhausted");
						}

						return Err(err);
					}

					let delay = self.policy.backoff(attempt);

					tracing::debug!(attempt, ?delay, error = %err, "retrying after backoff");
					time::sleep(delay).await;
				},
			}
		}
	}
}

#[cfg(test)]
mod tests {
	// std
	use std::sync::atomic::{AtomicUsize, Ordering};
	// self
	use super::*;

	fn fast_policy(max_attempts: u32) -> RetryPolicy {
		RetryPolicy {
			max_attempts,
			initial_delay: Duration::from_millis(1),
			max_delay: Duration::from_millis(8),
			backoff_multiplier: 2.0,
		}
	}

	#[test]
	fn validate_rejects_degenerate_multiplier() {
		let mut policy = RetryPolicy::default();

		policy.backoff_multiplier = 1.0;

		assert!(policy.validate().is_err());
	}

	#[test]
	fn base_backoff_grows_and_caps() {
		let policy = RetryPolicy {
			max_attempts: 5,
			initial_delay: Duration::from_millis(100),
			max_delay: Duration::from_millis(350),
			backoff_multiplier: 2.0,
		};

		assert_eq!(policy.base_backoff(1), Duration::from_millis(100));
		assert_eq!(policy.base_backoff(2), Duration::from_millis(200));
		assert_eq!(policy.base_backoff(3), Duration::from_millis(350));
		assert_eq!(policy.base_backoff(4), Duration::from_millis(350));
	}

	#[test]
	fn jittered_backoff_stays_within_twenty_percent() {
		let policy = RetryPolicy {
			max_attempts: 3,
			initial_delay: Duration::from_millis(100),
			max_delay: Duration::from_secs(10),
			backoff_multiplier: 2.0,
		};

		for attempt in 1..=4 {
			let base = policy.base_backoff(attempt);

			for _ in 0..64 {
				let jittered = policy.backoff(attempt);

				assert!(jittered >= base.mul_f64(1.0 - JITTER_RATIO));
				assert!(jittered <= base.mul_f64(1.0 + JITTER_RATIO));
			}
		}
	}

	#[tokio::test]
	async fn zero_max_attempts_means_exactly_one_attempt() {
		let calls = AtomicUsize::new(0);
		let executor = RetryExecutor::new(fast_policy(0));
		let started = tokio::time::Instant::now();
		let result: Result<()> = executor
			.execute(|| {
				calls.fetch_add(1, Ordering::SeqCst);

				async { Err(Error::Timeout(10)) }
			})
			.await;

		assert!(result.is_err());
		assert_eq!(calls.load(Ordering::SeqCst), 1);
		// No backoff sleep happened.
		assert!(started.elapsed() < Duration::from_millis(50));
	}

	#[tokio::test]
	async fn retries_transient_errors_until_success() {
		let calls = AtomicUsize::new(0);
		let executor = RetryExecutor::new(fast_policy(3));
		let result = executor
			.execute(|| {
				let call = calls.fetch_add(1, Ordering::SeqCst);

				async move { if call < 2 { Err(Error::Timeout(10)) } else { Ok(call) } }
			})
			.await;

		assert_eq!(result.expect("value"), 2);
		assert_eq!(calls.load(Ordering::SeqCst), 3);
	}

	#[tokio::test]
	async fn non_retriable_errors_surface_immediately() {
		let calls = AtomicUsize::new(0);
		let executor = RetryExecutor::new(fast_policy(5));
		let result: Result<()> = executor
			.execute(|| {
				calls.fetch_add(1, Ordering::SeqCst);

				async {
					Err(Error::Validation { field: "body", reason: "Malformed payload.".into() })
				}
			})
			.await;

		assert!(result.is_err());
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn exhaustion_returns_the_last_error() {
		let calls = AtomicUsize::new(0);
		let executor = RetryExecutor::new(fast_policy(2));
		let result: Result<()> = executor
			.execute(|| {
				let call = calls.fetch_add(1, Ordering::SeqCst);

				async move { Err(Error::Timeout(call as u64)) }
			})
			.await;

		match result {
			Err(Error::Timeout(ms)) => assert_eq!(ms, 2),
			other => panic!("expected timeout, got {other:?}"),
		}
		assert_eq!(calls.load(Ordering::SeqCst), 3);
	}
}
