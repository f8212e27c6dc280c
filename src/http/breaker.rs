//! Per-endpoint circuit breaker.
//!
//! Each endpoint key owns an independent breaker: CLOSED until the failure
//! threshold is met, OPEN (fail-fast, no I/O) for the cooldown window, then
//! HALF_OPEN admitting a single probe whose outcome decides the next state.

// std
use std::{collections::HashMap, sync::Mutex};
// self
use crate::_prelude::*;

/// Consecutive failures required to open a breaker.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
/// Cooldown before an open breaker admits a probe.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30);

/// Clock abstraction so breaker timing can be driven in tests.
pub trait Clock: Send + Sync + std::fmt::Debug {
	/// Current monotonic instant.
	fn now(&self) -> Instant;
}

/// Monotonic clock backed by `Instant::now()`.
#[derive(Clone, Debug, Default)]
pub struct MonotonicClock;
impl Clock for MonotonicClock {
	fn now(&self) -> Instant {
		Instant::now()
	}
}

/// Public breaker status.
#[allow(missing_docs)]
#[derive(Clone, Debug, Copy, PartialEq, Eq)]
pub enum BreakerStatus {
	Closed,
	Open,
	HalfOpen,
}

/// Point-in-time view of a breaker's state.
#[derive(Clone, Debug)]
pub struct BreakerSnapshot {
	/// Current status.
	pub status: BreakerStatus,
	/// Consecutive failures recorded since the last success.
	pub consecutive_failures: u32,
	/// Instant at which the breaker last opened.
	pub opened_at: Option<Instant>,
}

#[derive(Clone, Debug)]
enum BreakerState {
	Closed { failures: u32 },
	Open { opened_at: Instant, failures: u32 },
	HalfOpen { probe_in_flight: bool, failures: u32 },
}

/// Circuit breaker guarding a single endpoint.
#[derive(Debug)]
pub struct CircuitBreaker {
	endpoint: String,
	threshold: u32,
	cooldown: Duration,
	state: Mutex<BreakerState>,
	clock: Arc<dyn Clock>,
}
impl CircuitBreaker {
	/// Create a breaker with the given threshold and cooldown.
	pub fn new(endpoint: impl Into<String>, threshold: u32, cooldown: Duration) -> Self {
		Self::with_clock(endpoint, threshold, cooldown, Arc::new(MonotonicClock))
	}

	/// Create a breaker with an injected clock (for tests).
	pub fn with_clock(
		endpoint: impl Into<String>,
		threshold: u32,
		cooldown: Duration,
		clock: Arc<dyn Clock>,
	) -> Self {
		Self {
			endpoint: endpoint.into(),
			threshold: threshold.max(1),
			cooldown,
			state: Mutex::new(BreakerState::Closed { failures: 0 }),
			clock,
		}
	}

	/// Endpoint key guarded by this breaker.
	pub fn endpoint(&self) -> &str {
		&self.endpoint
	}

	/// Run `operation` under breaker admission control.
	///
	/// While OPEN the call returns [`Error::CircuitOpen`] without invoking the
	/// operation at all.
	pub async fn execute<T, Fut, Op>(&self, operation: Op) -> Result<T>
	where
		Fut: Future<Output = Result<T>>,
		Op: FnOnce() -> Fut,
	{
		self.admit()?;

		let result = operation().await;

		match &result {
			Ok(_) => self.on_success(),
			Err(err) if err.is_retriable() => self.on_failure(),
			// Terminal caller errors (validation, auth) say nothing about
			// endpoint health; the probe slot is simply released.
			Err(_) => self.on_neutral(),
		}

		result
	}

	/// Current state snapshot.
	pub fn snapshot(&self) -> BreakerSnapshot {
		let state = self.state.lock().expect("breaker lock");

		match &*state {
			BreakerState::Closed { failures } => BreakerSnapshot {
				status: BreakerStatus::Closed,
				consecutive_failures: *failures,
				opened_at: None,
			},
			BreakerState::Open { opened_at, failures } => BreakerSnapshot {
				status: BreakerStatus::Open,
				consecutive_failures: *failures,
				opened_at: Some(*opened_at),
			},
			BreakerState::HalfOpen { failures, .. } => BreakerSnapshot {
				status: BreakerStatus::HalfOpen,
				consecutive_failures: *failures,
				opened_at: None,
			},
		}
	}

	/// Force the breaker back to CLOSED with counters cleared.
	pub fn reset(&self) {
		*self.state.lock().expect("breaker lock") = BreakerState::Closed { failures: 0 };

		tracing::debug!(endpoint = %self.endpoint, "circuit breaker reset");
	}

	fn admit(&self) -> Result<()> {
		let mut state = self.state.lock().expect("breaker lock");

		match &mut *state {
			BreakerState::Closed { .. } => Ok(()),
			BreakerState::Open { opened_at, failures } => {
				let elapsed = self.clock.now().saturating_duration_since(*opened_at);

				if elapsed >= self.cooldown {
					tracing::info!(endpoint = %self.endpoint, "circuit breaker half-open");

					*state = BreakerState::HalfOpen { probe_in_flight: true, failures: *failures };

					Ok(())
				} else {
					let remaining = self.cooldown - elapsed;

					Err(Error::CircuitOpen {
						endpoint: self.endpoint.clone(),
						cooldown_remaining_ms: remaining.as_millis() as u64,
					})
				}
			},
			BreakerState::HalfOpen { probe_in_flight, .. } => {
				if *probe_in_flight {
					return Err(Error::CircuitOpen {
						endpoint: self.endpoint.clone(),
						cooldown_remaining_ms: 0,
					});
				}

				*probe_in_flight = true;

				Ok(())
			},
		}
	}

	fn on_success(&self) {
		let mut state = self.state.lock().expect("breaker lock");

		if !matches!(&*state, BreakerState::Closed { failures: 0 }) {
			tracing::info!(endpoint = %self.endpoint, "circuit breaker closed");
		}

		*state = BreakerState::Closed { failures: 0 };
	}

	fn on_failure(&self) {
		let mut state = self.state.lock().expect("breaker lock");
		let now = self.clock.now();

		*state = match &*state {
			BreakerState::Closed { failures } => {
				let failures = failures.saturating_add(1);

				if failures >= self.threshold {
					tracing::warn!(
						endpoint = %self.endpoint,
						failures,
						threshold = self.threshold,
						"circuit breaker opened"
					);

					BreakerState::Open { opened_at: now, failures }
				} else {
					BreakerState::Closed { failures }
				}
			},
			BreakerState::HalfOpen { failures, .. } => {
				tracing::warn!(endpoint = %self.endpoint, "circuit breaker probe failed; reopening");

				BreakerState::Open { opened_at: now, failures: failures.saturating_add(1) }
			},
			BreakerState::Open { opened_at, failures } =>
				BreakerState::Open { opened_at: *opened_at, failures: failures.saturating_add(1) },
		};
	}

	fn on_neutral(&self) {
		let mut state = self.state.lock().expect("breaker lock");

		if let BreakerState::HalfOpen { probe_in_flight, .. } = &mut *state {
			*probe_in_flight = false;
		}
	}
}

/// Hands out one breaker per endpoint key.
#[derive(Debug)]
pub struct BreakerRegistry {
	threshold: u32,
	cooldown: Duration,
	breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}
impl BreakerRegistry {
	/// Create a registry with the default threshold and cooldown.
	pub fn new() -> Self {
		Self::with_settings(DEFAULT_FAILURE_THRESHOLD, DEFAULT_COOLDOWN)
	}

	/// Create a registry with explicit breaker settings.
	pub fn with_settings(threshold: u32, cooldown: Duration) -> Self {
		Self { threshold, cooldown, breakers: Mutex::new(HashMap::new()) }
	}

	/// Breaker guarding `endpoint`, created on first use.
	pub fn breaker(&self, endpoint: &str) -> Arc<CircuitBreaker> {
		let mut breakers = self.breakers.lock().expect("breaker registry lock");

		breakers
			.entry(endpoint.to_string())
			.or_insert_with(|| {
				Arc::new(CircuitBreaker::new(endpoint, self.threshold, self.cooldown))
			})
			.clone()
	}

	/// Reset every breaker to CLOSED.
	pub fn reset_all(&self) {
		for breaker in self.breakers.lock().expect("breaker registry lock").values() {
			breaker.reset();
		}
	}
}
impl Default for BreakerRegistry {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	// std
	use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
	// self
	use super::*;

	#[derive(Debug)]
	struct ManualClock {
		epoch: Instant,
		offset_ms: AtomicU64,
	}
	impl ManualClock {
		fn new() -> Self {
			Self { epoch: Instant::now(), offset_ms: AtomicU64::new(0) }
		}

		fn advance(&self, millis: u64) {
			self.offset_ms.fetch_add(millis, Ordering::SeqCst);
		}
	}
	impl Clock for ManualClock {
		fn now(&self) -> Instant {
			self.epoch + Duration::from_millis(self.offset_ms.load(Ordering::SeqCst))
		}
	}

	fn breaker_with_clock(clock: Arc<ManualClock>) -> CircuitBreaker {
		CircuitBreaker::with_clock("events", 3, Duration::from_secs(30), clock)
	}

	async fn fail(breaker: &CircuitBreaker, calls: &AtomicUsize) -> Result<()> {
		breaker
			.execute(|| {
				calls.fetch_add(1, Ordering::SeqCst);

				async { Err(Error::Timeout(5)) }
			})
			.await
	}

	#[tokio::test]
	async fn opens_after_threshold_and_fails_fast_without_io() {
		let clock = Arc::new(ManualClock::new());
		let breaker = breaker_with_clock(clock.clone());
		let calls = AtomicUsize::new(0);

		for _ in 0..3 {
			let _ = fail(&breaker, &calls).await;
		}

		assert_eq!(breaker.snapshot().status, BreakerStatus::Open);
		assert_eq!(calls.load(Ordering::SeqCst), 3);

		let rejected = fail(&breaker, &calls).await;

		assert!(matches!(rejected, Err(Error::CircuitOpen { .. })));
		// The operation was never invoked while open.
		assert_eq!(calls.load(Ordering::SeqCst), 3);
	}

	#[tokio::test]
	async fn half_open_probe_success_closes_and_resets_counters() {
		let clock = Arc::new(ManualClock::new());
		let breaker = breaker_with_clock(clock.clone());
		let calls = AtomicUsize::new(0);

		for _ in 0..3 {
			let _ = fail(&breaker, &calls).await;
		}

		clock.advance(30_000);

		let probed = breaker.execute(|| async { Ok(204u16) }).await;

		assert_eq!(probed.expect("probe"), 204);

		let snapshot = breaker.snapshot();

		assert_eq!(snapshot.status, BreakerStatus::Closed);
		assert_eq!(snapshot.consecutive_failures, 0);
	}

	#[tokio::test]
	async fn half_open_probe_failure_restarts_cooldown() {
		let clock = Arc::new(ManualClock::new());
		let breaker = breaker_with_clock(clock.clone());
		let calls = AtomicUsize::new(0);

		for _ in 0..3 {
			let _ = fail(&breaker, &calls).await;
		}

		clock.advance(30_000);

		let _ = fail(&breaker, &calls).await;

		assert_eq!(breaker.snapshot().status, BreakerStatus::Open);

		// Half the cooldown is not enough after reopening.
		clock.advance(15_000);

		assert!(matches!(fail(&breaker, &calls).await, Err(Error::CircuitOpen { .. })));
	}

	#[tokio::test]
	async fn terminal_errors_do_not_trip_the_breaker() {
		let clock = Arc::new(ManualClock::new());
		let breaker = breaker_with_clock(clock);

		for _ in 0..5 {
			let result: Result<()> = breaker
				.execute(|| async {
					Err(Error::Validation { field: "body", reason: "Bad payload.".into() })
				})
				.await;

			assert!(result.is_err());
		}

		assert_eq!(breaker.snapshot().status, BreakerStatus::Closed);
	}

	#[tokio::test]
	async fn registry_scopes_breakers_per_endpoint() {
		let registry = BreakerRegistry::with_settings(1, Duration::from_secs(30));
		let events = registry.breaker("events");
		let summaries = registry.breaker("summaries");
		let calls = AtomicUsize::new(0);

		let _ = fail(&events, &calls).await;

		assert_eq!(events.snapshot().status, BreakerStatus::Open);
		assert_eq!(summaries.snapshot().status, BreakerStatus::Closed);
		assert!(Arc::ptr_eq(&events, &registry.breaker("events")));
	}

	#[tokio::test]
	async fn reset_returns_breaker_to_closed() {
		let registry = BreakerRegistry::with_settings(1, Duration::from_secs(30));
		let breaker = registry.breaker("configs");
		let calls = AtomicUsize::new(0);

		let _ = fail(&breaker, &calls).await;

		assert_eq!(breaker.snapshot().status, BreakerStatus::Open);

		breaker.reset();

		assert_eq!(breaker.snapshot().status, BreakerStatus::Closed);
		assert!(breaker.execute(|| async { Ok(()) }).await.is_ok());
	}
}
