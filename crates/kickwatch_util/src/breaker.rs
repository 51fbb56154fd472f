#![forbid(unsafe_code)]

use std::fmt;
use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Breaker tuning.
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
	/// Consecutive failures that open the breaker.
	pub failure_threshold: u32,
	/// Time since the last failure after which one trial call is let through.
	pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
	fn default() -> Self {
		Self {
			failure_threshold: 5,
			recovery_timeout: Duration::from_secs(60),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitBreakerState {
	Closed,
	Open,
	HalfOpen,
}

impl fmt::Display for CircuitBreakerState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::Closed => "closed",
			Self::Open => "open",
			Self::HalfOpen => "half_open",
		})
	}
}

/// Error returned by [`CircuitBreaker::call`].
#[derive(Debug, Error)]
pub enum BreakerError<E> {
	#[error("circuit breaker '{name}' is open; retry after {retry_after:?}")]
	Open { name: String, retry_after: Duration },
	#[error(transparent)]
	Inner(E),
}

impl<E> BreakerError<E> {
	pub fn is_open(&self) -> bool {
		matches!(self, Self::Open { .. })
	}
}

#[derive(Debug)]
struct Inner {
	state: CircuitBreakerState,
	failure_count: u32,
	last_failure: Option<Instant>,
	trial_in_flight: bool,
}

/// Tri-state guard around a fallible dependency, shareable across tasks.
///
/// State moves only along Closed -> Open -> HalfOpen -> {Closed | Open}.
#[derive(Debug)]
pub struct CircuitBreaker {
	name: String,
	cfg: CircuitBreakerConfig,
	inner: Mutex<Inner>,
}

impl CircuitBreaker {
	pub fn new(name: impl Into<String>, cfg: CircuitBreakerConfig) -> Self {
		Self {
			name: name.into(),
			cfg: CircuitBreakerConfig {
				failure_threshold: cfg.failure_threshold.max(1),
				..cfg
			},
			inner: Mutex::new(Inner {
				state: CircuitBreakerState::Closed,
				failure_count: 0,
				last_failure: None,
				trial_in_flight: false,
			}),
		}
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn state(&self) -> CircuitBreakerState {
		self.inner.lock().state
	}

	pub fn failure_count(&self) -> u32 {
		self.inner.lock().failure_count
	}

	/// Whether a call may go through now. May move Open -> HalfOpen and claim the single trial.
	pub fn try_acquire(&self) -> bool {
		self.admit().is_some()
	}

	fn admit(&self) -> Option<Admission> {
		let mut inner = self.inner.lock();
		match inner.state {
			CircuitBreakerState::Closed => Some(Admission::Regular),
			CircuitBreakerState::Open => {
				let recovered = inner
					.last_failure
					.map(|t| t.elapsed() >= self.cfg.recovery_timeout)
					.unwrap_or(true);
				if recovered {
					inner.state = CircuitBreakerState::HalfOpen;
					inner.trial_in_flight = true;
					debug!(breaker = %self.name, "circuit breaker half-open; allowing trial");
					Some(Admission::Trial)
				} else {
					None
				}
			}
			CircuitBreakerState::HalfOpen => {
				if inner.trial_in_flight {
					None
				} else {
					inner.trial_in_flight = true;
					Some(Admission::Trial)
				}
			}
		}
	}

	/// Give back a trial that ended without an outcome.
	fn release_trial(&self) {
		let mut inner = self.inner.lock();
		if inner.state == CircuitBreakerState::HalfOpen && inner.trial_in_flight {
			inner.trial_in_flight = false;
			debug!(breaker = %self.name, "circuit breaker trial abandoned");
		}
	}

	pub fn record_success(&self) {
		let mut inner = self.inner.lock();
		match inner.state {
			CircuitBreakerState::Closed => {
				inner.failure_count = 0;
			}
			CircuitBreakerState::HalfOpen => {
				inner.state = CircuitBreakerState::Closed;
				inner.failure_count = 0;
				inner.trial_in_flight = false;
				debug!(breaker = %self.name, "circuit breaker closed");
			}
			// A late success from a call admitted before the breaker opened; recovery goes through HalfOpen.
			CircuitBreakerState::Open => {}
		}
	}

	pub fn record_failure(&self) {
		let mut inner = self.inner.lock();
		inner.failure_count = inner.failure_count.saturating_add(1);
		inner.last_failure = Some(Instant::now());
		match inner.state {
			CircuitBreakerState::Closed => {
				if inner.failure_count >= self.cfg.failure_threshold {
					inner.state = CircuitBreakerState::Open;
					warn!(
						breaker = %self.name,
						failures = inner.failure_count,
						recovery_timeout = ?self.cfg.recovery_timeout,
						"circuit breaker opened"
					);
				}
			}
			CircuitBreakerState::HalfOpen => {
				inner.state = CircuitBreakerState::Open;
				inner.trial_in_flight = false;
				warn!(breaker = %self.name, "circuit breaker trial failed; re-opened");
			}
			CircuitBreakerState::Open => {}
		}
	}

	fn retry_after(&self) -> Duration {
		let inner = self.inner.lock();
		inner
			.last_failure
			.map(|t| self.cfg.recovery_timeout.saturating_sub(t.elapsed()))
			.unwrap_or_default()
	}

	/// Run `op` under breaker protection. When open, `op` is never invoked.
	pub async fn call<F, Fut, T, E>(&self, op: F) -> Result<T, BreakerError<E>>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<T, E>>,
	{
		let Some(admission) = self.admit() else {
			return Err(BreakerError::Open {
				name: self.name.clone(),
				retry_after: self.retry_after(),
			});
		};

		let mut trial = TrialGuard {
			breaker: self,
			pending: admission == Admission::Trial,
		};
		let res = op().await;
		trial.pending = false;

		match res {
			Ok(v) => {
				self.record_success();
				Ok(v)
			}
			Err(e) => {
				self.record_failure();
				Err(BreakerError::Inner(e))
			}
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
	Regular,
	Trial,
}

/// Frees the half-open trial when a `call` future is dropped before `op` finishes.
struct TrialGuard<'a> {
	breaker: &'a CircuitBreaker,
	pending: bool,
}

impl Drop for TrialGuard<'_> {
	fn drop(&mut self) {
		if self.pending {
			self.breaker.release_trial();
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;
	use std::sync::atomic::{AtomicU32, Ordering};

	use super::*;

	fn breaker(threshold: u32, recovery_secs: u64) -> CircuitBreaker {
		CircuitBreaker::new(
			"test",
			CircuitBreakerConfig {
				failure_threshold: threshold,
				recovery_timeout: Duration::from_secs(recovery_secs),
			},
		)
	}

	async fn fail(b: &CircuitBreaker, calls: &AtomicU32) -> Result<(), BreakerError<&'static str>> {
		b.call(|| async {
			calls.fetch_add(1, Ordering::SeqCst);
			Err::<(), _>("boom")
		})
		.await
	}

	async fn succeed(b: &CircuitBreaker, calls: &AtomicU32) -> Result<(), BreakerError<&'static str>> {
		b.call(|| async {
			calls.fetch_add(1, Ordering::SeqCst);
			Ok::<(), &'static str>(())
		})
		.await
	}

	#[tokio::test(start_paused = true)]
	async fn opens_after_threshold_and_rejects_without_invoking() {
		let b = breaker(3, 60);
		let calls = AtomicU32::new(0);

		for _ in 0..3 {
			assert!(matches!(fail(&b, &calls).await, Err(BreakerError::Inner("boom"))));
		}
		assert_eq!(b.state(), CircuitBreakerState::Open);
		assert_eq!(calls.load(Ordering::SeqCst), 3);

		let err = succeed(&b, &calls).await.unwrap_err();
		assert!(err.is_open());
		assert_eq!(calls.load(Ordering::SeqCst), 3, "operation must not run while open");
	}

	#[tokio::test(start_paused = true)]
	async fn success_in_closed_resets_failure_count() {
		let b = breaker(3, 60);
		let calls = AtomicU32::new(0);
		let _ = fail(&b, &calls).await;
		let _ = fail(&b, &calls).await;
		assert_eq!(b.failure_count(), 2);
		succeed(&b, &calls).await.unwrap();
		assert_eq!(b.failure_count(), 0);
		assert_eq!(b.state(), CircuitBreakerState::Closed);
	}

	#[tokio::test(start_paused = true)]
	async fn half_open_trial_success_closes() {
		let b = breaker(2, 30);
		let calls = AtomicU32::new(0);
		let _ = fail(&b, &calls).await;
		let _ = fail(&b, &calls).await;
		assert_eq!(b.state(), CircuitBreakerState::Open);

		tokio::time::advance(Duration::from_secs(31)).await;
		succeed(&b, &calls).await.unwrap();
		assert_eq!(b.state(), CircuitBreakerState::Closed);
		assert_eq!(b.failure_count(), 0);
		assert_eq!(calls.load(Ordering::SeqCst), 3);
	}

	#[tokio::test(start_paused = true)]
	async fn half_open_trial_failure_reopens() {
		let b = breaker(2, 30);
		let calls = AtomicU32::new(0);
		let _ = fail(&b, &calls).await;
		let _ = fail(&b, &calls).await;

		tokio::time::advance(Duration::from_secs(31)).await;
		assert!(matches!(fail(&b, &calls).await, Err(BreakerError::Inner(_))));
		assert_eq!(b.state(), CircuitBreakerState::Open);

		// Failure timestamp was refreshed by the failed trial.
		assert!(succeed(&b, &calls).await.unwrap_err().is_open());
		assert_eq!(calls.load(Ordering::SeqCst), 3);
	}

	#[tokio::test(start_paused = true)]
	async fn stays_open_before_recovery_timeout() {
		let b = breaker(1, 60);
		let calls = AtomicU32::new(0);
		let _ = fail(&b, &calls).await;
		tokio::time::advance(Duration::from_secs(59)).await;
		assert!(!b.try_acquire());
		assert_eq!(b.state(), CircuitBreakerState::Open);
	}

	#[tokio::test(start_paused = true)]
	async fn half_open_admits_a_single_trial() {
		let b = breaker(1, 10);
		b.record_failure();
		tokio::time::advance(Duration::from_secs(11)).await;

		assert!(b.try_acquire());
		assert_eq!(b.state(), CircuitBreakerState::HalfOpen);
		assert!(!b.try_acquire(), "second caller must wait for the trial outcome");
		b.record_success();
		assert!(b.try_acquire());
	}

	#[tokio::test(start_paused = true)]
	async fn cancelled_trial_frees_the_half_open_slot() {
		let b = breaker(1, 10);
		b.record_failure();
		tokio::time::advance(Duration::from_secs(11)).await;

		let stalled = tokio::time::timeout(
			Duration::from_millis(5),
			b.call(|| std::future::pending::<Result<(), &'static str>>()),
		)
		.await;
		assert!(stalled.is_err());
		assert_eq!(b.state(), CircuitBreakerState::HalfOpen);

		let calls = AtomicU32::new(0);
		succeed(&b, &calls).await.unwrap();
		assert_eq!(calls.load(Ordering::SeqCst), 1);
		assert_eq!(b.state(), CircuitBreakerState::Closed);
	}

	#[tokio::test(start_paused = true)]
	async fn cancelled_regular_call_leaves_trial_alone() {
		let b = breaker(1, 10);
		let mut stalled = Box::pin(b.call(|| std::future::pending::<Result<(), &'static str>>()));
		assert!(tokio::time::timeout(Duration::ZERO, &mut stalled).await.is_err());

		b.record_failure();
		tokio::time::advance(Duration::from_secs(11)).await;
		assert!(b.try_acquire());
		drop(stalled);
		assert!(!b.try_acquire(), "the trial claimed after opening is still in flight");
	}

	#[tokio::test(start_paused = true)]
	async fn late_success_does_not_skip_half_open() {
		let b = breaker(1, 10);
		b.record_failure();
		b.record_success();
		assert_eq!(b.state(), CircuitBreakerState::Open);
	}

	#[tokio::test]
	async fn shared_across_tasks() {
		let b = Arc::new(breaker(50, 60));
		let mut handles = Vec::new();
		for _ in 0..10 {
			let b = Arc::clone(&b);
			handles.push(tokio::spawn(async move {
				for _ in 0..4 {
					b.record_failure();
				}
			}));
		}
		for h in handles {
			h.await.unwrap();
		}
		assert_eq!(b.failure_count(), 40);
		assert_eq!(b.state(), CircuitBreakerState::Closed);
	}
}
