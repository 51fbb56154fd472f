#![forbid(unsafe_code)]

use std::time::Duration;

/// `min(initial * 2^attempt, max)`, never below `initial`.
pub fn backoff_delay(attempt: u32, initial: Duration, max: Duration) -> Duration {
	let pow = attempt.min(32);
	let ms = initial.as_millis().saturating_mul(1u128 << pow);
	let d = Duration::from_millis(ms.min(u64::MAX as u128) as u64);
	d.min(max).max(initial.min(max))
}

/// Exponential reconnect backoff with an attempt counter.
///
/// Each failed attempt consumes the current delay and doubles it up to `max`;
/// [`Backoff::reset`] returns to `initial` after a successful connection.
#[derive(Debug, Clone)]
pub struct Backoff {
	initial: Duration,
	max: Duration,
	current: Duration,
	attempts: u32,
}

impl Backoff {
	pub fn new(initial: Duration, max: Duration) -> Self {
		let (initial, max) = if initial > max { (max, initial) } else { (initial, max) };
		Self {
			initial,
			max,
			current: initial,
			attempts: 0,
		}
	}

	/// Delay to wait right now.
	pub fn current(&self) -> Duration {
		self.current
	}

	/// Consecutive failed attempts since the last reset.
	pub fn attempts(&self) -> u32 {
		self.attempts
	}

	/// Record a failed attempt: returns the delay to sleep and advances the schedule.
	pub fn fail(&mut self) -> Duration {
		let delay = self.current;
		self.attempts = self.attempts.saturating_add(1);
		self.current = self.current.saturating_mul(2).min(self.max);
		delay
	}

	/// Advance the delay without counting an attempt (e.g. breaker fast-skip).
	pub fn skip(&mut self) -> Duration {
		let delay = self.current;
		self.current = self.current.saturating_mul(2).min(self.max);
		delay
	}

	pub fn reset(&mut self) {
		self.current = self.initial;
		self.attempts = 0;
	}
}
