use std::{
	sync::Mutex,
	time::{Duration, Instant},
};

use tracing::warn;

#[derive(Debug, Clone)]
pub struct BreakerConfig {
	/// Consecutive failures before the breaker opens
	pub max_failures: u32,
	/// How long the breaker stays open before admitting a probe
	pub reset_timeout: Duration,
	/// Consecutive half-open successes required to close again
	pub close_threshold: u32,
}

impl Default for BreakerConfig {
	fn default() -> Self {
		Self { max_failures: 5, reset_timeout: Duration::from_secs(30), close_threshold: 3 }
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
	Closed,
	Open,
	HalfOpen,
}

#[derive(Debug)]
enum Inner {
	Closed { failures: u32 },
	Open { since: Instant },
	// Half-open admits requests one at a time
	HalfOpen { successes: u32, probe_in_flight: bool },
}

/// Circuit breaker wrapped around one adapter. Closed until
/// `max_failures` consecutive failures, open for `reset_timeout`, then
/// half-open admitting single probes until `close_threshold`
/// consecutive successes close it again.
#[derive(Debug)]
pub struct CircuitBreaker {
	config: BreakerConfig,
	inner: Mutex<Inner>,
}

impl CircuitBreaker {
	pub fn new(config: BreakerConfig) -> Self {
		Self { config, inner: Mutex::new(Inner::Closed { failures: 0 }) }
	}

	pub fn state(&self) -> BreakerState {
		match &*self.inner.lock().unwrap() {
			Inner::Closed { .. } => BreakerState::Closed,
			Inner::Open { .. } => BreakerState::Open,
			Inner::HalfOpen { .. } => BreakerState::HalfOpen,
		}
	}

	/// Whether a request may proceed right now. Open breakers flip to
	/// half-open once the reset timeout elapses; half-open admits one
	/// probe at a time.
	pub fn try_acquire(&self) -> bool {
		let mut inner = self.inner.lock().unwrap();
		match &mut *inner {
			Inner::Closed { .. } => true,
			Inner::Open { since } => {
				if since.elapsed() >= self.config.reset_timeout {
					*inner = Inner::HalfOpen { successes: 0, probe_in_flight: true };
					true
				} else {
					false
				}
			},
			Inner::HalfOpen { probe_in_flight, .. } => {
				if *probe_in_flight {
					false
				} else {
					*probe_in_flight = true;
					true
				}
			},
		}
	}

	pub fn on_success(&self) {
		let mut inner = self.inner.lock().unwrap();
		match &mut *inner {
			Inner::Closed { failures } => *failures = 0,
			Inner::HalfOpen { successes, probe_in_flight } => {
				*successes += 1;
				*probe_in_flight = false;
				if *successes >= self.config.close_threshold {
					*inner = Inner::Closed { failures: 0 };
				}
			},
			Inner::Open { .. } => {},
		}
	}

	pub fn on_failure(&self) {
		let mut inner = self.inner.lock().unwrap();
		match &mut *inner {
			Inner::Closed { failures } => {
				*failures += 1;
				if *failures >= self.config.max_failures {
					warn!(failures, "Circuit breaker opening");
					*inner = Inner::Open { since: Instant::now() };
				}
			},
			Inner::HalfOpen { .. } => {
				warn!("Circuit breaker re-opening after failed probe");
				*inner = Inner::Open { since: Instant::now() };
			},
			Inner::Open { .. } => {},
		}
	}
}
