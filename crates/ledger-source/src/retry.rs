use std::{future::Future, sync::Arc, time::Duration};

use backoff::{backoff::Backoff, ExponentialBackoff, ExponentialBackoffBuilder};
use tracing::{debug, warn};

use crate::{backend::BackendError, breaker::CircuitBreaker};

/// Exponential backoff with jitter for transient backend failures.
/// `NotYetAvailable` at the chain head is retried indefinitely when
/// `max_attempts` is zero; other retryable kinds always respect the
/// attempt bound.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
	pub initial_delay: Duration,
	pub max_delay: Duration,
	pub multiplier: f64,
	/// 0 = unbounded, for chain-head polling
	pub max_attempts: u32,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			initial_delay: Duration::from_millis(500),
			max_delay: Duration::from_secs(30),
			multiplier: 2.0,
			max_attempts: 10,
		}
	}
}

impl RetryPolicy {
	fn backoff(&self) -> ExponentialBackoff {
		ExponentialBackoffBuilder::new()
			.with_initial_interval(self.initial_delay)
			.with_max_interval(self.max_delay)
			.with_multiplier(self.multiplier)
			.with_max_elapsed_time(None)
			.build()
	}

	/// Run `op` until it succeeds, fails permanently, or exhausts the
	/// attempt budget. The circuit breaker is consulted before every
	/// attempt; a rejected acquire counts as an unavailability delay,
	/// not a failure.
	pub async fn run<T, F, Fut>(
		&self,
		breaker: &Arc<CircuitBreaker>,
		mut op: F,
	) -> Result<T, BackendError>
	where
		F: FnMut() -> Fut,
		Fut: Future<Output = Result<T, BackendError>>,
	{
		let mut backoff = self.backoff();
		let mut attempts: u32 = 0;
		loop {
			if !breaker.try_acquire() {
				let delay = backoff.next_backoff().unwrap_or(self.max_delay);
				debug!(?delay, "Circuit open, deferring attempt");
				tokio::time::sleep(delay).await;
				continue;
			}

			match op().await {
				Ok(value) => {
					breaker.on_success();
					return Ok(value);
				},
				Err(e) if e.is_retryable() => {
					// Head-of-chain polling is not a backend fault
					if e.is_not_yet_available() {
						breaker.on_success();
					} else {
						breaker.on_failure();
						attempts += 1;
						if self.max_attempts > 0 && attempts >= self.max_attempts {
							warn!(attempts, error = %e, "Retry budget exhausted");
							return Err(e);
						}
					}
					let delay = backoff.next_backoff().unwrap_or(self.max_delay);
					debug!(?delay, attempts, error = %e, "Retrying backend call");
					tokio::time::sleep(delay).await;
				},
				Err(e) => {
					breaker.on_failure();
					return Err(e);
				},
			}
		}
	}
}
