use std::sync::Arc;

use futures::stream::BoxStream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, instrument, warn};

use common::{LedgerSequence, RawLedger};

use crate::{
	backend::{BackendError, LedgerBackend},
	breaker::{BreakerConfig, CircuitBreaker},
	retry::RetryPolicy,
};

#[derive(Debug, Clone)]
pub struct SourceConfig {
	pub start: LedgerSequence,
	/// `None` is unbounded; the stream ends only on cancellation
	pub end: Option<LedgerSequence>,
	/// The producer never advances more than this many ledgers past
	/// the slowest consumer
	pub buffer_size: usize,
	pub retry: RetryPolicy,
	pub breaker: BreakerConfig,
}

impl SourceConfig {
	pub fn bounded(start: u32, end: u32) -> Self {
		Self {
			start: LedgerSequence::new(start),
			end: Some(LedgerSequence::new(end)),
			..Self::unbounded(start)
		}
	}

	pub fn unbounded(start: u32) -> Self {
		Self {
			start: LedgerSequence::new(start),
			end: None,
			buffer_size: 100,
			retry: RetryPolicy::default(),
			breaker: BreakerConfig::default(),
		}
	}
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
	#[error("Backend: {0}")]
	Backend(
		#[from]
		#[source]
		BackendError,
	),

	#[error("Backend returned ledger {got} where {expected} was expected")]
	Discontinuity { expected: LedgerSequence, got: LedgerSequence },

	#[error("Invalid ledger range: start {start} after end {end}")]
	InvalidRange { start: LedgerSequence, end: LedgerSequence },
}

/// An ordered, resumable producer of raw ledgers over one backend
/// adapter. Ledgers are emitted strictly ascending and contiguous from
/// `start`; transient backend failures are absorbed by the retry
/// manager and circuit breaker.
pub struct LedgerSource {
	backend: Arc<dyn LedgerBackend>,
	breaker: Arc<CircuitBreaker>,
	config: SourceConfig,
	next: LedgerSequence,
}

impl LedgerSource {
	pub fn new(backend: Arc<dyn LedgerBackend>, config: SourceConfig) -> Result<Self, SourceError> {
		if let Some(end) = config.end {
			if config.start > end {
				return Err(SourceError::InvalidRange { start: config.start, end });
			}
		}
		let breaker = Arc::new(CircuitBreaker::new(config.breaker.clone()));
		let next = config.start;
		Ok(Self { backend, breaker, config, next })
	}

	#[instrument(skip(self), fields(start = %self.config.start))]
	pub async fn prepare(&self) -> Result<(), SourceError> {
		self.backend.prepare(self.config.start, self.config.end).await?;
		Ok(())
	}

	pub fn position(&self) -> LedgerSequence {
		self.next
	}

	/// Pull surface. Returns `None` once past the configured end.
	/// Cancellation is cooperative: dropping the future abandons the
	/// in-flight fetch without advancing the position.
	pub async fn next(&mut self) -> Result<Option<RawLedger>, SourceError> {
		if let Some(end) = self.config.end {
			if self.next > end {
				return Ok(None);
			}
		}
		let sequence = self.next;
		let backend = &self.backend;
		let ledger = self
			.config
			.retry
			.run(&self.breaker, || backend.get(sequence))
			.await?;
		if ledger.sequence != sequence {
			return Err(SourceError::Discontinuity { expected: sequence, got: ledger.sequence });
		}
		self.next = sequence.next();
		Ok(Some(ledger))
	}

	/// Push surface: a backpressured stream of ledgers. The producer
	/// blocks once `buffer_size` ledgers are unconsumed. When the
	/// consumer goes away or the range completes, the backend adapter
	/// is closed.
	pub fn stream(mut self) -> BoxStream<'static, Result<RawLedger, SourceError>> {
		let (tx, rx) = mpsc::channel(self.config.buffer_size.max(1));
		let backend = self.backend.clone();
		tokio::spawn(async move {
			loop {
				match self.next().await {
					Ok(Some(ledger)) => {
						let sequence = ledger.sequence;
						if tx.send(Ok(ledger)).await.is_err() {
							debug!(%sequence, "Consumer gone, stopping producer");
							break;
						}
					},
					Ok(None) => {
						info!(end = ?self.config.end, "Ledger range complete");
						break;
					},
					Err(e) => {
						warn!(error = %e, "Ledger source terminating");
						let _ = tx.send(Err(e)).await;
						break;
					},
				}
			}
			backend.close().await;
		});
		Box::pin(ReceiverStream::new(rx))
	}
}

#[cfg(test)]
mod test {
	use std::time::Duration;

	use futures::StreamExt;

	use super::*;
	use crate::inmem::InMemoryBackend;
	use common::NetworkId;

	fn network() -> NetworkId {
		NetworkId::new("Test SDF Network ; September 2015")
	}

	fn fast_config(start: u32, end: Option<u32>) -> SourceConfig {
		SourceConfig {
			start: LedgerSequence::new(start),
			end: end.map(LedgerSequence::new),
			buffer_size: 10,
			retry: RetryPolicy {
				initial_delay: Duration::from_millis(1),
				max_delay: Duration::from_millis(2),
				multiplier: 1.0,
				max_attempts: 5,
			},
			breaker: BreakerConfig {
				max_failures: 100,
				reset_timeout: Duration::from_millis(1),
				close_threshold: 1,
			},
		}
	}

	#[tokio::test]
	async fn bounded_pull_is_ordered_and_contiguous() {
		let backend = Arc::new(InMemoryBackend::with_range(network(), 100, 109));
		let mut source = LedgerSource::new(backend, fast_config(100, Some(109))).unwrap();
		source.prepare().await.unwrap();

		let mut seen = vec![];
		while let Some(ledger) = source.next().await.unwrap() {
			seen.push(ledger.sequence.value());
		}
		assert_eq!(seen, (100..=109).collect::<Vec<_>>());
	}

	#[tokio::test]
	async fn single_ledger_range() {
		let backend = Arc::new(InMemoryBackend::with_range(network(), 100, 109));
		let stream =
			LedgerSource::new(backend, fast_config(105, Some(105))).unwrap().stream();
		let collected: Vec<_> = stream.collect().await;
		assert_eq!(collected.len(), 1);
		assert_eq!(collected[0].as_ref().unwrap().sequence.value(), 105);
	}

	#[tokio::test]
	async fn stream_absorbs_transient_failures() {
		let backend = InMemoryBackend::with_range(network(), 1, 5);
		backend.script_failure(BackendError::ConnectionReset);
		backend.script_failure(BackendError::Unavailable { reason: "restarting".into() });
		let stream = LedgerSource::new(Arc::new(backend), fast_config(1, Some(5)))
			.unwrap()
			.stream();
		let collected: Vec<_> = stream.map(|r| r.unwrap().sequence.value()).collect().await;
		assert_eq!(collected, vec![1, 2, 3, 4, 5]);
	}

	#[tokio::test]
	async fn permanent_failure_surfaces() {
		let backend = InMemoryBackend::with_range(network(), 1, 5);
		backend.script_failure(BackendError::Unauthenticated { reason: "expired".into() });
		let mut stream = LedgerSource::new(Arc::new(backend), fast_config(1, Some(5)))
			.unwrap()
			.stream();
		let first = stream.next().await.unwrap();
		assert!(matches!(
			first,
			Err(SourceError::Backend(BackendError::Unauthenticated { .. }))
		));
		assert!(stream.next().await.is_none());
	}

	#[tokio::test]
	async fn cancellation_closes_backend() {
		let backend = Arc::new(InMemoryBackend::with_range(network(), 1, 1_000_000));
		let mut stream = LedgerSource::new(backend.clone(), fast_config(1, None))
			.unwrap()
			.stream();
		for _ in 0..20 {
			stream.next().await.unwrap().unwrap();
		}
		drop(stream);
		// Producer notices on its next send
		for _ in 0..50 {
			if backend.is_closed() {
				return;
			}
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
		panic!("backend not closed after consumer cancelled");
	}

	#[tokio::test]
	async fn invalid_range_rejected() {
		let backend = Arc::new(InMemoryBackend::with_range(network(), 1, 5));
		assert!(matches!(
			LedgerSource::new(backend, fast_config(10, Some(5))),
			Err(SourceError::InvalidRange { .. })
		));
	}
}
