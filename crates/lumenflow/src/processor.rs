use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use common::EventFilter;
use extractor::Extractor;
use ledger_source::{
	backend::LedgerBackend, source::SourceConfig, LedgerSource, RetryPolicy,
};
use pipeline::{Batch, BatchProcessor, BatchResult};

use crate::health::HealthState;

/// Worker-pool job: pull the batch's ledgers from the shared backend,
/// extract and filter, hand ordered rows to the sequencer. Failures
/// ride inside the result so one bad batch never takes the pool down.
pub struct LedgerProcessor {
	backend: Arc<dyn LedgerBackend>,
	extractor: Extractor,
	filter: EventFilter,
	retry: RetryPolicy,
	buffer_size: usize,
	health: Arc<HealthState>,
}

impl LedgerProcessor {
	pub fn new(
		backend: Arc<dyn LedgerBackend>,
		extractor: Extractor,
		filter: EventFilter,
		retry: RetryPolicy,
		buffer_size: usize,
		health: Arc<HealthState>,
	) -> Self {
		Self { backend, extractor, filter, retry, buffer_size, health }
	}

	async fn run(&self, batch: &Batch) -> Result<BatchResult, String> {
		let config = SourceConfig {
			start: batch.start,
			end: Some(batch.end),
			buffer_size: self.buffer_size,
			retry: self.retry.clone(),
			breaker: Default::default(),
		};
		let mut source = LedgerSource::new(self.backend.clone(), config)
			.map_err(|e| e.to_string())?;

		let mut rows = vec![];
		while let Some(ledger) = source.next().await.map_err(|e| e.to_string())? {
			let (events, dropped) = self
				.extractor
				.extract_filtered(&ledger, &self.filter)
				.map_err(|e| e.to_string())?;
			metrics::counter!("events_processed_total", (events.len() + dropped) as u64);
			metrics::counter!("events_filtered_total", dropped as u64);
			self.health.record_processed((events.len() + dropped) as u64);
			self.health.record_filtered(dropped as u64);
			rows.extend(events);
		}
		debug!(%batch, rows = rows.len(), "Batch extracted");
		Ok(BatchResult::ok(batch.clone(), rows))
	}
}

#[async_trait]
impl BatchProcessor for LedgerProcessor {
	async fn process(&self, batch: Batch) -> BatchResult {
		match self.run(&batch).await {
			Ok(result) => result,
			Err(error) => {
				warn!(%batch, %error, "Batch processing failed");
				metrics::counter!("transformation_errors", 1);
				self.health.record_error(&error);
				BatchResult::failed(batch, error)
			},
		}
	}
}
