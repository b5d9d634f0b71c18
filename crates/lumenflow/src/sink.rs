use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use lake::{Catalog, Flusher, PartitionStore, Table};
use pipeline::{BatchResult, CommitSink};
use resolver::Resolver;

use crate::health::HealthState;

/// Commit sink feeding the columnar lake. Rows enter the flusher's
/// buffers in commit order; a write that advances coverage invalidates
/// the resolver's cache for the touched datasets.
pub struct LakeSink<C: Catalog, S: PartitionStore> {
	flusher: Mutex<Flusher<C, S>>,
	resolver: Option<Arc<Resolver<C>>>,
	era_id: String,
	dataset_prefix: String,
	health: Arc<HealthState>,
}

impl<C: Catalog, S: PartitionStore> LakeSink<C, S> {
	pub fn new(
		flusher: Flusher<C, S>,
		resolver: Option<Arc<Resolver<C>>>,
		era_id: impl Into<String>,
		dataset_prefix: impl Into<String>,
		health: Arc<HealthState>,
	) -> Self {
		Self {
			flusher: Mutex::new(flusher),
			resolver,
			era_id: era_id.into(),
			dataset_prefix: dataset_prefix.into(),
			health,
		}
	}

	/// Interval trigger, forwarded to the flusher
	pub async fn tick(&self) -> Result<(), lake::flusher::FlushError> {
		self.flusher.lock().await.tick().await?;
		self.invalidate_resolver();
		Ok(())
	}

	/// Drain every buffer; used on shutdown
	pub async fn flush(&self) -> Result<(), lake::flusher::FlushError> {
		self.flusher.lock().await.flush().await?;
		self.invalidate_resolver();
		Ok(())
	}

	fn invalidate_resolver(&self) {
		if let Some(resolver) = &self.resolver {
			for table in Table::all() {
				resolver.invalidate(
					&format!("{}.{}", self.dataset_prefix, table),
					&self.era_id,
				);
			}
		}
	}
}

#[async_trait]
impl<C: Catalog + 'static, S: PartitionStore + 'static> CommitSink for LakeSink<C, S> {
	async fn commit(
		&self,
		result: &BatchResult,
	) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
		let mut flusher = self.flusher.lock().await;
		for event in &result.rows {
			flusher.push(event).await?;
		}
		metrics::counter!("events_emitted_total", result.rows.len() as u64);
		self.health.record_emitted(result.rows.len() as u64);
		Ok(())
	}
}
