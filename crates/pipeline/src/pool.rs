use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, instrument};

use crate::batch::{Batch, BatchResult};

#[derive(Debug, Clone)]
pub struct PoolConfig {
	pub worker_count: usize,
	pub queue_depth: usize,
}

impl Default for PoolConfig {
	fn default() -> Self {
		Self { worker_count: 4, queue_depth: 16 }
	}
}

/// The work a pool runs per batch: fetch the batch's ledgers, extract
/// and filter, produce ordered rows. Implementations report failures
/// inside the returned result, never by panicking the worker.
#[async_trait]
pub trait BatchProcessor: Send + Sync + 'static {
	async fn process(&self, batch: Batch) -> BatchResult;
}

/// Fixed-size worker pool over a bounded batch queue. Results arrive
/// out of order on the result channel; the sequencer downstream
/// restores commit order. Dropping the submission handle stops intake;
/// workers drain the queue and exit.
pub struct WorkerPool {
	submit: mpsc::Sender<Batch>,
	workers: Vec<tokio::task::JoinHandle<()>>,
}

impl WorkerPool {
	pub fn start<P: BatchProcessor>(
		config: PoolConfig,
		processor: Arc<P>,
	) -> (Self, mpsc::Receiver<BatchResult>) {
		let (submit, batch_rx) = mpsc::channel::<Batch>(config.queue_depth.max(1));
		let (result_tx, result_rx) = mpsc::channel::<BatchResult>(config.queue_depth.max(1));
		let batch_rx = Arc::new(Mutex::new(batch_rx));

		let mut workers = vec![];
		for worker in 0..config.worker_count.max(1) {
			let batch_rx = batch_rx.clone();
			let result_tx = result_tx.clone();
			let processor = processor.clone();
			workers.push(tokio::spawn(async move {
				loop {
					let batch = { batch_rx.lock().await.recv().await };
					let Some(batch) = batch else {
						debug!(worker, "Batch queue closed, worker exiting");
						break;
					};
					debug!(worker, %batch, "Processing batch");
					let result = processor.process(batch).await;
					if result_tx.send(result).await.is_err() {
						// Sequencer gone; nothing left to work for
						break;
					}
				}
			}));
		}

		(Self { submit, workers }, result_rx)
	}

	pub fn submitter(&self) -> mpsc::Sender<Batch> {
		self.submit.clone()
	}

	#[instrument(skip(self))]
	pub async fn submit(&self, batch: Batch) -> Result<(), mpsc::error::SendError<Batch>> {
		self.submit.send(batch).await
	}

	/// Cooperative shutdown: stop accepting batches, then wait for
	/// in-flight workers to finish. Results already produced stay
	/// available on the result channel.
	pub async fn shutdown(self) {
		drop(self.submit);
		for handle in self.workers {
			let _ = handle.await;
		}
		info!("Worker pool drained");
	}
}
