use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, instrument, warn};

use common::{EventFilter, LedgerSequence, NetworkId};
use extractor::Extractor;
use lake::{flusher::FlushError, Catalog, PartitionStore};
use ledger_source::{backend::LedgerBackend, RetryPolicy};
use pipeline::{
	sequencer::Checkpointing, Batch, CheckpointError, CheckpointStore, GapPolicy,
	PoolConfig, Sequencer, SequencerError, WorkerPool,
};

use crate::{health::HealthState, processor::LedgerProcessor, sink::LakeSink};

#[derive(Debug, Clone)]
pub struct DriverConfig {
	pub start_ledger: u32,
	/// 0 = unbounded
	pub end_ledger: u32,
	pub batch_size: u32,
	pub worker_count: usize,
	pub buffer_size: usize,
	pub flush_interval: Duration,
	pub gap_policy: GapPolicy,
	pub source_mode: String,
}

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
	#[error("Checkpoint: {0}")]
	Checkpoint(
		#[from]
		#[source]
		CheckpointError,
	),

	#[error("Sequencer: {0}")]
	Sequencer(
		#[from]
		#[source]
		SequencerError,
	),

	#[error("Lake flush: {0}")]
	Flush(
		#[from]
		#[source]
		FlushError,
	),

	#[error("Worker pool went away mid-run")]
	PoolClosed,
}

#[derive(Debug)]
pub struct DriverSummary {
	pub committed_batches: u64,
	pub last_committed: Option<LedgerSequence>,
	pub gaps: Vec<(LedgerSequence, LedgerSequence)>,
	pub uncommitted: usize,
}

/// Drive the parallel commit pipeline over a ledger range: plan
/// batches, fan out to the worker pool, restore order through the
/// sequencer, feed the lake sink, persist the checkpoint per commit.
/// Returns when a bounded range completes or `shutdown` flips.
#[instrument(skip_all, fields(start = config.start_ledger, end = config.end_ledger))]
pub async fn run_pipeline<C: Catalog + 'static, S: PartitionStore + 'static>(
	backend: Arc<dyn LedgerBackend>,
	network: NetworkId,
	filter: EventFilter,
	sink: Arc<LakeSink<C, S>>,
	checkpoint_store: CheckpointStore,
	config: DriverConfig,
	health: Arc<HealthState>,
	mut shutdown: watch::Receiver<bool>,
) -> Result<DriverSummary, DriverError> {
	let checkpoint = checkpoint_store.load().await?;
	let resume_start = CheckpointStore::resume_start(
		LedgerSequence::new(config.start_ledger),
		&network,
		&config.source_mode,
		checkpoint.as_ref(),
	)?;

	// A checkpoint already past a bounded range is a clean no-op exit
	if config.end_ledger != 0 && resume_start.value() > config.end_ledger {
		info!(
			%resume_start,
			end = config.end_ledger,
			"Checkpoint is past the configured range, nothing to do"
		);
		return Ok(DriverSummary {
			committed_batches: 0,
			last_committed: checkpoint.map(|c| c.last_committed_ledger),
			gaps: vec![],
			uncommitted: 0,
		});
	}

	let had_checkpoint = checkpoint.is_some();
	if let Some(ckpt) = &checkpoint {
		let current = env!("CARGO_PKG_VERSION");
		if ckpt.processor_version.split('.').next() != current.split('.').next() {
			warn!(
				checkpointed = %ckpt.processor_version,
				running = %current,
				"Checkpoint was written by a different processor major version"
			);
		}
	}
	let checkpointing = Checkpointing {
		store: checkpoint_store,
		network: network.clone(),
		source_mode: config.source_mode.clone(),
		processor_version: env!("CARGO_PKG_VERSION").to_owned(),
	};
	let mut sequencer = match &checkpoint {
		Some(ckpt) if resume_start == ckpt.last_committed_ledger.next() => {
			Sequencer::resume(sink.clone(), config.gap_policy, ckpt, Some(checkpointing))
		},
		_ => Sequencer::new(
			sink.clone(),
			config.gap_policy,
			resume_start,
			&network,
			Some(checkpointing),
		),
	};

	let processor = Arc::new(LedgerProcessor::new(
		backend.clone(),
		Extractor::new(network.clone()),
		filter,
		RetryPolicy::default(),
		config.buffer_size,
		health.clone(),
	));
	let (pool, mut results) = WorkerPool::start(
		PoolConfig {
			worker_count: config.worker_count,
			queue_depth: config.worker_count * 2,
		},
		processor,
	);

	// Submission runs apart from the commit loop so a full queue never
	// blocks sequencing
	let submitter = pool.submitter();
	let (stop_submission, submission_done) = spawn_submission(
		submitter.clone(),
		resume_start,
		config.end_ledger,
		config.batch_size,
	);

	let bounded_end = (config.end_ledger != 0).then(|| LedgerSequence::new(config.end_ledger));
	let mut flush_ticker = tokio::time::interval(config.flush_interval);
	flush_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
	flush_ticker.tick().await;

	let mut committed_batches: u64 = 0;
	let mut interrupted = false;
	loop {
		tokio::select! {
			maybe_result = results.recv() => {
				let Some(result) = maybe_result else {
					if bounded_end.is_some() {
						warn!("Result channel closed before range completion");
					}
					break;
				};
				let last_close = result.rows.last().map(|e| e.envelope.close_time);
				let offered = sequencer.offer(result).await?;
				if let Some(batch) = offered.retry {
					if submitter.send(batch).await.is_err() {
						return Err(DriverError::PoolClosed);
					}
				}
				if offered.committed > 0 {
					committed_batches += u64::from(offered.committed);
					let edge = sequencer.next_expected();
					health.set_last_processed_ledger(edge.value().saturating_sub(1));
					if let Some(close_time) = last_close {
						health.set_lag_seconds(
							(Utc::now() - close_time).num_seconds().max(0),
						);
					}
				}
				health.set_pending_batches(sequencer.pending() as u64);
				if let Some(end) = bounded_end {
					if sequencer.next_expected() > end {
						info!(%end, "Bounded range fully committed");
						break;
					}
				}
			},
			_ = flush_ticker.tick() => {
				sink.tick().await?;
			},
			_ = shutdown.changed() => {
				info!("Shutdown requested, draining pipeline");
				interrupted = true;
				break;
			},
		}
	}

	// Ordered shutdown: stop intake, drain workers, flush the
	// sequencer, flush lake buffers, close the adapter
	let _ = stop_submission.send(true);
	drop(submitter);
	pool.shutdown().await;
	while let Ok(result) = results.try_recv() {
		if !interrupted {
			let offered = sequencer.offer(result).await?;
			committed_batches += u64::from(offered.committed);
		}
	}
	let report = sequencer.flush().await?;
	committed_batches += u64::from(report.committed);
	sink.flush().await?;
	backend.close().await;
	let _ = submission_done.await;

	let last_committed = ((committed_batches > 0 || had_checkpoint)
		&& sequencer.next_expected().value() > 0)
		.then(|| LedgerSequence::new(sequencer.next_expected().value() - 1));
	health.set_last_processed_ledger(
		last_committed.map(|l| l.value()).unwrap_or_default(),
	);
	info!(
		committed_batches,
		uncommitted = report.uncommitted,
		gaps = report.gaps.len(),
		"Pipeline drained"
	);
	Ok(DriverSummary {
		committed_batches,
		last_committed,
		gaps: report.gaps,
		uncommitted: report.uncommitted,
	})
}

/// Feed the pool with planned batches. Bounded ranges enumerate up
/// front; unbounded runs roll forward until stopped.
fn spawn_submission(
	submitter: mpsc::Sender<Batch>,
	start: LedgerSequence,
	end_ledger: u32,
	batch_size: u32,
) -> (watch::Sender<bool>, tokio::task::JoinHandle<()>) {
	let (stop_tx, mut stop_rx) = watch::channel(false);
	let handle = tokio::spawn(async move {
		let mut next = start.value();
		loop {
			if *stop_rx.borrow() {
				break;
			}
			let batch_end = if end_ledger != 0 {
				if next > end_ledger {
					debug!("All batches submitted");
					break;
				}
				end_ledger.min(next.saturating_add(batch_size - 1))
			} else {
				match next.checked_add(batch_size - 1) {
					Some(end) => end,
					None => break,
				}
			};
			let batch = Batch::new(next, batch_end);
			tokio::select! {
				sent = submitter.send(batch) => {
					if sent.is_err() {
						break;
					}
				},
				_ = stop_rx.changed() => break,
			}
			next = batch_end.saturating_add(1);
		}
	});
	(stop_tx, handle)
}
