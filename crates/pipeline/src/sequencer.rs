use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use common::{LedgerSequence, NetworkId};

use crate::{
	batch::{Batch, BatchResult},
	checkpoint::{Checkpoint, CheckpointError, CheckpointStore},
};

/// Idempotent sink invoked once per batch, in strict ledger order
#[async_trait]
pub trait CommitSink: Send + Sync {
	async fn commit(
		&self,
		result: &BatchResult,
	) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// What to do with a batch that arrives carrying an error. Fixed at
/// construction and logged at startup; both behaviors exist in
/// deployments and the choice must be explicit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapPolicy {
	/// Hand the batch back for re-processing, up to the attempt bound
	Retry { max_attempts: u32 },
	/// Record the range as a gap and move on, loudly
	Skip,
}

#[derive(Debug, thiserror::Error)]
pub enum SequencerError {
	#[error("Commit sink failed for batch {batch}: {source}")]
	Sink {
		batch: Batch,
		#[source]
		source: Box<dyn std::error::Error + Send + Sync>,
	},

	#[error("Batch {batch} failed after {attempts} attempts: {error}")]
	BatchFailed { batch: Batch, attempts: u32, error: String },

	#[error("Batch {batch} overlaps the committed edge {next_expected}")]
	Misaligned { batch: Batch, next_expected: LedgerSequence },

	#[error("Checkpoint: {0}")]
	Checkpoint(
		#[from]
		#[source]
		CheckpointError,
	),
}

/// Outcome of offering one result to the sequencer
#[derive(Debug, Default)]
pub struct Offered {
	/// Batches committed by this offer, possibly including previously
	/// buffered ones that became consecutive
	pub committed: u32,
	/// A batch the caller should resubmit to the pool (retry policy)
	pub retry: Option<Batch>,
	/// The offer was a duplicate of already-committed work
	pub duplicate: bool,
}

#[derive(Debug)]
pub struct FlushReport {
	pub committed: u32,
	/// Batches still buffered behind gaps at shutdown
	pub uncommitted: usize,
	pub gaps: Vec<(LedgerSequence, LedgerSequence)>,
}

/// Context for persisting the high-watermark alongside commits
pub struct Checkpointing {
	pub store: CheckpointStore,
	pub network: NetworkId,
	pub source_mode: String,
	pub processor_version: String,
}

/// Receives batch results out of order and commits them in strict
/// ledger order, maintaining the audit hash chain
/// `H_n = sha256(H_{n-1} ‖ batch_hash)` across commits and restarts.
pub struct Sequencer<S: CommitSink> {
	sink: Arc<S>,
	policy: GapPolicy,
	next_expected: LedgerSequence,
	pending: BTreeMap<u32, BatchResult>,
	attempts: HashMap<u32, u32>,
	chain_hash: [u8; 32],
	batch_number: u64,
	gaps: Vec<(LedgerSequence, LedgerSequence)>,
	checkpointing: Option<Checkpointing>,
	pending_high_water: usize,
}

impl<S: CommitSink> Sequencer<S> {
	pub fn new(
		sink: Arc<S>,
		policy: GapPolicy,
		start: LedgerSequence,
		network: &NetworkId,
		checkpointing: Option<Checkpointing>,
	) -> Self {
		info!(%start, ?policy, "Sequencer starting");
		Self {
			sink,
			policy,
			next_expected: start,
			pending: BTreeMap::new(),
			attempts: HashMap::new(),
			chain_hash: chain_seed(network),
			batch_number: 0,
			gaps: vec![],
			checkpointing,
			pending_high_water: 0,
		}
	}

	/// Continue a previous run: the chain value and batch counter come
	/// from the checkpoint so hash-chain continuity is verifiable
	/// across the restart.
	pub fn resume(
		sink: Arc<S>,
		policy: GapPolicy,
		checkpoint: &Checkpoint,
		checkpointing: Option<Checkpointing>,
	) -> Self {
		let mut chain_hash = chain_seed(&checkpoint.network);
		if let Ok(bytes) = hex::decode(&checkpoint.chain_hash) {
			if bytes.len() == 32 {
				chain_hash.copy_from_slice(&bytes);
			}
		}
		info!(
			resume_from = %checkpoint.last_committed_ledger,
			batch_number = checkpoint.batch_number,
			"Sequencer resuming from checkpoint"
		);
		Self {
			sink,
			policy,
			next_expected: checkpoint.last_committed_ledger.next(),
			pending: BTreeMap::new(),
			attempts: HashMap::new(),
			chain_hash,
			batch_number: checkpoint.batch_number,
			gaps: vec![],
			checkpointing,
			pending_high_water: 0,
		}
	}

	pub fn next_expected(&self) -> LedgerSequence {
		self.next_expected
	}

	pub fn chain_hash(&self) -> [u8; 32] {
		self.chain_hash
	}

	pub fn batch_number(&self) -> u64 {
		self.batch_number
	}

	pub fn pending_high_water(&self) -> usize {
		self.pending_high_water
	}

	pub fn pending(&self) -> usize {
		self.pending.len()
	}

	#[instrument(skip(self, result), fields(batch = %result.batch))]
	pub async fn offer(&mut self, result: BatchResult) -> Result<Offered, SequencerError> {
		let mut outcome = Offered::default();
		let start = result.batch.start;

		// Anything entirely behind the committed edge is a duplicate
		if result.batch.end < self.next_expected {
			debug!("Duplicate batch, already committed");
			outcome.duplicate = true;
			return Ok(outcome);
		}
		if start < self.next_expected || self.pending.contains_key(&start.value()) {
			if self.pending.contains_key(&start.value()) {
				debug!("Duplicate batch, already pending");
				outcome.duplicate = true;
				return Ok(outcome);
			}
			return Err(SequencerError::Misaligned {
				batch: result.batch,
				next_expected: self.next_expected,
			});
		}

		if let Some(error) = &result.error {
			match self.policy {
				GapPolicy::Retry { max_attempts } => {
					let attempts = self.attempts.entry(start.value()).or_insert(0);
					*attempts += 1;
					if *attempts >= max_attempts {
						return Err(SequencerError::BatchFailed {
							batch: result.batch.clone(),
							attempts: *attempts,
							error: error.clone(),
						});
					}
					warn!(attempt = *attempts, error = %error, "Re-dispatching failed batch");
					outcome.retry = Some(result.batch);
					return Ok(outcome);
				},
				GapPolicy::Skip => {
					// Buffer the error result; the gap is recorded when
					// it reaches the committed edge, keeping order
					self.pending.insert(start.value(), result);
				},
			}
		} else {
			self.attempts.remove(&start.value());
			self.pending.insert(start.value(), result);
		}
		self.pending_high_water = self.pending_high_water.max(self.pending.len());

		outcome.committed = self.drain().await?;
		metrics::gauge!("pending_batches", self.pending.len() as f64);
		Ok(outcome)
	}

	/// Commit every buffered batch that is consecutive with the edge
	async fn drain(&mut self) -> Result<u32, SequencerError> {
		let mut committed = 0;
		while let Some(result) = self.pending.remove(&self.next_expected.value()) {
			if let Some(error) = &result.error {
				warn!(
					batch = %result.batch,
					error = %error,
					"Skipping failed batch, recording coverage gap"
				);
				self.gaps.push((result.batch.start, result.batch.end));
				self.next_expected = result.batch.end.next();
				continue;
			}

			self.sink.commit(&result).await.map_err(|source| SequencerError::Sink {
				batch: result.batch.clone(),
				source,
			})?;

			let mut hasher = Sha256::new();
			hasher.update(self.chain_hash);
			hasher.update(result.hash);
			self.chain_hash = hasher.finalize().into();
			self.batch_number += 1;
			self.next_expected = result.batch.end.next();
			committed += 1;

			metrics::gauge!(
				"last_processed_ledger",
				f64::from(result.batch.end.value())
			);

			if let Some(ctx) = &self.checkpointing {
				ctx.store
					.save(&Checkpoint {
						last_committed_ledger: result.batch.end,
						batch_number: self.batch_number,
						chain_hash: hex::encode(self.chain_hash),
						source_mode: ctx.source_mode.clone(),
						network: ctx.network.clone(),
						processor_version: ctx.processor_version.clone(),
						updated_at: Utc::now(),
					})
					.await?;
			}
			debug!(batch_number = self.batch_number, edge = %self.next_expected, "Committed batch");
		}
		Ok(committed)
	}

	/// Shutdown path: commit whatever is consecutive and report what
	/// stays stranded behind gaps.
	#[instrument(skip(self))]
	pub async fn flush(&mut self) -> Result<FlushReport, SequencerError> {
		let committed = self.drain().await?;
		let report = FlushReport {
			committed,
			uncommitted: self.pending.len(),
			gaps: self.gaps.clone(),
		};
		if report.uncommitted > 0 {
			warn!(
				uncommitted = report.uncommitted,
				"Batches remain uncommitted behind gaps at flush"
			);
		}
		Ok(report)
	}
}

fn chain_seed(network: &NetworkId) -> [u8; 32] {
	Sha256::digest(network.passphrase().as_bytes()).into()
}

#[cfg(test)]
mod test {
	use std::sync::Mutex;

	use super::*;

	fn network() -> NetworkId {
		NetworkId::new("Test SDF Network ; September 2015")
	}

	#[derive(Default)]
	struct RecordingSink {
		commits: Mutex<Vec<(u32, u32)>>,
	}

	#[async_trait]
	impl CommitSink for RecordingSink {
		async fn commit(
			&self,
			result: &BatchResult,
		) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
			self.commits
				.lock()
				.unwrap()
				.push((result.batch.start.value(), result.batch.end.value()));
			Ok(())
		}
	}

	fn ok_result(start: u32, end: u32) -> BatchResult {
		BatchResult::ok(Batch::new(start, end), vec![])
	}

	fn sequencer(sink: Arc<RecordingSink>, policy: GapPolicy) -> Sequencer<RecordingSink> {
		Sequencer::new(sink, policy, LedgerSequence::new(100), &network(), None)
	}

	#[tokio::test]
	async fn out_of_order_results_commit_in_order() {
		let sink = Arc::new(RecordingSink::default());
		let mut seq = sequencer(sink.clone(), GapPolicy::Skip);

		// Completion order 2,1,3,5,4 over five batches of 100
		for (start, end) in [(200, 299), (100, 199), (300, 399), (500, 599), (400, 499)] {
			seq.offer(ok_result(start, end)).await.unwrap();
		}

		let commits = sink.commits.lock().unwrap().clone();
		assert_eq!(
			commits,
			vec![(100, 199), (200, 299), (300, 399), (400, 499), (500, 599)]
		);
		assert_eq!(seq.next_expected().value(), 600);
		// Batch 2 waited for 1; batch 5 waited for 4
		assert_eq!(seq.pending_high_water(), 2);
		assert!(seq.pending.is_empty());
	}

	#[tokio::test]
	async fn duplicate_offers_are_no_ops() {
		let sink = Arc::new(RecordingSink::default());
		let mut seq = sequencer(sink.clone(), GapPolicy::Skip);

		seq.offer(ok_result(100, 199)).await.unwrap();
		let chain_before = seq.chain_hash();
		let offered = seq.offer(ok_result(100, 199)).await.unwrap();
		assert!(offered.duplicate);
		assert_eq!(offered.committed, 0);
		assert_eq!(seq.chain_hash(), chain_before);
		assert_eq!(sink.commits.lock().unwrap().len(), 1);

		// Duplicate while still pending
		seq.offer(ok_result(300, 399)).await.unwrap();
		let offered = seq.offer(ok_result(300, 399)).await.unwrap();
		assert!(offered.duplicate);
	}

	#[tokio::test]
	async fn chain_hash_is_reproducible() {
		let sink = Arc::new(RecordingSink::default());
		let mut a = sequencer(sink.clone(), GapPolicy::Skip);
		let mut b = sequencer(sink.clone(), GapPolicy::Skip);

		for result in [ok_result(100, 199), ok_result(200, 299)] {
			a.offer(result.clone()).await.unwrap();
			b.offer(result).await.unwrap();
		}
		assert_eq!(a.chain_hash(), b.chain_hash());

		// And equals the manual fold
		let mut expected = chain_seed(&network());
		for result in [ok_result(100, 199), ok_result(200, 299)] {
			let mut hasher = Sha256::new();
			hasher.update(expected);
			hasher.update(result.hash);
			expected = hasher.finalize().into();
		}
		assert_eq!(a.chain_hash(), expected);
	}

	#[tokio::test]
	async fn skip_policy_records_gap() {
		let sink = Arc::new(RecordingSink::default());
		let mut seq = sequencer(sink.clone(), GapPolicy::Skip);

		seq.offer(BatchResult::failed(Batch::new(100, 199), "boom")).await.unwrap();
		seq.offer(ok_result(200, 299)).await.unwrap();

		let commits = sink.commits.lock().unwrap().clone();
		assert_eq!(commits, vec![(200, 299)]);

		let report = seq.flush().await.unwrap();
		assert_eq!(report.gaps, vec![(LedgerSequence::new(100), LedgerSequence::new(199))]);
		assert_eq!(report.uncommitted, 0);
	}

	#[tokio::test]
	async fn retry_policy_hands_batch_back_then_fails() {
		let sink = Arc::new(RecordingSink::default());
		let mut seq = sequencer(sink, GapPolicy::Retry { max_attempts: 3 });

		let failed = || BatchResult::failed(Batch::new(100, 199), "boom");
		for _ in 0..2 {
			let offered = seq.offer(failed()).await.unwrap();
			assert_eq!(offered.retry.as_ref().unwrap().start.value(), 100);
		}
		assert!(matches!(
			seq.offer(failed()).await,
			Err(SequencerError::BatchFailed { attempts: 3, .. })
		));
	}

	#[tokio::test]
	async fn retry_then_success_commits() {
		let sink = Arc::new(RecordingSink::default());
		let mut seq = sequencer(sink.clone(), GapPolicy::Retry { max_attempts: 3 });

		seq.offer(BatchResult::failed(Batch::new(100, 199), "boom")).await.unwrap();
		let offered = seq.offer(ok_result(100, 199)).await.unwrap();
		assert_eq!(offered.committed, 1);
		assert_eq!(sink.commits.lock().unwrap().len(), 1);
	}

	#[tokio::test]
	async fn flush_reports_stranded_batches() {
		let sink = Arc::new(RecordingSink::default());
		let mut seq = sequencer(sink, GapPolicy::Retry { max_attempts: 3 });

		// 100..199 never arrives
		seq.offer(ok_result(200, 299)).await.unwrap();
		seq.offer(ok_result(300, 399)).await.unwrap();
		let report = seq.flush().await.unwrap();
		assert_eq!(report.committed, 0);
		assert_eq!(report.uncommitted, 2);
	}

	#[tokio::test]
	async fn resume_continues_the_chain() {
		let sink = Arc::new(RecordingSink::default());
		let mut first = sequencer(sink.clone(), GapPolicy::Skip);
		first.offer(ok_result(100, 199)).await.unwrap();

		let checkpoint = Checkpoint {
			last_committed_ledger: LedgerSequence::new(199),
			batch_number: first.batch_number(),
			chain_hash: hex::encode(first.chain_hash()),
			source_mode: "ARCHIVE".into(),
			network: network(),
			processor_version: "0.5.0".into(),
			updated_at: Utc::now(),
		};

		let mut resumed =
			Sequencer::resume(sink.clone(), GapPolicy::Skip, &checkpoint, None);
		assert_eq!(resumed.next_expected().value(), 200);
		resumed.offer(ok_result(200, 299)).await.unwrap();

		// Same result as an uninterrupted run
		let mut uninterrupted = sequencer(sink, GapPolicy::Skip);
		uninterrupted.offer(ok_result(100, 199)).await.unwrap();
		uninterrupted.offer(ok_result(200, 299)).await.unwrap();
		assert_eq!(resumed.chain_hash(), uninterrupted.chain_hash());
	}
}
