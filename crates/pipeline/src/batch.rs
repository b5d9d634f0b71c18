use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use common::{DomainEvent, LedgerSequence};

/// A worker unit: a contiguous, inclusive ledger range
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
	pub start: LedgerSequence,
	pub end: LedgerSequence,
	pub id: Uuid,
	pub created_at: DateTime<Utc>,
}

impl Batch {
	pub fn new(start: impl Into<LedgerSequence>, end: impl Into<LedgerSequence>) -> Self {
		Self {
			start: start.into(),
			end: end.into(),
			id: Uuid::new_v4(),
			created_at: Utc::now(),
		}
	}

	pub fn ledger_count(&self) -> u32 {
		self.end.value() - self.start.value() + 1
	}

	/// Split `[start, end]` into batches of at most `size` ledgers
	pub fn plan(start: u32, end: u32, size: u32) -> Vec<Batch> {
		assert!(size > 0, "batch size must be positive");
		let mut batches = vec![];
		let mut lo = start;
		while lo <= end {
			let hi = end.min(lo.saturating_add(size - 1));
			batches.push(Batch::new(lo, hi));
			if hi == u32::MAX {
				break;
			}
			lo = hi + 1;
		}
		batches
	}
}

impl std::fmt::Display for Batch {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "[{}..{}]", self.start, self.end)
	}
}

/// The outcome of processing one batch. Ownership passes from the
/// worker to the sequencer; an error is carried rather than thrown so
/// one bad batch never stops the pool.
#[derive(Debug, Clone)]
pub struct BatchResult {
	pub batch: Batch,
	pub rows: Vec<DomainEvent>,
	pub hash: [u8; 32],
	pub error: Option<String>,
}

impl BatchResult {
	pub fn ok(batch: Batch, rows: Vec<DomainEvent>) -> Self {
		let hash = batch_hash(&rows);
		Self { batch, rows, hash, error: None }
	}

	pub fn failed(batch: Batch, error: impl Into<String>) -> Self {
		Self { batch, rows: vec![], hash: [0; 32], error: Some(error.into()) }
	}
}

/// Digest over the canonical row encoding, row order included
pub fn batch_hash(rows: &[DomainEvent]) -> [u8; 32] {
	let mut hasher = Sha256::new();
	for row in rows {
		// serde_json over our event types is deterministic: struct
		// fields serialize in declaration order
		if let Ok(bytes) = serde_json::to_vec(row) {
			hasher.update((bytes.len() as u64).to_be_bytes());
			hasher.update(&bytes);
		}
	}
	hasher.finalize().into()
}
