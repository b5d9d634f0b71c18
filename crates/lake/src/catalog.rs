use async_trait::async_trait;
use chrono::{DateTime, Utc};

use common::{LedgerSequence, NetworkId};

/// A contiguous, disjoint slice of a network's ledger history sharing
/// a schema and version label. Only the open era accepts new ledgers;
/// sealed boundaries are immutable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Era {
	pub era_id: String,
	pub version_label: String,
	pub network: NetworkId,
	pub ledger_start: LedgerSequence,
	pub ledger_end: Option<LedgerSequence>,
	pub status: EraStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EraStatus {
	Open,
	Sealed,
	Closed,
}

impl Era {
	pub fn contains(&self, sequence: LedgerSequence) -> bool {
		sequence >= self.ledger_start
			&& self.ledger_end.map_or(true, |end| sequence <= end)
	}
}

/// Immutable after creation except for minor version bumps
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataset {
	pub name: String,
	pub major_version: u32,
	pub minor_version: u32,
	pub schema_hash: String,
	pub grain: String,
	pub owner: String,
}

/// One row per emitted file. Snapshot ids are monotone per
/// (dataset, era); a lineage row only ever exists for a published
/// file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineageRow {
	pub dataset: String,
	pub era_id: String,
	pub version_label: String,
	pub source_ledger_start: LedgerSequence,
	pub source_ledger_end: LedgerSequence,
	pub partition: u32,
	pub file_path: String,
	pub file_bytes: u64,
	pub row_count: u64,
	pub checksum: String,
	pub snapshot_id: u64,
	pub created_at: DateTime<Utc>,
}

/// Committed ledger coverage for a (dataset, era), derived from
/// lineage
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Coverage {
	/// Disjoint, sorted, merged committed ranges
	pub committed: Vec<(LedgerSequence, LedgerSequence)>,
	/// Highest committed ledger
	pub tail_ledger: Option<LedgerSequence>,
	/// End of the gap-free prefix: provable audit state holds up to
	/// here
	pub last_verified: Option<LedgerSequence>,
	pub total_rows: u64,
	pub gaps: Vec<(LedgerSequence, LedgerSequence)>,
}

impl Coverage {
	pub fn from_lineage(rows: &[LineageRow]) -> Self {
		let mut ranges: Vec<(u32, u32)> = rows
			.iter()
			.map(|r| (r.source_ledger_start.value(), r.source_ledger_end.value()))
			.collect();
		ranges.sort();

		let mut committed: Vec<(u32, u32)> = vec![];
		for (lo, hi) in ranges {
			match committed.last_mut() {
				Some((_, prev_hi)) if lo <= prev_hi.saturating_add(1) => {
					*prev_hi = (*prev_hi).max(hi);
				},
				_ => committed.push((lo, hi)),
			}
		}

		let gaps = committed
			.windows(2)
			.map(|pair| (pair[0].1 + 1, pair[1].0 - 1))
			.collect::<Vec<_>>();

		Coverage {
			tail_ledger: committed.last().map(|(_, hi)| LedgerSequence::new(*hi)),
			last_verified: committed.first().map(|(_, hi)| LedgerSequence::new(*hi)),
			total_rows: rows.iter().map(|r| r.row_count).sum(),
			committed: committed
				.iter()
				.map(|(lo, hi)| (LedgerSequence::new(*lo), LedgerSequence::new(*hi)))
				.collect(),
			gaps: gaps
				.into_iter()
				.map(|(lo, hi)| (LedgerSequence::new(lo), LedgerSequence::new(hi)))
				.collect(),
		}
	}

	pub fn covers(&self, sequence: LedgerSequence) -> bool {
		self.committed.iter().any(|(lo, hi)| sequence >= *lo && sequence <= *hi)
	}
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
	#[error("No era covers ledger {sequence} on network '{network}'")]
	NoEraForLedger { network: NetworkId, sequence: LedgerSequence },

	#[error("No open era on network '{network}'")]
	NoOpenEra { network: NetworkId },

	#[error("Era '{era_id}' not found")]
	EraNotFound { era_id: String },

	#[error("Era '{era_id}' is {status:?} and cannot accept this operation")]
	EraNotOpen { era_id: String, status: EraStatus },

	#[error("Dataset '{name}' not found")]
	DatasetNotFound { name: String },

	#[error("Lineage for {dataset}/{era_id} would regress: {reason}")]
	LineageRegression { dataset: String, era_id: String, reason: String },

	#[error("Catalog backend: {0}")]
	Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl CatalogError {
	pub fn backend(cause: impl std::error::Error + Send + Sync + 'static) -> Self {
		CatalogError::Backend(Box::new(cause))
	}
}

/// The only external writer in the system. Lineage recording is the
/// publish step: committing the row and making the file visible to
/// readers happen in one transaction, so a resolver can never observe
/// a file that is not yet published.
#[async_trait]
pub trait Catalog: Send + Sync {
	async fn list_eras(&self, network: &NetworkId) -> Result<Vec<Era>, CatalogError>;

	async fn open_era(&self, era: Era) -> Result<(), CatalogError>;

	/// Seal the open era at `ledger_end`. Boundaries are immutable
	/// afterwards.
	async fn seal_era(
		&self,
		era_id: &str,
		ledger_end: LedgerSequence,
	) -> Result<(), CatalogError>;

	async fn get_dataset(&self, name: &str) -> Result<Dataset, CatalogError>;

	async fn put_dataset(&self, dataset: Dataset) -> Result<(), CatalogError>;

	/// Publish a file: assigns the next snapshot id for the
	/// (dataset, era) and commits the lineage row
	async fn record_lineage(&self, row: LineageRow) -> Result<u64, CatalogError>;

	async fn lineage_for(
		&self,
		dataset: &str,
		era_id: &str,
	) -> Result<Vec<LineageRow>, CatalogError>;
}

// Services select their catalog backend at runtime; delegating through
// Arc keeps the flusher and resolver generic over either
#[async_trait]
impl<T: Catalog + ?Sized> Catalog for std::sync::Arc<T> {
	async fn list_eras(&self, network: &NetworkId) -> Result<Vec<Era>, CatalogError> {
		(**self).list_eras(network).await
	}

	async fn open_era(&self, era: Era) -> Result<(), CatalogError> {
		(**self).open_era(era).await
	}

	async fn seal_era(
		&self,
		era_id: &str,
		ledger_end: LedgerSequence,
	) -> Result<(), CatalogError> {
		(**self).seal_era(era_id, ledger_end).await
	}

	async fn get_dataset(&self, name: &str) -> Result<Dataset, CatalogError> {
		(**self).get_dataset(name).await
	}

	async fn put_dataset(&self, dataset: Dataset) -> Result<(), CatalogError> {
		(**self).put_dataset(dataset).await
	}

	async fn record_lineage(&self, row: LineageRow) -> Result<u64, CatalogError> {
		(**self).record_lineage(row).await
	}

	async fn lineage_for(
		&self,
		dataset: &str,
		era_id: &str,
	) -> Result<Vec<LineageRow>, CatalogError> {
		(**self).lineage_for(dataset, era_id).await
	}
}

#[cfg(test)]
mod test {
	use super::*;

	fn lineage(lo: u32, hi: u32, rows: u64) -> LineageRow {
		LineageRow {
			dataset: "core.events".into(),
			era_id: "p23".into(),
			version_label: "v1".into(),
			source_ledger_start: LedgerSequence::new(lo),
			source_ledger_end: LedgerSequence::new(hi),
			partition: lo / 100_000,
			file_path: format!("core.events/p23/part={}/f-{lo}.parquet", lo / 100_000),
			file_bytes: 1024,
			row_count: rows,
			checksum: "00".repeat(16),
			snapshot_id: 0,
			created_at: Utc::now(),
		}
	}

	#[test]
	fn coverage_merges_adjacent_ranges() {
		let coverage = Coverage::from_lineage(&[
			lineage(100, 199, 10),
			lineage(200, 299, 20),
			lineage(400, 499, 5),
		]);
		assert_eq!(coverage.committed.len(), 2);
		assert_eq!(coverage.committed[0].0.value(), 100);
		assert_eq!(coverage.committed[0].1.value(), 299);
		assert_eq!(coverage.tail_ledger.unwrap().value(), 499);
		assert_eq!(coverage.last_verified.unwrap().value(), 299);
		assert_eq!(coverage.total_rows, 35);
		assert_eq!(
			coverage.gaps,
			vec![(LedgerSequence::new(300), LedgerSequence::new(399))]
		);
		assert!(coverage.covers(LedgerSequence::new(250)));
		assert!(!coverage.covers(LedgerSequence::new(350)));
	}

	#[test]
	fn coverage_of_nothing() {
		let coverage = Coverage::from_lineage(&[]);
		assert!(coverage.committed.is_empty());
		assert!(coverage.tail_ledger.is_none());
	}

	#[test]
	fn committed_ranges_are_disjoint_and_ordered() {
		let coverage = Coverage::from_lineage(&[
			lineage(500, 599, 1),
			lineage(100, 199, 1),
			lineage(300, 399, 1),
		]);
		for pair in coverage.committed.windows(2) {
			assert!(pair[0].1 < pair[1].0);
		}
	}

	#[test]
	fn era_containment() {
		let open = Era {
			era_id: "p23".into(),
			version_label: "v1".into(),
			network: NetworkId::new("net"),
			ledger_start: LedgerSequence::new(1_000_000),
			ledger_end: None,
			status: EraStatus::Open,
		};
		assert!(open.contains(LedgerSequence::new(5_000_000)));
		assert!(!open.contains(LedgerSequence::new(999_999)));

		let sealed = Era { ledger_end: Some(LedgerSequence::new(2_000_000)), ..open };
		assert!(!sealed.contains(LedgerSequence::new(2_000_001)));
	}
}
