use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use common::LedgerSequence;
use lake::LineageRow;

/// One file a read realizes, with enough to verify it after fetch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
	pub path: String,
	pub checksum: String,
	pub row_count: u64,
	pub bytes: u64,
}

/// A deterministic list of files realizing a (dataset, era, range)
/// read. Identical inputs over identical lineage produce identical
/// manifests, bit for bit, anywhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadManifest {
	pub dataset: String,
	pub era_id: String,
	pub snapshot_id: u64,
	pub ledger_range: (LedgerSequence, LedgerSequence),
	pub files: Vec<ManifestFile>,
	pub total_rows: u64,
	pub generated_at: DateTime<Utc>,
	pub manifest_checksum: String,
}

impl ReadManifest {
	/// Select lineage intersecting the range, order by path, and seal
	/// with the checksum.
	pub fn build(
		dataset: &str,
		era_id: &str,
		range: (LedgerSequence, LedgerSequence),
		lineage: &[LineageRow],
	) -> Self {
		let mut files: Vec<ManifestFile> = lineage
			.iter()
			.filter(|row| {
				row.source_ledger_start <= range.1 && row.source_ledger_end >= range.0
			})
			.map(|row| ManifestFile {
				path: row.file_path.clone(),
				checksum: row.checksum.clone(),
				row_count: row.row_count,
				bytes: row.file_bytes,
			})
			.collect();
		files.sort_by(|a, b| a.path.cmp(&b.path));

		let snapshot_id = lineage.iter().map(|r| r.snapshot_id).max().unwrap_or(0);
		let total_rows = files.iter().map(|f| f.row_count).sum();
		let manifest_checksum = checksum(dataset, era_id, range, &files);

		ReadManifest {
			dataset: dataset.to_owned(),
			era_id: era_id.to_owned(),
			snapshot_id,
			ledger_range: range,
			files,
			total_rows,
			generated_at: Utc::now(),
			manifest_checksum,
		}
	}
}

/// `hex(trunc128(sha256(dataset ‖ era ‖ start ‖ end ‖ sorted(path ‖
/// checksum))))` with a unit-separator byte between fields and
/// integers as decimal text
pub fn checksum(
	dataset: &str,
	era_id: &str,
	range: (LedgerSequence, LedgerSequence),
	files: &[ManifestFile],
) -> String {
	const SEP: &[u8] = &[0x1f];
	let mut hasher = Sha256::new();
	hasher.update(dataset.as_bytes());
	hasher.update(SEP);
	hasher.update(era_id.as_bytes());
	hasher.update(SEP);
	hasher.update(range.0.value().to_string().as_bytes());
	hasher.update(SEP);
	hasher.update(range.1.value().to_string().as_bytes());
	for file in files {
		hasher.update(SEP);
		hasher.update(file.path.as_bytes());
		hasher.update(SEP);
		hasher.update(file.checksum.as_bytes());
	}
	let digest = hasher.finalize();
	hex::encode(&digest[..16])
}
