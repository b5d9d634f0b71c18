use std::{sync::Arc, time::Duration};

use tracing::{debug, instrument};

use common::{LedgerSequence, NetworkId};
use lake::{Catalog, CatalogError, Coverage, Dataset, Era, EraStatus, LineageRow};

use crate::{cache::TtlCache, manifest::ReadManifest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentMode {
	Latest,
	AsOfLedger,
	Range,
}

/// What a reader wants from a dataset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Intent {
	pub mode: IntentMode,
	pub network: NetworkId,
	pub ledger: Option<LedgerSequence>,
	pub range: Option<(LedgerSequence, LedgerSequence)>,
	/// Fail rather than return a range past the verified audit tail
	pub strict_pas: bool,
}

impl Intent {
	pub fn latest(network: NetworkId) -> Self {
		Self { mode: IntentMode::Latest, network, ledger: None, range: None, strict_pas: false }
	}

	pub fn as_of(network: NetworkId, ledger: u32) -> Self {
		Self {
			mode: IntentMode::AsOfLedger,
			network,
			ledger: Some(LedgerSequence::new(ledger)),
			range: None,
			strict_pas: false,
		}
	}

	pub fn range(network: NetworkId, start: u32, end: u32) -> Self {
		Self {
			mode: IntentMode::Range,
			network,
			ledger: None,
			range: Some((LedgerSequence::new(start), LedgerSequence::new(end))),
			strict_pas: false,
		}
	}
}

#[derive(Debug, Clone)]
pub struct ResolvedDataset {
	pub dataset: Dataset,
	pub era: Era,
	pub coverage: Coverage,
	/// Present only for range intents
	pub manifest: Option<ReadManifest>,
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
	#[error("Catalog: {0}")]
	Catalog(
		#[from]
		#[source]
		CatalogError,
	),

	#[error("Intent mode {mode:?} is missing its {what}")]
	MalformedIntent { mode: IntentMode, what: &'static str },

	#[error("Range [{start}..{end}] crosses the boundary of era '{era_id}'")]
	EraBoundaryCrossed { era_id: String, start: LedgerSequence, end: LedgerSequence },

	#[error(
		"Range end {end} exceeds the verified tail {verified} for '{dataset}' (strict PAS)"
	)]
	RangeNotVerified { dataset: String, end: LedgerSequence, verified: LedgerSequence },

	#[error("Invalid range: start {start} after end {end}")]
	InvalidRange { start: LedgerSequence, end: LedgerSequence },
}

/// Routes analytical reads: picks the era, derives coverage from
/// lineage, and for ranged reads produces a deterministic manifest.
/// Resolution is pure over (catalog state, intent); the cache only
/// short-circuits repeated catalog reads inside the TTL.
pub struct Resolver<C: Catalog> {
	catalog: Arc<C>,
	eras: TtlCache<Vec<Era>>,
	lineage: TtlCache<Vec<LineageRow>>,
}

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

impl<C: Catalog> Resolver<C> {
	pub fn new(catalog: Arc<C>) -> Self {
		Self::with_ttl(catalog, DEFAULT_CACHE_TTL)
	}

	pub fn with_ttl(catalog: Arc<C>, ttl: Duration) -> Self {
		Self {
			catalog,
			eras: TtlCache::new(64, ttl),
			lineage: TtlCache::new(256, ttl),
		}
	}

	/// A write advanced coverage for (dataset, era): drop the cached
	/// lineage so readers observe it immediately
	pub fn invalidate(&self, dataset: &str, era_id: &str) {
		self.lineage.invalidate(&lineage_key(dataset, era_id));
	}

	#[instrument(skip(self), fields(dataset = %dataset_name))]
	pub async fn resolve(
		&self,
		dataset_name: &str,
		intent: &Intent,
	) -> Result<ResolvedDataset, ResolveError> {
		let era = self.pick_era(intent).await?;
		let lineage = self.lineage_for(dataset_name, &era.era_id).await?;
		let coverage = Coverage::from_lineage(&lineage);
		let dataset = self.catalog.get_dataset(dataset_name).await?;

		let manifest = match intent.mode {
			IntentMode::Range => {
				let (start, end) = intent.range.ok_or(ResolveError::MalformedIntent {
					mode: intent.mode,
					what: "range",
				})?;
				if intent.strict_pas {
					let verified =
						coverage.last_verified.unwrap_or(LedgerSequence::new(0));
					if end > verified {
						return Err(ResolveError::RangeNotVerified {
							dataset: dataset_name.to_owned(),
							end,
							verified,
						});
					}
				}
				Some(ReadManifest::build(dataset_name, &era.era_id, (start, end), &lineage))
			},
			_ => None,
		};

		debug!(era = %era.era_id, files = manifest.as_ref().map(|m| m.files.len()), "Resolved");
		Ok(ResolvedDataset { dataset, era, coverage, manifest })
	}

	async fn pick_era(&self, intent: &Intent) -> Result<Era, ResolveError> {
		let eras = self.eras_for(&intent.network).await?;
		match intent.mode {
			IntentMode::Latest => eras
				.iter()
				.find(|e| e.status == EraStatus::Open)
				.cloned()
				.ok_or_else(|| {
					CatalogError::NoOpenEra { network: intent.network.clone() }.into()
				}),
			IntentMode::AsOfLedger => {
				let ledger = intent.ledger.ok_or(ResolveError::MalformedIntent {
					mode: intent.mode,
					what: "ledger",
				})?;
				era_covering(&eras, &intent.network, ledger)
			},
			IntentMode::Range => {
				let (start, end) = intent.range.ok_or(ResolveError::MalformedIntent {
					mode: intent.mode,
					what: "range",
				})?;
				if start > end {
					return Err(ResolveError::InvalidRange { start, end });
				}
				let era = era_covering(&eras, &intent.network, start)?;
				if !era.contains(end) {
					return Err(ResolveError::EraBoundaryCrossed {
						era_id: era.era_id,
						start,
						end,
					});
				}
				Ok(era)
			},
		}
	}

	async fn eras_for(&self, network: &NetworkId) -> Result<Vec<Era>, ResolveError> {
		let key = network.passphrase().to_owned();
		if let Some(eras) = self.eras.get(&key) {
			return Ok(eras);
		}
		let eras = self.catalog.list_eras(network).await?;
		self.eras.put(key, eras.clone());
		Ok(eras)
	}

	async fn lineage_for(
		&self,
		dataset: &str,
		era_id: &str,
	) -> Result<Vec<LineageRow>, ResolveError> {
		let key = lineage_key(dataset, era_id);
		if let Some(rows) = self.lineage.get(&key) {
			return Ok(rows);
		}
		let rows = self.catalog.lineage_for(dataset, era_id).await?;
		self.lineage.put(key, rows.clone());
		Ok(rows)
	}
}

fn lineage_key(dataset: &str, era_id: &str) -> String {
	format!("{dataset}\u{1f}{era_id}")
}

fn era_covering(
	eras: &[Era],
	network: &NetworkId,
	sequence: LedgerSequence,
) -> Result<Era, ResolveError> {
	eras.iter().find(|e| e.contains(sequence)).cloned().ok_or_else(|| {
		CatalogError::NoEraForLedger { network: network.clone(), sequence }.into()
	})
}
