use std::{collections::BTreeMap, sync::Mutex};

use async_trait::async_trait;
use tracing::debug;

use common::{LedgerSequence, NetworkId};

use crate::catalog::{
	Catalog, CatalogError, Dataset, Era, EraStatus, LineageRow,
};

#[derive(Default)]
struct Tables {
	eras: Vec<Era>,
	datasets: BTreeMap<String, Dataset>,
	lineage: Vec<LineageRow>,
}

// In-memory twin of the SQL catalog. Backs tests and catalog-less
// local runs with the same publish semantics as the real store.
#[derive(Default)]
pub struct MemoryCatalog {
	tables: Mutex<Tables>,
}

impl MemoryCatalog {
	pub fn new() -> Self {
		Self::default()
	}

	/// Convenience for fixtures: a catalog with one open era and one
	/// dataset
	pub fn with_open_era(era: Era, dataset: Dataset) -> Self {
		let catalog = Self::new();
		{
			let mut tables = catalog.tables.lock().unwrap();
			tables.eras.push(era);
			tables.datasets.insert(dataset.name.clone(), dataset);
		}
		catalog
	}
}

#[async_trait]
impl Catalog for MemoryCatalog {
	async fn list_eras(&self, network: &NetworkId) -> Result<Vec<Era>, CatalogError> {
		let tables = self.tables.lock().unwrap();
		Ok(tables.eras.iter().filter(|e| &e.network == network).cloned().collect())
	}

	async fn open_era(&self, era: Era) -> Result<(), CatalogError> {
		let mut tables = self.tables.lock().unwrap();
		if let Some(open) = tables
			.eras
			.iter()
			.find(|e| e.network == era.network && e.status == EraStatus::Open)
		{
			return Err(CatalogError::EraNotOpen {
				era_id: open.era_id.clone(),
				status: EraStatus::Open,
			});
		}
		tables.eras.push(era);
		Ok(())
	}

	async fn seal_era(
		&self,
		era_id: &str,
		ledger_end: LedgerSequence,
	) -> Result<(), CatalogError> {
		let mut tables = self.tables.lock().unwrap();
		let era = tables
			.eras
			.iter_mut()
			.find(|e| e.era_id == era_id)
			.ok_or_else(|| CatalogError::EraNotFound { era_id: era_id.to_owned() })?;
		if era.status != EraStatus::Open {
			return Err(CatalogError::EraNotOpen {
				era_id: era_id.to_owned(),
				status: era.status,
			});
		}
		era.status = EraStatus::Sealed;
		era.ledger_end = Some(ledger_end);
		Ok(())
	}

	async fn get_dataset(&self, name: &str) -> Result<Dataset, CatalogError> {
		self.tables
			.lock()
			.unwrap()
			.datasets
			.get(name)
			.cloned()
			.ok_or_else(|| CatalogError::DatasetNotFound { name: name.to_owned() })
	}

	async fn put_dataset(&self, dataset: Dataset) -> Result<(), CatalogError> {
		self.tables.lock().unwrap().datasets.insert(dataset.name.clone(), dataset);
		Ok(())
	}

	async fn record_lineage(&self, mut row: LineageRow) -> Result<u64, CatalogError> {
		let mut tables = self.tables.lock().unwrap();
		let last = tables
			.lineage
			.iter()
			.filter(|r| r.dataset == row.dataset && r.era_id == row.era_id)
			.map(|r| (r.snapshot_id, r.source_ledger_end))
			.max();
		if let Some((snapshot_id, tail)) = last {
			// Published files never regress behind existing coverage
			if row.source_ledger_start <= tail {
				return Err(CatalogError::LineageRegression {
					dataset: row.dataset,
					era_id: row.era_id,
					reason: format!(
						"file starts at {} but coverage tail is {tail}",
						row.source_ledger_start
					),
				});
			}
			row.snapshot_id = snapshot_id + 1;
		} else {
			row.snapshot_id = 1;
		}
		let snapshot_id = row.snapshot_id;
		debug!(dataset = %row.dataset, snapshot_id, "Lineage row published");
		tables.lineage.push(row);
		Ok(snapshot_id)
	}

	async fn lineage_for(
		&self,
		dataset: &str,
		era_id: &str,
	) -> Result<Vec<LineageRow>, CatalogError> {
		Ok(self
			.tables
			.lock()
			.unwrap()
			.lineage
			.iter()
			.filter(|r| r.dataset == dataset && r.era_id == era_id)
			.cloned()
			.collect())
	}
}
