use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::{
	prelude::*,
	r2d2::{ConnectionManager, Pool},
	PgConnection,
};
use tokio::task::spawn_blocking;
use tracing::instrument;

use common::{LedgerSequence, NetworkId};

use crate::{
	catalog::{Catalog, CatalogError, Dataset, Era, EraStatus, LineageRow},
	schema::{datasets, eras, lineage},
};

#[derive(Queryable, Insertable, AsChangeset)]
#[diesel(table_name = eras)]
struct EraRecord {
	era_id: String,
	version_label: String,
	network: String,
	ledger_start: i64,
	ledger_end: Option<i64>,
	status: String,
}

#[derive(Queryable, Insertable, AsChangeset)]
#[diesel(table_name = datasets)]
struct DatasetRecord {
	name: String,
	major_version: i32,
	minor_version: i32,
	schema_hash: String,
	grain: String,
	owner: String,
}

#[derive(Queryable, Insertable)]
#[diesel(table_name = lineage)]
struct LineageRecord {
	dataset: String,
	era_id: String,
	version_label: String,
	source_ledger_start: i64,
	source_ledger_end: i64,
	partition: i32,
	file_path: String,
	file_bytes: i64,
	row_count: i64,
	checksum: String,
	snapshot_id: i64,
	created_at: DateTime<Utc>,
}

impl From<&Era> for EraRecord {
	fn from(era: &Era) -> Self {
		Self {
			era_id: era.era_id.clone(),
			version_label: era.version_label.clone(),
			network: era.network.passphrase().to_owned(),
			ledger_start: i64::from(era.ledger_start.value()),
			ledger_end: era.ledger_end.map(|l| i64::from(l.value())),
			status: match era.status {
				EraStatus::Open => "open".to_owned(),
				EraStatus::Sealed => "sealed".to_owned(),
				EraStatus::Closed => "closed".to_owned(),
			},
		}
	}
}

impl TryFrom<EraRecord> for Era {
	type Error = CatalogError;

	fn try_from(record: EraRecord) -> Result<Self, Self::Error> {
		Ok(Era {
			status: match record.status.as_str() {
				"open" => EraStatus::Open,
				"sealed" => EraStatus::Sealed,
				"closed" => EraStatus::Closed,
				other => {
					return Err(CatalogError::Backend(
						format!("unrecognized era status '{other}'").into(),
					))
				},
			},
			era_id: record.era_id,
			version_label: record.version_label,
			network: NetworkId::new(record.network),
			ledger_start: LedgerSequence::new(record.ledger_start as u32),
			ledger_end: record.ledger_end.map(|l| LedgerSequence::new(l as u32)),
		})
	}
}

impl From<&LineageRow> for LineageRecord {
	fn from(row: &LineageRow) -> Self {
		Self {
			dataset: row.dataset.clone(),
			era_id: row.era_id.clone(),
			version_label: row.version_label.clone(),
			source_ledger_start: i64::from(row.source_ledger_start.value()),
			source_ledger_end: i64::from(row.source_ledger_end.value()),
			partition: row.partition as i32,
			file_path: row.file_path.clone(),
			file_bytes: row.file_bytes as i64,
			row_count: row.row_count as i64,
			checksum: row.checksum.clone(),
			snapshot_id: row.snapshot_id as i64,
			created_at: row.created_at,
		}
	}
}

impl From<LineageRecord> for LineageRow {
	fn from(record: LineageRecord) -> Self {
		Self {
			dataset: record.dataset,
			era_id: record.era_id,
			version_label: record.version_label,
			source_ledger_start: LedgerSequence::new(record.source_ledger_start as u32),
			source_ledger_end: LedgerSequence::new(record.source_ledger_end as u32),
			partition: record.partition as u32,
			file_path: record.file_path,
			file_bytes: record.file_bytes as u64,
			row_count: record.row_count as u64,
			checksum: record.checksum,
			snapshot_id: record.snapshot_id as u64,
			created_at: record.created_at,
		}
	}
}

/// SQL catalog over Postgres. All writes are serialized per table by
/// the flusher; the pool exists for concurrent readers.
#[derive(Clone)]
pub struct PgCatalog {
	pool: Pool<ConnectionManager<PgConnection>>,
}

impl PgCatalog {
	pub fn new(database_url: &str) -> Result<Self, CatalogError> {
		let pool = Pool::builder()
			.build(ConnectionManager::<PgConnection>::new(database_url))
			.map_err(CatalogError::backend)?;
		Ok(Self { pool })
	}

	async fn with_conn<T, F>(&self, f: F) -> Result<T, CatalogError>
	where
		T: Send + 'static,
		F: FnOnce(&mut PgConnection) -> Result<T, CatalogError> + Send + 'static,
	{
		let pool = self.pool.clone();
		spawn_blocking(move || {
			let mut conn = pool.get().map_err(CatalogError::backend)?;
			f(&mut conn)
		})
		.await
		.map_err(CatalogError::backend)?
	}
}

#[async_trait]
impl Catalog for PgCatalog {
	#[instrument(skip(self))]
	async fn list_eras(&self, network: &NetworkId) -> Result<Vec<Era>, CatalogError> {
		let passphrase = network.passphrase().to_owned();
		self.with_conn(move |conn| {
			let records: Vec<EraRecord> = eras::table
				.filter(eras::network.eq(&passphrase))
				.order(eras::ledger_start.asc())
				.load(conn)
				.map_err(CatalogError::backend)?;
			records.into_iter().map(Era::try_from).collect()
		})
		.await
	}

	async fn open_era(&self, era: Era) -> Result<(), CatalogError> {
		let record = EraRecord::from(&era);
		self.with_conn(move |conn| {
			conn.transaction(|conn| {
				let open: i64 = eras::table
					.filter(eras::network.eq(&record.network))
					.filter(eras::status.eq("open"))
					.count()
					.get_result(conn)?;
				if open > 0 {
					return Err(diesel::result::Error::RollbackTransaction);
				}
				diesel::insert_into(eras::table).values(&record).execute(conn)?;
				Ok(())
			})
			.map_err(CatalogError::backend)
		})
		.await
	}

	async fn seal_era(
		&self,
		era_id: &str,
		ledger_end: LedgerSequence,
	) -> Result<(), CatalogError> {
		let era_id = era_id.to_owned();
		self.with_conn(move |conn| {
			let updated = diesel::update(
				eras::table
					.filter(eras::era_id.eq(&era_id))
					.filter(eras::status.eq("open")),
			)
			.set((
				eras::status.eq("sealed"),
				eras::ledger_end.eq(Some(i64::from(ledger_end.value()))),
			))
			.execute(conn)
			.map_err(CatalogError::backend)?;
			if updated == 0 {
				return Err(CatalogError::EraNotFound { era_id });
			}
			Ok(())
		})
		.await
	}

	async fn get_dataset(&self, name: &str) -> Result<Dataset, CatalogError> {
		let name = name.to_owned();
		self.with_conn(move |conn| {
			let record: DatasetRecord = datasets::table
				.find(&name)
				.first(conn)
				.optional()
				.map_err(CatalogError::backend)?
				.ok_or(CatalogError::DatasetNotFound { name })?;
			Ok(Dataset {
				name: record.name,
				major_version: record.major_version as u32,
				minor_version: record.minor_version as u32,
				schema_hash: record.schema_hash,
				grain: record.grain,
				owner: record.owner,
			})
		})
		.await
	}

	async fn put_dataset(&self, dataset: Dataset) -> Result<(), CatalogError> {
		let record = DatasetRecord {
			name: dataset.name,
			major_version: dataset.major_version as i32,
			minor_version: dataset.minor_version as i32,
			schema_hash: dataset.schema_hash,
			grain: dataset.grain,
			owner: dataset.owner,
		};
		self.with_conn(move |conn| {
			diesel::insert_into(datasets::table)
				.values(&record)
				.on_conflict(datasets::name)
				.do_update()
				.set(&record)
				.execute(conn)
				.map_err(CatalogError::backend)?;
			Ok(())
		})
		.await
	}

	/// One transaction covers the snapshot assignment, the regression
	/// guard, and the insert; publication is atomic.
	#[instrument(skip(self, row), fields(dataset = %row.dataset, era = %row.era_id))]
	async fn record_lineage(&self, row: LineageRow) -> Result<u64, CatalogError> {
		self.with_conn(move |conn| {
			conn.transaction(|conn| {
				let last: Option<(i64, i64)> = lineage::table
					.filter(lineage::dataset.eq(&row.dataset))
					.filter(lineage::era_id.eq(&row.era_id))
					.select((lineage::snapshot_id, lineage::source_ledger_end))
					.order(lineage::snapshot_id.desc())
					.first(conn)
					.optional()?;

				let snapshot_id = match last {
					Some((snapshot, tail)) => {
						if i64::from(row.source_ledger_start.value()) <= tail {
							return Err(diesel::result::Error::RollbackTransaction);
						}
						snapshot + 1
					},
					None => 1,
				};

				let mut record = LineageRecord::from(&row);
				record.snapshot_id = snapshot_id;
				diesel::insert_into(lineage::table).values(&record).execute(conn)?;
				Ok(snapshot_id as u64)
			})
			.map_err(CatalogError::backend)
		})
		.await
	}

	async fn lineage_for(
		&self,
		dataset: &str,
		era_id: &str,
	) -> Result<Vec<LineageRow>, CatalogError> {
		let dataset = dataset.to_owned();
		let era_id = era_id.to_owned();
		self.with_conn(move |conn| {
			let records: Vec<LineageRecord> = lineage::table
				.filter(lineage::dataset.eq(&dataset))
				.filter(lineage::era_id.eq(&era_id))
				.order(lineage::snapshot_id.asc())
				.load(conn)
				.map_err(CatalogError::backend)?;
			Ok(records.into_iter().map(LineageRow::from).collect())
		})
		.await
	}
}
