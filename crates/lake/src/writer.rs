use std::{
	path::{Path, PathBuf},
	sync::Arc,
};

use arrow_array::{
	ArrayRef, BooleanArray, Int64Array, RecordBatch, StringArray, UInt32Array,
};
use arrow_schema::{DataType, Field, Schema};
use async_trait::async_trait;
use parquet::arrow::ArrowWriter;
use sha2::{Digest, Sha256};
use tracing::instrument;

use crate::row::EventRow;

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
	#[error("Arrow: {0}")]
	Arrow(
		#[from]
		#[source]
		arrow_schema::ArrowError,
	),

	#[error("Parquet: {0}")]
	Parquet(
		#[from]
		#[source]
		parquet::errors::ParquetError,
	),

	#[error("Partition store I/O: {0}")]
	Io(
		#[from]
		#[source]
		std::io::Error,
	),

	#[error("Refusing to write an empty file")]
	Empty,
}

/// An encoded, content-addressed columnar file ready for publication
#[derive(Debug, Clone)]
pub struct WrittenFile {
	pub relative_path: String,
	pub bytes: u64,
	pub row_count: u64,
	/// sha256 over the file bytes, hex
	pub checksum: String,
}

pub fn event_row_schema() -> Arc<Schema> {
	Arc::new(Schema::new(vec![
		Field::new("ledger_sequence", DataType::UInt32, false),
		Field::new("tx_hash", DataType::Utf8, false),
		Field::new("tx_index", DataType::UInt32, false),
		Field::new("op_index", DataType::UInt32, false),
		Field::new("event_index", DataType::UInt32, false),
		Field::new("close_time_unix", DataType::Int64, false),
		Field::new("successful", DataType::Boolean, false),
		Field::new("kind", DataType::Utf8, false),
		Field::new("contract", DataType::Utf8, true),
		Field::new("from_address", DataType::Utf8, true),
		Field::new("to_address", DataType::Utf8, true),
		Field::new("amount", DataType::Utf8, true),
		Field::new("asset", DataType::Utf8, true),
		Field::new("function", DataType::Utf8, true),
		Field::new("body_json", DataType::Utf8, false),
	]))
}

pub fn rows_to_record_batch(rows: &[EventRow]) -> Result<RecordBatch, WriteError> {
	let schema = event_row_schema();
	let columns: Vec<ArrayRef> = vec![
		Arc::new(UInt32Array::from_iter_values(rows.iter().map(|r| r.ledger_sequence))),
		Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.tx_hash.as_str()))),
		Arc::new(UInt32Array::from_iter_values(rows.iter().map(|r| r.tx_index))),
		Arc::new(UInt32Array::from_iter_values(rows.iter().map(|r| r.op_index))),
		Arc::new(UInt32Array::from_iter_values(rows.iter().map(|r| r.event_index))),
		Arc::new(Int64Array::from_iter_values(rows.iter().map(|r| r.close_time_unix))),
		Arc::new(BooleanArray::from_iter(rows.iter().map(|r| Some(r.successful)))),
		Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.kind.as_str()))),
		Arc::new(StringArray::from_iter(rows.iter().map(|r| r.contract.as_deref()))),
		Arc::new(StringArray::from_iter(rows.iter().map(|r| r.from_address.as_deref()))),
		Arc::new(StringArray::from_iter(rows.iter().map(|r| r.to_address.as_deref()))),
		Arc::new(StringArray::from_iter(rows.iter().map(|r| r.amount.as_deref()))),
		Arc::new(StringArray::from_iter(rows.iter().map(|r| r.asset.as_deref()))),
		Arc::new(StringArray::from_iter(rows.iter().map(|r| r.function.as_deref()))),
		Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.body_json.as_str()))),
	];
	Ok(RecordBatch::try_new(schema, columns)?)
}

/// Encode rows into one parquet file in memory and derive its content
/// checksum. Callers decide the path and publication.
pub fn encode_parquet(rows: &[EventRow]) -> Result<(Vec<u8>, WrittenFile), WriteError> {
	if rows.is_empty() {
		return Err(WriteError::Empty);
	}
	let batch = rows_to_record_batch(rows)?;
	let mut buffer = vec![];
	{
		let mut writer = ArrowWriter::try_new(&mut buffer, batch.schema(), None)?;
		writer.write(&batch)?;
		writer.close()?;
	}
	let file = WrittenFile {
		relative_path: String::new(),
		bytes: buffer.len() as u64,
		row_count: rows.len() as u64,
		checksum: hex::encode(Sha256::digest(&buffer)),
	};
	Ok((buffer, file))
}

/// Where immutable columnar files land. The production deployment
/// mounts an object store behind this; tests use a temp dir.
#[async_trait]
pub trait PartitionStore: Send + Sync {
	/// Write a new immutable file. Writing over an existing path is an
	/// error: published files never change.
	async fn put(&self, relative_path: &str, bytes: &[u8]) -> Result<(), WriteError>;

	async fn get(&self, relative_path: &str) -> Result<Vec<u8>, WriteError>;
}

pub struct LocalPartitionStore {
	root: PathBuf,
}

impl LocalPartitionStore {
	pub fn new(root: impl AsRef<Path>) -> Self {
		Self { root: root.as_ref().to_owned() }
	}

	fn resolve(&self, relative_path: &str) -> PathBuf {
		self.root.join(relative_path)
	}
}

#[async_trait]
impl PartitionStore for LocalPartitionStore {
	#[instrument(skip(self, bytes), fields(bytes = bytes.len()))]
	async fn put(&self, relative_path: &str, bytes: &[u8]) -> Result<(), WriteError> {
		let path = self.resolve(relative_path);
		if tokio::fs::try_exists(&path).await.unwrap_or(false) {
			return Err(WriteError::Io(std::io::Error::new(
				std::io::ErrorKind::AlreadyExists,
				format!("{relative_path} is already published"),
			)));
		}
		if let Some(parent) = path.parent() {
			tokio::fs::create_dir_all(parent).await?;
		}
		// Write-then-rename so readers never observe a partial file
		let tmp = path.with_extension("inprogress");
		tokio::fs::write(&tmp, bytes).await?;
		tokio::fs::rename(&tmp, &path).await?;
		Ok(())
	}

	async fn get(&self, relative_path: &str) -> Result<Vec<u8>, WriteError> {
		Ok(tokio::fs::read(self.resolve(relative_path)).await?)
	}
}
