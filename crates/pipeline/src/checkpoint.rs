use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use tracing::{info, instrument, warn};

use common::{LedgerSequence, NetworkId};

/// Durable high-watermark enabling crash-safe resume. Exactly one is
/// current; updates go through a temp-write, fsync, atomic-rename
/// cycle so a crash can never leave a torn record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
	pub last_committed_ledger: LedgerSequence,
	pub batch_number: u64,
	/// Rolling hash chain value at the committed edge, hex
	pub chain_hash: String,
	pub source_mode: String,
	pub network: NetworkId,
	pub processor_version: String,
	pub updated_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
	#[error("Checkpoint I/O: {0}")]
	Io(
		#[from]
		#[source]
		std::io::Error,
	),

	#[error("Checkpoint is not valid JSON: {0}")]
	Malformed(
		#[from]
		#[source]
		serde_json::Error,
	),

	#[error(
		"Checkpoint was written for network '{checkpoint}' but this service is configured for '{configured}'"
	)]
	NetworkMismatch { checkpoint: NetworkId, configured: NetworkId },
}

pub struct CheckpointStore {
	path: PathBuf,
}

impl CheckpointStore {
	pub fn new(dir: impl AsRef<Path>, file: &str) -> Self {
		Self { path: dir.as_ref().join(file) }
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	/// `None` means fresh start
	#[instrument(skip(self))]
	pub async fn load(&self) -> Result<Option<Checkpoint>, CheckpointError> {
		match tokio::fs::read(&self.path).await {
			Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
			Err(e) => Err(e.into()),
		}
	}

	#[instrument(skip(self, checkpoint), fields(ledger = %checkpoint.last_committed_ledger))]
	pub async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
		if let Some(parent) = self.path.parent() {
			tokio::fs::create_dir_all(parent).await?;
		}
		let tmp = self.path.with_extension("tmp");
		let bytes = serde_json::to_vec_pretty(checkpoint)?;
		{
			let mut file = tokio::fs::File::create(&tmp).await?;
			file.write_all(&bytes).await?;
			file.sync_all().await?;
		}
		tokio::fs::rename(&tmp, &self.path).await?;
		Ok(())
	}

	/// Apply the resume rule against a loaded checkpoint: start from
	/// `max(configured start, checkpoint + 1)`. A checkpoint from a
	/// different network refuses to resume; a different source mode
	/// only warns.
	pub fn resume_start(
		configured_start: LedgerSequence,
		network: &NetworkId,
		source_mode: &str,
		checkpoint: Option<&Checkpoint>,
	) -> Result<LedgerSequence, CheckpointError> {
		let Some(checkpoint) = checkpoint else {
			return Ok(configured_start);
		};
		if &checkpoint.network != network {
			return Err(CheckpointError::NetworkMismatch {
				checkpoint: checkpoint.network.clone(),
				configured: network.clone(),
			});
		}
		if checkpoint.source_mode != source_mode {
			warn!(
				checkpoint_mode = %checkpoint.source_mode,
				configured_mode = %source_mode,
				"Resuming a checkpoint recorded under a different source mode"
			);
		}
		let resumed = checkpoint.last_committed_ledger.next().max(configured_start);
		info!(
			%resumed,
			checkpointed = %checkpoint.last_committed_ledger,
			"Resuming from checkpoint"
		);
		Ok(resumed)
	}
}
