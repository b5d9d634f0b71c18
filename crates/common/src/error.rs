use crate::ledger::LedgerSequence;

/// Pipeline stage an error surfaced from, carried on every reported
/// error for operator context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
	Backend,
	Source,
	Extract,
	Filter,
	Sequence,
	Checkpoint,
	Flush,
	Resolve,
	ControlPlane,
	Serve,
}

impl std::fmt::Display for Stage {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let s = match self {
			Stage::Backend => "backend",
			Stage::Source => "source",
			Stage::Extract => "extract",
			Stage::Filter => "filter",
			Stage::Sequence => "sequence",
			Stage::Checkpoint => "checkpoint",
			Stage::Flush => "flush",
			Stage::Resolve => "resolve",
			Stage::ControlPlane => "control_plane",
			Stage::Serve => "serve",
		};
		f.write_str(s)
	}
}

/// Error taxonomy shared across the pipeline. Transient errors are
/// handled inside the owning component and never cross a crate
/// boundary; everything here is already past local retry.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
	#[error("Configuration: {reason}")]
	Config { reason: String },

	#[error("Upstream at {stage}: {cause}")]
	Upstream {
		stage: Stage,
		#[source]
		cause: Box<dyn std::error::Error + Send + Sync>,
	},

	#[error("Data fault at {stage}, ledger {ledger_sequence}: {cause}")]
	Data {
		stage: Stage,
		ledger_sequence: LedgerSequence,
		#[source]
		cause: Box<dyn std::error::Error + Send + Sync>,
	},

	#[error("Internal fault at {stage}: {cause}")]
	Internal {
		stage: Stage,
		#[source]
		cause: Box<dyn std::error::Error + Send + Sync>,
	},
}

impl PipelineError {
	pub fn config(reason: impl Into<String>) -> Self {
		PipelineError::Config { reason: reason.into() }
	}

	pub fn upstream(
		stage: Stage,
		cause: impl std::error::Error + Send + Sync + 'static,
	) -> Self {
		PipelineError::Upstream { stage, cause: Box::new(cause) }
	}

	pub fn data(
		stage: Stage,
		ledger_sequence: impl Into<LedgerSequence>,
		cause: impl std::error::Error + Send + Sync + 'static,
	) -> Self {
		PipelineError::Data {
			stage,
			ledger_sequence: ledger_sequence.into(),
			cause: Box::new(cause),
		}
	}

	pub fn internal(
		stage: Stage,
		cause: impl std::error::Error + Send + Sync + 'static,
	) -> Self {
		PipelineError::Internal { stage, cause: Box::new(cause) }
	}

	pub fn ledger_sequence(&self) -> Option<LedgerSequence> {
		match self {
			PipelineError::Data { ledger_sequence, .. } => Some(*ledger_sequence),
			_ => None,
		}
	}
}
