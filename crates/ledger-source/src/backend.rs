use std::collections::HashMap;

use async_trait::async_trait;
use common::{LedgerSequence, NetworkId, RawLedger};

/// Which transport a service draws raw ledgers from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendKind {
	Captive,
	Rpc,
	Archive,
	InMemory,
}

impl std::fmt::Display for BackendKind {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			BackendKind::Captive => f.write_str("CAPTIVE"),
			BackendKind::Rpc => f.write_str("RPC"),
			BackendKind::Archive => f.write_str("ARCHIVE"),
			BackendKind::InMemory => f.write_str("IN_MEMORY"),
		}
	}
}

#[derive(Debug, thiserror::Error)]
#[error("Unrecognized backend type: {0}")]
pub struct ParseBackendKindError(String);

impl std::str::FromStr for BackendKind {
	type Err = ParseBackendKindError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_uppercase().as_str() {
			"CAPTIVE" => Ok(BackendKind::Captive),
			"RPC" => Ok(BackendKind::Rpc),
			"ARCHIVE" => Ok(BackendKind::Archive),
			other => Err(ParseBackendKindError(other.to_owned())),
		}
	}
}

/// Transport level settings shared by the concrete adapters
#[derive(Debug, Clone, Default)]
pub struct BackendConfig {
	pub network: Option<NetworkId>,
	pub rpc_endpoint: Option<String>,
	pub rpc_auth_header: Option<String>,
	pub rpc_custom_headers: HashMap<String, String>,
	pub archive_path: Option<std::path::PathBuf>,
	pub captive_command: Option<String>,
	pub captive_args: Vec<String>,
}

/// Failure model for adapter calls. `NotYetAvailable` marks the chain
/// head; callers poll with bounded delay. Everything else is permanent
/// from the adapter's point of view, though some kinds are retryable
/// by the caller's retry manager.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
	#[error("Ledger {sequence} not yet closed")]
	NotYetAvailable { sequence: LedgerSequence },

	#[error("Backend unavailable: {reason}")]
	Unavailable { reason: String },

	#[error("Deadline exceeded waiting on backend")]
	DeadlineExceeded,

	#[error("Connection reset by backend")]
	ConnectionReset,

	#[error("Backend resource exhausted: {reason}")]
	ResourceExhausted { reason: String },

	#[error("Authentication rejected: {reason}")]
	Unauthenticated { reason: String },

	#[error("Ledger {sequence} outside retention window")]
	NotFound { sequence: LedgerSequence },

	#[error("Corrupt ledger frame at {sequence}: {reason}")]
	CorruptFrame { sequence: LedgerSequence, reason: String },

	#[error("Backend closed")]
	Closed,

	#[error("Backend I/O: {0}")]
	Io(
		#[from]
		#[source]
		std::io::Error,
	),
}

impl BackendError {
	/// Kinds the retry manager may loop on. Corrupt frames, missing
	/// ranges and auth failures surface immediately.
	pub fn is_retryable(&self) -> bool {
		matches!(
			self,
			BackendError::NotYetAvailable { .. }
				| BackendError::Unavailable { .. }
				| BackendError::DeadlineExceeded
				| BackendError::ConnectionReset
				| BackendError::ResourceExhausted { .. }
		)
	}

	pub fn is_not_yet_available(&self) -> bool {
		matches!(self, BackendError::NotYetAvailable { .. })
	}
}

/// One adapter per backend kind. Adapters are passive: no internal
/// tasks beyond what the transport itself requires, and safe to close
/// mid-call. In-flight calls either error or return the value already
/// fetched.
#[async_trait]
pub trait LedgerBackend: Send + Sync {
	/// Warm caches and validate reachability for the range
	async fn prepare(
		&self,
		start: LedgerSequence,
		end: Option<LedgerSequence>,
	) -> Result<(), BackendError>;

	async fn get(&self, sequence: LedgerSequence) -> Result<RawLedger, BackendError>;

	/// Highest closed ledger known to the backend, used for lag and
	/// retention validation
	async fn latest_ledger(&self) -> Result<LedgerSequence, BackendError>;

	async fn close(&self);

	fn kind(&self) -> BackendKind;
}
