use std::{collections::HashMap, path::PathBuf, time::Duration};

use common::{EventFilter, NetworkId};
use ledger_source::{backend::BackendConfig, BackendKind};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("Required environment variable {0} is not set")]
	Missing(&'static str),

	#[error("{variable} is not valid: {reason}")]
	Invalid { variable: &'static str, reason: String },

	#[error("START_LEDGER {start} is after END_LEDGER {end}")]
	InvalidRange { start: u32, end: u32 },
}

/// Validated service configuration, read once from the environment at
/// startup. Anything contradictory or missing is fatal before any
/// task spawns.
#[derive(Debug, Clone)]
pub struct Config {
	pub backend: BackendKind,
	pub network: NetworkId,
	pub backend_config: BackendConfig,
	/// Chain off another service's raw-ledger stream instead of a
	/// local backend
	pub source_endpoint: Option<String>,

	pub start_ledger: u32,
	/// 0 = unbounded
	pub end_ledger: u32,

	pub batch_size: u32,
	pub worker_count: usize,
	pub flush_interval: Duration,
	pub channel_buffer_size: usize,

	pub checkpoint_dir: PathBuf,
	pub checkpoint_file: String,

	pub control_plane_enabled: bool,
	pub control_plane_endpoint: Option<String>,
	pub heartbeat_interval: Duration,

	pub health_port: u16,
	pub port: u16,

	pub filters: EventFilter,

	/// Object-store kind behind the archive mount; informational, the
	/// adapter always reads the mounted filesystem path
	pub archive_storage_type: Option<String>,
	pub archive_bucket: Option<String>,

	/// Set to enable the lake sink; columnar files land under here
	pub lake_dir: Option<PathBuf>,
	/// Postgres catalog; in-memory when unset
	pub database_url: Option<String>,
	pub dataset_prefix: String,
	/// Sequencer behavior for failed batches: `retry` or `skip`
	pub gap_policy: String,
}

fn var(name: &'static str) -> Option<String> {
	std::env::var(name).ok().filter(|s| !s.trim().is_empty())
}

fn parse_var<T: std::str::FromStr>(
	name: &'static str,
	default: T,
) -> Result<T, ConfigError>
where
	T::Err: std::fmt::Display,
{
	match var(name) {
		Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
			variable: name,
			reason: e.to_string(),
		}),
		None => Ok(default),
	}
}

impl Config {
	pub fn from_env() -> Result<Config, ConfigError> {
		// A chained deployment reads from an upstream service and
		// needs no backend of its own
		let source_endpoint = var("SOURCE_ENDPOINT");
		let backend: BackendKind = match var("BACKEND_TYPE") {
			Some(raw) => raw.parse().map_err(
				|e: ledger_source::backend::ParseBackendKindError| ConfigError::Invalid {
					variable: "BACKEND_TYPE",
					reason: e.to_string(),
				},
			)?,
			None if source_endpoint.is_some() => BackendKind::Rpc,
			None => return Err(ConfigError::Missing("BACKEND_TYPE")),
		};
		let network = NetworkId::new(
			var("NETWORK_PASSPHRASE").ok_or(ConfigError::Missing("NETWORK_PASSPHRASE"))?,
		);

		let start_ledger = parse_var("START_LEDGER", 0u32)?;
		let end_ledger = parse_var("END_LEDGER", 0u32)?;
		if end_ledger != 0 && start_ledger > end_ledger {
			return Err(ConfigError::InvalidRange { start: start_ledger, end: end_ledger });
		}

		let mut rpc_custom_headers = HashMap::new();
		if let Some(raw) = var("RPC_CUSTOM_HEADERS") {
			// name=value pairs, comma separated
			for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
				let Some((name, value)) = pair.split_once('=') else {
					return Err(ConfigError::Invalid {
						variable: "RPC_CUSTOM_HEADERS",
						reason: format!("'{pair}' is not name=value"),
					});
				};
				rpc_custom_headers.insert(name.trim().to_owned(), value.trim().to_owned());
			}
		}

		let backend_config = BackendConfig {
			network: Some(network.clone()),
			rpc_endpoint: var("RPC_ENDPOINT"),
			rpc_auth_header: var("RPC_AUTH_HEADER"),
			rpc_custom_headers,
			archive_path: var("ARCHIVE_PATH").map(PathBuf::from),
			captive_command: var("CAPTIVE_COMMAND"),
			captive_args: var("CAPTIVE_ARGS")
				.map(|raw| raw.split_whitespace().map(str::to_owned).collect())
				.unwrap_or_default(),
		};
		if source_endpoint.is_none() {
			match backend {
				BackendKind::Rpc if backend_config.rpc_endpoint.is_none() => {
					return Err(ConfigError::Missing("RPC_ENDPOINT"));
				},
				BackendKind::Archive if backend_config.archive_path.is_none() => {
					return Err(ConfigError::Missing("ARCHIVE_PATH"));
				},
				BackendKind::Captive if backend_config.captive_command.is_none() => {
					return Err(ConfigError::Missing("CAPTIVE_COMMAND"));
				},
				_ => {},
			}
		}

		let filters = EventFilter::from_csv(
			var("FILTER_CONTRACT_IDS").as_deref(),
			var("FILTER_EVENT_TYPES").as_deref(),
			parse_var("INCLUDE_FAILED", false)?,
		)
		.map_err(|e| ConfigError::Invalid {
			variable: "FILTER_EVENT_TYPES",
			reason: e.to_string(),
		})?;

		let batch_size = parse_var("BATCH_SIZE", 100u32)?;
		if batch_size == 0 {
			return Err(ConfigError::Invalid {
				variable: "BATCH_SIZE",
				reason: "must be positive".into(),
			});
		}

		let gap_policy = var("GAP_POLICY").unwrap_or_else(|| "retry".to_owned());
		if gap_policy != "retry" && gap_policy != "skip" {
			return Err(ConfigError::Invalid {
				variable: "GAP_POLICY",
				reason: format!("'{gap_policy}' is neither 'retry' nor 'skip'"),
			});
		}

		Ok(Config {
			backend,
			network,
			backend_config,
			source_endpoint,
			start_ledger,
			end_ledger,
			batch_size,
			worker_count: parse_var("WORKER_COUNT", 4usize)?,
			flush_interval: Duration::from_secs(parse_var("FLUSH_INTERVAL", 60u64)?),
			channel_buffer_size: parse_var("CHANNEL_BUFFER_SIZE", 100usize)?,
			checkpoint_dir: PathBuf::from(
				var("CHECKPOINT_DIR").unwrap_or_else(|| "./state".to_owned()),
			),
			checkpoint_file: var("CHECKPOINT_FILE")
				.unwrap_or_else(|| "checkpoint.json".to_owned()),
			control_plane_enabled: parse_var("ENABLE_CONTROL_PLANE", false)?,
			control_plane_endpoint: var("CONTROL_PLANE_ENDPOINT"),
			heartbeat_interval: Duration::from_secs(parse_var("HEARTBEAT_INTERVAL", 10u64)?),
			health_port: parse_var("HEALTH_PORT", 8088u16)?,
			port: parse_var("PORT", 50051u16)?,
			filters,
			archive_storage_type: var("ARCHIVE_STORAGE_TYPE"),
			archive_bucket: var("ARCHIVE_BUCKET_NAME"),
			lake_dir: var("LAKE_DIR").map(PathBuf::from),
			database_url: var("DATABASE_URL"),
			dataset_prefix: var("DATASET_PREFIX").unwrap_or_else(|| "core".to_owned()),
			gap_policy,
		})
	}

	pub fn source_mode(&self) -> String {
		self.backend.to_string()
	}

	pub fn bounded(&self) -> bool {
		self.end_ledger != 0
	}
}
