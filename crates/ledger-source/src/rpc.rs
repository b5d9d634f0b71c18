use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use chrono::{TimeZone, Utc};
use jsonrpsee_core::{client::ClientT, params::ObjectParams};
use jsonrpsee_http_client::{HeaderMap, HeaderValue, HttpClient, HttpClientBuilder};
use tracing::instrument;

use common::{LedgerSequence, NetworkId, RawLedger};

use crate::backend::{BackendConfig, BackendError, BackendKind, LedgerBackend};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LedgerEntry {
	sequence: u32,
	ledger_close_time: String,
	#[serde(default)]
	metadata_xdr: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetLedgersResponse {
	ledgers: Vec<LedgerEntry>,
	latest_ledger: u32,
	oldest_ledger: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetLatestLedgerResponse {
	sequence: u32,
}

/// JSON-RPC peer adapter. Authorization and custom headers come from
/// configuration and ride on every request.
#[derive(Debug)]
pub struct RpcBackend {
	client: HttpClient,
	network: NetworkId,
}

impl RpcBackend {
	pub fn new(config: &BackendConfig) -> Result<Self, BackendError> {
		let endpoint = config.rpc_endpoint.as_deref().ok_or(BackendError::Unavailable {
			reason: "RPC_ENDPOINT is not configured".into(),
		})?;
		let network = config.network.clone().ok_or(BackendError::Unavailable {
			reason: "NETWORK_PASSPHRASE is not configured".into(),
		})?;

		let mut headers = HeaderMap::new();
		if let Some(auth) = &config.rpc_auth_header {
			headers.insert("authorization", parse_header_value(auth)?);
		}
		for (name, value) in &config.rpc_custom_headers {
			let name = http::header::HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
				BackendError::Unavailable { reason: format!("invalid custom header name {name}") }
			})?;
			headers.insert(name, parse_header_value(value)?);
		}

		let client = HttpClientBuilder::default()
			.set_headers(headers)
			.request_timeout(REQUEST_TIMEOUT)
			.build(endpoint)
			.map_err(|e| BackendError::Unavailable { reason: e.to_string() })?;
		Ok(Self { client, network })
	}

	async fn get_ledgers(&self, start: LedgerSequence, limit: u32) -> Result<GetLedgersResponse, BackendError> {
		let mut params = ObjectParams::new();
		params
			.insert("startLedger", start.value())
			.map_err(|e| BackendError::Unavailable { reason: e.to_string() })?;
		params
			.insert("pagination", serde_json::json!({ "limit": limit }))
			.map_err(|e| BackendError::Unavailable { reason: e.to_string() })?;
		self.client
			.request("getLedgers", params)
			.await
			.map_err(map_rpc_error)
	}
}

fn parse_header_value(value: &str) -> Result<HeaderValue, BackendError> {
	HeaderValue::from_str(value).map_err(|_| BackendError::Unauthenticated {
		reason: "configured header value is not valid ASCII".into(),
	})
}

fn map_rpc_error(error: jsonrpsee_core::Error) -> BackendError {
	use jsonrpsee_core::Error;
	match error {
		Error::RequestTimeout => BackendError::DeadlineExceeded,
		Error::Transport(_) => BackendError::ConnectionReset,
		Error::Call(e) if e.code() == 429 => {
			BackendError::ResourceExhausted { reason: e.to_string() }
		},
		Error::Call(e) if e.code() == 401 || e.code() == 403 => {
			BackendError::Unauthenticated { reason: e.to_string() }
		},
		other => BackendError::Unavailable { reason: other.to_string() },
	}
}

fn parse_close_time(raw: &str) -> chrono::DateTime<Utc> {
	raw.parse::<i64>()
		.ok()
		.and_then(|secs| Utc.timestamp_opt(secs, 0).single())
		.unwrap_or_else(|| Utc.timestamp_opt(0, 0).unwrap())
}

#[async_trait]
impl LedgerBackend for RpcBackend {
	#[instrument(skip(self))]
	async fn prepare(
		&self,
		start: LedgerSequence,
		_end: Option<LedgerSequence>,
	) -> Result<(), BackendError> {
		let response = self.get_ledgers(start, 1).await;
		match response {
			Ok(r) if r.oldest_ledger > start.value() => {
				Err(BackendError::NotFound { sequence: start })
			},
			Ok(_) => Ok(()),
			// A start at the head is prepared, just not closed yet
			Err(BackendError::NotYetAvailable { .. }) => Ok(()),
			Err(e) => Err(e),
		}
	}

	async fn get(&self, sequence: LedgerSequence) -> Result<RawLedger, BackendError> {
		let response = self.get_ledgers(sequence, 1).await?;
		if sequence.value() < response.oldest_ledger {
			return Err(BackendError::NotFound { sequence });
		}
		if sequence.value() > response.latest_ledger {
			return Err(BackendError::NotYetAvailable { sequence });
		}
		let entry = response
			.ledgers
			.into_iter()
			.find(|l| l.sequence == sequence.value())
			.ok_or(BackendError::NotYetAvailable { sequence })?;
		let metadata = entry.metadata_xdr.ok_or_else(|| BackendError::CorruptFrame {
			sequence,
			reason: "peer returned no metadata".into(),
		})?;
		let bytes = base64::engine::general_purpose::STANDARD
			.decode(metadata.as_bytes())
			.map_err(|e| BackendError::CorruptFrame { sequence, reason: e.to_string() })?;
		Ok(RawLedger::new(
			sequence,
			bytes,
			self.network.clone(),
			parse_close_time(&entry.ledger_close_time),
		))
	}

	async fn latest_ledger(&self) -> Result<LedgerSequence, BackendError> {
		let response: GetLatestLedgerResponse = self
			.client
			.request("getLatestLedger", ObjectParams::new())
			.await
			.map_err(map_rpc_error)?;
		Ok(LedgerSequence::new(response.sequence))
	}

	async fn close(&self) {
		// HTTP transport holds no subscription state to tear down
	}

	fn kind(&self) -> BackendKind {
		BackendKind::Rpc
	}
}
