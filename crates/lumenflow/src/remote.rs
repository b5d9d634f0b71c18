use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use common::{LedgerSequence, NetworkId, RawLedger};
use ledger_source::backend::{BackendError, BackendKind, LedgerBackend};
use lumenflow_protocol::v1::{
	raw_ledger_stream_client::RawLedgerStreamClient, RawLedgerFrame, StreamLedgersRequest,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

struct Subscription {
	next: LedgerSequence,
	stream: tonic::Streaming<RawLedgerFrame>,
}

/// Backend over another service's raw-ledger stream: processors chain
/// off a source service instead of owning a node or archive. A single
/// upstream subscription is kept as long as callers consume
/// sequentially; a seek re-subscribes.
pub struct RemoteSourceBackend {
	endpoint: String,
	network: NetworkId,
	subscription: Mutex<Option<Subscription>>,
	closed: Mutex<bool>,
}

impl RemoteSourceBackend {
	pub fn new(endpoint: impl Into<String>, network: NetworkId) -> Self {
		Self {
			endpoint: endpoint.into(),
			network,
			subscription: Mutex::new(None),
			closed: Mutex::new(false),
		}
	}

	async fn connect(
		&self,
	) -> Result<RawLedgerStreamClient<tonic::transport::Channel>, BackendError> {
		let channel = tonic::transport::Endpoint::from_shared(self.endpoint.clone())
			.map_err(|e| BackendError::Unavailable { reason: e.to_string() })?
			.connect_timeout(CONNECT_TIMEOUT)
			.connect()
			.await
			.map_err(|e| BackendError::Unavailable { reason: e.to_string() })?;
		Ok(RawLedgerStreamClient::new(channel))
	}

	async fn subscribe(&self, start: LedgerSequence) -> Result<Subscription, BackendError> {
		let mut client = self.connect().await?;
		let stream = client
			.stream_raw_ledgers(StreamLedgersRequest {
				start_ledger: start.value(),
				end_ledger: 0,
			})
			.await
			.map_err(map_status)?
			.into_inner();
		info!(%start, endpoint = %self.endpoint, "Subscribed to upstream ledger stream");
		Ok(Subscription { next: start, stream })
	}
}

fn map_status(status: tonic::Status) -> BackendError {
	match status.code() {
		tonic::Code::NotFound => {
			BackendError::NotFound { sequence: LedgerSequence::new(0) }
		},
		tonic::Code::DeadlineExceeded => BackendError::DeadlineExceeded,
		tonic::Code::ResourceExhausted => {
			BackendError::ResourceExhausted { reason: status.message().to_owned() }
		},
		tonic::Code::Unauthenticated => {
			BackendError::Unauthenticated { reason: status.message().to_owned() }
		},
		tonic::Code::DataLoss => BackendError::CorruptFrame {
			sequence: LedgerSequence::new(0),
			reason: status.message().to_owned(),
		},
		_ => BackendError::Unavailable { reason: status.to_string() },
	}
}

#[async_trait]
impl LedgerBackend for RemoteSourceBackend {
	#[instrument(skip(self))]
	async fn prepare(
		&self,
		start: LedgerSequence,
		_end: Option<LedgerSequence>,
	) -> Result<(), BackendError> {
		let subscription = self.subscribe(start).await?;
		*self.subscription.lock().await = Some(subscription);
		Ok(())
	}

	async fn get(&self, sequence: LedgerSequence) -> Result<RawLedger, BackendError> {
		if *self.closed.lock().await {
			return Err(BackendError::Closed);
		}
		let mut guard = self.subscription.lock().await;
		let needs_seek = match guard.as_ref() {
			Some(subscription) => subscription.next != sequence,
			None => true,
		};
		if needs_seek {
			debug!(%sequence, "Seeking upstream subscription");
			*guard = Some(self.subscribe(sequence).await?);
		}
		let subscription = guard.as_mut().ok_or(BackendError::Closed)?;

		let frame = subscription
			.stream
			.message()
			.await
			.map_err(map_status)?
			.ok_or(BackendError::ConnectionReset)?;
		if frame.sequence != sequence.value() {
			return Err(BackendError::CorruptFrame {
				sequence,
				reason: format!("upstream sent {} out of order", frame.sequence),
			});
		}
		subscription.next = sequence.next();
		let ledger = RawLedger::from(frame);
		if ledger.network != self.network {
			return Err(BackendError::Unavailable {
				reason: format!(
					"upstream serves network '{}', configured for '{}'",
					ledger.network, self.network
				),
			});
		}
		Ok(ledger)
	}

	async fn latest_ledger(&self) -> Result<LedgerSequence, BackendError> {
		// The streaming surface has no head probe; lag is tracked from
		// frame close times instead
		Err(BackendError::Unavailable {
			reason: "upstream stream exposes no head probe".into(),
		})
	}

	async fn close(&self) {
		*self.closed.lock().await = true;
		self.subscription.lock().await.take();
	}

	fn kind(&self) -> BackendKind {
		BackendKind::Rpc
	}
}

#[cfg(test)]
mod test {
	use std::sync::Arc;

	use super::*;
	use crate::server::{BackendFactory, RawLedgerService};
	use ledger_source::InMemoryBackend;
	use lumenflow_protocol::v1::raw_ledger_stream_server::RawLedgerStreamServer;

	fn network() -> NetworkId {
		NetworkId::new("Test SDF Network ; September 2015")
	}

	/// A chained deployment: this service consumes another lumenflow
	/// instance's raw stream
	#[tokio::test]
	async fn consumes_an_upstream_raw_ledger_service() {
		let upstream_network = network();
		let factory: BackendFactory = Arc::new(move || {
			Ok(Arc::new(InMemoryBackend::with_range(upstream_network.clone(), 100, 200))
				as Arc<dyn ledger_source::LedgerBackend>)
		});
		let port = portpicker::pick_unused_port().unwrap();
		let addr = format!("127.0.0.1:{port}").parse().unwrap();
		let server = tokio::spawn(
			tonic::transport::Server::builder()
				.add_service(RawLedgerStreamServer::new(RawLedgerService::new(factory, 10)))
				.serve(addr),
		);
		tokio::time::sleep(Duration::from_millis(100)).await;

		let backend =
			RemoteSourceBackend::new(format!("http://127.0.0.1:{port}"), network());
		backend.prepare(LedgerSequence::new(100), None).await.unwrap();
		for seq in 100..105 {
			let ledger = backend.get(LedgerSequence::new(seq)).await.unwrap();
			assert_eq!(ledger.sequence.value(), seq);
		}

		// Seek re-subscribes
		let ledger = backend.get(LedgerSequence::new(150)).await.unwrap();
		assert_eq!(ledger.sequence.value(), 150);

		backend.close().await;
		server.abort();
	}
}
