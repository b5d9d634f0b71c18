use std::{pin::Pin, sync::Arc};

use futures::{Stream, StreamExt};
use tonic::{Request, Response, Status};
use tracing::{info, instrument, warn};

use common::{EventFilter, NetworkId};
use extractor::Extractor;
use ledger_source::{
	backend::{BackendError, LedgerBackend},
	source::{SourceConfig, SourceError},
	LedgerSource,
};
use lumenflow_protocol::v1::{
	event_stream_server::EventStream, raw_ledger_stream_server::RawLedgerStream,
	EventFrame, RawLedgerFrame, StreamEventsRequest, StreamLedgersRequest,
};

/// Builds a fresh backend per consumer: no cross-consumer state, and
/// cancelling one stream releases exactly its own resources
pub type BackendFactory =
	Arc<dyn Fn() -> Result<Arc<dyn LedgerBackend>, BackendError> + Send + Sync>;

pub fn status_from_backend(error: &BackendError) -> Status {
	match error {
		BackendError::NotYetAvailable { .. } | BackendError::Unavailable { .. } => {
			Status::unavailable(error.to_string())
		},
		BackendError::DeadlineExceeded => Status::deadline_exceeded(error.to_string()),
		BackendError::ConnectionReset => Status::unavailable(error.to_string()),
		BackendError::ResourceExhausted { .. } => {
			Status::resource_exhausted(error.to_string())
		},
		BackendError::Unauthenticated { .. } => Status::unauthenticated(error.to_string()),
		BackendError::NotFound { .. } => Status::not_found(error.to_string()),
		BackendError::CorruptFrame { .. } => Status::data_loss(error.to_string()),
		BackendError::Closed => Status::cancelled(error.to_string()),
		BackendError::Io(_) => Status::internal(error.to_string()),
	}
}

pub fn status_from_source(error: &SourceError) -> Status {
	match error {
		SourceError::Backend(backend) => status_from_backend(backend),
		SourceError::Discontinuity { .. } => Status::data_loss(error.to_string()),
		SourceError::InvalidRange { .. } => Status::invalid_argument(error.to_string()),
	}
}

fn validate_range(start: u32, end: u32) -> Result<(), Status> {
	if end != 0 && start > end {
		return Err(Status::invalid_argument(format!(
			"start_ledger {start} is after end_ledger {end}"
		)));
	}
	Ok(())
}

fn source_config(start: u32, end: u32, buffer_size: usize) -> SourceConfig {
	SourceConfig {
		start: start.into(),
		end: if end == 0 { None } else { Some(end.into()) },
		buffer_size,
		retry: Default::default(),
		breaker: Default::default(),
	}
}

/// C2's push surface: raw ledger frames over gRPC, one source chain
/// per consumer
pub struct RawLedgerService {
	factory: BackendFactory,
	buffer_size: usize,
}

impl RawLedgerService {
	pub fn new(factory: BackendFactory, buffer_size: usize) -> Self {
		Self { factory, buffer_size }
	}
}

#[tonic::async_trait]
impl RawLedgerStream for RawLedgerService {
	type StreamRawLedgersStream =
		Pin<Box<dyn Stream<Item = Result<RawLedgerFrame, Status>> + Send>>;

	#[instrument(skip(self, request))]
	async fn stream_raw_ledgers(
		&self,
		request: Request<StreamLedgersRequest>,
	) -> Result<Response<Self::StreamRawLedgersStream>, Status> {
		let request = request.into_inner();
		validate_range(request.start_ledger, request.end_ledger)?;

		let backend = (self.factory)().map_err(|e| status_from_backend(&e))?;
		let config =
			source_config(request.start_ledger, request.end_ledger, self.buffer_size);
		let source = LedgerSource::new(backend, config)
			.map_err(|e| status_from_source(&e))?;
		source.prepare().await.map_err(|e| status_from_source(&e))?;

		info!(
			start = request.start_ledger,
			end = request.end_ledger,
			"Raw ledger consumer connected"
		);
		let stream = source.stream().map(|item| match item {
			Ok(ledger) => Ok(RawLedgerFrame::from(&ledger)),
			Err(e) => Err(status_from_source(&e)),
		});
		Ok(Response::new(Box::pin(stream)))
	}
}

/// C3/C4 output surface: decoded, filtered events with strictly
/// monotonic cursors
pub struct EventService {
	factory: BackendFactory,
	network: NetworkId,
	default_filter: EventFilter,
	buffer_size: usize,
}

impl EventService {
	pub fn new(
		factory: BackendFactory,
		network: NetworkId,
		default_filter: EventFilter,
		buffer_size: usize,
	) -> Self {
		Self { factory, network, default_filter, buffer_size }
	}
}

#[tonic::async_trait]
impl EventStream for EventService {
	type StreamEventsStream =
		Pin<Box<dyn Stream<Item = Result<EventFrame, Status>> + Send>>;

	#[instrument(skip(self, request))]
	async fn stream_events(
		&self,
		request: Request<StreamEventsRequest>,
	) -> Result<Response<Self::StreamEventsStream>, Status> {
		let request = request.into_inner();
		validate_range(request.start_ledger, request.end_ledger)?;

		// Per-request filters override the service defaults entirely
		let filter = match &request.filters {
			Some(wire) => EventFilter::try_from(wire)
				.map_err(|e| Status::invalid_argument(e.to_string()))?,
			None => self.default_filter.clone(),
		};

		let backend = (self.factory)().map_err(|e| status_from_backend(&e))?;
		let config =
			source_config(request.start_ledger, request.end_ledger, self.buffer_size);
		let source = LedgerSource::new(backend, config)
			.map_err(|e| status_from_source(&e))?;
		source.prepare().await.map_err(|e| status_from_source(&e))?;

		let extractor = Extractor::new(self.network.clone());
		info!(
			start = request.start_ledger,
			end = request.end_ledger,
			"Event consumer connected"
		);

		let mut ledgers = source.stream();
		let stream = async_stream::try_stream! {
			while let Some(item) = ledgers.next().await {
				let ledger = item.map_err(|e| status_from_source(&e))?;
				let sequence = ledger.sequence;
				let (events, dropped) = extractor
					.extract_filtered(&ledger, &filter)
					.map_err(|e| {
						warn!(%sequence, error = %e, "Extraction failed, closing stream");
						Status::data_loss(e.to_string())
					})?;
				metrics::counter!("events_filtered_total", dropped as u64);
				for event in &events {
					metrics::counter!("events_emitted_total", 1);
					yield EventFrame::from(event);
				}
			}
		};
		Ok(Response::new(Box::pin(stream)))
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use ledger_source::InMemoryBackend;

	fn network() -> NetworkId {
		NetworkId::new("Test SDF Network ; September 2015")
	}

	fn factory() -> BackendFactory {
		let network = network();
		Arc::new(move || {
			Ok(Arc::new(InMemoryBackend::with_range(network.clone(), 100, 200))
				as Arc<dyn LedgerBackend>)
		})
	}

	#[tokio::test]
	async fn rejects_inverted_range() {
		let service = RawLedgerService::new(factory(), 10);
		let status = service
			.stream_raw_ledgers(Request::new(StreamLedgersRequest {
				start_ledger: 200,
				end_ledger: 100,
			}))
			.await
			.err().unwrap();
		assert_eq!(status.code(), tonic::Code::InvalidArgument);
	}

	#[tokio::test]
	async fn rejects_range_outside_retention() {
		let service = RawLedgerService::new(factory(), 10);
		let status = service
			.stream_raw_ledgers(Request::new(StreamLedgersRequest {
				start_ledger: 10,
				end_ledger: 20,
			}))
			.await
			.err().unwrap();
		assert_eq!(status.code(), tonic::Code::NotFound);
	}

	#[tokio::test]
	async fn single_ledger_raw_stream() {
		let service = RawLedgerService::new(factory(), 10);
		let response = service
			.stream_raw_ledgers(Request::new(StreamLedgersRequest {
				start_ledger: 150,
				end_ledger: 150,
			}))
			.await
			.unwrap();
		let frames: Vec<_> = response.into_inner().collect().await;
		assert_eq!(frames.len(), 1);
		assert_eq!(frames[0].as_ref().unwrap().sequence, 150);
	}

	#[tokio::test]
	async fn bounded_raw_stream_is_ordered_and_closes() {
		let service = RawLedgerService::new(factory(), 10);
		let response = service
			.stream_raw_ledgers(Request::new(StreamLedgersRequest {
				start_ledger: 100,
				end_ledger: 109,
			}))
			.await
			.unwrap();
		let sequences: Vec<u32> = response
			.into_inner()
			.map(|f| f.unwrap().sequence)
			.collect()
			.await;
		assert_eq!(sequences, (100..=109).collect::<Vec<_>>());
	}

	#[tokio::test]
	async fn event_stream_rejects_bad_filter() {
		let service = EventService::new(
			factory(),
			network(),
			EventFilter::default(),
			10,
		);
		let status = service
			.stream_events(Request::new(StreamEventsRequest {
				start_ledger: 100,
				end_ledger: 100,
				filters: Some(lumenflow_protocol::v1::EventFilters {
					event_types: vec!["bogus".into()],
					..Default::default()
				}),
			}))
			.await
			.err().unwrap();
		assert_eq!(status.code(), tonic::Code::InvalidArgument);
	}

	#[tokio::test]
	async fn event_stream_surfaces_decode_failure_as_data_loss() {
		// In-memory frames are not valid XDR
		let service = EventService::new(
			factory(),
			network(),
			EventFilter::default(),
			10,
		);
		let response = service
			.stream_events(Request::new(StreamEventsRequest {
				start_ledger: 100,
				end_ledger: 100,
				filters: None,
			}))
			.await
			.unwrap();
		let items: Vec<_> = response.into_inner().collect().await;
		assert_eq!(items.len(), 1);
		assert_eq!(items[0].as_ref().unwrap_err().code(), tonic::Code::DataLoss);
	}
}
