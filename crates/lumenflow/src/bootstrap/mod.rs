mod cli;
pub mod config;

use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::watch;
use tracing::{error, info, warn};

use common::LedgerSequence;
use control_plane::{ControlPlane, ControlPlaneConfig, ServiceKind};
use lake::{
	Catalog, Era, EraStatus, Flusher, LocalPartitionStore, MemoryCatalog,
};
use ledger_source::{
	archive::ArchiveBackend, backend::LedgerBackend, captive::CaptiveBackend,
	rpc::RpcBackend, BackendError, BackendKind,
};
use lumenflow_protocol::v1::{
	event_stream_server::EventStreamServer,
	raw_ledger_stream_server::RawLedgerStreamServer,
};
use pipeline::{CheckpointStore, GapPolicy};
use resolver::Resolver;

pub use cli::Cli;
pub use config::{Config, ConfigError};

use crate::{
	driver::{run_pipeline, DriverConfig},
	health::{spawn_health_server, HealthState},
	server::{BackendFactory, EventService, RawLedgerService},
	sink::LakeSink,
};

type DynCatalog = Arc<dyn Catalog>;

/// Process entry point behind `main`. Exit codes: 0 on a clean run,
/// 1 on a runtime failure, 2 on startup configuration errors.
pub async fn run(cli: Cli) -> i32 {
	match cli.console_logging.parse() {
		Ok(console) => lumenflow_telemetry::telemetry(console),
		Err(e) => {
			eprintln!("{e}");
			return 2;
		},
	}

	let config = match Config::from_env() {
		Ok(config) => config,
		Err(e) => {
			eprintln!("Configuration error: {e}");
			return 2;
		},
	};

	match serve(config).await {
		Ok(code) => code,
		Err(e) => {
			error!(error = %e, "Service failed");
			1
		},
	}
}

pub fn build_backend(config: &Config) -> Result<Arc<dyn LedgerBackend>, BackendError> {
	if let Some(endpoint) = &config.source_endpoint {
		return Ok(Arc::new(crate::remote::RemoteSourceBackend::new(
			endpoint.clone(),
			config.network.clone(),
		)));
	}
	Ok(match config.backend {
		BackendKind::Rpc => Arc::new(RpcBackend::new(&config.backend_config)?),
		BackendKind::Archive => {
			let path = config.backend_config.archive_path.clone().ok_or(
				BackendError::Unavailable { reason: "ARCHIVE_PATH is not set".into() },
			)?;
			Arc::new(ArchiveBackend::new(path, config.network.clone()))
		},
		BackendKind::Captive => Arc::new(CaptiveBackend::new(&config.backend_config)?),
		BackendKind::InMemory => {
			return Err(BackendError::Unavailable {
				reason: "in-memory backend is test-only".into(),
			});
		},
	})
}

async fn serve(config: Config) -> anyhow::Result<i32> {
	let prometheus = PrometheusBuilder::new().install_recorder()?;
	let health = HealthState::new();
	let health_server =
		spawn_health_server(config.health_port, health.clone(), prometheus);

	// Every consumer of the streaming surfaces gets its own adapter
	let factory: BackendFactory = {
		let config = config.clone();
		Arc::new(move || build_backend(&config))
	};
	let raw_service =
		RawLedgerService::new(factory.clone(), config.channel_buffer_size);
	let event_service = EventService::new(
		factory.clone(),
		config.network.clone(),
		config.filters.clone(),
		config.channel_buffer_size,
	);

	let (shutdown_tx, shutdown_rx) = watch::channel(false);
	let grpc_addr = format!("0.0.0.0:{}", config.port).parse()?;
	let mut grpc_shutdown = shutdown_rx.clone();
	let grpc_server = tokio::spawn(
		tonic::transport::Server::builder()
			.add_service(RawLedgerStreamServer::new(raw_service))
			.add_service(EventStreamServer::new(event_service))
			.serve_with_shutdown(grpc_addr, async move {
				let _ = grpc_shutdown.changed().await;
			}),
	);
	info!(port = config.port, "Streaming RPC listening");

	let control_plane = ControlPlane::start(
		ControlPlaneConfig {
			enabled: config.control_plane_enabled,
			endpoint: config.control_plane_endpoint.clone(),
			heartbeat_interval: config.heartbeat_interval,
			service_kind: if config.lake_dir.is_some() {
				ServiceKind::Sink
			} else {
				ServiceKind::Source
			},
			input_event_types: vec!["raw_ledger".into()],
			output_event_types: vec!["domain_event".into()],
			health_endpoint: format!("http://localhost:{}/health", config.health_port),
			max_inflight: config.channel_buffer_size as u32,
			metadata: Default::default(),
		},
		{
			let health = health.clone();
			Arc::new(move || health.metrics_map())
		},
	)
	.await;
	info!(service_id = %control_plane.service_id(), "Control plane attached");

	// The lake pipeline runs only when a destination is configured;
	// pure streaming deployments skip it
	let pipeline_task = if config.lake_dir.is_some() {
		let backend = build_backend(&config)?;
		Some(tokio::spawn(run_lake_pipeline(
			config.clone(),
			backend,
			health.clone(),
			shutdown_rx.clone(),
		)))
	} else {
		None
	};

	let exit_code = match pipeline_task {
		Some(mut task) => {
			let result = tokio::select! {
				result = &mut task => result,
				_ = tokio::signal::ctrl_c() => {
					info!("Interrupt received, draining pipeline");
					let _ = shutdown_tx.send(true);
					task.await
				},
			};
			match result {
				Ok(Ok(summary)) => {
					info!(
						committed = summary.committed_batches,
						last = ?summary.last_committed,
						"Pipeline complete"
					);
					0
				},
				Ok(Err(e)) => {
					health.set_unhealthy(&e);
					error!(error = %e, "Pipeline failed");
					1
				},
				Err(e) => {
					error!(error = %e, "Pipeline task panicked");
					1
				},
			}
		},
		None => {
			let _ = tokio::signal::ctrl_c().await;
			info!("Interrupt received, shutting down");
			0
		},
	};

	let _ = shutdown_tx.send(true);
	control_plane.stop().await;
	let _ = grpc_server.await;
	health_server.abort();
	Ok(exit_code)
}

async fn run_lake_pipeline(
	config: Config,
	backend: Arc<dyn LedgerBackend>,
	health: Arc<HealthState>,
	shutdown: watch::Receiver<bool>,
) -> Result<crate::driver::DriverSummary, anyhow::Error> {
	let catalog: DynCatalog = match &config.database_url {
		Some(url) => Arc::new(lake::pg::PgCatalog::new(url)?),
		None => {
			warn!("DATABASE_URL not set, using the in-memory catalog");
			Arc::new(MemoryCatalog::new())
		},
	};
	let era = ensure_open_era(&catalog, &config).await?;
	let lake_dir = config
		.lake_dir
		.clone()
		.ok_or_else(|| anyhow::anyhow!("lake pipeline requires LAKE_DIR"))?;
	let store = Arc::new(LocalPartitionStore::new(lake_dir));
	let resolver = Arc::new(Resolver::new(Arc::new(catalog.clone())));
	let flusher = Flusher::new(
		Arc::new(catalog.clone()),
		store,
		era.clone(),
		config.dataset_prefix.clone(),
		lake::FlushPolicy {
			flush_interval: config.flush_interval,
			..Default::default()
		},
	);
	let sink = Arc::new(LakeSink::new(
		flusher,
		Some(resolver),
		era.era_id.clone(),
		config.dataset_prefix.clone(),
		health.clone(),
	));

	let gap_policy = match config.gap_policy.as_str() {
		"skip" => GapPolicy::Skip,
		_ => GapPolicy::Retry { max_attempts: 3 },
	};
	let summary = run_pipeline(
		backend,
		config.network.clone(),
		config.filters.clone(),
		sink,
		CheckpointStore::new(&config.checkpoint_dir, &config.checkpoint_file),
		DriverConfig {
			start_ledger: config.start_ledger,
			end_ledger: config.end_ledger,
			batch_size: config.batch_size,
			worker_count: config.worker_count,
			buffer_size: config.channel_buffer_size,
			flush_interval: config.flush_interval,
			gap_policy,
			source_mode: config.source_mode(),
		},
		health,
		shutdown,
	)
	.await?;
	Ok(summary)
}

/// Era transitions are operator actions; an empty catalog gets a
/// bootstrap era so a fresh deployment can ingest immediately
async fn ensure_open_era(catalog: &DynCatalog, config: &Config) -> anyhow::Result<Era> {
	let eras = catalog.list_eras(&config.network).await?;
	if let Some(open) = eras.iter().find(|e| e.status == EraStatus::Open) {
		return Ok(open.clone());
	}
	if !eras.is_empty() {
		anyhow::bail!("no open era on network '{}'; seal/open is an operator action", config.network);
	}
	let era = Era {
		era_id: "genesis".into(),
		version_label: "v1".into(),
		network: config.network.clone(),
		ledger_start: LedgerSequence::new(0),
		ledger_end: None,
		status: EraStatus::Open,
	};
	info!(era = %era.era_id, "Opening bootstrap era");
	catalog.open_era(era.clone()).await?;
	Ok(era)
}
