use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use lumenflow_protocol::control::{
	control_plane_client::ControlPlaneClient, HeartbeatRequest, RegisterRequest,
};

/// Control-plane calls are best effort and must never hold up the data
/// path, so every RPC gets a short deadline
const RPC_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
	Source,
	Processor,
	Sink,
}

impl ServiceKind {
	pub fn as_str(&self) -> &'static str {
		match self {
			ServiceKind::Source => "source",
			ServiceKind::Processor => "processor",
			ServiceKind::Sink => "sink",
		}
	}
}

#[derive(Debug, Clone)]
pub struct ControlPlaneConfig {
	pub enabled: bool,
	pub endpoint: Option<String>,
	pub heartbeat_interval: Duration,
	pub service_kind: ServiceKind,
	pub input_event_types: Vec<String>,
	pub output_event_types: Vec<String>,
	pub health_endpoint: String,
	pub max_inflight: u32,
	pub metadata: HashMap<String, String>,
}

impl Default for ControlPlaneConfig {
	fn default() -> Self {
		Self {
			enabled: false,
			endpoint: None,
			heartbeat_interval: Duration::from_secs(10),
			service_kind: ServiceKind::Processor,
			input_event_types: vec![],
			output_event_types: vec![],
			health_endpoint: String::new(),
			max_inflight: 0,
			metadata: HashMap::new(),
		}
	}
}

/// Snapshot-taking function handed in by the service; the sidecar
/// never reaches into service internals
pub type SnapshotFn = Arc<dyn Fn() -> HashMap<String, f64> + Send + Sync>;

/// Handle over the running sidecar. Registration failure downgrades to
/// a simulated id; heartbeats carry on regardless and local serving is
/// never blocked.
pub struct ControlPlane {
	service_id: String,
	shutdown: Option<watch::Sender<bool>>,
	heartbeats: Option<tokio::task::JoinHandle<u64>>,
}

impl ControlPlane {
	/// Disabled control plane: a service id exists for logs, nothing
	/// else happens
	pub fn disabled() -> Self {
		Self { service_id: simulated_id(), shutdown: None, heartbeats: None }
	}

	#[instrument(skip(config, snapshot), fields(endpoint = ?config.endpoint))]
	pub async fn start(config: ControlPlaneConfig, snapshot: SnapshotFn) -> Self {
		if !config.enabled {
			return Self::disabled();
		}
		let Some(endpoint) = config.endpoint.clone() else {
			warn!("Control plane enabled but no endpoint configured; running detached");
			return Self::disabled();
		};

		let service_id = match register(&endpoint, &config).await {
			Ok(id) => {
				info!(service_id = %id, "Registered with control plane");
				id
			},
			Err(e) => {
				let id = simulated_id();
				warn!(
					error = %e,
					simulated_id = %id,
					"Control-plane registration failed; continuing with simulated id"
				);
				id
			},
		};

		let (shutdown, mut shutdown_rx) = watch::channel(false);
		let heartbeat_id = service_id.clone();
		let interval = config.heartbeat_interval;
		let heartbeats = tokio::spawn(async move {
			let mut sequence: u64 = 0;
			let mut ticker = tokio::time::interval(interval);
			ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
			loop {
				tokio::select! {
					_ = ticker.tick() => {},
					_ = shutdown_rx.changed() => break,
				}
				sequence += 1;
				let request = HeartbeatRequest {
					service_id: heartbeat_id.clone(),
					sequence,
					metrics: snapshot(),
					sent_at_unix: chrono::Utc::now().timestamp(),
				};
				match heartbeat(&endpoint, request).await {
					Ok(_) => debug!(sequence, "Heartbeat acknowledged"),
					Err(e) => {
						// Missed heartbeats never block the main work
						debug!(sequence, error = %e, "Heartbeat missed");
					},
				}
			}
			sequence
		});

		Self { service_id, shutdown: Some(shutdown), heartbeats: Some(heartbeats) }
	}

	pub fn service_id(&self) -> &str {
		&self.service_id
	}

	pub fn is_simulated(&self) -> bool {
		self.service_id.starts_with("sim-")
	}

	/// Stop heartbeating; returns how many heartbeats were sent
	pub async fn stop(mut self) -> u64 {
		if let Some(shutdown) = self.shutdown.take() {
			let _ = shutdown.send(true);
		}
		match self.heartbeats.take() {
			Some(handle) => handle.await.unwrap_or(0),
			None => 0,
		}
	}
}

fn simulated_id() -> String {
	format!("sim-{}", Uuid::new_v4())
}

async fn connect(
	endpoint: &str,
) -> Result<ControlPlaneClient<tonic::transport::Channel>, tonic::transport::Error> {
	let channel = tonic::transport::Endpoint::from_shared(endpoint.to_owned())?
		.connect_timeout(RPC_TIMEOUT)
		.timeout(RPC_TIMEOUT)
		.connect()
		.await?;
	Ok(ControlPlaneClient::new(channel))
}

async fn register(
	endpoint: &str,
	config: &ControlPlaneConfig,
) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
	let mut client = connect(endpoint).await?;
	let response = client
		.register(RegisterRequest {
			service_kind: config.service_kind.as_str().to_owned(),
			input_event_types: config.input_event_types.clone(),
			output_event_types: config.output_event_types.clone(),
			health_endpoint: config.health_endpoint.clone(),
			max_inflight: config.max_inflight,
			metadata: config.metadata.clone(),
		})
		.await?;
	let service_id = response.into_inner().service_id;
	if service_id.is_empty() {
		return Err("control plane returned an empty service id".into());
	}
	Ok(service_id)
}

async fn heartbeat(
	endpoint: &str,
	request: HeartbeatRequest,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
	let mut client = connect(endpoint).await?;
	client.heartbeat(request).await?;
	Ok(())
}
