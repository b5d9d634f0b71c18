use std::{
	collections::HashMap,
	sync::{Arc, RwLock},
};

use metrics_exporter_prometheus::PrometheusHandle;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
	Healthy,
	Degraded,
	Unhealthy,
}

#[derive(Debug, Serialize, Clone)]
struct HealthInner {
	status: Status,
	events_processed: u64,
	events_emitted: u64,
	events_filtered: u64,
	errors: u64,
	last_processed_ledger: u32,
	lag_seconds: i64,
	pending_batches: u64,
	last_error: Option<String>,
}

/// Shared health surface: the pipeline writes, the HTTP endpoint and
/// control-plane heartbeats read
pub struct HealthState {
	inner: RwLock<HealthInner>,
}

impl Default for HealthState {
	fn default() -> Self {
		Self {
			inner: RwLock::new(HealthInner {
				status: Status::Healthy,
				events_processed: 0,
				events_emitted: 0,
				events_filtered: 0,
				errors: 0,
				last_processed_ledger: 0,
				lag_seconds: 0,
				pending_batches: 0,
				last_error: None,
			}),
		}
	}
}

impl HealthState {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn record_processed(&self, events: u64) {
		self.inner.write().unwrap().events_processed += events;
	}

	pub fn record_emitted(&self, events: u64) {
		self.inner.write().unwrap().events_emitted += events;
	}

	pub fn record_filtered(&self, events: u64) {
		self.inner.write().unwrap().events_filtered += events;
	}

	pub fn record_error(&self, error: impl std::fmt::Display) {
		let mut inner = self.inner.write().unwrap();
		inner.errors += 1;
		inner.last_error = Some(error.to_string());
		if inner.status == Status::Healthy {
			inner.status = Status::Degraded;
		}
	}

	pub fn set_unhealthy(&self, error: impl std::fmt::Display) {
		let mut inner = self.inner.write().unwrap();
		inner.status = Status::Unhealthy;
		inner.last_error = Some(error.to_string());
	}

	pub fn set_last_processed_ledger(&self, sequence: u32) {
		self.inner.write().unwrap().last_processed_ledger = sequence;
	}

	pub fn set_lag_seconds(&self, lag: i64) {
		self.inner.write().unwrap().lag_seconds = lag;
	}

	pub fn set_pending_batches(&self, pending: u64) {
		self.inner.write().unwrap().pending_batches = pending;
	}

	pub fn last_processed_ledger(&self) -> u32 {
		self.inner.read().unwrap().last_processed_ledger
	}

	pub fn status(&self) -> Status {
		self.inner.read().unwrap().status
	}

	pub fn snapshot_json(&self) -> serde_json::Value {
		serde_json::to_value(self.inner.read().unwrap().clone())
			.unwrap_or_else(|_| serde_json::json!({ "status": "unhealthy" }))
	}

	/// The metrics map heartbeats carry
	pub fn metrics_map(&self) -> HashMap<String, f64> {
		let inner = self.inner.read().unwrap();
		HashMap::from([
			("events_processed".to_owned(), inner.events_processed as f64),
			("events_emitted".to_owned(), inner.events_emitted as f64),
			("errors".to_owned(), inner.errors as f64),
			(
				"last_processed_ledger".to_owned(),
				f64::from(inner.last_processed_ledger),
			),
			("lag_seconds".to_owned(), inner.lag_seconds as f64),
			("pending_batches".to_owned(), inner.pending_batches as f64),
		])
	}
}

/// `GET /health` + `GET /metrics`, detached from the data path
pub fn spawn_health_server(
	port: u16,
	state: Arc<HealthState>,
	prometheus: PrometheusHandle,
) -> tokio::task::JoinHandle<()> {
	use warp::Filter;

	let health_state = state.clone();
	let health = warp::path("health")
		.and(warp::get())
		.map(move || warp::reply::json(&health_state.snapshot_json()));
	let metrics = warp::path("metrics")
		.and(warp::get())
		.map(move || prometheus.render());

	info!(port, "Health endpoint listening");
	tokio::spawn(warp::serve(health.or(metrics)).run(([0, 0, 0, 0], port)))
}
