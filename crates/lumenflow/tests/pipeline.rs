//! End-to-end pipeline scenarios over the in-memory backend and
//! catalog: bounded runs, filtering, crash/resume, and stream
//! cancellation.

mod fixtures;

use std::{sync::Arc, time::Duration};

use tokio::sync::watch;

use common::{EventFilter, EventKind, LedgerSequence, NetworkId};
use lake::{Catalog, Coverage, Era, EraStatus, FlushPolicy, Flusher, LocalPartitionStore, MemoryCatalog};
use ledger_source::{backend::LedgerBackend, InMemoryBackend};
use lumenflow::{
	driver::{run_pipeline, DriverConfig},
	health::HealthState,
	sink::LakeSink,
};
use pipeline::{CheckpointStore, GapPolicy};

fn open_era(network: &NetworkId) -> Era {
	Era {
		era_id: "genesis".into(),
		version_label: "v1".into(),
		network: network.clone(),
		ledger_start: LedgerSequence::new(0),
		ledger_end: None,
		status: EraStatus::Open,
	}
}

struct Harness {
	catalog: Arc<MemoryCatalog>,
	sink: Arc<LakeSink<Arc<MemoryCatalog>, LocalPartitionStore>>,
	checkpoint_dir: tempfile::TempDir,
	_lake_dir: tempfile::TempDir,
	health: Arc<HealthState>,
}

fn harness() -> Harness {
	let network = fixtures::network();
	let catalog = Arc::new(MemoryCatalog::new());
	let lake_dir = tempfile::tempdir().unwrap();
	let flusher = Flusher::new(
		Arc::new(catalog.clone()),
		Arc::new(LocalPartitionStore::new(lake_dir.path())),
		open_era(&network),
		"core",
		FlushPolicy {
			batch_size: 100_000,
			flush_interval: Duration::from_secs(3600),
			min_file_bytes: 0,
			max_defer_intervals: 0,
		},
	);
	let health = HealthState::new();
	let sink = Arc::new(LakeSink::new(
		flusher,
		None,
		"genesis",
		"core",
		health.clone(),
	));
	Harness {
		catalog,
		sink,
		checkpoint_dir: tempfile::tempdir().unwrap(),
		_lake_dir: lake_dir,
		health,
	}
}

fn driver_config(start: u32, end: u32, batch_size: u32) -> DriverConfig {
	DriverConfig {
		start_ledger: start,
		end_ledger: end,
		batch_size,
		worker_count: 4,
		buffer_size: 20,
		flush_interval: Duration::from_secs(3600),
		gap_policy: GapPolicy::Retry { max_attempts: 3 },
		source_mode: "IN_MEMORY".into(),
	}
}

async fn run(
	harness: &Harness,
	backend: Arc<dyn LedgerBackend>,
	filter: EventFilter,
	config: DriverConfig,
) -> lumenflow::driver::DriverSummary {
	let (_shutdown_tx, shutdown_rx) = watch::channel(false);
	run_pipeline(
		backend,
		fixtures::network(),
		filter,
		harness.sink.clone(),
		CheckpointStore::new(harness.checkpoint_dir.path(), "checkpoint.json"),
		config,
		harness.health.clone(),
		shutdown_rx,
	)
	.await
	.unwrap()
}

async fn coverage(catalog: &MemoryCatalog, dataset: &str) -> Coverage {
	Coverage::from_lineage(&catalog.lineage_for(dataset, "genesis").await.unwrap())
}

#[tokio::test]
async fn short_bounded_stream_commits_and_checkpoints() {
	let harness = harness();
	let backend =
		Arc::new(fixtures::backend_with_ledgers(100, 109, &[500])) as Arc<dyn LedgerBackend>;

	let summary = run(
		&harness,
		backend,
		EventFilter::default(),
		driver_config(100, 109, 5),
	)
	.await;

	assert_eq!(summary.committed_batches, 2);
	assert_eq!(summary.last_committed.unwrap().value(), 109);
	assert!(summary.gaps.is_empty());
	assert_eq!(harness.health.last_processed_ledger(), 109);

	let store = CheckpointStore::new(harness.checkpoint_dir.path(), "checkpoint.json");
	let checkpoint = store.load().await.unwrap().unwrap();
	assert_eq!(checkpoint.last_committed_ledger.value(), 109);
	assert_eq!(checkpoint.network, fixtures::network());

	// Coverage [100..109], one file per table involved
	let transfers = coverage(&harness.catalog, "core.token_transfers").await;
	assert_eq!(transfers.committed.len(), 1);
	assert_eq!(transfers.committed[0].0.value(), 100);
	assert_eq!(transfers.committed[0].1.value(), 109);
	assert_eq!(transfers.total_rows, 10);
}

#[tokio::test]
async fn rerunning_a_committed_range_is_idempotent() {
	let harness = harness();
	let backend =
		Arc::new(fixtures::backend_with_ledgers(100, 109, &[500])) as Arc<dyn LedgerBackend>;

	let first = run(
		&harness,
		backend.clone(),
		EventFilter::default(),
		driver_config(100, 109, 5),
	)
	.await;
	assert_eq!(first.committed_batches, 2);

	let store = CheckpointStore::new(harness.checkpoint_dir.path(), "checkpoint.json");
	let checkpoint_before = store.load().await.unwrap().unwrap();

	// Same config over the existing checkpoint: zero new batches, the
	// checkpoint and lineage untouched
	let second = run(
		&harness,
		backend,
		EventFilter::default(),
		driver_config(100, 109, 5),
	)
	.await;
	assert_eq!(second.committed_batches, 0);

	let checkpoint_after = store.load().await.unwrap().unwrap();
	assert_eq!(
		checkpoint_before.last_committed_ledger,
		checkpoint_after.last_committed_ledger
	);
	assert_eq!(checkpoint_before.chain_hash, checkpoint_after.chain_hash);
	assert_eq!(
		coverage(&harness.catalog, "core.token_transfers").await.total_rows,
		10
	);
}

#[tokio::test]
async fn filter_drops_everything_but_stream_completes() {
	let harness = harness();
	let backend = Arc::new(fixtures::backend_with_ledgers(100, 100, &[5, 50, 500]))
		as Arc<dyn LedgerBackend>;

	let filter = EventFilter {
		event_types: [EventKind::Transfer].into_iter().collect(),
		min_amount: Some("1000".into()),
		..Default::default()
	};
	let summary = run(&harness, backend, filter, driver_config(100, 100, 100)).await;

	assert_eq!(summary.committed_batches, 1);
	assert_eq!(summary.last_committed.unwrap().value(), 100);
	// All three transfers fell below the threshold
	assert!(harness
		.catalog
		.lineage_for("core.token_transfers", "genesis")
		.await
		.unwrap()
		.is_empty());
	let json = harness.health.snapshot_json();
	assert_eq!(json["events_emitted"], 0);
	assert!(json["events_filtered"].as_u64().unwrap() >= 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn crash_and_resume_produces_continuous_chain() {
	// Reference: one uninterrupted run over [1000..1400]
	let reference = harness();
	let backend = || {
		Arc::new(fixtures::backend_with_ledgers(1000, 1400, &[500]))
			as Arc<dyn LedgerBackend>
	};
	run(
		&reference,
		backend(),
		EventFilter::default(),
		driver_config(1000, 1400, 100),
	)
	.await;
	let reference_ckpt = CheckpointStore::new(
		reference.checkpoint_dir.path(),
		"checkpoint.json",
	)
	.load()
	.await
	.unwrap()
	.unwrap();

	// Interrupted: first run stops at 1199, restart completes the range
	let interrupted = harness();
	run(
		&interrupted,
		backend(),
		EventFilter::default(),
		driver_config(1000, 1199, 100),
	)
	.await;
	let summary = run(
		&interrupted,
		backend(),
		EventFilter::default(),
		driver_config(1000, 1400, 100),
	)
	.await;

	// Resumed from 1200, no re-commits
	assert_eq!(summary.committed_batches, 3);
	assert_eq!(summary.last_committed.unwrap().value(), 1400);

	let resumed_ckpt = CheckpointStore::new(
		interrupted.checkpoint_dir.path(),
		"checkpoint.json",
	)
	.load()
	.await
	.unwrap()
	.unwrap();
	assert_eq!(resumed_ckpt.last_committed_ledger.value(), 1400);
	// Hash chain continuity: the split run folds to the same chain
	// value as the uninterrupted one
	assert_eq!(resumed_ckpt.chain_hash, reference_ckpt.chain_hash);
	assert_eq!(resumed_ckpt.batch_number, reference_ckpt.batch_number);

	// Coverage continuous, no duplicates
	let cov = coverage(&interrupted.catalog, "core.token_transfers").await;
	assert_eq!(cov.committed.len(), 1);
	assert_eq!(cov.committed[0].0.value(), 1000);
	assert_eq!(cov.committed[0].1.value(), 1400);
	assert_eq!(cov.total_rows, 401);
	assert!(cov.gaps.is_empty());
}

#[tokio::test]
async fn network_mismatch_refuses_to_resume() {
	let harness = harness();
	let backend =
		Arc::new(fixtures::backend_with_ledgers(100, 109, &[500])) as Arc<dyn LedgerBackend>;
	run(
		&harness,
		backend.clone(),
		EventFilter::default(),
		driver_config(100, 109, 5),
	)
	.await;

	let (_tx, shutdown_rx) = watch::channel(false);
	let result = run_pipeline(
		backend,
		NetworkId::new("Public Global Stellar Network ; September 2015"),
		EventFilter::default(),
		harness.sink.clone(),
		CheckpointStore::new(harness.checkpoint_dir.path(), "checkpoint.json"),
		driver_config(100, 109, 5),
		harness.health.clone(),
		shutdown_rx,
	)
	.await;
	assert!(result.is_err());
}

#[tokio::test]
async fn unbounded_stream_cancellation_releases_backend() {
	use futures::StreamExt;
	use ledger_source::{source::SourceConfig, LedgerSource};

	let backend = Arc::new(InMemoryBackend::with_range(fixtures::network(), 100, 1_000_000));
	let mut stream = LedgerSource::new(
		backend.clone(),
		SourceConfig { buffer_size: 20, ..SourceConfig::unbounded(100) },
	)
	.unwrap()
	.stream();

	for _ in 0..20 {
		stream.next().await.unwrap().unwrap();
	}
	drop(stream);

	// The producer task notices within a poll interval and closes the
	// adapter
	for _ in 0..100 {
		if backend.is_closed() {
			return;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	panic!("backend was not closed after the consumer cancelled");
}
