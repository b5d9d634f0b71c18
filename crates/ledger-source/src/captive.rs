use std::{
	collections::BTreeMap,
	process::Stdio,
	sync::{Arc, Mutex},
	time::Duration,
};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tokio::{io::BufReader, process::Command, sync::Notify};
use tracing::{debug, error, info, instrument};

use common::{LedgerSequence, NetworkId, RawLedger};

use crate::{
	backend::{BackendConfig, BackendError, BackendKind, LedgerBackend},
	frames,
};

/// How long `get` waits for the subprocess to produce a frame before
/// reporting the sequence as not yet available
const FRAME_WAIT: Duration = Duration::from_secs(5);

/// Frames retained ahead of the reader's consumption point
const WINDOW: usize = 256;

#[derive(Debug, Default)]
struct Shared {
	ledgers: BTreeMap<LedgerSequence, Vec<u8>>,
	/// Set when the subprocess exits or its stream breaks
	terminated: Option<String>,
}

/// Captive adapter: a local node subprocess emits record-marked ledger
/// frames on stdout, contiguous from the prepared start sequence. The
/// single reader task is the transport; the adapter itself stays
/// passive.
pub struct CaptiveBackend {
	command: String,
	args: Vec<String>,
	network: NetworkId,
	shared: Arc<Mutex<Shared>>,
	notify: Arc<Notify>,
	child: Mutex<Option<tokio::process::Child>>,
	closed: Mutex<bool>,
}

impl CaptiveBackend {
	pub fn new(config: &BackendConfig) -> Result<Self, BackendError> {
		let command = config.captive_command.clone().ok_or(BackendError::Unavailable {
			reason: "captive command is not configured".into(),
		})?;
		let network = config.network.clone().ok_or(BackendError::Unavailable {
			reason: "NETWORK_PASSPHRASE is not configured".into(),
		})?;
		Ok(Self {
			command,
			args: config.captive_args.clone(),
			network,
			shared: Arc::new(Mutex::new(Shared::default())),
			notify: Arc::new(Notify::new()),
			child: Mutex::new(None),
			closed: Mutex::new(false),
		})
	}

	fn spawn_reader(
		&self,
		stdout: tokio::process::ChildStdout,
		start: LedgerSequence,
		end: Option<LedgerSequence>,
	) {
		let shared = self.shared.clone();
		let notify = self.notify.clone();
		tokio::spawn(async move {
			let mut reader = BufReader::new(stdout);
			let mut next = start;
			loop {
				match frames::read_frame(&mut reader).await {
					Ok(Some(payload)) => {
						{
							let mut guard = shared.lock().unwrap();
							guard.ledgers.insert(next, payload);
							while guard.ledgers.len() > WINDOW {
								let oldest = *guard.ledgers.keys().next().unwrap();
								guard.ledgers.remove(&oldest);
							}
						}
						notify.notify_waiters();
						if Some(next) == end {
							info!(%next, "Captive stream reached range end");
							break;
						}
						next = next.next();
					},
					Ok(None) => {
						debug!(%next, "Captive subprocess closed its stream");
						shared.lock().unwrap().terminated =
							Some("subprocess stream ended".into());
						notify.notify_waiters();
						break;
					},
					Err(e) => {
						error!(error = %e, "Captive frame stream broke");
						shared.lock().unwrap().terminated = Some(e.to_string());
						notify.notify_waiters();
						break;
					},
				}
			}
		});
	}
}

#[async_trait]
impl LedgerBackend for CaptiveBackend {
	#[instrument(skip(self))]
	async fn prepare(
		&self,
		start: LedgerSequence,
		end: Option<LedgerSequence>,
	) -> Result<(), BackendError> {
		let mut args = self.args.clone();
		args.push("--start-ledger".into());
		args.push(start.value().to_string());
		if let Some(end) = end {
			args.push("--end-ledger".into());
			args.push(end.value().to_string());
		}

		let mut child = Command::new(&self.command)
			.args(&args)
			.stdout(Stdio::piped())
			.stderr(Stdio::null())
			.kill_on_drop(true)
			.spawn()?;
		let stdout = child.stdout.take().ok_or(BackendError::Unavailable {
			reason: "captive subprocess has no stdout".into(),
		})?;
		info!(command = %self.command, %start, "Captive subprocess started");
		self.spawn_reader(stdout, start, end);
		*self.child.lock().unwrap() = Some(child);
		Ok(())
	}

	async fn get(&self, sequence: LedgerSequence) -> Result<RawLedger, BackendError> {
		let deadline = tokio::time::Instant::now() + FRAME_WAIT;
		loop {
			if *self.closed.lock().unwrap() {
				return Err(BackendError::Closed);
			}
			{
				let guard = self.shared.lock().unwrap();
				if let Some(payload) = guard.ledgers.get(&sequence) {
					return Ok(RawLedger::new(
						sequence,
						payload.clone(),
						self.network.clone(),
						Utc.timestamp_opt(0, 0).unwrap(),
					));
				}
				if let Some(first) = guard.ledgers.keys().next() {
					if sequence < *first {
						return Err(BackendError::NotFound { sequence });
					}
				}
				if let Some(reason) = &guard.terminated {
					return Err(BackendError::Unavailable { reason: reason.clone() });
				}
			}
			// Re-check the window after every wakeup; only a passed
			// deadline concludes the poll
			if tokio::time::Instant::now() >= deadline {
				return Err(BackendError::NotYetAvailable { sequence });
			}
			let _ = tokio::time::timeout_at(deadline, self.notify.notified()).await;
		}
	}

	async fn latest_ledger(&self) -> Result<LedgerSequence, BackendError> {
		let guard = self.shared.lock().unwrap();
		guard
			.ledgers
			.keys()
			.next_back()
			.copied()
			.ok_or(BackendError::NotYetAvailable { sequence: LedgerSequence::new(0) })
	}

	async fn close(&self) {
		*self.closed.lock().unwrap() = true;
		self.notify.notify_waiters();
		let child = self.child.lock().unwrap().take();
		if let Some(mut child) = child {
			let _ = child.start_kill();
		}
	}

	fn kind(&self) -> BackendKind {
		BackendKind::Captive
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::frames::write_frame;

	fn network() -> NetworkId {
		NetworkId::new("Test SDF Network ; September 2015")
	}

	/// Stand in for a captive node: cat a pre-framed fixture file
	fn fixture_backend(dir: &tempfile::TempDir, start: u32, count: u32) -> CaptiveBackend {
		let mut bytes = vec![];
		for i in 0..count {
			write_frame(&mut bytes, &(start + i).to_be_bytes());
		}
		let path = dir.path().join("frames.bin");
		std::fs::write(&path, bytes).unwrap();
		CaptiveBackend::new(&BackendConfig {
			network: Some(network()),
			captive_command: Some("cat".into()),
			captive_args: vec![path.to_string_lossy().into_owned()],
			..Default::default()
		})
		.unwrap()
	}

	#[tokio::test]
	async fn streams_contiguous_frames() {
		let dir = tempfile::tempdir().unwrap();
		let backend = fixture_backend(&dir, 100, 10);
		// cat ignores the range flags; the reader assigns sequences
		backend.prepare(LedgerSequence::new(100), None).await.unwrap();

		for seq in 100..110 {
			let ledger = backend.get(LedgerSequence::new(seq)).await.unwrap();
			assert_eq!(ledger.bytes, seq.to_be_bytes().to_vec());
		}
		backend.close().await;
	}

	#[tokio::test]
	async fn closed_mid_call_returns_error() {
		let dir = tempfile::tempdir().unwrap();
		let backend = Arc::new(fixture_backend(&dir, 1, 1));
		backend.prepare(LedgerSequence::new(1), None).await.unwrap();
		backend.get(LedgerSequence::new(1)).await.unwrap();

		let waiting = {
			let backend = backend.clone();
			tokio::spawn(async move { backend.get(LedgerSequence::new(50)).await })
		};
		tokio::time::sleep(Duration::from_millis(50)).await;
		backend.close().await;
		let result = waiting.await.unwrap();
		assert!(matches!(
			result,
			Err(BackendError::Closed) | Err(BackendError::Unavailable { .. })
		));
	}
}
