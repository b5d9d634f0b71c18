use std::{
	collections::BTreeMap,
	path::{Path, PathBuf},
	sync::Mutex,
};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tracing::{debug, instrument};

use common::{LedgerSequence, NetworkId, RawLedger};

use crate::{
	backend::{BackendError, BackendKind, LedgerBackend},
	frames,
};

/// Ledgers per archive bundle, aligned to checkpoint boundaries
pub const BUNDLE_SPAN: u32 = 64;

/// Archive adapter over a filesystem layout of framed bundles. Each
/// bundle `ledgers-<start>.xdr` holds `BUNDLE_SPAN` record-marked
/// frames in sequence order starting at a span-aligned sequence.
/// Object stores mount or sync into this layout; the adapter itself
/// never talks to a network.
///
/// Archive frames carry no close time; the extractor takes the
/// authoritative close time from the decoded ledger header, so frames
/// are emitted with an epoch placeholder.
pub struct ArchiveBackend {
	root: PathBuf,
	network: NetworkId,
	cache: Mutex<BTreeMap<u32, Vec<Vec<u8>>>>,
	closed: Mutex<bool>,
}

impl ArchiveBackend {
	pub fn new(root: impl AsRef<Path>, network: NetworkId) -> Self {
		Self {
			root: root.as_ref().to_owned(),
			network,
			cache: Mutex::new(BTreeMap::new()),
			closed: Mutex::new(false),
		}
	}

	fn bundle_start(sequence: LedgerSequence) -> u32 {
		sequence.value() / BUNDLE_SPAN * BUNDLE_SPAN
	}

	fn bundle_path(&self, bundle_start: u32) -> PathBuf {
		// Two-level fanout keeps directories small over long histories
		let group = bundle_start / (BUNDLE_SPAN * 1024);
		self.root.join(format!("{group:08x}")).join(format!("ledgers-{bundle_start:08x}.xdr"))
	}

	#[instrument(skip(self), level = "debug")]
	async fn load_bundle(&self, bundle_start: u32) -> Result<(), BackendError> {
		if self.cache.lock().unwrap().contains_key(&bundle_start) {
			return Ok(());
		}
		let path = self.bundle_path(bundle_start);
		let bytes = match tokio::fs::read(&path).await {
			Ok(bytes) => bytes,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
				return Err(BackendError::NotYetAvailable {
					sequence: LedgerSequence::new(bundle_start),
				});
			},
			Err(e) => return Err(e.into()),
		};
		let mut reader = std::io::Cursor::new(bytes);
		let mut payloads = vec![];
		loop {
			match frames::read_frame(&mut reader).await {
				Ok(Some(payload)) => payloads.push(payload),
				Ok(None) => break,
				Err(e) => {
					return Err(BackendError::CorruptFrame {
						sequence: LedgerSequence::new(bundle_start + payloads.len() as u32),
						reason: e.to_string(),
					});
				},
			}
		}
		debug!(bundle_start, frames = payloads.len(), "Loaded archive bundle");
		let mut cache = self.cache.lock().unwrap();
		cache.insert(bundle_start, payloads);
		// Bounded cache: keep the working set small
		while cache.len() > 8 {
			let oldest = *cache.keys().next().unwrap();
			cache.remove(&oldest);
		}
		Ok(())
	}
}

#[async_trait]
impl LedgerBackend for ArchiveBackend {
	async fn prepare(
		&self,
		start: LedgerSequence,
		_end: Option<LedgerSequence>,
	) -> Result<(), BackendError> {
		if !self.root.is_dir() {
			return Err(BackendError::Unavailable {
				reason: format!("archive root {} is not a directory", self.root.display()),
			});
		}
		self.load_bundle(Self::bundle_start(start)).await.map(|_| ())
	}

	async fn get(&self, sequence: LedgerSequence) -> Result<RawLedger, BackendError> {
		if *self.closed.lock().unwrap() {
			return Err(BackendError::Closed);
		}
		let bundle_start = Self::bundle_start(sequence);
		self.load_bundle(bundle_start).await?;

		let cache = self.cache.lock().unwrap();
		let bundle = cache.get(&bundle_start).ok_or(BackendError::NotFound { sequence })?;
		let index = (sequence.value() - bundle_start) as usize;
		let payload = bundle.get(index).ok_or(BackendError::NotYetAvailable { sequence })?;
		Ok(RawLedger::new(
			sequence,
			payload.clone(),
			self.network.clone(),
			Utc.timestamp_opt(0, 0).unwrap(),
		))
	}

	async fn latest_ledger(&self) -> Result<LedgerSequence, BackendError> {
		// Scan fanout directories for the highest bundle on disk, then
		// load it: the newest bundle may be partially filled
		let mut highest: Option<u32> = None;
		let mut groups = tokio::fs::read_dir(&self.root).await?;
		while let Some(group) = groups.next_entry().await? {
			let mut bundles = match tokio::fs::read_dir(group.path()).await {
				Ok(entries) => entries,
				Err(_) => continue,
			};
			while let Some(bundle) = bundles.next_entry().await? {
				let name = bundle.file_name();
				let name = name.to_string_lossy();
				if let Some(hex) = name
					.strip_prefix("ledgers-")
					.and_then(|rest| rest.strip_suffix(".xdr"))
				{
					if let Ok(start) = u32::from_str_radix(hex, 16) {
						highest = Some(highest.map_or(start, |h| h.max(start)));
					}
				}
			}
		}
		let bundle_start = highest
			.ok_or(BackendError::Unavailable { reason: "archive is empty".into() })?;
		self.load_bundle(bundle_start).await?;
		let frames = self
			.cache
			.lock()
			.unwrap()
			.get(&bundle_start)
			.map(|b| b.len() as u32)
			.unwrap_or(0);
		if frames == 0 {
			return Err(BackendError::Unavailable { reason: "archive tail bundle is empty".into() });
		}
		Ok(LedgerSequence::new(bundle_start + frames - 1))
	}

	async fn close(&self) {
		*self.closed.lock().unwrap() = true;
		self.cache.lock().unwrap().clear();
	}

	fn kind(&self) -> BackendKind {
		BackendKind::Archive
	}
}
