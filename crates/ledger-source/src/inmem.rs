use std::{
	collections::{BTreeMap, VecDeque},
	sync::Mutex,
};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use common::{LedgerSequence, NetworkId, RawLedger};

use crate::backend::{BackendError, BackendKind, LedgerBackend};

// A simulation of a ledger backend: a preloaded window of the chain
// plus scripted failures, standing in for transport + history the way
// a real adapter would see them.
pub struct InMemoryBackend {
	network: NetworkId,
	ledgers: Mutex<BTreeMap<LedgerSequence, RawLedger>>,
	head: Mutex<LedgerSequence>,
	scripted_failures: Mutex<VecDeque<BackendError>>,
	closed: Mutex<bool>,
}

impl InMemoryBackend {
	pub fn new(network: NetworkId) -> Self {
		Self {
			network,
			ledgers: Mutex::new(BTreeMap::new()),
			head: Mutex::new(LedgerSequence::new(0)),
			scripted_failures: Mutex::new(VecDeque::new()),
			closed: Mutex::new(false),
		}
	}

	/// Populate sequences `[start, end]` with synthetic frames
	pub fn with_range(network: NetworkId, start: u32, end: u32) -> Self {
		let backend = Self::new(network.clone());
		{
			let mut ledgers = backend.ledgers.lock().unwrap();
			for seq in start..=end {
				ledgers.insert(LedgerSequence::new(seq), synthetic_ledger(&network, seq));
			}
		}
		*backend.head.lock().unwrap() = LedgerSequence::new(end);
		backend
	}

	pub fn insert(&self, ledger: RawLedger) {
		let sequence = ledger.sequence;
		self.ledgers.lock().unwrap().insert(sequence, ledger);
		let mut head = self.head.lock().unwrap();
		if sequence > *head {
			*head = sequence;
		}
	}

	/// Queue an error returned by the next `get` calls, in order
	pub fn script_failure(&self, error: BackendError) {
		self.scripted_failures.lock().unwrap().push_back(error);
	}

	pub fn is_closed(&self) -> bool {
		*self.closed.lock().unwrap()
	}
}

pub fn synthetic_ledger(network: &NetworkId, sequence: u32) -> RawLedger {
	// Deterministic close times five seconds apart
	let close_time = Utc.timestamp_opt(1_700_000_000 + i64::from(sequence) * 5, 0).unwrap();
	RawLedger::new(
		sequence,
		sequence.to_be_bytes().to_vec(),
		network.clone(),
		close_time,
	)
}

#[async_trait]
impl LedgerBackend for InMemoryBackend {
	async fn prepare(
		&self,
		start: LedgerSequence,
		_end: Option<LedgerSequence>,
	) -> Result<(), BackendError> {
		if *self.closed.lock().unwrap() {
			return Err(BackendError::Closed);
		}
		let ledgers = self.ledgers.lock().unwrap();
		match ledgers.keys().next() {
			Some(first) if start < *first => {
				Err(BackendError::NotFound { sequence: start })
			},
			_ => Ok(()),
		}
	}

	async fn get(&self, sequence: LedgerSequence) -> Result<RawLedger, BackendError> {
		if *self.closed.lock().unwrap() {
			return Err(BackendError::Closed);
		}
		if let Some(error) = self.scripted_failures.lock().unwrap().pop_front() {
			return Err(error);
		}
		let ledgers = self.ledgers.lock().unwrap();
		if let Some(ledger) = ledgers.get(&sequence) {
			return Ok(ledger.clone());
		}
		if sequence > *self.head.lock().unwrap() {
			Err(BackendError::NotYetAvailable { sequence })
		} else {
			Err(BackendError::NotFound { sequence })
		}
	}

	async fn latest_ledger(&self) -> Result<LedgerSequence, BackendError> {
		if *self.closed.lock().unwrap() {
			return Err(BackendError::Closed);
		}
		Ok(*self.head.lock().unwrap())
	}

	async fn close(&self) {
		*self.closed.lock().unwrap() = true;
	}

	fn kind(&self) -> BackendKind {
		BackendKind::InMemory
	}
}
