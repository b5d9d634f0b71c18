use chrono::{DateTime, Utc};

/// A closed ledger's sequence number. Sequences are monotonic and
/// contiguous; a gap observed anywhere downstream is an error.
#[derive(
	Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct LedgerSequence(u32);

impl From<u32> for LedgerSequence {
	fn from(seq: u32) -> Self {
		LedgerSequence(seq)
	}
}

impl LedgerSequence {
	pub fn new(seq: u32) -> Self {
		LedgerSequence(seq)
	}

	pub fn value(&self) -> u32 {
		self.0
	}

	pub fn next(&self) -> Self {
		LedgerSequence(self.0.saturating_add(1))
	}

	pub fn distance(&self, other: &Self) -> u32 {
		self.0.saturating_sub(other.0)
	}

	/// Partition index for columnar layout, one partition per 100k ledgers
	pub fn partition(&self) -> u32 {
		self.0 / 100_000
	}
}

impl std::fmt::Display for LedgerSequence {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Network identifier, carried as the network passphrase. A checkpoint
/// recorded against one network must never be resumed against another.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkId(String);

impl NetworkId {
	pub fn new(passphrase: impl Into<String>) -> Self {
		NetworkId(passphrase.into())
	}

	pub fn passphrase(&self) -> &str {
		&self.0
	}
}

impl std::fmt::Display for NetworkId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(&self.0)
	}
}

/// An undecoded ledger close frame as produced by a backend adapter.
/// Immutable once produced; consumed exactly once by the extractor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLedger {
	pub sequence: LedgerSequence,
	pub bytes: Vec<u8>,
	pub network: NetworkId,
	pub close_time: DateTime<Utc>,
}

impl RawLedger {
	pub fn new(
		sequence: impl Into<LedgerSequence>,
		bytes: Vec<u8>,
		network: NetworkId,
		close_time: DateTime<Utc>,
	) -> Self {
		Self { sequence: sequence.into(), bytes, network, close_time }
	}
}
