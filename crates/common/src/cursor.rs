use crate::ledger::LedgerSequence;

/// Total-order position of an event within the ledger stream. Ordering
/// is lexicographic over (ledger, tx, op, event); within a single
/// stream cursors are strictly increasing.
#[derive(
	Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct Cursor {
	pub ledger_sequence: LedgerSequence,
	pub tx_index: u32,
	pub op_index: u32,
	pub event_index: u32,
}

impl Cursor {
	pub fn new(ledger_sequence: impl Into<LedgerSequence>, tx_index: u32, op_index: u32, event_index: u32) -> Self {
		Self { ledger_sequence: ledger_sequence.into(), tx_index, op_index, event_index }
	}
}

impl std::fmt::Display for Cursor {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(
			f,
			"{}-{}-{}-{}",
			self.ledger_sequence, self.tx_index, self.op_index, self.event_index
		)
	}
}

#[derive(Debug, thiserror::Error)]
#[error("Malformed cursor: {0}")]
pub struct ParseCursorError(String);

impl std::str::FromStr for Cursor {
	type Err = ParseCursorError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let parts = s.split('-').collect::<Vec<_>>();
		if parts.len() != 4 {
			return Err(ParseCursorError(s.to_owned()));
		}
		let mut fields = [0u32; 4];
		for (slot, part) in fields.iter_mut().zip(&parts) {
			*slot = part.parse().map_err(|_| ParseCursorError(s.to_owned()))?;
		}
		Ok(Cursor::new(fields[0], fields[1], fields[2], fields[3]))
	}
}
