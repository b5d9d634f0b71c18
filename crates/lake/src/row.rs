use common::{event::EventBody, DomainEvent, EventKind, LedgerSequence};

/// Logical tables the lake materializes. Each table has a single
/// writer and is self-consistent; no cross-table ordering holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
	TokenTransfers,
	Fees,
	ContractCalls,
	ContractData,
	ContractEvents,
}

impl Table {
	pub fn as_str(&self) -> &'static str {
		match self {
			Table::TokenTransfers => "token_transfers",
			Table::Fees => "fees",
			Table::ContractCalls => "contract_calls",
			Table::ContractData => "contract_data",
			Table::ContractEvents => "contract_events",
		}
	}

	pub fn for_event(event: &DomainEvent) -> Table {
		match event.kind() {
			EventKind::Transfer | EventKind::Mint | EventKind::Burn => Table::TokenTransfers,
			EventKind::Fee => Table::Fees,
			EventKind::ContractCall | EventKind::CreateContract | EventKind::UploadWasm => {
				Table::ContractCalls
			},
			EventKind::ContractDataChange => Table::ContractData,
			EventKind::ContractEvent => Table::ContractEvents,
		}
	}

	pub fn all() -> [Table; 5] {
		[
			Table::TokenTransfers,
			Table::Fees,
			Table::ContractCalls,
			Table::ContractData,
			Table::ContractEvents,
		]
	}
}

impl std::fmt::Display for Table {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

/// One columnar row, flattened from a domain event. The full body
/// rides along as JSON so no table is lossy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRow {
	pub ledger_sequence: u32,
	pub tx_hash: String,
	pub tx_index: u32,
	pub op_index: u32,
	pub event_index: u32,
	pub close_time_unix: i64,
	pub successful: bool,
	pub kind: String,
	pub contract: Option<String>,
	pub from_address: Option<String>,
	pub to_address: Option<String>,
	pub amount: Option<String>,
	pub asset: Option<String>,
	pub function: Option<String>,
	pub body_json: String,
}

impl EventRow {
	pub fn from_event(event: &DomainEvent) -> (Table, EventRow) {
		let envelope = &event.envelope;
		let (from_address, to_address, asset, function) = match &event.body {
			EventBody::Transfer(b) => (
				Some(b.from.to_string()),
				Some(b.to.to_string()),
				b.asset.clone(),
				None,
			),
			EventBody::Mint(b) => {
				(Some(b.admin.to_string()), Some(b.to.to_string()), None, None)
			},
			EventBody::Burn(b) => (Some(b.from.to_string()), None, None, None),
			EventBody::Fee(b) => (Some(b.source.to_string()), None, None, None),
			EventBody::ContractCall(b) => (
				Some(b.invoking_account.to_string()),
				None,
				None,
				Some(b.function.clone()),
			),
			EventBody::CreateContract(b) => (Some(b.deployer.to_string()), None, None, None),
			EventBody::UploadWasm(b) => (Some(b.uploader.to_string()), None, None, None),
			EventBody::ContractDataChange(_) | EventBody::ContractEvent(_) => {
				(None, None, None, None)
			},
		};

		let row = EventRow {
			ledger_sequence: envelope.ledger_sequence.value(),
			tx_hash: envelope.tx_hash.to_string(),
			tx_index: envelope.tx_index,
			op_index: envelope.op_index,
			event_index: envelope.event_index,
			close_time_unix: envelope.close_time.timestamp(),
			successful: envelope.successful,
			kind: event.kind().to_string(),
			contract: event.body.contract().map(|c| c.to_string()),
			from_address,
			to_address,
			amount: event.body.amount().map(|a| a.decimal()),
			asset,
			function,
			body_json: serde_json::to_string(&event.body).unwrap_or_default(),
		};
		(Table::for_event(event), row)
	}

	pub fn sequence(&self) -> LedgerSequence {
		LedgerSequence::new(self.ledger_sequence)
	}

	pub fn partition(&self) -> u32 {
		self.sequence().partition()
	}
}
