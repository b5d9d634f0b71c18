use chrono::{DateTime, Utc};

use crate::{amount::Amount, cursor::Cursor, ledger::LedgerSequence};

/// Strkey rendered account or contract address (`G...`, `C...`)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
	pub fn new(strkey: impl Into<String>) -> Self {
		Address(strkey.into())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn is_contract(&self) -> bool {
		self.0.starts_with('C')
	}
}

impl std::fmt::Display for Address {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(&self.0)
	}
}

/// Opaque payload bytes, rendered as hex and base64 on demand
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Binary(Vec<u8>);

impl Binary {
	pub fn new(bytes: Vec<u8>) -> Self {
		Binary(bytes)
	}

	pub fn as_bytes(&self) -> &[u8] {
		&self.0
	}

	pub fn to_hex(&self) -> String {
		hex::encode(&self.0)
	}

	pub fn to_base64(&self) -> String {
		use base64::Engine;
		base64::engine::general_purpose::STANDARD.encode(&self.0)
	}
}

impl From<Vec<u8>> for Binary {
	fn from(bytes: Vec<u8>) -> Self {
		Binary(bytes)
	}
}

/// Transaction hash, hex rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxHash(pub [u8; 32]);

impl std::fmt::Display for TxHash {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(&hex::encode(self.0))
	}
}

/// Fields shared by every emitted event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
	pub ledger_sequence: LedgerSequence,
	pub tx_hash: TxHash,
	pub tx_index: u32,
	pub op_index: u32,
	pub event_index: u32,
	pub close_time: DateTime<Utc>,
	pub successful: bool,
}

impl EventEnvelope {
	pub fn cursor(&self) -> Cursor {
		Cursor {
			ledger_sequence: self.ledger_sequence,
			tx_index: self.tx_index,
			op_index: self.op_index,
			event_index: self.event_index,
		}
	}
}

/// Type tag for filtering and wire encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
	Transfer,
	Mint,
	Burn,
	Fee,
	ContractCall,
	CreateContract,
	UploadWasm,
	ContractDataChange,
	ContractEvent,
}

impl EventKind {
	pub fn as_str(&self) -> &'static str {
		match self {
			EventKind::Transfer => "transfer",
			EventKind::Mint => "mint",
			EventKind::Burn => "burn",
			EventKind::Fee => "fee",
			EventKind::ContractCall => "contract_call",
			EventKind::CreateContract => "create_contract",
			EventKind::UploadWasm => "upload_wasm",
			EventKind::ContractDataChange => "contract_data_change",
			EventKind::ContractEvent => "contract_event",
		}
	}
}

#[derive(Debug, thiserror::Error)]
#[error("Unrecognized event kind: {0}")]
pub struct ParseEventKindError(String);

impl std::str::FromStr for EventKind {
	type Err = ParseEventKindError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"transfer" => Ok(EventKind::Transfer),
			"mint" => Ok(EventKind::Mint),
			"burn" => Ok(EventKind::Burn),
			"fee" => Ok(EventKind::Fee),
			"contract_call" => Ok(EventKind::ContractCall),
			"create_contract" => Ok(EventKind::CreateContract),
			"upload_wasm" => Ok(EventKind::UploadWasm),
			"contract_data_change" => Ok(EventKind::ContractDataChange),
			"contract_event" => Ok(EventKind::ContractEvent),
			other => Err(ParseEventKindError(other.to_owned())),
		}
	}
}

impl std::fmt::Display for EventKind {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferBody {
	pub contract: Address,
	pub from: Address,
	pub to: Address,
	pub amount: Amount,
	/// SEP-11 asset string for asset contract transfers, when present
	/// in the event topics
	pub asset: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MintBody {
	pub contract: Address,
	pub admin: Address,
	pub to: Address,
	pub amount: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BurnBody {
	pub contract: Address,
	pub from: Address,
	pub amount: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeBody {
	pub source: Address,
	/// Stroops actually charged for the transaction
	pub fee_charged: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractCallBody {
	pub contract: Address,
	pub function: String,
	pub invoking_account: Address,
	/// Count of contract data entries created, updated or removed by
	/// the invocation
	pub state_changes: u32,
	pub args: Vec<Binary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateContractBody {
	pub contract: Address,
	pub deployer: Address,
	pub wasm_hash: Option<Binary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadWasmBody {
	pub uploader: Address,
	pub wasm_hash: Binary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataChangeKind {
	Created,
	Updated,
	Removed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Durability {
	Temporary,
	Persistent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractDataChangeBody {
	pub contract: Address,
	pub key: Binary,
	pub change: DataChangeKind,
	pub durability: Durability,
}

/// A contract event that matched no more specific shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractEventBody {
	pub contract: Option<Address>,
	pub topics: Vec<Binary>,
	pub data: Binary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventBody {
	Transfer(TransferBody),
	Mint(MintBody),
	Burn(BurnBody),
	Fee(FeeBody),
	ContractCall(ContractCallBody),
	CreateContract(CreateContractBody),
	UploadWasm(UploadWasmBody),
	ContractDataChange(ContractDataChangeBody),
	ContractEvent(ContractEventBody),
}

impl EventBody {
	pub fn kind(&self) -> EventKind {
		match self {
			EventBody::Transfer(_) => EventKind::Transfer,
			EventBody::Mint(_) => EventKind::Mint,
			EventBody::Burn(_) => EventKind::Burn,
			EventBody::Fee(_) => EventKind::Fee,
			EventBody::ContractCall(_) => EventKind::ContractCall,
			EventBody::CreateContract(_) => EventKind::CreateContract,
			EventBody::UploadWasm(_) => EventKind::UploadWasm,
			EventBody::ContractDataChange(_) => EventKind::ContractDataChange,
			EventBody::ContractEvent(_) => EventKind::ContractEvent,
		}
	}

	/// The contract the event originated from, where one applies
	pub fn contract(&self) -> Option<&Address> {
		match self {
			EventBody::Transfer(b) => Some(&b.contract),
			EventBody::Mint(b) => Some(&b.contract),
			EventBody::Burn(b) => Some(&b.contract),
			EventBody::Fee(_) => None,
			EventBody::ContractCall(b) => Some(&b.contract),
			EventBody::CreateContract(b) => Some(&b.contract),
			EventBody::UploadWasm(_) => None,
			EventBody::ContractDataChange(b) => Some(&b.contract),
			EventBody::ContractEvent(b) => b.contract.as_ref(),
		}
	}

	pub fn amount(&self) -> Option<&Amount> {
		match self {
			EventBody::Transfer(b) => Some(&b.amount),
			EventBody::Mint(b) => Some(&b.amount),
			EventBody::Burn(b) => Some(&b.amount),
			_ => None,
		}
	}
}

/// A fully decoded domain event: common envelope plus typed body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainEvent {
	pub envelope: EventEnvelope,
	pub body: EventBody,
}

impl DomainEvent {
	pub fn cursor(&self) -> Cursor {
		self.envelope.cursor()
	}

	pub fn kind(&self) -> EventKind {
		self.body.kind()
	}
}
