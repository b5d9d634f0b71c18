use chrono::{DateTime, TimeZone, Utc};
use sha2::{Digest, Sha256};
use stellar_xdr::curr as xdr;
use stellar_xdr::curr::{ReadXdr, WriteXdr};

use common::{
	event::{Address, DataChangeKind, Durability, TxHash},
	LedgerSequence, NetworkId,
};

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
	#[error("XDR decode failed for ledger {sequence}: {cause}")]
	Xdr { sequence: LedgerSequence, cause: xdr::Error },

	#[error("Ledger {got} decoded where {expected} was requested")]
	SequenceMismatch { expected: LedgerSequence, got: LedgerSequence },

	#[error("Ledger {sequence} carries an unsupported close meta version")]
	UnsupportedVersion { sequence: LedgerSequence },
}

/// A transaction's operation after decoding, with the pieces of meta
/// attributed to it
#[derive(Debug, Clone)]
pub struct DecodedOperation {
	/// One-based within the transaction; zero is the transaction level
	pub index: u32,
	pub invoking_account: Address,
	pub kind: OperationKind,
	pub contract_events: Vec<xdr::ContractEvent>,
	pub data_changes: Vec<DataChange>,
}

#[derive(Debug, Clone)]
pub enum OperationKind {
	InvokeContract { contract: Address, function: String, args: Vec<Vec<u8>> },
	CreateContract { contract: Option<Address>, wasm_hash: Option<Vec<u8>> },
	UploadWasm { wasm_hash: Vec<u8> },
	/// Classic operations carry no contract payload of interest here
	Other,
}

#[derive(Debug, Clone)]
pub struct DataChange {
	pub contract: Address,
	pub key_xdr: Vec<u8>,
	pub kind: DataChangeKind,
	pub durability: Durability,
}

#[derive(Debug, Clone)]
pub struct DecodedTransaction {
	/// Application order within the ledger
	pub index: u32,
	pub hash: TxHash,
	pub successful: bool,
	pub fee_charged: i64,
	pub source: Address,
	pub operations: Vec<DecodedOperation>,
}

/// Parsed representation of one closed ledger. Extractor-scoped:
/// built, walked once for event emission, then dropped.
#[derive(Debug, Clone)]
pub struct DecodedLedger {
	pub sequence: LedgerSequence,
	pub close_time: DateTime<Utc>,
	pub transactions: Vec<DecodedTransaction>,
}

pub fn decode_ledger(
	network: &NetworkId,
	expected: LedgerSequence,
	bytes: &[u8],
) -> Result<DecodedLedger, ExtractError> {
	let meta = xdr::LedgerCloseMeta::from_xdr(bytes, xdr::Limits::none())
		.map_err(|cause| ExtractError::Xdr { sequence: expected, cause })?;

	let network_id = network_id(network);
	let (header, envelopes, processing) = match &meta {
		xdr::LedgerCloseMeta::V0(v0) => (
			&v0.ledger_header.header,
			v0.tx_set.txs.to_vec(),
			v0.tx_processing.to_vec(),
		),
		xdr::LedgerCloseMeta::V1(v1) => (
			&v1.ledger_header.header,
			tx_set_envelopes(&v1.tx_set),
			v1.tx_processing.to_vec(),
		),
	};

	let sequence = LedgerSequence::new(header.ledger_seq);
	if sequence != expected {
		return Err(ExtractError::SequenceMismatch { expected, got: sequence });
	}
	let close_time = Utc
		.timestamp_opt(header.scp_value.close_time.0 as i64, 0)
		.single()
		.unwrap_or_else(|| Utc.timestamp_opt(0, 0).unwrap());

	// Apply order is the order of tx_processing; envelopes arrive in
	// nomination order and are matched up by transaction hash
	let mut by_hash = std::collections::HashMap::new();
	for envelope in envelopes {
		by_hash.insert(envelope_hash(&network_id, &envelope), envelope);
	}

	let mut transactions = vec![];
	for (index, result_meta) in processing.iter().enumerate() {
		let hash = result_meta.result.transaction_hash.0;
		let envelope = by_hash.remove(&hash);
		transactions.push(decode_transaction(index as u32, hash, envelope, result_meta));
	}

	Ok(DecodedLedger { sequence, close_time, transactions })
}

fn tx_set_envelopes(tx_set: &xdr::GeneralizedTransactionSet) -> Vec<xdr::TransactionEnvelope> {
	let mut envelopes = vec![];
	match tx_set {
		xdr::GeneralizedTransactionSet::V1(set) => {
			for phase in set.phases.iter() {
				match phase {
					xdr::TransactionPhase::V0(components) => {
						for component in components.iter() {
							let xdr::TxSetComponent::TxsetCompTxsMaybeDiscountedFee(c) =
								component;
							envelopes.extend(c.txs.iter().cloned());
						}
					},
				}
			}
		},
	}
	envelopes
}

fn decode_transaction(
	index: u32,
	hash: [u8; 32],
	envelope: Option<xdr::TransactionEnvelope>,
	result_meta: &xdr::TransactionResultMeta,
) -> DecodedTransaction {
	let result = &result_meta.result.result;
	let successful = matches!(
		result.result,
		xdr::TransactionResultResult::TxSuccess(_)
			| xdr::TransactionResultResult::TxFeeBumpInnerSuccess(_)
	);

	let (source, raw_operations) = match &envelope {
		Some(envelope) => envelope_parts(envelope),
		None => (Address::new("unknown"), vec![]),
	};

	let op_metas: Vec<xdr::LedgerEntryChanges> = match &result_meta.tx_apply_processing {
		xdr::TransactionMeta::V0(ops) => ops.iter().map(|m| m.changes.clone()).collect(),
		xdr::TransactionMeta::V1(v1) => v1.operations.iter().map(|m| m.changes.clone()).collect(),
		xdr::TransactionMeta::V2(v2) => v2.operations.iter().map(|m| m.changes.clone()).collect(),
		xdr::TransactionMeta::V3(v3) => v3.operations.iter().map(|m| m.changes.clone()).collect(),
	};
	let soroban_events: Vec<xdr::ContractEvent> = match &result_meta.tx_apply_processing {
		xdr::TransactionMeta::V3(v3) => v3
			.soroban_meta
			.as_ref()
			.map(|m| m.events.to_vec())
			.unwrap_or_default(),
		_ => vec![],
	};

	let mut operations = vec![];
	for (op_pos, op) in raw_operations.iter().enumerate() {
		let invoking_account = op
			.source_account
			.as_ref()
			.map(muxed_to_address)
			.unwrap_or_else(|| source.clone());
		let kind = operation_kind(&op.body, op_metas.get(op_pos));
		let data_changes = op_metas
			.get(op_pos)
			.map(|changes| contract_data_changes(changes))
			.unwrap_or_default();
		// Soroban transactions carry exactly one host-function
		// operation; its meta events belong to it
		let contract_events =
			if op_pos == 0 { soroban_events.clone() } else { vec![] };
		operations.push(DecodedOperation {
			index: op_pos as u32 + 1,
			invoking_account,
			kind,
			contract_events,
			data_changes,
		});
	}

	DecodedTransaction {
		index,
		hash: TxHash(hash),
		successful,
		fee_charged: result.fee_charged,
		source,
		operations,
	}
}

fn envelope_parts(envelope: &xdr::TransactionEnvelope) -> (Address, Vec<xdr::Operation>) {
	match envelope {
		xdr::TransactionEnvelope::TxV0(v0) => (
			ed25519_to_address(&v0.tx.source_account_ed25519.0),
			v0.tx.operations.to_vec(),
		),
		xdr::TransactionEnvelope::Tx(v1) => (
			muxed_to_address(&v1.tx.source_account),
			v1.tx.operations.to_vec(),
		),
		xdr::TransactionEnvelope::TxFeeBump(bump) => {
			let xdr::FeeBumpTransactionInnerTx::Tx(inner) = &bump.tx.inner_tx;
			(muxed_to_address(&inner.tx.source_account), inner.tx.operations.to_vec())
		},
	}
}

fn operation_kind(
	body: &xdr::OperationBody,
	changes: Option<&xdr::LedgerEntryChanges>,
) -> OperationKind {
	let xdr::OperationBody::InvokeHostFunction(op) = body else {
		return OperationKind::Other;
	};
	match &op.host_function {
		xdr::HostFunction::InvokeContract(invoke) => OperationKind::InvokeContract {
			contract: sc_address_to_address(&invoke.contract_address),
			function: invoke.function_name.to_utf8_string_lossy(),
			args: invoke
				.args
				.iter()
				.filter_map(|arg| arg.to_xdr(xdr::Limits::none()).ok())
				.collect(),
		},
		xdr::HostFunction::CreateContract(create) => OperationKind::CreateContract {
			contract: changes.and_then(created_contract),
			wasm_hash: executable_wasm_hash(&create.executable),
		},
		xdr::HostFunction::CreateContractV2(create) => OperationKind::CreateContract {
			contract: changes.and_then(created_contract),
			wasm_hash: executable_wasm_hash(&create.executable),
		},
		xdr::HostFunction::UploadContractWasm(code) => {
			OperationKind::UploadWasm { wasm_hash: Sha256::digest(code.as_slice()).to_vec() }
		},
	}
}

fn executable_wasm_hash(executable: &xdr::ContractExecutable) -> Option<Vec<u8>> {
	match executable {
		xdr::ContractExecutable::Wasm(hash) => Some(hash.0.to_vec()),
		xdr::ContractExecutable::StellarAsset => None,
	}
}

/// The address of a contract instance created by this operation,
/// recovered from the instance entry in the change set
fn created_contract(changes: &xdr::LedgerEntryChanges) -> Option<Address> {
	changes.iter().find_map(|change| match change {
		xdr::LedgerEntryChange::Created(entry) => match &entry.data {
			xdr::LedgerEntryData::ContractData(data)
				if matches!(data.key, xdr::ScVal::LedgerKeyContractInstance) =>
			{
				Some(sc_address_to_address(&data.contract))
			},
			_ => None,
		},
		_ => None,
	})
}

fn contract_data_changes(changes: &xdr::LedgerEntryChanges) -> Vec<DataChange> {
	let mut out = vec![];
	for change in changes.iter() {
		let (kind, contract, key, durability) = match change {
			xdr::LedgerEntryChange::Created(entry) => match &entry.data {
				xdr::LedgerEntryData::ContractData(d) => {
					(DataChangeKind::Created, &d.contract, &d.key, d.durability.clone())
				},
				_ => continue,
			},
			xdr::LedgerEntryChange::Updated(entry) => match &entry.data {
				xdr::LedgerEntryData::ContractData(d) => {
					(DataChangeKind::Updated, &d.contract, &d.key, d.durability.clone())
				},
				_ => continue,
			},
			xdr::LedgerEntryChange::Removed(key) => match key {
				xdr::LedgerKey::ContractData(k) => {
					(DataChangeKind::Removed, &k.contract, &k.key, k.durability.clone())
				},
				_ => continue,
			},
			xdr::LedgerEntryChange::State(_) => continue,
		};
		// Instance entries already surface through create events
		if matches!(key, xdr::ScVal::LedgerKeyContractInstance) {
			continue;
		}
		out.push(DataChange {
			contract: sc_address_to_address(contract),
			key_xdr: key.to_xdr(xdr::Limits::none()).unwrap_or_default(),
			kind,
			durability: match durability {
				xdr::ContractDataDurability::Temporary => Durability::Temporary,
				xdr::ContractDataDurability::Persistent => Durability::Persistent,
			},
		});
	}
	out
}

pub fn network_id(network: &NetworkId) -> [u8; 32] {
	Sha256::digest(network.passphrase().as_bytes()).into()
}

/// Transaction hash over the signature payload, the identity the rest
/// of the ecosystem indexes by
pub fn envelope_hash(network_id: &[u8; 32], envelope: &xdr::TransactionEnvelope) -> [u8; 32] {
	let tagged = match envelope {
		xdr::TransactionEnvelope::TxV0(v0) => {
			xdr::TransactionSignaturePayloadTaggedTransaction::Tx(v0_to_v1(&v0.tx))
		},
		xdr::TransactionEnvelope::Tx(v1) => {
			xdr::TransactionSignaturePayloadTaggedTransaction::Tx(v1.tx.clone())
		},
		xdr::TransactionEnvelope::TxFeeBump(bump) => {
			xdr::TransactionSignaturePayloadTaggedTransaction::TxFeeBump(bump.tx.clone())
		},
	};
	let payload = xdr::TransactionSignaturePayload {
		network_id: xdr::Hash(*network_id),
		tagged_transaction: tagged,
	};
	match payload.to_xdr(xdr::Limits::none()) {
		Ok(bytes) => Sha256::digest(&bytes).into(),
		Err(_) => [0; 32],
	}
}

fn v0_to_v1(tx: &xdr::TransactionV0) -> xdr::Transaction {
	xdr::Transaction {
		source_account: xdr::MuxedAccount::Ed25519(tx.source_account_ed25519.clone()),
		fee: tx.fee,
		seq_num: tx.seq_num.clone(),
		cond: match &tx.time_bounds {
			Some(bounds) => xdr::Preconditions::Time(bounds.clone()),
			None => xdr::Preconditions::None,
		},
		memo: tx.memo.clone(),
		operations: tx.operations.clone(),
		ext: xdr::TransactionExt::V0,
	}
}

pub fn muxed_to_address(account: &xdr::MuxedAccount) -> Address {
	match account {
		xdr::MuxedAccount::Ed25519(key) => ed25519_to_address(&key.0),
		xdr::MuxedAccount::MuxedEd25519(muxed) => ed25519_to_address(&muxed.ed25519.0),
	}
}

fn ed25519_to_address(bytes: &[u8; 32]) -> Address {
	Address::new(stellar_strkey::ed25519::PublicKey(*bytes).to_string())
}

pub fn sc_address_to_address(address: &xdr::ScAddress) -> Address {
	match address {
		xdr::ScAddress::Account(xdr::AccountId(xdr::PublicKey::PublicKeyTypeEd25519(key))) => {
			ed25519_to_address(&key.0)
		},
		xdr::ScAddress::Contract(hash) => {
			Address::new(stellar_strkey::Contract(hash.0).to_string())
		},
	}
}
