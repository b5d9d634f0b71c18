//! Synthetic ledger construction for end-to-end tests: real XDR close
//! meta frames, loaded into the in-memory backend.

use sha2::{Digest, Sha256};
use stellar_xdr::curr as xdr;
use stellar_xdr::curr::WriteXdr;

use common::{NetworkId, RawLedger};
use ledger_source::InMemoryBackend;

pub fn network() -> NetworkId {
	NetworkId::new("Test SDF Network ; September 2015")
}

fn symbol(s: &str) -> xdr::ScVal {
	xdr::ScVal::Symbol(xdr::ScSymbol(s.as_bytes().try_into().unwrap()))
}

fn account(byte: u8) -> xdr::ScVal {
	xdr::ScVal::Address(xdr::ScAddress::Account(xdr::AccountId(
		xdr::PublicKey::PublicKeyTypeEd25519(xdr::Uint256([byte; 32])),
	)))
}

fn i128_val(value: i128) -> xdr::ScVal {
	xdr::ScVal::I128(xdr::Int128Parts { hi: (value >> 64) as i64, lo: value as u64 })
}

fn transfer_event(amount: i128) -> xdr::ContractEvent {
	xdr::ContractEvent {
		ext: xdr::ExtensionPoint::V0,
		contract_id: Some(xdr::Hash([9; 32])),
		type_: xdr::ContractEventType::Contract,
		body: xdr::ContractEventBody::V0(xdr::ContractEventV0 {
			topics: vec![symbol("transfer"), account(1), account(2)].try_into().unwrap(),
			data: i128_val(amount),
		}),
	}
}

fn envelope(sequence: u32) -> xdr::TransactionEnvelope {
	let tx = xdr::Transaction {
		source_account: xdr::MuxedAccount::Ed25519(xdr::Uint256([7; 32])),
		fee: 100,
		// Varies per ledger so every tx hash is unique
		seq_num: xdr::SequenceNumber(i64::from(sequence)),
		cond: xdr::Preconditions::None,
		memo: xdr::Memo::None,
		operations: vec![xdr::Operation {
			source_account: None,
			body: xdr::OperationBody::InvokeHostFunction(xdr::InvokeHostFunctionOp {
				host_function: xdr::HostFunction::InvokeContract(xdr::InvokeContractArgs {
					contract_address: xdr::ScAddress::Contract(xdr::Hash([9; 32])),
					function_name: xdr::ScSymbol("swap".as_bytes().try_into().unwrap()),
					args: vec![].try_into().unwrap(),
				}),
				auth: vec![].try_into().unwrap(),
			}),
		}]
		.try_into()
		.unwrap(),
		ext: xdr::TransactionExt::V0,
	};
	xdr::TransactionEnvelope::Tx(xdr::TransactionV1Envelope {
		tx,
		signatures: vec![].try_into().unwrap(),
	})
}

fn envelope_hash(network: &NetworkId, envelope: &xdr::TransactionEnvelope) -> [u8; 32] {
	let xdr::TransactionEnvelope::Tx(v1) = envelope else { unreachable!() };
	let payload = xdr::TransactionSignaturePayload {
		network_id: xdr::Hash(Sha256::digest(network.passphrase().as_bytes()).into()),
		tagged_transaction: xdr::TransactionSignaturePayloadTaggedTransaction::Tx(
			v1.tx.clone(),
		),
	};
	Sha256::digest(payload.to_xdr(xdr::Limits::none()).unwrap()).into()
}

fn empty_changes() -> xdr::LedgerEntryChanges {
	xdr::LedgerEntryChanges(vec![].try_into().unwrap())
}

/// One ledger close meta frame: a single soroban transaction emitting
/// `amounts` as transfer events
pub fn ledger_with_transfers(sequence: u32, amounts: &[i128]) -> RawLedger {
	let network = network();
	let envelope = envelope(sequence);
	let hash = envelope_hash(&network, &envelope);

	let soroban_meta = xdr::SorobanTransactionMeta {
		ext: xdr::SorobanTransactionMetaExt::V0,
		events: amounts
			.iter()
			.map(|amount| transfer_event(*amount))
			.collect::<Vec<_>>()
			.try_into()
			.unwrap(),
		return_value: xdr::ScVal::Void,
		diagnostic_events: vec![].try_into().unwrap(),
	};
	let tx_meta = xdr::TransactionMeta::V3(xdr::TransactionMetaV3 {
		ext: xdr::ExtensionPoint::V0,
		tx_changes_before: empty_changes(),
		operations: vec![xdr::OperationMeta { changes: empty_changes() }]
			.try_into()
			.unwrap(),
		tx_changes_after: empty_changes(),
		soroban_meta: Some(soroban_meta),
	});

	let header = xdr::LedgerHeaderHistoryEntry {
		hash: xdr::Hash([0; 32]),
		header: xdr::LedgerHeader {
			ledger_version: 22,
			previous_ledger_hash: xdr::Hash([0; 32]),
			scp_value: xdr::StellarValue {
				tx_set_hash: xdr::Hash([0; 32]),
				close_time: xdr::TimePoint(1_700_000_000 + u64::from(sequence) * 5),
				upgrades: vec![].try_into().unwrap(),
				ext: xdr::StellarValueExt::Basic,
			},
			tx_set_result_hash: xdr::Hash([0; 32]),
			bucket_list_hash: xdr::Hash([0; 32]),
			ledger_seq: sequence,
			total_coins: 0,
			fee_pool: 0,
			inflation_seq: 0,
			id_pool: 0,
			base_fee: 100,
			base_reserve: 5_000_000,
			max_tx_set_size: 1000,
			skip_list: [
				xdr::Hash([0; 32]),
				xdr::Hash([0; 32]),
				xdr::Hash([0; 32]),
				xdr::Hash([0; 32]),
			],
			ext: xdr::LedgerHeaderExt::V0,
		},
		ext: xdr::LedgerHeaderHistoryEntryExt::V0,
	};

	let tx_set = xdr::GeneralizedTransactionSet::V1(xdr::TransactionSetV1 {
		previous_ledger_hash: xdr::Hash([0; 32]),
		phases: vec![xdr::TransactionPhase::V0(
			vec![xdr::TxSetComponent::TxsetCompTxsMaybeDiscountedFee(
				xdr::TxSetComponentTxsMaybeDiscountedFee {
					base_fee: None,
					txs: vec![envelope].try_into().unwrap(),
				},
			)]
			.try_into()
			.unwrap(),
		)]
		.try_into()
		.unwrap(),
	});

	let result = xdr::TransactionResultPair {
		transaction_hash: xdr::Hash(hash),
		result: xdr::TransactionResult {
			fee_charged: 100,
			result: xdr::TransactionResultResult::TxSuccess(
				vec![xdr::OperationResult::OpInner(
					xdr::OperationResultTr::InvokeHostFunction(
						xdr::InvokeHostFunctionResult::Success(xdr::Hash([0; 32])),
					),
				)]
				.try_into()
				.unwrap(),
			),
			ext: xdr::TransactionResultExt::V0,
		},
	};

	let meta = xdr::LedgerCloseMeta::V1(xdr::LedgerCloseMetaV1 {
		ext: xdr::LedgerCloseMetaExt::V0,
		ledger_header: header,
		tx_set,
		tx_processing: vec![xdr::TransactionResultMeta {
			result,
			fee_processing: empty_changes(),
			tx_apply_processing: tx_meta,
		}]
		.try_into()
		.unwrap(),
		upgrades_processing: vec![].try_into().unwrap(),
		scp_info: vec![].try_into().unwrap(),
		total_byte_size_of_bucket_list: 0,
		evicted_temporary_ledger_keys: vec![].try_into().unwrap(),
		evicted_persistent_ledger_entries: vec![].try_into().unwrap(),
	});

	RawLedger::new(
		sequence,
		meta.to_xdr(xdr::Limits::none()).unwrap(),
		network,
		chrono::TimeZone::timestamp_opt(
			&chrono::Utc,
			1_700_000_000 + i64::from(sequence) * 5,
			0,
		)
		.unwrap(),
	)
}

/// Backend preloaded with real close meta for `[start, end]`
pub fn backend_with_ledgers(start: u32, end: u32, amounts: &[i128]) -> InMemoryBackend {
	let backend = InMemoryBackend::new(network());
	for seq in start..=end {
		backend.insert(ledger_with_transfers(seq, amounts));
	}
	backend
}
