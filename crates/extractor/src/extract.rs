use tracing::instrument;

use common::{
	event::{
		ContractCallBody, ContractDataChangeBody, CreateContractBody, DomainEvent, EventBody,
		EventEnvelope, FeeBody, UploadWasmBody,
	},
	Binary, EventFilter, NetworkId, RawLedger,
};
use common::event::Address;

use crate::{
	classify::classify_contract_event,
	decode::{decode_ledger, DecodedLedger, ExtractError, OperationKind},
};

/// Stateless transform from raw ledgers to ordered domain events.
/// Decodes each ledger exactly once and walks transactions in
/// application order, operations in position order, and each
/// operation's events in semantic order. Failure to extract is fatal
/// for the whole ledger, never partial.
#[derive(Debug, Clone)]
pub struct Extractor {
	network: NetworkId,
}

impl Extractor {
	pub fn new(network: NetworkId) -> Self {
		Self { network }
	}

	#[instrument(skip(self, raw), fields(sequence = %raw.sequence))]
	pub fn extract(&self, raw: &RawLedger) -> Result<Vec<DomainEvent>, ExtractError> {
		let decoded = decode_ledger(&self.network, raw.sequence, &raw.bytes)?;
		Ok(self.walk(&decoded))
	}

	/// Extract then apply the filter, preserving order. Surviving
	/// events keep the cursors assigned at extraction; filtering
	/// never renumbers.
	pub fn extract_filtered(
		&self,
		raw: &RawLedger,
		filter: &EventFilter,
	) -> Result<(Vec<DomainEvent>, usize), ExtractError> {
		let events = self.extract(raw)?;
		let total = events.len();
		let kept: Vec<_> = events.into_iter().filter(|e| filter.matches(e)).collect();
		let dropped = total - kept.len();
		Ok((kept, dropped))
	}

	fn walk(&self, ledger: &DecodedLedger) -> Vec<DomainEvent> {
		let mut out = vec![];
		for tx in &ledger.transactions {
			let mut envelope = EventEnvelope {
				ledger_sequence: ledger.sequence,
				tx_hash: tx.hash,
				tx_index: tx.index,
				op_index: 0,
				event_index: 0,
				close_time: ledger.close_time,
				successful: tx.successful,
			};

			// Operation index zero is the transaction level: the fee
			// event sorts ahead of every operation's events
			out.push(DomainEvent {
				envelope: envelope.clone(),
				body: EventBody::Fee(FeeBody {
					source: tx.source.clone(),
					fee_charged: tx.fee_charged,
				}),
			});

			for op in &tx.operations {
				envelope.op_index = op.index;
				envelope.event_index = 0;

				// The host function invocation itself leads, then the
				// events it emitted, then the data entries it touched
				match &op.kind {
					OperationKind::InvokeContract { contract, function, args } => {
						out.push(DomainEvent {
							envelope: envelope.clone(),
							body: EventBody::ContractCall(ContractCallBody {
								contract: contract.clone(),
								function: function.clone(),
								invoking_account: op.invoking_account.clone(),
								state_changes: op.data_changes.len() as u32,
								args: args.iter().cloned().map(Binary::new).collect(),
							}),
						});
						envelope.event_index += 1;
					},
					OperationKind::CreateContract { contract, wasm_hash } => {
						out.push(DomainEvent {
							envelope: envelope.clone(),
							body: EventBody::CreateContract(CreateContractBody {
								contract: contract
									.clone()
									.unwrap_or_else(|| Address::new("unknown")),
								deployer: op.invoking_account.clone(),
								wasm_hash: wasm_hash.clone().map(Binary::new),
							}),
						});
						envelope.event_index += 1;
					},
					OperationKind::UploadWasm { wasm_hash } => {
						out.push(DomainEvent {
							envelope: envelope.clone(),
							body: EventBody::UploadWasm(UploadWasmBody {
								uploader: op.invoking_account.clone(),
								wasm_hash: Binary::new(wasm_hash.clone()),
							}),
						});
						envelope.event_index += 1;
					},
					OperationKind::Other => {},
				}

				for event in &op.contract_events {
					out.push(DomainEvent {
						envelope: envelope.clone(),
						body: classify_contract_event(event),
					});
					envelope.event_index += 1;
				}

				for change in &op.data_changes {
					out.push(DomainEvent {
						envelope: envelope.clone(),
						body: EventBody::ContractDataChange(ContractDataChangeBody {
							contract: change.contract.clone(),
							key: Binary::new(change.key_xdr.clone()),
							change: change.kind,
							durability: change.durability,
						}),
					});
					envelope.event_index += 1;
				}
			}
		}
		out
	}
}

#[cfg(test)]
mod test {
	use stellar_xdr::curr as xdr;
	use stellar_xdr::curr::WriteXdr;

	use super::*;
	use common::EventKind;

	fn network() -> NetworkId {
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

	fn invoke_envelope(network: &NetworkId) -> (xdr::TransactionEnvelope, [u8; 32]) {
		let tx = xdr::Transaction {
			source_account: xdr::MuxedAccount::Ed25519(xdr::Uint256([7; 32])),
			fee: 100,
			seq_num: xdr::SequenceNumber(1),
			cond: xdr::Preconditions::None,
			memo: xdr::Memo::None,
			operations: vec![xdr::Operation {
				source_account: None,
				body: xdr::OperationBody::InvokeHostFunction(xdr::InvokeHostFunctionOp {
					host_function: xdr::HostFunction::InvokeContract(
						xdr::InvokeContractArgs {
							contract_address: xdr::ScAddress::Contract(xdr::Hash([9; 32])),
							function_name: xdr::ScSymbol(
								"swap".as_bytes().try_into().unwrap(),
							),
							args: vec![i128_val(42)].try_into().unwrap(),
						},
					),
					auth: vec![].try_into().unwrap(),
				}),
			}]
			.try_into()
			.unwrap(),
			ext: xdr::TransactionExt::V0,
		};
		let envelope = xdr::TransactionEnvelope::Tx(xdr::TransactionV1Envelope {
			tx,
			signatures: vec![].try_into().unwrap(),
		});
		let hash = crate::decode::envelope_hash(
			&crate::decode::network_id(network),
			&envelope,
		);
		(envelope, hash)
	}

	fn successful_result(hash: [u8; 32], fee: i64) -> xdr::TransactionResultPair {
		xdr::TransactionResultPair {
			transaction_hash: xdr::Hash(hash),
			result: xdr::TransactionResult {
				fee_charged: fee,
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
		}
	}

	fn ledger_with_transfers(sequence: u32, amounts: &[i128]) -> RawLedger {
		let network = network();
		let (envelope, hash) = invoke_envelope(&network);

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
			tx_changes_before: xdr::LedgerEntryChanges(vec![].try_into().unwrap()),
			operations: vec![xdr::OperationMeta {
				changes: xdr::LedgerEntryChanges(vec![].try_into().unwrap()),
			}]
			.try_into()
			.unwrap(),
			tx_changes_after: xdr::LedgerEntryChanges(vec![].try_into().unwrap()),
			soroban_meta: Some(soroban_meta),
		});

		let header = xdr::LedgerHeaderHistoryEntry {
			hash: xdr::Hash([0; 32]),
			header: xdr::LedgerHeader {
				ledger_version: 22,
				previous_ledger_hash: xdr::Hash([0; 32]),
				scp_value: xdr::StellarValue {
					tx_set_hash: xdr::Hash([0; 32]),
					close_time: xdr::TimePoint(1_700_000_000),
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

		let meta = xdr::LedgerCloseMeta::V1(xdr::LedgerCloseMetaV1 {
			ext: xdr::LedgerCloseMetaExt::V0,
			ledger_header: header,
			tx_set,
			tx_processing: vec![xdr::TransactionResultMeta {
				result: successful_result(hash, 100),
				fee_processing: xdr::LedgerEntryChanges(vec![].try_into().unwrap()),
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
			chrono::TimeZone::timestamp_opt(&chrono::Utc, 1_700_000_000, 0).unwrap(),
		)
	}

	#[test]
	fn canonical_order_and_cursors() {
		let raw = ledger_with_transfers(100, &[5, 50, 500]);
		let events = Extractor::new(network()).extract(&raw).unwrap();

		// fee, contract call, then the three transfers
		assert_eq!(events[0].kind(), EventKind::Fee);
		assert_eq!(events[1].kind(), EventKind::ContractCall);
		assert_eq!(events[2].kind(), EventKind::Transfer);
		assert_eq!(events.len(), 5);

		let cursors: Vec<_> = events.iter().map(|e| e.cursor()).collect();
		let mut sorted = cursors.clone();
		sorted.sort();
		sorted.dedup();
		assert_eq!(cursors, sorted, "cursors must be strictly increasing");

		// envelope fields round the walk
		assert!(events.iter().all(|e| e.envelope.ledger_sequence.value() == 100));
		assert!(events.iter().all(|e| e.envelope.successful));
		match &events[2].body {
			EventBody::Transfer(transfer) => assert_eq!(transfer.amount.decimal(), "5"),
			other => panic!("expected transfer, got {other:?}"),
		}
	}

	#[test]
	fn tx_hash_matches_signature_payload() {
		let raw = ledger_with_transfers(100, &[5]);
		let events = Extractor::new(network()).extract(&raw).unwrap();
		let (_, expected) = invoke_envelope(&network());
		assert_eq!(events[0].envelope.tx_hash.0, expected);
	}

	#[test]
	fn filter_is_monotone() {
		let raw = ledger_with_transfers(100, &[5, 50, 500]);
		let extractor = Extractor::new(network());

		let unfiltered = extractor
			.extract_filtered(&raw, &EventFilter::default())
			.unwrap();
		let narrowed = extractor
			.extract_filtered(
				&raw,
				&EventFilter { min_amount: Some("1000".into()), ..Default::default() },
			)
			.unwrap();
		assert!(narrowed.0.len() <= unfiltered.0.len());
		// min_amount drops all three transfers, keeps fee + call
		assert_eq!(narrowed.0.len(), 2);
		assert_eq!(narrowed.1, 3);
	}

	#[test]
	fn corrupt_ledger_is_fatal() {
		let raw = RawLedger::new(
			100,
			vec![1, 2, 3],
			network(),
			chrono::TimeZone::timestamp_opt(&chrono::Utc, 0, 0).unwrap(),
		);
		assert!(matches!(
			Extractor::new(network()).extract(&raw),
			Err(ExtractError::Xdr { .. })
		));
	}

	#[test]
	fn sequence_mismatch_is_fatal() {
		let mut raw = ledger_with_transfers(100, &[5]);
		raw.sequence = 101.into();
		assert!(matches!(
			Extractor::new(network()).extract(&raw),
			Err(ExtractError::SequenceMismatch { .. })
		));
	}

}
