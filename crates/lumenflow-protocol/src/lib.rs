use chrono::TimeZone;

use common::{DomainEvent, EventFilter, NetworkId, RawLedger};

pub mod v1 {
	tonic::include_proto!("lumenflow.v1");
}

pub mod control {
	tonic::include_proto!("lumenflow.control.v1");
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
	#[error("Frame carried no envelope")]
	MissingEnvelope,

	#[error("Malformed tx hash: {0}")]
	TxHash(String),

	#[error("Body is not canonical JSON: {0}")]
	Body(
		#[from]
		#[source]
		serde_json::Error,
	),

	#[error("Unrecognized filter field: {0}")]
	Filter(String),
}

impl From<&RawLedger> for v1::RawLedgerFrame {
	fn from(ledger: &RawLedger) -> Self {
		v1::RawLedgerFrame {
			sequence: ledger.sequence.value(),
			payload: ledger.bytes.clone(),
			network: ledger.network.passphrase().to_owned(),
			close_time_unix: ledger.close_time.timestamp(),
		}
	}
}

impl From<v1::RawLedgerFrame> for RawLedger {
	fn from(frame: v1::RawLedgerFrame) -> Self {
		RawLedger::new(
			frame.sequence,
			frame.payload,
			NetworkId::new(frame.network),
			chrono::Utc
				.timestamp_opt(frame.close_time_unix, 0)
				.single()
				.unwrap_or_else(|| chrono::Utc.timestamp_opt(0, 0).unwrap()),
		)
	}
}

impl From<&DomainEvent> for v1::EventFrame {
	fn from(event: &DomainEvent) -> Self {
		let envelope = &event.envelope;
		v1::EventFrame {
			envelope: Some(v1::EventEnvelope {
				ledger_sequence: envelope.ledger_sequence.value(),
				tx_hash: envelope.tx_hash.to_string(),
				tx_index: envelope.tx_index,
				op_index: envelope.op_index,
				event_index: envelope.event_index,
				close_time_unix: envelope.close_time.timestamp(),
				successful: envelope.successful,
			}),
			kind: event.kind().to_string(),
			body_json: serde_json::to_vec(&event.body).unwrap_or_default(),
		}
	}
}

impl TryFrom<v1::EventFrame> for DomainEvent {
	type Error = WireError;

	fn try_from(frame: v1::EventFrame) -> Result<Self, Self::Error> {
		let envelope = frame.envelope.ok_or(WireError::MissingEnvelope)?;
		let mut hash = [0u8; 32];
		let bytes =
			hex::decode(&envelope.tx_hash).map_err(|_| WireError::TxHash(envelope.tx_hash.clone()))?;
		if bytes.len() != 32 {
			return Err(WireError::TxHash(envelope.tx_hash));
		}
		hash.copy_from_slice(&bytes);

		Ok(DomainEvent {
			envelope: common::EventEnvelope {
				ledger_sequence: envelope.ledger_sequence.into(),
				tx_hash: common::event::TxHash(hash),
				tx_index: envelope.tx_index,
				op_index: envelope.op_index,
				event_index: envelope.event_index,
				close_time: chrono::Utc
					.timestamp_opt(envelope.close_time_unix, 0)
					.single()
					.unwrap_or_else(|| chrono::Utc.timestamp_opt(0, 0).unwrap()),
				successful: envelope.successful,
			},
			body: serde_json::from_slice(&frame.body_json)?,
		})
	}
}

impl TryFrom<&v1::EventFilters> for EventFilter {
	type Error = WireError;

	fn try_from(filters: &v1::EventFilters) -> Result<Self, Self::Error> {
		let event_types = filters
			.event_types
			.iter()
			.map(|t| t.parse().map_err(|_| WireError::Filter(t.clone())))
			.collect::<Result<_, _>>()?;
		let filter = EventFilter {
			contract_ids: filters.contract_ids.iter().cloned().collect(),
			event_types,
			invoking_accounts: filters.invoking_accounts.iter().cloned().collect(),
			function_names: filters.function_names.iter().cloned().collect(),
			successful_only: filters.successful_only,
			min_amount: if filters.min_amount.is_empty() {
				None
			} else {
				Some(filters.min_amount.clone())
			},
			require_state_changes: filters.require_state_changes,
			include_failed: filters.include_failed,
		};
		filter.validate().map_err(|e| WireError::Filter(e.to_string()))?;
		Ok(filter)
	}
}

#[cfg(test)]
mod test {
	use chrono::TimeZone;
	use common::{
		event::{Address, EventBody, EventEnvelope, TransferBody, TxHash},
		Amount,
	};

	use super::*;

	fn event() -> DomainEvent {
		DomainEvent {
			envelope: EventEnvelope {
				ledger_sequence: 100.into(),
				tx_hash: TxHash([5; 32]),
				tx_index: 1,
				op_index: 1,
				event_index: 2,
				close_time: chrono::Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
				successful: true,
			},
			body: EventBody::Transfer(TransferBody {
				contract: Address::new("CCONTRACT"),
				from: Address::new("GFROM"),
				to: Address::new("GTO"),
				amount: Amount::from_i128(-500),
				asset: None,
			}),
		}
	}

	#[test]
	fn event_frame_round_trip() {
		let original = event();
		let frame = v1::EventFrame::from(&original);
		assert_eq!(frame.kind, "transfer");
		let decoded = DomainEvent::try_from(frame).unwrap();
		assert_eq!(decoded, original);
	}

	#[test]
	fn raw_ledger_round_trip() {
		let original = RawLedger::new(
			42,
			vec![1, 2, 3],
			NetworkId::new("Test SDF Network ; September 2015"),
			chrono::Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
		);
		let frame = v1::RawLedgerFrame::from(&original);
		let decoded = RawLedger::from(frame);
		assert_eq!(decoded, original);
	}

	#[test]
	fn filters_convert_and_validate() {
		let wire = v1::EventFilters {
			contract_ids: vec!["CA".into()],
			event_types: vec!["transfer".into(), "mint".into()],
			invoking_accounts: vec![],
			function_names: vec![],
			successful_only: true,
			min_amount: "1000".into(),
			require_state_changes: false,
			include_failed: false,
		};
		let filter = EventFilter::try_from(&wire).unwrap();
		assert_eq!(filter.event_types.len(), 2);
		assert_eq!(filter.min_amount.as_deref(), Some("1000"));

		let bad = v1::EventFilters { event_types: vec!["bogus".into()], ..wire };
		assert!(EventFilter::try_from(&bad).is_err());
	}

	#[test]
	fn frame_without_envelope_is_rejected() {
		let frame = v1::EventFrame {
			envelope: None,
			kind: "transfer".into(),
			body_json: b"{}".to_vec(),
		};
		assert!(matches!(DomainEvent::try_from(frame), Err(WireError::MissingEnvelope)));
	}
}
