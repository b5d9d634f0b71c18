use stellar_xdr::curr as xdr;
use stellar_xdr::curr::WriteXdr;

use common::{
	amount::{I128Parts, I256Parts, U128Parts, U256Parts},
	event::{Address, Binary, BurnBody, ContractEventBody, EventBody, MintBody, TransferBody},
	Amount,
};

use crate::decode::sc_address_to_address;

/// Classify a contract event against the token interface shapes:
/// `["transfer", from, to, asset?] data=amount`, `["mint", admin, to,
/// asset?] data=amount`, `["burn", from, asset?] data=amount`.
/// Anything that does not match exactly stays a generic contract
/// event.
pub fn classify_contract_event(event: &xdr::ContractEvent) -> EventBody {
	let contract = event
		.contract_id
		.as_ref()
		.map(|id| Address::new(stellar_strkey::Contract(id.0).to_string()));

	let xdr::ContractEventBody::V0(body) = &event.body;

	if let Some(classified) = classify_token_event(contract.as_ref(), body) {
		return classified;
	}

	EventBody::ContractEvent(ContractEventBody {
		contract,
		topics: body.topics.iter().map(|t| Binary::new(to_xdr_bytes(t))).collect(),
		data: Binary::new(to_xdr_bytes(&body.data)),
	})
}

fn classify_token_event(
	contract: Option<&Address>,
	body: &xdr::ContractEventV0,
) -> Option<EventBody> {
	let contract = contract?.clone();
	let topics: Vec<&xdr::ScVal> = body.topics.iter().collect();
	let name = match topics.first() {
		Some(xdr::ScVal::Symbol(symbol)) => symbol.to_utf8_string_lossy(),
		_ => return None,
	};
	let amount = sc_val_amount(&body.data)?;

	match (name.as_str(), topics.len()) {
		("transfer", 3 | 4) => Some(EventBody::Transfer(TransferBody {
			contract,
			from: topic_address(topics[1])?,
			to: topic_address(topics[2])?,
			amount,
			asset: topics.get(3).and_then(|t| topic_asset(t)),
		})),
		("mint", 3 | 4) => Some(EventBody::Mint(MintBody {
			contract,
			admin: topic_address(topics[1])?,
			to: topic_address(topics[2])?,
			amount,
		})),
		("burn", 2 | 3) => Some(EventBody::Burn(BurnBody {
			contract,
			from: topic_address(topics[1])?,
			amount,
		})),
		_ => None,
	}
}

fn topic_address(val: &xdr::ScVal) -> Option<Address> {
	match val {
		xdr::ScVal::Address(address) => Some(sc_address_to_address(address)),
		_ => None,
	}
}

/// SEP-11 asset designator carried in the trailing topic of asset
/// contract events
fn topic_asset(val: &xdr::ScVal) -> Option<String> {
	match val {
		xdr::ScVal::String(s) => Some(s.to_utf8_string_lossy()),
		xdr::ScVal::Symbol(s) => Some(s.to_utf8_string_lossy()),
		_ => None,
	}
}

/// Large integer values keep their limbs; token amounts on the wire
/// are i128 but custom contracts emit wider types too
pub fn sc_val_amount(val: &xdr::ScVal) -> Option<Amount> {
	match val {
		xdr::ScVal::I64(v) => Some(Amount::I64(*v)),
		xdr::ScVal::U64(v) => Some(Amount::from_i128(*v as i128)),
		xdr::ScVal::I128(parts) => {
			Some(Amount::I128(I128Parts { hi: parts.hi, lo: parts.lo }))
		},
		xdr::ScVal::U128(parts) => {
			Some(Amount::U128(U128Parts { hi: parts.hi, lo: parts.lo }))
		},
		xdr::ScVal::I256(parts) => Some(Amount::I256(I256Parts {
			hi_hi: parts.hi_hi,
			hi_lo: parts.hi_lo,
			lo_hi: parts.lo_hi,
			lo_lo: parts.lo_lo,
		})),
		xdr::ScVal::U256(parts) => Some(Amount::U256(U256Parts {
			hi_hi: parts.hi_hi,
			hi_lo: parts.hi_lo,
			lo_hi: parts.lo_hi,
			lo_lo: parts.lo_lo,
		})),
		_ => None,
	}
}

fn to_xdr_bytes(val: &xdr::ScVal) -> Vec<u8> {
	val.to_xdr(xdr::Limits::none()).unwrap_or_default()
}
