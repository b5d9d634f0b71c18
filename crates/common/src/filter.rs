use std::collections::BTreeSet;

use num_bigint::BigUint;

use crate::event::{DomainEvent, EventBody, EventKind};

/// Inclusion filters applied to extracted events. Every populated
/// dimension must match for an event to survive; empty sets match
/// everything. Filters only ever narrow the stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFilter {
	pub contract_ids: BTreeSet<String>,
	pub event_types: BTreeSet<EventKind>,
	pub invoking_accounts: BTreeSet<String>,
	pub function_names: BTreeSet<String>,
	pub successful_only: bool,
	/// Absolute transfer amount threshold, decimal string
	pub min_amount: Option<String>,
	pub require_state_changes: bool,
	pub include_failed: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum FilterError {
	#[error("Unrecognized event type in filter: {0}")]
	EventType(
		#[from]
		#[source]
		crate::event::ParseEventKindError,
	),
	#[error("min_amount is not a decimal integer: {0}")]
	MinAmount(String),
}

impl EventFilter {
	/// Parse the CSV environment form of each dimension. Empty or
	/// whitespace-only strings leave the dimension unset.
	pub fn from_csv(
		contract_ids: Option<&str>,
		event_types: Option<&str>,
		include_failed: bool,
	) -> Result<Self, FilterError> {
		let mut filter = EventFilter { include_failed, ..Default::default() };
		if let Some(csv) = contract_ids {
			filter.contract_ids = split_csv(csv).map(str::to_owned).collect();
		}
		if let Some(csv) = event_types {
			filter.event_types =
				split_csv(csv).map(str::parse).collect::<Result<BTreeSet<_>, _>>()?;
		}
		filter.validate()?;
		Ok(filter)
	}

	pub fn validate(&self) -> Result<(), FilterError> {
		if let Some(threshold) = &self.min_amount {
			threshold
				.parse::<BigUint>()
				.map_err(|_| FilterError::MinAmount(threshold.clone()))?;
		}
		Ok(())
	}

	/// Drop events from failed transactions unless failures were
	/// explicitly requested. `successful_only` always wins.
	fn drops_failed(&self) -> bool {
		self.successful_only || !self.include_failed
	}

	pub fn matches(&self, event: &DomainEvent) -> bool {
		if self.drops_failed() && !event.envelope.successful {
			return false;
		}
		if !self.event_types.is_empty() && !self.event_types.contains(&event.kind()) {
			return false;
		}
		if !self.contract_ids.is_empty() {
			match event.body.contract() {
				Some(contract) if self.contract_ids.contains(contract.as_str()) => {},
				_ => return false,
			}
		}
		if !self.invoking_accounts.is_empty() {
			match &event.body {
				EventBody::ContractCall(body)
					if self.invoking_accounts.contains(body.invoking_account.as_str()) => {},
				_ => return false,
			}
		}
		if !self.function_names.is_empty() {
			match &event.body {
				EventBody::ContractCall(body)
					if self.function_names.contains(&body.function) => {},
				_ => return false,
			}
		}
		if self.require_state_changes {
			match &event.body {
				EventBody::ContractCall(body) if body.state_changes > 0 => {},
				_ => return false,
			}
		}
		if let Some(threshold) = &self.min_amount {
			// Validated at construction; an unparseable threshold here
			// filters nothing rather than everything
			if let Ok(threshold) = threshold.parse::<BigUint>() {
				if let Some(amount) = event.body.amount() {
					if amount.magnitude() < threshold {
						return false;
					}
				}
			}
		}
		true
	}
}

fn split_csv(csv: &str) -> impl Iterator<Item = &str> {
	csv.split(',').map(str::trim).filter(|s| !s.is_empty())
}
