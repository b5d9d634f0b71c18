#[macro_use]
extern crate serde_derive;

pub mod amount;
pub mod cursor;
pub mod error;
pub mod event;
pub mod filter;
pub mod ledger;

pub use amount::Amount;
pub use cursor::Cursor;
pub use error::{PipelineError, Stage};
pub use event::{Binary, DomainEvent, EventBody, EventEnvelope, EventKind};
pub use filter::EventFilter;
pub use ledger::{LedgerSequence, NetworkId, RawLedger};
