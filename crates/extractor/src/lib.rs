mod classify;
mod decode;
mod extract;

pub use decode::{DecodedLedger, DecodedOperation, DecodedTransaction, ExtractError};
pub use extract::Extractor;
