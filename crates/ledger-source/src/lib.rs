#[macro_use]
extern crate serde_derive;

pub mod archive;
pub mod backend;
pub mod breaker;
pub mod captive;
pub mod frames;
pub mod inmem;
pub mod retry;
pub mod rpc;
pub mod source;

pub use backend::{BackendConfig, BackendError, BackendKind, LedgerBackend};
pub use breaker::{BreakerConfig, CircuitBreaker};
pub use inmem::InMemoryBackend;
pub use retry::RetryPolicy;
pub use source::{LedgerSource, SourceConfig, SourceError};
