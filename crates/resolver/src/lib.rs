#[macro_use]
extern crate serde_derive;

pub mod cache;
pub mod manifest;
pub mod resolve;

pub use manifest::{ManifestFile, ReadManifest};
pub use resolve::{Intent, IntentMode, ResolveError, ResolvedDataset, Resolver};
