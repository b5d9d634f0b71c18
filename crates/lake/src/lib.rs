#[macro_use]
extern crate serde_derive;

pub mod catalog;
pub mod flusher;
pub mod memory;
pub mod pg;
pub mod row;
pub mod schema;
pub mod writer;

pub use catalog::{
	Catalog, CatalogError, Coverage, Dataset, Era, EraStatus, LineageRow,
};
pub use flusher::{FlushPolicy, Flusher};
pub use memory::MemoryCatalog;
pub use row::{EventRow, Table};
pub use writer::{LocalPartitionStore, PartitionStore, WrittenFile};
