#[macro_use]
extern crate serde_derive;

pub mod batch;
pub mod checkpoint;
pub mod pool;
pub mod sequencer;

pub use batch::{Batch, BatchResult};
pub use checkpoint::{Checkpoint, CheckpointError, CheckpointStore};
pub use pool::{BatchProcessor, PoolConfig, WorkerPool};
pub use sequencer::{CommitSink, GapPolicy, Sequencer, SequencerError};
