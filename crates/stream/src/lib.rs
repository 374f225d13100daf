//! Streaming: keeps the chunks of a tile world resident while something needs them.
//!
//! Loaders request chunks, tile operations are queued, and a drain executes the queue in
//! order, then saves and evicts whatever nothing references any more.
//!
//! # Invariants
//! - At most one resident chunk and at most one in-flight load per position.
//! - A requested chunk is never evicted; neither is one named by a queued operation.
//! - A dirty chunk is written to storage before it leaves memory.
//! - At most one drain runs at a time; it goes idle only after observing an empty queue.

mod config;
mod driver;
mod error;
mod operation;
mod registry;
mod scheduler;
mod stats;
mod table;
mod world;

pub use config::StreamConfig;
pub use error::WorldError;
pub use operation::OperationHandle;
pub use registry::LoadRequestRegistry;
pub use scheduler::DrainState;
pub use driver::DrainDriver;
pub use stats::{DrainHistory, DrainOutcome, DrainStats};
pub use table::{ChunkTable, SharedChunk};
pub use world::World;
