//! Persistence: the storage contract the chunk streamer consumes, plus two backends.
//!
//! # Invariants
//! - A chunk missing from a load result means "does not exist"; the caller creates a fresh one.
//! - Corrupt or tampered chunk files are never handed out; they read as absent.
//! - Save failures are reported, never swallowed.

mod memory;
mod store;

use std::future::Future;

use islands_common::{ChunkPos, WorldInfo};
use islands_kernel::Chunk;

pub use memory::MemoryChunkStore;
pub use store::{FileChunkStore, IntegrityManifest, ManifestEntry, StoreError, WorldMeta};

/// Backend that persists chunks by position.
pub trait ChunkStorage: Send + Sync + 'static {
    /// The subset of `positions` that has persisted data.
    fn existing_among(
        &self,
        positions: &[ChunkPos],
        info: &WorldInfo,
    ) -> impl Future<Output = Vec<ChunkPos>> + Send;

    /// Load whatever of `positions` can be read. Missing or unreadable entries are left out.
    fn load(&self, positions: &[ChunkPos], info: &WorldInfo) -> impl Future<Output = Vec<Chunk>> + Send;

    /// Persist `chunks`. Fails if any of them could not be written.
    fn save(&self, chunks: &[Chunk], info: &WorldInfo) -> impl Future<Output = Result<(), StoreError>> + Send;
}

