use islands_common::ChunkPos;
use islands_persist::StoreError;

/// Errors surfaced by the world handle.
#[derive(Debug, thiserror::Error)]
pub enum WorldError {
    #[error("failed to persist chunks: {0}")]
    Storage(#[from] StoreError),
    #[error("no chunk resident at {0}")]
    ChunkNotResident(ChunkPos),
    #[error("the world was dropped before the operation completed")]
    Abandoned,
}
