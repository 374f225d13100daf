//! Shared types for the islands tile world: grid positions, chunk extents and
//! the coordinate mapping between global tiles and (chunk, local) pairs.
//!
//! # Invariants
//! - Global to local translation is total and always lands in `[0, extent)`.
//! - The chunk containing tile 0 is chunk 0; negative tiles floor into negative chunks.

mod grid;
mod types;

pub use grid::{ChunkBounds, ChunkExtent, ChunkPos, GridError, LocalPos, TileBounds, TilePos};
pub use types::{LoaderId, WorldInfo};

/// Re-exported so downstream crates build positions without naming glam directly.
pub use glam::IVec3;
