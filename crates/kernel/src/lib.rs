//! Chunk kernel: the authoritative content of one chunk and its typed property store.
//!
//! # Invariants
//! - A stored property keeps the tag it was written with; typed reads never convert.
//! - Any mutation marks the owning chunk dirty until the current revision is persisted.

pub mod chunk;
pub mod property;
pub mod store;

pub use chunk::{Chunk, TileId};
pub use property::{Color, ObjectRef, PropertyError, PropertyKind, PropertyValue, ValueKind};
pub use store::{PropertyKey, PropertyStore};
