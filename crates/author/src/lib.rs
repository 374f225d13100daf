//! Island authoring: procedural generation of tile islands into a streamed world.
//!
//! # Invariants
//! - Generation only fills empty cells; existing tiles are never overwritten.
//! - Every chunk the generator requests is released before it returns.

mod generator;

pub use generator::{
    ELEVATION_PROPERTY, GenerationError, GenerationReport, IslandGenerator, IslandShape,
};
