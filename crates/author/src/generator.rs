use std::fmt;
use std::str::FromStr;

use islands_common::{IVec3, LoaderId, TileBounds, TilePos};
use islands_kernel::TileId;
use islands_persist::ChunkStorage;
use islands_stream::{OperationHandle, World, WorldError};
use noise::{NoiseFn, Perlin};
use serde::{Deserialize, Serialize};

/// Sampling step for the height field. Perlin noise is zero on integer lattice points.
const PERLIN_SCALE: f64 = 0.125;
/// Heights above this become land.
const LAND_THRESHOLD: f32 = 0.35;

pub const ELEVATION_PROPERTY: &str = "elevation";

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error(transparent)]
    World(#[from] WorldError),
    #[error("island size must be positive, got {0}")]
    InvalidSize(i32),
    #[error("unknown island shape {0:?}")]
    UnknownShape(String),
}

/// Outline of a generated island.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IslandShape {
    /// Every cell of the bounds is land.
    Square,
    /// The square without its four corner cells.
    SquareNoBorders,
    /// Filled disc inscribed in the bounds.
    Circle,
    /// Land where the height field rises above the threshold, water elsewhere.
    #[default]
    Perlin,
}

impl IslandShape {
    pub const ALL: [IslandShape; 4] = [Self::Square, Self::SquareNoBorders, Self::Circle, Self::Perlin];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Square => "square",
            Self::SquareNoBorders => "square_no_borders",
            Self::Circle => "circle",
            Self::Perlin => "perlin",
        }
    }
}

impl fmt::Display for IslandShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IslandShape {
    type Err = GenerationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|shape| shape.as_str() == wanted)
            .ok_or_else(|| GenerationError::UnknownShape(s.to_owned()))
    }
}

/// What a generation pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GenerationReport {
    /// Cells inside the island outline.
    pub cells: usize,
    /// Cells that were empty and received a tile.
    pub written: usize,
    /// Cells left alone because they already held a tile.
    pub kept: usize,
    /// Chunks covered by the island bounds.
    pub chunks: usize,
}

/// Fills the empty cells of an island with generated tiles.
///
/// The generator is an ordinary client of the world: it requests the chunks it covers, goes
/// through the queued tile operations, and releases the chunks when done.
#[derive(Debug, Clone)]
pub struct IslandGenerator {
    shape: IslandShape,
    bounds: TileBounds,
    seed: u32,
}

impl IslandGenerator {
    pub fn new(shape: IslandShape, bounds: TileBounds, seed: u32) -> Self {
        Self { shape, bounds, seed }
    }

    /// A `size` by `size` island centered on the origin, one layer deep.
    pub fn centered(shape: IslandShape, size: i32, seed: u32) -> Result<Self, GenerationError> {
        if size <= 0 {
            return Err(GenerationError::InvalidSize(size));
        }
        let min = TilePos::flat(-(size / 2), -(size / 2));
        let bounds = TileBounds::from_size(min, IVec3::new(size, size, 1));
        Ok(Self::new(shape, bounds, seed))
    }

    pub fn shape(&self) -> IslandShape {
        self.shape
    }

    pub fn bounds(&self) -> TileBounds {
        self.bounds
    }

    /// Whether `tile` lies inside the island outline.
    pub fn includes(&self, tile: TilePos) -> bool {
        if !self.bounds.contains(tile) {
            return false;
        }
        let (min, max) = (self.bounds.min, self.bounds.max);
        match self.shape {
            IslandShape::Square | IslandShape::Perlin => true,
            IslandShape::SquareNoBorders => {
                let on_x_edge = tile.x() == min.x() || tile.x() == max.x() - 1;
                let on_y_edge = tile.y() == min.y() || tile.y() == max.y() - 1;
                !(on_x_edge && on_y_edge)
            }
            IslandShape::Circle => {
                let size = self.bounds.size();
                let radius = f64::from(size.x.min(size.y)) / 2.0;
                let cx = f64::from(min.x() + max.x()) / 2.0;
                let cy = f64::from(min.y() + max.y()) / 2.0;
                let dx = f64::from(tile.x()) + 0.5 - cx;
                let dy = f64::from(tile.y()) + 0.5 - cy;
                dx * dx + dy * dy <= radius * radius
            }
        }
    }

    /// Normalized height in `[0, 1]`.
    fn height(noise: &Perlin, tile: TilePos) -> f32 {
        let sample = noise.get([
            f64::from(tile.x()) * PERLIN_SCALE,
            f64::from(tile.y()) * PERLIN_SCALE,
        ]);
        ((sample + 1.0) / 2.0).clamp(0.0, 1.0) as f32
    }

    fn tile_for(&self, noise: &Perlin, tile: TilePos) -> (TileId, Option<f32>) {
        match self.shape {
            IslandShape::Perlin => {
                let height = Self::height(noise, tile);
                let id = if height > LAND_THRESHOLD { "grass" } else { "water" };
                (TileId::from(id), Some(height))
            }
            _ => (TileId::from("grass"), None),
        }
    }

    /// Generate the island into `world`. Cells that already hold a tile are kept.
    ///
    /// The island's chunks are released again even when generation fails part way.
    pub async fn generate<S: ChunkStorage>(
        &self,
        world: &World<S>,
    ) -> Result<GenerationReport, GenerationError> {
        let loader = LoaderId::new();
        let chunks = world.extent().tile_bounds_to_chunk_bounds(self.bounds);
        let mut report = GenerationReport {
            chunks: chunks.len(),
            ..GenerationReport::default()
        };
        tracing::info!(shape = %self.shape, %loader, chunks = report.chunks, "generating island");

        let load = world.request_load_bounds(self.bounds, loader);
        let filled = self.fill(world, load, &mut report).await;
        let released = settle(world, world.request_unload_bounds(self.bounds, loader)).await;
        match (filled, released) {
            (Err(e), Err(unload)) => {
                tracing::warn!(%loader, error = %unload, "releasing island chunks failed");
                return Err(e);
            }
            (Err(e), Ok(())) => return Err(e),
            (Ok(()), released) => released?,
        }

        tracing::info!(
            written = report.written,
            kept = report.kept,
            "island generated"
        );
        Ok(report)
    }

    async fn fill<S: ChunkStorage>(
        &self,
        world: &World<S>,
        load: OperationHandle<()>,
        report: &mut GenerationReport,
    ) -> Result<(), GenerationError> {
        settle(world, load).await?;

        let cells: Vec<TilePos> = self.bounds.positions().filter(|t| self.includes(*t)).collect();
        report.cells = cells.len();
        let checks: Vec<_> = cells.iter().map(|t| world.is_empty(*t)).collect();
        let empty = settle_all(world, checks).await?;

        let noise = Perlin::new(self.seed);
        let mut writes = Vec::new();
        let mut elevations = Vec::new();
        for (tile, is_empty) in cells.iter().zip(empty) {
            if !is_empty {
                report.kept += 1;
                continue;
            }
            let (id, elevation) = self.tile_for(&noise, *tile);
            writes.push(world.write_tile(*tile, id));
            if let Some(height) = elevation {
                elevations.push((*tile, height));
            }
        }
        report.written = settle_all(world, writes).await?.into_iter().filter(|w| *w).count();

        // The chunks are still held by our loader, so direct access is safe here.
        for (tile, height) in elevations {
            let chunk = world.chunk_data_for_tile(tile)?;
            chunk
                .write()
                .await
                .properties_mut()
                .set(tile, ELEVATION_PROPERTY, height);
        }
        Ok(())
    }
}

/// Drive a drain, then wait for `handle`. A drain that is already running picks the
/// operation up before it goes idle.
async fn settle<S: ChunkStorage, T>(
    world: &World<S>,
    handle: OperationHandle<T>,
) -> Result<T, WorldError> {
    world.process_operations().await?;
    handle.await
}

async fn settle_all<S: ChunkStorage, T>(
    world: &World<S>,
    handles: Vec<OperationHandle<T>>,
) -> Result<Vec<T>, WorldError> {
    world.process_operations().await?;
    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        results.push(handle.await?);
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use islands_common::{ChunkExtent, ChunkPos};
    use islands_persist::MemoryChunkStore;
    use islands_stream::StreamConfig;

    fn world() -> World<MemoryChunkStore> {
        let config = StreamConfig {
            chunk_extent: ChunkExtent::flat(4, 4).unwrap(),
            ..StreamConfig::default()
        };
        World::new(Arc::new(MemoryChunkStore::new()), config)
    }

    async fn read(world: &World<MemoryChunkStore>, tile: TilePos) -> Option<TileId> {
        settle(world, world.read_tile(tile)).await.unwrap()
    }

    #[test]
    fn shapes_parse_from_names() {
        assert_eq!("square".parse::<IslandShape>().unwrap(), IslandShape::Square);
        assert_eq!(
            "square-no-borders".parse::<IslandShape>().unwrap(),
            IslandShape::SquareNoBorders
        );
        assert_eq!(" Perlin ".parse::<IslandShape>().unwrap(), IslandShape::Perlin);
        assert!(matches!(
            "hexagon".parse::<IslandShape>(),
            Err(GenerationError::UnknownShape(_))
        ));
        for shape in IslandShape::ALL {
            assert_eq!(shape.to_string().parse::<IslandShape>().unwrap(), shape);
        }
    }

    #[test]
    fn centered_rejects_non_positive_size() {
        assert!(matches!(
            IslandGenerator::centered(IslandShape::Square, 0, 1),
            Err(GenerationError::InvalidSize(0))
        ));
        let generator = IslandGenerator::centered(IslandShape::Square, 5, 1).unwrap();
        assert_eq!(generator.bounds().min, TilePos::flat(-2, -2));
        assert_eq!(generator.bounds().max, TilePos::new(3, 3, 1));
    }

    #[test]
    fn square_without_borders_drops_only_corners() {
        let generator = IslandGenerator::centered(IslandShape::SquareNoBorders, 4, 0).unwrap();
        let included = generator.bounds().positions().filter(|t| generator.includes(*t)).count();
        assert_eq!(included, 12);
        assert!(!generator.includes(TilePos::flat(-2, -2)));
        assert!(!generator.includes(TilePos::flat(1, 1)));
        assert!(generator.includes(TilePos::flat(-2, 0)));
    }

    #[test]
    fn circle_is_inscribed() {
        let generator = IslandGenerator::centered(IslandShape::Circle, 8, 0).unwrap();
        assert!(generator.includes(TilePos::flat(0, 0)));
        assert!(generator.includes(TilePos::flat(-4, 0)));
        assert!(!generator.includes(TilePos::flat(-4, -4)));
        assert!(!generator.includes(TilePos::flat(3, 3)));
        assert!(!generator.includes(TilePos::flat(4, 0)));
    }

    #[tokio::test]
    async fn square_island_fills_every_cell() {
        let world = world();
        let generator = IslandGenerator::centered(IslandShape::Square, 6, 0).unwrap();
        let report = generator.generate(&world).await.unwrap();

        assert_eq!(report.cells, 36);
        assert_eq!(report.written, 36);
        assert_eq!(report.chunks, 4);
        for tile in generator.bounds().positions() {
            assert_eq!(read(&world, tile).await, Some(TileId::from("grass")));
        }
        // Outside the island stays empty.
        assert_eq!(read(&world, TilePos::flat(3, 3)).await, None);
    }

    #[tokio::test]
    async fn existing_tiles_are_kept() {
        let world = world();
        settle(&world, world.write_tile(TilePos::flat(0, 0), "rock")).await.unwrap();

        let generator = IslandGenerator::centered(IslandShape::Square, 2, 0).unwrap();
        let report = generator.generate(&world).await.unwrap();
        assert_eq!(report.kept, 1);
        assert_eq!(report.written, 3);
        assert_eq!(read(&world, TilePos::flat(0, 0)).await, Some(TileId::from("rock")));
    }

    #[tokio::test]
    async fn generation_releases_its_chunks() {
        let world = world();
        IslandGenerator::centered(IslandShape::Circle, 10, 0)
            .unwrap()
            .generate(&world)
            .await
            .unwrap();
        assert_eq!(world.resident_len(), 0);
        assert!(world.requested_positions().is_empty());
        assert!(world.storage().saved_chunks() > 0);
    }

    #[tokio::test]
    async fn failed_generation_still_releases_its_chunks() {
        let world = world();
        // A dirty chunk elsewhere makes the first drain's eviction save fail.
        let _far = world.write_tile(TilePos::flat(100, 100), "rock");
        world.storage().set_fail_saves(true);

        let generator = IslandGenerator::centered(IslandShape::Square, 4, 0).unwrap();
        let result = generator.generate(&world).await;
        assert!(matches!(result, Err(GenerationError::World(WorldError::Storage(_)))));
        assert!(world.requested_positions().is_empty());

        world.storage().set_fail_saves(false);
        world.process_operations().await.unwrap();
        assert_eq!(world.resident_len(), 0);
        assert!(world.requested_positions().is_empty());
    }

    #[tokio::test]
    async fn perlin_island_is_seeded_and_records_elevation() {
        let (a, b) = (world(), world());
        let generator = IslandGenerator::centered(IslandShape::Perlin, 12, 42).unwrap();
        generator.generate(&a).await.unwrap();
        generator.generate(&b).await.unwrap();

        for tile in generator.bounds().positions() {
            let tile_a = read(&a, tile).await;
            assert_eq!(tile_a, read(&b, tile).await);
            assert!(matches!(tile_a.as_ref().map(TileId::as_str), Some("grass" | "water")));
        }

        let tile = TilePos::flat(1, 3);
        let stored = a
            .storage()
            .stored(a.info(), ChunkPos::flat(0, 0))
            .unwrap();
        let height: f32 = stored
            .properties()
            .get(tile, ELEVATION_PROPERTY, -1.0f32)
            .unwrap();
        assert!((0.0..=1.0).contains(&height));
        let expected = if height > LAND_THRESHOLD { "grass" } else { "water" };
        assert_eq!(stored.tile_at(tile).map(TileId::as_str), Some(expected));
    }
}
