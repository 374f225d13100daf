use std::fmt;

use glam::IVec3;
use serde::{Deserialize, Serialize};

/// Errors from constructing grid geometry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GridError {
    #[error("chunk extent must be positive on every axis, got {0}")]
    NonPositiveExtent(IVec3),
}

/// An absolute ("global") tile coordinate in the infinite grid.
///
/// 2D worlds use `z = 0` together with an extent whose `z` is 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TilePos(pub IVec3);

/// A tile coordinate relative to the origin of its chunk, always within `[0, extent)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct LocalPos(pub IVec3);

/// Identifies one chunk of the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ChunkPos(pub IVec3);

macro_rules! grid_position {
    ($name:ident) => {
        impl $name {
            pub const fn new(x: i32, y: i32, z: i32) -> Self {
                Self(IVec3::new(x, y, z))
            }

            /// A position on the `z = 0` plane.
            pub const fn flat(x: i32, y: i32) -> Self {
                Self(IVec3::new(x, y, 0))
            }

            pub fn x(&self) -> i32 {
                self.0.x
            }

            pub fn y(&self) -> i32 {
                self.0.y
            }

            pub fn z(&self) -> i32 {
                self.0.z
            }
        }

        impl From<IVec3> for $name {
            fn from(v: IVec3) -> Self {
                Self(v)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "({}, {}, {})", self.0.x, self.0.y, self.0.z)
            }
        }
    };
}

grid_position!(TilePos);
grid_position!(LocalPos);
grid_position!(ChunkPos);

/// Size of every chunk in tiles. Process-wide configuration, fixed once a world is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "IVec3", into = "IVec3")]
pub struct ChunkExtent(IVec3);

impl Default for ChunkExtent {
    fn default() -> Self {
        Self(IVec3::new(16, 16, 1))
    }
}

impl TryFrom<IVec3> for ChunkExtent {
    type Error = GridError;

    fn try_from(size: IVec3) -> Result<Self, Self::Error> {
        if size.cmpgt(IVec3::ZERO).all() {
            Ok(Self(size))
        } else {
            Err(GridError::NonPositiveExtent(size))
        }
    }
}

impl From<ChunkExtent> for IVec3 {
    fn from(extent: ChunkExtent) -> Self {
        extent.0
    }
}

impl fmt::Display for ChunkExtent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.0.x, self.0.y, self.0.z)
    }
}

impl ChunkExtent {
    pub fn new(x: i32, y: i32, z: i32) -> Result<Self, GridError> {
        Self::try_from(IVec3::new(x, y, z))
    }

    /// A flat extent for 2D worlds (`z` is 1).
    pub fn flat(x: i32, y: i32) -> Result<Self, GridError> {
        Self::new(x, y, 1)
    }

    pub fn size(&self) -> IVec3 {
        self.0
    }

    /// Number of tiles in one chunk.
    pub fn volume(&self) -> usize {
        (self.0.x as usize) * (self.0.y as usize) * (self.0.z as usize)
    }

    /// Chunk containing `tile`. Floors on every axis so tile `-1` belongs to chunk `-1`,
    /// never to a second "zero" chunk.
    pub fn tile_to_chunk(&self, tile: TilePos) -> ChunkPos {
        ChunkPos(IVec3::new(
            tile.0.x.div_euclid(self.0.x),
            tile.0.y.div_euclid(self.0.y),
            tile.0.z.div_euclid(self.0.z),
        ))
    }

    /// Like [`tile_to_chunk`](Self::tile_to_chunk) but rounds up. Used for the exclusive upper
    /// corner of a bounding box so partially covered chunks are kept.
    pub fn tile_to_chunk_ceil(&self, tile: TilePos) -> ChunkPos {
        ChunkPos(IVec3::new(
            div_ceil(tile.0.x, self.0.x),
            div_ceil(tile.0.y, self.0.y),
            div_ceil(tile.0.z, self.0.z),
        ))
    }

    /// Translate a global tile position into the local frame of `chunk`.
    ///
    /// The result is always within `[0, extent)`. A tile that does not belong to `chunk` is a
    /// caller bug; it is logged and the wrapped value is still returned.
    pub fn tile_to_local(&self, tile: TilePos, chunk: ChunkPos) -> LocalPos {
        let owner = self.tile_to_chunk(tile);
        if owner != chunk {
            tracing::error!(%tile, %chunk, %owner, "tile position is not inside the chunk");
        }
        LocalPos(IVec3::new(
            tile.0.x.rem_euclid(self.0.x),
            tile.0.y.rem_euclid(self.0.y),
            tile.0.z.rem_euclid(self.0.z),
        ))
    }

    /// Global position of the first tile of `chunk`.
    pub fn chunk_origin(&self, chunk: ChunkPos) -> TilePos {
        TilePos(chunk.0 * self.0)
    }

    pub fn local_to_tile(&self, chunk: ChunkPos, local: LocalPos) -> TilePos {
        TilePos(chunk.0 * self.0 + local.0)
    }

    /// Row-major index of a local position (x fastest, then y, then z).
    pub fn local_index(&self, local: LocalPos) -> usize {
        let s = self.0;
        (local.0.x + local.0.y * s.x + local.0.z * s.x * s.y) as usize
    }

    /// Inverse of [`local_index`](Self::local_index).
    pub fn local_from_index(&self, index: usize) -> LocalPos {
        let s = self.0;
        let i = index as i32;
        LocalPos(IVec3::new(i % s.x, (i / s.x) % s.y, i / (s.x * s.y)))
    }

    /// Smallest chunk box covering every tile of `bounds`, partially covered chunks included.
    pub fn tile_bounds_to_chunk_bounds(&self, bounds: TileBounds) -> ChunkBounds {
        if bounds.is_empty() {
            let at = self.tile_to_chunk(bounds.min);
            return ChunkBounds { min: at, max: at };
        }
        ChunkBounds {
            min: self.tile_to_chunk(bounds.min),
            max: self.tile_to_chunk_ceil(bounds.max),
        }
    }

}

fn div_ceil(value: i32, divisor: i32) -> i32 {
    let q = value.div_euclid(divisor);
    if value.rem_euclid(divisor) != 0 { q + 1 } else { q }
}

/// Axis-aligned tile box, `max` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileBounds {
    pub min: TilePos,
    pub max: TilePos,
}

impl TileBounds {
    pub fn new(min: TilePos, max: TilePos) -> Self {
        Self { min, max }
    }

    /// Single-layer box for 2D worlds: x and y span `min..max`, z covers only `min.z`.
    ///
    /// Corners built with [`TilePos::flat`] share z, which [`new`](Self::new) would read as
    /// an empty box.
    pub fn flat(min: TilePos, max: TilePos) -> Self {
        Self {
            min,
            max: TilePos::new(max.x(), max.y(), min.z().saturating_add(1)),
        }
    }

    /// Box of `size` tiles starting at `min`.
    pub fn from_size(min: TilePos, size: IVec3) -> Self {
        Self {
            min,
            max: TilePos(min.0 + size),
        }
    }

    pub fn size(&self) -> IVec3 {
        (self.max.0 - self.min.0).max(IVec3::ZERO)
    }

    pub fn is_empty(&self) -> bool {
        self.max.0.cmple(self.min.0).any()
    }

    pub fn contains(&self, tile: TilePos) -> bool {
        tile.0.cmpge(self.min.0).all() && tile.0.cmplt(self.max.0).all()
    }

    /// Every tile in the box, x fastest.
    pub fn positions(&self) -> impl Iterator<Item = TilePos> + '_ {
        box_positions(self.min.0, self.max.0).map(TilePos)
    }
}

/// Axis-aligned chunk box, `max` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkBounds {
    pub min: ChunkPos,
    pub max: ChunkPos,
}

impl ChunkBounds {
    pub fn size(&self) -> IVec3 {
        (self.max.0 - self.min.0).max(IVec3::ZERO)
    }

    pub fn len(&self) -> usize {
        let s = self.size();
        (s.x as usize) * (s.y as usize) * (s.z as usize)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, chunk: ChunkPos) -> bool {
        chunk.0.cmpge(self.min.0).all() && chunk.0.cmplt(self.max.0).all()
    }

    pub fn positions(&self) -> impl Iterator<Item = ChunkPos> + '_ {
        box_positions(self.min.0, self.max.0).map(ChunkPos)
    }
}

fn box_positions(min: IVec3, max: IVec3) -> impl Iterator<Item = IVec3> {
    (min.z..max.z).flat_map(move |z| {
        (min.y..max.y).flat_map(move |y| (min.x..max.x).map(move |x| IVec3::new(x, y, z)))
    })
}
