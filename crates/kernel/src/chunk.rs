use std::fmt;

use islands_common::{ChunkExtent, ChunkPos, TilePos};
use serde::{Deserialize, Serialize};

use crate::store::PropertyStore;

/// Identifier of a tile definition in the tile catalog. The empty id means "no tile".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TileId(pub String);

impl TileId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for TileId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for TileId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One fixed-extent partition of the grid: tile content plus its property store.
///
/// Every mutation marks the chunk dirty and bumps its revision. Only a successful
/// persist of the current revision clears the dirty flag again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    position: ChunkPos,
    extent: ChunkExtent,
    tiles: Vec<Option<TileId>>,
    properties: PropertyStore,
    #[serde(skip)]
    dirty: bool,
    #[serde(skip)]
    revision: u64,
}

impl Chunk {
    /// A fresh, empty and clean chunk.
    pub fn new(position: ChunkPos, extent: ChunkExtent) -> Self {
        Self {
            position,
            extent,
            tiles: vec![None; extent.volume()],
            properties: PropertyStore::new(position, extent),
            dirty: false,
            revision: 0,
        }
    }

    pub fn position(&self) -> ChunkPos {
        self.position
    }

    pub fn extent(&self) -> ChunkExtent {
        self.extent
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Monotonic mutation counter, used to tell whether a persisted copy is still current.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    fn touch(&mut self) {
        self.dirty = true;
        self.revision += 1;
    }

    /// Record that the copy taken at `revision` reached storage. Returns whether the chunk is
    /// clean afterwards; a mutation after that copy keeps it dirty.
    pub fn mark_persisted(&mut self, revision: u64) -> bool {
        if self.revision == revision {
            self.dirty = false;
        }
        !self.dirty
    }

    fn index(&self, tile: TilePos) -> usize {
        self.extent
            .local_index(self.extent.tile_to_local(tile, self.position))
    }

    pub fn tile_at(&self, tile: TilePos) -> Option<&TileId> {
        self.tiles[self.index(tile)].as_ref()
    }

    /// Place `id` at `tile`. An empty id clears the cell. Returns whether the cell changed.
    pub fn set_tile(&mut self, tile: TilePos, id: impl Into<TileId>) -> bool {
        let id = id.into();
        let index = self.index(tile);
        let next = if id.is_empty() { None } else { Some(id) };
        if self.tiles[index] == next {
            return false;
        }
        self.tiles[index] = next;
        self.touch();
        true
    }

    /// Returns whether there was a tile to remove.
    pub fn remove_tile(&mut self, tile: TilePos) -> bool {
        let index = self.index(tile);
        if self.tiles[index].take().is_some() {
            self.touch();
            true
        } else {
            false
        }
    }

    pub fn is_empty_at(&self, tile: TilePos) -> bool {
        self.tile_at(tile).is_none_or(TileId::is_empty)
    }

    /// Number of occupied cells.
    pub fn tile_count(&self) -> usize {
        self.tiles.iter().filter(|t| t.is_some()).count()
    }

    /// Occupied cells with their global positions.
    pub fn tiles(&self) -> impl Iterator<Item = (TilePos, &TileId)> + '_ {
        self.tiles.iter().enumerate().filter_map(|(i, t)| {
            t.as_ref().map(|id| {
                (
                    self.extent
                        .local_to_tile(self.position, self.extent.local_from_index(i)),
                    id,
                )
            })
        })
    }

    pub fn properties(&self) -> &PropertyStore {
        &self.properties
    }

    /// Mutable access to the property store. Taking it marks the chunk dirty.
    pub fn properties_mut(&mut self) -> &mut PropertyStore {
        self.touch();
        &mut self.properties
    }

    /// Whether the chunk holds neither tiles nor properties.
    pub fn is_blank(&self) -> bool {
        self.tile_count() == 0 && self.properties.is_empty()
    }

    /// Wipe tiles and properties before the chunk is dropped from memory. Does not dirty it.
    pub fn clear(&mut self) {
        self.tiles.iter_mut().for_each(|t| *t = None);
        self.properties.reset();
        self.dirty = false;
    }

    /// Sanity check for chunks read back from storage.
    pub fn is_consistent_with(&self, position: ChunkPos, extent: ChunkExtent) -> bool {
        self.position == position
            && self.extent == extent
            && self.tiles.len() == extent.volume()
            && self.properties.is_consistent_with(position, extent)
    }
}
