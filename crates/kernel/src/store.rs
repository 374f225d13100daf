use std::collections::HashMap;

use islands_common::{ChunkExtent, ChunkPos, IVec3, LocalPos, TilePos};
use serde::{Deserialize, Serialize};

use crate::property::{PropertyError, PropertyKind, PropertyValue};

/// Key of one property: a tile inside the chunk plus the property name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PropertyKey {
    pub position: LocalPos,
    pub name: String,
}

/// Sparse typed metadata for the tiles of one chunk.
///
/// Every operation takes a global tile position and translates it into the chunk's
/// local frame. Values keep the tag they were stored with; reads that ask for a
/// different tag fail instead of converting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyStore {
    chunk: ChunkPos,
    extent: ChunkExtent,
    #[serde(with = "entry_list")]
    entries: HashMap<PropertyKey, PropertyValue>,
}

/// Entries travel as a list of pairs so formats with string-only map keys can hold them.
mod entry_list {
    use std::collections::HashMap;

    use serde::{Deserialize, Deserializer, Serializer};

    use super::PropertyKey;
    use crate::property::PropertyValue;

    pub fn serialize<S: Serializer>(
        entries: &HashMap<PropertyKey, PropertyValue>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(entries.iter())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<HashMap<PropertyKey, PropertyValue>, D::Error> {
        let pairs = Vec::<(PropertyKey, PropertyValue)>::deserialize(deserializer)?;
        Ok(pairs.into_iter().collect())
    }
}

impl PropertyStore {
    pub fn new(chunk: ChunkPos, extent: ChunkExtent) -> Self {
        Self {
            chunk,
            extent,
            entries: HashMap::new(),
        }
    }

    pub fn chunk(&self) -> ChunkPos {
        self.chunk
    }

    pub fn extent(&self) -> ChunkExtent {
        self.extent
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn key(&self, tile: TilePos, name: &str) -> PropertyKey {
        PropertyKey {
            position: self.extent.tile_to_local(tile, self.chunk),
            name: name.to_owned(),
        }
    }

    /// Store `value` under `name` at `tile`, replacing whatever was there (of any kind).
    ///
    /// Returns `false` and stores nothing for the null object handle.
    pub fn set(&mut self, tile: TilePos, name: &str, value: impl Into<PropertyValue>) -> bool {
        let value = value.into();
        if value.is_null() {
            return false;
        }
        let key = self.key(tile, name);
        self.entries.insert(key, value);
        true
    }

    /// Read a typed property, or `default` when it is not set.
    pub fn get<T: PropertyKind>(&self, tile: TilePos, name: &str, default: T) -> Result<T, PropertyError> {
        match self.entries.get(&self.key(tile, name)) {
            None => Ok(default),
            Some(value) => T::from_value(value).ok_or_else(|| PropertyError::TypeMismatch {
                name: name.to_owned(),
                expected: T::KIND,
                found: value.kind(),
            }),
        }
    }

    /// Raw tagged value, if any.
    pub fn value(&self, tile: TilePos, name: &str) -> Option<&PropertyValue> {
        self.entries.get(&self.key(tile, name))
    }

    pub fn erase(&mut self, tile: TilePos, name: &str) -> bool {
        let key = self.key(tile, name);
        self.entries.remove(&key).is_some()
    }

    /// Remove every property at `tile`. Returns whether anything was removed.
    pub fn erase_all(&mut self, tile: TilePos) -> bool {
        let local = self.extent.tile_to_local(tile, self.chunk);
        let before = self.entries.len();
        self.entries.retain(|key, _| key.position != local);
        self.entries.len() != before
    }

    /// Snapshot of every property at `tile`, keyed by name.
    pub fn all_at(&self, tile: TilePos) -> HashMap<String, PropertyValue> {
        let local = self.extent.tile_to_local(tile, self.chunk);
        self.entries
            .iter()
            .filter(|(key, _)| key.position == local)
            .map(|(key, value)| (key.name.clone(), value.clone()))
            .collect()
    }

    /// Global positions of every tile carrying `name`. Order is unspecified.
    pub fn positions_with(&self, name: &str) -> Vec<TilePos> {
        self.entries
            .keys()
            .filter(|key| key.name == name)
            .map(|key| self.extent.local_to_tile(self.chunk, key.position))
            .collect()
    }

    pub fn reset(&mut self) {
        self.entries.clear();
    }

    /// Whether this store was built for `chunk` with `extent` and only holds in-range keys.
    pub fn is_consistent_with(&self, chunk: ChunkPos, extent: ChunkExtent) -> bool {
        let size = extent.size();
        self.chunk == chunk
            && self.extent == extent
            && self
                .entries
                .keys()
                .all(|key| key.position.0.cmpge(IVec3::ZERO).all() && key.position.0.cmplt(size).all())
    }
}
