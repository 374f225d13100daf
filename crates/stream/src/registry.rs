use std::collections::{HashMap, HashSet};

use islands_common::{ChunkPos, LoaderId};

/// Which loaders want which chunks kept resident.
///
/// A position is present only while at least one loader holds it. Removing a loader never
/// evicts anything by itself; it only changes what the next drain considers evictable.
#[derive(Debug, Default)]
pub struct LoadRequestRegistry {
    requests: HashMap<ChunkPos, HashSet<LoaderId>>,
}

impl LoadRequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `loader` for every position. Returns how many (position, loader) pairs are new.
    pub fn add(&mut self, positions: &[ChunkPos], loader: LoaderId) -> usize {
        positions
            .iter()
            .filter(|&&pos| self.requests.entry(pos).or_default().insert(loader))
            .count()
    }

    /// Drop `loader` from every position. Pairs that were never registered are ignored.
    /// Returns how many pairs were removed.
    pub fn remove(&mut self, positions: &[ChunkPos], loader: LoaderId) -> usize {
        let mut removed = 0;
        for pos in positions {
            let Some(loaders) = self.requests.get_mut(pos) else {
                continue;
            };
            if loaders.remove(&loader) {
                removed += 1;
            }
            if loaders.is_empty() {
                self.requests.remove(pos);
            }
        }
        removed
    }

    pub fn is_requested(&self, pos: ChunkPos) -> bool {
        self.requests.contains_key(&pos)
    }

    /// Number of loaders holding `pos`.
    pub fn requester_count(&self, pos: ChunkPos) -> usize {
        self.requests.get(&pos).map_or(0, HashSet::len)
    }

    /// Every position held by at least one loader.
    pub fn requested_positions(&self) -> impl Iterator<Item = ChunkPos> + '_ {
        self.requests.keys().copied()
    }

    /// Number of requested positions.
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adding_twice_is_idempotent() {
        let mut registry = LoadRequestRegistry::new();
        let loader = LoaderId::new();
        let pos = ChunkPos::flat(0, 0);
        assert_eq!(registry.add(&[pos], loader), 1);
        assert_eq!(registry.add(&[pos], loader), 0);
        assert_eq!(registry.requester_count(pos), 1);
    }

    #[test]
    fn position_dropped_with_last_loader() {
        let mut registry = LoadRequestRegistry::new();
        let (a, b) = (LoaderId::new(), LoaderId::new());
        let pos = ChunkPos::flat(-1, 4);
        registry.add(&[pos], a);
        registry.add(&[pos], b);

        assert_eq!(registry.remove(&[pos], a), 1);
        assert!(registry.is_requested(pos));
        assert_eq!(registry.remove(&[pos], b), 1);
        assert!(!registry.is_requested(pos));
        assert!(registry.is_empty());
    }

    #[test]
    fn removing_unknown_pairs_is_a_no_op() {
        let mut registry = LoadRequestRegistry::new();
        let (a, b) = (LoaderId::new(), LoaderId::new());
        let pos = ChunkPos::flat(2, 2);
        registry.add(&[pos], a);
        assert_eq!(registry.remove(&[pos], b), 0);
        assert_eq!(registry.remove(&[ChunkPos::flat(9, 9)], a), 0);
        assert!(registry.is_requested(pos));
    }

    #[test]
    fn batch_add_covers_every_position() {
        let mut registry = LoadRequestRegistry::new();
        let loader = LoaderId::new();
        let positions = [ChunkPos::flat(0, 0), ChunkPos::flat(1, 0), ChunkPos::flat(0, 1)];
        assert_eq!(registry.add(&positions, loader), 3);
        assert_eq!(registry.len(), 3);
        let mut held: Vec<_> = registry.requested_positions().collect();
        held.sort_by_key(|p| (p.x(), p.y()));
        assert_eq!(held, vec![positions[0], positions[2], positions[1]]);
    }
}
