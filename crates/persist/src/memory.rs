use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use islands_common::{ChunkPos, WorldInfo};
use islands_kernel::Chunk;

use crate::{ChunkStorage, StoreError};

/// Chunk storage kept in process memory.
///
/// Counts backend calls and can simulate latency or failing saves, which makes it the
/// backend of choice for exercising the streamer.
#[derive(Default)]
pub struct MemoryChunkStore {
    worlds: Mutex<HashMap<String, HashMap<ChunkPos, Chunk>>>,
    latency: Duration,
    fail_saves: AtomicBool,
    load_calls: AtomicUsize,
    save_calls: AtomicUsize,
    saved_chunks: AtomicUsize,
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every backend call sleeps for `latency` before answering.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    /// Make subsequent saves fail until switched back.
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Seed the store with a chunk, as if it had been saved earlier.
    pub fn insert(&self, info: &WorldInfo, chunk: Chunk) {
        let mut chunk = chunk;
        chunk.mark_persisted(chunk.revision());
        self.lock()
            .entry(info.id())
            .or_default()
            .insert(chunk.position(), chunk);
    }

    /// Copy of the stored chunk at `pos`.
    pub fn stored(&self, info: &WorldInfo, pos: ChunkPos) -> Option<Chunk> {
        self.lock().get(&info.id()).and_then(|w| w.get(&pos)).cloned()
    }

    pub fn contains(&self, info: &WorldInfo, pos: ChunkPos) -> bool {
        self.lock()
            .get(&info.id())
            .is_some_and(|w| w.contains_key(&pos))
    }

    /// Number of `load` calls that reached the backend.
    pub fn load_calls(&self) -> usize {
        self.load_calls.load(Ordering::SeqCst)
    }

    /// Number of successful `save` calls.
    pub fn save_calls(&self) -> usize {
        self.save_calls.load(Ordering::SeqCst)
    }

    /// Total chunks written by successful saves.
    pub fn saved_chunks(&self) -> usize {
        self.saved_chunks.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, HashMap<ChunkPos, Chunk>>> {
        self.worlds.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn delay(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

impl ChunkStorage for MemoryChunkStore {
    async fn existing_among(&self, positions: &[ChunkPos], info: &WorldInfo) -> Vec<ChunkPos> {
        self.delay().await;
        let worlds = self.lock();
        match worlds.get(&info.id()) {
            Some(world) => positions
                .iter()
                .copied()
                .filter(|p| world.contains_key(p))
                .collect(),
            None => Vec::new(),
        }
    }

    async fn load(&self, positions: &[ChunkPos], info: &WorldInfo) -> Vec<Chunk> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        let worlds = self.lock();
        let Some(world) = worlds.get(&info.id()) else {
            return Vec::new();
        };
        positions.iter().filter_map(|p| world.get(p).cloned()).collect()
    }

    async fn save(&self, chunks: &[Chunk], info: &WorldInfo) -> Result<(), StoreError> {
        self.delay().await;
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::other("memory store refuses saves")));
        }
        let mut worlds = self.lock();
        let world = worlds.entry(info.id()).or_default();
        for chunk in chunks {
            let mut stored = chunk.clone();
            stored.mark_persisted(stored.revision());
            world.insert(stored.position(), stored);
        }
        self.save_calls.fetch_add(1, Ordering::SeqCst);
        self.saved_chunks.fetch_add(chunks.len(), Ordering::SeqCst);
        Ok(())
    }
}
