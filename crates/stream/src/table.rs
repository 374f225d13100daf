use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};
use islands_common::{ChunkExtent, ChunkPos, TilePos, WorldInfo};
use islands_kernel::{Chunk, TileId};
use islands_persist::ChunkStorage;
use tokio::sync::RwLock;

use crate::WorldError;

/// A resident chunk. Everyone holding one sees the same data.
pub type SharedChunk = Arc<RwLock<Chunk>>;

type LoadedBatch = Arc<HashMap<ChunkPos, SharedChunk>>;
type PendingLoad = Shared<BoxFuture<'static, LoadedBatch>>;

/// Resident chunks plus the loads currently in flight.
///
/// At most one load per position is outstanding at any time; concurrent callers asking for a
/// position that is already loading await the same future. Lock order is `pending` before
/// `chunks`, and neither is held across an await.
pub struct ChunkTable<S> {
    inner: Arc<TableInner<S>>,
}

struct TableInner<S> {
    storage: Arc<S>,
    info: WorldInfo,
    extent: ChunkExtent,
    chunks: Mutex<HashMap<ChunkPos, SharedChunk>>,
    pending: Mutex<HashMap<ChunkPos, PendingLoad>>,
}

impl<S> Clone for ChunkTable<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> TableInner<S> {
    fn chunks(&self) -> MutexGuard<'_, HashMap<ChunkPos, SharedChunk>> {
        self.chunks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<ChunkPos, PendingLoad>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<S: ChunkStorage> ChunkTable<S> {
    pub fn new(storage: Arc<S>, info: WorldInfo, extent: ChunkExtent) -> Self {
        Self {
            inner: Arc::new(TableInner {
                storage,
                info,
                extent,
                chunks: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn extent(&self) -> ChunkExtent {
        self.inner.extent
    }

    pub fn info(&self) -> &WorldInfo {
        &self.inner.info
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.inner.storage
    }

    /// Resident chunk at `pos`, without loading.
    pub fn get(&self, pos: ChunkPos) -> Option<SharedChunk> {
        self.inner.chunks().get(&pos).cloned()
    }

    pub fn is_resident(&self, pos: ChunkPos) -> bool {
        self.inner.chunks().contains_key(&pos)
    }

    pub fn resident_positions(&self) -> Vec<ChunkPos> {
        self.inner.chunks().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.chunks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.chunks().is_empty()
    }

    /// Number of positions with a load in flight.
    pub fn pending_loads(&self) -> usize {
        self.inner.pending().len()
    }

    /// Make every position resident and return the chunks in request order.
    ///
    /// Resident chunks are returned as is. Positions already loading join that load. The rest
    /// are loaded from storage in one batch, and whatever storage does not have is created
    /// empty. The batch is registered before the first await, so a concurrent caller can
    /// never start a second load for the same position.
    pub async fn get_or_create(&self, positions: &[ChunkPos]) -> Vec<SharedChunk> {
        let mut found: HashMap<ChunkPos, SharedChunk> = HashMap::new();
        let mut waits: Vec<PendingLoad> = Vec::new();
        {
            let mut pending = self.inner.pending();
            let chunks = self.inner.chunks();
            let mut batch = Vec::new();
            let mut seen = HashSet::new();
            for &pos in positions {
                if !seen.insert(pos) {
                    continue;
                }
                if let Some(chunk) = chunks.get(&pos) {
                    found.insert(pos, Arc::clone(chunk));
                } else if let Some(load) = pending.get(&pos) {
                    waits.push(load.clone());
                } else {
                    batch.push(pos);
                }
            }
            if !batch.is_empty() {
                tracing::debug!(count = batch.len(), "loading chunk batch");
                let load = self.load_batch(batch.clone()).shared();
                for pos in batch {
                    pending.insert(pos, load.clone());
                }
                waits.push(load);
            }
        }

        for load in waits {
            let loaded = load.await;
            for pos in positions {
                if let Some(chunk) = loaded.get(pos) {
                    found.entry(*pos).or_insert_with(|| Arc::clone(chunk));
                }
            }
        }

        positions
            .iter()
            .map(|&pos| match found.get(&pos) {
                Some(chunk) => Arc::clone(chunk),
                None => self.resident_or_fresh(pos),
            })
            .collect()
    }

    pub async fn get_or_create_one(&self, pos: ChunkPos) -> SharedChunk {
        match self.get_or_create(&[pos]).await.pop() {
            Some(chunk) => chunk,
            None => self.resident_or_fresh(pos),
        }
    }

    fn resident_or_fresh(&self, pos: ChunkPos) -> SharedChunk {
        let extent = self.inner.extent;
        let mut chunks = self.inner.chunks();
        Arc::clone(
            chunks
                .entry(pos)
                .or_insert_with(|| Arc::new(RwLock::new(Chunk::new(pos, extent)))),
        )
    }

    /// Future that resolves one batch. It publishes its results and retires its tracker
    /// entries itself, so the batch completes for every waiter even if the caller that
    /// started it stops polling.
    fn load_batch(&self, batch: Vec<ChunkPos>) -> BoxFuture<'static, LoadedBatch> {
        let inner = Arc::clone(&self.inner);
        async move {
            let existing = inner.storage.existing_among(&batch, &inner.info).await;
            let loaded = if existing.is_empty() {
                Vec::new()
            } else {
                inner.storage.load(&existing, &inner.info).await
            };

            let mut resolved = HashMap::with_capacity(batch.len());
            let mut pending = inner.pending();
            let mut chunks = inner.chunks();
            for chunk in loaded {
                let pos = chunk.position();
                if !batch.contains(&pos) || chunk.extent() != inner.extent {
                    tracing::warn!(%pos, "storage returned a chunk that was not asked for; ignoring");
                    continue;
                }
                let shared = chunks
                    .entry(pos)
                    .or_insert_with(|| Arc::new(RwLock::new(chunk)));
                resolved.insert(pos, Arc::clone(shared));
            }
            let found = resolved.len();
            for &pos in &batch {
                if !resolved.contains_key(&pos) {
                    let shared = chunks
                        .entry(pos)
                        .or_insert_with(|| Arc::new(RwLock::new(Chunk::new(pos, inner.extent))));
                    resolved.insert(pos, Arc::clone(shared));
                }
                pending.remove(&pos);
            }
            tracing::debug!(
                loaded = found,
                created = batch.len() - found,
                "chunk batch resident"
            );
            Arc::new(resolved)
        }
        .boxed()
    }

    /// Resident chunks with unsaved changes.
    pub async fn dirty_chunks(&self) -> Vec<(ChunkPos, SharedChunk)> {
        let resident: Vec<(ChunkPos, SharedChunk)> = self
            .inner
            .chunks()
            .iter()
            .map(|(pos, chunk)| (*pos, Arc::clone(chunk)))
            .collect();
        let mut dirty = Vec::new();
        for (pos, chunk) in resident {
            if chunk.read().await.is_dirty() {
                dirty.push((pos, chunk));
            }
        }
        dirty
    }

    /// Save the dirty ones among `chunks` in a single storage call. A chunk is marked clean
    /// only if it was not changed again while the save was running. Returns how many chunks
    /// were written.
    pub async fn persist(&self, chunks: &[(ChunkPos, SharedChunk)]) -> Result<usize, WorldError> {
        let mut copies = Vec::new();
        let mut revisions = Vec::new();
        for (_, chunk) in chunks {
            let data = chunk.read().await;
            if data.is_dirty() {
                revisions.push((Arc::clone(chunk), data.revision()));
                copies.push(data.clone());
            }
        }
        if copies.is_empty() {
            return Ok(0);
        }

        self.inner.storage.save(&copies, &self.inner.info).await?;
        for (chunk, revision) in &revisions {
            if !chunk.write().await.mark_persisted(*revision) {
                tracing::debug!("chunk changed while saving; still dirty");
            }
        }
        Ok(copies.len())
    }

    /// Drop `chunk` from the table and wipe it, provided it is still the resident chunk at
    /// `pos`, is clean, and `still_unreferenced` holds once the write lock is taken.
    pub async fn evict(
        &self,
        pos: ChunkPos,
        chunk: &SharedChunk,
        still_unreferenced: impl FnOnce() -> bool,
    ) -> bool {
        let mut data = chunk.write().await;
        if data.is_dirty() {
            tracing::debug!(%pos, "chunk changed after its save; keeping it resident");
            return false;
        }
        if !still_unreferenced() {
            tracing::debug!(%pos, "chunk referenced again; keeping it resident");
            return false;
        }
        {
            let mut chunks = self.inner.chunks();
            match chunks.get(&pos) {
                Some(resident) if Arc::ptr_eq(resident, chunk) => {
                    chunks.remove(&pos);
                }
                _ => return false,
            }
        }
        data.clear();
        true
    }

    pub async fn tile_at(&self, tile: TilePos) -> Option<TileId> {
        let chunk = self.chunk_for_tile(tile).await;
        let data = chunk.read().await;
        data.tile_at(tile).cloned()
    }

    pub async fn set_tile(&self, tile: TilePos, id: TileId) -> bool {
        let chunk = self.chunk_for_tile(tile).await;
        let mut data = chunk.write().await;
        data.set_tile(tile, id)
    }

    pub async fn remove_tile(&self, tile: TilePos) -> bool {
        let chunk = self.chunk_for_tile(tile).await;
        let mut data = chunk.write().await;
        data.remove_tile(tile)
    }

    pub async fn is_empty_tile(&self, tile: TilePos) -> bool {
        let chunk = self.chunk_for_tile(tile).await;
        let data = chunk.read().await;
        data.is_empty_at(tile)
    }

    async fn chunk_for_tile(&self, tile: TilePos) -> SharedChunk {
        self.get_or_create_one(self.inner.extent.tile_to_chunk(tile))
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use islands_persist::MemoryChunkStore;

    fn extent() -> ChunkExtent {
        ChunkExtent::flat(4, 4).unwrap()
    }

    fn table(store: MemoryChunkStore) -> (ChunkTable<MemoryChunkStore>, Arc<MemoryChunkStore>) {
        let store = Arc::new(store);
        let table = ChunkTable::new(Arc::clone(&store), WorldInfo::default(), extent());
        (table, store)
    }

    fn stored_chunk(pos: ChunkPos, tile: &str) -> Chunk {
        let mut chunk = Chunk::new(pos, extent());
        chunk.set_tile(extent().chunk_origin(pos), tile);
        chunk
    }

    #[tokio::test]
    async fn missing_chunks_are_created_empty() {
        let (table, store) = table(MemoryChunkStore::new());
        let pos = ChunkPos::flat(3, -1);
        let chunk = table.get_or_create_one(pos).await;
        let data = chunk.read().await;
        assert!(data.is_blank());
        assert!(!data.is_dirty());
        assert_eq!(data.position(), pos);
        assert!(table.is_resident(pos));
        assert_eq!(store.load_calls(), 0);
    }

    #[tokio::test]
    async fn stored_chunks_are_loaded() {
        let (table, store) = table(MemoryChunkStore::new());
        let pos = ChunkPos::flat(0, 0);
        store.insert(&WorldInfo::default(), stored_chunk(pos, "grass"));

        let tile = table.tile_at(TilePos::flat(0, 0)).await;
        assert_eq!(tile, Some(TileId::from("grass")));
        assert_eq!(store.load_calls(), 1);
    }

    #[tokio::test]
    async fn results_follow_request_order() {
        let (table, _store) = table(MemoryChunkStore::new());
        let first = ChunkPos::flat(1, 0);
        table.get_or_create_one(first).await;

        let order = [ChunkPos::flat(2, 2), first, ChunkPos::flat(-5, 0), first];
        let chunks = table.get_or_create(&order).await;
        assert_eq!(chunks.len(), 4);
        for (pos, chunk) in order.iter().zip(&chunks) {
            assert_eq!(chunk.read().await.position(), *pos);
        }
        assert!(Arc::ptr_eq(&chunks[1], &chunks[3]));
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_load() {
        let (table, store) = table(MemoryChunkStore::with_latency(Duration::from_millis(20)));
        let pos = ChunkPos::flat(7, 7);
        store.insert(&WorldInfo::default(), stored_chunk(pos, "sand"));

        let batch = [pos, ChunkPos::flat(8, 7)];
        let (a, b, c) = tokio::join!(
            table.get_or_create_one(pos),
            table.get_or_create_one(pos),
            table.get_or_create(&batch),
        );
        assert_eq!(store.load_calls(), 1);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &c[0]));
        assert_eq!(table.pending_loads(), 0);
    }

    #[tokio::test]
    async fn load_completes_when_starter_is_dropped() {
        let (table, store) = table(MemoryChunkStore::with_latency(Duration::from_millis(20)));
        let pos = ChunkPos::flat(0, 1);
        store.insert(&WorldInfo::default(), stored_chunk(pos, "dirt"));

        let abandoned =
            tokio::time::timeout(Duration::from_millis(1), table.get_or_create_one(pos)).await;
        assert!(abandoned.is_err());
        assert_eq!(table.pending_loads(), 1);

        let chunk = table.get_or_create_one(pos).await;
        assert_eq!(chunk.read().await.tile_count(), 1);
        assert_eq!(store.load_calls(), 1);
        assert_eq!(table.pending_loads(), 0);
    }

    #[tokio::test]
    async fn tile_accessors_mutate_and_dirty() {
        let (table, _store) = table(MemoryChunkStore::new());
        let tile = TilePos::flat(-1, -1);
        assert!(table.is_empty_tile(tile).await);
        assert!(table.set_tile(tile, TileId::from("rock")).await);
        assert!(!table.set_tile(tile, TileId::from("rock")).await);
        assert!(!table.is_empty_tile(tile).await);

        let dirty = table.dirty_chunks().await;
        assert_eq!(dirty.len(), 1);
        assert_eq!(dirty[0].0, ChunkPos::flat(-1, -1));

        assert!(table.remove_tile(tile).await);
        assert!(!table.remove_tile(tile).await);
    }

    #[tokio::test]
    async fn persist_marks_saved_chunks_clean() {
        let (table, store) = table(MemoryChunkStore::new());
        table.set_tile(TilePos::flat(5, 5), TileId::from("sand")).await;
        let dirty = table.dirty_chunks().await;

        assert_eq!(table.persist(&dirty).await.unwrap(), 1);
        assert!(table.dirty_chunks().await.is_empty());
        assert!(store.contains(&WorldInfo::default(), ChunkPos::flat(1, 1)));
        // Nothing left to write.
        assert_eq!(table.persist(&dirty).await.unwrap(), 0);
        assert_eq!(store.save_calls(), 1);
    }

    #[tokio::test]
    async fn failed_persist_keeps_chunks_dirty() {
        let (table, store) = table(MemoryChunkStore::new());
        table.set_tile(TilePos::flat(0, 0), TileId::from("sand")).await;
        store.set_fail_saves(true);
        let dirty = table.dirty_chunks().await;

        assert!(matches!(table.persist(&dirty).await, Err(WorldError::Storage(_))));
        assert_eq!(table.dirty_chunks().await.len(), 1);
    }

    #[tokio::test]
    async fn evict_refuses_dirty_or_referenced_chunks() {
        let (table, _store) = table(MemoryChunkStore::new());
        let pos = ChunkPos::flat(0, 0);
        table.set_tile(TilePos::flat(1, 1), TileId::from("sand")).await;
        let chunk = table.get(pos).unwrap();

        assert!(!table.evict(pos, &chunk, || true).await);
        let dirty = table.dirty_chunks().await;
        table.persist(&dirty).await.unwrap();

        assert!(!table.evict(pos, &chunk, || false).await);
        assert!(table.is_resident(pos));

        assert!(table.evict(pos, &chunk, || true).await);
        assert!(!table.is_resident(pos));
        assert!(chunk.read().await.is_blank());
    }
}
