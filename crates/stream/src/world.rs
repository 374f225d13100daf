use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use islands_common::{ChunkExtent, ChunkPos, LoaderId, TileBounds, TilePos, WorldInfo};
use islands_kernel::TileId;
use islands_persist::ChunkStorage;
use tokio::sync::oneshot;

use crate::operation::{Operation, OperationHandle};
use crate::scheduler::{DrainState, SchedulerState};
use crate::stats::{DrainHistory, DrainStats};
use crate::table::{ChunkTable, SharedChunk};
use crate::{StreamConfig, WorldError};

/// Handle to a streamed tile world.
///
/// Tile reads and writes, load requests and unload requests are queued and take effect when
/// the queue is drained, in submission order. Cloning the handle is cheap; all clones share
/// one queue, one chunk table and one storage backend.
pub struct World<S> {
    pub(crate) inner: Arc<WorldInner<S>>,
}

pub(crate) struct WorldInner<S> {
    pub(crate) table: ChunkTable<S>,
    pub(crate) config: StreamConfig,
    pub(crate) state: Mutex<SchedulerState>,
    pub(crate) history: Mutex<DrainHistory>,
}

impl<S> Clone for World<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> WorldInner<S> {
    pub(crate) fn state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn history(&self) -> MutexGuard<'_, DrainHistory> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<S: ChunkStorage> World<S> {
    pub fn new(storage: Arc<S>, config: StreamConfig) -> Self {
        tracing::info!(world = %config.world, extent = ?config.chunk_extent.size(), "opening world");
        let table = ChunkTable::new(storage, config.world.clone(), config.chunk_extent);
        let history = DrainHistory::new(config.drain_history);
        Self {
            inner: Arc::new(WorldInner {
                table,
                config,
                state: Mutex::new(SchedulerState::default()),
                history: Mutex::new(history),
            }),
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.inner.config
    }

    pub fn info(&self) -> &WorldInfo {
        self.inner.table.info()
    }

    pub fn extent(&self) -> ChunkExtent {
        self.inner.table.extent()
    }

    pub fn storage(&self) -> &Arc<S> {
        self.inner.table.storage()
    }

    fn enqueue<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Operation) -> OperationHandle<T> {
        let (done, rx) = oneshot::channel();
        let op = make(done);
        tracing::trace!(op = op.name(), "operation queued");
        self.inner.state().queue.push_back(op);
        OperationHandle::new(rx)
    }

    /// Ask for `positions` to stay resident on behalf of `loader`.
    pub fn request_load(
        &self,
        positions: impl IntoIterator<Item = ChunkPos>,
        loader: LoaderId,
    ) -> OperationHandle<()> {
        let positions = positions.into_iter().collect();
        self.enqueue(|done| Operation::Load {
            positions,
            loader,
            done,
        })
    }

    /// Request every chunk overlapping `bounds`, partially covered chunks included.
    pub fn request_load_bounds(&self, bounds: TileBounds, loader: LoaderId) -> OperationHandle<()> {
        let chunks = self.extent().tile_bounds_to_chunk_bounds(bounds);
        self.request_load(chunks.positions().collect::<Vec<_>>(), loader)
    }

    /// Withdraw `loader`'s interest in `positions`. Chunks it never requested are ignored.
    pub fn request_unload(
        &self,
        positions: impl IntoIterator<Item = ChunkPos>,
        loader: LoaderId,
    ) -> OperationHandle<()> {
        let positions = positions.into_iter().collect();
        self.enqueue(|done| Operation::Unload {
            positions,
            loader,
            done,
        })
    }

    pub fn request_unload_bounds(
        &self,
        bounds: TileBounds,
        loader: LoaderId,
    ) -> OperationHandle<()> {
        let chunks = self.extent().tile_bounds_to_chunk_bounds(bounds);
        self.request_unload(chunks.positions().collect::<Vec<_>>(), loader)
    }

    /// The tile at `tile`, or `None` for an empty cell.
    pub fn read_tile(&self, tile: TilePos) -> OperationHandle<Option<TileId>> {
        let chunk = self.extent().tile_to_chunk(tile);
        self.enqueue(|done| Operation::ReadTile { tile, chunk, done })
    }

    /// Place a tile. Resolves to whether the cell changed.
    pub fn write_tile(&self, tile: TilePos, id: impl Into<TileId>) -> OperationHandle<bool> {
        let chunk = self.extent().tile_to_chunk(tile);
        let id = id.into();
        self.enqueue(|done| Operation::WriteTile {
            tile,
            chunk,
            id,
            done,
        })
    }

    /// Clear a cell. Resolves to whether there was a tile to remove.
    pub fn remove_tile(&self, tile: TilePos) -> OperationHandle<bool> {
        let chunk = self.extent().tile_to_chunk(tile);
        self.enqueue(|done| Operation::RemoveTile { tile, chunk, done })
    }

    pub fn is_empty(&self, tile: TilePos) -> OperationHandle<bool> {
        let chunk = self.extent().tile_to_chunk(tile);
        self.enqueue(|done| Operation::IsEmpty { tile, chunk, done })
    }

    /// Make chunks resident right away, bypassing the queue.
    ///
    /// Meant for collaborators that already hold a load request on these chunks or that run
    /// from inside a drain. Chunks nobody requested will be evicted by the next drain that
    /// touches them.
    pub async fn get_or_create_chunks(&self, positions: &[ChunkPos]) -> Vec<SharedChunk> {
        self.inner.table.get_or_create(positions).await
    }

    pub async fn get_or_create_chunk(&self, pos: ChunkPos) -> SharedChunk {
        self.inner.table.get_or_create_one(pos).await
    }

    /// Direct access to a resident chunk. Never loads.
    pub fn chunk_data(&self, pos: ChunkPos) -> Result<SharedChunk, WorldError> {
        self.inner.table.get(pos).ok_or_else(|| {
            tracing::error!(%pos, "direct access to a chunk that is not resident");
            WorldError::ChunkNotResident(pos)
        })
    }

    pub fn chunk_data_for_tile(&self, tile: TilePos) -> Result<SharedChunk, WorldError> {
        self.chunk_data(self.extent().tile_to_chunk(tile))
    }

    /// Resident chunks with unsaved changes.
    pub async fn dirty_chunks(&self) -> Vec<(ChunkPos, SharedChunk)> {
        self.inner.table.dirty_chunks().await
    }

    /// Save every dirty resident chunk without evicting anything. Returns how many were saved.
    pub async fn flush(&self) -> Result<usize, WorldError> {
        let dirty = self.inner.table.dirty_chunks().await;
        let saved = self.inner.table.persist(&dirty).await?;
        if saved > 0 {
            tracing::info!(saved, "flushed dirty chunks");
        }
        Ok(saved)
    }

    pub fn is_resident(&self, pos: ChunkPos) -> bool {
        self.inner.table.is_resident(pos)
    }

    pub fn resident_positions(&self) -> Vec<ChunkPos> {
        self.inner.table.resident_positions()
    }

    pub fn resident_len(&self) -> usize {
        self.inner.table.len()
    }

    /// Positions with a storage load in flight.
    pub fn pending_loads(&self) -> usize {
        self.inner.table.pending_loads()
    }

    pub fn is_requested(&self, pos: ChunkPos) -> bool {
        self.inner.state().registry.is_requested(pos)
    }

    pub fn requested_positions(&self) -> Vec<ChunkPos> {
        self.inner.state().registry.requested_positions().collect()
    }

    pub fn queued_len(&self) -> usize {
        self.inner.state().queue.len()
    }

    pub fn drain_state(&self) -> DrainState {
        self.inner.state().drain
    }

    /// Statistics of the most recent completed drain.
    pub fn last_drain(&self) -> DrainStats {
        self.inner.history().last().copied().unwrap_or_default()
    }

    /// Statistics of recent drains, oldest first.
    pub fn drain_history(&self) -> DrainHistory {
        self.inner.history().clone()
    }
}
