use std::collections::{HashSet, VecDeque};
use std::time::Instant;

use islands_common::ChunkPos;
use islands_persist::ChunkStorage;
use tracing::Instrument;

use crate::operation::Operation;
use crate::registry::LoadRequestRegistry;
use crate::stats::{DrainOutcome, DrainStats};
use crate::table::SharedChunk;
use crate::world::{World, WorldInner};
use crate::WorldError;

/// Whether a drain is currently running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DrainState {
    #[default]
    Idle,
    Draining,
}

#[derive(Default)]
pub(crate) struct SchedulerState {
    pub(crate) queue: VecDeque<Operation>,
    pub(crate) registry: LoadRequestRegistry,
    pub(crate) drain: DrainState,
    /// Positions touched by executed operations and not yet considered for eviction. Kept
    /// here rather than in the drain so an interrupted or failed pass is picked up again.
    pub(crate) touched: HashSet<ChunkPos>,
}

impl SchedulerState {
    /// Nothing wants `pos`: no loader holds it and no queued operation names it.
    fn is_unreferenced(&self, pos: ChunkPos) -> bool {
        !self.registry.is_requested(pos) && !self.queue.iter().any(|op| op.touches(pos))
    }
}

/// Puts the scheduler back to idle if a drain ends early, through an error or by being
/// dropped mid-await.
struct DrainGuard<'a, S> {
    inner: &'a WorldInner<S>,
    finished: bool,
}

impl<S> Drop for DrainGuard<'_, S> {
    fn drop(&mut self) {
        if !self.finished {
            self.inner.state().drain = DrainState::Idle;
        }
    }
}

impl<S: ChunkStorage> World<S> {
    /// Execute every queued operation, then evict what nothing references any more.
    ///
    /// Operations queued while the drain runs are executed by the same drain; it goes idle
    /// only once it observes an empty queue. If a drain is already running this returns
    /// [`DrainOutcome::AlreadyDraining`] immediately.
    ///
    /// A failed save aborts the drain with [`WorldError::Storage`]. The affected chunks stay
    /// resident and dirty and are retried by the next drain. Dropping the returned future
    /// mid-drain abandons the operation being executed at that moment.
    pub async fn process_operations(&self) -> Result<DrainOutcome, WorldError> {
        {
            let mut state = self.inner.state();
            if state.drain == DrainState::Draining {
                tracing::trace!("drain already running");
                return Ok(DrainOutcome::AlreadyDraining);
            }
            state.drain = DrainState::Draining;
        }
        let mut guard = DrainGuard {
            inner: &self.inner,
            finished: false,
        };

        let started = Instant::now();
        let mut stats = DrainStats::default();
        let span = tracing::info_span!("drain");
        self.drain(&mut guard, &mut stats).instrument(span).await?;
        stats.duration = started.elapsed();
        stats.resident = self.inner.table.len();

        self.inner.history().record(stats);
        Ok(DrainOutcome::Drained(stats))
    }

    async fn drain(
        &self,
        guard: &mut DrainGuard<'_, S>,
        stats: &mut DrainStats,
    ) -> Result<(), WorldError> {
        loop {
            stats.cycles += 1;
            while let Some(op) = self.next_operation() {
                stats.operations += 1;
                self.execute(op).await;
            }

            if !self.inner.state().touched.is_empty() {
                self.evict_unreferenced(stats).await?;
            }

            let mut state = self.inner.state();
            if state.queue.is_empty() {
                state.drain = DrainState::Idle;
                guard.finished = true;
                tracing::debug!(
                    operations = stats.operations,
                    saved = stats.saved,
                    evicted = stats.evicted,
                    "drain complete"
                );
                return Ok(());
            }
        }
    }

    fn next_operation(&self) -> Option<Operation> {
        let mut state = self.inner.state();
        let op = state.queue.pop_front()?;
        state.touched.extend(op.chunk_positions().iter().copied());
        Some(op)
    }

    async fn execute(&self, op: Operation) {
        tracing::trace!(op = op.name(), "executing");
        let table = &self.inner.table;
        // A send only fails if the caller dropped its handle, which is allowed.
        match op {
            Operation::Load {
                positions,
                loader,
                done,
            } => {
                let added = self.inner.state().registry.add(&positions, loader);
                tracing::debug!(%loader, chunks = positions.len(), added, "load requested");
                table.get_or_create(&positions).await;
                let _ = done.send(());
            }
            Operation::Unload {
                positions,
                loader,
                done,
            } => {
                let removed = self.inner.state().registry.remove(&positions, loader);
                tracing::debug!(%loader, chunks = positions.len(), removed, "unload requested");
                let _ = done.send(());
            }
            Operation::ReadTile { tile, done, .. } => {
                let _ = done.send(table.tile_at(tile).await);
            }
            Operation::WriteTile { tile, id, done, .. } => {
                let _ = done.send(table.set_tile(tile, id).await);
            }
            Operation::RemoveTile { tile, done, .. } => {
                let _ = done.send(table.remove_tile(tile).await);
            }
            Operation::IsEmpty { tile, done, .. } => {
                let _ = done.send(table.is_empty_tile(tile).await);
            }
        }
    }

    /// Save and drop the touched chunks nothing references any more.
    ///
    /// The touched set is only cleared once the pass completes, so a failed save leaves the
    /// candidates for the next drain.
    async fn evict_unreferenced(&self, stats: &mut DrainStats) -> Result<(), WorldError> {
        let (touched, candidates): (Vec<ChunkPos>, Vec<(ChunkPos, SharedChunk)>) = {
            let state = self.inner.state();
            let candidates = state
                .touched
                .iter()
                .copied()
                .filter(|&pos| state.is_unreferenced(pos))
                .filter_map(|pos| self.inner.table.get(pos).map(|chunk| (pos, chunk)))
                .collect();
            (state.touched.iter().copied().collect(), candidates)
        };
        stats.candidates += candidates.len();

        match self.inner.table.persist(&candidates).await {
            Ok(saved) => stats.saved += saved,
            Err(e) => {
                tracing::error!(error = %e, chunks = candidates.len(), "saving eviction candidates failed");
                return Err(e);
            }
        }

        for (pos, chunk) in &candidates {
            let evicted = self
                .inner
                .table
                .evict(*pos, chunk, || self.inner.state().is_unreferenced(*pos))
                .await;
            if evicted {
                stats.evicted += 1;
                tracing::trace!(%pos, "chunk evicted");
            }
        }

        let mut state = self.inner.state();
        for pos in &touched {
            state.touched.remove(pos);
        }
        Ok(())
    }

    /// Drain until the queue is empty, then save everything still dirty. Meant for orderly
    /// teardown; resident chunks stay in memory.
    pub async fn shutdown(&self) -> Result<usize, WorldError> {
        loop {
            match self.process_operations().await? {
                DrainOutcome::Drained(_) => break,
                DrainOutcome::AlreadyDraining => {
                    tokio::time::sleep(self.inner.config.drain_interval()).await;
                }
            }
        }
        let saved = self.flush().await?;
        tracing::info!(world = %self.info(), saved, "world shut down");
        Ok(saved)
    }
}
