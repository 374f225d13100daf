use std::future::Future;
use std::pin::Pin;
use std::slice;
use std::task::{Context, Poll};

use islands_common::{ChunkPos, LoaderId, TilePos};
use islands_kernel::TileId;
use tokio::sync::oneshot;

use crate::WorldError;

/// A queued unit of work. Each carries the sender that resolves its caller's handle.
pub(crate) enum Operation {
    Load {
        positions: Vec<ChunkPos>,
        loader: LoaderId,
        done: oneshot::Sender<()>,
    },
    Unload {
        positions: Vec<ChunkPos>,
        loader: LoaderId,
        done: oneshot::Sender<()>,
    },
    ReadTile {
        tile: TilePos,
        chunk: ChunkPos,
        done: oneshot::Sender<Option<TileId>>,
    },
    WriteTile {
        tile: TilePos,
        chunk: ChunkPos,
        id: TileId,
        done: oneshot::Sender<bool>,
    },
    RemoveTile {
        tile: TilePos,
        chunk: ChunkPos,
        done: oneshot::Sender<bool>,
    },
    IsEmpty {
        tile: TilePos,
        chunk: ChunkPos,
        done: oneshot::Sender<bool>,
    },
}

impl Operation {
    /// Chunks this operation reads, writes, requests or releases.
    pub(crate) fn chunk_positions(&self) -> &[ChunkPos] {
        match self {
            Self::Load { positions, .. } | Self::Unload { positions, .. } => positions,
            Self::ReadTile { chunk, .. }
            | Self::WriteTile { chunk, .. }
            | Self::RemoveTile { chunk, .. }
            | Self::IsEmpty { chunk, .. } => slice::from_ref(chunk),
        }
    }

    pub(crate) fn touches(&self, pos: ChunkPos) -> bool {
        self.chunk_positions().contains(&pos)
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Load { .. } => "load",
            Self::Unload { .. } => "unload",
            Self::ReadTile { .. } => "read_tile",
            Self::WriteTile { .. } => "write_tile",
            Self::RemoveTile { .. } => "remove_tile",
            Self::IsEmpty { .. } => "is_empty",
        }
    }
}

/// Completion of a queued operation.
///
/// Resolves once a drain has executed the operation. Dropping the handle does not cancel the
/// operation. If the world is dropped with the operation still queued, the handle resolves to
/// [`WorldError::Abandoned`].
#[must_use = "the handle is how the result of a queued operation is observed"]
#[derive(Debug)]
pub struct OperationHandle<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> OperationHandle<T> {
    pub(crate) fn new(rx: oneshot::Receiver<T>) -> Self {
        Self { rx }
    }

    /// The result if the operation already ran, without waiting.
    pub fn try_result(&mut self) -> Option<Result<T, WorldError>> {
        match self.rx.try_recv() {
            Ok(value) => Some(Ok(value)),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(WorldError::Abandoned)),
        }
    }
}

impl<T> Future for OperationHandle<T> {
    type Output = Result<T, WorldError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.map_err(|_| WorldError::Abandoned))
    }
}
