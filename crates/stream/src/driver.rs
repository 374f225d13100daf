use std::sync::Arc;

use islands_persist::ChunkStorage;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::World;

/// Background task that drains a world's queue on a fixed period.
///
/// Stopping waits for a drain in progress to finish, so no popped operation is lost.
/// Dropping the handle stops the driver the same way, without waiting.
#[must_use = "dropping the handle stops the driver"]
pub struct DrainDriver {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl DrainDriver {
    /// Stop after the current drain, if any, and wait for the task to end.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "drain driver task failed");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl<S: ChunkStorage> World<S> {
    /// Drain the queue every `drain_interval` on the current tokio runtime.
    ///
    /// The driver holds only a weak reference and also ends once every handle to the world
    /// is gone. Failed drains are logged and the driver keeps ticking.
    pub fn spawn_driver(&self) -> DrainDriver {
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.drain_interval();
        let (stop, mut stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = &mut stopped => break,
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let world = World { inner };
                if let Err(e) = world.process_operations().await {
                    tracing::error!(error = %e, "background drain failed");
                }
            }
            tracing::debug!("drain driver stopped");
        });
        DrainDriver {
            stop: Some(stop),
            task,
        }
    }
}
