//! Background rollup worker.
//!
//! Turns hand rollup requests to a bounded queue and return. One task
//! drains the queue and runs each rollup on its own task, bounded by a
//! semaphore. A full queue drops the request: the session is still due,
//! so the next turn asks again.

use crate::rollup::{RollupController, RollupOutcome};
use mir_core::SessionId;
use mir_persistence::{UserRecord, WriteBehindDispatcher};
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};

/// Rollup worker configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollupWorkerConfig {
    /// Pending rollup requests before new ones are dropped.
    pub queue_capacity: usize,
    /// Rollups allowed to run at once.
    pub max_concurrent: usize,
}

impl Default for RollupWorkerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            max_concurrent: 4,
        }
    }
}

/// Producer side of the rollup queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct RollupRequests {
    sender: mpsc::Sender<SessionId>,
}

impl RollupRequests {
    /// Asks for a rollup of the session without waiting.
    ///
    /// Returns false if the request was dropped.
    pub fn request(&self, id: &SessionId) -> bool {
        match self.sender.try_send(id.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(session_id = %id, "rollup queue full, dropping request");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!(session_id = %id, "rollup queue closed, dropping request");
                false
            }
        }
    }
}

/// Drains rollup requests.
pub struct RollupWorker {
    controller: RollupController,
    dispatcher: WriteBehindDispatcher,
    receiver: mpsc::Receiver<SessionId>,
    max_concurrent: usize,
}

impl RollupWorker {
    /// Creates the queue and spawns the worker on the current runtime.
    ///
    /// The worker stops once every [`RollupRequests`] clone is dropped and
    /// the rollups already started have finished.
    #[must_use]
    pub fn start(
        controller: RollupController,
        dispatcher: WriteBehindDispatcher,
        config: RollupWorkerConfig,
    ) -> (RollupRequests, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let worker = Self {
            controller,
            dispatcher,
            receiver,
            max_concurrent: config.max_concurrent.max(1),
        };
        (RollupRequests { sender }, tokio::spawn(worker.run()))
    }

    async fn run(mut self) {
        let limit = Arc::new(Semaphore::new(self.max_concurrent));
        let mut tasks = JoinSet::new();
        tracing::debug!("rollup worker started");

        while let Some(id) = self.receiver.recv().await {
            let Ok(permit) = Arc::clone(&limit).acquire_owned().await else {
                break;
            };
            while let Some(result) = tasks.try_join_next() {
                log_abnormal(result);
            }

            let controller = self.controller.clone();
            let dispatcher = self.dispatcher.clone();
            tasks.spawn(async move {
                let _permit = permit;
                rollup_one(&controller, &dispatcher, &id).await;
            });
        }

        while let Some(result) = tasks.join_next().await {
            log_abnormal(result);
        }
        tracing::debug!("rollup worker stopped");
    }
}

async fn rollup_one(
    controller: &RollupController,
    dispatcher: &WriteBehindDispatcher,
    id: &SessionId,
) {
    // Duplicate requests find the session no longer due.
    match controller.needs_rollup(id) {
        Ok(true) => {}
        Ok(false) => return,
        Err(e) => {
            tracing::debug!(session_id = %id, error = %e, "skipping rollup");
            return;
        }
    }

    match controller.rollup(id).await {
        Ok(RollupOutcome::Completed {
            summarized,
            carried_over,
            ..
        }) => {
            tracing::info!(session_id = %id, summarized, carried_over, "session history rolled up");
            // Queued under the session lock so it cannot overtake a newer turn's upsert.
            let queued = controller.store().inspect(id, |session| {
                dispatcher.enqueue_user_upsert(UserRecord::from_snapshot(
                    id.clone(),
                    session.snapshot(),
                ))
            });
            if let Err(e) = queued {
                tracing::debug!(session_id = %id, error = %e, "session gone after rollup");
            }
        }
        Ok(RollupOutcome::AlreadyRunning | RollupOutcome::Skipped) => {}
        Err(e) => {
            tracing::warn!(
                session_id = %id,
                operation = "rollup",
                error = %e,
                "rollup failed"
            );
        }
    }
}

fn log_abnormal(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        tracing::error!(error = %e, "rollup task terminated abnormally");
    }
}
