//! Owns the session core's long-lived tasks.

use crate::config::{QueueConfig, SessionsConfig};
use crate::error::ServerError;
use mir_conversation::{
    ConversationService, RollupController, RollupWorker, SessionStore, Summarizer,
};
use mir_core::Result;
use mir_persistence::{DrainWorkers, SessionStorage, WriteBehindDispatcher};
use mir_scheduler::IdleReaper;
use rootcause::Report;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// The session store with its rollup worker, write-behind queues and idle reaper.
pub struct Runtime {
    service: ConversationService,
    dispatcher: WriteBehindDispatcher,
    drain: DrainWorkers,
    rollups: JoinHandle<()>,
    reaper: IdleReaper,
    reaper_task: JoinHandle<()>,
    reaper_shutdown: watch::Sender<bool>,
}

impl Runtime {
    /// Wires the components and spawns their tasks on the current runtime.
    ///
    /// # Errors
    ///
    /// Returns `Startup` if the rollup policy or the idle reaper rejects
    /// its configuration.
    pub fn start(
        sessions: &SessionsConfig,
        queues: &QueueConfig,
        storage: Arc<dyn SessionStorage>,
        summarizer: Arc<dyn Summarizer>,
    ) -> Result<Self, ServerError> {
        let policy = sessions.rollup_policy();
        policy.validate().map_err(|e| {
            Report::new(e).context(ServerError::Startup {
                component: "rollup controller",
            })
        })?;

        let store = Arc::new(SessionStore::new());
        let reaper = IdleReaper::new(
            Arc::clone(&store),
            Arc::clone(&storage),
            queues.retry(),
            sessions.reaper(),
        )
        .map_err(|e| {
            e.context(ServerError::Startup {
                component: "idle reaper",
            })
        })?;

        let (dispatcher, drain) =
            WriteBehindDispatcher::start(Arc::clone(&storage), queues.dispatcher());
        let controller = RollupController::new(
            Arc::clone(&store),
            summarizer,
            policy,
        );
        let (requests, rollups) = RollupWorker::start(
            controller.clone(),
            dispatcher.clone(),
            queues.rollup_worker(),
        );
        let service =
            ConversationService::new(store, storage, dispatcher.clone(), controller, requests);

        let (reaper_shutdown, shutdown_rx) = watch::channel(false);
        let reaper_task = reaper.clone().spawn(shutdown_rx);

        tracing::info!(
            rollup_max_messages = sessions.rollup_max_messages,
            idle_timeout_secs = sessions.idle_timeout_seconds,
            "session runtime started"
        );

        Ok(Self {
            service,
            dispatcher,
            drain,
            rollups,
            reaper,
            reaper_task,
            reaper_shutdown,
        })
    }

    /// The reply-path entry point.
    ///
    /// Clones must be dropped before [`Runtime::shutdown`] can finish.
    #[must_use]
    pub fn service(&self) -> &ConversationService {
        &self.service
    }

    /// Stops every task, persisting what is still pending.
    ///
    /// Queued rollups finish first, then the write-behind queues drain, and
    /// finally every live session is flushed so the stored summary is the
    /// newest one.
    pub async fn shutdown(self) {
        let Self {
            service,
            dispatcher,
            drain,
            rollups,
            reaper,
            reaper_task,
            reaper_shutdown,
        } = self;

        drop(service);
        if let Err(e) = rollups.await {
            tracing::error!(error = %e, "rollup worker terminated abnormally");
        }

        // The reaper exits on its own if the receiver already observed the close.
        let _ = reaper_shutdown.send(true);
        if let Err(e) = reaper_task.await {
            tracing::error!(error = %e, "idle reaper terminated abnormally");
        }

        drop(dispatcher);
        drain.join().await;

        let report = reaper.flush_all().await;
        tracing::info!(
            flushed = report.flushed,
            failed = report.failed,
            "session runtime stopped"
        );
    }
}
