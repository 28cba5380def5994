//! Idle session reaper.
//!
//! Sessions that have been quiet for longer than the idle timeout are
//! flushed to durable storage and then evicted from the live store. A
//! session is only evicted after its flush succeeded, and only if nothing
//! touched it while the flush was running. A failed flush keeps the session
//! for the next sweep.

use crate::error::ReaperError;
use chrono::{DateTime, TimeDelta, Utc};
use mir_conversation::{IdleSession, SessionStore};
use mir_core::{Result, SessionId};
use mir_persistence::{RetryPolicy, SessionSnapshot, SessionStorage, StorageOp};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;

/// Reaper configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaperConfig {
    /// Inactivity after which a session is reaped. `None` keeps sessions
    /// for the lifetime of the process.
    pub idle_timeout: Option<Duration>,
    /// Time between sweeps.
    pub sweep_interval: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Some(Duration::from_secs(30 * 60)),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl ReaperConfig {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the sweep interval is zero.
    pub fn validate(&self) -> std::result::Result<(), ReaperError> {
        if self.sweep_interval.is_zero() {
            return Err(ReaperError::InvalidConfig {
                reason: "sweep_interval must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

/// What a sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Sessions whose summary was written.
    pub flushed: usize,
    /// Sessions evicted from the live store.
    pub removed: usize,
    /// Sessions whose flush failed; they stay live.
    pub failed: usize,
    /// Sessions kept because they were active again or rolling up.
    pub touched: usize,
}

impl SweepReport {
    /// Returns true if the sweep found nothing to do.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

enum Retirement {
    Removed,
    Touched { flushed: bool },
    FlushFailed,
    Gone,
}

/// Flushes and evicts idle sessions.
#[derive(Clone)]
pub struct IdleReaper {
    store: Arc<SessionStore>,
    storage: Arc<dyn SessionStorage>,
    retry: RetryPolicy,
    config: ReaperConfig,
}

impl IdleReaper {
    /// Creates a reaper.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the configuration is unusable.
    pub fn new(
        store: Arc<SessionStore>,
        storage: Arc<dyn SessionStorage>,
        retry: RetryPolicy,
        config: ReaperConfig,
    ) -> Result<Self, ReaperError> {
        config.validate()?;
        Ok(Self {
            store,
            storage,
            retry,
            config,
        })
    }

    /// The configuration in use.
    #[must_use]
    pub fn config(&self) -> ReaperConfig {
        self.config
    }

    /// Flushes and evicts every session idle as of `now`.
    ///
    /// Each session is retired on its own task, so a slow flush holds up
    /// neither the other sessions nor request traffic.
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let Some(timeout) = self.config.idle_timeout else {
            return SweepReport::default();
        };
        let Some(cutoff) = TimeDelta::from_std(timeout)
            .ok()
            .and_then(|timeout| now.checked_sub_signed(timeout))
        else {
            return SweepReport::default();
        };

        let mut tasks = JoinSet::new();
        for idle in self.store.idle_since(cutoff) {
            let reaper = self.clone();
            tasks.spawn(async move { reaper.retire(idle).await });
        }

        let mut report = SweepReport::default();
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(Retirement::Removed) => {
                    report.flushed += 1;
                    report.removed += 1;
                }
                Ok(Retirement::Touched { flushed }) => {
                    report.flushed += usize::from(flushed);
                    report.touched += 1;
                }
                Ok(Retirement::FlushFailed) => report.failed += 1,
                Ok(Retirement::Gone) => {}
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(error = %e, "reaper task terminated abnormally");
                }
            }
        }
        report
    }

    /// Persists every live session without evicting any.
    ///
    /// Run at shutdown, after request traffic has stopped.
    pub async fn flush_all(&self) -> SweepReport {
        let mut tasks = JoinSet::new();
        for id in self.store.ids() {
            let Ok((snapshot, _)) = self.store.flush_view(&id) else {
                continue;
            };
            let reaper = self.clone();
            tasks.spawn(async move { reaper.flush(&id, &snapshot).await });
        }

        let mut report = SweepReport::default();
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(true) => report.flushed += 1,
                Ok(false) => report.failed += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(error = %e, "flush task terminated abnormally");
                }
            }
        }
        tracing::info!(
            flushed = report.flushed,
            failed = report.failed,
            "flushed live sessions"
        );
        report
    }

    /// Runs a sweep every `sweep_interval` until `shutdown` turns true or
    /// its sender is dropped.
    #[must_use]
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let Some(timeout) = self.config.idle_timeout else {
                tracing::info!("idle session reaping disabled");
                return;
            };
            tracing::info!(
                idle_timeout_secs = timeout.as_secs(),
                sweep_interval_secs = self.config.sweep_interval.as_secs(),
                "idle session reaper started"
            );

            let mut interval = tokio::time::interval(self.config.sweep_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let report = self.sweep(Utc::now()).await;
                        if !report.is_empty() {
                            tracing::info!(
                                flushed = report.flushed,
                                removed = report.removed,
                                failed = report.failed,
                                touched = report.touched,
                                "idle session sweep"
                            );
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("idle session reaper stopped");
        })
    }

    async fn retire(&self, idle: IdleSession) -> Retirement {
        let Ok((snapshot, seen_at, rolling_up)) = self.store.inspect(&idle.id, |session| {
            (
                session.snapshot(),
                session.last_active_at(),
                session.rollup_in_flight(),
            )
        }) else {
            return Retirement::Gone;
        };
        if seen_at != idle.last_active_at || rolling_up {
            return Retirement::Touched { flushed: false };
        }

        if !self.flush(&idle.id, &snapshot).await {
            return Retirement::FlushFailed;
        }

        if self.store.remove_if_inactive_since(&idle.id, seen_at) {
            tracing::info!(session_id = %idle.id, "reaped idle session");
            Retirement::Removed
        } else {
            tracing::debug!(session_id = %idle.id, "session active during flush, keeping it");
            Retirement::Touched { flushed: true }
        }
    }

    async fn flush(&self, id: &SessionId, snapshot: &SessionSnapshot) -> bool {
        let storage = self.storage.as_ref();
        let result = self
            .retry
            .run(StorageOp::SaveSummary.as_str(), id.as_str(), move || {
                storage.save_session_summary(id, snapshot)
            })
            .await;

        match result {
            Ok(()) => true,
            Err(e) => {
                let report = e.context(ReaperError::FlushFailed {
                    session_id: id.clone(),
                });
                tracing::error!(
                    session_id = %id,
                    operation = StorageOp::SaveSummary.as_str(),
                    error = %report,
                    "session flush failed"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mir_conversation::{
        Message, MessageRole, RollupController, RollupOutcome, RollupPolicy, SessionSeed,
        SummarizeError, Summarizer,
    };
    use mir_persistence::InMemorySessionStorage;
    use tokio::sync::Notify;

    /// Holds every summarize call until released.
    #[derive(Default)]
    struct GatedSummarizer {
        release: Notify,
    }

    #[async_trait]
    impl Summarizer for GatedSummarizer {
        async fn summarize(
            &self,
            _previous_summary: &str,
            _messages: &[Message],
        ) -> mir_core::Result<String, SummarizeError> {
            self.release.notified().await;
            Ok("said hi".to_string())
        }
    }

    fn start_rollup(
        store: &Arc<SessionStore>,
        summarizer: &Arc<GatedSummarizer>,
        id: &SessionId,
    ) -> JoinHandle<mir_core::Result<RollupOutcome, mir_conversation::RollupError>> {
        let controller = RollupController::new(
            Arc::clone(store),
            Arc::clone(summarizer) as Arc<dyn Summarizer>,
            RollupPolicy::messages(1),
        );
        let id = id.clone();
        tokio::spawn(async move { controller.rollup(&id).await })
    }

    async fn until_rolling_up(store: &SessionStore, id: &SessionId) {
        while !store.inspect(id, |session| session.rollup_in_flight()).unwrap() {
            tokio::task::yield_now().await;
        }
    }

    struct Fixture {
        store: Arc<SessionStore>,
        storage: Arc<InMemorySessionStorage>,
        reaper: IdleReaper,
    }

    fn fixture(config: ReaperConfig) -> Fixture {
        let store = Arc::new(SessionStore::new());
        let storage = Arc::new(InMemorySessionStorage::new());
        let reaper = IdleReaper::new(
            Arc::clone(&store),
            storage.clone(),
            RetryPolicy::no_retry(),
            config,
        )
        .unwrap();
        Fixture {
            store,
            storage,
            reaper,
        }
    }

    fn talk(store: &SessionStore, id: &SessionId) {
        store.create(id.clone(), SessionSeed::default()).unwrap();
        store.append_message(id, MessageRole::User, "hi").unwrap();
        store.add_tokens(id, 7, 3).unwrap();
    }

    fn later() -> DateTime<Utc> {
        Utc::now() + TimeDelta::hours(1)
    }

    #[tokio::test]
    async fn session_rolling_up_is_not_reaped() {
        let f = fixture(ReaperConfig::default());
        let id = SessionId::new("u1");
        talk(&f.store, &id);
        let summarizer = Arc::new(GatedSummarizer::default());
        let rollup = start_rollup(&f.store, &summarizer, &id);
        until_rolling_up(&f.store, &id).await;

        let report = f.reaper.sweep(later()).await;

        assert_eq!(report.touched, 1);
        assert_eq!(report.removed, 0);
        assert!(f.store.exists(&id));
        assert_eq!(f.storage.calls(StorageOp::SaveSummary), 0);

        summarizer.release.notify_one();
        assert!(matches!(
            rollup.await.unwrap().unwrap(),
            RollupOutcome::Completed { .. }
        ));
        assert_eq!(f.store.get(&id).unwrap().summary, "said hi");
    }

    #[tokio::test]
    async fn rollup_started_during_flush_keeps_session() {
        let f = fixture(ReaperConfig::default());
        let id = SessionId::new("u1");
        talk(&f.store, &id);
        f.storage
            .set_latency(StorageOp::SaveSummary, Duration::from_millis(100));

        let sweep = tokio::spawn({
            let reaper = f.reaper.clone();
            async move { reaper.sweep(later()).await }
        });
        // The reaper has read the session and is inside the flush.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let summarizer = Arc::new(GatedSummarizer::default());
        let rollup = start_rollup(&f.store, &summarizer, &id);
        until_rolling_up(&f.store, &id).await;

        let report = sweep.await.unwrap();
        assert_eq!(report.flushed, 1);
        assert_eq!(report.touched, 1);
        assert_eq!(report.removed, 0);
        assert!(f.store.exists(&id));

        summarizer.release.notify_one();
        rollup.await.unwrap().unwrap();
        let view = f.store.get(&id).unwrap();
        assert_eq!(view.summary, "said hi");
        assert!(view.history.is_empty());
    }

    #[test]
    fn zero_interval_is_rejected() {
        let config = ReaperConfig {
            sweep_interval: Duration::ZERO,
            ..ReaperConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ReaperError::InvalidConfig { .. })
        ));
    }

    #[tokio::test]
    async fn idle_session_is_flushed_then_removed() {
        let f = fixture(ReaperConfig::default());
        let id = SessionId::new("u1");
        talk(&f.store, &id);

        let report = f.reaper.sweep(later()).await;

        assert_eq!(
            report,
            SweepReport {
                flushed: 1,
                removed: 1,
                failed: 0,
                touched: 0,
            }
        );
        assert!(!f.store.exists(&id));
        let user = f.storage.user(&id).unwrap();
        assert_eq!(user.total_input_tokens, 7);
        assert_eq!(f.storage.calls(StorageOp::SaveSummary), 1);
    }

    #[tokio::test]
    async fn active_session_is_left_alone() {
        let f = fixture(ReaperConfig::default());
        let id = SessionId::new("u1");
        talk(&f.store, &id);

        let report = f.reaper.sweep(Utc::now()).await;

        assert!(report.is_empty());
        assert!(f.store.exists(&id));
        assert_eq!(f.storage.calls(StorageOp::SaveSummary), 0);
    }

    #[tokio::test]
    async fn failed_flush_keeps_session_for_next_sweep() {
        let f = fixture(ReaperConfig::default());
        let id = SessionId::new("u1");
        talk(&f.store, &id);
        f.storage.fail_next(StorageOp::SaveSummary, 1);

        let first = f.reaper.sweep(later()).await;
        assert_eq!(first.failed, 1);
        assert!(f.store.exists(&id));

        let second = f.reaper.sweep(later()).await;
        assert_eq!(second.removed, 1);
        assert!(!f.store.exists(&id));
    }

    #[tokio::test]
    async fn session_touched_during_flush_is_kept() {
        let f = fixture(ReaperConfig::default());
        let id = SessionId::new("u1");
        talk(&f.store, &id);
        f.storage
            .set_latency(StorageOp::SaveSummary, Duration::from_millis(100));

        let sweep = tokio::spawn({
            let reaper = f.reaper.clone();
            async move { reaper.sweep(later()).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        f.store
            .append_message(&id, MessageRole::User, "still here")
            .unwrap();

        let report = sweep.await.unwrap();
        assert_eq!(report.flushed, 1);
        assert_eq!(report.touched, 1);
        assert_eq!(report.removed, 0);
        assert_eq!(f.store.get(&id).unwrap().history.len(), 2);
    }

    #[tokio::test]
    async fn disabled_timeout_never_reaps() {
        let f = fixture(ReaperConfig {
            idle_timeout: None,
            ..ReaperConfig::default()
        });
        let id = SessionId::new("u1");
        talk(&f.store, &id);

        let report = f.reaper.sweep(later() + TimeDelta::days(365)).await;

        assert!(report.is_empty());
        assert!(f.store.exists(&id));
    }

    #[tokio::test]
    async fn each_idle_session_is_flushed_once() {
        let f = fixture(ReaperConfig::default());
        let ids: Vec<_> = (0..5).map(|i| SessionId::new(format!("u{i}"))).collect();
        for id in &ids {
            talk(&f.store, id);
        }

        let report = f.reaper.sweep(later()).await;
        let again = f.reaper.sweep(later()).await;

        assert_eq!(report.removed, 5);
        assert!(again.is_empty());
        assert!(f.store.is_empty());
        assert_eq!(f.storage.calls(StorageOp::SaveSummary), 5);
    }

    #[tokio::test]
    async fn flush_all_persists_without_evicting() {
        let f = fixture(ReaperConfig::default());
        let a = SessionId::new("a");
        let b = SessionId::new("b");
        talk(&f.store, &a);
        talk(&f.store, &b);

        let report = f.reaper.flush_all().await;

        assert_eq!(report.flushed, 2);
        assert_eq!(f.store.len(), 2);
        assert!(f.storage.user(&a).is_some());
        assert!(f.storage.user(&b).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_reaper_sweeps_until_shutdown() {
        let f = fixture(ReaperConfig {
            idle_timeout: Some(Duration::ZERO),
            sweep_interval: Duration::from_secs(1),
        });
        let id = SessionId::new("u1");
        talk(&f.store, &id);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = f.reaper.clone().spawn(shutdown_rx);

        for _ in 0..10 {
            if !f.store.exists(&id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        assert!(!f.store.exists(&id));

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
