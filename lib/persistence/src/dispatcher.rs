//! Write-behind dispatcher.
//!
//! The reply path hands user upserts and chat-log entries to two bounded
//! queues and returns immediately. Drain workers persist them through
//! [`SessionStorage`] with item-level retry. A full queue drops the item
//! with a warning instead of blocking the producer: the live reply matters
//! more than the completeness of the audit log.
//!
//! Shutdown is by ownership: once every [`WriteBehindDispatcher`] clone is
//! dropped, the workers drain what is already queued and exit, and
//! [`DrainWorkers::join`] returns.

use crate::error::{DispatchError, QueueKind, StorageError};
use crate::record::{ChatLogRecord, UserRecord};
use crate::retry::RetryPolicy;
use crate::storage::{SessionStorage, StorageOp};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;

/// Dispatcher configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Capacity of the user upsert queue.
    pub user_queue_capacity: usize,
    /// Capacity of the chat-log queue.
    pub chat_log_queue_capacity: usize,
    /// Drain workers per queue. With one worker items are persisted in arrival order.
    pub workers_per_queue: usize,
    /// Retry policy applied to each item.
    pub retry: RetryPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            user_queue_capacity: 1024,
            chat_log_queue_capacity: 1024,
            workers_per_queue: 1,
            retry: RetryPolicy::default(),
        }
    }
}

/// Counters for one queue.
#[derive(Debug, Default)]
pub struct QueueStats {
    enqueued: AtomicU64,
    dropped: AtomicU64,
    persisted: AtomicU64,
    failed: AtomicU64,
}

impl QueueStats {
    /// Items accepted by the queue.
    #[must_use]
    pub fn enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    /// Items dropped because the queue was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Items written to storage.
    #[must_use]
    pub fn persisted(&self) -> u64 {
        self.persisted.load(Ordering::Relaxed)
    }

    /// Items discarded after exhausting their retries.
    #[must_use]
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Counters for both queues.
#[derive(Debug, Default)]
pub struct DispatcherStats {
    /// User upsert queue.
    pub user_upserts: QueueStats,
    /// Chat-log queue.
    pub chat_log: QueueStats,
}

impl DispatcherStats {
    fn queue(&self, kind: QueueKind) -> &QueueStats {
        match kind {
            QueueKind::UserUpsert => &self.user_upserts,
            QueueKind::ChatLog => &self.chat_log,
        }
    }
}

/// An item that can travel through a write-behind queue.
#[async_trait]
trait WriteBehindItem: Send + Sync + 'static {
    const QUEUE: QueueKind;
    const OP: StorageOp;

    fn key(&self) -> String;

    async fn persist(&self, storage: &dyn SessionStorage) -> mir_core::Result<(), StorageError>;
}

#[async_trait]
impl WriteBehindItem for UserRecord {
    const QUEUE: QueueKind = QueueKind::UserUpsert;
    const OP: StorageOp = StorageOp::UpsertUser;

    fn key(&self) -> String {
        self.external_id.to_string()
    }

    async fn persist(&self, storage: &dyn SessionStorage) -> mir_core::Result<(), StorageError> {
        storage.upsert_user(self).await
    }
}

#[async_trait]
impl WriteBehindItem for ChatLogRecord {
    const QUEUE: QueueKind = QueueKind::ChatLog;
    const OP: StorageOp = StorageOp::AppendChatLog;

    fn key(&self) -> String {
        self.user_id.to_string()
    }

    async fn persist(&self, storage: &dyn SessionStorage) -> mir_core::Result<(), StorageError> {
        storage.append_chat_log(self).await
    }
}

/// Producer side of the write-behind queues. Cheap to clone.
#[derive(Clone)]
pub struct WriteBehindDispatcher {
    users: mpsc::Sender<UserRecord>,
    chat_log: mpsc::Sender<ChatLogRecord>,
    stats: Arc<DispatcherStats>,
}

/// The drain workers started with a dispatcher.
pub struct DrainWorkers {
    tasks: JoinSet<()>,
}

impl WriteBehindDispatcher {
    /// Creates the queues and spawns their drain workers on the current runtime.
    #[must_use]
    pub fn start(
        storage: Arc<dyn SessionStorage>,
        config: DispatcherConfig,
    ) -> (Self, DrainWorkers) {
        let (users_tx, users_rx) = mpsc::channel(config.user_queue_capacity.max(1));
        let (chat_tx, chat_rx) = mpsc::channel(config.chat_log_queue_capacity.max(1));
        let stats = Arc::new(DispatcherStats::default());

        let mut tasks = JoinSet::new();
        spawn_workers(
            &mut tasks,
            users_rx,
            &storage,
            &stats,
            &config,
        );
        spawn_workers(
            &mut tasks,
            chat_rx,
            &storage,
            &stats,
            &config,
        );

        (
            Self {
                users: users_tx,
                chat_log: chat_tx,
                stats,
            },
            DrainWorkers { tasks },
        )
    }

    /// Queues a user upsert without waiting.
    ///
    /// # Errors
    ///
    /// Returns `QueueFull` when the item was dropped, `Closed` after shutdown.
    pub fn enqueue_user_upsert(&self, record: UserRecord) -> Result<(), DispatchError> {
        self.enqueue(&self.users, record)
    }

    /// Queues a chat-log entry without waiting.
    ///
    /// # Errors
    ///
    /// Returns `QueueFull` when the item was dropped, `Closed` after shutdown.
    pub fn enqueue_chat_log(&self, record: ChatLogRecord) -> Result<(), DispatchError> {
        self.enqueue(&self.chat_log, record)
    }

    /// Returns the queue counters.
    #[must_use]
    pub fn stats(&self) -> &DispatcherStats {
        &self.stats
    }

    fn enqueue<T: WriteBehindItem>(
        &self,
        sender: &mpsc::Sender<T>,
        item: T,
    ) -> Result<(), DispatchError> {
        let stats = self.stats.queue(T::QUEUE);
        match sender.try_send(item) {
            Ok(()) => {
                stats.enqueued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(item)) => {
                stats.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    queue = %T::QUEUE,
                    session_id = %item.key(),
                    "write-behind queue full, dropping item"
                );
                Err(DispatchError::QueueFull { queue: T::QUEUE })
            }
            Err(mpsc::error::TrySendError::Closed(item)) => {
                tracing::warn!(
                    queue = %T::QUEUE,
                    session_id = %item.key(),
                    "write-behind queue closed, dropping item"
                );
                Err(DispatchError::Closed { queue: T::QUEUE })
            }
        }
    }
}

impl DrainWorkers {
    /// Waits for every worker to finish.
    ///
    /// Workers finish once all dispatcher clones are dropped and the queues
    /// are empty. A worker that panicked is logged, not propagated.
    pub async fn join(mut self) {
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "write-behind worker terminated abnormally");
            }
        }
    }
}

fn spawn_workers<T: WriteBehindItem>(
    tasks: &mut JoinSet<()>,
    receiver: mpsc::Receiver<T>,
    storage: &Arc<dyn SessionStorage>,
    stats: &Arc<DispatcherStats>,
    config: &DispatcherConfig,
) {
    let receiver = Arc::new(Mutex::new(receiver));
    for worker in 0..config.workers_per_queue.max(1) {
        tasks.spawn(drain(
            worker,
            Arc::clone(&receiver),
            Arc::clone(storage),
            Arc::clone(stats),
            config.retry,
        ));
    }
}

async fn drain<T: WriteBehindItem>(
    worker: usize,
    receiver: Arc<Mutex<mpsc::Receiver<T>>>,
    storage: Arc<dyn SessionStorage>,
    stats: Arc<DispatcherStats>,
    retry: RetryPolicy,
) {
    let queue_stats = stats.queue(T::QUEUE);
    tracing::debug!(queue = %T::QUEUE, worker, "write-behind worker started");

    loop {
        let next = receiver.lock().await.recv().await;
        let Some(item) = next else {
            break;
        };

        let key = item.key();
        let storage = storage.as_ref();
        let item = &item;
        match retry
            .run(T::OP.as_str(), &key, move || item.persist(storage))
            .await
        {
            Ok(()) => {
                queue_stats.persisted.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                queue_stats.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    queue = %T::QUEUE,
                    session_id = %key,
                    error = %e,
                    "discarding write-behind item"
                );
            }
        }
    }

    tracing::debug!(queue = %T::QUEUE, worker, "write-behind worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::SessionSnapshot;
    use crate::storage::InMemorySessionStorage;
    use mir_core::SessionId;
    use std::time::Duration;

    fn chat(text: &str) -> ChatLogRecord {
        ChatLogRecord::new(SessionId::new("u1"), text, "ok")
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[tokio::test]
    async fn persists_both_queues() {
        let storage = Arc::new(InMemorySessionStorage::new());
        let (dispatcher, workers) =
            WriteBehindDispatcher::start(storage.clone(), DispatcherConfig::default());

        let id = SessionId::new("u1");
        dispatcher
            .enqueue_user_upsert(UserRecord::from_snapshot(
                id.clone(),
                SessionSnapshot::default(),
            ))
            .unwrap();
        dispatcher.enqueue_chat_log(chat("hi")).unwrap();
        dispatcher.enqueue_chat_log(chat("again")).unwrap();

        let stats = Arc::clone(&dispatcher.stats);
        drop(dispatcher);
        workers.join().await;

        assert!(storage.user(&id).is_some());
        let texts: Vec<_> = storage
            .chat_log()
            .into_iter()
            .map(|r| r.user_text)
            .collect();
        assert_eq!(texts, vec!["hi".to_string(), "again".to_string()]);
        assert_eq!(stats.chat_log.persisted(), 2);
        assert_eq!(stats.user_upserts.persisted(), 1);
    }

    #[tokio::test]
    async fn full_queue_drops_and_reports() {
        let storage = Arc::new(InMemorySessionStorage::new());
        storage.set_latency(StorageOp::AppendChatLog, Duration::from_millis(50));
        let config = DispatcherConfig {
            chat_log_queue_capacity: 1,
            ..DispatcherConfig::default()
        };
        let (dispatcher, workers) = WriteBehindDispatcher::start(storage.clone(), config);

        // The worker cannot run before this task yields, so the first item
        // still occupies the only slot.
        assert!(dispatcher.enqueue_chat_log(chat("first")).is_ok());
        assert_eq!(
            dispatcher.enqueue_chat_log(chat("second")),
            Err(DispatchError::QueueFull {
                queue: QueueKind::ChatLog
            })
        );

        let stats = Arc::clone(&dispatcher.stats);
        drop(dispatcher);
        workers.join().await;

        let log = storage.chat_log();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].user_text, "first");
        assert_eq!(stats.chat_log.dropped(), 1);
        assert_eq!(stats.chat_log.enqueued(), 1);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let storage = Arc::new(InMemorySessionStorage::new());
        storage.fail_next(StorageOp::AppendChatLog, 2);
        let config = DispatcherConfig {
            retry: fast_retry(),
            ..DispatcherConfig::default()
        };
        let (dispatcher, workers) = WriteBehindDispatcher::start(storage.clone(), config);

        dispatcher.enqueue_chat_log(chat("hi")).unwrap();
        drop(dispatcher);
        workers.join().await;

        assert_eq!(storage.chat_log().len(), 1);
        assert_eq!(storage.calls(StorageOp::AppendChatLog), 3);
    }

    #[tokio::test]
    async fn exhausted_item_is_discarded_and_worker_continues() {
        let storage = Arc::new(InMemorySessionStorage::new());
        storage.fail_next(StorageOp::AppendChatLog, 3);
        let config = DispatcherConfig {
            retry: fast_retry(),
            ..DispatcherConfig::default()
        };
        let (dispatcher, workers) = WriteBehindDispatcher::start(storage.clone(), config);

        dispatcher.enqueue_chat_log(chat("lost")).unwrap();
        dispatcher.enqueue_chat_log(chat("kept")).unwrap();
        let stats = Arc::clone(&dispatcher.stats);
        drop(dispatcher);
        workers.join().await;

        let log = storage.chat_log();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].user_text, "kept");
        assert_eq!(stats.chat_log.failed(), 1);
        assert_eq!(stats.chat_log.persisted(), 1);
    }

    #[tokio::test]
    async fn multiple_workers_persist_everything() {
        let storage = Arc::new(InMemorySessionStorage::new());
        let config = DispatcherConfig {
            workers_per_queue: 4,
            ..DispatcherConfig::default()
        };
        let (dispatcher, workers) = WriteBehindDispatcher::start(storage.clone(), config);

        for i in 0..20 {
            dispatcher.enqueue_chat_log(chat(&format!("m{i}"))).unwrap();
        }
        drop(dispatcher);
        workers.join().await;

        assert_eq!(storage.chat_log().len(), 20);
    }
}
