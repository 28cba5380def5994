//! Durable-storage collaborator.
//!
//! The session core never talks to a database directly. It depends on
//! [`SessionStorage`], implemented by the Postgres adapter in the server and
//! by [`InMemorySessionStorage`] for tests and local runs.

use crate::error::StorageError;
use crate::record::{ChatLogRecord, SessionSnapshot, UserRecord};
use async_trait::async_trait;
use chrono::Utc;
use mir_core::{ChatLogId, Result, SessionId};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// The storage operations the core issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageOp {
    /// Restore a session at creation.
    LoadSnapshot,
    /// Write-behind user upsert.
    UpsertUser,
    /// Write-behind chat-log append.
    AppendChatLog,
    /// Final flush of an idle or shutting-down session.
    SaveSummary,
}

impl StorageOp {
    /// Returns the operation name used in logs and errors.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::LoadSnapshot => "load_session_snapshot",
            Self::UpsertUser => "upsert_user",
            Self::AppendChatLog => "append_chat_log",
            Self::SaveSummary => "save_session_summary",
        }
    }
}

impl fmt::Display for StorageOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trait for durable session storage.
///
/// All writes must be idempotent: the dispatcher retries failed attempts,
/// so the same record may arrive more than once.
#[async_trait]
pub trait SessionStorage: Send + Sync {
    /// Loads the persisted summary and totals for a user, if any.
    async fn load_session_snapshot(
        &self,
        id: &SessionId,
    ) -> Result<Option<SessionSnapshot>, StorageError>;

    /// Inserts or updates a user profile.
    async fn upsert_user(&self, record: &UserRecord) -> Result<(), StorageError>;

    /// Appends a chat-log entry.
    async fn append_chat_log(&self, record: &ChatLogRecord) -> Result<(), StorageError>;

    /// Persists a session's summary and totals.
    async fn save_session_summary(
        &self,
        id: &SessionId,
        snapshot: &SessionSnapshot,
    ) -> Result<(), StorageError>;
}

#[derive(Default)]
struct MemoryState {
    users: HashMap<SessionId, UserRecord>,
    chat_log: Vec<ChatLogRecord>,
    chat_log_ids: HashSet<ChatLogId>,
    calls: HashMap<StorageOp, u32>,
    pending_failures: HashMap<StorageOp, u32>,
}

/// In-memory storage.
///
/// Used by tests and by local runs without a database. Failures and latency
/// can be injected per operation to exercise retry and drop paths.
#[derive(Default)]
pub struct InMemorySessionStorage {
    state: Mutex<MemoryState>,
    latency: Mutex<HashMap<StorageOp, Duration>>,
}

impl InMemorySessionStorage {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` calls of `op` fail with `StorageError::Unavailable`.
    pub fn fail_next(&self, op: StorageOp, count: u32) {
        self.lock_state().pending_failures.insert(op, count);
    }

    /// Delays every call of `op` by `delay` before it takes effect.
    pub fn set_latency(&self, op: StorageOp, delay: Duration) {
        self.latency
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(op, delay);
    }

    /// Seeds a user as if persisted by an earlier process.
    pub fn seed_user(&self, record: UserRecord) {
        self.lock_state()
            .users
            .insert(record.external_id.clone(), record);
    }

    /// Returns the stored user record.
    #[must_use]
    pub fn user(&self, id: &SessionId) -> Option<UserRecord> {
        self.lock_state().users.get(id).cloned()
    }

    /// Returns all chat-log entries in append order.
    #[must_use]
    pub fn chat_log(&self) -> Vec<ChatLogRecord> {
        self.lock_state().chat_log.clone()
    }

    /// Returns how many times `op` was called, including failed calls.
    #[must_use]
    pub fn calls(&self, op: StorageOp) -> u32 {
        self.lock_state().calls.get(&op).copied().unwrap_or(0)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn enter(&self, op: StorageOp) -> Result<(), StorageError> {
        let delay = self
            .latency
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&op)
            .copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock_state();
        *state.calls.entry(op).or_insert(0) += 1;
        if let Some(remaining) = state.pending_failures.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(StorageError::Unavailable {
                    reason: format!("injected {op} failure"),
                }
                .into());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SessionStorage for InMemorySessionStorage {
    async fn load_session_snapshot(
        &self,
        id: &SessionId,
    ) -> Result<Option<SessionSnapshot>, StorageError> {
        self.enter(StorageOp::LoadSnapshot).await?;
        Ok(self.lock_state().users.get(id).map(UserRecord::snapshot))
    }

    async fn upsert_user(&self, record: &UserRecord) -> Result<(), StorageError> {
        self.enter(StorageOp::UpsertUser).await?;
        let mut state = self.lock_state();
        let mut stored = record.clone();
        if let Some(existing) = state.users.get(&record.external_id) {
            stored.created_at = existing.created_at;
            if stored.name.is_none() {
                stored.name = existing.name.clone();
            }
        }
        state.users.insert(record.external_id.clone(), stored);
        Ok(())
    }

    async fn append_chat_log(&self, record: &ChatLogRecord) -> Result<(), StorageError> {
        self.enter(StorageOp::AppendChatLog).await?;
        let mut state = self.lock_state();
        if state.chat_log_ids.insert(record.id) {
            state.chat_log.push(record.clone());
        }
        Ok(())
    }

    async fn save_session_summary(
        &self,
        id: &SessionId,
        snapshot: &SessionSnapshot,
    ) -> Result<(), StorageError> {
        self.enter(StorageOp::SaveSummary).await?;
        let mut state = self.lock_state();
        match state.users.get_mut(id) {
            Some(user) => {
                user.summary = snapshot.summary.clone();
                user.total_input_tokens = snapshot.total_input_tokens;
                user.total_output_tokens = snapshot.total_output_tokens;
                user.last_seen_at = Utc::now();
            }
            None => {
                state.users.insert(
                    id.clone(),
                    UserRecord::from_snapshot(id.clone(), snapshot.clone()),
                );
            }
        }
        Ok(())
    }
}
