//! The conversation service used by the reply path.
//!
//! A reply handler calls [`ConversationService::ensure_session`] when a
//! message arrives, reads [`ConversationService::context`] to build the
//! prompt, and hands the finished exchange to
//! [`ConversationService::record_turn`]. Everything durable happens in the
//! background afterwards.

use crate::error::SessionError;
use crate::message::MessageRole;
use crate::rollup::RollupController;
use crate::session::{SessionSeed, SessionView, TokenTotals};
use crate::store::SessionStore;
use crate::worker::RollupRequests;
use mir_core::SessionId;
use mir_persistence::{ChatLogRecord, SessionStorage, UserRecord, WriteBehindDispatcher};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// How [`ConversationService::ensure_session`] found the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOrigin {
    /// Created from a persisted snapshot.
    Restored,
    /// Created empty.
    Created,
    /// Already live.
    Existing,
}

/// One completed exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    /// Whose turn it was.
    pub session_id: SessionId,
    /// What the user sent.
    pub user_text: String,
    /// What the assistant replied.
    pub assistant_text: String,
    /// Prompt tokens spent on the reply.
    pub input_tokens: u64,
    /// Completion tokens spent on the reply.
    pub output_tokens: u64,
    /// Tools the agent used while answering.
    #[serde(default)]
    pub used_tools: Vec<String>,
}

/// What recording a turn did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnReceipt {
    /// Token counters after the turn.
    pub totals: TokenTotals,
    /// Whether a rollup was queued.
    pub rollup_requested: bool,
}

/// Session lifecycle for the reply path.
#[derive(Clone)]
pub struct ConversationService {
    store: Arc<SessionStore>,
    storage: Arc<dyn SessionStorage>,
    dispatcher: WriteBehindDispatcher,
    rollup: RollupController,
    rollup_requests: RollupRequests,
}

impl ConversationService {
    /// Creates a service.
    #[must_use]
    pub fn new(
        store: Arc<SessionStore>,
        storage: Arc<dyn SessionStorage>,
        dispatcher: WriteBehindDispatcher,
        rollup: RollupController,
        rollup_requests: RollupRequests,
    ) -> Self {
        Self {
            store,
            storage,
            dispatcher,
            rollup,
            rollup_requests,
        }
    }

    /// The live session store.
    #[must_use]
    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Makes sure a live session exists, restoring it from storage if possible.
    ///
    /// A storage failure is logged and the session starts fresh.
    #[tracing::instrument(skip_all, fields(session_id = %id))]
    pub async fn ensure_session(&self, id: &SessionId) -> SessionOrigin {
        if self.store.exists(id) {
            return SessionOrigin::Existing;
        }

        let (seed, origin) = match self.storage.load_session_snapshot(id).await {
            Ok(Some(snapshot)) => (SessionSeed::from(snapshot), SessionOrigin::Restored),
            Ok(None) => (SessionSeed::default(), SessionOrigin::Created),
            Err(e) => {
                tracing::warn!(
                    session_id = %id,
                    operation = "load_session_snapshot",
                    error = %e,
                    "could not restore session, starting fresh"
                );
                (SessionSeed::default(), SessionOrigin::Created)
            }
        };

        // Another message for the same user may have created it meanwhile.
        match self.store.create(id.clone(), seed) {
            Ok(()) => {
                tracing::debug!(session_id = %id, ?origin, "session started");
                origin
            }
            Err(_) => SessionOrigin::Existing,
        }
    }

    /// Summary and history for building a reply.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the session is absent.
    pub fn context(&self, id: &SessionId) -> Result<SessionView, SessionError> {
        self.store.get(id)
    }

    /// Records a finished exchange.
    ///
    /// Appends both messages and the token usage, queues the user upsert and
    /// the chat-log entry, and queues a rollup if the history is due. If the
    /// session was reaped since the reply started, it is restored first.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the session vanished again while being restored.
    pub async fn record_turn(&self, turn: Turn) -> Result<TurnReceipt, SessionError> {
        let id = &turn.session_id;
        let totals = match self.append_turn(&turn) {
            Err(SessionError::NotFound { .. }) => {
                tracing::debug!(session_id = %id, "session reaped mid-turn, restoring");
                self.ensure_session(id).await;
                self.append_turn(&turn)?
            }
            other => other?,
        };

        // Queue failures are logged by the dispatcher; the reply goes out regardless.
        let _ = self.dispatcher.enqueue_chat_log(
            ChatLogRecord::new(id.clone(), turn.user_text, turn.assistant_text)
                .with_tokens(turn.input_tokens, turn.output_tokens)
                .with_tools(turn.used_tools),
        );

        let rollup_requested =
            self.rollup.needs_rollup(id).unwrap_or(false) && self.rollup_requests.request(id);

        Ok(TurnReceipt {
            totals,
            rollup_requested,
        })
    }

    /// Appends the exchange and queues the user upsert under one session
    /// lock, so upserts reach the queue in the order their totals were taken.
    fn append_turn(&self, turn: &Turn) -> Result<TokenTotals, SessionError> {
        self.store.update(&turn.session_id, |session| {
            session.append(MessageRole::User, turn.user_text.as_str());
            session.append(MessageRole::Assistant, turn.assistant_text.as_str());
            let totals = session.add_tokens(turn.input_tokens, turn.output_tokens);
            let _ = self.dispatcher.enqueue_user_upsert(UserRecord::from_snapshot(
                turn.session_id.clone(),
                session.snapshot(),
            ));
            totals
        })
    }
}
