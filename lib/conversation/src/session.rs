//! Conversation session state.
//!
//! A session holds one user's live history, the running summary of
//! everything compacted away, and cumulative token counters. Sessions are
//! owned by the [`SessionStore`](crate::store::SessionStore); callers only
//! ever see a [`SessionView`].

use crate::error::SessionError;
use crate::message::{Message, MessageRole};
use chrono::{DateTime, Utc};
use mir_core::{MessageId, SessionId};
use mir_persistence::SessionSnapshot;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Source of session incarnations, unique within the process.
static NEXT_INCARNATION: AtomicU64 = AtomicU64::new(0);

/// Initial state for a new session, usually restored from storage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSeed {
    /// Summary carried over from an earlier session.
    pub summary: String,
    /// Prompt tokens already spent.
    pub total_input_tokens: u64,
    /// Completion tokens already spent.
    pub total_output_tokens: u64,
}

impl From<SessionSnapshot> for SessionSeed {
    fn from(snapshot: SessionSnapshot) -> Self {
        Self {
            summary: snapshot.summary,
            total_input_tokens: snapshot.total_input_tokens,
            total_output_tokens: snapshot.total_output_tokens,
        }
    }
}

/// Cumulative token counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenTotals {
    /// Prompt tokens.
    pub input: u64,
    /// Completion tokens.
    pub output: u64,
}

/// Identifies the history a snapshot was taken from.
///
/// `incarnation` tells apart sessions that reused an id after eviction,
/// `generation` changes with every history replacement, and `len` is how
/// many messages the snapshot covered. Anything past `len` in the same
/// incarnation and generation was appended later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryMark {
    pub(crate) incarnation: u64,
    pub(crate) generation: u64,
    pub(crate) len: usize,
}

impl HistoryMark {
    /// Number of messages covered by the snapshot.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the snapshot covered no messages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// A consistent copy of the rollup inputs.
#[derive(Debug, Clone)]
pub struct HistorySnapshot {
    /// Where the snapshot was taken.
    pub mark: HistoryMark,
    /// Summary at snapshot time.
    pub summary: String,
    /// History at snapshot time.
    pub messages: Vec<Message>,
}

/// Read-only copy of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionView {
    /// Session key.
    pub id: SessionId,
    /// Running summary, empty until the first rollup.
    pub summary: String,
    /// History since the last rollup, oldest first.
    pub history: Vec<Message>,
    /// Cumulative token counters.
    pub totals: TokenTotals,
    /// When the session was created in this process.
    pub created_at: DateTime<Utc>,
    /// Last append.
    pub last_active_at: DateTime<Utc>,
}

/// A live conversation session.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    history: Vec<Message>,
    summary: String,
    totals: TokenTotals,
    created_at: DateTime<Utc>,
    last_active_at: DateTime<Utc>,
    incarnation: u64,
    generation: u64,
    rollup_in_flight: bool,
    evicted: bool,
}

impl Session {
    /// Creates a session from a seed.
    #[must_use]
    pub fn new(id: SessionId, seed: SessionSeed) -> Self {
        let now = Utc::now();
        Self {
            id,
            history: Vec::new(),
            summary: seed.summary,
            totals: TokenTotals {
                input: seed.total_input_tokens,
                output: seed.total_output_tokens,
            },
            created_at: now,
            last_active_at: now,
            incarnation: NEXT_INCARNATION.fetch_add(1, Ordering::Relaxed),
            generation: 0,
            rollup_in_flight: false,
            evicted: false,
        }
    }

    /// Session key.
    #[must_use]
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// History since the last rollup.
    #[must_use]
    pub fn history(&self) -> &[Message] {
        &self.history
    }

    /// Running summary.
    #[must_use]
    pub fn summary(&self) -> &str {
        &self.summary
    }

    /// Cumulative token counters.
    #[must_use]
    pub fn totals(&self) -> TokenTotals {
        self.totals
    }

    /// Last append.
    #[must_use]
    pub fn last_active_at(&self) -> DateTime<Utc> {
        self.last_active_at
    }

    /// Total characters across the history.
    #[must_use]
    pub fn history_chars(&self) -> usize {
        self.history.iter().map(Message::char_count).sum()
    }

    /// Returns true while a rollup holds a snapshot of this session.
    #[must_use]
    pub fn rollup_in_flight(&self) -> bool {
        self.rollup_in_flight
    }

    /// Appends a message and marks the session active.
    pub fn append(&mut self, role: MessageRole, content: impl Into<String>) -> MessageId {
        let message = Message::new(role, content);
        let id = message.id;
        self.last_active_at = message.timestamp;
        self.history.push(message);
        id
    }

    /// Adds to the token counters. Counters saturate instead of wrapping.
    pub fn add_tokens(&mut self, input: u64, output: u64) -> TokenTotals {
        self.totals.input = self.totals.input.saturating_add(input);
        self.totals.output = self.totals.output.saturating_add(output);
        self.totals
    }

    /// Marks the current history for a later [`replace_history`](Self::replace_history).
    #[must_use]
    pub fn mark(&self) -> HistoryMark {
        HistoryMark {
            incarnation: self.incarnation,
            generation: self.generation,
            len: self.history.len(),
        }
    }

    /// Replaces the history covered by `base` and installs a new summary.
    ///
    /// Messages appended after `base` was taken are kept, after
    /// `new_history`. Returns how many such messages were carried over.
    ///
    /// # Errors
    ///
    /// Returns `StaleSnapshot` if the history was replaced since `base`, or
    /// `base` was taken from an earlier session under the same id.
    pub fn replace_history(
        &mut self,
        base: HistoryMark,
        new_history: Vec<Message>,
        new_summary: String,
    ) -> Result<usize, SessionError> {
        if base.incarnation != self.incarnation
            || base.generation != self.generation
            || base.len > self.history.len()
        {
            return Err(SessionError::StaleSnapshot {
                id: self.id.clone(),
            });
        }

        let late = self.history.split_off(base.len);
        let carried = late.len();
        self.history = new_history;
        self.history.extend(late);
        self.summary = new_summary;
        self.generation += 1;
        Ok(carried)
    }

    /// Takes a rollup snapshot, or `None` if a rollup is already running.
    pub(crate) fn begin_rollup(&mut self) -> Option<HistorySnapshot> {
        if self.rollup_in_flight {
            return None;
        }
        self.rollup_in_flight = true;
        Some(HistorySnapshot {
            mark: self.mark(),
            summary: self.summary.clone(),
            messages: self.history.clone(),
        })
    }

    /// Clears the in-flight flag set by a rollup of this incarnation.
    pub(crate) fn end_rollup(&mut self, incarnation: u64) {
        if incarnation == self.incarnation {
            self.rollup_in_flight = false;
        }
    }

    pub(crate) fn is_evicted(&self) -> bool {
        self.evicted
    }

    pub(crate) fn evict(&mut self) {
        self.evicted = true;
    }

    /// The durable part of the session.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            summary: self.summary.clone(),
            total_input_tokens: self.totals.input,
            total_output_tokens: self.totals.output,
        }
    }

    /// A read-only copy.
    #[must_use]
    pub fn view(&self) -> SessionView {
        SessionView {
            id: self.id.clone(),
            summary: self.summary.clone(),
            history: self.history.clone(),
            totals: self.totals,
            created_at: self.created_at,
            last_active_at: self.last_active_at,
        }
    }
}
