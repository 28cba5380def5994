//! Denormalized records written to durable storage.

use chrono::{DateTime, Utc};
use mir_core::{ChatLogId, SessionId};
use serde::{Deserialize, Serialize};

/// The durable part of a session: everything a restart needs to resume it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Running summary of all compacted history.
    pub summary: String,
    /// Cumulative prompt tokens.
    pub total_input_tokens: u64,
    /// Cumulative completion tokens.
    pub total_output_tokens: u64,
}

/// A user profile upsert.
///
/// Written after every turn with the session's current totals and summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    /// External user identifier.
    pub external_id: SessionId,
    /// Display name, when the transport knows it.
    pub name: Option<String>,
    /// First time the user was seen. Storage keeps the original on conflict.
    pub created_at: DateTime<Utc>,
    /// Most recent activity.
    pub last_seen_at: DateTime<Utc>,
    /// Cumulative prompt tokens.
    pub total_input_tokens: u64,
    /// Cumulative completion tokens.
    pub total_output_tokens: u64,
    /// Running summary.
    pub summary: String,
}

impl UserRecord {
    /// Builds an upsert for a session's current state, seen now.
    #[must_use]
    pub fn from_snapshot(external_id: SessionId, snapshot: SessionSnapshot) -> Self {
        let now = Utc::now();
        Self {
            external_id,
            name: None,
            created_at: now,
            last_seen_at: now,
            total_input_tokens: snapshot.total_input_tokens,
            total_output_tokens: snapshot.total_output_tokens,
            summary: snapshot.summary,
        }
    }

    /// Returns the durable session part of this record.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            summary: self.summary.clone(),
            total_input_tokens: self.total_input_tokens,
            total_output_tokens: self.total_output_tokens,
        }
    }
}

/// One exchanged turn, appended to the audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatLogRecord {
    /// Entry ID; appends are idempotent on it.
    pub id: ChatLogId,
    /// External user identifier.
    pub user_id: SessionId,
    /// What the user sent.
    pub user_text: String,
    /// What the assistant replied.
    pub assistant_text: String,
    /// When the turn was recorded.
    pub timestamp: DateTime<Utc>,
    /// Prompt tokens for this turn.
    pub input_tokens: u64,
    /// Completion tokens for this turn.
    pub output_tokens: u64,
    /// Names of tools the agent used while answering.
    pub used_tools: Vec<String>,
}

impl ChatLogRecord {
    /// Creates a chat-log entry timestamped now.
    #[must_use]
    pub fn new(
        user_id: SessionId,
        user_text: impl Into<String>,
        assistant_text: impl Into<String>,
    ) -> Self {
        Self {
            id: ChatLogId::new(),
            user_id,
            user_text: user_text.into(),
            assistant_text: assistant_text.into(),
            timestamp: Utc::now(),
            input_tokens: 0,
            output_tokens: 0,
            used_tools: Vec::new(),
        }
    }

    /// Sets the per-turn token counts.
    #[must_use]
    pub fn with_tokens(mut self, input_tokens: u64, output_tokens: u64) -> Self {
        self.input_tokens = input_tokens;
        self.output_tokens = output_tokens;
        self
    }

    /// Sets the tools used during the turn.
    #[must_use]
    pub fn with_tools(mut self, used_tools: Vec<String>) -> Self {
        self.used_tools = used_tools;
        self
    }
}
