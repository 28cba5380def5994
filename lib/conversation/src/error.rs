//! Error types for the conversation crate.
//!
//! Errors are designed for layered context using rootcause:
//! - `SessionError`: Errors from session store operations
//! - `SummarizeError`: Errors from the external summarizer
//! - `RollupError`: High-level rollup outcome, wraps the above via context
//!
//! Only `SessionError::NotFound` is meant for the request layer. Rollup
//! errors are logged by the background worker and never reach a reply.

use mir_core::SessionId;
use std::fmt;

/// Errors from session store operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// No live session has this id.
    NotFound { id: SessionId },
    /// A session with this id already exists; creation never overwrites.
    AlreadyExists { id: SessionId },
    /// The history was replaced since the snapshot was taken.
    StaleSnapshot { id: SessionId },
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { id } => write!(f, "session not found: {id}"),
            Self::AlreadyExists { id } => write!(f, "session already exists: {id}"),
            Self::StaleSnapshot { id } => {
                write!(f, "history of session {id} changed since the snapshot")
            }
        }
    }
}

impl std::error::Error for SessionError {}

/// Errors from the external summarizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SummarizeError {
    /// The summarizer backend call failed.
    RequestFailed { reason: String },
    /// The summarizer answered with nothing usable.
    EmptyResponse,
    /// The summarizer is misconfigured.
    InvalidConfig { reason: String },
}

impl fmt::Display for SummarizeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RequestFailed { reason } => write!(f, "summarizer request failed: {reason}"),
            Self::EmptyResponse => write!(f, "summarizer returned an empty summary"),
            Self::InvalidConfig { reason } => {
                write!(f, "invalid summarizer configuration: {reason}")
            }
        }
    }
}

impl std::error::Error for SummarizeError {}

/// Rollup errors.
///
/// Use these to add context when wrapping lower-level errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollupError {
    /// The session went away before or during the rollup.
    SessionGone { session_id: SessionId },
    /// The summarizer failed; history is untouched and the next turn retries.
    Deferred { session_id: SessionId },
    /// Another history replacement won the race; nothing was changed.
    Conflict { session_id: SessionId },
    /// The rollup policy would summarize on every turn.
    InvalidPolicy { reason: String },
}

impl fmt::Display for RollupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SessionGone { session_id } => {
                write!(f, "rollup abandoned, session {session_id} is gone")
            }
            Self::Deferred { session_id } => {
                write!(f, "rollup deferred for session {session_id}")
            }
            Self::Conflict { session_id } => {
                write!(f, "rollup conflicted with another history change for {session_id}")
            }
            Self::InvalidPolicy { reason } => write!(f, "invalid rollup policy: {reason}"),
        }
    }
}

impl std::error::Error for RollupError {}
