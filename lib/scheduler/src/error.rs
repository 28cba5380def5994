//! Error types for the scheduler crate.
//!
//! Errors are designed for layered context using rootcause:
//! - `ReaperError`: Errors from idle reaping, added as context over
//!   persistence failures

use mir_core::SessionId;
use std::fmt;

/// Errors from idle reaping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaperError {
    /// The session's summary could not be flushed; it stays live.
    FlushFailed { session_id: SessionId },
    /// The reaper configuration is unusable.
    InvalidConfig { reason: String },
}

impl fmt::Display for ReaperError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FlushFailed { session_id } => {
                write!(f, "failed to flush session {session_id}, keeping it")
            }
            Self::InvalidConfig { reason } => write!(f, "invalid reaper config: {reason}"),
        }
    }
}

impl std::error::Error for ReaperError {}
