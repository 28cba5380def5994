//! Error types for the persistence crate.
//!
//! Errors are designed for layered context using rootcause:
//! - `StorageError`: A single durable-storage call failed
//! - `PersistenceError`: A background write gave up after retrying
//! - `DispatchError`: An item could not be handed to a write-behind queue
//!
//! None of these reach the reply path. They are logged with the session
//! id and the operation, and the item is discarded.

use std::fmt;

/// Errors from a single durable-storage call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The backend could not be reached.
    Unavailable { reason: String },
    /// A statement failed.
    Query { details: String },
    /// A stored row could not be decoded.
    Decode { details: String },
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable { reason } => write!(f, "storage unavailable: {reason}"),
            Self::Query { details } => write!(f, "storage query failed: {details}"),
            Self::Decode { details } => write!(f, "failed to decode stored row: {details}"),
        }
    }
}

impl std::error::Error for StorageError {}

/// Errors from background persistence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    /// Every attempt allowed by the retry policy failed.
    RetryExhausted {
        operation: &'static str,
        key: String,
        attempts: u32,
    },
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RetryExhausted {
                operation,
                key,
                attempts,
            } => write!(
                f,
                "{operation} for '{key}' failed after {attempts} attempts"
            ),
        }
    }
}

impl std::error::Error for PersistenceError {}

/// The write-behind queue an item was destined for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// User profile upserts.
    UserUpsert,
    /// Chat-log appends.
    ChatLog,
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UserUpsert => f.write_str("user_upsert"),
            Self::ChatLog => f.write_str("chat_log"),
        }
    }
}

/// Errors from handing an item to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    /// The queue was full and the item was dropped.
    QueueFull { queue: QueueKind },
    /// The dispatcher has shut down.
    Closed { queue: QueueKind },
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QueueFull { queue } => write!(f, "{queue} queue is full, item dropped"),
            Self::Closed { queue } => write!(f, "{queue} queue is closed"),
        }
    }
}

impl std::error::Error for DispatchError {}
