//! Durable records and write-behind persistence for the MIR session core.
//!
//! This crate provides:
//!
//! - **Records**: The denormalized user, chat-log and session snapshot records
//! - **Session Storage**: The durable-storage collaborator trait and an in-memory implementation
//! - **Retry Policy**: Item-level retry with exponential backoff
//! - **Write-Behind Dispatcher**: Bounded queues drained by background workers

pub mod dispatcher;
pub mod error;
pub mod record;
pub mod retry;
pub mod storage;

pub use dispatcher::{DispatcherConfig, DispatcherStats, DrainWorkers, QueueStats, WriteBehindDispatcher};
pub use error::{DispatchError, PersistenceError, QueueKind, StorageError};
pub use record::{ChatLogRecord, SessionSnapshot, UserRecord};
pub use retry::RetryPolicy;
pub use storage::{InMemorySessionStorage, SessionStorage, StorageOp};
