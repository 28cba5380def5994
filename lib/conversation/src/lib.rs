//! Live conversation sessions for the MIR session core.
//!
//! This crate provides:
//!
//! - **Session Store**: Per-user history, running summary and token totals
//! - **Rollup**: Compaction of long histories through an external summarizer
//! - **Rollup Worker**: Bounded background queue that runs rollups off the reply path
//! - **Conversation Service**: Restore-or-create and turn recording for reply handlers

pub mod error;
pub mod message;
pub mod rollup;
pub mod service;
pub mod session;
pub mod store;
pub mod worker;

pub use error::{RollupError, SessionError, SummarizeError};
pub use message::{Message, MessageRole};
pub use rollup::{
    MockSummarizer, RollupController, RollupOutcome, RollupPolicy, Summarizer, render_transcript,
};
pub use service::{ConversationService, SessionOrigin, Turn, TurnReceipt};
pub use session::{
    HistoryMark, HistorySnapshot, Session, SessionSeed, SessionView, TokenTotals,
};
pub use store::{IdleSession, SessionStore};
pub use worker::{RollupRequests, RollupWorker, RollupWorkerConfig};
