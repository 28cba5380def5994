//! Database repositories for the MIR session core.
//!
//! This module provides data access for:
//! - User profiles with running summaries and token totals
//! - The chat-log audit trail

pub mod session;

pub use session::PgSessionStorage;
