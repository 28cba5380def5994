//! Core identifiers and error handling for the MIR session core.
//!
//! This crate provides the foundational types shared by the session store,
//! the write-behind persistence layer and the idle reaper.

pub mod error;
pub mod id;

pub use error::Result;
pub use id::{ChatLogId, MessageId, ParseIdError, SessionId};
