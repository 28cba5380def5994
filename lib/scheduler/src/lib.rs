//! Background scheduling for the MIR session core.
//!
//! This crate provides:
//!
//! - **Idle Reaper**: Periodic flush and eviction of inactive sessions
//! - **Shutdown Flush**: Persisting every live session when the process stops

pub mod error;
pub mod reaper;

pub use error::ReaperError;
pub use reaper::{IdleReaper, ReaperConfig, SweepReport};
