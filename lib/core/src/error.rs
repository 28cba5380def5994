//! Error handling foundation for the MIR session core.
//!
//! This module provides only the `Result` type alias using rootcause.
//! Each crate defines its own domain-specific error types in its own
//! error module: session errors in `mir-conversation`, storage and queue
//! errors in `mir-persistence`. Background subsystems wrap those in
//! reports and log them; only session lookups surface to callers.

use rootcause::Report;

/// A Result type alias using rootcause's Report for error handling.
///
/// Each layer adds its own context via `.context()` as errors propagate.
pub type Result<T, C = ()> = std::result::Result<T, Report<C>>;
