//! MIR session core server.
//!
//! This crate wires the session libraries into a running process:
//!
//! - **Config**: Environment-driven settings for every component
//! - **Database**: Postgres implementation of session storage
//! - **Summarizer**: HTTP client for an OpenAI-compatible completions endpoint
//! - **Runtime**: Ownership of the background tasks and graceful shutdown

pub mod config;
pub mod db;
pub mod error;
pub mod runtime;
pub mod summarizer;
