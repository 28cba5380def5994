//! Error types for server startup and wiring.
//!
//! Errors are designed for layered context using rootcause:
//! - `ServerError`: Startup failures, added as context over the
//!   configuration, database and reaper errors underneath

use std::fmt;

/// Errors that stop the server from starting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerError {
    /// Configuration is missing or invalid.
    Config { details: String },
    /// The database is unreachable.
    Database { details: String },
    /// Database migrations failed.
    Migration { details: String },
    /// A background component refused its configuration.
    Startup { component: &'static str },
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config { details } => write!(f, "invalid configuration: {details}"),
            Self::Database { details } => write!(f, "database connection failed: {details}"),
            Self::Migration { details } => write!(f, "database migration failed: {details}"),
            Self::Startup { component } => write!(f, "failed to start {component}"),
        }
    }
}

impl std::error::Error for ServerError {}
