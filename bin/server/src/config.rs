//! Centralized server configuration.
//!
//! This module provides strongly-typed configuration for the server,
//! loaded via the `config` crate from environment variables. Nested keys
//! use a double underscore, e.g. `SESSIONS__IDLE_TIMEOUT_SECONDS=900`.

use mir_conversation::{RollupPolicy, RollupWorkerConfig};
use mir_persistence::{DispatcherConfig, RetryPolicy};
use mir_scheduler::ReaperConfig;
use serde::Deserialize;
use std::time::Duration;

/// Server configuration composed from library configs.
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// PostgreSQL database connection URL.
    pub database_url: String,

    /// Maximum connections in the database pool.
    #[serde(default = "default_database_max_connections")]
    pub database_max_connections: u32,

    /// Session lifecycle configuration.
    #[serde(default)]
    pub sessions: SessionsConfig,

    /// Background queue configuration.
    #[serde(default)]
    pub queues: QueueConfig,

    /// Summarizer endpoint configuration.
    #[serde(default)]
    pub summarizer: SummarizerConfig,
}

/// Session lifecycle configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionsConfig {
    /// History length that triggers a rollup.
    #[serde(default = "default_rollup_max_messages")]
    pub rollup_max_messages: usize,

    /// Total history characters that trigger a rollup. Unset means no limit.
    #[serde(default)]
    pub rollup_max_chars: Option<usize>,

    /// Inactivity before a session is flushed and evicted, in seconds.
    /// Zero keeps sessions for the lifetime of the process.
    #[serde(default = "default_idle_timeout_seconds")]
    pub idle_timeout_seconds: u64,

    /// Interval between idle sweeps, in seconds.
    #[serde(default = "default_sweep_interval_seconds")]
    pub sweep_interval_seconds: u64,
}

fn default_database_max_connections() -> u32 {
    5
}

fn default_rollup_max_messages() -> usize {
    20
}

fn default_idle_timeout_seconds() -> u64 {
    1800
}

fn default_sweep_interval_seconds() -> u64 {
    60
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            rollup_max_messages: default_rollup_max_messages(),
            rollup_max_chars: None,
            idle_timeout_seconds: default_idle_timeout_seconds(),
            sweep_interval_seconds: default_sweep_interval_seconds(),
        }
    }
}

impl SessionsConfig {
    /// The rollup trigger.
    #[must_use]
    pub fn rollup_policy(&self) -> RollupPolicy {
        RollupPolicy {
            max_messages: self.rollup_max_messages,
            max_chars: self.rollup_max_chars,
        }
    }

    /// The idle reaper settings.
    #[must_use]
    pub fn reaper(&self) -> ReaperConfig {
        ReaperConfig {
            idle_timeout: (self.idle_timeout_seconds > 0)
                .then(|| Duration::from_secs(self.idle_timeout_seconds)),
            sweep_interval: Duration::from_secs(self.sweep_interval_seconds),
        }
    }
}

/// Background queue configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Capacity of the user upsert queue.
    #[serde(default = "default_queue_capacity")]
    pub user_capacity: usize,

    /// Capacity of the chat-log queue.
    #[serde(default = "default_queue_capacity")]
    pub chat_log_capacity: usize,

    /// Drain workers per write-behind queue.
    #[serde(default = "default_workers_per_queue")]
    pub workers_per_queue: usize,

    /// Capacity of the rollup request queue.
    #[serde(default = "default_rollup_capacity")]
    pub rollup_capacity: usize,

    /// Rollups allowed to run at once.
    #[serde(default = "default_rollup_concurrency")]
    pub rollup_concurrency: usize,

    /// Attempts per durable write, including the first.
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,

    /// Delay after the first failed write, in milliseconds.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Upper bound for a single retry delay, in milliseconds.
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_workers_per_queue() -> usize {
    1
}

fn default_rollup_capacity() -> usize {
    256
}

fn default_rollup_concurrency() -> usize {
    4
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    100
}

fn default_retry_max_delay_ms() -> u64 {
    5000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            user_capacity: default_queue_capacity(),
            chat_log_capacity: default_queue_capacity(),
            workers_per_queue: default_workers_per_queue(),
            rollup_capacity: default_rollup_capacity(),
            rollup_concurrency: default_rollup_concurrency(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

impl QueueConfig {
    /// Retry policy for durable writes.
    #[must_use]
    pub fn retry(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }

    /// Write-behind dispatcher settings.
    #[must_use]
    pub fn dispatcher(&self) -> DispatcherConfig {
        DispatcherConfig {
            user_queue_capacity: self.user_capacity,
            chat_log_queue_capacity: self.chat_log_capacity,
            workers_per_queue: self.workers_per_queue,
            retry: self.retry(),
        }
    }

    /// Rollup worker settings.
    #[must_use]
    pub fn rollup_worker(&self) -> RollupWorkerConfig {
        RollupWorkerConfig {
            queue_capacity: self.rollup_capacity,
            max_concurrent: self.rollup_concurrency,
        }
    }
}

/// Summarizer endpoint configuration.
///
/// Any OpenAI-compatible `/chat/completions` endpoint works.
#[derive(Clone, Deserialize)]
pub struct SummarizerConfig {
    /// API base URL, without the `/chat/completions` suffix.
    #[serde(default = "default_summarizer_base_url")]
    pub base_url: String,

    /// Bearer token, if the endpoint needs one.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Model name.
    #[serde(default = "default_summarizer_model")]
    pub model: String,

    /// Request timeout, in seconds.
    #[serde(default = "default_summarizer_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_summarizer_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_summarizer_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_summarizer_timeout_seconds() -> u64 {
    30
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            base_url: default_summarizer_base_url(),
            api_key: None,
            model: default_summarizer_model(),
            timeout_seconds: default_summarizer_timeout_seconds(),
        }
    }
}

impl std::fmt::Debug for SummarizerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SummarizerConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[redacted]"))
            .field("model", &self.model)
            .field("timeout_seconds", &self.timeout_seconds)
            .finish()
    }
}

impl ServerConfig {
    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required configuration is missing or invalid.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Self::from_source(config::Environment::default())
    }

    fn from_source(source: config::Environment) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(source.separator("__").try_parsing(true))
            .build()?
            .try_deserialize()
    }
}
