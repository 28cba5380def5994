//! History rollup.
//!
//! When a session's history grows past the [`RollupPolicy`] threshold, the
//! controller compacts it into the running summary:
//! 1. Snapshot the summary and history, marking the session as rolling up
//! 2. Ask the [`Summarizer`] for a new summary, holding no lock
//! 3. Swap the summarized messages out, keeping anything appended meanwhile
//!
//! A failed or empty summary leaves the history untouched; the next turn
//! checks again.

use crate::error::{RollupError, SessionError, SummarizeError};
use crate::message::{Message, MessageRole};
use crate::store::SessionStore;
use async_trait::async_trait;
use mir_core::{Result, SessionId};
use rootcause::Report;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// When a session's history is due for compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollupPolicy {
    /// History length that triggers a rollup.
    pub max_messages: usize,
    /// Total history characters that trigger a rollup, if set.
    pub max_chars: Option<usize>,
}

impl Default for RollupPolicy {
    fn default() -> Self {
        Self {
            max_messages: 20,
            max_chars: None,
        }
    }
}

impl RollupPolicy {
    /// A policy that triggers on message count only.
    #[must_use]
    pub fn messages(max_messages: usize) -> Self {
        Self {
            max_messages,
            max_chars: None,
        }
    }

    /// Validates the policy.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPolicy` if a threshold is zero.
    pub fn validate(&self) -> std::result::Result<(), RollupError> {
        if self.max_messages == 0 {
            return Err(RollupError::InvalidPolicy {
                reason: "max_messages must be greater than zero".to_string(),
            });
        }
        if self.max_chars == Some(0) {
            return Err(RollupError::InvalidPolicy {
                reason: "max_chars must be greater than zero when set".to_string(),
            });
        }
        Ok(())
    }

    /// Returns true if a history of this size is due for rollup.
    #[must_use]
    pub fn is_due(&self, len: usize, chars: usize) -> bool {
        if len == 0 {
            return false;
        }
        len >= self.max_messages || self.max_chars.is_some_and(|max| chars >= max)
    }
}

/// Trait for the external summarizer.
///
/// Implementations turn the previous summary plus the messages since into a
/// single new summary covering both.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Produces a new running summary.
    async fn summarize(
        &self,
        previous_summary: &str,
        messages: &[Message],
    ) -> Result<String, SummarizeError>;
}

/// Renders messages as a plain transcript, one `role: text` line each.
#[must_use]
pub fn render_transcript(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|message| {
            let label = match message.role {
                MessageRole::User => "user",
                MessageRole::Assistant => "assistant",
            };
            format!("{label}: {}", message.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Result of a rollup attempt that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollupOutcome {
    /// The history was compacted.
    Completed {
        /// Messages folded into the summary.
        summarized: usize,
        /// Messages appended during the rollup and kept in the history.
        carried_over: usize,
        /// The new summary.
        summary: String,
    },
    /// Another rollup of this session is running.
    AlreadyRunning,
    /// The history was empty.
    Skipped,
}

/// Runs rollups against a store.
#[derive(Clone)]
pub struct RollupController {
    store: Arc<SessionStore>,
    summarizer: Arc<dyn Summarizer>,
    policy: RollupPolicy,
}

impl RollupController {
    /// Creates a controller.
    #[must_use]
    pub fn new(
        store: Arc<SessionStore>,
        summarizer: Arc<dyn Summarizer>,
        policy: RollupPolicy,
    ) -> Self {
        Self {
            store,
            summarizer,
            policy,
        }
    }

    /// The configured policy.
    #[must_use]
    pub fn policy(&self) -> RollupPolicy {
        self.policy
    }

    /// The store this controller compacts.
    #[must_use]
    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Returns true if the session's history is due for rollup.
    ///
    /// Sessions with a rollup in flight report false.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the session is absent.
    pub fn needs_rollup(&self, id: &SessionId) -> std::result::Result<bool, SessionError> {
        self.store.inspect(id, |session| {
            !session.rollup_in_flight()
                && self
                    .policy
                    .is_due(session.history().len(), session.history_chars())
        })
    }

    /// Compacts the session's history into its summary.
    ///
    /// # Errors
    ///
    /// - `SessionGone` if the session is absent or was reaped mid-rollup
    /// - `Deferred` if the summarizer failed or returned nothing
    /// - `Conflict` if the history was replaced by someone else meanwhile
    #[tracing::instrument(skip_all, fields(session_id = %id))]
    pub async fn rollup(&self, id: &SessionId) -> Result<RollupOutcome, RollupError> {
        let snapshot = match self.store.begin_rollup(id) {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return Ok(RollupOutcome::AlreadyRunning),
            Err(e) => return Err(Report::new(e).context(gone(id))),
        };
        let _in_flight = InFlight {
            store: &self.store,
            id,
            incarnation: snapshot.mark.incarnation,
        };

        if snapshot.messages.is_empty() {
            return Ok(RollupOutcome::Skipped);
        }

        let summary = self
            .summarizer
            .summarize(&snapshot.summary, &snapshot.messages)
            .await
            .map_err(|e| {
                e.context(RollupError::Deferred {
                    session_id: id.clone(),
                })
            })?;
        let summary = summary.trim().to_string();
        if summary.is_empty() {
            return Err(
                Report::new(SummarizeError::EmptyResponse).context(RollupError::Deferred {
                    session_id: id.clone(),
                }),
            );
        }

        let summarized = snapshot.messages.len();
        match self
            .store
            .replace_history(id, snapshot.mark, Vec::new(), summary.clone())
        {
            Ok(carried_over) => {
                tracing::debug!(summarized, carried_over, "history rolled up");
                Ok(RollupOutcome::Completed {
                    summarized,
                    carried_over,
                    summary,
                })
            }
            Err(e @ SessionError::NotFound { .. }) => Err(Report::new(e).context(gone(id))),
            Err(e) => Err(Report::new(e).context(RollupError::Conflict {
                session_id: id.clone(),
            })),
        }
    }
}

fn gone(id: &SessionId) -> RollupError {
    RollupError::SessionGone {
        session_id: id.clone(),
    }
}

/// Clears the in-flight flag however the rollup ends, including when its
/// future is dropped.
struct InFlight<'a> {
    store: &'a SessionStore,
    id: &'a SessionId,
    incarnation: u64,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.store.end_rollup(self.id, self.incarnation);
    }
}

/// A summarizer that returns a fixed summary or a fixed error.
pub struct MockSummarizer {
    /// If set, every call fails with this error.
    pub fail_with: Option<SummarizeError>,
    /// The summary returned on success.
    pub summary: String,
    calls: AtomicU32,
}

impl MockSummarizer {
    /// Creates a mock summarizer that succeeds with the given summary.
    #[must_use]
    pub fn succeeding(summary: impl Into<String>) -> Self {
        Self {
            fail_with: None,
            summary: summary.into(),
            calls: AtomicU32::new(0),
        }
    }

    /// Creates a mock summarizer that fails with the given error.
    #[must_use]
    pub fn failing(error: SummarizeError) -> Self {
        Self {
            fail_with: Some(error),
            summary: String::new(),
            calls: AtomicU32::new(0),
        }
    }

    /// Number of summarize calls so far.
    #[must_use]
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Summarizer for MockSummarizer {
    async fn summarize(
        &self,
        _previous_summary: &str,
        _messages: &[Message],
    ) -> Result<String, SummarizeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.fail_with {
            Some(e) => Err(e.clone().into()),
            None => Ok(self.summary.clone()),
        }
    }
}
