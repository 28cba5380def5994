//! In-process session store.
//!
//! Maps a session id to its live state. The map lock is held only to look
//! up, insert or remove an entry; every mutation runs under the session's
//! own mutex, so sessions never wait on each other. Lock order is always
//! map, then session. No lock is held across an `.await`.

use crate::error::SessionError;
use crate::message::{Message, MessageRole};
use crate::session::{HistoryMark, HistorySnapshot, Session, SessionSeed, SessionView, TokenTotals};
use chrono::{DateTime, Utc};
use mir_core::{MessageId, SessionId};
use mir_persistence::SessionSnapshot;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

type SessionCell = Arc<Mutex<Session>>;

/// A session due for reaping, with the activity time it was found with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdleSession {
    /// Session key.
    pub id: SessionId,
    /// `last_active_at` when the session was found idle.
    pub last_active_at: DateTime<Utc>,
}

/// Concurrent map of live sessions.
///
/// Create one per process and share it behind an `Arc`; tests create a
/// fresh store each.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<SessionId, SessionCell>>,
}

impl SessionStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if a live session has this id.
    #[must_use]
    pub fn exists(&self, id: &SessionId) -> bool {
        self.read_map().contains_key(id)
    }

    /// Inserts a new session.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` if the id is taken; the existing session is untouched.
    pub fn create(&self, id: SessionId, seed: SessionSeed) -> Result<(), SessionError> {
        let mut sessions = self.write_map();
        if sessions.contains_key(&id) {
            return Err(SessionError::AlreadyExists { id });
        }
        let session = Session::new(id.clone(), seed);
        sessions.insert(id, Arc::new(Mutex::new(session)));
        Ok(())
    }

    /// Returns a copy of the session.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the session is absent.
    pub fn get(&self, id: &SessionId) -> Result<SessionView, SessionError> {
        self.with_session(id, |session| session.view())
    }

    /// Appends a message and marks the session active.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the session is absent.
    pub fn append_message(
        &self,
        id: &SessionId,
        role: MessageRole,
        text: impl Into<String>,
    ) -> Result<MessageId, SessionError> {
        let text = text.into();
        self.with_session(id, move |session| session.append(role, text))
    }

    /// Adds to the session's token counters.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the session is absent.
    pub fn add_tokens(
        &self,
        id: &SessionId,
        input: u64,
        output: u64,
    ) -> Result<TokenTotals, SessionError> {
        self.with_session(id, |session| session.add_tokens(input, output))
    }

    /// Returns the session's token counters.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the session is absent.
    pub fn totals(&self, id: &SessionId) -> Result<TokenTotals, SessionError> {
        self.with_session(id, |session| session.totals())
    }

    /// Runs `f` against the session under its lock, allowing mutation.
    ///
    /// Everything `f` does is one step for concurrent readers and writers of
    /// the same session. `f` must not block.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the session is absent.
    pub fn update<R>(
        &self,
        id: &SessionId,
        f: impl FnOnce(&mut Session) -> R,
    ) -> Result<R, SessionError> {
        self.with_session(id, f)
    }

    /// Returns a mark of the current history for [`replace_history`](Self::replace_history).
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the session is absent.
    pub fn history_mark(&self, id: &SessionId) -> Result<HistoryMark, SessionError> {
        self.with_session(id, |session| session.mark())
    }

    /// Swaps the history covered by `base` for `new_history` and installs `new_summary`.
    ///
    /// Messages appended after `base` was taken are preserved after
    /// `new_history`; the return value is how many.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the session is absent, `StaleSnapshot` if the
    /// history was already replaced since `base`.
    pub fn replace_history(
        &self,
        id: &SessionId,
        base: HistoryMark,
        new_history: Vec<Message>,
        new_summary: impl Into<String>,
    ) -> Result<usize, SessionError> {
        let new_summary = new_summary.into();
        self.with_session(id, move |session| {
            session.replace_history(base, new_history, new_summary)
        })?
    }

    /// Returns the current history length.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the session is absent.
    pub fn history_len(&self, id: &SessionId) -> Result<usize, SessionError> {
        self.with_session(id, |session| session.history().len())
    }

    /// Returns the summary and totals to persist for a session, with its activity time.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the session is absent.
    pub fn flush_view(
        &self,
        id: &SessionId,
    ) -> Result<(SessionSnapshot, DateTime<Utc>), SessionError> {
        self.with_session(id, |session| (session.snapshot(), session.last_active_at()))
    }

    /// Runs `f` against the session under its lock.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the session is absent.
    pub fn inspect<R>(
        &self,
        id: &SessionId,
        f: impl FnOnce(&Session) -> R,
    ) -> Result<R, SessionError> {
        self.with_session(id, |session| f(session))
    }

    /// Sessions whose last activity is at or before `cutoff`.
    #[must_use]
    pub fn idle_since(&self, cutoff: DateTime<Utc>) -> Vec<IdleSession> {
        let cells: Vec<SessionCell> = self.read_map().values().cloned().collect();
        cells
            .iter()
            .filter_map(|cell| {
                let session = lock_session(cell);
                if session.is_evicted() {
                    return None;
                }
                (session.last_active_at() <= cutoff).then(|| IdleSession {
                    id: session.id().clone(),
                    last_active_at: session.last_active_at(),
                })
            })
            .collect()
    }

    /// Removes the session unless it was active after `last_active_at` or a
    /// rollup is running on it.
    ///
    /// Returns true if the session was removed. A removed session rejects
    /// later mutations through handles obtained before the removal.
    pub fn remove_if_inactive_since(&self, id: &SessionId, last_active_at: DateTime<Utc>) -> bool {
        let mut sessions = self.write_map();
        let Some(cell) = sessions.get(id) else {
            return false;
        };
        {
            let mut session = lock_session(cell);
            if session.last_active_at() != last_active_at || session.rollup_in_flight() {
                return false;
            }
            session.evict();
        }
        sessions.remove(id);
        true
    }

    /// Removes the session unconditionally. Returns true if it existed.
    pub fn remove(&self, id: &SessionId) -> bool {
        match self.write_map().remove(id) {
            Some(cell) => {
                lock_session(&cell).evict();
                true
            }
            None => false,
        }
    }

    /// Ids of all live sessions.
    #[must_use]
    pub fn ids(&self) -> Vec<SessionId> {
        self.read_map().keys().cloned().collect()
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read_map().len()
    }

    /// Returns true if no session is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read_map().is_empty()
    }

    pub(crate) fn begin_rollup(
        &self,
        id: &SessionId,
    ) -> Result<Option<HistorySnapshot>, SessionError> {
        self.with_session(id, Session::begin_rollup)
    }

    pub(crate) fn end_rollup(&self, id: &SessionId, incarnation: u64) {
        // The session may have been reaped meanwhile; nothing to clear then.
        let _ = self.with_session(id, |session| session.end_rollup(incarnation));
    }

    fn with_session<R>(
        &self,
        id: &SessionId,
        f: impl FnOnce(&mut Session) -> R,
    ) -> Result<R, SessionError> {
        let cell = self
            .read_map()
            .get(id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound { id: id.clone() })?;

        let mut session = lock_session(&cell);
        if session.is_evicted() {
            return Err(SessionError::NotFound { id: id.clone() });
        }
        Ok(f(&mut session))
    }

    fn read_map(&self) -> std::sync::RwLockReadGuard<'_, HashMap<SessionId, SessionCell>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_map(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<SessionId, SessionCell>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn lock_session(cell: &SessionCell) -> MutexGuard<'_, Session> {
    cell.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn id(s: &str) -> SessionId {
        SessionId::new(s)
    }

    fn store_with(ids: &[&str]) -> SessionStore {
        let store = SessionStore::new();
        for s in ids {
            store.create(id(s), SessionSeed::default()).unwrap();
        }
        store
    }

    #[test]
    fn exists_has_no_side_effects() {
        let store = SessionStore::new();
        assert!(!store.exists(&id("a")));
        assert!(store.is_empty());
    }

    #[test]
    fn create_never_overwrites() {
        let store = store_with(&["a"]);
        store.append_message(&id("a"), MessageRole::User, "hi").unwrap();

        let err = store
            .create(
                id("a"),
                SessionSeed {
                    summary: "other".to_string(),
                    ..SessionSeed::default()
                },
            )
            .unwrap_err();

        assert_eq!(err, SessionError::AlreadyExists { id: id("a") });
        let view = store.get(&id("a")).unwrap();
        assert_eq!(view.history.len(), 1);
        assert_eq!(view.summary, "");
    }

    #[test]
    fn operations_on_missing_session_fail_with_not_found() {
        let store = SessionStore::new();
        let missing = id("missing");
        let not_found = SessionError::NotFound {
            id: missing.clone(),
        };

        assert_eq!(store.get(&missing).unwrap_err(), not_found);
        assert_eq!(
            store
                .append_message(&missing, MessageRole::User, "hi")
                .unwrap_err(),
            not_found
        );
        assert_eq!(store.add_tokens(&missing, 1, 1).unwrap_err(), not_found);
    }

    #[test]
    fn greeting_example() {
        let store = store_with(&["A"]);
        store.append_message(&id("A"), MessageRole::User, "hi").unwrap();
        store
            .append_message(&id("A"), MessageRole::Assistant, "hello")
            .unwrap();

        let view = store.get(&id("A")).unwrap();
        assert_eq!(view.history.len(), 2);
        assert_eq!(view.summary, "");
        assert_eq!(view.totals, TokenTotals::default());

        let totals = store.add_tokens(&id("A"), 5, 3).unwrap();
        assert_eq!(totals, TokenTotals { input: 5, output: 3 });
    }

    #[test]
    fn appends_preserve_insertion_order() {
        let store = store_with(&["a"]);
        for i in 0..50 {
            let role = if i % 2 == 0 {
                MessageRole::User
            } else {
                MessageRole::Assistant
            };
            store.append_message(&id("a"), role, format!("m{i}")).unwrap();
        }

        let view = store.get(&id("a")).unwrap();
        assert_eq!(view.history.len(), 50);
        for (i, message) in view.history.iter().enumerate() {
            assert_eq!(message.content, format!("m{i}"));
        }
    }

    #[test]
    fn token_totals_equal_sum_of_increments() {
        let store = Arc::new(store_with(&["a"]));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for _ in 0..100 {
                        store.add_tokens(&id("a"), 3, 2).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let totals = store.get(&id("a")).unwrap().totals;
        assert_eq!(totals, TokenTotals { input: 2400, output: 1600 });
    }

    #[test]
    fn concurrent_appends_to_one_session_are_all_kept() {
        let store = Arc::new(store_with(&["a"]));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for i in 0..25 {
                        store
                            .append_message(&id("a"), MessageRole::User, format!("{t}-{i}"))
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.history_len(&id("a")).unwrap(), 100);
    }

    #[test]
    fn busy_session_does_not_block_another() {
        let store = Arc::new(store_with(&["busy", "free"]));
        let (locked_tx, locked_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let holder = {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                store
                    .inspect(&id("busy"), |_| {
                        locked_tx.send(()).unwrap();
                        release_rx.recv().unwrap();
                    })
                    .unwrap();
            })
        };
        locked_rx.recv().unwrap();

        let (done_tx, done_rx) = mpsc::channel();
        {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                store
                    .append_message(&id("free"), MessageRole::User, "hi")
                    .unwrap();
                done_tx.send(()).unwrap();
            });
        }

        // Completes while "busy" is still locked.
        done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("append to another session must not wait");

        release_tx.send(()).unwrap();
        holder.join().unwrap();
        assert_eq!(store.history_len(&id("free")).unwrap(), 1);
    }

    #[test]
    fn idle_scan_behind_a_busy_session_does_not_block_the_map() {
        let store = Arc::new(store_with(&["busy", "free"]));
        let (locked_tx, locked_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let holder = {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                store
                    .inspect(&id("busy"), |_| {
                        locked_tx.send(()).unwrap();
                        release_rx.recv().unwrap();
                    })
                    .unwrap();
            })
        };
        locked_rx.recv().unwrap();

        let scanner = {
            let store = Arc::clone(&store);
            thread::spawn(move || store.idle_since(Utc::now()).len())
        };
        // Let the scan reach the busy session.
        thread::sleep(Duration::from_millis(50));

        let (done_tx, done_rx) = mpsc::channel();
        {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                store.create(id("new"), SessionSeed::default()).unwrap();
                store
                    .append_message(&id("free"), MessageRole::User, "hi")
                    .unwrap();
                done_tx.send(()).unwrap();
            });
        }

        done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("create must not wait behind the idle scan");

        release_tx.send(()).unwrap();
        holder.join().unwrap();
        assert!(scanner.join().unwrap() >= 1);
        assert!(store.exists(&id("new")));
    }

    #[test]
    fn replace_history_merges_late_appends() {
        let store = store_with(&["a"]);
        store.append_message(&id("a"), MessageRole::User, "old").unwrap();
        let mark = store.history_mark(&id("a")).unwrap();
        store.append_message(&id("a"), MessageRole::User, "late").unwrap();

        let carried = store
            .replace_history(&id("a"), mark, Vec::new(), "summary of old")
            .unwrap();

        assert_eq!(carried, 1);
        let view = store.get(&id("a")).unwrap();
        assert_eq!(view.summary, "summary of old");
        assert_eq!(view.history.len(), 1);
        assert_eq!(view.history[0].content, "late");
    }

    #[test]
    fn idle_since_and_conditional_remove() {
        let store = store_with(&["a", "b"]);
        let cutoff = Utc::now();
        thread::sleep(Duration::from_millis(5));
        store.append_message(&id("b"), MessageRole::User, "hi").unwrap();

        let idle = store.idle_since(cutoff);
        assert_eq!(idle.len(), 1);
        assert_eq!(idle[0].id, id("a"));

        assert!(store.remove_if_inactive_since(&id("a"), idle[0].last_active_at));
        assert!(!store.exists(&id("a")));
        assert!(store.exists(&id("b")));
    }

    #[test]
    fn remove_is_refused_after_new_activity() {
        let store = store_with(&["a"]);
        let (_, seen_at) = store.flush_view(&id("a")).unwrap();
        thread::sleep(Duration::from_millis(5));
        store.append_message(&id("a"), MessageRole::User, "back").unwrap();

        assert!(!store.remove_if_inactive_since(&id("a"), seen_at));
        assert!(store.exists(&id("a")));
    }

    #[test]
    fn remove_then_recreate() {
        let store = store_with(&["a"]);
        assert!(store.remove(&id("a")));
        assert!(!store.remove(&id("a")));
        store.create(id("a"), SessionSeed::default()).unwrap();
        assert_eq!(store.len(), 1);
    }
}
