//! Session lifecycle tracking
//!
//! A session is one batch upload. The tracker owns every counter
//! mutation for a session; nothing else writes them. Counter updates and
//! the terminal-state check run inside a single lock hold so concurrent
//! completions for the same session cannot both observe "one short of
//! done" and double-fire the terminal transition.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::store::{MediaStore, StoreError};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("session {0} is {1:?} and no longer accepts files")]
    Terminal(String, SessionStatus),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Active)
    }
}

/// One batch upload operation and its aggregate counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub status: SessionStatus,
    pub total_files: usize,
    pub completed_files: usize,
    pub failed_files: usize,
    pub total_bytes: u64,
    pub processed_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(session_id: String) -> Self {
        Self {
            session_id,
            status: SessionStatus::Active,
            total_files: 0,
            completed_files: 0,
            failed_files: 0,
            total_bytes: 0,
            processed_bytes: 0,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// `completed + failed == total` with at least one file registered.
    fn at_terminal_count(&self) -> bool {
        self.total_files > 0 && self.completed_files + self.failed_files == self.total_files
    }
}

/// Generate an opaque session token: sess_<32 hex chars>
pub fn new_session_id() -> String {
    format!("sess_{:032x}", uuid::Uuid::new_v4().as_u128())
}

/// Owns all session counter mutation.
pub struct SessionTracker {
    sessions: Mutex<HashMap<String, Session>>,
    store: Arc<MediaStore>,
}

impl SessionTracker {
    pub fn new(store: Arc<MediaStore>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            store,
        }
    }

    /// Return the session with the given id, or allocate a fresh one.
    ///
    /// A supplied id that matches neither the in-memory map nor the
    /// store is treated as a client-chosen token and created as-is.
    pub async fn create_or_get(&self, session_id: Option<&str>) -> Result<Session, SessionError> {
        let mut sessions = self.sessions.lock().await;

        if let Some(id) = session_id {
            if let Some(existing) = sessions.get(id) {
                return Ok(existing.clone());
            }
            if let Some(persisted) = self.store.get_session(id)? {
                sessions.insert(id.to_string(), persisted.clone());
                return Ok(persisted);
            }
        }

        let id = session_id
            .map(str::to_owned)
            .unwrap_or_else(new_session_id);
        let session = Session::new(id.clone());
        self.store.create_session(&session)?;
        sessions.insert(id, session.clone());
        info!(session_id = %session.session_id, "Session created");
        Ok(session)
    }

    /// Register files against a session before their jobs can complete.
    pub async fn register_files(
        &self,
        session_id: &str,
        sizes: &[u64],
    ) -> Result<Session, SessionError> {
        let mut sessions = self.sessions.lock().await;
        let session = Self::get_live(&mut sessions, &self.store, session_id)?;

        if session.status.is_terminal() {
            return Err(SessionError::Terminal(
                session_id.to_string(),
                session.status,
            ));
        }

        session.total_files += sizes.len();
        session.total_bytes += sizes.iter().sum::<u64>();
        self.store.upsert_session(session)?;
        debug!(
            session_id,
            total = session.total_files,
            bytes = session.total_bytes,
            "Files registered"
        );
        Ok(session.clone())
    }

    /// Record one file finishing successfully.
    pub async fn mark_completed(
        &self,
        session_id: &str,
        file_id: &str,
        size: u64,
    ) -> Result<Session, SessionError> {
        self.advance(session_id, file_id, size, true).await
    }

    /// Record one file failing permanently.
    pub async fn mark_failed(
        &self,
        session_id: &str,
        file_id: &str,
    ) -> Result<Session, SessionError> {
        self.advance(session_id, file_id, 0, false).await
    }

    /// Mark a session cancelled. Stops future registrations; running
    /// jobs are not preempted.
    pub async fn cancel(&self, session_id: &str) -> Result<Session, SessionError> {
        let mut sessions = self.sessions.lock().await;
        let session = Self::get_live(&mut sessions, &self.store, session_id)?;

        if !session.status.is_terminal() {
            session.status = SessionStatus::Cancelled;
            session.completed_at = Some(Utc::now());
            self.store.upsert_session(session)?;
            info!(session_id, "Session cancelled");
        }
        Ok(session.clone())
    }

    pub async fn get(&self, session_id: &str) -> Result<Session, SessionError> {
        let mut sessions = self.sessions.lock().await;
        Ok(Self::get_live(&mut sessions, &self.store, session_id)?.clone())
    }

    /// Increment one counter and apply the terminal transition if this
    /// was the last outstanding file. Single critical section.
    async fn advance(
        &self,
        session_id: &str,
        file_id: &str,
        size: u64,
        completed: bool,
    ) -> Result<Session, SessionError> {
        let mut sessions = self.sessions.lock().await;
        let session = Self::get_live(&mut sessions, &self.store, session_id)?;

        if session.status.is_terminal() {
            warn!(session_id, file_id, "Completion for already-terminal session ignored");
            return Ok(session.clone());
        }
        if session.completed_files + session.failed_files >= session.total_files {
            warn!(session_id, file_id, "Completion exceeds registered file count");
            return Ok(session.clone());
        }

        if completed {
            session.completed_files += 1;
            session.processed_bytes += size;
        } else {
            session.failed_files += 1;
        }

        if session.at_terminal_count() {
            session.status = if session.failed_files == 0 {
                SessionStatus::Completed
            } else {
                SessionStatus::Failed
            };
            session.completed_at = Some(Utc::now());
            info!(
                session_id,
                completed = session.completed_files,
                failed = session.failed_files,
                status = ?session.status,
                "Session reached terminal state"
            );
        }

        self.store.upsert_session(session)?;
        debug!(session_id, file_id, completed, "File state recorded");
        Ok(session.clone())
    }

    fn get_live<'a>(
        sessions: &'a mut HashMap<String, Session>,
        store: &MediaStore,
        session_id: &str,
    ) -> Result<&'a mut Session, SessionError> {
        if !sessions.contains_key(session_id) {
            match store.get_session(session_id)? {
                Some(persisted) => {
                    sessions.insert(session_id.to_string(), persisted);
                }
                None => return Err(SessionError::NotFound(session_id.to_string())),
            }
        }
        Ok(sessions
            .get_mut(session_id)
            .expect("session inserted above"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tracker() -> (SessionTracker, TempDir) {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(MediaStore::open(temp.path().join("store")).unwrap());
        (SessionTracker::new(store), temp)
    }

    #[tokio::test]
    async fn generated_ids_use_sess_prefix() {
        let id = new_session_id();
        assert!(id.starts_with("sess_"));
        assert_eq!(id.len(), "sess_".len() + 32);
    }

    #[tokio::test]
    async fn create_or_get_returns_existing() {
        let (tracker, _temp) = tracker();
        let first = tracker.create_or_get(None).await.unwrap();
        let again = tracker
            .create_or_get(Some(&first.session_id))
            .await
            .unwrap();
        assert_eq!(first.session_id, again.session_id);
    }

    #[tokio::test]
    async fn mixed_outcome_session_fails_exactly_once() {
        // 2 files, one completes, one fails.
        let (tracker, _temp) = tracker();
        let session = tracker.create_or_get(None).await.unwrap();
        let id = session.session_id.clone();

        tracker.register_files(&id, &[100, 200]).await.unwrap();

        let after_first = tracker.mark_completed(&id, "f1", 100).await.unwrap();
        assert_eq!(after_first.status, SessionStatus::Active);
        assert_eq!(after_first.completed_files, 1);

        let after_second = tracker.mark_failed(&id, "f2").await.unwrap();
        assert_eq!(after_second.status, SessionStatus::Failed);
        assert_eq!(after_second.completed_files, 1);
        assert_eq!(after_second.failed_files, 1);
        assert!(after_second.completed_at.is_some());

        // A stray late completion does not reopen or re-flip the session.
        let late = tracker.mark_completed(&id, "f3", 50).await.unwrap();
        assert_eq!(late.status, SessionStatus::Failed);
        assert_eq!(late.completed_files, 1);
    }

    #[tokio::test]
    async fn all_completed_session_completes() {
        let (tracker, _temp) = tracker();
        let id = tracker.create_or_get(None).await.unwrap().session_id;

        tracker.register_files(&id, &[10, 20]).await.unwrap();
        tracker.mark_completed(&id, "f1", 10).await.unwrap();
        let last = tracker.mark_completed(&id, "f2", 20).await.unwrap();

        assert_eq!(last.status, SessionStatus::Completed);
        assert_eq!(last.processed_bytes, 30);
        assert_eq!(last.total_bytes, 30);
    }

    #[tokio::test]
    async fn counter_invariant_holds_at_every_step() {
        let (tracker, _temp) = tracker();
        let id = tracker.create_or_get(None).await.unwrap().session_id;
        tracker.register_files(&id, &[1, 1, 1]).await.unwrap();

        for (i, fail) in [false, true, false].iter().enumerate() {
            let session = if *fail {
                tracker.mark_failed(&id, &format!("f{i}")).await.unwrap()
            } else {
                tracker
                    .mark_completed(&id, &format!("f{i}"), 1)
                    .await
                    .unwrap()
            };
            assert!(session.completed_files + session.failed_files <= session.total_files);
        }
    }

    #[tokio::test]
    async fn unknown_session_is_reported() {
        let (tracker, _temp) = tracker();
        let err = tracker.mark_completed("sess_missing", "f1", 1).await;
        assert!(matches!(err, Err(SessionError::NotFound(_))));
    }

    #[tokio::test]
    async fn cancelled_session_rejects_registration() {
        let (tracker, _temp) = tracker();
        let id = tracker.create_or_get(None).await.unwrap().session_id;
        tracker.cancel(&id).await.unwrap();

        let err = tracker.register_files(&id, &[100]).await;
        assert!(matches!(err, Err(SessionError::Terminal(_, _))));
    }

    #[tokio::test]
    async fn concurrent_completions_single_terminal_transition() {
        let (tracker, _temp) = tracker();
        let tracker = Arc::new(tracker);
        let id = tracker.create_or_get(None).await.unwrap().session_id;

        let sizes: Vec<u64> = vec![1; 16];
        tracker.register_files(&id, &sizes).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let t = tracker.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                t.mark_completed(&id, &format!("f{i}"), 1).await.unwrap()
            }));
        }

        let mut terminal_observations = 0;
        for handle in handles {
            let snapshot = handle.await.unwrap();
            if snapshot.status.is_terminal() && snapshot.completed_files == 16 {
                terminal_observations += 1;
            }
        }
        // Exactly one caller observes the moment of transition.
        assert_eq!(terminal_observations, 1);

        let final_state = tracker.get(&id).await.unwrap();
        assert_eq!(final_state.status, SessionStatus::Completed);
        assert_eq!(final_state.completed_files, 16);
    }
}
