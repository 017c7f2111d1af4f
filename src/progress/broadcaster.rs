use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::RwLock;
use tracing::debug;

pub type ListenerId = u64;

const DEFAULT_SUCCESS_GRACE: Duration = Duration::from_secs(5);
const DEFAULT_FAILURE_GRACE: Duration = Duration::from_secs(10);

/// Point-in-time progress of a single job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub percentage: f32,
    pub current_step: String,
    pub eta_seconds: Option<u64>,
    pub updated_at: DateTime<Utc>,
}

/// Aggregate over every live job of a session: mean percentage,
/// worst-case ETA.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionProgress {
    pub session_id: String,
    pub percentage: f32,
    pub eta_seconds: Option<u64>,
    pub active_jobs: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    JobProgress {
        job_id: String,
        session_id: String,
        snapshot: ProgressSnapshot,
    },
    JobCompleted {
        job_id: String,
        session_id: String,
        result_key: Option<String>,
    },
    JobFailed {
        job_id: String,
        session_id: String,
        error: String,
    },
}

impl ProgressEvent {
    pub fn job_id(&self) -> &str {
        match self {
            Self::JobProgress { job_id, .. }
            | Self::JobCompleted { job_id, .. }
            | Self::JobFailed { job_id, .. } => job_id,
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            Self::JobProgress { session_id, .. }
            | Self::JobCompleted { session_id, .. }
            | Self::JobFailed { session_id, .. } => session_id,
        }
    }
}

struct JobProgress {
    session_id: String,
    snapshot: ProgressSnapshot,
    terminal: bool,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<String, JobProgress>,
    job_listeners: HashMap<String, HashMap<ListenerId, UnboundedSender<ProgressEvent>>>,
    session_listeners: HashMap<String, HashMap<ListenerId, UnboundedSender<ProgressEvent>>>,
    global_listeners: HashMap<ListenerId, UnboundedSender<ProgressEvent>>,
    next_listener: ListenerId,
}

impl Inner {
    fn next_id(&mut self) -> ListenerId {
        self.next_listener += 1;
        self.next_listener
    }

    /// Deliver to job, session, and global listeners. A failed send
    /// means the receiver is gone; the listener is removed on the spot.
    fn dispatch(&mut self, event: &ProgressEvent) {
        if let Some(listeners) = self.job_listeners.get_mut(event.job_id()) {
            listeners.retain(|_, tx| tx.send(event.clone()).is_ok());
        }
        if let Some(listeners) = self.session_listeners.get_mut(event.session_id()) {
            listeners.retain(|_, tx| tx.send(event.clone()).is_ok());
        }
        self.global_listeners
            .retain(|_, tx| tx.send(event.clone()).is_ok());
    }
}

/// Fan-out hub for job progress.
///
/// Cloning is cheap; all clones share the same listener registry.
#[derive(Clone)]
pub struct ProgressBroadcaster {
    inner: Arc<RwLock<Inner>>,
    success_grace: Duration,
    failure_grace: Duration,
}

impl Default for ProgressBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_SUCCESS_GRACE, DEFAULT_FAILURE_GRACE)
    }
}

impl ProgressBroadcaster {
    pub fn new(success_grace: Duration, failure_grace: Duration) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            success_grace,
            failure_grace,
        }
    }

    /// Record and broadcast a progress update. Percentage is clamped
    /// to [0, 100]; updates for jobs already in a terminal state are
    /// dropped.
    pub async fn update(
        &self,
        job_id: &str,
        session_id: &str,
        percentage: f32,
        current_step: &str,
        eta_seconds: Option<u64>,
    ) {
        let snapshot = ProgressSnapshot {
            percentage: percentage.clamp(0.0, 100.0),
            current_step: current_step.to_string(),
            eta_seconds,
            updated_at: Utc::now(),
        };

        let mut inner = self.inner.write().await;
        match inner.jobs.get_mut(job_id) {
            Some(existing) if existing.terminal => {
                debug!(job_id, "Dropping progress update for terminal job");
                return;
            }
            Some(existing) => existing.snapshot = snapshot.clone(),
            None => {
                inner.jobs.insert(
                    job_id.to_string(),
                    JobProgress {
                        session_id: session_id.to_string(),
                        snapshot: snapshot.clone(),
                        terminal: false,
                    },
                );
            }
        }

        inner.dispatch(&ProgressEvent::JobProgress {
            job_id: job_id.to_string(),
            session_id: session_id.to_string(),
            snapshot,
        });
    }

    /// Mark a job finished. The snapshot jumps to 100% and the entry
    /// is cleaned up after the success grace period.
    pub async fn complete(&self, job_id: &str, session_id: &str, result_key: Option<String>) {
        self.finish(
            job_id,
            session_id,
            ProgressEvent::JobCompleted {
                job_id: job_id.to_string(),
                session_id: session_id.to_string(),
                result_key,
            },
            100.0,
            "completed",
            self.success_grace,
        )
        .await;
    }

    /// Mark a job failed. The last percentage is kept and the entry is
    /// cleaned up after the (longer) failure grace period.
    pub async fn fail(&self, job_id: &str, session_id: &str, error: &str) {
        let last_pct = {
            let inner = self.inner.read().await;
            inner
                .jobs
                .get(job_id)
                .map(|j| j.snapshot.percentage)
                .unwrap_or(0.0)
        };
        self.finish(
            job_id,
            session_id,
            ProgressEvent::JobFailed {
                job_id: job_id.to_string(),
                session_id: session_id.to_string(),
                error: error.to_string(),
            },
            last_pct,
            "failed",
            self.failure_grace,
        )
        .await;
    }

    async fn finish(
        &self,
        job_id: &str,
        session_id: &str,
        event: ProgressEvent,
        percentage: f32,
        step: &str,
        grace: Duration,
    ) {
        let mut inner = self.inner.write().await;
        inner.jobs.insert(
            job_id.to_string(),
            JobProgress {
                session_id: session_id.to_string(),
                snapshot: ProgressSnapshot {
                    percentage,
                    current_step: step.to_string(),
                    eta_seconds: None,
                    updated_at: Utc::now(),
                },
                terminal: true,
            },
        );
        inner.dispatch(&event);
        drop(inner);

        let this = self.clone();
        let job_id = job_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let mut inner = this.inner.write().await;
            inner.jobs.remove(&job_id);
            inner.job_listeners.remove(&job_id);
        });
    }

    pub async fn snapshot(&self, job_id: &str) -> Option<ProgressSnapshot> {
        self.inner
            .read()
            .await
            .jobs
            .get(job_id)
            .map(|j| j.snapshot.clone())
    }

    /// Aggregate across a session's non-terminal jobs. Returns `None`
    /// when the session has no live jobs at all.
    pub async fn session_progress(&self, session_id: &str) -> Option<SessionProgress> {
        let inner = self.inner.read().await;
        let live: Vec<&JobProgress> = inner
            .jobs
            .values()
            .filter(|j| j.session_id == session_id && !j.terminal)
            .collect();
        if live.is_empty() {
            return None;
        }

        let sum: f32 = live.iter().map(|j| j.snapshot.percentage).sum();
        let eta_seconds = live.iter().filter_map(|j| j.snapshot.eta_seconds).max();
        Some(SessionProgress {
            session_id: session_id.to_string(),
            percentage: sum / live.len() as f32,
            eta_seconds,
            active_jobs: live.len(),
        })
    }

    pub async fn subscribe_job(
        &self,
        job_id: &str,
    ) -> (ListenerId, UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.write().await;
        let id = inner.next_id();
        inner
            .job_listeners
            .entry(job_id.to_string())
            .or_default()
            .insert(id, tx);
        (id, rx)
    }

    pub async fn subscribe_session(
        &self,
        session_id: &str,
    ) -> (ListenerId, UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.write().await;
        let id = inner.next_id();
        inner
            .session_listeners
            .entry(session_id.to_string())
            .or_default()
            .insert(id, tx);
        (id, rx)
    }

    pub async fn subscribe_global(&self) -> (ListenerId, UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.write().await;
        let id = inner.next_id();
        inner.global_listeners.insert(id, tx);
        (id, rx)
    }

    pub async fn unsubscribe(&self, id: ListenerId) {
        let mut inner = self.inner.write().await;
        inner.global_listeners.remove(&id);
        for listeners in inner.job_listeners.values_mut() {
            listeners.remove(&id);
        }
        for listeners in inner.session_listeners.values_mut() {
            listeners.remove(&id);
        }
        inner.job_listeners.retain(|_, l| !l.is_empty());
        inner.session_listeners.retain(|_, l| !l.is_empty());
    }

    #[cfg(test)]
    async fn listener_count(&self) -> usize {
        let inner = self.inner.read().await;
        inner.global_listeners.len()
            + inner.job_listeners.values().map(|l| l.len()).sum::<usize>()
            + inner
                .session_listeners
                .values()
                .map(|l| l.len())
                .sum::<usize>()
    }
}
