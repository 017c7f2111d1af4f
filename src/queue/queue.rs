use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::convert::{ConversionError, ConversionErrorKind, ConversionExecutor, ConversionRequest, ProgressHook};
use crate::observability::Metrics;
use crate::progress::ProgressBroadcaster;
use crate::recovery::{classify, recovery_adjustment, retry_delay, should_retry, user_message};
use crate::session::SessionTracker;
use crate::storage::{StorageClient, StorageError};
use crate::store::MediaStore;

use super::error::QueueError;
use super::job::{ConversionJob, JobSpec, JobStatus};

/// One pending queue slot. Ordering key is `(priority, seq)`; `seq` is
/// a monotonic submission counter, so equal priorities stay FIFO.
#[derive(Debug, Clone)]
struct PendingEntry {
    priority: u8,
    seq: u64,
    job_id: String,
}

#[derive(Default)]
struct QueueState {
    jobs: HashMap<String, ConversionJob>,
    pending: Vec<PendingEntry>,
    active: HashSet<String>,
    next_seq: u64,
}

impl QueueState {
    fn insert_pending(&mut self, priority: u8, job_id: String) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let entry = PendingEntry {
            priority,
            seq,
            job_id,
        };
        let at = self
            .pending
            .partition_point(|e| (e.priority, e.seq) <= (entry.priority, entry.seq));
        self.pending.insert(at, entry);
    }

    /// Pop the best pending entry whose job is still actually pending.
    /// Entries for removed or already-transitioned jobs are discarded
    /// lazily here instead of eagerly on every mutation.
    fn take_next_pending(&mut self) -> Option<String> {
        while !self.pending.is_empty() {
            let entry = self.pending.remove(0);
            match self.jobs.get(&entry.job_id) {
                Some(job) if job.status == JobStatus::Pending => return Some(entry.job_id),
                _ => debug!(job_id = %entry.job_id, "Discarding stale queue entry"),
            }
        }
        None
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QueueStats {
    pub pending: usize,
    pub active: usize,
}

struct QueueInner {
    state: Mutex<QueueState>,
    executor: Arc<dyn ConversionExecutor>,
    broadcaster: ProgressBroadcaster,
    sessions: Arc<SessionTracker>,
    store: Arc<MediaStore>,
    storage: Arc<StorageClient>,
    metrics: Arc<Metrics>,
    max_concurrent: usize,
    max_attempts: u32,
}

/// Bounded-concurrency priority queue over conversion jobs.
///
/// Cloning is cheap; all clones share one scheduler.
#[derive(Clone)]
pub struct ConversionQueue {
    inner: Arc<QueueInner>,
}

impl ConversionQueue {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &QueueConfig,
        executor: Arc<dyn ConversionExecutor>,
        broadcaster: ProgressBroadcaster,
        sessions: Arc<SessionTracker>,
        store: Arc<MediaStore>,
        storage: Arc<StorageClient>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState::default()),
                executor,
                broadcaster,
                sessions,
                store,
                storage,
                metrics,
                max_concurrent: config.max_concurrent.max(1),
                max_attempts: config.max_retry_attempts,
            }),
        }
    }

    /// Accept a job: persist it, slot it into the pending order, and
    /// kick the scheduler. Returns immediately; processing happens on
    /// spawned tasks.
    pub async fn add_job(&self, spec: JobSpec) -> Result<ConversionJob, QueueError> {
        let job = ConversionJob::new(spec);
        self.inner.store.create_job_record(&job)?;

        {
            let mut state = self.inner.state.lock().await;
            state.insert_pending(job.priority, job.job_id.clone());
            state.jobs.insert(job.job_id.clone(), job.clone());
        }
        info!(
            job_id = %job.job_id,
            session_id = %job.session_id,
            priority = job.priority,
            output = %job.output_format,
            "Job enqueued"
        );

        let this = self.clone();
        tokio::spawn(async move { this.process_next_jobs().await });

        Ok(job)
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<ConversionJob>, QueueError> {
        if let Some(job) = self.inner.state.lock().await.jobs.get(job_id) {
            return Ok(Some(job.clone()));
        }
        Ok(self.inner.store.get_job(job_id)?)
    }

    /// Apply a status transition, enforcing the legal lifecycle:
    /// Pending -> Processing -> Completed | Failed, plus Pending ->
    /// Failed for pre-start rejection.
    pub async fn update_job_status(
        &self,
        job_id: &str,
        to: JobStatus,
    ) -> Result<ConversionJob, QueueError> {
        let mut state = self.inner.state.lock().await;
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))?;

        let legal = matches!(
            (job.status, to),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Pending, JobStatus::Failed)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
        );
        if !legal {
            return Err(QueueError::IllegalTransition {
                job_id: job_id.to_string(),
                from: job.status,
                to,
            });
        }

        job.status = to;
        match to {
            JobStatus::Processing => job.started_at = Some(Utc::now()),
            JobStatus::Completed | JobStatus::Failed => job.completed_at = Some(Utc::now()),
            JobStatus::Pending => {}
        }
        let snapshot = job.clone();

        match to {
            JobStatus::Processing => {
                state.active.insert(job_id.to_string());
            }
            JobStatus::Completed | JobStatus::Failed => {
                state.active.remove(job_id);
            }
            JobStatus::Pending => {}
        }

        self.inner.store.update_job_record(&snapshot)?;

        // A terminal transition from outside the worker loop frees a
        // slot; backfill it.
        if to.is_terminal() {
            let this = self.clone();
            tokio::spawn(async move { this.process_next_jobs().await });
        }

        Ok(snapshot)
    }

    /// Remove a job that has not started. Processing jobs cannot be
    /// removed (no preemption); terminal jobs are removed along with
    /// their record.
    pub async fn remove_job(&self, job_id: &str) -> Result<ConversionJob, QueueError> {
        let mut state = self.inner.state.lock().await;
        let job = state
            .jobs
            .get(job_id)
            .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))?;

        if job.status == JobStatus::Processing {
            return Err(QueueError::JobProcessing(job_id.to_string()));
        }

        let job = state
            .jobs
            .remove(job_id)
            .expect("checked present above");
        state.pending.retain(|e| e.job_id != job_id);
        self.inner.store.delete_job_record(job_id)?;
        info!(job_id, "Job removed");
        Ok(job)
    }

    /// Change a pending job's priority, preserving its original
    /// submission order among its new peers.
    pub async fn update_job_priority(
        &self,
        job_id: &str,
        priority: u8,
    ) -> Result<ConversionJob, QueueError> {
        let mut state = self.inner.state.lock().await;
        let job = state
            .jobs
            .get(job_id)
            .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))?;

        match job.status {
            JobStatus::Processing => return Err(QueueError::JobProcessing(job_id.to_string())),
            JobStatus::Completed | JobStatus::Failed => {
                return Err(QueueError::JobFinished(job_id.to_string()))
            }
            JobStatus::Pending => {}
        }

        let pos = state
            .pending
            .iter()
            .position(|e| e.job_id == job_id)
            .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))?;
        let mut entry = state.pending.remove(pos);
        entry.priority = priority;
        let at = state
            .pending
            .partition_point(|e| (e.priority, e.seq) <= (entry.priority, entry.seq));
        state.pending.insert(at, entry);

        let job = state
            .jobs
            .get_mut(job_id)
            .expect("checked present above");
        job.priority = priority;
        let snapshot = job.clone();
        self.inner.store.update_job_record(&snapshot)?;
        debug!(job_id, priority, "Job priority updated");
        Ok(snapshot)
    }

    /// Sum of pending work divided by the usable worker slots.
    pub async fn estimated_processing_time(&self) -> Duration {
        let state = self.inner.state.lock().await;
        let pending_jobs: Vec<&ConversionJob> = state
            .pending
            .iter()
            .filter_map(|e| state.jobs.get(&e.job_id))
            .filter(|j| j.status == JobStatus::Pending)
            .collect();

        if pending_jobs.is_empty() {
            return Duration::ZERO;
        }

        let total: f64 = pending_jobs.iter().map(|j| j.estimated_seconds()).sum();
        let slots = self.inner.max_concurrent.min(pending_jobs.len()).max(1);
        Duration::from_secs_f64(total / slots as f64)
    }

    /// Drop every pending job of a session (used on cancel). Running
    /// jobs finish on their own.
    pub async fn remove_session_jobs(&self, session_id: &str) -> Result<usize, QueueError> {
        let mut state = self.inner.state.lock().await;
        let doomed: Vec<String> = state
            .jobs
            .values()
            .filter(|j| j.session_id == session_id && j.status == JobStatus::Pending)
            .map(|j| j.job_id.clone())
            .collect();

        for job_id in &doomed {
            state.jobs.remove(job_id);
            state.pending.retain(|e| &e.job_id != job_id);
            self.inner.store.delete_job_record(job_id)?;
        }
        if !doomed.is_empty() {
            info!(session_id, count = doomed.len(), "Pending session jobs swept");
        }
        Ok(doomed.len())
    }

    pub async fn stats(&self) -> QueueStats {
        let state = self.inner.state.lock().await;
        QueueStats {
            pending: state.pending.len(),
            active: state.active.len(),
        }
    }

    /// Promote pending jobs into the free worker slots. Each claimed
    /// job gets its own worker task; workers pull further work
    /// themselves when they finish, so this returns as soon as every
    /// slot is either busy or there is nothing left to start.
    pub async fn process_next_jobs(&self) {
        while let Some(job) = self.claim_next().await {
            let this = self.clone();
            tokio::spawn(async move { this.worker_loop(job).await });
        }
    }

    /// Take the best pending job and mark it running, if a slot is
    /// free.
    async fn claim_next(&self) -> Option<ConversionJob> {
        let job = {
            let mut state = self.inner.state.lock().await;
            if state.active.len() >= self.inner.max_concurrent {
                return None;
            }
            let job_id = state.take_next_pending()?;
            let job = state
                .jobs
                .get_mut(&job_id)
                .expect("take_next_pending checked presence");
            job.status = JobStatus::Processing;
            job.started_at = Some(Utc::now());
            let snapshot = job.clone();
            state.active.insert(job_id);
            snapshot
        };

        if let Err(e) = self.inner.store.update_job_record(&job) {
            warn!(job_id = %job.job_id, error = %e, "Failed to persist job start");
        }
        info!(job_id = %job.job_id, priority = job.priority, "Job started");
        Some(job)
    }

    /// Run claimed jobs to their terminal states until no pending work
    /// or free slot remains for this worker.
    async fn worker_loop(&self, mut job: ConversionJob) {
        loop {
            self.run_job(job).await;
            match self.claim_next().await {
                Some(next) => job = next,
                None => return,
            }
        }
    }

    /// Drive one job to a terminal state.
    async fn run_job(&self, mut job: ConversionJob) {
        let outcome = self.execute_with_retries(&mut job).await;

        {
            let mut state = self.inner.state.lock().await;
            state.active.remove(&job.job_id);
            match &outcome {
                Ok(result_key) => {
                    job.status = JobStatus::Completed;
                    job.result_key = Some(result_key.clone());
                }
                Err(message) => {
                    job.status = JobStatus::Failed;
                    job.error = Some(message.clone());
                }
            }
            job.completed_at = Some(Utc::now());
            state.jobs.insert(job.job_id.clone(), job.clone());
        }
        if let Err(e) = self.inner.store.update_job_record(&job) {
            warn!(job_id = %job.job_id, error = %e, "Failed to persist terminal job state");
        }

        match outcome {
            Ok(result_key) => {
                info!(job_id = %job.job_id, attempts = job.attempts, "Job completed");
                self.inner.metrics.job_completed();
                self.inner
                    .broadcaster
                    .complete(&job.job_id, &job.session_id, Some(result_key))
                    .await;
                if let Err(e) = self
                    .inner
                    .sessions
                    .mark_completed(&job.session_id, &job.file_id, job.input_size)
                    .await
                {
                    warn!(job_id = %job.job_id, error = %e, "Session completion mark failed");
                }
            }
            Err(message) => {
                warn!(job_id = %job.job_id, attempts = job.attempts, error = %message, "Job failed");
                self.inner.metrics.job_failed();
                self.inner
                    .broadcaster
                    .fail(&job.job_id, &job.session_id, &message)
                    .await;
                if let Err(e) = self
                    .inner
                    .sessions
                    .mark_failed(&job.session_id, &job.file_id)
                    .await
                {
                    warn!(job_id = %job.job_id, error = %e, "Session failure mark failed");
                }
            }
        }
    }

    /// The attempt loop: convert, classify failures, apply at most one
    /// safe-parameter resume, retry with backoff while the policy
    /// allows. Returns the result key or the user-facing error.
    async fn execute_with_retries(&self, job: &mut ConversionJob) -> Result<String, String> {
        let mut options = job.options.clone();

        loop {
            job.attempts += 1;
            if let Err(e) = self.inner.store.update_job_record(job) {
                warn!(job_id = %job.job_id, error = %e, "Failed to persist attempt count");
            }

            let error = match self.attempt_once(job, options.clone()).await {
                Ok(result_key) => return Ok(result_key),
                Err(error) => error,
            };

            let classified = classify(&error);
            warn!(
                job_id = %job.job_id,
                attempt = job.attempts,
                kind = ?classified.kind,
                category = ?classified.category,
                error = %error,
                "Conversion attempt failed"
            );

            if !job.recovery_applied {
                if let Some(adjusted) = recovery_adjustment(error.kind, &options) {
                    info!(
                        job_id = %job.job_id,
                        kind = ?error.kind,
                        "Resuming with safe parameters"
                    );
                    job.recovery_applied = true;
                    job.options = adjusted.clone();
                    options = adjusted;
                    continue;
                }
            }

            if should_retry(&classified, job.attempts, self.inner.max_attempts) {
                self.inner.metrics.retry();
                let delay = retry_delay(job.attempts);
                debug!(
                    job_id = %job.job_id,
                    attempt = job.attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying after backoff"
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            return Err(user_message(&classified).to_string());
        }
    }

    /// One conversion attempt: fetch input, run the executor with a
    /// progress hook wired to the broadcaster, store the output.
    async fn attempt_once(
        &self,
        job: &ConversionJob,
        options: crate::convert::ConversionOptions,
    ) -> Result<String, ConversionError> {
        let input = self
            .inner
            .storage
            .download(&job.input_key)
            .await
            .map_err(|e| match e {
                StorageError::NotFound(key) => ConversionError::new(
                    ConversionErrorKind::CorruptInput,
                    format!("input missing from storage: {key}"),
                ),
                other => ConversionError::new(
                    ConversionErrorKind::NetworkUnavailable,
                    format!("input fetch failed: {other}"),
                ),
            })?;

        let request = ConversionRequest {
            input,
            input_format: job.input_format,
            output_format: job.output_format,
            options,
        };

        let hook = self.progress_hook(job);
        let output = self.inner.executor.convert(request, hook).await?;

        let result_key = StorageClient::output_key_for(&job.job_id, output.output_format);
        self.inner
            .storage
            .upload(&result_key, output.output)
            .await
            .map_err(|e| {
                ConversionError::new(
                    ConversionErrorKind::NetworkUnavailable,
                    format!("output store failed: {e}"),
                )
            })?;

        Ok(result_key)
    }

    /// Executor callbacks arrive on the executor's task; forward them
    /// to the broadcaster without blocking it.
    fn progress_hook(&self, job: &ConversionJob) -> ProgressHook {
        let broadcaster = self.inner.broadcaster.clone();
        let job_id = job.job_id.clone();
        let session_id = job.session_id.clone();
        let estimate = job.estimated_seconds();

        Arc::new(move |percentage, step| {
            let broadcaster = broadcaster.clone();
            let job_id = job_id.clone();
            let session_id = session_id.clone();
            let step = step.to_string();
            let eta_seconds = if percentage > 0.0 && percentage < 100.0 {
                Some((estimate * f64::from(100.0 - percentage) / 100.0).ceil() as u64)
            } else {
                None
            };
            tokio::spawn(async move {
                broadcaster
                    .update(&job_id, &session_id, percentage, &step, eta_seconds)
                    .await;
            });
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::{ConversionOptions, ConversionOutput, MediaFormat};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;
    use tokio::sync::Semaphore;

    struct Harness {
        queue: ConversionQueue,
        sessions: Arc<SessionTracker>,
        storage: Arc<StorageClient>,
        metrics: Arc<Metrics>,
        _temp: TempDir,
    }

    fn harness(executor: Arc<dyn ConversionExecutor>, max_concurrent: usize) -> Harness {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(MediaStore::open(temp.path().join("store")).unwrap());
        let sessions = Arc::new(SessionTracker::new(store.clone()));
        let storage = Arc::new(StorageClient::in_memory());
        let metrics = Arc::new(Metrics::new());
        let config = QueueConfig {
            max_concurrent,
            max_retry_attempts: 3,
        };
        let queue = ConversionQueue::new(
            &config,
            executor,
            ProgressBroadcaster::default(),
            sessions.clone(),
            store,
            storage.clone(),
            metrics.clone(),
        );
        Harness {
            queue,
            sessions,
            storage,
            metrics,
            _temp: temp,
        }
    }

    /// Records the first input byte of each conversion, in order.
    #[derive(Default)]
    struct RecordingExecutor {
        order: StdMutex<Vec<u8>>,
    }

    #[async_trait]
    impl ConversionExecutor for RecordingExecutor {
        async fn convert(
            &self,
            request: ConversionRequest,
            _progress: ProgressHook,
        ) -> Result<ConversionOutput, ConversionError> {
            self.order.lock().unwrap().push(request.input[0]);
            Ok(ConversionOutput {
                output: request.input,
                output_format: request.output_format,
                duration_secs: None,
                sample_rate_hz: None,
            })
        }
    }

    /// Waits for a permit before finishing each conversion.
    struct GatedExecutor {
        gate: Semaphore,
        order: StdMutex<Vec<u8>>,
        current: AtomicUsize,
        max_seen: AtomicUsize,
    }

    impl GatedExecutor {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                gate: Semaphore::new(0),
                order: StdMutex::new(Vec::new()),
                current: AtomicUsize::new(0),
                max_seen: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ConversionExecutor for GatedExecutor {
        async fn convert(
            &self,
            request: ConversionRequest,
            _progress: ProgressHook,
        ) -> Result<ConversionOutput, ConversionError> {
            let running = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(running, Ordering::SeqCst);
            self.order.lock().unwrap().push(request.input[0]);

            let permit = self.gate.acquire().await.map_err(|_| {
                ConversionError::new(ConversionErrorKind::Unknown, "gate closed")
            })?;
            permit.forget();

            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(ConversionOutput {
                output: request.input,
                output_format: request.output_format,
                duration_secs: None,
                sample_rate_hz: None,
            })
        }
    }

    /// Fails with scripted errors, then succeeds. Records the bitrate
    /// each attempt arrived with.
    struct ScriptedFailures {
        errors: StdMutex<VecDeque<ConversionError>>,
        bitrates_seen: StdMutex<Vec<Option<u32>>>,
    }

    impl ScriptedFailures {
        fn new(errors: Vec<ConversionError>) -> Arc<Self> {
            Arc::new(Self {
                errors: StdMutex::new(errors.into()),
                bitrates_seen: StdMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ConversionExecutor for ScriptedFailures {
        async fn convert(
            &self,
            request: ConversionRequest,
            _progress: ProgressHook,
        ) -> Result<ConversionOutput, ConversionError> {
            self.bitrates_seen
                .lock()
                .unwrap()
                .push(request.options.bitrate_kbps);
            if let Some(error) = self.errors.lock().unwrap().pop_front() {
                return Err(error);
            }
            Ok(ConversionOutput {
                output: request.input,
                output_format: request.output_format,
                duration_secs: None,
                sample_rate_hz: None,
            })
        }
    }

    async fn seeded_session(h: &Harness, files: usize) -> String {
        let session = h.sessions.create_or_get(None).await.unwrap();
        let sizes = vec![4u64; files];
        h.sessions
            .register_files(&session.session_id, &sizes)
            .await
            .unwrap();
        session.session_id
    }

    async fn spec_with_marker(h: &Harness, session_id: &str, marker: u8, priority: u8) -> JobSpec {
        let file_id = format!("f{marker}");
        let key = StorageClient::upload_key_for(session_id, &file_id, "in.wav");
        h.storage
            .upload(&key, Bytes::from(vec![marker, 0, 0, 0]))
            .await
            .unwrap();
        JobSpec {
            session_id: session_id.to_string(),
            file_id,
            filename: "in.wav".to_string(),
            input_key: key,
            input_size: 4,
            input_format: MediaFormat::Wav,
            output_format: MediaFormat::Mp3,
            options: ConversionOptions::default(),
            priority,
        }
    }

    async fn wait_until_terminal(queue: &ConversionQueue, job_ids: &[String]) {
        for _ in 0..500 {
            let mut done = true;
            for id in job_ids {
                let job = queue.get_job(id).await.unwrap().unwrap();
                if !job.status.is_terminal() {
                    done = false;
                    break;
                }
            }
            if done {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("jobs did not settle");
    }

    #[tokio::test(start_paused = true)]
    async fn lower_priority_value_runs_first() {
        // Three jobs land before the single worker slot wakes up; the
        // priority-1 job must be picked first regardless of submission
        // order.
        let executor = Arc::new(RecordingExecutor::default());
        let h = harness(executor.clone(), 1);
        let session_id = seeded_session(&h, 3).await;

        // Prepare inputs up front so the submissions themselves never
        // yield to the scheduler.
        let mut specs = Vec::new();
        for (marker, priority) in [(5u8, 5u8), (1, 1), (3, 3)] {
            specs.push(spec_with_marker(&h, &session_id, marker, priority).await);
        }
        let mut ids = Vec::new();
        for spec in specs {
            ids.push(h.queue.add_job(spec).await.unwrap().job_id);
        }

        wait_until_terminal(&h.queue, &ids).await;
        assert_eq!(*executor.order.lock().unwrap(), vec![1, 3, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn equal_priority_is_fifo() {
        let executor = Arc::new(RecordingExecutor::default());
        let h = harness(executor.clone(), 1);
        let session_id = seeded_session(&h, 3).await;

        let mut specs = Vec::new();
        for marker in [7u8, 8, 9] {
            specs.push(spec_with_marker(&h, &session_id, marker, 5).await);
        }
        let mut ids = Vec::new();
        for spec in specs {
            ids.push(h.queue.add_job(spec).await.unwrap().job_id);
        }

        wait_until_terminal(&h.queue, &ids).await;
        assert_eq!(*executor.order.lock().unwrap(), vec![7, 8, 9]);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_never_exceeds_limit() {
        let executor = GatedExecutor::new();
        let h = harness(executor.clone(), 2);
        let session_id = seeded_session(&h, 5).await;

        let mut ids = Vec::new();
        for marker in 1u8..=5 {
            let spec = spec_with_marker(&h, &session_id, marker, 5).await;
            ids.push(h.queue.add_job(spec).await.unwrap().job_id);
        }

        // Let both slots fill, then release everything.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.queue.stats().await.active, 2);
        executor.gate.add_permits(5);

        wait_until_terminal(&h.queue, &ids).await;
        assert!(executor.max_seen.load(Ordering::SeqCst) <= 2);
        assert_eq!(h.metrics.snapshot().jobs_completed, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_failure_retries_then_succeeds() {
        let executor = ScriptedFailures::new(vec![ConversionError::new(
            ConversionErrorKind::Timeout,
            "codec stalled",
        )]);
        let h = harness(executor.clone(), 1);
        let session_id = seeded_session(&h, 1).await;

        let spec = spec_with_marker(&h, &session_id, 1, 5).await;
        let id = h.queue.add_job(spec).await.unwrap().job_id;
        wait_until_terminal(&h.queue, std::slice::from_ref(&id)).await;

        let job = h.queue.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts, 2);
        assert!(job.result_key.is_some());
        assert_eq!(h.metrics.snapshot().retries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_bitrate_recovers_with_safe_parameters() {
        let executor = ScriptedFailures::new(vec![ConversionError::new(
            ConversionErrorKind::InvalidBitrate,
            "bitrate 999 unsupported",
        )]);
        let h = harness(executor.clone(), 1);
        let session_id = seeded_session(&h, 1).await;

        let mut spec = spec_with_marker(&h, &session_id, 1, 5).await;
        spec.options.bitrate_kbps = Some(999);
        let id = h.queue.add_job(spec).await.unwrap().job_id;
        wait_until_terminal(&h.queue, std::slice::from_ref(&id)).await;

        let job = h.queue.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.recovery_applied);
        assert_eq!(job.options.bitrate_kbps, Some(128));
        assert_eq!(
            *executor.bitrates_seen.lock().unwrap(),
            vec![Some(999), Some(128)]
        );
        // A recovery resume is not a retry.
        assert_eq!(h.metrics.snapshot().retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn user_error_fails_without_retry() {
        let executor = ScriptedFailures::new(vec![
            ConversionError::new(ConversionErrorKind::UnsupportedFormat, "no codec"),
            ConversionError::new(ConversionErrorKind::UnsupportedFormat, "no codec"),
        ]);
        let h = harness(executor, 1);
        let session_id = seeded_session(&h, 1).await;

        let spec = spec_with_marker(&h, &session_id, 1, 5).await;
        let id = h.queue.add_job(spec).await.unwrap().job_id;
        wait_until_terminal(&h.queue, std::slice::from_ref(&id)).await;

        let job = h.queue.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 1);
        assert!(job.error.is_some());

        let session = h.sessions.get(&session_id).await.unwrap();
        assert_eq!(session.failed_files, 1);
        assert_eq!(h.metrics.snapshot().jobs_failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn processing_job_cannot_be_removed() {
        let executor = GatedExecutor::new();
        let h = harness(executor.clone(), 1);
        let session_id = seeded_session(&h, 1).await;

        let spec = spec_with_marker(&h, &session_id, 1, 5).await;
        let id = h.queue.add_job(spec).await.unwrap().job_id;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(matches!(
            h.queue.remove_job(&id).await,
            Err(QueueError::JobProcessing(_))
        ));

        executor.gate.add_permits(1);
        wait_until_terminal(&h.queue, std::slice::from_ref(&id)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn priority_update_reorders_pending() {
        let executor = GatedExecutor::new();
        let h = harness(executor.clone(), 1);
        let session_id = seeded_session(&h, 3).await;

        let blocker = spec_with_marker(&h, &session_id, 1, 0).await;
        let blocker_id = h.queue.add_job(blocker).await.unwrap().job_id;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let a = spec_with_marker(&h, &session_id, 2, 5).await;
        let a_id = h.queue.add_job(a).await.unwrap().job_id;
        let b = spec_with_marker(&h, &session_id, 3, 7).await;
        let b_id = h.queue.add_job(b).await.unwrap().job_id;

        h.queue.update_job_priority(&b_id, 1).await.unwrap();
        executor.gate.add_permits(3);

        wait_until_terminal(&h.queue, &[blocker_id, a_id.clone(), b_id.clone()]).await;
        assert_eq!(*executor.order.lock().unwrap(), vec![1, 3, 2]);

        // Terminal jobs reject further priority changes.
        assert!(matches!(
            h.queue.update_job_priority(&a_id, 2).await,
            Err(QueueError::JobFinished(_))
        ));
    }

    #[tokio::test]
    async fn estimate_divides_by_usable_slots() {
        const MB: u64 = 1024 * 1024;
        let h = harness(Arc::new(RecordingExecutor::default()), 2);
        let session_id = seeded_session(&h, 3).await;

        // Three 10 MB wav->mp3 jobs: 10s each, two slots => 15s.
        let mut specs = Vec::new();
        for marker in 1u8..=3 {
            let mut spec = spec_with_marker(&h, &session_id, marker, 5).await;
            spec.input_size = 10 * MB;
            specs.push(spec);
        }
        for spec in specs {
            h.queue.add_job(spec).await.unwrap();
        }

        let estimate = h.queue.estimated_processing_time().await;
        assert!((estimate.as_secs_f64() - 15.0).abs() < 0.001);
    }

    #[tokio::test]
    async fn empty_queue_estimates_zero() {
        let h = harness(Arc::new(RecordingExecutor::default()), 2);
        assert_eq!(h.queue.estimated_processing_time().await, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn session_sweep_drops_only_pending_jobs() {
        let executor = GatedExecutor::new();
        let h = harness(executor.clone(), 1);
        let session_id = seeded_session(&h, 3).await;

        let running = spec_with_marker(&h, &session_id, 1, 0).await;
        let running_id = h.queue.add_job(running).await.unwrap().job_id;
        tokio::time::sleep(Duration::from_millis(50)).await;

        for marker in [2u8, 3] {
            let spec = spec_with_marker(&h, &session_id, marker, 5).await;
            h.queue.add_job(spec).await.unwrap();
        }

        let swept = h.queue.remove_session_jobs(&session_id).await.unwrap();
        assert_eq!(swept, 2);
        assert_eq!(h.queue.stats().await.active, 1);

        executor.gate.add_permits(1);
        wait_until_terminal(&h.queue, std::slice::from_ref(&running_id)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn external_terminal_transition_backfills_slot() {
        let executor = GatedExecutor::new();
        let h = harness(executor.clone(), 1);
        let session_id = seeded_session(&h, 2).await;

        let stuck = spec_with_marker(&h, &session_id, 1, 0).await;
        let stuck_id = h.queue.add_job(stuck).await.unwrap().job_id;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let waiting = spec_with_marker(&h, &session_id, 2, 5).await;
        let waiting_id = h.queue.add_job(waiting).await.unwrap().job_id;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let waiting_job = h.queue.get_job(&waiting_id).await.unwrap().unwrap();
        assert_eq!(waiting_job.status, JobStatus::Pending);

        // An operator fails the stuck job from outside the worker loop;
        // the freed slot must pick up the waiting job without a new
        // submission.
        h.queue
            .update_job_status(&stuck_id, JobStatus::Failed)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let waiting_job = h.queue.get_job(&waiting_id).await.unwrap().unwrap();
        assert_eq!(waiting_job.status, JobStatus::Processing);

        executor.gate.add_permits(2);
        wait_until_terminal(&h.queue, std::slice::from_ref(&waiting_id)).await;
        let waiting_job = h.queue.get_job(&waiting_id).await.unwrap().unwrap();
        assert_eq!(waiting_job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn illegal_transition_is_rejected() {
        let h = harness(Arc::new(RecordingExecutor::default()), 1);
        let session_id = seeded_session(&h, 1).await;

        // Enqueue without yielding so the job is still pending.
        let spec = spec_with_marker(&h, &session_id, 1, 5).await;
        let id = h.queue.add_job(spec).await.unwrap().job_id;

        let err = h.queue.update_job_status(&id, JobStatus::Completed).await;
        assert!(matches!(err, Err(QueueError::IllegalTransition { .. })));
    }
}
