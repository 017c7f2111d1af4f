use std::path::Path;

use chrono::{Duration as ChronoDuration, Utc};
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle};
use tracing::{debug, info};

use crate::queue::job::ConversionJob;
use crate::session::Session;

use super::error::Result;
use super::keys::{
    encode_checksum_key, encode_checksum_prefix, encode_file_key, encode_job_key,
    encode_session_key, encode_size_bound, encode_size_key,
};
use super::StoredFile;

/// Fjall-backed persistent store for sessions, files, and jobs
#[derive(Clone)]
pub struct MediaStore {
    keyspace: Keyspace,
    sessions: PartitionHandle,
    files: PartitionHandle,
    jobs: PartitionHandle,
    checksum_idx: PartitionHandle,
    size_idx: PartitionHandle,
}

impl MediaStore {
    /// Open or create a store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening media store at: {}", path.display());

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let keyspace = Config::new(path).open()?;

        let sessions = keyspace.open_partition("sessions", PartitionCreateOptions::default())?;
        let files = keyspace.open_partition("files", PartitionCreateOptions::default())?;
        let jobs = keyspace.open_partition("jobs", PartitionCreateOptions::default())?;
        let checksum_idx =
            keyspace.open_partition("checksum_idx", PartitionCreateOptions::default())?;
        let size_idx = keyspace.open_partition("size_idx", PartitionCreateOptions::default())?;

        info!("Media store opened");
        Ok(Self {
            keyspace,
            sessions,
            files,
            jobs,
            checksum_idx,
            size_idx,
        })
    }

    pub fn create_session(&self, session: &Session) -> Result<()> {
        self.upsert_session(session)
    }

    /// Store or update a session record
    pub fn upsert_session(&self, session: &Session) -> Result<()> {
        let key = encode_session_key(&session.session_id);
        let value = serde_json::to_vec(session)?;
        self.sessions.insert(key, value)?;
        debug!(session_id = %session.session_id, "Upserted session");
        Ok(())
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        let key = encode_session_key(session_id);
        match self.sessions.get(key)? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    /// Persist a file record and both secondary index entries
    pub fn create_file_record(&self, file: &StoredFile) -> Result<()> {
        let value = serde_json::to_vec(file)?;
        self.files.insert(encode_file_key(&file.file_id), value)?;

        if !file.checksum.is_empty() {
            self.checksum_idx.insert(
                encode_checksum_key(&file.checksum, &file.file_id),
                file.file_id.as_bytes(),
            )?;
        }
        self.size_idx.insert(
            encode_size_key(file.size, &file.file_id),
            file.file_id.as_bytes(),
        )?;

        debug!(file_id = %file.file_id, size = file.size, "Created file record");
        Ok(())
    }

    pub fn get_file(&self, file_id: &str) -> Result<Option<StoredFile>> {
        let key = encode_file_key(file_id);
        match self.files.get(key)? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    /// All files whose content checksum matches exactly
    pub fn find_files_by_checksum(&self, checksum: &str) -> Result<Vec<StoredFile>> {
        if checksum.is_empty() {
            return Ok(Vec::new());
        }

        let mut results = Vec::new();
        for item in self.checksum_idx.prefix(encode_checksum_prefix(checksum)) {
            let (_, value) = item?;
            let file_id = String::from_utf8_lossy(&value).to_string();
            if let Some(file) = self.get_file(&file_id)? {
                results.push(file);
            }
        }
        Ok(results)
    }

    /// All files with size in `[min, max]`, scanned via the size index
    pub fn find_files_by_size_range(&self, min: u64, max: u64) -> Result<Vec<StoredFile>> {
        let lo = encode_size_bound(min);
        let hi = encode_size_bound(max.saturating_add(1));

        let mut results = Vec::new();
        for item in self.size_idx.range(lo..hi) {
            let (_, value) = item?;
            let file_id = String::from_utf8_lossy(&value).to_string();
            if let Some(file) = self.get_file(&file_id)? {
                results.push(file);
            }
        }
        Ok(results)
    }

    pub fn create_job_record(&self, job: &ConversionJob) -> Result<()> {
        self.upsert_job(job)
    }

    pub fn update_job_record(&self, job: &ConversionJob) -> Result<()> {
        self.upsert_job(job)
    }

    fn upsert_job(&self, job: &ConversionJob) -> Result<()> {
        let key = encode_job_key(&job.job_id);
        let value = serde_json::to_vec(job)?;
        self.jobs.insert(key, value)?;
        debug!(job_id = %job.job_id, status = ?job.status, "Upserted job record");
        Ok(())
    }

    pub fn get_job(&self, job_id: &str) -> Result<Option<ConversionJob>> {
        let key = encode_job_key(job_id);
        match self.jobs.get(key)? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    pub fn delete_job_record(&self, job_id: &str) -> Result<()> {
        self.jobs.remove(encode_job_key(job_id))?;
        debug!(job_id, "Deleted job record");
        Ok(())
    }

    /// Jobs belonging to one session. Full partition scan; session job
    /// counts are tens, not thousands.
    pub fn list_jobs_for_session(&self, session_id: &str) -> Result<Vec<ConversionJob>> {
        let mut results = Vec::new();
        for item in self.jobs.iter() {
            let (_, value) = item?;
            let job: ConversionJob = serde_json::from_slice(&value)?;
            if job.session_id == session_id {
                results.push(job);
            }
        }
        Ok(results)
    }

    /// Remove terminal sessions and jobs older than their TTLs
    pub fn prune_expired(&self, session_ttl_days: u32, job_ttl_days: u32) -> Result<PruneStats> {
        let now = Utc::now();
        let session_cutoff = now - ChronoDuration::days(i64::from(session_ttl_days));
        let job_cutoff = now - ChronoDuration::days(i64::from(job_ttl_days));

        let mut stats = PruneStats::default();

        let mut expired_sessions = Vec::new();
        for item in self.sessions.iter() {
            let (key, value) = item?;
            let session: Session = serde_json::from_slice(&value)?;
            if session.status.is_terminal()
                && session.completed_at.is_some_and(|t| t < session_cutoff)
            {
                expired_sessions.push(key.to_vec());
            }
        }
        for key in expired_sessions {
            self.sessions.remove(key)?;
            stats.sessions_removed += 1;
        }

        let mut expired_jobs = Vec::new();
        for item in self.jobs.iter() {
            let (key, value) = item?;
            let job: ConversionJob = serde_json::from_slice(&value)?;
            if job.status.is_terminal() && job.completed_at.is_some_and(|t| t < job_cutoff) {
                expired_jobs.push(key.to_vec());
            }
        }
        for key in expired_jobs {
            self.jobs.remove(key)?;
            stats.jobs_removed += 1;
        }

        info!(
            sessions = stats.sessions_removed,
            jobs = stats.jobs_removed,
            "Prune completed"
        );
        Ok(stats)
    }

    /// Persist all pending writes to disk
    pub fn persist(&self) -> Result<()> {
        self.keyspace.persist(fjall::PersistMode::SyncAll)?;
        Ok(())
    }

    /// Record counts (for debugging/monitoring)
    pub fn stats(&self) -> Result<StoreStats> {
        let mut session_count = 0;
        let mut file_count = 0;
        let mut job_count = 0;

        for item in self.sessions.iter() {
            item?;
            session_count += 1;
        }
        for item in self.files.iter() {
            item?;
            file_count += 1;
        }
        for item in self.jobs.iter() {
            item?;
            job_count += 1;
        }

        Ok(StoreStats {
            session_count,
            file_count,
            job_count,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct PruneStats {
    pub sessions_removed: usize,
    pub jobs_removed: usize,
}

#[derive(Debug, Clone)]
pub struct StoreStats {
    pub session_count: usize,
    pub file_count: usize,
    pub job_count: usize,
}
