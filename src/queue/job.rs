use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::convert::{ConversionOptions, MediaFormat};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Everything the caller decides about a job; the queue fills in the
/// rest.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub session_id: String,
    pub file_id: String,
    pub filename: String,
    pub input_key: String,
    pub input_size: u64,
    pub input_format: MediaFormat,
    pub output_format: MediaFormat,
    pub options: ConversionOptions,
    pub priority: u8,
}

/// One unit of conversion work, persisted across its whole lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionJob {
    pub job_id: String,
    pub session_id: String,
    pub file_id: String,
    pub filename: String,
    pub input_key: String,
    pub input_size: u64,
    pub input_format: MediaFormat,
    pub output_format: MediaFormat,
    pub options: ConversionOptions,
    pub priority: u8,
    pub status: JobStatus,
    pub attempts: u32,
    pub recovery_applied: bool,
    pub result_key: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ConversionJob {
    /// UUIDv7 job ids sort by creation time, which keeps store scans in
    /// submission order.
    pub fn new(spec: JobSpec) -> Self {
        Self {
            job_id: Uuid::now_v7().to_string(),
            session_id: spec.session_id,
            file_id: spec.file_id,
            filename: spec.filename,
            input_key: spec.input_key,
            input_size: spec.input_size,
            input_format: spec.input_format,
            output_format: spec.output_format,
            options: spec.options,
            priority: spec.priority,
            status: JobStatus::Pending,
            attempts: 0,
            recovery_applied: false,
            result_key: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Rough wall-clock estimate: file size in MB scaled by how much
    /// work the format pair implies. Re-encoding lossy sources costs
    /// the most; lossless-to-lossless is little more than a remux.
    pub fn estimated_seconds(&self) -> f64 {
        let size_mb = self.input_size as f64 / (1024.0 * 1024.0);
        let multiplier = match (
            self.input_format.is_lossless(),
            self.output_format.is_lossless(),
        ) {
            (true, true) => 0.5,
            (true, false) => 1.0,
            (false, true) => 1.5,
            (false, false) => 2.0,
        };
        size_mb * multiplier
    }
}
