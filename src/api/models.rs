//! API models for soundbox upload and status endpoints.
//!
//! The external contract is deliberately small:
//! - `POST /uploads` ingests raw media bytes, described by
//!   `X-Soundbox-*` headers (filename, output format, optional session,
//!   optional priority).
//! - `POST /uploads/url` ingests a remote file described by
//!   [`UrlUploadRequest`].
//! - Both return [`UploadAccepted`]; an exact duplicate short-circuits
//!   with `skipped: true` and no job.
//! - `GET /sessions/{id}` returns [`SessionResponse`] with per-file
//!   job states and the live progress aggregate.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::convert::ConversionOptions;
use crate::dedup::{DuplicateCheckResult, RecommendedAction};
use crate::progress::SessionProgress;
use crate::queue::JobStatus;
use crate::session::Session;

/// JSON body for `POST /uploads/url`.
#[derive(Debug, Deserialize, Clone)]
pub struct UrlUploadRequest {
    pub url: String,
    /// Defaults to the last path segment of the URL.
    pub filename: Option<String>,
    pub output_format: String,
    pub session_id: Option<String>,
    pub priority: Option<u8>,
    #[serde(default)]
    pub options: ConversionOptions,
}

/// What the duplicate detector had to say about an accepted upload.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DuplicateSummary {
    pub recommended: String,
    pub reason: String,
    pub exact_matches: usize,
    pub similar_matches: usize,
    pub best_similarity: Option<f64>,
}

impl DuplicateSummary {
    pub fn from_check(check: &DuplicateCheckResult) -> Self {
        let recommended = match check.recommended {
            RecommendedAction::Skip => "skip",
            RecommendedAction::PromptUser => "prompt_user",
            RecommendedAction::KeepBoth => "keep_both",
        };
        Self {
            recommended: recommended.to_string(),
            reason: check.reason.clone(),
            exact_matches: check.exact_matches.len(),
            similar_matches: check.similar.len(),
            best_similarity: check.similar.first().map(|m| m.similarity.score),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct UploadAccepted {
    pub session_id: String,
    pub file_id: String,
    /// Absent when the upload was skipped as an exact duplicate.
    pub job_id: Option<String>,
    /// The name the file was stored under (may differ from the
    /// submitted name when a similar file already existed).
    pub stored_filename: String,
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicate: Option<DuplicateSummary>,
}

/// Per-file conversion state inside a session snapshot.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FileState {
    pub job_id: String,
    pub file_id: String,
    pub filename: String,
    pub status: JobStatus,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Clone)]
pub struct SessionResponse {
    #[serde(flatten)]
    pub session: Session,
    pub files: Vec<FileState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<SessionProgress>,
    /// Seconds of queued work remaining, divided across worker slots.
    pub estimated_seconds_remaining: u64,
    /// The same estimate as display text ("2m 30s").
    pub estimated_remaining_text: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CancelResponse {
    pub session_id: String,
    pub pending_jobs_removed: usize,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub components: HashMap<String, String>,
    pub version: String,
}
