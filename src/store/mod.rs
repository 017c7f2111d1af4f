//! Fjall-backed persistence for sessions, file records, and job records
//!
//! This is the durable collaborator behind the orchestration core. All
//! values are JSON-encoded; partitions:
//! - `sessions`: sess:{session_id} -> Session
//! - `files`: file:{file_id} -> StoredFile
//! - `jobs`: job:{job_id} -> ConversionJob
//! - `checksum_idx`: ck:{checksum}:{file_id} -> file_id
//! - `size_idx`: {size:020}:{file_id} -> file_id (lexicographic == numeric)

mod error;
mod keys;
mod store;

pub use error::{Result, StoreError};
pub use store::{MediaStore, PruneStats, StoreStats};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Persisted record of one accepted upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredFile {
    pub file_id: String,
    pub session_id: String,
    pub filename: String,
    pub size: u64,
    pub checksum: String,
    pub content_type: Option<String>,
    pub storage_key: String,
    pub created_at: DateTime<Utc>,
}
