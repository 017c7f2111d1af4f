use thiserror::Error;

use super::job::JobStatus;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("job {0} is currently processing")]
    JobProcessing(String),

    #[error("job {0} already finished")]
    JobFinished(String),

    #[error("job {job_id}: illegal transition {from:?} -> {to:?}")]
    IllegalTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}
