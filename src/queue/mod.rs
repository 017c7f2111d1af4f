//! Priority conversion queue
//!
//! Jobs are ordered by `(priority, submission)`: lower priority value
//! first, FIFO within a priority. At most `max_concurrent` jobs run at
//! once; each running job drives the injected [`ConversionExecutor`]
//! and owns its retry/recovery loop.

pub mod error;
pub mod job;
#[allow(clippy::module_inception)]
mod queue;

pub use error::QueueError;
pub use job::{ConversionJob, JobSpec, JobStatus};
pub use queue::{ConversionQueue, QueueStats};
