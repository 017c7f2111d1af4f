//! Failure classification and retry/recovery policy
//!
//! Conversion failures never surface to callers synchronously. The queue
//! captures them, asks this module what kind of failure it is looking at,
//! and then either retries with backoff, resumes the job once with
//! adjusted options, or marks the job failed with user-facing guidance.

mod classifier;

pub use classifier::{
    classify, recovery_adjustment, retry_delay, should_retry, suggested_actions, user_message,
    ClassifiedError, ErrorCategory, ErrorSeverity, DEFAULT_MAX_ATTEMPTS,
};
