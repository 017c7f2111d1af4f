use crate::convert::{ConversionError, ConversionErrorKind, ConversionOptions};
use rand::Rng;
use std::time::Duration;

/// Maximum automatic attempts per job, counting the first one.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

const RETRY_BASE: Duration = Duration::from_secs(1);
const RETRY_CAP: Duration = Duration::from_secs(30);
const JITTER_FRACTION: f64 = 0.10;

/// Safe substitution values used by the recovery hooks.
const SAFE_BITRATE_KBPS: u32 = 128;
const SAFE_SAMPLE_RATE_HZ: u32 = 44_100;
const SAFE_CHANNELS: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    User,
    System,
    Network,
    Format,
    Resource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// A conversion failure with its fixed classification attached.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedError {
    pub kind: ConversionErrorKind,
    pub message: String,
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub can_recover: bool,
    pub is_retryable: bool,
    pub requires_user_action: bool,
}

/// Classify a raised conversion failure.
///
/// Pure and deterministic: the same error always yields the same
/// classification. Unrecognized failures default to a retryable system
/// error with no user action required.
pub fn classify(error: &ConversionError) -> ClassifiedError {
    use ConversionErrorKind::*;
    use ErrorCategory as C;
    use ErrorSeverity as S;

    // (category, severity, can_recover, is_retryable, requires_user_action)
    let (category, severity, can_recover, is_retryable, requires_user_action) = match error.kind {
        UnsupportedFormat => (C::User, S::Medium, false, false, true),
        SameFormatRequested => (C::User, S::Low, false, false, true),
        InvalidBitrate => (C::User, S::Low, true, false, false),
        InvalidSampleRate => (C::User, S::Low, true, false, false),
        InvalidChannelCount => (C::User, S::Low, true, false, false),
        EmptyFile => (C::User, S::Medium, false, false, true),
        FileTooSmall => (C::User, S::Low, false, false, true),
        FileTooLarge => (C::User, S::Medium, false, false, true),
        DecoderInitFailed => (C::System, S::High, false, true, false),
        CorruptInput => (C::Format, S::High, false, false, true),
        OutOfMemory => (C::Resource, S::Critical, true, true, false),
        NetworkUnavailable => (C::Network, S::High, false, true, false),
        Timeout => (C::Network, S::Medium, false, true, false),
        PermissionDenied => (C::System, S::High, false, false, true),
        Unknown => (C::System, S::Medium, false, true, false),
    };

    ClassifiedError {
        kind: error.kind,
        message: error.message.clone(),
        category,
        severity,
        can_recover,
        is_retryable,
        requires_user_action,
    }
}

/// Decide whether a failed attempt should be retried automatically.
///
/// User and format errors are never silently retried; neither is
/// anything that needs the user to act first.
pub fn should_retry(error: &ClassifiedError, attempt: u32, max_attempts: u32) -> bool {
    if attempt >= max_attempts {
        return false;
    }
    if !error.is_retryable || error.requires_user_action {
        return false;
    }
    matches!(
        error.category,
        ErrorCategory::System | ErrorCategory::Network | ErrorCategory::Resource
    )
}

/// Exponential backoff delay before retry `attempt` (1-based).
///
/// Base 1s doubling per attempt, capped at 30s, with up to 10% random
/// jitter so simultaneous failures do not retry in lockstep.
pub fn retry_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(31);
    let base = RETRY_BASE.saturating_mul(1u32 << exp).min(RETRY_CAP);
    let jitter = rand::thread_rng().gen_range(0.0..=JITTER_FRACTION);
    base.mul_f64(1.0 + jitter)
}

/// Stable user-facing message for a classified failure.
pub fn user_message(error: &ClassifiedError) -> &'static str {
    use ConversionErrorKind::*;
    match error.kind {
        UnsupportedFormat => "This file format is not supported for conversion.",
        SameFormatRequested => "The file is already in the requested format.",
        InvalidBitrate => "The requested bitrate is not valid for this format.",
        InvalidSampleRate => "The requested sample rate is not valid for this format.",
        InvalidChannelCount => "The requested channel count is not valid for this format.",
        EmptyFile => "The uploaded file is empty.",
        FileTooSmall => "The uploaded file is too small to contain audio.",
        FileTooLarge => "The uploaded file exceeds the maximum allowed size.",
        DecoderInitFailed => "The converter failed to start. Please try again.",
        CorruptInput => "The file appears to be damaged and could not be decoded.",
        OutOfMemory => "The server ran out of memory while converting this file.",
        NetworkUnavailable => "A network problem interrupted the conversion.",
        Timeout => "The conversion took too long and was stopped.",
        PermissionDenied => "The server is not permitted to process this file.",
        Unknown => "Something went wrong while converting this file.",
    }
}

/// Suggested next steps to display alongside [`user_message`].
pub fn suggested_actions(error: &ClassifiedError) -> Vec<&'static str> {
    use ConversionErrorKind::*;
    match error.kind {
        UnsupportedFormat => vec![
            "Convert the file to WAV, FLAC, or MP3 before uploading",
            "Check the list of supported formats",
        ],
        SameFormatRequested => vec!["Choose a different output format"],
        InvalidBitrate | InvalidSampleRate | InvalidChannelCount => {
            vec!["Remove the custom setting and use the default"]
        }
        EmptyFile | FileTooSmall => vec!["Re-export the file and upload it again"],
        FileTooLarge => vec![
            "Split the file into shorter segments",
            "Upload a compressed version",
        ],
        CorruptInput => vec![
            "Re-export the file from its source",
            "Try a different copy of the file",
        ],
        OutOfMemory | DecoderInitFailed | NetworkUnavailable | Timeout => {
            vec!["Wait a moment and try again"]
        }
        PermissionDenied => vec!["Contact the administrator"],
        Unknown => vec!["Try again", "Contact support if the problem persists"],
    }
}

/// Parameter substitution for recoverable failures.
///
/// Returns adjusted options the job should be resumed with, or `None`
/// when the failure has no known substitution. The queue applies this at
/// most once per job before falling back to the generic retry path.
pub fn recovery_adjustment(
    kind: ConversionErrorKind,
    options: &ConversionOptions,
) -> Option<ConversionOptions> {
    let mut adjusted = options.clone();
    match kind {
        ConversionErrorKind::InvalidBitrate => {
            adjusted.bitrate_kbps = Some(SAFE_BITRATE_KBPS);
        }
        ConversionErrorKind::InvalidSampleRate => {
            adjusted.sample_rate_hz = Some(SAFE_SAMPLE_RATE_HZ);
        }
        ConversionErrorKind::InvalidChannelCount => {
            adjusted.channels = Some(SAFE_CHANNELS);
        }
        ConversionErrorKind::OutOfMemory => {
            // Degrade: halve the bitrate (or pin the safe default) to
            // shrink the encoder's working set.
            let current = adjusted.bitrate_kbps.unwrap_or(SAFE_BITRATE_KBPS * 2);
            adjusted.bitrate_kbps = Some((current / 2).max(32));
        }
        _ => return None,
    }
    Some(adjusted)
}
