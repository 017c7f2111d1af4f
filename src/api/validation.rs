//! Upload request validation
//!
//! Pure, stateless checks performed before any storage or queue work.

use thiserror::Error;

use super::error::ApiError;
use crate::convert::MediaFormat;

/// Smallest byte count any real media file could plausibly have; a WAV
/// header alone is 44 bytes.
pub const MIN_UPLOAD_BYTES: usize = 44;

const MAX_FILENAME_LEN: usize = 255;

#[derive(Debug, Error)]
pub enum UploadValidationError {
    #[error("filename is required")]
    MissingFilename,
    #[error("filename exceeds {MAX_FILENAME_LEN} characters")]
    FilenameTooLong,
    #[error("filename must not contain path separators")]
    FilenameHasPath,
    #[error("file is empty")]
    EmptyFile,
    #[error("file is too small to be valid media ({0} bytes)")]
    FileTooSmall(usize),
    #[error("could not determine input format from filename '{0}'")]
    UnknownInputFormat(String),
    #[error("input and output format are both {0}")]
    SameFormat(MediaFormat),
}

impl From<UploadValidationError> for ApiError {
    fn from(value: UploadValidationError) -> Self {
        match value {
            UploadValidationError::UnknownInputFormat(name) => ApiError::UnsupportedFormat(name),
            UploadValidationError::SameFormat(format) => {
                ApiError::InvalidRequest(format!("input and output are both {format}"))
            }
            other => ApiError::InvalidRequest(other.to_string()),
        }
    }
}

/// Filename sanity: present, bounded, a bare name rather than a path.
pub fn validate_filename(filename: &str) -> Result<(), UploadValidationError> {
    if filename.trim().is_empty() {
        return Err(UploadValidationError::MissingFilename);
    }
    if filename.len() > MAX_FILENAME_LEN {
        return Err(UploadValidationError::FilenameTooLong);
    }
    if filename.contains('/') || filename.contains('\\') {
        return Err(UploadValidationError::FilenameHasPath);
    }
    Ok(())
}

/// Upload bytes must be non-empty and at least plausibly media.
pub fn validate_content_size(len: usize) -> Result<(), UploadValidationError> {
    if len == 0 {
        return Err(UploadValidationError::EmptyFile);
    }
    if len < MIN_UPLOAD_BYTES {
        return Err(UploadValidationError::FileTooSmall(len));
    }
    Ok(())
}

/// Resolve the input format from the filename and check it against the
/// requested output.
pub fn resolve_formats(
    filename: &str,
    output: MediaFormat,
) -> Result<MediaFormat, UploadValidationError> {
    let input = MediaFormat::from_filename(filename)
        .ok_or_else(|| UploadValidationError::UnknownInputFormat(filename.to_string()))?;
    if input == output {
        return Err(UploadValidationError::SameFormat(input));
    }
    Ok(input)
}

/// Enforce the configured upload ceiling.
pub fn validate_body_size(len: usize, max: u64) -> Result<(), ApiError> {
    if len as u64 > max {
        return Err(ApiError::PayloadTooLarge(len));
    }
    Ok(())
}
