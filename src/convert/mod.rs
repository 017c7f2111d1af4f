//! Conversion executor contract
//!
//! The actual codec lives outside this crate. The queue only needs a seam
//! it can drive: give the executor bytes plus options, get bytes plus
//! metadata back, and receive progress callbacks while it works. The
//! [`PassthroughExecutor`] is the built-in stand-in used by the default
//! wiring and by tests.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// Media container/codec formats accepted for conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaFormat {
    Wav,
    Flac,
    Mp3,
    Aac,
    Ogg,
    Opus,
    Webm,
    Mp4,
}

impl MediaFormat {
    /// Lossless formats are cheaper to transcode than lossy re-encodes.
    pub fn is_lossless(&self) -> bool {
        matches!(self, MediaFormat::Wav | MediaFormat::Flac)
    }

    pub fn extension(&self) -> &'static str {
        match self {
            MediaFormat::Wav => "wav",
            MediaFormat::Flac => "flac",
            MediaFormat::Mp3 => "mp3",
            MediaFormat::Aac => "aac",
            MediaFormat::Ogg => "ogg",
            MediaFormat::Opus => "opus",
            MediaFormat::Webm => "webm",
            MediaFormat::Mp4 => "mp4",
        }
    }

    /// Guess the format from a filename extension.
    pub fn from_filename(name: &str) -> Option<Self> {
        let ext = name.rsplit('.').next()?;
        ext.parse().ok()
    }
}

impl FromStr for MediaFormat {
    type Err = ConversionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "wav" => Ok(MediaFormat::Wav),
            "flac" => Ok(MediaFormat::Flac),
            "mp3" => Ok(MediaFormat::Mp3),
            "aac" | "m4a" => Ok(MediaFormat::Aac),
            "ogg" => Ok(MediaFormat::Ogg),
            "opus" => Ok(MediaFormat::Opus),
            "webm" => Ok(MediaFormat::Webm),
            "mp4" => Ok(MediaFormat::Mp4),
            other => Err(ConversionError::new(
                ConversionErrorKind::UnsupportedFormat,
                format!("unknown format: {other}"),
            )),
        }
    }
}

impl fmt::Display for MediaFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Quality tier forwarded to the codec.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Low,
    #[default]
    Standard,
    High,
}

/// Conversion options. `None` fields mean "codec default".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversionOptions {
    pub bitrate_kbps: Option<u32>,
    pub sample_rate_hz: Option<u32>,
    pub channels: Option<u8>,
    #[serde(default)]
    pub quality: Quality,
}

/// One conversion invocation.
#[derive(Debug, Clone)]
pub struct ConversionRequest {
    pub input: Bytes,
    pub input_format: MediaFormat,
    pub output_format: MediaFormat,
    pub options: ConversionOptions,
}

/// Bytes plus whatever metadata the codec reports.
#[derive(Debug, Clone)]
pub struct ConversionOutput {
    pub output: Bytes,
    pub output_format: MediaFormat,
    pub duration_secs: Option<f64>,
    pub sample_rate_hz: Option<u32>,
}

/// Closed taxonomy of conversion failures.
///
/// Each variant carries its classification (category, severity,
/// retryability) via the tables in `crate::recovery`, checked
/// exhaustively at compile time instead of string-matching error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConversionErrorKind {
    UnsupportedFormat,
    SameFormatRequested,
    InvalidBitrate,
    InvalidSampleRate,
    InvalidChannelCount,
    EmptyFile,
    FileTooSmall,
    FileTooLarge,
    DecoderInitFailed,
    CorruptInput,
    OutOfMemory,
    NetworkUnavailable,
    Timeout,
    PermissionDenied,
    Unknown,
}

/// Error type produced by conversion executors.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ConversionError {
    pub kind: ConversionErrorKind,
    pub message: String,
}

impl ConversionError {
    pub fn new(kind: ConversionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Progress callback invoked by the executor during long conversions.
/// Fire-and-forget from the executor's perspective.
pub type ProgressHook = Arc<dyn Fn(f32, &str) + Send + Sync>;

/// The external conversion collaborator.
#[async_trait]
pub trait ConversionExecutor: Send + Sync {
    async fn convert(
        &self,
        request: ConversionRequest,
        progress: ProgressHook,
    ) -> Result<ConversionOutput, ConversionError>;
}

/// Executor stand-in that copies input to output.
///
/// Used by the default server wiring until a real codec is plugged in;
/// still enforces the structural contract (empty input, same-format
/// requests) so the failure paths stay exercised.
#[derive(Debug, Default)]
pub struct PassthroughExecutor;

#[async_trait]
impl ConversionExecutor for PassthroughExecutor {
    async fn convert(
        &self,
        request: ConversionRequest,
        progress: ProgressHook,
    ) -> Result<ConversionOutput, ConversionError> {
        if request.input.is_empty() {
            return Err(ConversionError::new(
                ConversionErrorKind::EmptyFile,
                "input contains no data",
            ));
        }
        if request.input_format == request.output_format {
            return Err(ConversionError::new(
                ConversionErrorKind::SameFormatRequested,
                format!("input and output are both {}", request.input_format),
            ));
        }

        progress(10.0, "Decoding");
        progress(60.0, "Encoding");
        let output = request.input.clone();
        progress(95.0, "Finalizing");

        Ok(ConversionOutput {
            output,
            output_format: request.output_format,
            duration_secs: None,
            sample_rate_hz: request.options.sample_rate_hz,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_from_filename() {
        assert_eq!(
            MediaFormat::from_filename("song.final.mp3"),
            Some(MediaFormat::Mp3)
        );
        assert_eq!(MediaFormat::from_filename("talk.FLAC"), Some(MediaFormat::Flac));
        assert_eq!(MediaFormat::from_filename("noext"), None);
    }

    #[test]
    fn m4a_maps_to_aac() {
        assert_eq!("m4a".parse::<MediaFormat>().unwrap(), MediaFormat::Aac);
    }

    #[test]
    fn lossless_classification() {
        assert!(MediaFormat::Wav.is_lossless());
        assert!(MediaFormat::Flac.is_lossless());
        assert!(!MediaFormat::Mp3.is_lossless());
        assert!(!MediaFormat::Opus.is_lossless());
    }

    #[tokio::test]
    async fn passthrough_rejects_empty_input() {
        let exec = PassthroughExecutor;
        let request = ConversionRequest {
            input: Bytes::new(),
            input_format: MediaFormat::Wav,
            output_format: MediaFormat::Mp3,
            options: ConversionOptions::default(),
        };
        let err = exec
            .convert(request, Arc::new(|_, _| {}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ConversionErrorKind::EmptyFile);
    }

    #[tokio::test]
    async fn passthrough_rejects_same_format() {
        let exec = PassthroughExecutor;
        let request = ConversionRequest {
            input: Bytes::from_static(b"riff"),
            input_format: MediaFormat::Mp3,
            output_format: MediaFormat::Mp3,
            options: ConversionOptions::default(),
        };
        let err = exec
            .convert(request, Arc::new(|_, _| {}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ConversionErrorKind::SameFormatRequested);
    }

    #[tokio::test]
    async fn passthrough_reports_progress() {
        use std::sync::Mutex;
        let seen: Arc<Mutex<Vec<f32>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_hook = seen.clone();

        let exec = PassthroughExecutor;
        let request = ConversionRequest {
            input: Bytes::from_static(b"riff"),
            input_format: MediaFormat::Wav,
            output_format: MediaFormat::Mp3,
            options: ConversionOptions::default(),
        };
        exec.convert(
            request,
            Arc::new(move |pct, _| seen_hook.lock().unwrap().push(pct)),
        )
        .await
        .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![10.0, 60.0, 95.0]);
    }
}
