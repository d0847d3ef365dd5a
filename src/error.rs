//! Error type for the compression pipeline. Implements Display and Serialize for HTTP responses.

use std::path::PathBuf;
use std::time::Duration;

use crate::ffmpeg::parse_ffmpeg_error;

#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Could not inspect video: {0}")]
    Probe(String),

    #[error("Video has no usable duration ({0}s)")]
    InvalidDuration(f64),

    #[error(
        "Target size is too small for this video: needs {required_bps} bps of video, minimum is {floor_bps} bps"
    )]
    BitrateFloorViolation { required_bps: i64, floor_bps: u64 },

    #[error("Encoding pass {pass} failed (code {code})")]
    EncodePass { pass: u8, code: i32, stderr: String },

    #[error("{stage} timed out after {}s", .timeout.as_secs())]
    EncodeTimeout { stage: &'static str, timeout: Duration },

    #[error("Workspace error at {}: {source}", .path.display())]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Encoded file is {actual_bytes} bytes, above the {limit_bytes} byte target")]
    TargetSizeExceeded { actual_bytes: u64, limit_bytes: u64 },

    #[error("{0}")]
    EncoderNotFound(String),

    #[error("Aborted")]
    Cancelled,

    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl CompressionError {
    pub fn workspace(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Workspace {
            path: path.into(),
            source,
        }
    }

    pub fn encode_pass(pass: u8, code: i32, stderr: impl Into<String>) -> Self {
        Self::EncodePass {
            pass,
            code,
            stderr: stderr.into(),
        }
    }

    /// Stable machine-readable kind, used as the `error` field of HTTP responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::Probe(_) => "probe_failed",
            Self::InvalidDuration(_) => "invalid_duration",
            Self::BitrateFloorViolation { .. } => "bitrate_floor_violation",
            Self::EncodePass { .. } => "encode_pass_failed",
            Self::EncodeTimeout { .. } => "encode_timeout",
            Self::Workspace { .. } => "workspace_error",
            Self::TargetSizeExceeded { .. } => "target_size_exceeded",
            Self::EncoderNotFound(_) => "encoder_not_found",
            Self::Cancelled => "cancelled",
            Self::Io(_) => "io",
        }
    }

    /// Expandable detail for the error body (FFmpeg stderr tail, offending path).
    pub fn detail(&self) -> Option<String> {
        match self {
            Self::EncodePass { code, stderr, .. } => {
                let payload = parse_ffmpeg_error(stderr, Some(*code));
                Some(format!("{}\n{}", payload.summary, payload.detail).trim().to_string())
            }
            Self::Workspace { path, .. } => Some(path.display().to_string()),
            _ => None,
        }
    }
}

impl serde::Serialize for CompressionError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeMap;

        let detail = self.detail();
        let mut map = serializer.serialize_map(Some(if detail.is_some() { 3 } else { 2 }))?;
        map.serialize_entry("error", self.kind())?;
        map.serialize_entry("message", &self.to_string())?;
        if let Some(detail) = detail {
            map.serialize_entry("detail", &detail)?;
        }
        map.end()
    }
}
