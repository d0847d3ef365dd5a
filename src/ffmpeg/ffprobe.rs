//! ffprobe-based media inspection.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::path_to_string;
use super::runner::{ToolRun, run_tool};
use crate::dimensions::Dimensions;
use crate::error::CompressionError;

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    format_name: Option<String>,
    #[serde(default)]
    nb_streams: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    #[serde(default)]
    codec_name: Option<String>,
    #[serde(default)]
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: Option<FfprobeFormat>,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

/// What the pipeline needs to know about a source file. Produced once per request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaInfo {
    pub duration_seconds: f64,
    pub width: u32,
    pub height: u32,
    pub has_audio: bool,
    pub video_codec: Option<String>,
    pub format_name: Option<String>,
    pub size_bytes: Option<u64>,
}

impl MediaInfo {
    pub fn dimensions(&self) -> Dimensions {
        Dimensions::new(self.width, self.height)
    }
}

fn parse_seconds(s: Option<&String>) -> Option<f64> {
    s.and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|d| d.is_finite())
}

/// Parse `ffprobe -print_format json -show_format -show_streams` output.
pub fn parse_ffprobe_json(json: &str) -> Result<MediaInfo, CompressionError> {
    let output: FfprobeOutput = serde_json::from_str(json)
        .map_err(|e| CompressionError::Probe(format!("unreadable ffprobe output: {}", e)))?;

    let stream_count = output
        .format
        .as_ref()
        .and_then(|f| f.nb_streams)
        .unwrap_or(output.streams.len() as u32);
    if stream_count == 0 || output.streams.is_empty() {
        return Err(CompressionError::Probe("file contains no streams".to_string()));
    }

    let video = output
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| CompressionError::Probe("file contains no video stream".to_string()))?;
    let (width, height) = match (video.width, video.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => {
            return Err(CompressionError::Probe(
                "video stream has no frame size".to_string(),
            ));
        }
    };

    let format = output.format.as_ref();
    let duration_seconds = parse_seconds(format.and_then(|f| f.duration.as_ref()))
        .or_else(|| parse_seconds(video.duration.as_ref()))
        .unwrap_or(0.0);
    if duration_seconds <= 0.0 {
        return Err(CompressionError::InvalidDuration(duration_seconds));
    }

    let has_audio = output
        .streams
        .iter()
        .any(|s| s.codec_type.as_deref() == Some("audio"));

    Ok(MediaInfo {
        duration_seconds,
        width,
        height,
        has_audio,
        video_codec: video.codec_name.clone(),
        format_name: format.and_then(|f| f.format_name.clone()),
        size_bytes: format
            .and_then(|f| f.size.as_deref())
            .and_then(|s| s.parse::<u64>().ok()),
    })
}

/// Run ffprobe once on `path` and return its metadata.
pub async fn probe_media(
    ffprobe: &Path,
    path: &Path,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<MediaInfo, CompressionError> {
    log::debug!(
        target: "mp4_squeeze::ffmpeg::ffprobe",
        "probe_media: path={}",
        path.display()
    );

    let args: Vec<String> = [
        "-v",
        "error",
        "-print_format",
        "json",
        "-show_format",
        "-show_streams",
    ]
    .into_iter()
    .map(String::from)
    .chain(std::iter::once(path_to_string(path)))
    .collect();

    let output = run_tool(ToolRun {
        program: ffprobe,
        args: &args,
        timeout,
        cancel,
        progress: None,
    })
    .await
    .map_err(|e| e.into_probe_error("Probing"))?;

    let info = parse_ffprobe_json(&output.stdout)?;
    log::info!(
        target: "mp4_squeeze::ffmpeg::ffprobe",
        "Probed {}: {:.2}s {}x{} audio={} codec={:?}",
        path.display(),
        info.duration_seconds,
        info.width,
        info.height,
        info.has_audio,
        info.video_codec
    );
    Ok(info)
}
