//! Policy constants and runtime limits for the compressor.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::dimensions::Dimensions;

pub const DEFAULT_TARGET_SIZE_MB: f64 = 8.0;
pub const DEFAULT_SAFETY_MARGIN: f64 = 0.98;
pub const DEFAULT_MIN_VIDEO_BITRATE_BPS: u64 = 100_000;
pub const DEFAULT_AUDIO_BITRATE_BPS: u64 = 128_000;
pub const DEFAULT_MAX_EDGE: u32 = 1280;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CompressorConfig {
    /// Fraction of the requested size handed to the encoder; the rest absorbs MP4 overhead.
    pub safety_margin: f64,
    pub min_video_bitrate_bps: u64,
    pub audio_bitrate_bps: u64,
    /// Longest output edge when the aspect ratio is kept. Sources are never upscaled.
    pub max_edge: u32,
    /// Output size when the aspect ratio is not kept.
    pub fallback_dimensions: Dimensions,
    /// libx264 preset used for both passes.
    pub preset: String,
    pub probe_timeout_secs: u64,
    pub encode_pass_timeout_secs: u64,
    /// Encode pipelines allowed to run at once; further requests queue.
    pub max_concurrent_jobs: usize,
    /// Parent directory for per-request workspaces. Defaults to `<system temp>/mp4-squeeze`.
    pub temp_root: Option<PathBuf>,
    pub ffmpeg_path: Option<PathBuf>,
    pub ffprobe_path: Option<PathBuf>,
}

impl Default for CompressorConfig {
    fn default() -> Self {
        Self {
            safety_margin: DEFAULT_SAFETY_MARGIN,
            min_video_bitrate_bps: DEFAULT_MIN_VIDEO_BITRATE_BPS,
            audio_bitrate_bps: DEFAULT_AUDIO_BITRATE_BPS,
            max_edge: DEFAULT_MAX_EDGE,
            fallback_dimensions: Dimensions::new(1280, 720),
            preset: "medium".to_string(),
            probe_timeout_secs: 30,
            encode_pass_timeout_secs: 30 * 60,
            max_concurrent_jobs: 2,
            temp_root: None,
            ffmpeg_path: None,
            ffprobe_path: None,
        }
    }
}

impl CompressorConfig {
    pub fn effective_temp_root(&self) -> PathBuf {
        self.temp_root
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("mp4-squeeze"))
    }

    pub fn effective_safety_margin(&self) -> f64 {
        if self.safety_margin.is_finite() && self.safety_margin > 0.0 {
            self.safety_margin.min(1.0)
        } else {
            DEFAULT_SAFETY_MARGIN
        }
    }

    pub fn effective_max_concurrent_jobs(&self) -> usize {
        self.max_concurrent_jobs.max(1)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs.max(1))
    }

    pub fn encode_pass_timeout(&self) -> Duration {
        Duration::from_secs(self.encode_pass_timeout_secs.max(1))
    }
}
