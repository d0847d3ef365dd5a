//! Converts a target file size into encoder bitrates.

use serde::Serialize;

use crate::error::CompressionError;

/// Bits in one megabyte (MiB), matching how upload limits are usually quoted.
pub const BITS_PER_MB: f64 = 8.0 * 1024.0 * 1024.0;

/// Size policy applied on top of the requested target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BitratePolicy {
    pub safety_margin: f64,
    pub audio_bitrate_bps: u64,
    pub min_video_bitrate_bps: u64,
}

impl From<&crate::config::CompressorConfig> for BitratePolicy {
    fn from(config: &crate::config::CompressorConfig) -> Self {
        Self {
            safety_margin: config.effective_safety_margin(),
            audio_bitrate_bps: config.audio_bitrate_bps,
            min_video_bitrate_bps: config.min_video_bitrate_bps,
        }
    }
}

/// Bitrates shared by both encode passes. Built once per request and never recomputed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BitratePlan {
    pub video_bitrate_bps: u64,
    pub audio_bitrate_bps: u64,
    pub total_target_bits: f64,
}

impl BitratePlan {
    pub fn total_bitrate_bps(&self) -> u64 {
        self.video_bitrate_bps + self.audio_bitrate_bps
    }
}

/// Computes the bitrate plan for a clip.
///
/// Fails with `InvalidDuration` for a non-positive duration, and with
/// `BitrateFloorViolation` when the budget left after audio does not exceed the video floor.
pub fn calculate_bitrate(
    target_size_mb: f64,
    duration_seconds: f64,
    has_audio: bool,
    policy: &BitratePolicy,
) -> Result<BitratePlan, CompressionError> {
    if !duration_seconds.is_finite() || duration_seconds <= 0.0 {
        return Err(CompressionError::InvalidDuration(duration_seconds));
    }
    if !target_size_mb.is_finite() || target_size_mb <= 0.0 {
        return Err(CompressionError::InvalidRequest(format!(
            "target_size_mb must be positive, got {}",
            target_size_mb
        )));
    }

    let total_target_bits = target_size_mb * BITS_PER_MB * policy.safety_margin;
    let audio_bitrate_bps = if has_audio {
        policy.audio_bitrate_bps
    } else {
        0
    };
    let video_budget = (total_target_bits / duration_seconds - audio_bitrate_bps as f64).floor();

    if video_budget <= policy.min_video_bitrate_bps as f64 {
        return Err(CompressionError::BitrateFloorViolation {
            required_bps: video_budget as i64,
            floor_bps: policy.min_video_bitrate_bps,
        });
    }

    Ok(BitratePlan {
        video_bitrate_bps: video_budget as u64,
        audio_bitrate_bps,
        total_target_bits,
    })
}
