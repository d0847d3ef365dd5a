//! Locates the `ffmpeg` and `ffprobe` executables.
//!
//! Order: explicit config path, then `FFMPEG_PATH` / `FFPROBE_PATH`, then common
//! install locations, then `PATH`. ffprobe is looked up next to ffmpeg before `PATH`
//! since the two ship together.

use std::path::{Path, PathBuf};

use crate::config::CompressorConfig;
use crate::error::CompressionError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderTools {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
}

impl EncoderTools {
    pub fn new(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    pub fn discover(config: &CompressorConfig) -> Result<Self, CompressionError> {
        let ffmpeg = resolve_ffmpeg_path(config.ffmpeg_path.as_deref())?;
        let ffprobe = resolve_ffprobe_path(config.ffprobe_path.as_deref(), &ffmpeg)?;
        log::info!(
            target: "mp4_squeeze::ffmpeg::discovery",
            "Using ffmpeg={} ffprobe={}",
            ffmpeg.display(),
            ffprobe.display()
        );
        Ok(Self { ffmpeg, ffprobe })
    }
}

fn common_paths(binary: &str) -> Vec<PathBuf> {
    #[cfg(target_os = "macos")]
    let dirs: &[&str] = &["/opt/homebrew/bin", "/usr/local/bin", "/opt/local/bin"];
    #[cfg(target_os = "windows")]
    let dirs: &[&str] = &["C:\\ffmpeg\\bin", "C:\\Program Files\\ffmpeg\\bin"];
    #[cfg(all(unix, not(target_os = "macos")))]
    let dirs: &[&str] = &["/usr/bin", "/usr/local/bin"];
    #[cfg(not(any(target_os = "macos", target_os = "windows", unix)))]
    let dirs: &[&str] = &[];

    dirs.iter()
        .map(|dir| Path::new(dir).join(executable_name(binary)))
        .collect()
}

fn executable_name(binary: &str) -> String {
    if cfg!(target_os = "windows") {
        format!("{binary}.exe")
    } else {
        binary.to_string()
    }
}

fn from_env(var: &str) -> Option<PathBuf> {
    let value = std::env::var_os(var)?;
    let path = PathBuf::from(value);
    if path.exists() {
        log::debug!(
            target: "mp4_squeeze::ffmpeg::discovery",
            "{} from {} env",
            path.display(),
            var
        );
        Some(path)
    } else {
        log::warn!(
            target: "mp4_squeeze::ffmpeg::discovery",
            "{} points to missing file {}, ignoring",
            var,
            path.display()
        );
        None
    }
}

fn explicit(path: Option<&Path>, name: &str) -> Result<Option<PathBuf>, CompressionError> {
    match path {
        Some(p) if p.exists() => Ok(Some(p.to_path_buf())),
        Some(p) => Err(CompressionError::EncoderNotFound(format!(
            "Configured {} not found at {}",
            name,
            p.display()
        ))),
        None => Ok(None),
    }
}

pub fn resolve_ffmpeg_path(configured: Option<&Path>) -> Result<PathBuf, CompressionError> {
    if let Some(p) = explicit(configured, "ffmpeg")? {
        return Ok(p);
    }
    if let Some(p) = from_env("FFMPEG_PATH") {
        return Ok(p);
    }
    if let Some(p) = common_paths("ffmpeg").into_iter().find(|p| p.exists()) {
        return Ok(p);
    }
    if let Ok(p) = which::which("ffmpeg") {
        return Ok(p);
    }

    log::error!(
        target: "mp4_squeeze::ffmpeg::discovery",
        "FFmpeg not found in PATH or common locations"
    );
    Err(CompressionError::EncoderNotFound(
        "FFmpeg not found. Install it (e.g. `apt install ffmpeg`) or set FFMPEG_PATH.".to_string(),
    ))
}

/// Paths to try for ffprobe given an ffmpeg binary path (suffixed first, then plain).
pub fn ffprobe_candidates(ffmpeg_path: &Path) -> Vec<PathBuf> {
    let Some(parent) = ffmpeg_path.parent() else {
        return vec![];
    };
    let mut candidates = Vec::with_capacity(2);
    if let Some(suffix) = ffmpeg_path
        .file_stem()
        .and_then(|s| s.to_str())
        .and_then(|stem| stem.strip_prefix("ffmpeg"))
        .filter(|suffix| !suffix.is_empty())
    {
        candidates.push(parent.join(executable_name(&format!("ffprobe{suffix}"))));
    }
    candidates.push(parent.join(executable_name("ffprobe")));
    candidates
}

pub fn resolve_ffprobe_path(
    configured: Option<&Path>,
    ffmpeg: &Path,
) -> Result<PathBuf, CompressionError> {
    if let Some(p) = explicit(configured, "ffprobe")? {
        return Ok(p);
    }
    if let Some(p) = from_env("FFPROBE_PATH") {
        return Ok(p);
    }
    if let Some(p) = ffprobe_candidates(ffmpeg).into_iter().find(|p| p.exists()) {
        return Ok(p);
    }
    which::which("ffprobe").map_err(|_| {
        CompressionError::EncoderNotFound(format!(
            "ffprobe not found next to {} or in PATH",
            ffmpeg.display()
        ))
    })
}
