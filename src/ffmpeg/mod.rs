mod builder;
pub mod discovery;
mod error;
pub mod ffprobe;
mod progress;
pub mod runner;

pub use builder::{EncodeParams, Pass, format_args_for_display_multiline};
pub use discovery::EncoderTools;
pub use error::{FfmpegErrorPayload, parse_ffmpeg_error, stderr_preview};
pub use ffprobe::{MediaInfo, probe_media};
pub use runner::{ProgressTracking, ToolError, ToolOutput, ToolRun, run_tool};

/// Path to string for FFmpeg args or logging.
pub fn path_to_string(path: &(impl AsRef<std::path::Path> + ?Sized)) -> String {
    path.as_ref().to_string_lossy().to_string()
}
