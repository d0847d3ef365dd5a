//! FFmpeg argument construction for the two rate-controlled passes.

use std::path::{Path, PathBuf};

use super::path_to_string;
use crate::bitrate::BitratePlan;
use crate::dimensions::Dimensions;

/// Which half of a two-pass encode an argument list is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    Analysis,
    Final,
}

impl Pass {
    pub fn number(self) -> u8 {
        match self {
            Pass::Analysis => 1,
            Pass::Final => 2,
        }
    }
}

/// Parameters shared by both passes. Both argument lists are rendered from one
/// instance, so the passes cannot disagree on bitrate or frame size.
#[derive(Debug, Clone)]
pub struct EncodeParams {
    input: PathBuf,
    passlog_prefix: PathBuf,
    output: PathBuf,
    plan: BitratePlan,
    dimensions: Dimensions,
    preset: String,
}

impl EncodeParams {
    pub fn new(
        input: impl Into<PathBuf>,
        passlog_prefix: impl Into<PathBuf>,
        output: impl Into<PathBuf>,
        plan: BitratePlan,
        dimensions: Dimensions,
        preset: impl Into<String>,
    ) -> Self {
        Self {
            input: input.into(),
            passlog_prefix: passlog_prefix.into(),
            output: output.into(),
            plan,
            dimensions,
            preset: preset.into(),
        }
    }

    pub fn plan(&self) -> &BitratePlan {
        &self.plan
    }

    pub fn dimensions(&self) -> Dimensions {
        self.dimensions
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    /// File libx264 writes its first-pass statistics to.
    pub fn passlog_file(&self) -> PathBuf {
        let mut name = self.passlog_prefix.as_os_str().to_os_string();
        name.push("-0.log");
        PathBuf::from(name)
    }

    pub fn args(&self, pass: Pass) -> Vec<String> {
        let video_bitrate = self.plan.video_bitrate_bps.to_string();
        let mut args: Vec<String> = vec![
            "-nostdin".into(),
            "-hide_banner".into(),
            "-y".into(),
            "-progress".into(),
            "pipe:1".into(),
            "-nostats".into(),
            "-i".into(),
            path_to_string(&self.input),
            "-map".into(),
            "0:v:0".into(),
        ];
        if pass == Pass::Final && self.plan.audio_bitrate_bps > 0 {
            args.extend(["-map".into(), "0:a:0?".into()]);
        }
        args.extend([
            "-c:v".into(),
            "libx264".into(),
            "-preset".into(),
            self.preset.clone(),
            "-b:v".into(),
            video_bitrate.clone(),
            "-maxrate".into(),
            video_bitrate,
            "-bufsize".into(),
            (self.plan.video_bitrate_bps * 2).to_string(),
            "-vf".into(),
            self.dimensions.scale_filter(),
            "-pix_fmt".into(),
            "yuv420p".into(),
            "-pass".into(),
            pass.number().to_string(),
            "-passlogfile".into(),
            path_to_string(&self.passlog_prefix),
        ]);

        match pass {
            Pass::Analysis => {
                args.extend(["-an".into(), "-f".into(), "null".into(), "-".into()]);
            }
            Pass::Final => {
                if self.plan.audio_bitrate_bps > 0 {
                    args.extend([
                        "-c:a".into(),
                        "aac".into(),
                        "-b:a".into(),
                        self.plan.audio_bitrate_bps.to_string(),
                    ]);
                } else {
                    args.push("-an".into());
                }
                args.extend([
                    "-movflags".into(),
                    "+faststart".into(),
                    "-f".into(),
                    "mp4".into(),
                    path_to_string(&self.output),
                ]);
            }
        }

        log::debug!(
            target: "mp4_squeeze::ffmpeg::builder",
            "Pass {} args: video={}bps audio={}bps size={}",
            pass.number(),
            self.plan.video_bitrate_bps,
            self.plan.audio_bitrate_bps,
            self.dimensions
        );
        args
    }
}

/// Format args for logging, one flag per line.
pub fn format_args_for_display_multiline(args: &[String]) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut iter = args.iter().peekable();
    while let Some(arg) = iter.next() {
        match iter.peek() {
            Some(next) if arg.starts_with('-') && !next.starts_with('-') && arg != "-" => {
                lines.push(format!("{} {}", arg, next));
                iter.next();
            }
            _ => lines.push(arg.clone()),
        }
    }
    lines.join(" \\\n  ")
}
