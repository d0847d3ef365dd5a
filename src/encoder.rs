//! Two-pass libx264 encode driven through FFmpeg.
//!
//! `Idle -> Pass1Running -> Pass1Done -> Pass2Running -> Completed`, with `Failed`
//! reachable from either running state. Both passes render their arguments from a
//! single [`EncodeParams`], so bitrate and frame size cannot drift between them.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::bitrate::BitratePlan;
use crate::dimensions::Dimensions;
use crate::error::CompressionError;
use crate::ffmpeg::{
    EncodeParams, MediaInfo, Pass, ProgressTracking, ToolRun, format_args_for_display_multiline,
    run_tool,
};
use crate::progress::{CompressionStage, ProgressSink, emit_fraction, emit_stage};
use crate::workspace::Workspace;

const PASSLOG_PREFIX: &str = "passlog";
const OUTPUT_NAME: &str = "output.mp4";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EncodeState {
    Idle,
    Pass1Running,
    Pass1Done,
    Pass2Running,
    Completed,
    Failed,
}

impl EncodeState {
    pub fn can_transition_to(self, next: EncodeState) -> bool {
        use EncodeState::*;
        matches!(
            (self, next),
            (Idle, Pass1Running)
                | (Pass1Running, Pass1Done)
                | (Pass1Done, Pass2Running)
                | (Pass2Running, Completed)
                | (Pass1Running, Failed)
                | (Pass2Running, Failed)
        )
    }
}

/// Everything one encode needs, planned before the first pass starts.
#[derive(Debug)]
pub struct EncodeJob<'a> {
    pub workspace: &'a Workspace,
    pub input: &'a Path,
    pub media: &'a MediaInfo,
    pub plan: BitratePlan,
    pub dimensions: Dimensions,
}

pub struct TwoPassEncoder<'a> {
    ffmpeg: &'a Path,
    params: EncodeParams,
    duration_secs: f64,
    pass_timeout: Duration,
    state: EncodeState,
}

impl<'a> TwoPassEncoder<'a> {
    pub fn new(ffmpeg: &'a Path, job: &EncodeJob<'_>, preset: &str, pass_timeout: Duration) -> Self {
        let params = EncodeParams::new(
            job.input,
            job.workspace.file(PASSLOG_PREFIX),
            job.workspace.file(OUTPUT_NAME),
            job.plan,
            job.dimensions,
            preset,
        );
        Self {
            ffmpeg,
            params,
            duration_secs: job.media.duration_seconds,
            pass_timeout,
            state: EncodeState::Idle,
        }
    }

    pub fn state(&self) -> EncodeState {
        self.state
    }

    pub fn params(&self) -> &EncodeParams {
        &self.params
    }

    fn transition(&mut self, next: EncodeState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid encode transition {:?} -> {:?}",
            self.state,
            next
        );
        log::debug!(
            target: "mp4_squeeze::encoder",
            "Encode state {:?} -> {:?}",
            self.state,
            next
        );
        self.state = next;
    }

    /// Run both passes and return the path of the encoded file inside the workspace.
    pub async fn run(
        &mut self,
        progress: Option<&ProgressSink>,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, CompressionError> {
        if self.state != EncodeState::Idle {
            return Err(CompressionError::Io(std::io::Error::other(format!(
                "encoder already used (state {:?})",
                self.state
            ))));
        }

        self.transition(EncodeState::Pass1Running);
        emit_stage(progress, CompressionStage::EncodingPass1);
        if let Err(e) = self.run_pass(Pass::Analysis, progress, cancel).await {
            self.transition(EncodeState::Failed);
            return Err(e);
        }
        let passlog = self.params.passlog_file();
        if !tokio::fs::metadata(&passlog).await.is_ok_and(|m| m.is_file()) {
            self.transition(EncodeState::Failed);
            return Err(CompressionError::encode_pass(
                1,
                0,
                format!("pass log {} was not written", passlog.display()),
            ));
        }
        self.transition(EncodeState::Pass1Done);

        self.transition(EncodeState::Pass2Running);
        emit_stage(progress, CompressionStage::EncodingPass2);
        if let Err(e) = self.run_pass(Pass::Final, progress, cancel).await {
            self.transition(EncodeState::Failed);
            return Err(e);
        }
        let output = self.params.output().to_path_buf();
        let written = tokio::fs::metadata(&output)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        if written == 0 {
            self.transition(EncodeState::Failed);
            return Err(CompressionError::encode_pass(
                2,
                0,
                format!("output {} is missing or empty", output.display()),
            ));
        }
        self.transition(EncodeState::Completed);
        Ok(output)
    }

    async fn run_pass(
        &self,
        pass: Pass,
        progress: Option<&ProgressSink>,
        cancel: &CancellationToken,
    ) -> Result<(), CompressionError> {
        let stage = match pass {
            Pass::Analysis => CompressionStage::EncodingPass1,
            Pass::Final => CompressionStage::EncodingPass2,
        };
        let args = self.params.args(pass);
        log::info!(
            target: "mp4_squeeze::encoder",
            "Starting pass {} ({} at {} bps)",
            pass.number(),
            self.params.dimensions(),
            self.params.plan().video_bitrate_bps
        );
        log::trace!(
            target: "mp4_squeeze::encoder",
            "ffmpeg \\\n  {}",
            format_args_for_display_multiline(&args)
        );

        let callback = |p: f64| emit_fraction(progress, stage, p);
        run_tool(ToolRun {
            program: self.ffmpeg,
            args: &args,
            timeout: self.pass_timeout,
            cancel,
            progress: Some(ProgressTracking {
                duration_secs: Some(self.duration_secs),
                callback: &callback,
            }),
        })
        .await
        .map_err(|e| e.into_pass_error(pass.number(), stage.label()))?;
        Ok(())
    }
}
