//! Size-targeted compression pipeline: probe, plan, two-pass encode, verify.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use tempfile::TempPath;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::bitrate::{BitratePlan, BitratePolicy, calculate_bitrate};
use crate::config::{CompressorConfig, DEFAULT_TARGET_SIZE_MB};
use crate::dimensions::{Dimensions, plan_dimensions};
use crate::encoder::{EncodeJob, TwoPassEncoder};
use crate::error::CompressionError;
use crate::ffmpeg::{EncoderTools, MediaInfo, probe_media};
use crate::progress::{CompressionStage, ProgressSink, emit_stage};
use crate::workspace::{ARTIFACT_PREFIX, Workspace, WorkspaceManager};

const INPUT_NAME: &str = "input.mp4";
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Where the source video comes from. Either way it ends up inside the request's workspace.
#[derive(Debug, Clone)]
pub enum SourceMedia {
    /// Uploaded content, written into the workspace.
    Bytes(Bytes),
    /// An existing file, moved into the workspace.
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct CompressionRequest {
    pub source: SourceMedia,
    pub target_size_mb: Option<f64>,
    pub maintain_aspect_ratio: Option<bool>,
}

impl CompressionRequest {
    pub fn new(source: SourceMedia) -> Self {
        Self {
            source,
            target_size_mb: None,
            maintain_aspect_ratio: None,
        }
    }

    pub fn with_target_size_mb(mut self, target_size_mb: f64) -> Self {
        self.target_size_mb = Some(target_size_mb);
        self
    }

    pub fn with_maintain_aspect_ratio(mut self, maintain: bool) -> Self {
        self.maintain_aspect_ratio = Some(maintain);
        self
    }

    pub fn effective_target_size_mb(&self) -> f64 {
        self.target_size_mb.unwrap_or(DEFAULT_TARGET_SIZE_MB)
    }

    pub fn effective_maintain_aspect_ratio(&self) -> bool {
        self.maintain_aspect_ratio.unwrap_or(true)
    }

    /// Largest acceptable output, in bytes.
    pub fn size_limit_bytes(&self) -> u64 {
        (self.effective_target_size_mb() * BYTES_PER_MB).floor() as u64
    }

    pub async fn validate(&self) -> Result<(), CompressionError> {
        let target = self.effective_target_size_mb();
        if !target.is_finite() || target <= 0.0 {
            return Err(CompressionError::InvalidRequest(format!(
                "target_size_mb must be a positive number, got {}",
                target
            )));
        }
        match &self.source {
            SourceMedia::Bytes(b) if b.is_empty() => Err(CompressionError::InvalidRequest(
                "No file content provided".to_string(),
            )),
            SourceMedia::Bytes(_) => Ok(()),
            SourceMedia::File(p) => match tokio::fs::metadata(p).await {
                Ok(meta) if meta.is_file() => Ok(()),
                _ => Err(CompressionError::InvalidRequest(format!(
                    "Input file {} does not exist",
                    p.display()
                ))),
            },
        }
    }
}

/// Finished output, moved out of its workspace. Deleted when dropped unless persisted.
#[derive(Debug)]
pub struct CompressedArtifact {
    path: TempPath,
    size_bytes: u64,
    media: MediaInfo,
    plan: BitratePlan,
    dimensions: Dimensions,
}

/// Summary of a finished compression, for logs and response headers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactSummary {
    pub size_bytes: u64,
    pub video_bitrate_bps: u64,
    pub audio_bitrate_bps: u64,
    pub width: u32,
    pub height: u32,
    pub source_duration_seconds: f64,
}

impl CompressedArtifact {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn media(&self) -> &MediaInfo {
        &self.media
    }

    pub fn plan(&self) -> &BitratePlan {
        &self.plan
    }

    pub fn dimensions(&self) -> Dimensions {
        self.dimensions
    }

    pub fn summary(&self) -> ArtifactSummary {
        ArtifactSummary {
            size_bytes: self.size_bytes,
            video_bitrate_bps: self.plan.video_bitrate_bps,
            audio_bitrate_bps: self.plan.audio_bitrate_bps,
            width: self.dimensions.width,
            height: self.dimensions.height,
            source_duration_seconds: self.media.duration_seconds,
        }
    }

    pub async fn read_bytes(&self) -> std::io::Result<Vec<u8>> {
        tokio::fs::read(&self.path).await
    }

    /// Keep the file at `dest` instead of deleting it on drop.
    pub async fn persist(self, dest: impl AsRef<Path>) -> Result<PathBuf, CompressionError> {
        let dest = dest.as_ref().to_path_buf();
        if tokio::fs::rename(&self.path, &dest).await.is_ok() {
            // Nothing is left at the temp location to clean up.
            let _ = self.path.keep();
            return Ok(dest);
        }
        // Cross-device targets cannot be renamed into; copy instead.
        tokio::fs::copy(&self.path, &dest)
            .await
            .map_err(|e| CompressionError::workspace(&dest, e))?;
        Ok(dest)
    }
}

pub struct CompressionOrchestrator {
    config: CompressorConfig,
    tools: EncoderTools,
    workspaces: WorkspaceManager,
    permits: Arc<Semaphore>,
}

impl CompressionOrchestrator {
    pub fn new(config: CompressorConfig, tools: EncoderTools) -> Self {
        let workspaces = WorkspaceManager::new(config.effective_temp_root());
        let permits = Arc::new(Semaphore::new(config.effective_max_concurrent_jobs()));
        Self {
            config,
            tools,
            workspaces,
            permits,
        }
    }

    /// Build an orchestrator, locating ffmpeg/ffprobe from the config and environment.
    pub fn from_config(config: CompressorConfig) -> Result<Self, CompressionError> {
        let tools = EncoderTools::discover(&config)?;
        Ok(Self::new(config, tools))
    }

    pub fn config(&self) -> &CompressorConfig {
        &self.config
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    /// Pipelines that could start right now without queueing.
    pub fn available_slots(&self) -> usize {
        self.permits.available_permits()
    }

    /// Compress `request` to fit its target size.
    ///
    /// Returns exactly one artifact on success and none on failure; the request's
    /// workspace is gone by the time this returns either way. Dropping the future
    /// kills any running ffmpeg/ffprobe and removes the workspace.
    pub async fn compress(
        &self,
        request: CompressionRequest,
        progress: Option<ProgressSink>,
        cancel: &CancellationToken,
    ) -> Result<CompressedArtifact, CompressionError> {
        request.validate().await?;

        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CompressionError::Cancelled),
            permit = self.permits.acquire() => permit.map_err(|_| CompressionError::Cancelled)?,
        };

        let workspace = self.workspaces.acquire()?;
        let job_name = workspace
            .path()
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        log::info!(
            target: "mp4_squeeze::orchestrator",
            "[{}] Compressing to {:.2}MB (maintain_aspect_ratio={})",
            job_name,
            request.effective_target_size_mb(),
            request.effective_maintain_aspect_ratio()
        );

        let outcome = self
            .run_pipeline(&workspace, request, progress.as_ref(), cancel)
            .await;

        match outcome {
            Ok(artifact) => {
                workspace.release()?;
                log::info!(
                    target: "mp4_squeeze::orchestrator",
                    "[{}] Done: {} bytes, {}",
                    job_name,
                    artifact.size_bytes,
                    artifact.dimensions
                );
                Ok(artifact)
            }
            Err(e) => {
                if let Err(release_err) = workspace.release() {
                    log::error!(
                        target: "mp4_squeeze::orchestrator",
                        "[{}] Cleanup after failure also failed: {}",
                        job_name,
                        release_err
                    );
                }
                log::warn!(
                    target: "mp4_squeeze::orchestrator",
                    "[{}] Failed ({}): {}",
                    job_name,
                    e.kind(),
                    e
                );
                Err(e)
            }
        }
    }

    async fn run_pipeline(
        &self,
        workspace: &Workspace,
        request: CompressionRequest,
        progress: Option<&ProgressSink>,
        cancel: &CancellationToken,
    ) -> Result<CompressedArtifact, CompressionError> {
        let target_size_mb = request.effective_target_size_mb();
        let size_limit = request.size_limit_bytes();
        let maintain_aspect_ratio = request.effective_maintain_aspect_ratio();

        let input = workspace.file(INPUT_NAME);
        place_source(request.source, &input).await?;

        emit_stage(progress, CompressionStage::Probing);
        let media = probe_media(
            &self.tools.ffprobe,
            &input,
            self.config.probe_timeout(),
            cancel,
        )
        .await?;

        let dimensions = plan_dimensions(
            media.dimensions(),
            maintain_aspect_ratio,
            self.config.max_edge,
            self.config.fallback_dimensions,
        );
        let plan = calculate_bitrate(
            target_size_mb,
            media.duration_seconds,
            media.has_audio,
            &BitratePolicy::from(&self.config),
        )?;
        log::info!(
            target: "mp4_squeeze::orchestrator",
            "Plan: video={}bps audio={}bps size={} (source {}x{}, {:.2}s)",
            plan.video_bitrate_bps,
            plan.audio_bitrate_bps,
            dimensions,
            media.width,
            media.height,
            media.duration_seconds
        );

        let job = EncodeJob {
            workspace,
            input: &input,
            media: &media,
            plan,
            dimensions,
        };
        let mut encoder = TwoPassEncoder::new(
            &self.tools.ffmpeg,
            &job,
            &self.config.preset,
            self.config.encode_pass_timeout(),
        );
        let output = encoder.run(progress, cancel).await?;

        emit_stage(progress, CompressionStage::Finalizing);
        let size_bytes = tokio::fs::metadata(&output)
            .await
            .map_err(|e| CompressionError::workspace(&output, e))?
            .len();
        if size_bytes > size_limit {
            return Err(CompressionError::TargetSizeExceeded {
                actual_bytes: size_bytes,
                limit_bytes: size_limit,
            });
        }

        let path = self.move_out(&output).await?;
        Ok(CompressedArtifact {
            path,
            size_bytes,
            media,
            plan,
            dimensions,
        })
    }

    /// Move the encoded file next to the workspaces, as a self-deleting temp file.
    async fn move_out(&self, output: &Path) -> Result<TempPath, CompressionError> {
        let root = self.workspaces.root();
        let target = tempfile::Builder::new()
            .prefix(ARTIFACT_PREFIX)
            .suffix(".mp4")
            .tempfile_in(root)
            .map_err(|e| CompressionError::workspace(root, e))?
            .into_temp_path();
        tokio::fs::rename(output, &target)
            .await
            .map_err(|e| CompressionError::workspace(output, e))?;
        Ok(target)
    }
}

async fn place_source(source: SourceMedia, input: &Path) -> Result<(), CompressionError> {
    match source {
        SourceMedia::Bytes(bytes) => tokio::fs::write(input, &bytes)
            .await
            .map_err(|e| CompressionError::workspace(input, e)),
        SourceMedia::File(path) => {
            if tokio::fs::rename(&path, input).await.is_ok() {
                return Ok(());
            }
            tokio::fs::copy(&path, input)
                .await
                .map_err(|e| CompressionError::workspace(input, e))?;
            if let Err(e) = tokio::fs::remove_file(&path).await {
                log::warn!(
                    target: "mp4_squeeze::orchestrator",
                    "Copied {} into workspace but could not remove original: {}",
                    path.display(),
                    e
                );
            }
            Ok(())
        }
    }
}
