use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use mp4_squeeze::server::{self, AppContext, ServerOptions};
use mp4_squeeze::{CompressionOrchestrator, CompressorConfig};

const STARTUP_CLEANUP_MAX_AGE_HOURS: u64 = 24;

/// Re-encodes uploaded MP4 files to fit a target size.
#[derive(Debug, Parser)]
#[command(name = "mp4-squeeze-server", version)]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "MP4_SQUEEZE_BIND", default_value = "0.0.0.0:8000")]
    bind: SocketAddr,

    /// Fraction of the requested size handed to the encoder.
    #[arg(long, env = "MP4_SQUEEZE_SAFETY_MARGIN", default_value_t = mp4_squeeze::config::DEFAULT_SAFETY_MARGIN)]
    safety_margin: f64,

    #[arg(long, env = "MP4_SQUEEZE_MIN_VIDEO_BITRATE", default_value_t = mp4_squeeze::config::DEFAULT_MIN_VIDEO_BITRATE_BPS)]
    min_video_bitrate: u64,

    #[arg(long, env = "MP4_SQUEEZE_AUDIO_BITRATE", default_value_t = mp4_squeeze::config::DEFAULT_AUDIO_BITRATE_BPS)]
    audio_bitrate: u64,

    /// Longest output edge when the aspect ratio is kept.
    #[arg(long, env = "MP4_SQUEEZE_MAX_EDGE", default_value_t = mp4_squeeze::config::DEFAULT_MAX_EDGE)]
    max_edge: u32,

    #[arg(long, env = "MP4_SQUEEZE_PRESET", default_value = "medium")]
    preset: String,

    #[arg(long, env = "MP4_SQUEEZE_PROBE_TIMEOUT_SECS", default_value_t = 30)]
    probe_timeout_secs: u64,

    #[arg(long, env = "MP4_SQUEEZE_PASS_TIMEOUT_SECS", default_value_t = 1800)]
    pass_timeout_secs: u64,

    /// Encodes allowed to run at once; further requests wait.
    #[arg(long, env = "MP4_SQUEEZE_MAX_JOBS", default_value_t = 2)]
    max_jobs: usize,

    /// Parent directory for per-request workspaces.
    #[arg(long, env = "MP4_SQUEEZE_TEMP_ROOT")]
    temp_root: Option<PathBuf>,

    #[arg(long, env = "FFMPEG_PATH")]
    ffmpeg: Option<PathBuf>,

    #[arg(long, env = "FFPROBE_PATH")]
    ffprobe: Option<PathBuf>,

    /// Largest accepted upload, in MiB.
    #[arg(long, env = "MP4_SQUEEZE_MAX_UPLOAD_MB", default_value_t = 512)]
    max_upload_mb: usize,

    /// Allowed CORS origins, comma separated. `*` allows any origin.
    #[arg(
        long,
        env = "MP4_SQUEEZE_CORS_ORIGINS",
        value_delimiter = ',',
        default_value = "http://localhost:3000,https://daftaros.com"
    )]
    cors_origins: Vec<String>,
}

impl Args {
    fn compressor_config(&self) -> CompressorConfig {
        CompressorConfig {
            safety_margin: self.safety_margin,
            min_video_bitrate_bps: self.min_video_bitrate,
            audio_bitrate_bps: self.audio_bitrate,
            max_edge: self.max_edge,
            preset: self.preset.clone(),
            probe_timeout_secs: self.probe_timeout_secs,
            encode_pass_timeout_secs: self.pass_timeout_secs,
            max_concurrent_jobs: self.max_jobs,
            temp_root: self.temp_root.clone(),
            ffmpeg_path: self.ffmpeg.clone(),
            ffprobe_path: self.ffprobe.clone(),
            ..CompressorConfig::default()
        }
    }

    fn server_options(&self) -> ServerOptions {
        ServerOptions {
            allowed_origins: self
                .cors_origins
                .iter()
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect(),
            max_upload_bytes: self.max_upload_mb.saturating_mul(1024 * 1024),
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!(target: "mp4_squeeze::server", "Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let orchestrator = match CompressionOrchestrator::from_config(args.compressor_config()) {
        Ok(o) => o,
        Err(e) => {
            log::error!(target: "mp4_squeeze::server", "{}", e);
            return ExitCode::FAILURE;
        }
    };
    orchestrator
        .workspaces()
        .sweep_stale(Duration::from_secs(STARTUP_CLEANUP_MAX_AGE_HOURS * 3600));

    let listener = match tokio::net::TcpListener::bind(args.bind).await {
        Ok(l) => l,
        Err(e) => {
            log::error!(target: "mp4_squeeze::server", "Failed to bind {}: {}", args.bind, e);
            return ExitCode::FAILURE;
        }
    };

    let ctx = AppContext {
        orchestrator: Arc::new(orchestrator),
        shutdown: CancellationToken::new(),
    };
    match server::serve(listener, ctx, &args.server_options(), shutdown_signal()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!(target: "mp4_squeeze::server", "Server error: {}", e);
            ExitCode::FAILURE
        }
    }
}
