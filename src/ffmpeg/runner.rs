//! Supervised execution of ffmpeg/ffprobe.
//!
//! Every invocation is scoped: it carries a timeout and a cancellation token, its
//! stderr tail is captured for error reporting, and on timeout, cancellation or drop
//! the child is killed and reaped before control returns. When progress tracking
//! is requested, stdout is read as `-progress pipe:1` output instead of being captured.

use std::io;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use super::error::stderr_preview;
use super::progress::{ProgressLine, parse_progress_line, progress_fraction};
use crate::error::CompressionError;

/// Minimum interval between progress callbacks.
const PROGRESS_EMIT_INTERVAL: Duration = Duration::from_millis(150);
/// Keep only the last N bytes of stderr to avoid unbounded memory growth.
const MAX_STDERR_BYTES: usize = 64 * 1024;

/// Receives normalized progress in [0, 1].
pub type ProgressCallback<'a> = &'a (dyn Fn(f64) + Send + Sync);

pub struct ProgressTracking<'a> {
    pub duration_secs: Option<f64>,
    pub callback: ProgressCallback<'a>,
}

pub struct ToolRun<'a> {
    pub program: &'a Path,
    pub args: &'a [String],
    pub timeout: Duration,
    pub cancel: &'a CancellationToken,
    pub progress: Option<ProgressTracking<'a>>,
}

#[derive(Debug, Default)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("failed to spawn: {0}")]
    Spawn(#[source] io::Error),

    #[error("exited with code {code}")]
    Failed { code: i32, stderr: String },

    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    #[error("cancelled")]
    Cancelled,

    #[error("I/O error while supervising process: {0}")]
    Io(#[source] io::Error),
}

impl ToolError {
    /// Maps a probe failure. Timeouts and cancellation keep their own kinds.
    pub fn into_probe_error(self, timeout_stage: &'static str) -> CompressionError {
        match self {
            ToolError::TimedOut(timeout) => CompressionError::EncodeTimeout {
                stage: timeout_stage,
                timeout,
            },
            ToolError::Cancelled => CompressionError::Cancelled,
            ToolError::Failed { code, stderr } => CompressionError::Probe(format!(
                "ffprobe exited with code {}: {}",
                code,
                stderr_preview(&stderr, 3)
            )),
            other => CompressionError::Probe(other.to_string()),
        }
    }

    pub fn into_pass_error(self, pass: u8, timeout_stage: &'static str) -> CompressionError {
        match self {
            ToolError::TimedOut(timeout) => CompressionError::EncodeTimeout {
                stage: timeout_stage,
                timeout,
            },
            ToolError::Cancelled => CompressionError::Cancelled,
            ToolError::Failed { code, stderr } => CompressionError::encode_pass(pass, code, stderr),
            ToolError::Spawn(e) => CompressionError::encode_pass(pass, -1, e.to_string()),
            ToolError::Io(e) => CompressionError::encode_pass(pass, -1, e.to_string()),
        }
    }
}

fn program_name(program: &Path) -> String {
    program
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| program.to_string_lossy().to_string())
}

async fn read_stderr_tail<R: AsyncRead + Unpin>(reader: R) -> io::Result<String> {
    let mut reader = BufReader::new(reader);
    let mut tail: Vec<u8> = Vec::new();
    let mut line_buf = Vec::with_capacity(256);
    while reader.read_until(b'\n', &mut line_buf).await? > 0 {
        tail.extend_from_slice(&line_buf);
        if tail.len() > MAX_STDERR_BYTES {
            let excess = tail.len() - MAX_STDERR_BYTES;
            tail.drain(..excess);
        }
        line_buf.clear();
    }
    Ok(String::from_utf8_lossy(&tail).into_owned())
}

async fn read_stdout<R: AsyncRead + Unpin>(
    reader: R,
    progress: Option<&ProgressTracking<'_>>,
) -> io::Result<String> {
    let Some(tracking) = progress else {
        let mut out = String::new();
        BufReader::new(reader).read_to_string(&mut out).await?;
        return Ok(out);
    };

    let mut reader = BufReader::new(reader);
    let mut line_buf = Vec::with_capacity(128);
    let mut last_emit = Instant::now();
    let mut last_progress = 0.0_f64;
    while reader.read_until(b'\n', &mut line_buf).await? > 0 {
        let fraction = match parse_progress_line(&String::from_utf8_lossy(&line_buf)) {
            Some(ProgressLine::Position(secs)) => progress_fraction(secs, tracking.duration_secs),
            Some(ProgressLine::End) => Some(1.0),
            None => None,
        };
        if let Some(p) = fraction {
            let now = Instant::now();
            let should_emit = now.duration_since(last_emit) >= PROGRESS_EMIT_INTERVAL
                || (p - last_progress).abs() >= 0.01
                || p >= 1.0;
            if should_emit {
                last_emit = now;
                last_progress = p;
                (tracking.callback)(p);
            }
        }
        line_buf.clear();
    }
    Ok(String::new())
}

/// Kills the child's whole process group when dropped, unless disarmed.
///
/// The child is spawned as a group leader, so anything it forks (wrapper scripts,
/// shims) shares its group and dies with it.
struct ProcessGroupGuard {
    pgid: Option<u32>,
}

impl ProcessGroupGuard {
    fn new(pgid: Option<u32>) -> Self {
        Self { pgid }
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }

    fn kill_now(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            kill_group(pgid);
        }
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        self.kill_now();
    }
}

#[cfg(unix)]
fn kill_group(pgid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => log::warn!(
            target: "mp4_squeeze::ffmpeg::runner",
            "Failed to kill process group {}: {}",
            pgid,
            e
        ),
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: u32) {}

async fn terminate(child: &mut Child, group: &mut ProcessGroupGuard, name: &str) {
    log::warn!(
        target: "mp4_squeeze::ffmpeg::runner",
        "Terminating {} (pid={:?})",
        name,
        child.id()
    );
    group.kill_now();
    if let Err(e) = child.kill().await {
        log::error!(
            target: "mp4_squeeze::ffmpeg::runner",
            "Failed to kill {}: {}",
            name,
            e
        );
    }
}

/// Run a tool to completion under the given timeout and cancellation token.
///
/// Returns `ToolError::Failed` for a non-zero exit. On timeout or cancellation the
/// child's process group is killed and the child reaped before this returns; if the
/// future itself is dropped, the group guard and `kill_on_drop` take over.
pub async fn run_tool(run: ToolRun<'_>) -> Result<ToolOutput, ToolError> {
    let name = program_name(run.program);
    let input_arg = run
        .args
        .iter()
        .position(|a| a == "-i")
        .and_then(|i| run.args.get(i + 1));
    log::debug!(
        target: "mp4_squeeze::ffmpeg::runner",
        "Spawning {}: input={:?}, output={:?}, timeout={:?}",
        name,
        input_arg,
        run.args.last(),
        run.timeout
    );

    if run.cancel.is_cancelled() {
        return Err(ToolError::Cancelled);
    }

    let mut cmd = Command::new(run.program);
    cmd.args(run.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);
    #[cfg(windows)]
    cmd.creation_flags(0x08000000); // CREATE_NO_WINDOW
    let mut child = cmd.spawn().map_err(ToolError::Spawn)?;
    let mut group = ProcessGroupGuard::new(child.id());

    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        terminate(&mut child, &mut group, &name).await;
        return Err(ToolError::Io(io::Error::other("failed to capture output streams")));
    };

    let started = Instant::now();
    let supervised = async {
        tokio::join!(
            read_stdout(stdout, run.progress.as_ref()),
            read_stderr_tail(stderr),
            child.wait(),
        )
    };

    let outcome = tokio::select! {
        biased;
        _ = run.cancel.cancelled() => Err(ToolError::Cancelled),
        res = tokio::time::timeout(run.timeout, supervised) => {
            res.map_err(|_| ToolError::TimedOut(run.timeout))
        }
    };

    let (stdout, stderr, status) = match outcome {
        Ok(parts) => parts,
        Err(e) => {
            terminate(&mut child, &mut group, &name).await;
            return Err(e);
        }
    };
    group.disarm();

    let status = status.map_err(ToolError::Io)?;
    let stderr = stderr.map_err(ToolError::Io)?;
    let stdout = stdout.map_err(ToolError::Io)?;

    if status.success() {
        log::info!(
            target: "mp4_squeeze::ffmpeg::runner",
            "{} completed in {:.1}s",
            name,
            started.elapsed().as_secs_f64()
        );
        Ok(ToolOutput { stdout, stderr })
    } else {
        let code = status.code().unwrap_or(-1);
        log::error!(
            target: "mp4_squeeze::ffmpeg::runner",
            "{} failed (code={}): {}",
            name,
            code,
            stderr_preview(&stderr, 3)
        );
        Err(ToolError::Failed { code, stderr })
    }
}
