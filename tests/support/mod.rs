#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use mp4_squeeze::ffmpeg::EncoderTools;
use mp4_squeeze::{CompressionOrchestrator, CompressionProgress, CompressorConfig, ProgressSink};

/// Stand-in ffprobe: prints `probe.json`, or fails when `probe_fail` exists.
const FAKE_FFPROBE: &str = r#"#!/bin/sh
DIR='@DIR@'
touch "$DIR/ffprobe.called"
if [ -f "$DIR/probe_fail" ]; then
  echo "Invalid data found when processing input" >&2
  exit 1
fi
cat "$DIR/probe.json"
"#;

/// Stand-in ffmpeg: writes the pass log on pass 1 and `output_bytes` zero bytes
/// to the last argument on pass 2. Behaviour switches are files in the env dir.
const FAKE_FFMPEG: &str = r#"#!/bin/sh
DIR='@DIR@'
echo "$*" >> "$DIR/ffmpeg.calls"
pass=""
prefix=""
prev=""
last=""
for arg in "$@"; do
  case "$prev" in
    -pass) pass="$arg" ;;
    -passlogfile) prefix="$arg" ;;
  esac
  prev="$arg"
  last="$arg"
done
if [ -f "$DIR/sleep" ]; then
  echo $$ > "$DIR/ffmpeg.pid"
  exec sleep "$(cat "$DIR/sleep")"
fi
if [ -f "$DIR/delay" ]; then
  mkdir "$DIR/running" 2>/dev/null || touch "$DIR/overlap"
  sleep "$(cat "$DIR/delay")"
  rmdir "$DIR/running" 2>/dev/null
fi
if [ -f "$DIR/fail_pass$pass" ]; then
  echo "[libx264 @ 0x0] Error while opening encoder for output stream #0:0" >&2
  exit 1
fi
echo "out_time_us=500000"
echo "progress=continue"
echo "out_time_us=1000000"
echo "progress=end"
if [ "$pass" = "1" ]; then
  printf 'stats' > "${prefix}-0.log"
else
  head -c "$(cat "$DIR/output_bytes")" /dev/zero > "$last"
fi
exit 0
"#;

pub fn probe_json(duration_secs: f64, width: u32, height: u32, has_audio: bool) -> String {
    let audio = if has_audio {
        r#",{"codec_type":"audio","codec_name":"aac"}"#
    } else {
        ""
    };
    format!(
        r#"{{"format":{{"duration":"{}","format_name":"mov,mp4,m4a,3gp,3g2,mj2"}},"streams":[{{"codec_type":"video","codec_name":"h264","width":{},"height":{}}}{}]}}"#,
        duration_secs, width, height, audio
    )
}

fn write_script(path: &Path, template: &str, dir: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let body = template.replace("@DIR@", &dir.display().to_string());
    fs::write(path, body).expect("write fake tool");
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).expect("chmod fake tool");
}

/// A temp dir holding fake tools plus the workspace root they are used with.
pub struct FakeToolEnv {
    dir: tempfile::TempDir,
    pub tools: EncoderTools,
}

impl FakeToolEnv {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let control = dir.path().join("control");
        fs::create_dir(&control).expect("control dir");
        let ffmpeg = dir.path().join("ffmpeg");
        let ffprobe = dir.path().join("ffprobe");
        write_script(&ffmpeg, FAKE_FFMPEG, &control);
        write_script(&ffprobe, FAKE_FFPROBE, &control);

        let env = Self {
            dir,
            tools: EncoderTools::new(ffmpeg, ffprobe),
        };
        env.set_probe(60.0, 1920, 1080, true);
        env.set_output_bytes(4 * 1024 * 1024);
        env
    }

    fn control(&self, name: &str) -> PathBuf {
        self.dir.path().join("control").join(name)
    }

    pub fn temp_root(&self) -> PathBuf {
        self.dir.path().join("work")
    }

    pub fn config(&self) -> CompressorConfig {
        CompressorConfig {
            temp_root: Some(self.temp_root()),
            probe_timeout_secs: 10,
            encode_pass_timeout_secs: 10,
            ..CompressorConfig::default()
        }
    }

    pub fn orchestrator(&self) -> CompressionOrchestrator {
        self.orchestrator_with(self.config())
    }

    pub fn orchestrator_with(&self, config: CompressorConfig) -> CompressionOrchestrator {
        CompressionOrchestrator::new(config, self.tools.clone())
    }

    pub fn set_probe(&self, duration_secs: f64, width: u32, height: u32, has_audio: bool) {
        fs::write(
            self.control("probe.json"),
            probe_json(duration_secs, width, height, has_audio),
        )
        .expect("write probe.json");
    }

    pub fn set_probe_failure(&self) {
        fs::write(self.control("probe_fail"), b"").expect("write probe_fail");
    }

    pub fn set_output_bytes(&self, bytes: u64) {
        fs::write(self.control("output_bytes"), bytes.to_string()).expect("write output_bytes");
    }

    pub fn fail_pass(&self, pass: u8) {
        fs::write(self.control(&format!("fail_pass{}", pass)), b"").expect("write fail_pass");
    }

    pub fn hang_for_secs(&self, secs: u64) {
        fs::write(self.control("sleep"), secs.to_string()).expect("write sleep");
    }

    /// Slow every ffmpeg run down and record whether two ever ran at once.
    pub fn delay_ffmpeg(&self, secs: f64) {
        fs::write(self.control("delay"), secs.to_string()).expect("write delay");
    }

    pub fn ffmpeg_overlapped(&self) -> bool {
        self.control("overlap").exists()
    }

    /// Pid of the last hung ffmpeg run, once it has started.
    pub fn hung_ffmpeg_pid(&self) -> Option<u32> {
        fs::read_to_string(self.control("ffmpeg.pid"))
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    pub fn ffprobe_called(&self) -> bool {
        self.control("ffprobe.called").exists()
    }

    /// Argument lines of every ffmpeg invocation so far.
    pub fn ffmpeg_calls(&self) -> Vec<String> {
        fs::read_to_string(self.control("ffmpeg.calls"))
            .map(|s| s.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// Per-request workspace directories currently under the temp root.
    pub fn live_workspaces(&self) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(self.temp_root()) else {
            return Vec::new();
        };
        entries
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with("job-"))
            .map(|e| e.path())
            .collect()
    }
}

/// Progress sink that records every event.
pub fn recording_sink() -> (ProgressSink, Arc<Mutex<Vec<CompressionProgress>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let collector = Arc::clone(&events);
    let sink: ProgressSink = Arc::new(move |e| collector.lock().push(e));
    (sink, events)
}

/// True while `pid` exists and is not a zombie.
#[cfg(target_os = "linux")]
pub fn process_alive(pid: u32) -> bool {
    match fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => stat
            .rsplit_once(") ")
            .and_then(|(_, rest)| rest.chars().next())
            .is_some_and(|state| state != 'Z' && state != 'X'),
        Err(_) => false,
    }
}

/// Poll until `pid` has exited, for at most a few seconds.
#[cfg(target_os = "linux")]
pub async fn wait_for_exit(pid: u32) -> bool {
    for _ in 0..60 {
        if !process_alive(pid) {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    false
}
