use regex::Regex;
use std::sync::LazyLock;

// FFmpeg writes microseconds into both keys; out_time_ms is a historical misnomer.
static TIME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^out_time_(?:us|ms)=(\d+)$").expect("invalid time regex"));
static STATUS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^progress=(continue|end)$").expect("invalid status regex"));

/// One meaningful line of `-progress pipe:1` output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProgressLine {
    /// Encoded media position in seconds.
    Position(f64),
    /// Final block of a finished encode.
    End,
}

pub fn parse_progress_line(line: &str) -> Option<ProgressLine> {
    let line = line.trim();
    if let Some(caps) = TIME_RE.captures(line) {
        let micros: u64 = caps[1].parse().ok()?;
        return Some(ProgressLine::Position(micros as f64 / 1_000_000.0));
    }
    if let Some(caps) = STATUS_RE.captures(line) {
        if &caps[1] == "end" {
            return Some(ProgressLine::End);
        }
    }
    None
}

/// Position over duration, clamped to [0, 1]. None while the duration is unknown.
pub fn progress_fraction(position_secs: f64, duration_secs: Option<f64>) -> Option<f64> {
    let duration = duration_secs.filter(|d| *d > 0.0)?;
    Some((position_secs / duration).clamp(0.0, 1.0))
}
