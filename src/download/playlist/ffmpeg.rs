use std::collections::VecDeque;
use std::path::Path;

use url::Url;

const TAIL_LINES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestKind {
    Hls,
    Dash,
}

/// Arguments for a copy-only remux of `input` into an mp4 at `output`.
pub fn remux_args(input: &Url, kind: ManifestKind, output: &Path, user_agent: &str, referer: Option<&str>) -> Vec<String> {
    let mut args = vec![
        "-hide_banner".to_string(),
        "-nostats".to_string(),
        "-progress".to_string(),
        "pipe:2".to_string(),
        "-user_agent".to_string(),
        user_agent.to_string(),
    ];
    if let Some(referer) = referer {
        args.push("-headers".to_string());
        args.push(format!("Referer: {referer}\r\nOrigin: {referer}\r\n"));
    }
    args.extend(["-i".to_string(), input.to_string(), "-c".to_string(), "copy".to_string()]);
    if kind == ManifestKind::Hls {
        // ADTS audio from transport streams needs repacking for mp4
        args.extend(["-bsf:a".to_string(), "aac_adtstoasc".to_string()]);
    }
    args.extend([
        "-movflags".to_string(),
        "+faststart".to_string(),
        "-f".to_string(),
        "mp4".to_string(),
        "-y".to_string(),
        output.to_string_lossy().into_owned(),
    ]);
    args
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemuxUpdate {
    /// Total media duration in microseconds.
    Duration(u64),
    /// Media time processed so far in microseconds.
    Elapsed(u64),
}

/// Follows the remux process's stderr: picks out the duration announcement
/// and elapsed counters, and keeps the last few diagnostic lines.
#[derive(Debug, Default)]
pub struct RemuxWatcher {
    duration: Option<u64>,
    tail: VecDeque<String>,
}

impl RemuxWatcher {
    pub fn observe(&mut self, line: &str) -> Option<RemuxUpdate> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        if let Some(value) = parse_progress_field(line) {
            return Some(RemuxUpdate::Elapsed(value));
        }
        if is_progress_key(line) {
            return None;
        }

        self.remember(line);
        if self.duration.is_none() {
            if let Some(duration) = parse_duration_line(line) {
                self.duration = Some(duration);
                return Some(RemuxUpdate::Duration(duration));
            }
        }
        None
    }

    pub fn duration(&self) -> Option<u64> {
        self.duration
    }

    pub fn tail(&self) -> String {
        self.tail.iter().cloned().collect::<Vec<_>>().join(" | ")
    }

    fn remember(&mut self, line: &str) {
        if self.tail.len() == TAIL_LINES {
            self.tail.pop_front();
        }
        self.tail.push_back(line.to_string());
    }
}

/// `out_time_us=N` or `out_time_ms=N`, both in microseconds.
fn parse_progress_field(line: &str) -> Option<u64> {
    let (key, value) = line.split_once('=')?;
    match key {
        "out_time_us" | "out_time_ms" => value.trim().parse().ok(),
        _ => None,
    }
}

fn is_progress_key(line: &str) -> bool {
    match line.split_once('=') {
        Some((key, value)) => {
            !key.is_empty()
                && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                && !value.contains(char::is_whitespace)
        }
        None => false,
    }
}

/// `Duration: 00:01:02.50, start: ...` as printed for the input.
fn parse_duration_line(line: &str) -> Option<u64> {
    let rest = line.split_once("Duration:")?.1.trim_start();
    let stamp = rest.split([',', ' ']).next()?;
    parse_timestamp(stamp)
}

fn parse_timestamp(stamp: &str) -> Option<u64> {
    let mut parts = stamp.split(':');
    let hours: u64 = parts.next()?.parse().ok()?;
    let minutes: u64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || seconds < 0.0 {
        return None;
    }
    let whole = (hours * 3600 + minutes * 60) * 1_000_000;
    Some(whole + (seconds * 1_000_000.0).round() as u64)
}
