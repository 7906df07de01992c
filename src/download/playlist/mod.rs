pub mod ffmpeg;

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Instant;

use indicatif::ProgressBar;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::download::progress::{Progress, ProgressSnapshot};
use crate::download::staging_path;
use crate::error::{DownloadError, Result};
use crate::options::Options;

pub use ffmpeg::ManifestKind;
use ffmpeg::{remux_args, RemuxUpdate, RemuxWatcher};

/// Hands a segmented manifest to an external remuxer and checks what it
/// produced.
pub struct ExternalRemuxStrategy {
    program: PathBuf,
    min_output_size: u64,
    user_agent: String,
    referer: Option<String>,
    progress: Progress,
}

impl ExternalRemuxStrategy {
    pub fn new(options: &Options, progress: Progress) -> Self {
        Self {
            program: options.ffmpeg.clone(),
            min_output_size: options.min_output_size,
            user_agent: options.user_agent.clone(),
            referer: options.referer.clone(),
            progress,
        }
    }

    pub async fn transfer(
        &self,
        manifest: &Url,
        kind: ManifestKind,
        destination: &Path,
        label: &str,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let staging = staging_path(destination);
        let args = remux_args(manifest, kind, &staging, &self.user_agent, self.referer.as_deref());
        debug!(program = %self.program.display(), ?args, "starting remux");

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| DownloadError::RemuxFailed {
                code: None,
                detail: format!("could not start {}: {}", self.program.display(), err),
            })?;

        let stderr = child.stderr.take().ok_or_else(|| DownloadError::RemuxFailed {
            code: None,
            detail: "remux stderr was not captured".to_string(),
        })?;

        let bar = self.progress.remux_bar(label);
        let finished = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            done = follow(&mut child, stderr, &bar) => Some(done),
        };
        self.progress.remove(&bar);

        let Some((watcher, status)) = finished else {
            if let Err(err) = child.kill().await {
                warn!(error = %err, "failed to kill remux process");
            }
            discard(&staging).await;
            return Err(DownloadError::Cancelled);
        };

        let status = status.map_err(|err| DownloadError::RemuxFailed {
            code: None,
            detail: format!("waiting for remux process: {err}"),
        })?;
        if !status.success() {
            discard(&staging).await;
            return Err(DownloadError::RemuxFailed { code: status.code(), detail: watcher.tail() });
        }

        let size = match tokio::fs::metadata(&staging).await {
            Ok(metadata) => metadata.len(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => 0,
            Err(err) => return Err(DownloadError::fs(&staging, err)),
        };
        if size < self.min_output_size {
            discard(&staging).await;
            return Err(DownloadError::CorruptOutput {
                path: destination.to_path_buf(),
                size,
                minimum: self.min_output_size,
            });
        }

        tokio::fs::rename(&staging, destination)
            .await
            .map_err(|err| DownloadError::fs(destination, err))?;

        info!(path = %destination.display(), bytes = size, duration_us = ?watcher.duration(), "remux complete");
        Ok(size)
    }
}

async fn follow(child: &mut Child, stderr: ChildStderr, bar: &ProgressBar) -> (RemuxWatcher, std::io::Result<ExitStatus>) {
    let mut watcher = RemuxWatcher::default();
    let mut lines = BufReader::new(stderr).split(b'\n');
    let started = Instant::now();

    loop {
        let raw = match lines.next_segment().await {
            Ok(Some(raw)) => raw,
            Ok(None) => break,
            Err(err) => {
                warn!(error = %err, "stopped reading remux output");
                break;
            }
        };
        let line = String::from_utf8_lossy(&raw);
        match watcher.observe(line.trim_end_matches('\r')) {
            Some(RemuxUpdate::Duration(total)) => bar.set_length(total),
            Some(RemuxUpdate::Elapsed(media_time)) => {
                let total = watcher.duration();
                bar.set_position(total.map_or(media_time, |total| media_time.min(total)));

                let snapshot = ProgressSnapshot { downloaded: media_time, total, elapsed: started.elapsed() };
                if let Some(eta) = snapshot.eta() {
                    bar.set_message(format!("eta {}s", eta.as_secs()));
                }
            }
            None => {}
        }
    }

    // The pipe must close before waiting or a chatty child blocks on a full buffer.
    drop(lines);
    let status = child.wait().await;
    (watcher, status)
}

async fn discard(path: &Path) {
    if let Err(err) = tokio::fs::remove_file(path).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %err, "failed to remove remux output");
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;

    /// Stand-in remuxer: writes `$SIZE` bytes to its last argument and exits
    /// with `$EXIT`, printing ffmpeg-like progress on stderr.
    fn write_script(dir: &Path, size: u64, exit: i32, sleep: u32) -> PathBuf {
        let path = dir.join(format!("fake-ffmpeg-{size}-{exit}-{sleep}"));
        let script = format!(
            "#!/bin/sh\n\
             for last in \"$@\"; do :; done\n\
             echo '  Duration: 00:00:10.00, start: 0.000000, bitrate: 0 kb/s' >&2\n\
             echo 'out_time_us=5000000' >&2\n\
             sleep {sleep}\n\
             head -c {size} /dev/zero > \"$last\"\n\
             echo 'out_time_us=10000000' >&2\n\
             echo 'progress=end' >&2\n\
             if [ {exit} -ne 0 ]; then echo 'Invalid data found when processing input' >&2; fi\n\
             exit {exit}\n"
        );
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// Like `write_script`, but first prints a title that is not UTF-8 and
    /// then far more progress than a pipe buffer holds.
    fn write_noisy_script(dir: &Path, size: u64) -> PathBuf {
        let path = dir.join(format!("noisy-ffmpeg-{size}"));
        let script = format!(
            "#!/bin/sh\n\
             for last in \"$@\"; do :; done\n\
             printf 'Input #0, hls, from master.m3u8:\\n  Metadata:\\n    title: caf\\351\\n' >&2\n\
             echo '  Duration: 00:00:10.00, start: 0.000000, bitrate: 0 kb/s' >&2\n\
             i=0\n\
             while [ $i -lt 3000 ]; do echo \"out_time_us=$i\" >&2; echo 'progress=continue' >&2; i=$((i+1)); done\n\
             head -c {size} /dev/zero > \"$last\"\n\
             echo 'progress=end' >&2\n\
             exit 0\n"
        );
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn strategy(program: PathBuf) -> ExternalRemuxStrategy {
        let options = Options { ffmpeg: program, min_output_size: 1024 * 1024, ..Options::default() };
        ExternalRemuxStrategy::new(&options, Progress::hidden())
    }

    // Scripts are written up front and run in one test so no script is still
    // open for writing while another test forks.
    #[tokio::test]
    async fn remux_process_contract() {
        let dir = tempfile::tempdir().unwrap();
        let ok = write_script(dir.path(), 2 * 1024 * 1024, 0, 0);
        let failing = write_script(dir.path(), 2 * 1024 * 1024, 1, 0);
        let tiny = write_script(dir.path(), 1000, 0, 0);
        let slow = write_script(dir.path(), 2 * 1024 * 1024, 0, 30);
        let noisy = write_noisy_script(dir.path(), 2 * 1024 * 1024);
        let manifest = Url::parse("https://cdn.test/master.m3u8").unwrap();
        let cancel = CancellationToken::new();

        let destination = dir.path().join("ok.mp4");
        let size = strategy(ok)
            .transfer(&manifest, ManifestKind::Hls, &destination, "ok", &cancel)
            .await
            .unwrap();
        assert_eq!(size, 2 * 1024 * 1024);
        assert_eq!(std::fs::metadata(&destination).unwrap().len(), size);
        assert!(!staging_path(&destination).exists());

        let destination = dir.path().join("failing.mp4");
        let err = strategy(failing)
            .transfer(&manifest, ManifestKind::Dash, &destination, "failing", &cancel)
            .await
            .unwrap_err();
        match err {
            DownloadError::RemuxFailed { code, detail } => {
                assert_eq!(code, Some(1));
                assert!(detail.contains("Invalid data"), "{detail}");
            }
            other => panic!("expected remux failure, got {other:?}"),
        }
        assert!(!destination.exists());
        assert!(!staging_path(&destination).exists());

        let destination = dir.path().join("tiny.mp4");
        let err = strategy(tiny)
            .transfer(&manifest, ManifestKind::Hls, &destination, "tiny", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::CorruptOutput { size: 1000, .. }));
        assert!(!destination.exists());
        assert!(!staging_path(&destination).exists());

        let destination = dir.path().join("noisy.mp4");
        let size = tokio::time::timeout(
            Duration::from_secs(20),
            strategy(noisy).transfer(&manifest, ManifestKind::Hls, &destination, "noisy", &cancel),
        )
        .await
        .expect("remux with undecodable stderr must still finish")
        .unwrap();
        assert_eq!(size, 2 * 1024 * 1024);
        assert!(destination.exists());

        let destination = dir.path().join("slow.mp4");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });
        let started = std::time::Instant::now();
        let err = strategy(slow)
            .transfer(&manifest, ManifestKind::Hls, &destination, "slow", &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!destination.exists());
    }

    #[tokio::test]
    async fn missing_program_is_a_remux_failure() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = Url::parse("https://cdn.test/master.mpd").unwrap();
        let err = strategy(dir.path().join("does-not-exist"))
            .transfer(&manifest, ManifestKind::Dash, &dir.path().join("x.mp4"), "x", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::RemuxFailed { code: None, .. }));
    }
}
