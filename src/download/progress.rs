use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

const ITEM_STYLE: &str =
    "{prefix:>24.cyan.bold} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})";

const REMUX_STYLE: &str = "{prefix:>24.cyan.bold} [{elapsed_precise}] [{bar:40.magenta/blue}] {percent:>3}% {msg}";

const BATCH_STYLE: &str = "{prefix:>24.green.bold} [{elapsed_precise}] [{bar:40.green/white}] {pos}/{len} {msg}";

fn style(template: &str) -> ProgressStyle {
    match ProgressStyle::with_template(template) {
        Ok(style) => style.progress_chars("█▓░"),
        Err(_) => ProgressStyle::default_bar(),
    }
}

/// Point-in-time transfer numbers, independent of how they are drawn.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    pub downloaded: u64,
    pub total: Option<u64>,
    pub elapsed: Duration,
}

impl ProgressSnapshot {
    pub fn percent(&self) -> Option<f64> {
        match self.total {
            Some(0) | None => None,
            Some(total) => Some((self.downloaded.min(total) as f64 / total as f64) * 100.0),
        }
    }

    pub fn bytes_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            0.0
        } else {
            self.downloaded as f64 / secs
        }
    }

    pub fn eta(&self) -> Option<Duration> {
        let total = self.total?;
        let rate = self.bytes_per_sec();
        if rate <= 0.0 {
            return None;
        }
        let remaining = total.saturating_sub(self.downloaded) as f64;
        Some(Duration::from_secs_f64(remaining / rate))
    }
}

/// Batch-wide progress display: one counter bar for items plus a byte bar per
/// active transfer.
#[derive(Clone)]
pub struct Progress {
    multi: MultiProgress,
    batch: ProgressBar,
    succeeded: Arc<AtomicUsize>,
    failed: Arc<AtomicUsize>,
}

impl Progress {
    pub fn new(visible: bool) -> Self {
        let target = if visible {
            ProgressDrawTarget::stderr()
        } else {
            ProgressDrawTarget::hidden()
        };
        let multi = MultiProgress::with_draw_target(target);
        let batch = multi.add(ProgressBar::new(0));
        batch.set_style(style(BATCH_STYLE));
        batch.set_prefix("items");

        Self {
            multi,
            batch,
            succeeded: Arc::new(AtomicUsize::new(0)),
            failed: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn hidden() -> Self {
        Self::new(false)
    }

    pub fn start_batch(&self, name: &str, total: u64) {
        self.batch.set_prefix(name.to_string());
        self.batch.set_length(total);
        self.batch.set_position(0);
        self.succeeded.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
    }

    pub fn item_finished(&self, ok: bool) {
        let counter = if ok { &self.succeeded } else { &self.failed };
        counter.fetch_add(1, Ordering::Relaxed);
        self.batch.inc(1);
        self.batch.set_message(format!(
            "ok {} failed {}",
            self.succeeded.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed)
        ));
    }

    pub fn finish_batch(&self) {
        self.batch.finish();
    }

    pub fn item_bar(&self, label: &str, total: u64) -> ProgressBar {
        let bar = self.multi.add(ProgressBar::new(total));
        bar.set_style(style(ITEM_STYLE));
        bar.set_prefix(label.to_string());
        bar
    }

    /// Remux progress is measured in microseconds of media time.
    pub fn remux_bar(&self, label: &str) -> ProgressBar {
        let bar = self.multi.add(ProgressBar::new(0));
        bar.set_style(style(REMUX_STYLE));
        bar.set_prefix(label.to_string());
        bar
    }

    pub fn remove(&self, bar: &ProgressBar) {
        bar.finish_and_clear();
        self.multi.remove(bar);
    }

    pub fn log_writer(&self) -> LogWriter {
        LogWriter { multi: self.multi.clone() }
    }
}

/// Stderr writer for log lines. The bars are cleared while a line is written
/// and redrawn below it.
#[derive(Clone)]
pub struct LogWriter {
    multi: MultiProgress,
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.multi.suspend(|| io::stderr().write(buf))
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.multi.suspend(|| io::stderr().write_all(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.multi.suspend(|| io::stderr().flush())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_percent_and_eta() {
        let snapshot = ProgressSnapshot {
            downloaded: 25,
            total: Some(100),
            elapsed: Duration::from_secs(5),
        };
        assert_eq!(snapshot.percent(), Some(25.0));
        assert_eq!(snapshot.bytes_per_sec(), 5.0);
        assert_eq!(snapshot.eta(), Some(Duration::from_secs(15)));
    }

    #[test]
    fn snapshot_without_total_has_no_eta() {
        let snapshot = ProgressSnapshot {
            downloaded: 10,
            total: None,
            elapsed: Duration::from_secs(1),
        };
        assert_eq!(snapshot.percent(), None);
        assert_eq!(snapshot.eta(), None);

        let stalled = ProgressSnapshot { downloaded: 0, total: Some(10), elapsed: Duration::ZERO };
        assert_eq!(stalled.eta(), None);
    }

    #[test]
    fn hidden_bars_track_position() {
        let progress = Progress::hidden();
        progress.start_batch("batch", 2);
        let bar = progress.item_bar("item", 100);
        bar.inc(40);
        assert_eq!(bar.position(), 40);
        progress.item_finished(true);
        progress.item_finished(false);
        assert_eq!(progress.batch.position(), 2);
        progress.remove(&bar);
        progress.finish_batch();
    }

    #[test]
    fn log_writer_keeps_bars_intact() {
        let progress = Progress::hidden();
        let bar = progress.item_bar("item", 100);
        bar.inc(10);

        let mut writer = progress.log_writer();
        writer.write_all(b"INFO vidfetch: chunk complete\n").unwrap();
        writer.flush().unwrap();

        assert_eq!(bar.position(), 10);
        assert!(!bar.is_finished());
    }
}
