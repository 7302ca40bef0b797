//! Spinner-style progress display
//!
//! Entry names scroll above the spinner when verbose; the spinner line keeps
//! a running count and throughput.

use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::logger::{EntryKind, Logger};

pub struct TransferProgress {
    spinner: ProgressBar,
    start_time: Instant,
    stage: &'static str,
    entries: AtomicU64,
    bytes: AtomicU64,
    show_entries: bool,
}

impl TransferProgress {
    /// `stage` is the verb shown on the status line ("Sending", "Receiving")
    pub fn new(stage: &'static str, verbose: bool) -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
        );
        spinner.enable_steady_tick(Duration::from_millis(100));
        Self::with_bar(spinner, stage, verbose)
    }

    /// Progress that never draws; keeps the counters only
    pub fn hidden(stage: &'static str) -> Self {
        Self::with_bar(ProgressBar::hidden(), stage, false)
    }

    fn with_bar(spinner: ProgressBar, stage: &'static str, verbose: bool) -> Self {
        Self {
            spinner,
            start_time: Instant::now(),
            stage,
            entries: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            show_entries: verbose,
        }
    }

    pub fn entries(&self) -> u64 {
        self.entries.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    fn status(&self, stage: &str, entries: u64, bytes: u64, elapsed_secs: f64) -> String {
        let throughput = if elapsed_secs > 0.1 {
            format!(" @ {:.1} MB/s", bytes as f64 / elapsed_secs / 1_048_576.0)
        } else {
            String::new()
        };
        format!(
            "{} {} entries ({:.1} MB) in {:.1}s{}",
            stage,
            entries,
            bytes as f64 / 1_048_576.0,
            elapsed_secs,
            throughput
        )
    }

    pub fn finish_error(&self, msg: &str) {
        self.spinner.finish_with_message(format!("Failed {}", msg));
    }
}

impl Logger for TransferProgress {
    fn connected(&self, peer: &str) {
        self.spinner
            .set_message(format!("{} via {}", self.stage, peer));
    }

    fn entry(&self, kind: EntryKind, name: &Path, bytes: u64) {
        let entries = self.entries.fetch_add(1, Ordering::Relaxed) + 1;
        let total = self.bytes.fetch_add(bytes, Ordering::Relaxed) + bytes;
        if self.show_entries {
            self.spinner.suspend(|| {
                eprintln!("  {:>8} {}", kind.as_str(), name.display());
            });
        }
        let elapsed = self.start_time.elapsed().as_secs_f64();
        self.spinner
            .set_message(self.status(self.stage, entries, total, elapsed));
    }

    fn skipped(&self, path: &Path, reason: &str) {
        self.spinner.suspend(|| {
            eprintln!("  {:>8} {} ({})", "skip", path.display(), reason);
        });
    }

    fn error(&self, context: &str, path: &Path, msg: &str) {
        self.finish_error(&format!("{} {}: {}", context, path.display(), msg));
    }

    fn done(&self, entries: u64, bytes: u64, seconds: f64) {
        self.spinner
            .finish_with_message(self.status("Completed", entries, bytes, seconds));
    }
}
