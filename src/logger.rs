use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use crate::error::{Result, TransferError};

/// Kind of archive record seen on either side of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    File,
    Symlink,
    HardLink,
    Fifo,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Directory => "dir",
            EntryKind::File => "file",
            EntryKind::Symlink => "symlink",
            EntryKind::HardLink => "hardlink",
            EntryKind::Fifo => "fifo",
        }
    }
}

/// Transfer event sink. Every method defaults to doing nothing.
pub trait Logger: Send + Sync {
    fn connected(&self, _peer: &str) {}
    fn entry(&self, _kind: EntryKind, _name: &Path, _bytes: u64) {}
    fn skipped(&self, _path: &Path, _reason: &str) {}
    fn error(&self, _context: &str, _path: &Path, _msg: &str) {}
    fn done(&self, _entries: u64, _bytes: u64, _seconds: f64) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| TransferError::filesystem(path, e))?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        if let Ok(mut f) = self.file.lock() {
            let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
        }
    }
}

impl Logger for TextLogger {
    fn connected(&self, peer: &str) {
        self.line(&format!("CONNECTED peer={}", peer));
    }
    fn entry(&self, kind: EntryKind, name: &Path, bytes: u64) {
        self.line(&format!(
            "ENTRY kind={} name={} bytes={}",
            kind.as_str(),
            name.display(),
            bytes
        ));
    }
    fn skipped(&self, path: &Path, reason: &str) {
        self.line(&format!("SKIP path={} reason={}", path.display(), reason));
    }
    fn error(&self, context: &str, path: &Path, msg: &str) {
        self.line(&format!("ERROR ctx={} path={} msg={}", context, path.display(), msg));
    }
    fn done(&self, entries: u64, bytes: u64, seconds: f64) {
        self.line(&format!("DONE entries={entries} bytes={bytes} seconds={seconds:.3}"));
    }
}

/// Fans every event out to each wrapped logger in order
pub struct MultiLogger {
    loggers: Vec<Box<dyn Logger>>,
}

impl MultiLogger {
    pub fn new(loggers: Vec<Box<dyn Logger>>) -> Self {
        Self { loggers }
    }

    pub fn is_empty(&self) -> bool {
        self.loggers.is_empty()
    }
}

impl Logger for MultiLogger {
    fn connected(&self, peer: &str) {
        self.loggers.iter().for_each(|l| l.connected(peer));
    }
    fn entry(&self, kind: EntryKind, name: &Path, bytes: u64) {
        self.loggers.iter().for_each(|l| l.entry(kind, name, bytes));
    }
    fn skipped(&self, path: &Path, reason: &str) {
        self.loggers.iter().for_each(|l| l.skipped(path, reason));
    }
    fn error(&self, context: &str, path: &Path, msg: &str) {
        self.loggers.iter().for_each(|l| l.error(context, path, msg));
    }
    fn done(&self, entries: u64, bytes: u64, seconds: f64) {
        self.loggers.iter().for_each(|l| l.done(entries, bytes, seconds));
    }
}

/// Records events in memory; used by tests to observe a run
#[cfg(test)]
#[derive(Default)]
pub struct RecordingLogger {
    pub events: Mutex<Vec<String>>,
}

#[cfg(test)]
impl RecordingLogger {
    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }
}

#[cfg(test)]
impl Logger for RecordingLogger {
    fn entry(&self, kind: EntryKind, name: &Path, bytes: u64) {
        self.events
            .lock()
            .unwrap()
            .push(format!("{} {} {}", kind.as_str(), name.display(), bytes));
    }
    fn skipped(&self, path: &Path, _reason: &str) {
        self.events
            .lock()
            .unwrap()
            .push(format!("skip {}", path.display()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_text_logger_writes_timestamped_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("run.log");
        let logger = TextLogger::new(&path).unwrap();
        logger.connected("127.0.0.1:6969");
        logger.entry(EntryKind::File, Path::new("sub/a.txt"), 6);
        logger.done(1, 6, 0.5);

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with('['));
        assert!(lines[0].ends_with("CONNECTED peer=127.0.0.1:6969"));
        assert!(lines[1].ends_with("ENTRY kind=file name=sub/a.txt bytes=6"));
        assert!(lines[2].ends_with("DONE entries=1 bytes=6 seconds=0.500"));
    }

    #[test]
    fn test_multi_logger_fans_out() {
        let dir = tempfile::tempdir().unwrap();
        let a: PathBuf = dir.path().join("a.log");
        let b: PathBuf = dir.path().join("b.log");
        let multi = MultiLogger::new(vec![
            Box::new(TextLogger::new(&a).unwrap()),
            Box::new(NoopLogger),
            Box::new(TextLogger::new(&b).unwrap()),
        ]);
        assert!(!multi.is_empty());
        multi.skipped(Path::new("sock"), "socket");

        for path in [a, b] {
            let text = std::fs::read_to_string(path).unwrap();
            assert!(text.contains("SKIP path=sock reason=socket"));
        }
    }
}
