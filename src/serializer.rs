//! Tree serializer: walk operands and emit one tar record per entry
//!
//! Record names are relative to each operand's parent directory, so sending
//! `/data/photos` produces `photos`, `photos/2019`, ... Directories are
//! emitted before their contents (walkdir pre-order).

use filetime::FileTime;
use log::{debug, warn};
use std::fs::{self, File, Metadata};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tar::{Builder, EntryType, Header};
use walkdir::WalkDir;

use crate::error::{Result, TransferError};
use crate::fifo::is_fifo;
use crate::logger::{EntryKind, Logger};

/// Totals for one send run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SendStats {
    pub entries: u64,
    pub files: u64,
    pub bytes: u64,
    pub skipped: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeKind {
    Directory,
    Symlink,
    Fifo,
    Regular,
    Unsupported(&'static str),
}

fn classify(ft: &fs::FileType) -> NodeKind {
    if ft.is_dir() {
        return NodeKind::Directory;
    }
    if ft.is_symlink() {
        return NodeKind::Symlink;
    }
    if ft.is_file() {
        return NodeKind::Regular;
    }
    if is_fifo(ft) {
        return NodeKind::Fifo;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileTypeExt;
        if ft.is_socket() {
            return NodeKind::Unsupported("socket");
        }
        if ft.is_block_device() {
            return NodeKind::Unsupported("block device");
        }
        if ft.is_char_device() {
            return NodeKind::Unsupported("character device");
        }
    }
    NodeKind::Unsupported("unknown file type")
}

/// Leading name for records under `operand`: its final component, or `.`
/// when it has none (`.`, `..`, `/`).
fn archive_prefix(operand: &Path) -> PathBuf {
    match operand.file_name() {
        Some(name) => PathBuf::from(name),
        None => PathBuf::from("."),
    }
}

fn record_name(prefix: &Path, root: &Path, path: &Path) -> PathBuf {
    match path.strip_prefix(root) {
        Ok(rel) if rel.as_os_str().is_empty() => prefix.to_path_buf(),
        Ok(rel) => prefix.join(rel),
        Err(_) => prefix.to_path_buf(),
    }
}

#[cfg(unix)]
fn permission_bits(meta: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn permission_bits(meta: &Metadata) -> u32 {
    match (meta.is_dir(), meta.permissions().readonly()) {
        (true, _) => 0o755,
        (false, true) => 0o444,
        (false, false) => 0o644,
    }
}

fn header_for(meta: &Metadata, entry_type: EntryType, size: u64) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_mode(permission_bits(meta));
    header.set_size(size);
    let mtime = FileTime::from_last_modification_time(meta).unix_seconds();
    header.set_mtime(mtime.max(0) as u64);
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        header.set_uid(meta.uid() as u64);
        header.set_gid(meta.gid() as u64);
    }
    header
}

/// Yields exactly `remaining` bytes of `inner` or fails. A file that shrinks
/// after its header went out must not leave a short payload in the stream.
struct ExactReader<R> {
    inner: R,
    remaining: u64,
    failed: bool,
}

impl<R: Read> ExactReader<R> {
    fn new(inner: R, len: u64) -> Self {
        ExactReader {
            inner,
            remaining: len,
            failed: false,
        }
    }
}

impl<R: Read> Read for ExactReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let want = buf.len().min(self.remaining.min(usize::MAX as u64) as usize);
        let n = match self.inner.read(&mut buf[..want]) {
            Ok(n) => n,
            Err(e) => {
                self.failed = true;
                return Err(e);
            }
        };
        if n == 0 {
            self.failed = true;
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("file shrank while sending, {} bytes missing", self.remaining),
            ));
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

/// Archive sink that refuses all output once poisoned. `tar::Builder` writes
/// its end-of-archive trailer on drop; after a failed record that trailer
/// would pad a truncated payload into a well-formed archive.
struct Poisonable<W> {
    inner: W,
    poisoned: bool,
}

impl<W: Write> Poisonable<W> {
    fn new(inner: W) -> Self {
        Poisonable {
            inner,
            poisoned: false,
        }
    }

    fn poison(&mut self) {
        self.poisoned = true;
    }

    fn check(&self) -> io::Result<()> {
        if self.poisoned {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "archive aborted"));
        }
        Ok(())
    }
}

impl<W: Write> Write for Poisonable<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.check()?;
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.check()?;
        self.inner.flush()
    }
}

struct Walker<'a, W: Write> {
    builder: Builder<Poisonable<W>>,
    logger: &'a dyn Logger,
    stats: SendStats,
}

impl<'a, W: Write> Walker<'a, W> {
    fn skip(&mut self, path: &Path, reason: &str) {
        warn!("skipping {}: {}", path.display(), reason);
        self.logger.skipped(path, reason);
        self.stats.skipped += 1;
    }

    fn emitted(&mut self, kind: EntryKind, name: &Path, bytes: u64) {
        self.stats.entries += 1;
        if kind == EntryKind::File {
            self.stats.files += 1;
            self.stats.bytes += bytes;
        }
        self.logger.entry(kind, name, bytes);
    }

    fn send_wire_error(name: &Path, e: io::Error) -> TransferError {
        TransferError::transport(format!("send {}", name.display()), e)
    }

    fn append_header_only(
        &mut self,
        name: &Path,
        meta: &Metadata,
        entry_type: EntryType,
        kind: EntryKind,
    ) -> Result<()> {
        let mut header = header_for(meta, entry_type, 0);
        self.builder
            .append_data(&mut header, name, io::empty())
            .map_err(|e| Self::send_wire_error(name, e))?;
        self.emitted(kind, name, 0);
        Ok(())
    }

    fn append_symlink(&mut self, path: &Path, name: &Path, meta: &Metadata) -> Result<()> {
        let target = fs::read_link(path).map_err(|e| TransferError::filesystem(path, e))?;
        let mut header = header_for(meta, EntryType::Symlink, 0);
        self.builder
            .append_link(&mut header, name, &target)
            .map_err(|e| Self::send_wire_error(name, e))?;
        self.emitted(EntryKind::Symlink, name, 0);
        Ok(())
    }

    fn append_file(&mut self, path: &Path, name: &Path) -> Result<()> {
        let file = File::open(path).map_err(|e| TransferError::filesystem(path, e))?;
        // Size from the open handle, not the earlier directory scan
        let meta = file
            .metadata()
            .map_err(|e| TransferError::filesystem(path, e))?;
        let header = header_for(&meta, EntryType::Regular, meta.len());
        self.append_payload(path, name, header, file)
    }

    fn append_payload<R: Read>(
        &mut self,
        path: &Path,
        name: &Path,
        mut header: Header,
        source: R,
    ) -> Result<()> {
        let size = header.size().map_err(|e| Self::send_wire_error(name, e))?;
        let mut payload = ExactReader::new(source, size);
        if let Err(e) = self.builder.append_data(&mut header, name, &mut payload) {
            return Err(if payload.failed {
                TransferError::filesystem(path, e)
            } else {
                Self::send_wire_error(name, e)
            });
        }
        self.emitted(EntryKind::File, name, size);
        Ok(())
    }

    fn walk_operand(&mut self, operand: &Path) -> Result<()> {
        let prefix = archive_prefix(operand);
        debug!("archiving {} as {}", operand.display(), prefix.display());

        for item in WalkDir::new(operand).follow_links(false) {
            let entry = match item {
                Ok(entry) => entry,
                Err(err) if err.depth() == 0 => {
                    let io_err = err
                        .into_io_error()
                        .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "walk failed"));
                    return Err(TransferError::filesystem(operand, io_err));
                }
                Err(err) => {
                    let path = err.path().unwrap_or(operand).to_path_buf();
                    self.skip(&path, &err.to_string());
                    continue;
                }
            };

            let path = entry.path();
            let name = record_name(&prefix, operand, path);
            match classify(&entry.file_type()) {
                NodeKind::Regular => self.append_file(path, &name)?,
                NodeKind::Unsupported(reason) => self.skip(path, reason),
                kind => {
                    let meta = match entry.metadata() {
                        Ok(meta) => meta,
                        Err(err) => {
                            self.skip(path, &err.to_string());
                            continue;
                        }
                    };
                    match kind {
                        NodeKind::Directory => self.append_header_only(
                            &name,
                            &meta,
                            EntryType::Directory,
                            EntryKind::Directory,
                        )?,
                        NodeKind::Fifo => self.append_header_only(
                            &name,
                            &meta,
                            EntryType::Fifo,
                            EntryKind::Fifo,
                        )?,
                        _ => self.append_symlink(path, &name, &meta)?,
                    }
                }
            }
        }
        Ok(())
    }
}

/// Serialize `operands` (or `.` when empty) as a tar stream into `w`.
pub fn write_archive<W: Write>(
    w: W,
    operands: &[PathBuf],
    logger: &dyn Logger,
) -> Result<SendStats> {
    let default_operand = [PathBuf::from(".")];
    let operands = if operands.is_empty() {
        &default_operand[..]
    } else {
        operands
    };

    let walker = Walker {
        builder: Builder::new(Poisonable::new(w)),
        logger,
        stats: SendStats::default(),
    };
    run_walker(walker, |walker| {
        for operand in operands {
            walker.walk_operand(operand)?;
        }
        Ok(())
    })
}

/// Finish the archive if `body` succeeds. Otherwise poison the sink so the
/// stream ends without a trailer and the receiver sees it as truncated.
fn run_walker<'a, W: Write>(
    mut walker: Walker<'a, W>,
    body: impl FnOnce(&mut Walker<'a, W>) -> Result<()>,
) -> Result<SendStats> {
    if let Err(e) = body(&mut walker) {
        walker.builder.get_mut().poison();
        return Err(e);
    }
    let stats = walker.stats;
    walker
        .builder
        .into_inner()
        .map_err(|e| TransferError::transport("finish archive", e))?;
    Ok(stats)
}
