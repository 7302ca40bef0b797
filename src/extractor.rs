//! Tree extractor: materialize tar records under a destination root
//!
//! Records are applied strictly in arrival order. Directory mtimes and final
//! permission bits are deferred and replayed in reverse once the stream ends,
//! so creating children never disturbs a timestamp that was already set.

use filetime::FileTime;
use log::{debug, warn};
use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};
use tar::{Archive, Entry, EntryType};

use crate::error::{Result, TransferError};
use crate::fifo::create_fifo;
use crate::logger::{EntryKind, Logger};
use crate::protocol::{IO_BUFFER_SIZE, PARTIAL_SUFFIX};

/// Totals for one receive run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveStats {
    pub entries: u64,
    pub files: u64,
    pub bytes: u64,
}

#[derive(Debug)]
struct DeferredDir {
    path: PathBuf,
    mtime: FileTime,
    mode: u32,
}

/// Turn an archive name into a path relative to the destination root.
/// `.` components are dropped; absolute, prefix and `..` components are
/// rejected.
pub fn safe_relative(name: &Path) -> Result<PathBuf> {
    if name.to_string_lossy().contains('\0') {
        return Err(TransferError::UnsafePath(name.to_path_buf()));
    }
    let mut safe = PathBuf::new();
    for component in name.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(s) => {
                // Alternate data streams
                #[cfg(windows)]
                if s.to_string_lossy().contains(':') {
                    return Err(TransferError::UnsafePath(name.to_path_buf()));
                }
                safe.push(s);
            }
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(TransferError::UnsafePath(name.to_path_buf()));
            }
        }
    }
    Ok(safe)
}

pub fn normalize_under_root(root: &Path, name: &Path) -> Result<PathBuf> {
    Ok(root.join(safe_relative(name)?))
}

fn archive_error(e: io::Error) -> TransferError {
    TransferError::transport("read archive", e)
}

fn partial_path(path: &Path) -> PathBuf {
    let mut s: OsString = path.as_os_str().to_owned();
    s.push(PARTIAL_SUFFIX);
    PathBuf::from(s)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn make_symlink(target: &Path, path: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, path)
}

#[cfg(windows)]
fn make_symlink(target: &Path, path: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_file(target, path)
}

#[cfg(not(any(unix, windows)))]
fn make_symlink(_target: &Path, _path: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "symbolic links unsupported on this platform",
    ))
}

fn not_a_directory() -> io::Error {
    io::Error::new(io::ErrorKind::AlreadyExists, "exists and is not a directory")
}

/// Remove whatever non-directory occupies `path`
fn clear_non_directory(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => Err(TransferError::filesystem(
            path,
            io::Error::new(io::ErrorKind::AlreadyExists, "a directory is in the way"),
        )),
        Ok(_) => fs::remove_file(path).map_err(|e| TransferError::filesystem(path, e)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(TransferError::filesystem(path, e)),
    }
}

fn copy_payload<R: Read, W: Write>(src: &mut R, dst: &mut W, partial: &Path) -> Result<u64> {
    let mut buf = vec![0u8; IO_BUFFER_SIZE];
    let mut written = 0u64;
    loop {
        let n = match src.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(archive_error(e)),
        };
        dst.write_all(&buf[..n])
            .map_err(|e| TransferError::filesystem(partial, e))?;
        written += n as u64;
    }
    Ok(written)
}

struct Extractor<'a> {
    root: PathBuf,
    logger: &'a dyn Logger,
    deferred: Vec<DeferredDir>,
    stats: ReceiveStats,
}

impl<'a> Extractor<'a> {
    fn emitted(&mut self, kind: EntryKind, name: &Path, bytes: u64) {
        self.stats.entries += 1;
        if kind == EntryKind::File {
            self.stats.files += 1;
            self.stats.bytes += bytes;
        }
        self.logger.entry(kind, name, bytes);
    }

    /// Walk the directories above `rel`. An existing symlink in the chain
    /// would redirect access outside the root and is rejected. Missing
    /// directories are created when `create` is set; otherwise the walk stops
    /// at the first one.
    fn walk_parents(&self, rel: &Path, create: bool) -> Result<()> {
        let parent = match rel.parent() {
            Some(p) => p,
            None => return Ok(()),
        };
        let mut current = self.root.clone();
        for component in parent.components() {
            current.push(component);
            match fs::symlink_metadata(&current) {
                Ok(meta) if meta.is_dir() => {}
                Ok(meta) if meta.file_type().is_symlink() => {
                    return Err(TransferError::UnsafePath(current));
                }
                Ok(_) => return Err(TransferError::filesystem(&current, not_a_directory())),
                Err(e) if e.kind() == io::ErrorKind::NotFound && !create => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    fs::create_dir(&current).map_err(|e| TransferError::filesystem(&current, e))?;
                }
                Err(e) => return Err(TransferError::filesystem(&current, e)),
            }
        }
        Ok(())
    }

    fn ensure_parents(&self, rel: &Path) -> Result<()> {
        self.walk_parents(rel, true)
    }

    fn unpack<R: Read>(&mut self, entry: &mut Entry<'_, R>) -> Result<()> {
        let entry_type = entry.header().entry_type();
        if matches!(entry_type, EntryType::XGlobalHeader) {
            debug!("ignoring pax global header");
            return Ok(());
        }

        let name = entry.path().map_err(archive_error)?.into_owned();
        let rel = safe_relative(&name)?;
        let path = self.root.join(&rel);
        let mode = entry.header().mode().map_err(archive_error)? & 0o7777;
        let mtime = entry.header().mtime().map_err(archive_error)?;
        let mtime = FileTime::from_unix_time(mtime as i64, 0);

        if rel.as_os_str().is_empty() && !entry_type.is_dir() {
            return Err(TransferError::UnsafePath(name));
        }
        self.ensure_parents(&rel)?;

        match entry_type {
            EntryType::Directory => self.directory(&name, path, mode, mtime),
            EntryType::Symlink => {
                let target = entry
                    .link_name()
                    .map_err(archive_error)?
                    .ok_or_else(|| TransferError::UnsafePath(name.clone()))?
                    .into_owned();
                self.symlink(&name, &path, &target)
            }
            EntryType::Link => {
                let target = entry
                    .link_name()
                    .map_err(archive_error)?
                    .ok_or_else(|| TransferError::UnsafePath(name.clone()))?
                    .into_owned();
                self.hard_link(&name, &path, &target, mtime)
            }
            EntryType::Fifo => {
                clear_non_directory(&path)?;
                create_fifo(&path, mode, mtime).map_err(|e| TransferError::filesystem(&path, e))?;
                self.emitted(EntryKind::Fifo, &name, 0);
                Ok(())
            }
            EntryType::Block | EntryType::Char => {
                warn!(
                    "device nodes unsupported, creating regular file: {}",
                    name.display()
                );
                self.regular(entry, &name, &path, mode, mtime)
            }
            EntryType::Regular | EntryType::Continuous | EntryType::GNUSparse => {
                self.regular(entry, &name, &path, mode, mtime)
            }
            other => {
                let reason = format!("unsupported record type {:?}", other);
                warn!("skipping {}: {}", name.display(), reason);
                self.logger.skipped(&name, &reason);
                Ok(())
            }
        }
    }

    fn directory(&mut self, name: &Path, path: PathBuf, mode: u32, mtime: FileTime) -> Result<()> {
        match fs::symlink_metadata(&path) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Err(TransferError::filesystem(&path, not_a_directory())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                fs::create_dir(&path).map_err(|e| TransferError::filesystem(&path, e))?;
            }
            Err(e) => return Err(TransferError::filesystem(&path, e)),
        }
        // Owner keeps write access until the deferred pass restores the mode
        set_mode(&path, mode | 0o700).map_err(|e| TransferError::filesystem(&path, e))?;
        self.deferred.push(DeferredDir { path, mtime, mode });
        self.emitted(EntryKind::Directory, name, 0);
        Ok(())
    }

    fn symlink(&mut self, name: &Path, path: &Path, target: &Path) -> Result<()> {
        clear_non_directory(path)?;
        make_symlink(target, path).map_err(|e| TransferError::filesystem(path, e))?;
        self.emitted(EntryKind::Symlink, name, 0);
        Ok(())
    }

    fn hard_link(&mut self, name: &Path, path: &Path, target: &Path, mtime: FileTime) -> Result<()> {
        let source = normalize_under_root(&self.root, target)?;
        self.walk_parents(&safe_relative(target)?, false)?;
        clear_non_directory(path)?;
        fs::hard_link(&source, path).map_err(|e| TransferError::filesystem(path, e))?;
        // The link may name a symlink; stamp it, not what it points at
        filetime::set_symlink_file_times(path, mtime, mtime)
            .map_err(|e| TransferError::filesystem(path, e))?;
        self.emitted(EntryKind::HardLink, name, 0);
        Ok(())
    }

    fn regular<R: Read>(
        &mut self,
        entry: &mut Entry<'_, R>,
        name: &Path,
        path: &Path,
        mode: u32,
        mtime: FileTime,
    ) -> Result<()> {
        // Payload length after pax and sparse adjustments
        let expected = entry.size();
        let partial = partial_path(path);

        let outcome = (|| -> Result<u64> {
            // Never open through whatever an earlier record left at the
            // partial name
            clear_non_directory(&partial)?;
            let file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&partial)
                .map_err(|e| TransferError::filesystem(&partial, e))?;
            let mut out = BufWriter::with_capacity(IO_BUFFER_SIZE, file);
            let written = copy_payload(&mut *entry, &mut out, &partial)?;
            out.flush()
                .map_err(|e| TransferError::filesystem(&partial, e))?;
            if written != expected {
                return Err(TransferError::MisWrite {
                    path: path.to_path_buf(),
                    written,
                    expected,
                });
            }
            set_mode(&partial, mode).map_err(|e| TransferError::filesystem(&partial, e))?;
            fs::rename(&partial, path).map_err(|e| TransferError::filesystem(path, e))?;
            Ok(written)
        })();

        let written = match outcome {
            Ok(n) => n,
            Err(e) => {
                let _ = fs::remove_file(&partial);
                return Err(e);
            }
        };
        filetime::set_file_times(path, mtime, mtime)
            .map_err(|e| TransferError::filesystem(path, e))?;
        self.emitted(EntryKind::File, name, written);
        Ok(())
    }

    fn apply_deferred(&mut self) -> Result<()> {
        debug!("fixing up {} directories", self.deferred.len());
        for dir in self.deferred.drain(..).rev() {
            set_mode(&dir.path, dir.mode).map_err(|e| TransferError::filesystem(&dir.path, e))?;
            filetime::set_file_times(&dir.path, dir.mtime, dir.mtime)
                .map_err(|e| TransferError::filesystem(&dir.path, e))?;
        }
        Ok(())
    }
}

/// Read a tar stream from `r` and rebuild it under `dest_root`, which must
/// already exist. Stops at the end-of-archive marker without consuming the
/// rest of `r`.
pub fn extract_archive<R: Read>(
    r: R,
    dest_root: &Path,
    logger: &dyn Logger,
) -> Result<ReceiveStats> {
    let mut ex = Extractor {
        root: dest_root.to_path_buf(),
        logger,
        deferred: Vec::new(),
        stats: ReceiveStats::default(),
    };
    let mut archive = Archive::new(r);
    for item in archive.entries().map_err(archive_error)? {
        let mut entry = item.map_err(archive_error)?;
        ex.unpack(&mut entry)?;
    }
    ex.apply_deferred()?;
    Ok(ex.stats)
}
