//! Named pipe creation for extracted FIFO records

use filetime::FileTime;
use std::io;
use std::path::Path;

/// Create a FIFO at `path` with permission bits `mode`, then stamp `mtime`.
#[cfg(unix)]
pub fn create_fifo(path: &Path, mode: u32, mtime: FileTime) -> io::Result<()> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), (mode & 0o7777) as libc::mode_t) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    // mkfifo is subject to the umask
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o7777))?;
    }
    filetime::set_symlink_file_times(path, mtime, mtime)
}

/// Platforms without named pipes get an empty regular file in its place.
#[cfg(not(unix))]
pub fn create_fifo(path: &Path, _mode: u32, mtime: FileTime) -> io::Result<()> {
    log::warn!(
        "named pipes unsupported here, creating regular file: {}",
        path.display()
    );
    std::fs::File::create(path)?;
    filetime::set_file_times(path, mtime, mtime)
}

/// True when `ft` is a named pipe
#[cfg(unix)]
pub fn is_fifo(ft: &std::fs::FileType) -> bool {
    use std::os::unix::fs::FileTypeExt;
    ft.is_fifo()
}

#[cfg(not(unix))]
pub fn is_fifo(_ft: &std::fs::FileType) -> bool {
    false
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn test_create_fifo_sets_mode_and_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipe");
        let mtime = FileTime::from_unix_time(1_600_000_000, 0);
        create_fifo(&path, 0o640, mtime).unwrap();

        let meta = std::fs::symlink_metadata(&path).unwrap();
        assert!(is_fifo(&meta.file_type()));
        assert_eq!(meta.permissions().mode() & 0o7777, 0o640);
        assert_eq!(FileTime::from_last_modification_time(&meta), mtime);
    }

    #[test]
    fn test_create_fifo_fails_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipe");
        std::fs::write(&path, b"taken").unwrap();
        let err = create_fifo(&path, 0o644, FileTime::zero()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }
}
