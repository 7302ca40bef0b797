//! Error taxonomy for a transfer run

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::stream_cipher::CodecError;

pub type Result<T> = std::result::Result<T, TransferError>;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("{context}: {source}")]
    Transport {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("{}: {source}", .path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("mis-write: {} {written} written, expected: {expected}", .path.display())]
    MisWrite {
        path: PathBuf,
        written: u64,
        expected: u64,
    },

    #[error("unsafe archive path: {}", .0.display())]
    UnsafePath(PathBuf),

    #[error("configuration: {0}")]
    Config(String),
}

impl TransferError {
    /// Socket-side failure. Codec errors tunnelled through `io` come back out
    /// as `Codec`.
    pub fn transport(context: impl Into<String>, source: io::Error) -> Self {
        match CodecError::from_io(&source) {
            Some(codec) => TransferError::Codec(codec),
            None => TransferError::Transport {
                context: context.into(),
                source,
            },
        }
    }

    /// Failure touching `path`. Codec errors raised while reading the payload
    /// for `path` are still reported as `Codec`.
    pub fn filesystem(path: &Path, source: io::Error) -> Self {
        match CodecError::from_io(&source) {
            Some(codec) => TransferError::Codec(codec),
            None => TransferError::Filesystem {
                path: path.to_path_buf(),
                source,
            },
        }
    }

    /// The filesystem path the error concerns, if any
    pub fn path(&self) -> Option<&Path> {
        match self {
            TransferError::Filesystem { path, .. }
            | TransferError::MisWrite { path, .. }
            | TransferError::UnsafePath(path) => Some(path),
            _ => None,
        }
    }
}

/// Keep the first error: `outcome` wins over a later `released` error.
pub fn first_error<T>(outcome: Result<T>, released: Result<()>) -> Result<T> {
    match outcome {
        Err(e) => Err(e),
        Ok(value) => released.map(|()| value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_error_prefers_outcome() {
        let outcome: Result<u8> = Err(TransferError::Config("inner".into()));
        let released = Err(TransferError::Config("close".into()));
        match first_error(outcome, released) {
            Err(TransferError::Config(m)) => assert_eq!(m, "inner"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_first_error_reports_release_failure() {
        let released = Err(TransferError::Config("close".into()));
        match first_error(Ok(7u8), released) {
            Err(TransferError::Config(m)) => assert_eq!(m, "close"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(first_error(Ok(7u8), Ok(())).unwrap(), 7);
    }

    #[test]
    fn test_codec_error_recovered_from_io() {
        let io_err: io::Error = CodecError::AuthenticationFailure.into();
        match TransferError::transport("read", io_err) {
            TransferError::Codec(CodecError::AuthenticationFailure) => {}
            other => panic!("unexpected {:?}", other),
        }

        let plain = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        assert!(matches!(
            TransferError::filesystem(Path::new("x"), plain),
            TransferError::Filesystem { .. }
        ));
    }

    #[test]
    fn test_mis_write_message() {
        let e = TransferError::MisWrite {
            path: PathBuf::from("a.txt"),
            written: 3,
            expected: 6,
        };
        assert_eq!(e.to_string(), "mis-write: a.txt 3 written, expected: 6");
    }
}
