//! Stream layer composer
//!
//! Send: application -> encryption -> compression -> buffer -> socket.
//! Receive unwraps in the opposite order. Each layer is a scoped guard: its
//! release runs once on every exit path and the first error wins.

use flate2::bufread::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::debug;
use std::io::{BufReader, BufWriter, Read, Write};

use crate::config::TransferConfig;
use crate::error::{first_error, Result, TransferError};
use crate::kdf::Key;
use crate::protocol::IO_BUFFER_SIZE;
use crate::stream_cipher::{StreamDecryptor, StreamEncryptor};

/// Run `run` against `resource`, then `release` it no matter how `run`
/// ended. An error from `run` takes precedence over a release error.
pub fn scoped<R, T>(
    mut resource: R,
    run: impl FnOnce(&mut R) -> Result<T>,
    release: impl FnOnce(R) -> Result<()>,
) -> Result<T> {
    let outcome = run(&mut resource);
    first_error(outcome, release(resource))
}

fn with_buffered_writer<W: Write, T>(
    w: W,
    f: impl FnOnce(&mut dyn Write) -> Result<T>,
) -> Result<T> {
    scoped(
        BufWriter::with_capacity(IO_BUFFER_SIZE, w),
        |bw| f(bw),
        |mut bw| {
            bw.flush()
                .map_err(|e| TransferError::transport("flush connection", e))
        },
    )
}

fn with_compressing_writer<W: Write, T>(
    use_it: bool,
    level: u32,
    mut w: W,
    f: impl FnOnce(&mut dyn Write) -> Result<T>,
) -> Result<T> {
    if !use_it {
        return f(&mut w);
    }
    debug!("Using GZIP compression (level {})", level);
    scoped(
        GzEncoder::new(w, Compression::new(level)),
        |gz| f(gz),
        |gz| {
            gz.finish()
                .map(drop)
                .map_err(|e| TransferError::transport("finish gzip stream", e))
        },
    )
}

fn with_encrypting_writer<W: Write, T>(
    key: Option<(&Key, usize)>,
    mut w: W,
    f: impl FnOnce(&mut dyn Write) -> Result<T>,
) -> Result<T> {
    let (key, capacity) = match key {
        Some(k) => k,
        None => return f(&mut w),
    };
    debug!("Using AES-GCM encryption ({} byte frames)", capacity);
    scoped(
        StreamEncryptor::with_capacity(w, key, capacity)?,
        |enc| f(enc),
        |mut enc| {
            enc.close()?;
            debug!("Encryptor closed after {} frames", enc.frames_written());
            Ok(())
        },
    )
}

/// Wrap `sink` with the write-side layers `cfg` enables and run `f` on top.
pub fn with_writing_layers<W: Write, T>(
    sink: W,
    cfg: &TransferConfig,
    f: impl FnOnce(&mut dyn Write) -> Result<T>,
) -> Result<T> {
    cfg.validate()?;
    let key = if cfg.use_encryption {
        Some((cfg.encryption_key()?, cfg.chunk_capacity))
    } else {
        None
    };
    with_buffered_writer(sink, |w| {
        with_compressing_writer(cfg.use_compression, cfg.compression_level, w, |w| {
            with_encrypting_writer(key, w, f)
        })
    })
}

fn with_decompressing_reader<R: Read, T>(
    use_it: bool,
    r: R,
    f: impl FnOnce(&mut dyn Read) -> Result<T>,
) -> Result<T> {
    let mut buffered = BufReader::with_capacity(IO_BUFFER_SIZE, r);
    if !use_it {
        return f(&mut buffered);
    }
    debug!("Using GZIP compression");
    f(&mut GzDecoder::new(buffered))
}

fn with_decrypting_reader<R: Read, T>(
    key: Option<&Key>,
    mut r: R,
    f: impl FnOnce(&mut dyn Read) -> Result<T>,
) -> Result<T> {
    let key = match key {
        Some(k) => k,
        None => return f(&mut r),
    };
    debug!("Using AES-GCM encryption");
    scoped(StreamDecryptor::new(r, key)?, |dec| f(dec), |mut dec| {
        dec.close()?;
        debug!("Decryptor closed after {} frames", dec.frames_read());
        Ok(())
    })
}

/// Unwrap the read-side layers `cfg` enables from `source` and run `f` on
/// the application stream.
pub fn with_reading_layers<R: Read, T>(
    source: R,
    cfg: &TransferConfig,
    f: impl FnOnce(&mut dyn Read) -> Result<T>,
) -> Result<T> {
    cfg.validate()?;
    let key = if cfg.use_encryption {
        Some(cfg.encryption_key()?)
    } else {
        None
    };
    with_decompressing_reader(cfg.use_compression, source, |r| {
        with_decrypting_reader(key, r, f)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kdf::derive_key;
    use crate::stream_cipher::CodecError;
    use std::io;

    fn configs() -> Vec<TransferConfig> {
        let key = derive_key("some-tag", "layers").unwrap();
        vec![
            TransferConfig::default(),
            TransferConfig::default().with_compression(true),
            TransferConfig::default().with_key(key.clone()),
            TransferConfig::default().with_key(key).with_compression(true),
        ]
    }

    fn send(cfg: &TransferConfig, data: &[u8]) -> Vec<u8> {
        let mut wire = Vec::new();
        with_writing_layers(&mut wire, cfg, |w| {
            w.write_all(data)
                .map_err(|e| TransferError::transport("write", e))
        })
        .unwrap();
        wire
    }

    fn receive(cfg: &TransferConfig, wire: &[u8]) -> Result<Vec<u8>> {
        with_reading_layers(wire, cfg, |r| {
            let mut out = Vec::new();
            r.read_to_end(&mut out)
                .map_err(|e| TransferError::transport("read", e))?;
            Ok(out)
        })
    }

    #[test]
    fn test_every_layer_combination_round_trips() {
        let data: Vec<u8> = (0..50_000u32).map(|i| (i % 97) as u8).collect();
        for cfg in configs() {
            let wire = send(&cfg, &data);
            assert_eq!(receive(&cfg, &wire).unwrap(), data, "{:?}", cfg);
        }
    }

    #[test]
    fn test_plain_layers_are_transparent() {
        let wire = send(&TransferConfig::default(), b"as is");
        assert_eq!(wire, b"as is");
    }

    #[test]
    fn test_mismatched_encryption_flag_fails() {
        let key = derive_key("some-tag", "layers").unwrap();
        let wire = send(&TransferConfig::default(), b"plain bytes but long enough to frame");
        let err = receive(&TransferConfig::default().with_key(key), &wire).unwrap_err();
        assert!(matches!(err, TransferError::Codec(_)), "{:?}", err);
    }

    #[test]
    fn test_mismatched_compression_flag_fails() {
        let wire = send(&TransferConfig::default(), b"not gzip at all");
        let cfg = TransferConfig::default().with_compression(true);
        assert!(receive(&cfg, &wire).is_err());
    }

    #[test]
    fn test_wrong_passphrase_is_authentication_failure() {
        let cfg_a = TransferConfig::default().with_key(derive_key("t", "alpha").unwrap());
        let cfg_b = TransferConfig::default().with_key(derive_key("t", "bravo").unwrap());
        let wire = send(&cfg_a, b"hello");
        match receive(&cfg_b, &wire) {
            Err(TransferError::Codec(CodecError::AuthenticationFailure)) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_inner_error_wins_and_layers_still_close() {
        let cfg = TransferConfig::default().with_key(derive_key("t", "p").unwrap());
        let mut wire = Vec::new();
        let err = with_writing_layers(&mut wire, &cfg, |w| -> Result<()> {
            w.write_all(b"partial record")
                .map_err(|e| TransferError::transport("write", e))?;
            Err(TransferError::Config("inner failure".into()))
        })
        .unwrap_err();
        assert!(matches!(err, TransferError::Config(ref m) if m == "inner failure"));
        // The encryptor was still closed: its pending frame reached the wire
        assert_eq!(receive(&cfg, &wire).unwrap(), b"partial record");
    }

    /// Writer whose every write fails
    struct Refusing;

    impl Write for Refusing {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
        }
        fn flush(&mut self) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
        }
    }

    #[test]
    fn test_release_error_reported_when_inner_succeeds() {
        let err = with_writing_layers(Refusing, &TransferConfig::default(), |w| {
            // Fits in the socket buffer, so only the release flush fails
            w.write_all(b"x")
                .map_err(|e| TransferError::transport("write", e))
        })
        .unwrap_err();
        match err {
            TransferError::Transport { context, .. } => assert_eq!(context, "flush connection"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_scoped_releases_on_error() {
        let mut released = false;
        let result: Result<()> = scoped(
            (),
            |_| Err(TransferError::Config("boom".into())),
            |_| {
                released = true;
                Ok(())
            },
        );
        assert!(result.is_err());
        assert!(released);
    }
}
