//! Send and receive runs: one connection, layered stream, one archive

use log::{debug, info};
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::config::TransferConfig;
use crate::error::{Result, TransferError};
use crate::extractor::{extract_archive, ReceiveStats};
use crate::layers::{with_reading_layers, with_writing_layers};
use crate::logger::Logger;
use crate::serializer::{write_archive, SendStats};
use crate::transport::{with_dial, with_listener, OneShotListener};

fn peer_name(stream: &TcpStream) -> String {
    stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown peer".to_string())
}

fn report_failure(logger: &dyn Logger, context: &str, err: &TransferError) {
    let path = err.path().unwrap_or_else(|| Path::new(""));
    logger.error(context, path, &err.to_string());
}

/// Serialize `operands` through the layers `cfg` enables into `sink`
pub fn send_to<W: Write>(
    sink: W,
    operands: &[PathBuf],
    cfg: &TransferConfig,
    logger: &dyn Logger,
) -> Result<SendStats> {
    with_writing_layers(sink, cfg, |w| write_archive(w, operands, logger))
}

/// Unwrap the layers from `source` and extract under `dest_root`. Whatever
/// follows the end-of-archive marker is read and discarded so the encrypted
/// and compressed layers see their full stream.
pub fn receive_from<R: Read>(
    source: R,
    dest_root: &Path,
    cfg: &TransferConfig,
    logger: &dyn Logger,
) -> Result<ReceiveStats> {
    with_reading_layers(source, cfg, |r| {
        let stats = extract_archive(&mut *r, dest_root, logger)?;
        let trailing = io::copy(r, &mut io::sink())
            .map_err(|e| TransferError::transport("drain stream", e))?;
        debug!("drained {} bytes after end of archive", trailing);
        Ok(stats)
    })
}

/// Dial `addr` and send `operands` (`.` when empty)
pub fn send(
    addr: &str,
    operands: &[PathBuf],
    cfg: &TransferConfig,
    logger: &dyn Logger,
) -> Result<SendStats> {
    cfg.validate()?;
    let start = Instant::now();
    let outcome = with_dial(addr, |stream| {
        logger.connected(&peer_name(stream));
        send_to(&mut *stream, operands, cfg, logger)
    });
    let stats = match outcome {
        Ok(stats) => stats,
        Err(e) => {
            report_failure(logger, "send", &e);
            return Err(e);
        }
    };
    let elapsed = start.elapsed().as_secs_f64();
    info!(
        "sent {} entries ({} files, {} bytes, {} skipped) in {:.2}s",
        stats.entries, stats.files, stats.bytes, stats.skipped, elapsed
    );
    logger.done(stats.entries, stats.bytes, elapsed);
    Ok(stats)
}

/// Accept one connection on `listener` and extract it under `dest_root`
pub fn receive_on(
    listener: OneShotListener,
    dest_root: &Path,
    cfg: &TransferConfig,
    logger: &dyn Logger,
) -> Result<ReceiveStats> {
    cfg.validate()?;
    std::fs::create_dir_all(dest_root).map_err(|e| TransferError::filesystem(dest_root, e))?;
    let start = Instant::now();
    let outcome = with_listener(listener, |stream| {
        logger.connected(&peer_name(stream));
        receive_from(&mut *stream, dest_root, cfg, logger)
    });
    let stats = match outcome {
        Ok(stats) => stats,
        Err(e) => {
            report_failure(logger, "receive", &e);
            return Err(e);
        }
    };
    let elapsed = start.elapsed().as_secs_f64();
    info!(
        "received {} entries ({} files, {} bytes) in {:.2}s",
        stats.entries, stats.files, stats.bytes, elapsed
    );
    logger.done(stats.entries, stats.bytes, elapsed);
    Ok(stats)
}

/// Listen on `bind`, accept exactly one sender, extract under `dest_root`
pub fn receive(
    bind: &str,
    dest_root: &Path,
    cfg: &TransferConfig,
    logger: &dyn Logger,
) -> Result<ReceiveStats> {
    receive_on(OneShotListener::bind(bind)?, dest_root, cfg, logger)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kdf::key_from_passphrase;
    use crate::logger::NoopLogger;
    use crate::stream_cipher::CodecError;
    use std::fs;

    fn sample_tree() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("data");
        fs::create_dir_all(root.join("nested")).unwrap();
        fs::write(root.join("nested").join("file.txt"), b"payload\n").unwrap();
        (dir, root)
    }

    #[test]
    fn test_in_memory_round_trip_all_layers() {
        let (_src, root) = sample_tree();
        let cfg = TransferConfig::default()
            .with_compression(true)
            .with_key(key_from_passphrase("sesame\n").unwrap());

        let mut wire = Vec::new();
        let sent = send_to(&mut wire, &[root], &cfg, &NoopLogger).unwrap();
        let dst = tempfile::tempdir().unwrap();
        let got = receive_from(&wire[..], dst.path(), &cfg, &NoopLogger).unwrap();

        assert_eq!(sent.files, got.files);
        assert_eq!(sent.bytes, got.bytes);
        assert_eq!(
            fs::read(dst.path().join("data").join("nested").join("file.txt")).unwrap(),
            b"payload\n"
        );
    }

    #[test]
    fn test_plain_stream_is_a_tar_archive() {
        let (_src, root) = sample_tree();
        let mut wire = Vec::new();
        send_to(&mut wire, &[root], &TransferConfig::default(), &NoopLogger).unwrap();

        let mut names = Vec::new();
        let mut ar = tar::Archive::new(&wire[..]);
        for entry in ar.entries().unwrap() {
            names.push(entry.unwrap().path().unwrap().into_owned());
        }
        assert!(names.contains(&PathBuf::from("data/nested/file.txt")));
    }

    #[test]
    fn test_tampered_stream_aborts_receive() {
        let (_src, root) = sample_tree();
        let cfg = TransferConfig::default().with_key(key_from_passphrase("k").unwrap());
        let mut wire = Vec::new();
        send_to(&mut wire, &[root], &cfg, &NoopLogger).unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0x01;

        let dst = tempfile::tempdir().unwrap();
        let err = receive_from(&wire[..], dst.path(), &cfg, &NoopLogger).unwrap_err();
        assert!(
            matches!(err, TransferError::Codec(CodecError::AuthenticationFailure)),
            "{:?}",
            err
        );
    }

    #[test]
    fn test_encryption_without_key_is_rejected_before_dialing() {
        let cfg = TransferConfig {
            use_encryption: true,
            ..TransferConfig::default()
        };
        // Port 9 on loopback is never dialed: validation fails first
        let err = send("127.0.0.1:9", &[], &cfg, &NoopLogger).unwrap_err();
        assert!(matches!(err, TransferError::Config(_)));
    }
}
