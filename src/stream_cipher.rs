//! Chunked AES-256-GCM stream codec
//!
//! Turns any ordered byte transport into a confidential, tamper-evident
//! channel using nothing but sequential `Read`/`Write`. Each frame on the wire
//! is
//!
//! ```text
//! [u64 BE length L][12-byte nonce][ciphertext + 16-byte tag]
//! ```
//!
//! where `L` counts the nonce, ciphertext and tag. Every frame carries its own
//! nonce from the OS CSPRNG, so no nonce is ever reused under a key. The AEAD
//! is invoked with empty associated data.
//!
//! Errors are terminal. Frame boundaries come from a length prefix that is no
//! longer trustworthy after a failure, so neither side tries to resynchronize:
//! the first error is remembered and returned by every later call.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use std::io::{self, Read, Write};
use thiserror::Error;

use crate::kdf::Key;
use crate::protocol::{
    ENCRYPTION_CHUNK_SIZE, LENGTH_PREFIX_LEN, MAX_FRAME_LEN, MAX_FRAME_PLAINTEXT, MIN_FRAME_LEN,
    NONCE_LEN,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("cannot generate frame nonce: {0}")]
    NonceGeneration(String),

    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    #[error("cannot decrypt frame: authentication failed")]
    AuthenticationFailure,

    #[error("corrupt frame length prefix: {0}")]
    LengthPrefixCorrupt(u64),

    #[error("cannot initialize AES-256-GCM cipher")]
    CipherInit,

    #[error("cannot seal {0} byte frame")]
    Seal(usize),

    #[error("transport: {message}")]
    Transport { kind: io::ErrorKind, message: String },

    #[error("stream already closed")]
    Closed,
}

impl CodecError {
    /// Recover a codec error carried inside an `io::Error`, looking through
    /// nested io errors and error sources.
    pub fn from_io(err: &io::Error) -> Option<CodecError> {
        let mut current: Option<&(dyn std::error::Error + 'static)> = err
            .get_ref()
            .map(|inner| inner as &(dyn std::error::Error + 'static));
        while let Some(e) = current {
            if let Some(codec) = e.downcast_ref::<CodecError>() {
                return Some(codec.clone());
            }
            current = match e.downcast_ref::<io::Error>() {
                Some(io_err) => io_err
                    .get_ref()
                    .map(|inner| inner as &(dyn std::error::Error + 'static)),
                None => e.source(),
            };
        }
        None
    }

    fn transport(err: &io::Error) -> Self {
        CodecError::from_io(err).unwrap_or_else(|| CodecError::Transport {
            kind: err.kind(),
            message: err.to_string(),
        })
    }

    fn io_kind(&self) -> io::ErrorKind {
        match self {
            CodecError::ShortRead { .. } => io::ErrorKind::UnexpectedEof,
            CodecError::AuthenticationFailure | CodecError::LengthPrefixCorrupt(_) => {
                io::ErrorKind::InvalidData
            }
            CodecError::CipherInit | CodecError::Seal(_) => io::ErrorKind::InvalidInput,
            CodecError::Transport { kind, .. } => *kind,
            CodecError::NonceGeneration(_) | CodecError::Closed => io::ErrorKind::Other,
        }
    }
}

impl From<CodecError> for io::Error {
    fn from(err: CodecError) -> io::Error {
        io::Error::new(err.io_kind(), err)
    }
}

#[derive(Debug)]
enum State {
    Active,
    // Decryptor only: clean end of stream at a frame boundary
    Drained,
    Failed(CodecError),
    Closed,
}

impl State {
    fn check(&self) -> Result<(), CodecError> {
        match self {
            State::Active | State::Drained => Ok(()),
            State::Failed(e) => Err(e.clone()),
            State::Closed => Err(CodecError::Closed),
        }
    }
}

fn new_cipher(key: &Key) -> Result<Aes256Gcm, CodecError> {
    Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| CodecError::CipherInit)
}

/// Seal `plaintext` under a fresh nonce and write the whole frame.
fn write_frame<W: Write>(
    inner: &mut W,
    cipher: &Aes256Gcm,
    plaintext: &[u8],
) -> Result<(), CodecError> {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng
        .try_fill_bytes(&mut nonce)
        .map_err(|e| CodecError::NonceGeneration(e.to_string()))?;

    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CodecError::Seal(plaintext.len()))?;

    let frame_len = NONCE_LEN + sealed.len();
    let mut frame = Vec::with_capacity(LENGTH_PREFIX_LEN + frame_len);
    frame.extend_from_slice(&(frame_len as u64).to_be_bytes());
    frame.extend_from_slice(&nonce);
    frame.extend_from_slice(&sealed);

    inner
        .write_all(&frame)
        .map_err(|e| CodecError::transport(&e))
}

/// Read until `buf` is full or the reader reports end of stream.
/// Returns how many bytes were filled.
fn read_full<R: Read>(inner: &mut R, buf: &mut [u8]) -> Result<usize, CodecError> {
    let mut filled = 0;
    while filled < buf.len() {
        match inner.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(CodecError::transport(&e)),
        }
    }
    Ok(filled)
}

/// Encrypting writer. Accumulates plaintext into a fixed-capacity buffer and
/// emits one frame per buffer flush (or per oversized write).
///
/// Must be finished with [`StreamEncryptor::close`]; dropping it discards any
/// pending plaintext. Closing never closes the wrapped writer.
pub struct StreamEncryptor<W: Write> {
    inner: W,
    cipher: Option<Aes256Gcm>,
    plaintext: Vec<u8>,
    capacity: usize,
    state: State,
    frames: u64,
}

impl<W: Write> StreamEncryptor<W> {
    pub fn new(inner: W, key: &Key) -> Result<Self, CodecError> {
        Self::with_capacity(inner, key, ENCRYPTION_CHUNK_SIZE)
    }

    /// `capacity` is clamped to `1..=MAX_FRAME_PLAINTEXT`
    pub fn with_capacity(inner: W, key: &Key, capacity: usize) -> Result<Self, CodecError> {
        let capacity = capacity.clamp(1, MAX_FRAME_PLAINTEXT);
        Ok(StreamEncryptor {
            inner,
            cipher: Some(new_cipher(key)?),
            plaintext: Vec::with_capacity(capacity),
            capacity,
            state: State::Active,
            frames: 0,
        })
    }

    /// Number of frames emitted so far
    pub fn frames_written(&self) -> u64 {
        self.frames
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    /// Give back the wrapped writer. Pending plaintext is not flushed.
    pub fn into_inner(self) -> W {
        self.inner
    }

    fn fail(&mut self, err: CodecError) -> CodecError {
        self.state = State::Failed(err.clone());
        err
    }

    fn seal(&mut self, data: &[u8]) -> Result<(), CodecError> {
        let cipher = match self.cipher.as_ref() {
            Some(c) => c,
            None => return Err(CodecError::Closed),
        };
        match write_frame(&mut self.inner, cipher, data) {
            Ok(()) => {
                self.frames += 1;
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn flush_pending(&mut self) -> Result<(), CodecError> {
        self.state.check()?;
        if self.plaintext.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut self.plaintext);
        let result = self.seal(&pending);
        // Reuse the allocation
        self.plaintext = pending;
        self.plaintext.clear();
        result
    }

    /// Seal any non-empty remainder and release cipher state. The wrapped
    /// writer stays open and owned by the caller.
    pub fn close(&mut self) -> Result<(), CodecError> {
        let result = self.flush_pending();
        // A failed instance keeps reporting its first error
        if result.is_ok() {
            self.state = State::Closed;
        }
        self.cipher = None;
        self.plaintext = Vec::new();
        result
    }
}

impl<W: Write> Write for StreamEncryptor<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.state.check()?;
        if buf.is_empty() {
            return Ok(0);
        }

        // Room left in the pending buffer
        if self.plaintext.len() + buf.len() <= self.capacity {
            self.plaintext.extend_from_slice(buf);
            return Ok(buf.len());
        }

        self.flush_pending()?;

        if buf.len() <= self.capacity {
            self.plaintext.extend_from_slice(buf);
            return Ok(buf.len());
        }

        // Too big to buffer: seal directly, bounded by the decoder's frame limit
        let take = buf.len().min(MAX_FRAME_PLAINTEXT);
        self.seal(&buf[..take])?;
        Ok(take)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_pending()?;
        if let Err(e) = self.inner.flush() {
            let err = self.fail(CodecError::transport(&e));
            return Err(err.into());
        }
        Ok(())
    }
}

/// Decrypting reader for streams produced by [`StreamEncryptor`].
pub struct StreamDecryptor<R: Read> {
    inner: R,
    cipher: Option<Aes256Gcm>,
    plaintext: Vec<u8>,
    cursor: usize,
    state: State,
    frames: u64,
}

impl<R: Read> StreamDecryptor<R> {
    pub fn new(inner: R, key: &Key) -> Result<Self, CodecError> {
        Ok(StreamDecryptor {
            inner,
            cipher: Some(new_cipher(key)?),
            plaintext: Vec::new(),
            cursor: 0,
            state: State::Active,
            frames: 0,
        })
    }

    /// Number of frames authenticated so far
    pub fn frames_read(&self) -> u64 {
        self.frames
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Release cipher state, reporting the sticky error if the stream failed.
    pub fn close(&mut self) -> Result<(), CodecError> {
        let result = self.state.check();
        if result.is_ok() {
            self.state = State::Closed;
        }
        self.cipher = None;
        self.plaintext = Vec::new();
        self.cursor = 0;
        result
    }

    /// Load the next frame into the plaintext buffer.
    /// `Ok(false)` is a clean end of stream at a frame boundary.
    fn next_frame(&mut self) -> Result<bool, CodecError> {
        let mut prefix = [0u8; LENGTH_PREFIX_LEN];
        let got = read_full(&mut self.inner, &mut prefix)?;
        if got == 0 {
            return Ok(false);
        }
        if got < LENGTH_PREFIX_LEN {
            return Err(CodecError::ShortRead {
                expected: LENGTH_PREFIX_LEN,
                actual: got,
            });
        }

        let len = u64::from_be_bytes(prefix);
        if len < MIN_FRAME_LEN as u64 || len > MAX_FRAME_LEN as u64 {
            return Err(CodecError::LengthPrefixCorrupt(len));
        }
        let len = len as usize;

        let mut frame = vec![0u8; len];
        let got = read_full(&mut self.inner, &mut frame)?;
        if got < len {
            return Err(CodecError::ShortRead {
                expected: len,
                actual: got,
            });
        }

        let (nonce, sealed) = frame.split_at(NONCE_LEN);
        let cipher = self.cipher.as_ref().ok_or(CodecError::Closed)?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| CodecError::AuthenticationFailure)?;

        self.plaintext = plaintext;
        self.cursor = 0;
        self.frames += 1;
        Ok(true)
    }
}

//                cursor
//                |
//                v
// abcdefghijklmnopqrstuvwxyz
// |<- already ->|
impl<R: Read> Read for StreamDecryptor<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.state.check()?;
        if matches!(self.state, State::Drained) {
            return Ok(0);
        }

        let mut copied = 0;
        while copied < buf.len() {
            if self.cursor == self.plaintext.len() {
                match self.next_frame() {
                    Ok(true) => continue,
                    Ok(false) => {
                        self.state = State::Drained;
                        break;
                    }
                    Err(e) => {
                        self.state = State::Failed(e.clone());
                        // Hand over what was already authenticated; the error
                        // surfaces on the next call.
                        if copied > 0 {
                            return Ok(copied);
                        }
                        return Err(e.into());
                    }
                }
            }

            let n = (buf.len() - copied).min(self.plaintext.len() - self.cursor);
            buf[copied..copied + n].copy_from_slice(&self.plaintext[self.cursor..self.cursor + n]);
            copied += n;
            self.cursor += n;
        }
        Ok(copied)
    }
}
