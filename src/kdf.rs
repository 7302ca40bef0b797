//! Passphrase key derivation
//!
//! HMAC-SHA-512/256 keyed by a fixed domain tag over the passphrase. There is
//! no salt and no stretching: both ends derive the same key from the same
//! passphrase without a handshake, so the passphrase must be strong and must
//! be shared out of band.

use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use sha2::Sha512_256;
use std::fmt;
use std::io::{self, BufRead, Write};

use crate::error::{Result, TransferError};
use crate::protocol::KEY_DOMAIN_TAG;

pub const KEY_LEN: usize = 32;

/// 32-byte symmetric stream key
#[derive(Clone, PartialEq, Eq)]
pub struct Key([u8; KEY_LEN]);

impl Key {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Key(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Key(<redacted>)")
    }
}

/// Derive a key from `(tag, passphrase)`. Deterministic.
pub fn derive_key(tag: &str, passphrase: &str) -> Result<Key> {
    let mut mac = <Hmac<Sha512_256> as KeyInit>::new_from_slice(tag.as_bytes())
        .map_err(|e| TransferError::Config(format!("key derivation: {}", e)))?;
    mac.update(passphrase.as_bytes());
    let digest = mac.finalize().into_bytes();

    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&digest[..KEY_LEN]);
    Ok(Key(key))
}

/// Derive the stream key for a passphrase as typed at a prompt.
/// The trailing line terminator is not part of the secret.
pub fn key_from_passphrase(passphrase: &str) -> Result<Key> {
    derive_key(KEY_DOMAIN_TAG, passphrase.trim_end_matches(['\r', '\n']))
}

/// Source of the shared passphrase
pub trait PassphraseSource {
    fn passphrase(&mut self) -> io::Result<String>;
}

/// Prompts on stderr and reads one line from stdin
pub struct StdinPrompt;

impl PassphraseSource for StdinPrompt {
    fn passphrase(&mut self) -> io::Result<String> {
        let mut stderr = io::stderr();
        write!(stderr, "Passphrase: ")?;
        stderr.flush()?;

        let mut line = String::new();
        let n = io::stdin().lock().read_line(&mut line)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "no passphrase on stdin",
            ));
        }
        Ok(line)
    }
}

/// Passphrase known up front (environment, tests)
pub struct FixedPassphrase(pub String);

impl PassphraseSource for FixedPassphrase {
    fn passphrase(&mut self) -> io::Result<String> {
        Ok(self.0.clone())
    }
}
