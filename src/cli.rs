//! Command-line surface and resolution into a run configuration

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::{FileConfig, TransferConfig};
use crate::error::{Result, TransferError};
use crate::kdf::{key_from_passphrase, PassphraseSource};

/// Environment variable consulted before prompting for a passphrase
pub const PASSPHRASE_ENV: &str = "TARPIPE_PASSPHRASE";

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "tarpipe - stream a directory tree over one TCP connection"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Encrypt the stream with a key derived from a shared passphrase
    #[arg(short = 's', long, global = true)]
    pub secure: bool,

    /// Compress the stream with gzip
    #[arg(short = 'z', long, global = true)]
    pub gzip: bool,

    /// Debug-level diagnostics
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Show a progress spinner with throughput
    #[arg(short, long, global = true)]
    pub progress: bool,

    /// Append timestamped transfer events to this file
    #[arg(long = "log-file", global = true)]
    pub log_file: Option<PathBuf>,

    /// Read defaults from this TOML file instead of the default location
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Plaintext bytes per encryption frame. Receivers accept any frame size.
    #[arg(long = "chunk-size", global = true)]
    pub chunk_size: Option<usize>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Connect to a receiver and send paths (default: current directory)
    Send {
        /// Receiver address (host:port)
        addr: String,
        /// Files or directories to send
        paths: Vec<PathBuf>,
    },
    /// Accept one sender and extract what it sends
    Receive {
        /// Listen address (host:port)
        bind: String,
        /// Destination root
        #[arg(long, default_value = ".")]
        dest: PathBuf,
    },
}

impl Cli {
    pub fn verbose(&self, file: &FileConfig) -> bool {
        self.verbose || file.verbose.unwrap_or(false)
    }

    pub fn log_file(&self, file: &FileConfig) -> Option<PathBuf> {
        self.log_file.clone().or_else(|| file.log_file.clone())
    }

    /// Merge flags over file defaults and obtain the key when encrypting.
    /// A set `env_passphrase` wins over `prompt`.
    pub fn resolve(
        &self,
        file: &FileConfig,
        env_passphrase: Option<String>,
        prompt: &mut dyn PassphraseSource,
    ) -> Result<TransferConfig> {
        let mut cfg = TransferConfig::default()
            .with_compression(self.gzip || file.gzip.unwrap_or(false));
        if let Some(n) = self.chunk_size.or(file.chunk_size) {
            cfg.chunk_capacity = n;
        }
        if let Some(level) = file.compression_level {
            cfg.compression_level = level;
        }

        if self.secure || file.secure.unwrap_or(false) {
            let passphrase = match env_passphrase {
                Some(p) => p,
                None => prompt
                    .passphrase()
                    .map_err(|e| TransferError::Config(format!("passphrase: {}", e)))?,
            };
            if passphrase.trim_end_matches(['\r', '\n']).is_empty() {
                return Err(TransferError::Config("empty passphrase".into()));
            }
            cfg = cfg.with_key(key_from_passphrase(&passphrase)?);
        }
        cfg.validate()?;
        Ok(cfg)
    }
}
