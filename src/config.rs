//! Run configuration: resolved layer settings plus optional TOML defaults

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{Result, TransferError};
use crate::kdf::Key;
use crate::protocol::{DEFAULT_COMPRESSION_LEVEL, ENCRYPTION_CHUNK_SIZE, MAX_FRAME_PLAINTEXT};

/// Layer settings for one run. Both ends must agree on the booleans and the
/// key; nothing is negotiated on the wire.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub use_compression: bool,
    pub use_encryption: bool,
    pub key: Option<Key>,
    /// Plaintext bytes accumulated per encryption frame
    pub chunk_capacity: usize,
    /// gzip level 0-9
    pub compression_level: u32,
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfig {
            use_compression: false,
            use_encryption: false,
            key: None,
            chunk_capacity: ENCRYPTION_CHUNK_SIZE,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

impl TransferConfig {
    pub fn with_compression(mut self, on: bool) -> Self {
        self.use_compression = on;
        self
    }

    /// Turn on encryption under `key`
    pub fn with_key(mut self, key: Key) -> Self {
        self.use_encryption = true;
        self.key = Some(key);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.use_encryption && self.key.is_none() {
            return Err(TransferError::Config(
                "encryption requested without a key".into(),
            ));
        }
        if self.chunk_capacity == 0 || self.chunk_capacity > MAX_FRAME_PLAINTEXT {
            return Err(TransferError::Config(format!(
                "chunk size must be between 1 and {} bytes, got {}",
                MAX_FRAME_PLAINTEXT, self.chunk_capacity
            )));
        }
        if self.compression_level > 9 {
            return Err(TransferError::Config(format!(
                "compression level must be 0-9, got {}",
                self.compression_level
            )));
        }
        Ok(())
    }

    pub fn encryption_key(&self) -> Result<&Key> {
        self.key
            .as_ref()
            .ok_or_else(|| TransferError::Config("encryption requested without a key".into()))
    }
}

/// Defaults read from `config.toml`. Command-line flags override them.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub secure: Option<bool>,
    pub gzip: Option<bool>,
    pub verbose: Option<bool>,
    pub chunk_size: Option<usize>,
    pub compression_level: Option<u32>,
    pub log_file: Option<PathBuf>,
}

pub fn config_dir() -> PathBuf {
    #[cfg(windows)]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("tarpipe");
        }
    }
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        if !xdg.is_empty() {
            return PathBuf::from(xdg).join("tarpipe");
        }
    }
    // Unix-like default
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".config").join("tarpipe");
    }
    PathBuf::from(".tarpipe")
}

pub fn default_config_path() -> PathBuf {
    config_dir().join("config.toml")
}

pub fn parse_file_config(data: &str) -> Result<FileConfig> {
    toml::from_str(data).map_err(|e| TransferError::Config(e.to_string()))
}

/// Load defaults from `explicit` (must exist) or from the default location
/// (optional).
pub fn load_file_config(explicit: Option<&Path>) -> Result<FileConfig> {
    let (path, required) = match explicit {
        Some(p) => (p.to_path_buf(), true),
        None => (default_config_path(), false),
    };
    match std::fs::read_to_string(&path) {
        Ok(data) => parse_file_config(&data)
            .map_err(|e| TransferError::Config(format!("{}: {}", path.display(), e))),
        Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => {
            Ok(FileConfig::default())
        }
        Err(e) => Err(TransferError::Config(format!("{}: {}", path.display(), e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kdf::derive_key;

    #[test]
    fn test_default_is_plain_and_valid() {
        let cfg = TransferConfig::default();
        assert!(!cfg.use_compression);
        assert!(!cfg.use_encryption);
        assert_eq!(cfg.chunk_capacity, ENCRYPTION_CHUNK_SIZE);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_encryption_requires_key() {
        let cfg = TransferConfig {
            use_encryption: true,
            ..TransferConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(TransferError::Config(_))));
        assert!(cfg.encryption_key().is_err());

        let cfg = TransferConfig::default().with_key(derive_key("t", "p").unwrap());
        cfg.validate().unwrap();
        assert!(cfg.encryption_key().is_ok());
    }

    #[test]
    fn test_rejects_bad_chunk_and_level() {
        let cfg = TransferConfig {
            chunk_capacity: 0,
            ..TransferConfig::default()
        };
        assert!(cfg.validate().is_err());
        let cfg = TransferConfig {
            compression_level: 10,
            ..TransferConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_parse_file_config() {
        let cfg = parse_file_config(
            r#"
            secure = true
            gzip = false
            chunk_size = 4096
            log_file = "/tmp/tarpipe.log"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.secure, Some(true));
        assert_eq!(cfg.gzip, Some(false));
        assert_eq!(cfg.chunk_size, Some(4096));
        assert_eq!(cfg.log_file, Some(PathBuf::from("/tmp/tarpipe.log")));
        assert_eq!(cfg.compression_level, None);
    }

    #[test]
    fn test_parse_file_config_rejects_unknown_keys() {
        assert!(parse_file_config("sekure = true").is_err());
    }

    #[test]
    fn test_load_file_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "gzip = true\n").unwrap();
        let cfg = load_file_config(Some(&path)).unwrap();
        assert_eq!(cfg.gzip, Some(true));

        // An explicitly named file must exist
        let missing = dir.path().join("missing.toml");
        assert!(load_file_config(Some(&missing)).is_err());
    }
}
