//! tarpipe library
//!
//! File-tree transfer over a single TCP connection: a tar record stream,
//! optionally encrypted in AES-256-GCM frames and optionally gzip-compressed.

pub mod cli;
pub mod config;
pub mod error;
pub mod extractor;
pub mod fifo;
pub mod kdf;
pub mod layers;
pub mod logger;
pub mod progress;
pub mod protocol;
pub mod serializer;
pub mod session;
pub mod stream_cipher;
pub mod transport;
