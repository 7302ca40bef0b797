//! Shared wire constants for the tarpipe stream layers

// Encryption frame layout: [u64 BE length][nonce][ciphertext + tag]
pub const LENGTH_PREFIX_LEN: usize = 8;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

// Default plaintext accumulation capacity for the stream encryptor
pub const ENCRYPTION_CHUNK_SIZE: usize = 1024;

// Largest plaintext sealed into a single frame. Oversized writes are
// accepted in pieces of at most this size.
pub const MAX_FRAME_PLAINTEXT: usize = 64 * 1024 * 1024;

// Largest length prefix a decryptor accepts - prevents memory exhaustion
// from a corrupted or hostile prefix
pub const MAX_FRAME_LEN: usize = NONCE_LEN + MAX_FRAME_PLAINTEXT + TAG_LEN;

// Smallest valid frame: nonce plus tag around an empty plaintext
pub const MIN_FRAME_LEN: usize = NONCE_LEN + TAG_LEN;

// Domain tag for passphrase key derivation
pub const KEY_DOMAIN_TAG: &str = "tarpipe stream key v1";

// Buffered socket and file I/O
pub const IO_BUFFER_SIZE: usize = 64 * 1024;

// Suffix for regular files while their payload is being received
pub const PARTIAL_SUFFIX: &str = ".partial";

pub const DEFAULT_PORT: u16 = 6969;

// gzip level used when the config file does not name one
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 6;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_bounds_are_consistent() {
        assert_eq!(MIN_FRAME_LEN, 28);
        assert!(MAX_FRAME_LEN > MAX_FRAME_PLAINTEXT);
        assert!(ENCRYPTION_CHUNK_SIZE <= MAX_FRAME_PLAINTEXT);
        // Frame length must fit the u64 prefix on every platform
        assert!((MAX_FRAME_LEN as u64) < u64::MAX);
    }
}
