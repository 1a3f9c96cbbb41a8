//! Integrity: per-chunk SHA-256 digest, hex-encoded. The digest is the chunk's identity.

use sha2::{Digest, Sha256};

/// Length of a hex-encoded SHA-256 digest.
pub const HASH_HEX_LEN: usize = 64;

/// Hash a chunk payload. Returns the lowercase hex digest.
pub fn hash_chunk(payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hex::encode(hasher.finalize())
}

/// Verify chunk payload against expected hex digest.
pub fn verify_chunk(payload: &[u8], expected_hash: &str) -> bool {
    hash_chunk(payload) == expected_hash
}

/// A chunk key is exactly 64 lowercase hex characters. Anything else never reaches the filesystem.
pub fn is_valid_hash(hash: &str) -> bool {
    hash.len() == HASH_HEX_LEN
        && hash
            .bytes()
            .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
