//! Hashing utilities: blake3 for file digests, SHA-256 for row identity

use std::io;
use std::path::Path;

use sha2::{Digest, Sha256};

/// Hash a file's contents with blake3.
pub fn hash_file(path: &Path) -> io::Result<blake3::Hash> {
    let mut hasher = blake3::Hasher::new();
    hasher.update_mmap(path)?;
    Ok(hasher.finalize())
}

/// Hash raw bytes with blake3.
pub fn hash_bytes(data: &[u8]) -> blake3::Hash {
    blake3::hash(data)
}

/// Return the first 8 hex characters of a blake3 hash.
pub fn short_hash(hash: &blake3::Hash) -> String {
    hash.to_hex()[..8].to_string()
}

/// SHA-256 digest of raw bytes.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// SHA-256 digest of raw bytes as lowercase hex.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// Fold ordered per-row digests into one digest by hashing their
/// concatenated bytes.
pub fn combine_sha256(digests: &[[u8; 32]]) -> String {
    let mut hasher = Sha256::new();
    for d in digests {
        hasher.update(d);
    }
    hex::encode(hasher.finalize())
}
