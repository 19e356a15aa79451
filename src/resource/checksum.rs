//! Configuration hashing for change detection.
//!
//! Checksums are computed over the canonical JSON encoding of a desired
//! configuration. Keys are kept in a `BTreeMap`, so the encoding and the
//! resulting hash do not depend on insertion order.

use sha2::{Digest, Sha256};

use super::descriptor::DesiredConfig;

/// Hasher for computing configuration checksums.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new configuration hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes the checksum of a desired configuration.
    #[must_use]
    pub fn checksum(&self, config: &DesiredConfig) -> String {
        let mut hasher = Sha256::new();

        for (key, value) in config {
            hasher.update(key.as_bytes());
            hasher.update([0u8]);
            // serde_json::Value serializes objects with sorted keys
            hasher.update(value.to_string().as_bytes());
            hasher.update([0u8]);
        }

        hex::encode(hasher.finalize())
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(hash: &str) -> &str {
        hash.get(..8).unwrap_or(hash)
    }

    /// Compares two hashes to determine if they are equal.
    #[must_use]
    pub fn hashes_match(hash1: &str, hash2: &str) -> bool {
        if hash1.len() != hash2.len() {
            return false;
        }

        hash1
            .bytes()
            .zip(hash2.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}
