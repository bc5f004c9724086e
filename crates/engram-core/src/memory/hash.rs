//! Content identity.
//!
//! A memory's public identity is the SHA-256 of its NFC-normalized UTF-8
//! content, rendered as 64 lowercase hex characters at interface boundaries.
//! Stable across process restarts and operating systems.

use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

use crate::error::{MemoryError, Result};

/// A content hash: 32 bytes of SHA-256.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    /// Hash content after NFC normalization.
    pub fn of_content(content: &str) -> Self {
        let normalized = normalize(content);
        let digest = Sha256::digest(normalized.as_bytes());
        ContentHash(digest.into())
    }

    /// Lowercase hex form used at interface boundaries.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse the 64-char lowercase hex form.
    pub fn from_hex(s: &str) -> Result<Self> {
        if s.len() != 64 {
            return Err(MemoryError::Invalid(format!(
                "malformed hash: expected 64 hex chars, got {}",
                s.len()
            )));
        }
        let bytes = hex::decode(s)
            .map_err(|e| MemoryError::Invalid(format!("malformed hash: {e}")))?;
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(ContentHash(out))
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// NFC-normalize content before hashing or storage.
pub fn normalize(content: &str) -> String {
    content.nfc().collect()
}
