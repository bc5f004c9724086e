//! Deterministic feature-hashing embedder.
//!
//! Satisfies the collaborator contract without a model: token trigrams are
//! hashed into a fixed number of buckets and the result is L2-normalized.
//! Texts sharing vocabulary land near each other; identical texts map to
//! identical vectors. Used by the test suite and as the wired-in fallback
//! when no external model is configured.

use sha2::{Digest, Sha256};

use super::{EmbedError, Embedder};
use crate::embeddings::l2_normalize;

/// Model-free embedder based on hashed character trigrams and word unigrams.
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }

    fn bucket(&self, feature: &[u8]) -> (usize, f32) {
        let digest = Sha256::digest(feature);
        let idx = u64::from_le_bytes(digest[..8].try_into().expect("digest is 32 bytes"));
        // Second hash word decides the sign so buckets cancel rather than pile up.
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        ((idx % self.dimensions as u64) as usize, sign)
    }
}

impl Embedder for HashingEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let lowered = text.to_lowercase();
        let tokens: Vec<&str> = lowered.split_whitespace().collect();
        if tokens.is_empty() {
            return Err(EmbedError::InvalidInput("empty text".to_string()));
        }

        let mut v = vec![0.0f32; self.dimensions];
        for token in &tokens {
            let (idx, sign) = self.bucket(token.as_bytes());
            v[idx] += sign;
            let bytes = token.as_bytes();
            if bytes.len() >= 3 {
                for gram in bytes.windows(3) {
                    let (idx, sign) = self.bucket(gram);
                    v[idx] += 0.5 * sign;
                }
            }
        }

        if v.iter().all(|x| *x == 0.0) {
            // All features cancelled; pin a single bucket from the whole text.
            let (idx, _) = self.bucket(lowered.as_bytes());
            v[idx] = 1.0;
        }

        l2_normalize(&mut v);
        Ok(v)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}
