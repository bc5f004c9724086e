//! Caching wrapper around an embedder.
//!
//! Per-process LRU keyed by the SHA-256 of the query text, so repeated
//! queries skip inference. Thread-safe; one lock around the cache only.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use sha2::{Digest, Sha256};

use super::{check_contract, EmbedError, Embedder};

/// An [`Embedder`] with a bounded result cache in front.
pub struct CachedEmbedder<E> {
    inner: E,
    cache: Mutex<LruCache<[u8; 32], Vec<f32>>>,
}

impl<E: Embedder> CachedEmbedder<E> {
    /// Wrap an embedder with a cache of the given capacity.
    pub fn new(inner: E, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn key(text: &str) -> [u8; 32] {
        Sha256::digest(text.as_bytes()).into()
    }
}

impl<E: Embedder> Embedder for CachedEmbedder<E> {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let key = Self::key(text);
        if let Ok(mut cache) = self.cache.lock() {
            if let Some(hit) = cache.get(&key) {
                return Ok(hit.clone());
            }
        }

        let vector = self.inner.embed(text)?;
        check_contract(&vector, self.inner.dimensions())?;

        if let Ok(mut cache) = self.cache.lock() {
            cache.put(key, vector.clone());
        }
        Ok(vector)
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }
}
