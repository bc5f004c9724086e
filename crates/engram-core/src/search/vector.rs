//! In-memory vector index.
//!
//! Exact cosine scan over the embedding column, keyed by store row id.
//! Rebuilt from the database on open; updated in place on insert/delete.
//! Exact scoring keeps result ordering deterministic, which the ranking
//! contract (score, then recency, then row id) requires.

use std::collections::HashMap;

use crate::embeddings::cosine_similarity;
use crate::error::{MemoryError, Result};

/// Index statistics.
#[derive(Debug, Clone)]
pub struct VectorIndexStats {
    /// Total number of vectors.
    pub total_vectors: usize,
    /// Vector dimensions.
    pub dimensions: usize,
    /// Estimated memory usage in bytes.
    pub memory_bytes: usize,
}

/// Process-local index over the store's embedding rows.
pub struct VectorIndex {
    dimensions: usize,
    vectors: HashMap<i64, Vec<f32>>,
}

impl VectorIndex {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            vectors: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn contains(&self, row_id: i64) -> bool {
        self.vectors.contains_key(&row_id)
    }

    /// Add or replace a vector for a row.
    pub fn add(&mut self, row_id: i64, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimensions {
            return Err(MemoryError::Embedding(format!(
                "index dimension mismatch: expected {}, got {}",
                self.dimensions,
                vector.len()
            )));
        }
        self.vectors.insert(row_id, vector.to_vec());
        Ok(())
    }

    /// Remove a row's vector. Returns whether it was present.
    pub fn remove(&mut self, row_id: i64) -> bool {
        self.vectors.remove(&row_id).is_some()
    }

    /// Drop everything; used when an external writer invalidates the index.
    pub fn clear(&mut self) {
        self.vectors.clear();
    }

    /// Raw cosine scores for the `limit` nearest rows, descending.
    ///
    /// Ties are broken by ascending row id so repeated searches are stable.
    /// An empty index returns an empty list, never an error.
    pub fn search(&self, query: &[f32], limit: usize) -> Result<Vec<(i64, f32)>> {
        if query.len() != self.dimensions {
            return Err(MemoryError::Embedding(format!(
                "query dimension mismatch: expected {}, got {}",
                self.dimensions,
                query.len()
            )));
        }
        if self.vectors.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let mut scored: Vec<(i64, f32)> = self
            .vectors
            .iter()
            .map(|(&row_id, v)| (row_id, cosine_similarity(query, v)))
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(limit);
        Ok(scored)
    }

    /// Nearest neighbors of an indexed row, excluding the row itself.
    pub fn neighbors_of(&self, row_id: i64, limit: usize) -> Result<Vec<(i64, f32)>> {
        let Some(vector) = self.vectors.get(&row_id) else {
            return Ok(Vec::new());
        };
        let vector = vector.clone();
        let mut results = self.search(&vector, limit + 1)?;
        results.retain(|(id, _)| *id != row_id);
        results.truncate(limit);
        Ok(results)
    }

    /// Vector for a row, if indexed.
    pub fn get(&self, row_id: i64) -> Option<&[f32]> {
        self.vectors.get(&row_id).map(|v| v.as_slice())
    }

    /// Iterate all (row_id, vector) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (i64, &[f32])> {
        self.vectors.iter().map(|(&id, v)| (id, v.as_slice()))
    }

    pub fn stats(&self) -> VectorIndexStats {
        VectorIndexStats {
            total_vectors: self.vectors.len(),
            dimensions: self.dimensions,
            memory_bytes: self.vectors.len() * (self.dimensions * 4 + 16),
        }
    }
}
