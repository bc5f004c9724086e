//! Embedding collaborator seam.
//!
//! The model itself is external; the engine only depends on the [`Embedder`]
//! trait. Vectors are persisted exactly as produced (no re-normalization);
//! similarity uses cosine, so absolute norm is immaterial.

mod cache;
mod hashing;
mod vector_ops;

pub use cache::CachedEmbedder;
pub use hashing::HashingEmbedder;
pub use vector_ops::{cosine_similarity, l2_norm, l2_normalize, vector_from_bytes, vector_to_bytes};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Embedding failure modes.
#[non_exhaustive]
#[derive(Debug, Clone, thiserror::Error)]
pub enum EmbedError {
    /// The produced vector has the wrong dimension.
    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    Dimension { expected: usize, got: usize },
    /// The produced vector is degenerate (zero, NaN, or out-of-contract norm).
    #[error("degenerate embedding: {0}")]
    Degenerate(String),
    /// Input the model cannot embed.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// The embedder is temporarily unavailable; the caller may retry.
    #[error("embedder unavailable: {0}")]
    Unavailable(String),
}

// ============================================================================
// EMBEDDER TRAIT
// ============================================================================

/// External embedding model contract.
///
/// Implementations must be deterministic for a given model, produce vectors
/// of exactly `dimensions()` components with L2 norm in `[0.5, 2.0]`, and
/// never return the zero vector.
pub trait Embedder: Send + Sync {
    /// Embed one text.
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError>;

    /// Fixed output dimension.
    fn dimensions(&self) -> usize;
}

impl<E: Embedder + ?Sized> Embedder for std::sync::Arc<E> {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        (**self).embed(text)
    }

    fn dimensions(&self) -> usize {
        (**self).dimensions()
    }
}

/// Validate a vector against the collaborator contract.
pub fn check_contract(vector: &[f32], expected_dim: usize) -> Result<(), EmbedError> {
    if vector.len() != expected_dim {
        return Err(EmbedError::Dimension {
            expected: expected_dim,
            got: vector.len(),
        });
    }
    if vector.iter().any(|x| !x.is_finite()) {
        return Err(EmbedError::Degenerate("non-finite component".to_string()));
    }
    let norm = l2_norm(vector);
    if norm == 0.0 {
        return Err(EmbedError::Degenerate("zero vector".to_string()));
    }
    if !(0.5..=2.0).contains(&norm) {
        return Err(EmbedError::Degenerate(format!(
            "L2 norm {norm} outside [0.5, 2.0]"
        )));
    }
    Ok(())
}
