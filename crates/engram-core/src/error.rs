//! Error taxonomy for the memory engine.
//!
//! Every component maps its low-level failures onto these kinds at its
//! boundary; nothing below `Invalid`/`NotFound` leaks to callers.

use crate::embeddings::EmbedError;

/// Crate-wide error type.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    /// Caller input violates a documented constraint.
    #[error("invalid input: {0}")]
    Invalid(String),

    /// No memory exists for the given hash.
    #[error("not found: {0}")]
    NotFound(String),

    /// Transient contention; the caller may retry.
    #[error("retryable: {0}")]
    Retryable(String),

    /// The embedder failed deterministically (wrong dimension, NaN, zero vector).
    #[error("embedding: {0}")]
    Embedding(String),

    /// An integrity invariant is violated and could not be repaired.
    #[error("corruption: {0}")]
    Corruption(String),

    /// The operation exceeded its budget.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The caller cancelled before commit.
    #[error("cancelled")]
    Cancelled,

    /// A consolidation pass aborted cleanly; no user-visible data changed.
    #[error("consolidation: {0}")]
    Consolidation(String),
}

impl MemoryError {
    /// Stable kind name for wire surfaces and the ops log.
    pub fn kind(&self) -> &'static str {
        match self {
            MemoryError::Invalid(_) => "invalid",
            MemoryError::NotFound(_) => "not_found",
            MemoryError::Retryable(_) => "retryable",
            MemoryError::Embedding(_) => "embedding",
            MemoryError::Corruption(_) => "corruption",
            MemoryError::Timeout(_) => "timeout",
            MemoryError::Cancelled => "cancelled",
            MemoryError::Consolidation(_) => "consolidation",
        }
    }

    /// Whether the caller may usefully retry the same request.
    pub fn retryable(&self) -> bool {
        matches!(self, MemoryError::Retryable(_) | MemoryError::Timeout(_))
    }
}

impl From<rusqlite::Error> for MemoryError {
    fn from(e: rusqlite::Error) -> Self {
        match e.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy)
            | Some(rusqlite::ErrorCode::DatabaseLocked) => {
                MemoryError::Retryable(format!("database busy: {e}"))
            }
            Some(rusqlite::ErrorCode::DatabaseCorrupt)
            | Some(rusqlite::ErrorCode::NotADatabase) => {
                MemoryError::Corruption(format!("database corrupt: {e}"))
            }
            _ => MemoryError::Corruption(format!("database error: {e}")),
        }
    }
}

impl From<EmbedError> for MemoryError {
    fn from(e: EmbedError) -> Self {
        match e {
            EmbedError::Unavailable(msg) => MemoryError::Retryable(msg),
            other => MemoryError::Embedding(other.to_string()),
        }
    }
}

impl From<std::io::Error> for MemoryError {
    fn from(e: std::io::Error) -> Self {
        MemoryError::Corruption(format!("io error: {e}"))
    }
}

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, MemoryError>;
