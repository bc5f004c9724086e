//! # Engram Core
//!
//! Semantic memory engine: a content-addressed, tag-indexed,
//! vector-searchable store of short text memories with autonomous
//! background consolidation.
//!
//! - **Content-addressed storage**: SHA-256 of NFC-normalized content is a
//!   memory's identity; storing the same content twice merges tags and
//!   metadata instead of duplicating rows.
//! - **Semantic retrieval**: cosine k-NN over a pluggable embedder, with
//!   conjunctive tag/type/time filters and deterministic tie-breaking.
//! - **Natural-language recall**: `last week`, `3 days ago`,
//!   `January 2024`, compound phrases; half-open UTC ranges throughout.
//! - **Consolidation**: daily decay scoring, weekly association discovery,
//!   monthly clustering and compression, quarterly/yearly controlled
//!   forgetting. Passes archive, never delete.
//! - **Shared-file concurrency**: SQLite WAL with many readers and one
//!   writer, busy-retry with exponential backoff, and a change bus for
//!   observers.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use engram_core::{Config, HashingEmbedder, OpCtx, Store, StoreInput};
//!
//! let embedder = Arc::new(HashingEmbedder::new(384));
//! let store = Store::open(None, Config::default(), embedder)?;
//!
//! let ctx = OpCtx::new();
//! let receipt = store.store(
//!     StoreInput {
//!         content: "we picked sqlite for the memory backend".into(),
//!         tags: vec!["decision".into()],
//!         ..Default::default()
//!     },
//!     &ctx,
//! )?;
//!
//! let hits = store.retrieve("what backend did we pick", 5, 0.0, &Default::default(), &ctx)?;
//! let recalled = store.recall("decisions last week", 10, &Default::default(),
//!     Default::default(), None, &ctx)?;
//! ```

// ============================================================================
// MODULES
// ============================================================================

pub mod config;
pub mod consolidation;
pub mod ctx;
pub mod embeddings;
pub mod error;
pub mod events;
pub mod hostname;
pub mod memory;
pub mod opslog;
pub mod query;
pub mod search;
pub mod storage;
pub mod timeparse;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

pub use config::{Config, RetentionDays, Schedules};
pub use ctx::OpCtx;
pub use error::{MemoryError, Result};

pub use memory::{
    normalize, Association, AssociationKind, Cluster, ContentHash, Memory, MemoryStats,
    MemoryType, Metadata, MetaValue, RetentionClass, StoreInput, StoreReceipt, TagMode,
    UpdateInput,
};

pub use storage::{Filter, HealthIssue, HealthReport, ScanPages, Store, TimeField};

pub use query::{DebugHit, DebugRetrieval, RecallTarget, Scored};

pub use embeddings::{
    cosine_similarity, CachedEmbedder, EmbedError, Embedder, HashingEmbedder,
};

pub use search::{VectorIndex, VectorIndexStats};

pub use events::{ChangeBus, ChangeEvent};

pub use hostname::HostnamePolicy;

pub use timeparse::TimeRange;

pub use consolidation::{
    decay_score, ConsolidationEngine, Horizon, PassOutcome, PassRequest, PassState,
    Scheduler,
};

pub use opslog::{OpsLog, OpsRecord};

// ============================================================================
// VERSION INFO
// ============================================================================

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default embedding dimension when none is configured.
pub const DEFAULT_DIMENSIONS: usize = 384;

// ============================================================================
// PRELUDE
// ============================================================================

/// Convenient imports for common usage
pub mod prelude {
    pub use crate::{
        Config, ConsolidationEngine, Embedder, Filter, Horizon, Memory, MemoryError,
        MemoryStats, MemoryType, OpCtx, RecallTarget, Result, RetentionClass, Scheduler,
        Store, StoreInput, StoreReceipt, TagMode, UpdateInput,
    };
}
