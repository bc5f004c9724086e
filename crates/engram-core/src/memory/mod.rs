//! Memory module - core types and data structures
//!
//! A memory is a short unit of text with content-addressed identity, a tag
//! set, typed metadata, a vector embedding, and a decaying relevance score.

mod hash;
mod record;

pub use hash::{normalize, ContentHash};
pub use record::{
    Association, AssociationKind, Cluster, Memory, MemoryStats, MemoryType, Metadata,
    MetaValue, RetentionClass, StoreInput, StoreReceipt, TagMode, UpdateInput,
};

/// Reserved metadata keys.
pub mod meta_keys {
    /// Hostname recorded by the tagging policy.
    pub const HOSTNAME: &str = "hostname";
    /// Originating machine recorded by external replicators.
    pub const SOURCE_MACHINE: &str = "source_machine";
    /// Parent hashes of a compressed summary.
    pub const CONSOLIDATED_FROM: &str = "consolidated_from";
    /// Cluster that produced a compressed summary.
    pub const CLUSTER_ID: &str = "cluster_id";
    /// Retention class controlling the decay time constant.
    pub const RETENTION_CLASS: &str = "retention_class";
}
