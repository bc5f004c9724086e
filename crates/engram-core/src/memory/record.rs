//! The memory record and its satellite types.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::hash::ContentHash;
use super::meta_keys;

// ============================================================================
// MEMORY TYPES
// ============================================================================

/// Kind of memory being stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum MemoryType {
    /// A free-standing note.
    #[default]
    Note,
    /// A recorded decision.
    Decision,
    /// A task or follow-up item.
    Task,
    /// Reference material.
    Reference,
    /// A session transcript fragment.
    Session,
    /// A consolidation-generated summary of a cluster.
    Compressed,
    /// Caller-defined type, stored as `other:<name>`.
    Other(String),
}

impl MemoryType {
    /// String form used in the database and on the wire.
    pub fn as_str(&self) -> std::borrow::Cow<'static, str> {
        match self {
            MemoryType::Note => "note".into(),
            MemoryType::Decision => "decision".into(),
            MemoryType::Task => "task".into(),
            MemoryType::Reference => "reference".into(),
            MemoryType::Session => "session".into(),
            MemoryType::Compressed => "compressed".into(),
            MemoryType::Other(name) => format!("other:{name}").into(),
        }
    }

    /// Parse from the string form; unknown values become `Other`.
    pub fn parse_name(s: &str) -> Self {
        match s {
            "note" => MemoryType::Note,
            "decision" => MemoryType::Decision,
            "task" => MemoryType::Task,
            "reference" => MemoryType::Reference,
            "session" => MemoryType::Session,
            "compressed" => MemoryType::Compressed,
            other => {
                let name = other.strip_prefix("other:").unwrap_or(other);
                MemoryType::Other(name.to_string())
            }
        }
    }
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for MemoryType {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&self.as_str())
    }
}

impl<'de> Deserialize<'de> for MemoryType {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        Ok(MemoryType::parse_name(&s))
    }
}

// ============================================================================
// RETENTION CLASSES
// ============================================================================

/// Category controlling the decay time constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RetentionClass {
    /// Never archived; tau 365 days by default.
    Critical,
    /// Long-lived reference material.
    Reference,
    /// The default class.
    #[default]
    Standard,
    /// Short-lived scratch memory.
    Temporary,
}

impl RetentionClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetentionClass::Critical => "critical",
            RetentionClass::Reference => "reference",
            RetentionClass::Standard => "standard",
            RetentionClass::Temporary => "temporary",
        }
    }

    /// Parse from the string form; unknown values fall back to standard.
    pub fn parse_name(s: &str) -> Self {
        match s {
            "critical" => RetentionClass::Critical,
            "reference" => RetentionClass::Reference,
            "temporary" => RetentionClass::Temporary,
            _ => RetentionClass::Standard,
        }
    }
}

impl std::fmt::Display for RetentionClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// METADATA VALUES
// ============================================================================

/// A metadata value: string, number, bool, or a list of strings
/// (`consolidated_from` is the only list-valued reserved key).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Bool(bool),
    Number(f64),
    String(String),
    StringList(Vec<String>),
}

impl From<&str> for MetaValue {
    fn from(s: &str) -> Self {
        MetaValue::String(s.to_string())
    }
}

impl From<f64> for MetaValue {
    fn from(n: f64) -> Self {
        MetaValue::Number(n)
    }
}

impl From<bool> for MetaValue {
    fn from(b: bool) -> Self {
        MetaValue::Bool(b)
    }
}

/// Metadata map. BTreeMap keeps the serialized form deterministic.
pub type Metadata = BTreeMap<String, MetaValue>;

// ============================================================================
// MEMORY RECORD
// ============================================================================

/// The primary record: one stored unit of text.
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Memory {
    /// Internal row id; not part of the public identity.
    #[serde(skip)]
    pub row_id: i64,
    /// NFC-normalized content.
    pub content: String,
    /// Hex form of the content hash; the public identity.
    pub content_hash: String,
    /// Tag set. Case-sensitive, order not significant; kept sorted.
    pub tags: Vec<String>,
    /// Kind of memory.
    pub memory_type: MemoryType,
    /// Typed metadata.
    pub metadata: Metadata,
    /// Set once at first insertion of this hash.
    pub created_at: DateTime<Utc>,
    /// Advances on tag/metadata updates.
    pub updated_at: DateTime<Utc>,
    /// Updated on any successful retrieval that returned this memory.
    pub last_accessed_at: DateTime<Utc>,
    /// Decayed relevance in [0, 1].
    pub relevance_score: f64,
    /// Archived memories are excluded from default queries, never deleted.
    pub archived: bool,
}

impl Memory {
    /// Retention class from metadata, defaulting to standard.
    pub fn retention_class(&self) -> RetentionClass {
        match self.metadata.get(meta_keys::RETENTION_CLASS) {
            Some(MetaValue::String(s)) => RetentionClass::parse_name(s),
            _ => RetentionClass::Standard,
        }
    }

    /// Parent hashes if this is a compressed summary.
    pub fn consolidated_from(&self) -> Vec<String> {
        match self.metadata.get(meta_keys::CONSOLIDATED_FROM) {
            Some(MetaValue::StringList(hashes)) => hashes.clone(),
            _ => Vec::new(),
        }
    }

    /// Parsed content hash.
    pub fn hash(&self) -> ContentHash {
        // The stored hex is produced by ContentHash::to_hex; round-trips.
        ContentHash::from_hex(&self.content_hash).expect("stored hash is valid hex")
    }
}

// ============================================================================
// STORE INPUTS / OUTPUTS
// ============================================================================

/// Input for storing a memory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct StoreInput {
    /// The content to store. Must be non-empty after normalization.
    pub content: String,
    /// Tags to attach.
    pub tags: Vec<String>,
    /// Metadata to attach.
    pub metadata: Metadata,
    /// Kind of memory; defaults to note.
    pub memory_type: MemoryType,
    /// Caller-supplied hostname for the tagging policy.
    pub client_hostname: Option<String>,
    /// Transport-layer hostname hint; set programmatically, never from the wire.
    #[serde(skip)]
    pub transport_hostname: Option<String>,
}

/// Outcome of a store call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreReceipt {
    /// Hex content hash of the stored memory.
    pub content_hash: String,
    /// Always true on success; mirrors the wire shape.
    pub success: bool,
    /// Whether the content already existed (tags/metadata were merged).
    pub duplicate: bool,
}

/// Input for updating tags/metadata on an existing memory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct UpdateInput {
    /// Tags to add.
    pub add_tags: Vec<String>,
    /// Tags to remove.
    pub remove_tags: Vec<String>,
    /// Metadata entries to set (shallow, right-wins).
    pub set_metadata: Metadata,
    /// Metadata keys to remove.
    pub remove_metadata: Vec<String>,
}

impl UpdateInput {
    pub fn is_empty(&self) -> bool {
        self.add_tags.is_empty()
            && self.remove_tags.is_empty()
            && self.set_metadata.is_empty()
            && self.remove_metadata.is_empty()
    }
}

/// Tag query mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagMode {
    /// Union of memories carrying any of the tags.
    #[default]
    Any,
    /// Intersection: memories carrying all of the tags.
    All,
}

// ============================================================================
// ASSOCIATIONS & CLUSTERS
// ============================================================================

/// Strength category of a discovered association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssociationKind {
    /// Similarity inside the discovery window.
    Creative,
    /// Similarity at or above the window's upper edge.
    Semantic,
}

impl AssociationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssociationKind::Creative => "creative",
            AssociationKind::Semantic => "semantic",
        }
    }

    pub fn parse_name(s: &str) -> Self {
        match s {
            "semantic" => AssociationKind::Semantic,
            _ => AssociationKind::Creative,
        }
    }
}

/// A directed edge between two memories produced by consolidation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Association {
    pub a_hash: String,
    pub b_hash: String,
    /// Raw cosine similarity at discovery time.
    pub similarity: f64,
    pub discovered_at: DateTime<Utc>,
    pub kind: AssociationKind,
}

/// A density-based grouping of embeddings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    pub cluster_id: String,
    /// Member content hashes.
    pub members: Vec<String>,
    /// L2-normalized centroid of member embeddings.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub centroid: Vec<f32>,
    pub created_at: DateTime<Utc>,
    pub last_rebuilt_at: DateTime<Utc>,
    /// Set when a later pass replaced this cluster.
    pub superseded: bool,
}

// ============================================================================
// STATISTICS
// ============================================================================

/// Store-level statistics.
#[non_exhaustive]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    /// Live (non-archived) memories.
    pub live_memories: i64,
    /// Archived memories.
    pub archived_memories: i64,
    /// Counts by memory type string, live only.
    pub by_type: BTreeMap<String, i64>,
    /// Distinct tags in the index.
    pub distinct_tags: i64,
    /// Discovered associations.
    pub associations: i64,
    /// Non-superseded clusters.
    pub clusters: i64,
    /// Database file size in bytes.
    pub disk_bytes: u64,
    /// Configured embedding dimension.
    pub vector_dimension: usize,
    /// Whether the last health check passed.
    pub healthy: bool,
}
