//! Database Migrations
//!
//! Schema migration definitions for the storage layer.

use chrono::Utc;
use rusqlite::Connection;

use crate::error::Result;

/// Migration definitions
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Initial schema: memories, embeddings, tag index",
        up: MIGRATION_V1_UP,
    },
    Migration {
        version: 2,
        description: "Consolidation artifacts: associations, clusters",
        up: MIGRATION_V2_UP,
    },
    Migration {
        version: 3,
        description: "Access log and consolidation pass state",
        up: MIGRATION_V3_UP,
    },
];

/// A database migration
#[derive(Debug, Clone)]
pub struct Migration {
    /// Version number
    pub version: u32,
    /// Description
    pub description: &'static str,
    /// SQL to apply
    pub up: &'static str,
}

/// V1: memories + embeddings + inverted tag index.
///
/// `content_hash` uniqueness holds among live rows only; an archived row
/// with the same hash may coexist with a re-inserted live one.
const MIGRATION_V1_UP: &str = r#"
CREATE TABLE IF NOT EXISTS memories (
    row_id INTEGER PRIMARY KEY,
    content_hash TEXT NOT NULL,
    content TEXT NOT NULL,
    tags_json TEXT NOT NULL DEFAULT '[]',
    metadata_json TEXT NOT NULL DEFAULT '{}',
    memory_type TEXT NOT NULL DEFAULT 'note',
    created_at_us INTEGER NOT NULL,
    updated_at_us INTEGER NOT NULL,
    last_accessed_at_us INTEGER NOT NULL,
    relevance_score REAL NOT NULL DEFAULT 1.0,
    archived INTEGER NOT NULL DEFAULT 0
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_memories_live_hash
    ON memories(content_hash) WHERE archived = 0;
CREATE INDEX IF NOT EXISTS idx_memories_hash ON memories(content_hash);
CREATE INDEX IF NOT EXISTS idx_memories_created ON memories(created_at_us);
CREATE INDEX IF NOT EXISTS idx_memories_accessed ON memories(last_accessed_at_us);
CREATE INDEX IF NOT EXISTS idx_memories_type ON memories(memory_type);
CREATE INDEX IF NOT EXISTS idx_memories_relevance ON memories(relevance_score);

CREATE TABLE IF NOT EXISTS embeddings (
    row_id INTEGER PRIMARY KEY REFERENCES memories(row_id) ON DELETE CASCADE,
    vector BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS memory_tags (
    tag TEXT NOT NULL,
    row_id INTEGER NOT NULL REFERENCES memories(row_id) ON DELETE CASCADE,
    PRIMARY KEY (tag, row_id)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_memory_tags_row ON memory_tags(row_id);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at_us INTEGER NOT NULL
);
"#;

/// V2: consolidation artifacts.
///
/// Association pairs are stored canonically with `a_hash < b_hash` so the
/// primary key dedupes the unordered pair.
const MIGRATION_V2_UP: &str = r#"
CREATE TABLE IF NOT EXISTS associations (
    a_hash TEXT NOT NULL,
    b_hash TEXT NOT NULL,
    similarity REAL NOT NULL,
    kind TEXT NOT NULL DEFAULT 'creative',
    discovered_at_us INTEGER NOT NULL,
    PRIMARY KEY (a_hash, b_hash)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_associations_b ON associations(b_hash);

CREATE TABLE IF NOT EXISTS clusters (
    cluster_id TEXT PRIMARY KEY,
    centroid BLOB NOT NULL,
    created_at_us INTEGER NOT NULL,
    last_rebuilt_at_us INTEGER NOT NULL,
    superseded INTEGER NOT NULL DEFAULT 0,
    summary_hash TEXT
);

CREATE TABLE IF NOT EXISTS cluster_members (
    cluster_id TEXT NOT NULL REFERENCES clusters(cluster_id) ON DELETE CASCADE,
    member_hash TEXT NOT NULL,
    PRIMARY KEY (cluster_id, member_hash)
) WITHOUT ROWID;
"#;

/// V3: retrieval access log (for decay's access bonus) and per-horizon
/// consolidation pass state.
const MIGRATION_V3_UP: &str = r#"
CREATE TABLE IF NOT EXISTS access_log (
    row_id INTEGER NOT NULL REFERENCES memories(row_id) ON DELETE CASCADE,
    accessed_at_us INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_access_log_row_time
    ON access_log(row_id, accessed_at_us);
CREATE INDEX IF NOT EXISTS idx_access_log_time ON access_log(accessed_at_us);

CREATE TABLE IF NOT EXISTS consolidation_state (
    horizon TEXT PRIMARY KEY,
    last_run_us INTEGER NOT NULL
);
"#;

/// Apply all pending migrations in order.
pub fn apply_migrations(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at_us INTEGER NOT NULL
        )",
        [],
    )?;

    let current: u32 = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| {
            row.get(0)
        })
        .unwrap_or(0);

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        tracing::info!(
            version = migration.version,
            description = migration.description,
            "applying migration"
        );
        conn.execute_batch(migration.up)?;
        conn.execute(
            "INSERT INTO schema_version (version, applied_at_us) VALUES (?1, ?2)",
            rusqlite::params![migration.version, Utc::now().timestamp_micros()],
        )?;
    }

    Ok(())
}
