//! Shared harness for the end-to-end suite.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tempfile::TempDir;

use engram_core::{Config, HashingEmbedder, OpCtx, Store, StoreInput};

/// Embedding dimension used across the suite; small keeps the scans quick.
pub const DIM: usize = 64;

/// A store on a fresh temp directory.
pub fn fresh_store() -> (Arc<Store>, TempDir) {
    let dir = TempDir::new().expect("temp dir");
    let store = open_at(dir.path(), Config::default());
    (store, dir)
}

/// A store with a customized config on a fresh temp directory.
pub fn fresh_store_with(mut config: Config) -> (Arc<Store>, TempDir) {
    let dir = TempDir::new().expect("temp dir");
    config.vector_dimension = DIM;
    let store = open_at(dir.path(), config);
    (store, dir)
}

/// Open (or re-open) a store on an existing directory, as another process
/// sharing the same file would.
pub fn open_at(dir: &Path, mut config: Config) -> Arc<Store> {
    config.vector_dimension = DIM;
    Arc::new(
        Store::open(
            Some(dir.join("memory.db")),
            config,
            Arc::new(HashingEmbedder::new(DIM)),
        )
        .expect("store opens"),
    )
}

/// Store plain content and return its hash.
pub fn put(store: &Store, content: &str, tags: &[&str]) -> String {
    store
        .store(
            StoreInput {
                content: content.to_string(),
                tags: tags.iter().map(|t| t.to_string()).collect(),
                ..Default::default()
            },
            &OpCtx::new(),
        )
        .expect("store succeeds")
        .content_hash
}

/// Rewrite a memory's instants so time-window behavior can be exercised
/// against an injected reference instant.
pub fn backdate(store: &Store, hash: &str, to: DateTime<Utc>) {
    let conn = rusqlite::Connection::open(store.path()).expect("open raw connection");
    conn.execute(
        "UPDATE memories SET created_at_us = ?1, updated_at_us = ?1, \
         last_accessed_at_us = ?1 WHERE content_hash = ?2",
        rusqlite::params![to.timestamp_micros(), hash],
    )
    .expect("backdate");
}

/// Force the decayed state used by archival tests.
pub fn force_decay_state(store: &Store, hash: &str, relevance: f64, last_accessed: DateTime<Utc>) {
    let conn = rusqlite::Connection::open(store.path()).expect("open raw connection");
    conn.execute(
        "UPDATE memories SET relevance_score = ?1, last_accessed_at_us = ?2 \
         WHERE content_hash = ?3",
        rusqlite::params![relevance, last_accessed.timestamp_micros(), hash],
    )
    .expect("force decay state");
}

/// Parse an RFC 3339 instant.
pub fn at(s: &str) -> DateTime<Utc> {
    s.parse().expect("valid instant")
}
