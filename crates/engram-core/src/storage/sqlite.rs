//! SQLite store engine.
//!
//! One database file in WAL mode shared across processes: many readers, one
//! writer. Separate reader/writer connections behind mutexes give interior
//! mutability, so all methods take `&self` and the engine can be shared as
//! `Arc<Store>`. Every public write runs in a single immediate transaction
//! and retries with exponential backoff when the writer lock is contended.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use crate::config::Config;
use crate::ctx::OpCtx;
use crate::embeddings::{
    check_contract, vector_from_bytes, vector_to_bytes, Embedder,
};
use crate::error::{MemoryError, Result};
use crate::events::{ChangeBus, ChangeEvent};
use crate::hostname::HostnamePolicy;
use crate::memory::{
    normalize, Association, AssociationKind, Cluster, ContentHash, Memory, MemoryStats,
    MemoryType, Metadata, StoreInput, StoreReceipt, TagMode, UpdateInput,
};
use crate::search::VectorIndex;

use super::filter::Filter;
use super::migrations;

/// Column list shared by every memory SELECT.
const MEMORY_COLUMNS: &str = "m.row_id, m.content_hash, m.content, m.tags_json, \
     m.metadata_json, m.memory_type, m.created_at_us, m.updated_at_us, \
     m.last_accessed_at_us, m.relevance_score, m.archived";

/// Rows hydrated per IN-clause chunk during k-NN.
const HYDRATE_CHUNK: usize = 256;

/// A compression summary ready to be persisted.
#[derive(Debug, Clone)]
pub(crate) struct SummarySpec {
    pub cluster_id: String,
    /// NFC-normalized summary content.
    pub content: String,
    pub tags: Vec<String>,
    pub metadata: Metadata,
    /// L2-normalized centroid of the member embeddings.
    pub vector: Vec<f32>,
}

// ============================================================================
// STORE
// ============================================================================

/// The persistent memory store.
pub struct Store {
    config: Config,
    policy: HostnamePolicy,
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
    embedder: Arc<dyn Embedder>,
    index: Mutex<VectorIndex>,
    bus: ChangeBus,
    path: PathBuf,
    /// Ops log for health repair records, when attached.
    ops_log: Mutex<Option<Arc<crate::opslog::OpsLog>>>,
    /// Set when strict health blocks writes.
    writes_blocked: AtomicBool,
    /// Result of the most recent health check.
    healthy: AtomicBool,
    /// `PRAGMA data_version` observed when the index was last in sync.
    index_version: AtomicI64,
}

impl Store {
    /// Apply PRAGMAs to a connection.
    fn configure_connection(conn: &Connection, busy_timeout_ms: u64) -> Result<()> {
        conn.execute_batch(&format!(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = {busy_timeout_ms};
             PRAGMA cache_size = -64000;
             PRAGMA temp_store = MEMORY;"
        ))?;
        Ok(())
    }

    /// Open (or create) a store at `db_path`, or the platform data
    /// directory when `None`.
    pub fn open(
        db_path: Option<PathBuf>,
        config: Config,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self> {
        config.validate()?;
        if embedder.dimensions() != config.vector_dimension {
            return Err(MemoryError::Embedding(format!(
                "embedder produces {}-dim vectors but the store is configured for {}",
                embedder.dimensions(),
                config.vector_dimension
            )));
        }

        let path = match db_path {
            Some(p) => p,
            None => {
                let dirs = directories::ProjectDirs::from("dev", "engram", "engram")
                    .ok_or_else(|| {
                        MemoryError::Corruption(
                            "could not determine project directories".to_string(),
                        )
                    })?;
                let data_dir = dirs.data_dir();
                std::fs::create_dir_all(data_dir)?;
                data_dir.join("memory.db")
            }
        };

        let writer = Connection::open(&path)?;
        Self::configure_connection(&writer, config.busy_timeout_ms)?;
        migrations::apply_migrations(&writer)?;

        let reader = Connection::open(&path)?;
        Self::configure_connection(&reader, config.busy_timeout_ms)?;

        let store = Self {
            index: Mutex::new(VectorIndex::new(config.vector_dimension)),
            policy: HostnamePolicy::new(config.include_hostname),
            config,
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            embedder,
            bus: ChangeBus::new(),
            path,
            ops_log: Mutex::new(None),
            writes_blocked: AtomicBool::new(false),
            healthy: AtomicBool::new(true),
            index_version: AtomicI64::new(0),
        };

        store.reload_index()?;

        let report = store.health_check(true)?;
        if !report.ok {
            if store.config.strict_health {
                tracing::error!(issues = ?report.issues, "health check failed; blocking writes");
                store.writes_blocked.store(true, Ordering::SeqCst);
            } else {
                tracing::warn!(issues = ?report.issues, "health check found unresolved issues");
            }
        }

        Ok(store)
    }

    /// Engine configuration (frozen at open).
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Database file path.
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Change bus for observers.
    pub fn events(&self) -> &ChangeBus {
        &self.bus
    }

    /// Attach the ops log so health repairs are recorded alongside
    /// consolidation runs.
    pub fn attach_ops_log(&self, log: Arc<crate::opslog::OpsLog>) {
        if let Ok(mut slot) = self.ops_log.lock() {
            *slot = Some(log);
        }
    }

    pub(crate) fn ops_log(&self) -> Option<Arc<crate::opslog::OpsLog>> {
        self.ops_log.lock().ok().and_then(|slot| slot.clone())
    }

    // ========================================================================
    // LOCKING & RETRY
    // ========================================================================

    fn lock<'a, T>(m: &'a Mutex<T>) -> Result<MutexGuard<'a, T>> {
        m.lock()
            .map_err(|_| MemoryError::Corruption("lock poisoned".to_string()))
    }

    pub(crate) fn reader(&self) -> Result<MutexGuard<'_, Connection>> {
        Self::lock(&self.reader)
    }

    pub(crate) fn writer(&self) -> Result<MutexGuard<'_, Connection>> {
        Self::lock(&self.writer)
    }

    pub(crate) fn index(&self) -> Result<MutexGuard<'_, VectorIndex>> {
        Self::lock(&self.index)
    }

    pub(crate) fn embedder(&self) -> &dyn Embedder {
        self.embedder.as_ref()
    }

    pub(crate) fn set_healthy(&self, ok: bool) {
        self.healthy.store(ok, Ordering::SeqCst);
        if ok {
            self.writes_blocked.store(false, Ordering::SeqCst);
        } else if self.config.strict_health {
            self.writes_blocked.store(true, Ordering::SeqCst);
        }
    }

    fn write_gate(&self) -> Result<()> {
        if self.writes_blocked.load(Ordering::SeqCst) {
            return Err(MemoryError::Corruption(
                "writes blocked until health issues are resolved".to_string(),
            ));
        }
        Ok(())
    }

    /// Run a write closure with busy-retry. The closure owns its own
    /// transaction; a `Retryable` result backs off and tries again.
    fn with_write<T>(
        &self,
        ctx: &OpCtx,
        mut f: impl FnMut(&mut Connection) -> Result<T>,
    ) -> Result<T> {
        let mut attempt: u32 = 0;
        loop {
            ctx.check()?;
            let outcome = {
                let mut conn = self.writer()?;
                f(&mut conn)
            };
            match outcome {
                Err(MemoryError::Retryable(msg)) if attempt + 1 < self.config.retry_attempts => {
                    let backoff = self.config.retry_backoff_ms.saturating_mul(1u64 << attempt);
                    tracing::debug!(attempt, backoff_ms = backoff, "write contended: {msg}");
                    std::thread::sleep(std::time::Duration::from_millis(backoff));
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    // ========================================================================
    // VECTOR INDEX MAINTENANCE
    // ========================================================================

    /// Rebuild the in-memory index from the embedding column.
    pub(crate) fn reload_index(&self) -> Result<()> {
        let rows: Vec<(i64, Vec<u8>)> = {
            let reader = self.reader()?;
            let mut stmt = reader.prepare("SELECT row_id, vector FROM embeddings")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let mut index = self.index()?;
        index.clear();
        for (row_id, blob) in rows {
            match vector_from_bytes(&blob) {
                Some(vector) if vector.len() == self.config.vector_dimension => {
                    index.add(row_id, &vector)?;
                }
                _ => {
                    // Health check will flag this row for re-embedding.
                    tracing::warn!(row_id, "skipping malformed embedding blob");
                }
            }
        }
        drop(index);

        self.note_data_version()?;
        Ok(())
    }

    fn data_version(&self) -> Result<i64> {
        let reader = self.reader()?;
        let v: i64 = reader.query_row("PRAGMA data_version", [], |row| row.get(0))?;
        Ok(v)
    }

    /// Record the current data version as "index is in sync here".
    fn note_data_version(&self) -> Result<()> {
        let v = self.data_version()?;
        self.index_version.store(v, Ordering::SeqCst);
        Ok(())
    }

    /// Reload the index if another connection committed since we last
    /// synced. Our own writer is a separate connection, so this also fires
    /// after writes that raced with the incremental index updates; a
    /// rebuild is then wasteful but never wrong.
    fn refresh_index_if_stale(&self) -> Result<()> {
        let current = self.data_version()?;
        if current != self.index_version.load(Ordering::SeqCst) {
            tracing::debug!("external write detected; reloading vector index");
            self.reload_index()?;
        }
        Ok(())
    }

    // ========================================================================
    // STORE / DEDUP
    // ========================================================================

    /// Store a memory. Duplicate content merges tags (union) and metadata
    /// (shallow, right-wins) into the existing live row.
    pub fn store(&self, input: StoreInput, ctx: &OpCtx) -> Result<StoreReceipt> {
        ctx.check()?;
        self.write_gate()?;

        let content = normalize(&input.content);
        if content.trim().is_empty() {
            return Err(MemoryError::Invalid("content must be non-empty".to_string()));
        }

        let mut tags = sanitize_tags(input.tags, &self.config)?;
        let mut metadata = input.metadata;
        self.policy.apply(
            &mut tags,
            &mut metadata,
            input.client_hostname.as_deref(),
            input.transport_hostname.as_deref(),
        )?;
        if tags.len() > self.config.max_tags_per_memory {
            return Err(MemoryError::Invalid(format!(
                "too many tags: {} > {}",
                tags.len(),
                self.config.max_tags_per_memory
            )));
        }
        tags.sort();

        let hash = ContentHash::of_content(&content);
        let hex = hash.to_hex();

        // Embed up front, outside the writer lock. Deterministic embedders
        // make the duplicate-store case cheap via the query cache.
        let vector = self.embedder.embed(&content)?;
        check_contract(&vector, self.config.vector_dimension)?;

        let now = Utc::now();
        let ty = input.memory_type.as_str().into_owned();
        let (row_id, duplicate) = self.with_write(ctx, |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let existing: Option<(i64, String, String)> = tx
                .query_row(
                    "SELECT row_id, tags_json, metadata_json FROM memories \
                     WHERE content_hash = ?1 AND archived = 0",
                    params![hex],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;

            let result = match existing {
                Some((row_id, tags_json, metadata_json)) => {
                    let mut merged_tags: Vec<String> =
                        serde_json::from_str(&tags_json).unwrap_or_default();
                    for tag in &tags {
                        if !merged_tags.contains(tag) {
                            merged_tags.push(tag.clone());
                        }
                    }
                    merged_tags.sort();

                    let mut merged_meta: Metadata =
                        serde_json::from_str(&metadata_json).unwrap_or_default();
                    for (k, v) in &metadata {
                        merged_meta.insert(k.clone(), v.clone());
                    }

                    tx.execute(
                        "UPDATE memories SET tags_json = ?1, metadata_json = ?2, \
                         updated_at_us = ?3, \
                         last_accessed_at_us = MAX(last_accessed_at_us, ?3) \
                         WHERE row_id = ?4",
                        params![
                            serde_json::to_string(&merged_tags).unwrap_or_default(),
                            serde_json::to_string(&merged_meta).unwrap_or_default(),
                            now.timestamp_micros(),
                            row_id
                        ],
                    )?;
                    for tag in &merged_tags {
                        tx.execute(
                            "INSERT OR IGNORE INTO memory_tags (tag, row_id) VALUES (?1, ?2)",
                            params![tag, row_id],
                        )?;
                    }
                    (row_id, true)
                }
                None => {
                    // A second writer can land the same hash between our
                    // existence check and this insert; the partial unique
                    // index turns that into a constraint hit. Retry, and
                    // the next attempt takes the merge path.
                    if let Err(e) = tx.execute(
                        "INSERT INTO memories (content_hash, content, tags_json, \
                         metadata_json, memory_type, created_at_us, updated_at_us, \
                         last_accessed_at_us, relevance_score, archived) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?6, 1.0, 0)",
                        params![
                            hex,
                            content,
                            serde_json::to_string(&tags).unwrap_or_default(),
                            serde_json::to_string(&metadata).unwrap_or_default(),
                            ty,
                            now.timestamp_micros()
                        ],
                    ) {
                        if e.sqlite_error_code()
                            == Some(rusqlite::ErrorCode::ConstraintViolation)
                        {
                            return Err(MemoryError::Retryable(
                                "concurrent insert of identical content".to_string(),
                            ));
                        }
                        return Err(e.into());
                    }
                    let row_id = tx.last_insert_rowid();
                    tx.execute(
                        "INSERT INTO embeddings (row_id, vector) VALUES (?1, ?2)",
                        params![row_id, vector_to_bytes(&vector)],
                    )?;
                    for tag in &tags {
                        tx.execute(
                            "INSERT INTO memory_tags (tag, row_id) VALUES (?1, ?2)",
                            params![tag, row_id],
                        )?;
                    }
                    (row_id, false)
                }
            };

            ctx.check()?;
            tx.commit()?;
            Ok(result)
        })?;

        if !duplicate {
            self.index()?.add(row_id, &vector)?;
        }
        self.note_data_version()?;

        let event = if duplicate {
            ChangeEvent::Updated { memory_hash: hex.clone(), at: now }
        } else {
            ChangeEvent::Created { memory_hash: hex.clone(), at: now }
        };
        self.bus.publish(event);

        Ok(StoreReceipt {
            content_hash: hex,
            success: true,
            duplicate,
        })
    }

    // ========================================================================
    // LOOKUPS
    // ========================================================================

    /// Fetch by hex hash. Prefers the live row; `include_archived` extends
    /// the search to archived rows. Touches `last_accessed_at`.
    pub fn get_by_hash(
        &self,
        hash: &str,
        include_archived: bool,
        ctx: &OpCtx,
    ) -> Result<Memory> {
        ctx.check()?;
        ContentHash::from_hex(hash)?;

        let mut memory = {
            let reader = self.reader()?;
            let sql = format!(
                "SELECT {MEMORY_COLUMNS} FROM memories m \
                 WHERE m.content_hash = ?1 AND (m.archived = 0 OR ?2) \
                 ORDER BY m.archived ASC, m.updated_at_us DESC LIMIT 1"
            );
            reader
                .query_row(&sql, params![hash, include_archived], row_to_memory)
                .optional()?
                .ok_or_else(|| MemoryError::NotFound(hash.to_string()))?
        };

        let touched_at = self.touch(&[memory.row_id], ctx)?;
        memory.last_accessed_at = touched_at;
        Ok(memory)
    }

    /// Exact-content lookup via the hash of the normalized text.
    pub fn exact_match(&self, text: &str, ctx: &OpCtx) -> Result<Memory> {
        let hash = ContentHash::of_content(&normalize(text));
        self.get_by_hash(&hash.to_hex(), false, ctx)
    }

    /// Update tags and/or metadata. Bumps `updated_at`.
    pub fn update(&self, hash: &str, delta: UpdateInput, ctx: &OpCtx) -> Result<Memory> {
        ctx.check()?;
        self.write_gate()?;
        ContentHash::from_hex(hash)?;
        if delta.is_empty() {
            return Err(MemoryError::Invalid("empty update".to_string()));
        }
        let added = sanitize_tags(delta.add_tags.clone(), &self.config)?;

        let now = Utc::now();
        let memory = self.with_write(ctx, |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let sql = format!(
                "SELECT {MEMORY_COLUMNS} FROM memories m \
                 WHERE m.content_hash = ?1 \
                 ORDER BY m.archived ASC, m.updated_at_us DESC LIMIT 1"
            );
            let mut memory = tx
                .query_row(&sql, params![hash], row_to_memory)
                .optional()?
                .ok_or_else(|| MemoryError::NotFound(hash.to_string()))?;

            for tag in &added {
                if !memory.tags.contains(tag) {
                    memory.tags.push(tag.clone());
                }
            }
            memory.tags.retain(|t| !delta.remove_tags.contains(t));
            memory.tags.sort();
            if memory.tags.len() > self.config.max_tags_per_memory {
                return Err(MemoryError::Invalid(format!(
                    "too many tags: {} > {}",
                    memory.tags.len(),
                    self.config.max_tags_per_memory
                )));
            }

            for (k, v) in &delta.set_metadata {
                memory.metadata.insert(k.clone(), v.clone());
            }
            for k in &delta.remove_metadata {
                memory.metadata.remove(k);
            }

            memory.updated_at = now;
            memory.last_accessed_at = memory.last_accessed_at.max(now);

            tx.execute(
                "UPDATE memories SET tags_json = ?1, metadata_json = ?2, \
                 updated_at_us = ?3, last_accessed_at_us = ?4 WHERE row_id = ?5",
                params![
                    serde_json::to_string(&memory.tags).unwrap_or_default(),
                    serde_json::to_string(&memory.metadata).unwrap_or_default(),
                    now.timestamp_micros(),
                    memory.last_accessed_at.timestamp_micros(),
                    memory.row_id
                ],
            )?;
            tx.execute("DELETE FROM memory_tags WHERE row_id = ?1", params![memory.row_id])?;
            for tag in &memory.tags {
                tx.execute(
                    "INSERT INTO memory_tags (tag, row_id) VALUES (?1, ?2)",
                    params![tag, memory.row_id],
                )?;
            }

            ctx.check()?;
            tx.commit()?;
            Ok(memory)
        })?;

        self.bus.publish(ChangeEvent::Updated {
            memory_hash: hash.to_string(),
            at: now,
        });
        Ok(memory)
    }

    // ========================================================================
    // DELETION
    // ========================================================================

    /// Hard delete every row (live and archived) carrying this hash.
    pub fn delete(&self, hash: &str, ctx: &OpCtx) -> Result<bool> {
        ctx.check()?;
        self.write_gate()?;
        ContentHash::from_hex(hash)?;

        let row_ids = self.with_write(ctx, |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut stmt =
                tx.prepare("SELECT row_id FROM memories WHERE content_hash = ?1")?;
            let ids: Vec<i64> = stmt
                .query_map(params![hash], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            drop(stmt);
            // Cascades remove embeddings, tag rows, and access-log rows.
            tx.execute("DELETE FROM memories WHERE content_hash = ?1", params![hash])?;
            ctx.check()?;
            tx.commit()?;
            Ok(ids)
        })?;

        let deleted = !row_ids.is_empty();
        if deleted {
            let mut index = self.index()?;
            for row_id in &row_ids {
                index.remove(*row_id);
            }
            drop(index);
            self.note_data_version()?;
            self.bus.publish(ChangeEvent::Deleted {
                memory_hash: hash.to_string(),
                at: Utc::now(),
            });
        }
        Ok(deleted)
    }

    /// Bulk delete live memories matching the tag set, in one transaction.
    pub fn delete_by_tags(&self, tags: &[String], mode: TagMode, ctx: &OpCtx) -> Result<u64> {
        ctx.check()?;
        self.write_gate()?;
        if tags.is_empty() {
            return Err(MemoryError::Invalid("no tags given".to_string()));
        }

        let filter = Filter::default().with_tags(tags.to_vec(), mode);
        let victims = self.with_write(ctx, |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let mut params_vec: Vec<Value> = Vec::new();
            let where_sql = filter.to_sql(&mut params_vec);
            let sql = format!(
                "SELECT m.row_id, m.content_hash FROM memories m WHERE {where_sql}"
            );
            let mut stmt = tx.prepare(&sql)?;
            let victims: Vec<(i64, String)> = stmt
                .query_map(rusqlite::params_from_iter(params_vec), |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            drop(stmt);

            for (row_id, _) in &victims {
                tx.execute("DELETE FROM memories WHERE row_id = ?1", params![row_id])?;
            }
            ctx.check()?;
            tx.commit()?;
            Ok(victims)
        })?;

        let at = Utc::now();
        let mut index = self.index()?;
        for (row_id, _) in &victims {
            index.remove(*row_id);
        }
        drop(index);
        if !victims.is_empty() {
            self.note_data_version()?;
        }
        for (_, hash) in &victims {
            self.bus.publish(ChangeEvent::Deleted {
                memory_hash: hash.clone(),
                at,
            });
        }
        Ok(victims.len() as u64)
    }

    // ========================================================================
    // K-NN
    // ========================================================================

    /// Semantic k-nearest-neighbor search.
    ///
    /// Scores are cosine similarity surfaced as `(1 + cos) / 2` in [0, 1].
    /// Ties break by descending `updated_at`, then ascending row id.
    /// Touches `last_accessed_at` of every returned memory.
    pub fn knn(
        &self,
        query: &[f32],
        k: usize,
        min_score: f64,
        filter: &Filter,
        ctx: &OpCtx,
    ) -> Result<Vec<(Memory, f64)>> {
        ctx.check()?;
        if k == 0 {
            return Err(MemoryError::Invalid("k must be >= 1".to_string()));
        }
        if query.len() != self.config.vector_dimension {
            return Err(MemoryError::Invalid(format!(
                "query vector has {} dimensions, store uses {}",
                query.len(),
                self.config.vector_dimension
            )));
        }

        self.refresh_index_if_stale()?;

        let scored = {
            let index = self.index()?;
            let total = index.len();
            index.search(query, total)?
        };
        if scored.is_empty() {
            return Ok(Vec::new());
        }

        // Hydrate candidates that pass the filter, in chunks.
        let mut rows: HashMap<i64, Memory> = HashMap::new();
        for chunk in scored.chunks(HYDRATE_CHUNK) {
            ctx.check()?;
            let mut params_vec: Vec<Value> = Vec::new();
            let where_sql = filter.to_sql(&mut params_vec);
            let placeholders = vec!["?"; chunk.len()].join(", ");
            for (row_id, _) in chunk {
                params_vec.push(Value::Integer(*row_id));
            }
            let sql = format!(
                "SELECT {MEMORY_COLUMNS} FROM memories m \
                 WHERE {where_sql} AND m.row_id IN ({placeholders})"
            );
            let reader = self.reader()?;
            let mut stmt = reader.prepare(&sql)?;
            let hydrated = stmt
                .query_map(rusqlite::params_from_iter(params_vec), row_to_memory)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            drop(stmt);
            drop(reader);
            for memory in hydrated {
                rows.insert(memory.row_id, memory);
            }
        }

        let mut results: Vec<(Memory, f64)> = scored
            .iter()
            .filter_map(|(row_id, cos)| {
                let memory = rows.remove(row_id)?;
                let surfaced = (1.0 + f64::from(*cos)) / 2.0;
                (surfaced >= min_score).then_some((memory, surfaced))
            })
            .collect();

        results.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.0.updated_at.cmp(&a.0.updated_at))
                .then_with(|| a.0.row_id.cmp(&b.0.row_id))
        });
        results.truncate(k);

        if !results.is_empty() {
            let ids: Vec<i64> = results.iter().map(|(m, _)| m.row_id).collect();
            let touched_at = self.touch(&ids, ctx)?;
            for (memory, _) in &mut results {
                memory.last_accessed_at = touched_at;
            }
        }
        Ok(results)
    }

    // ========================================================================
    // TAG QUERIES
    // ========================================================================

    /// Memories matching a tag set, newest-updated first.
    pub fn search_by_tag(
        &self,
        tags: &[String],
        mode: TagMode,
        filter: &Filter,
        ctx: &OpCtx,
    ) -> Result<Vec<Memory>> {
        ctx.check()?;
        if tags.is_empty() {
            return Err(MemoryError::Invalid("no tags given".to_string()));
        }
        let mut combined = filter.clone();
        combined.tags = tags.to_vec();
        combined.tag_mode = mode;

        let mut params_vec: Vec<Value> = Vec::new();
        let where_sql = combined.to_sql(&mut params_vec);
        let sql = format!(
            "SELECT {MEMORY_COLUMNS} FROM memories m WHERE {where_sql} \
             ORDER BY m.updated_at_us DESC, m.row_id ASC"
        );
        let reader = self.reader()?;
        let mut stmt = reader.prepare(&sql)?;
        let memories = stmt
            .query_map(rusqlite::params_from_iter(params_vec), row_to_memory)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(memories)
    }

    /// Memories matching a filter, newest first on the filter's time field.
    /// Used by time-bounded recall when the phrase has no semantic residual.
    pub fn recent(&self, filter: &Filter, limit: usize, ctx: &OpCtx) -> Result<Vec<Memory>> {
        ctx.check()?;
        let order_col = filter.time_field.column();
        let mut params_vec: Vec<Value> = Vec::new();
        let where_sql = filter.to_sql(&mut params_vec);
        let sql = format!(
            "SELECT {MEMORY_COLUMNS} FROM memories m WHERE {where_sql} \
             ORDER BY m.{order_col} DESC, m.row_id ASC LIMIT {limit}"
        );
        let reader = self.reader()?;
        let mut stmt = reader.prepare(&sql)?;
        let memories = stmt
            .query_map(rusqlite::params_from_iter(params_vec), row_to_memory)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(memories)
    }

    // ========================================================================
    // SCANNING
    // ========================================================================

    /// Page lazily through memories matching a filter, in row-id order.
    /// Used by consolidation passes so a pass never materializes the
    /// whole store.
    pub fn scan<'a>(&'a self, filter: Filter, page_size: usize) -> ScanPages<'a> {
        ScanPages {
            store: self,
            filter,
            page_size: page_size.max(1),
            last_row_id: 0,
            done: false,
        }
    }

    fn scan_page(
        &self,
        filter: &Filter,
        after_row_id: i64,
        limit: usize,
    ) -> Result<Vec<Memory>> {
        let mut params_vec: Vec<Value> = Vec::new();
        let where_sql = filter.to_sql(&mut params_vec);
        params_vec.push(Value::Integer(after_row_id));
        let sql = format!(
            "SELECT {MEMORY_COLUMNS} FROM memories m \
             WHERE {where_sql} AND m.row_id > ? \
             ORDER BY m.row_id ASC LIMIT {limit}"
        );
        let reader = self.reader()?;
        let mut stmt = reader.prepare(&sql)?;
        let memories = stmt
            .query_map(rusqlite::params_from_iter(params_vec), row_to_memory)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(memories)
    }

    // ========================================================================
    // ARCHIVAL
    // ========================================================================

    /// Flip the archived flag. Archival is reversible and never deletes.
    pub(crate) fn set_archived(&self, hash: &str, archived: bool, ctx: &OpCtx) -> Result<Memory> {
        ContentHash::from_hex(hash)?;
        let memory = self.with_write(ctx, |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let sql = format!(
                "SELECT {MEMORY_COLUMNS} FROM memories m \
                 WHERE m.content_hash = ?1 AND m.archived = ?2 \
                 ORDER BY m.updated_at_us DESC LIMIT 1"
            );
            let mut memory = tx
                .query_row(&sql, params![hash, !archived], row_to_memory)
                .optional()?
                .ok_or_else(|| MemoryError::NotFound(hash.to_string()))?;

            if !archived {
                // Restoring: the partial unique index forbids two live rows
                // with one hash.
                let live: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM memories WHERE content_hash = ?1 AND archived = 0",
                    params![hash],
                    |row| row.get(0),
                )?;
                if live > 0 {
                    return Err(MemoryError::Invalid(format!(
                        "a live memory with hash {hash} already exists"
                    )));
                }
            }

            tx.execute(
                "UPDATE memories SET archived = ?1 WHERE row_id = ?2",
                params![archived, memory.row_id],
            )?;
            memory.archived = archived;
            ctx.check()?;
            tx.commit()?;
            Ok(memory)
        })?;

        self.bus.publish(ChangeEvent::Archived {
            memory_hash: hash.to_string(),
            archived,
            at: Utc::now(),
        });
        Ok(memory)
    }

    /// Restore an archived memory.
    pub fn unarchive(&self, hash: &str, ctx: &OpCtx) -> Result<Memory> {
        ctx.check()?;
        self.write_gate()?;
        self.set_archived(hash, false, ctx)
    }

    // ========================================================================
    // ACCESS TRACKING
    // ========================================================================

    /// Touch `last_accessed_at` and append access-log rows. Internal
    /// bookkeeping: not subject to the strict-health write gate.
    pub(crate) fn touch(&self, row_ids: &[i64], ctx: &OpCtx) -> Result<DateTime<Utc>> {
        let now = Utc::now();
        let us = now.timestamp_micros();
        self.with_write(ctx, |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            for row_id in row_ids {
                tx.execute(
                    "UPDATE memories SET last_accessed_at_us = MAX(last_accessed_at_us, ?1) \
                     WHERE row_id = ?2",
                    params![us, row_id],
                )?;
                tx.execute(
                    "INSERT INTO access_log (row_id, accessed_at_us) VALUES (?1, ?2)",
                    params![row_id, us],
                )?;
            }
            tx.commit()?;
            Ok(())
        })?;
        Ok(now)
    }

    /// Number of logged accesses for a row since `since`.
    pub(crate) fn accesses_since(&self, row_id: i64, since: DateTime<Utc>) -> Result<i64> {
        let reader = self.reader()?;
        let count = reader.query_row(
            "SELECT COUNT(*) FROM access_log WHERE row_id = ?1 AND accessed_at_us >= ?2",
            params![row_id, since.timestamp_micros()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Drop access-log rows older than `before`. Returns rows removed.
    pub(crate) fn prune_access_log(&self, before: DateTime<Utc>, ctx: &OpCtx) -> Result<u64> {
        self.with_write(ctx, |conn| {
            let n = conn.execute(
                "DELETE FROM access_log WHERE accessed_at_us < ?1",
                params![before.timestamp_micros()],
            )?;
            Ok(n as u64)
        })
    }

    // ========================================================================
    // CONSOLIDATION ACCESSORS
    // ========================================================================

    /// Batch-update relevance scores in one transaction.
    pub(crate) fn update_relevance(
        &self,
        scores: &[(i64, f64)],
        ctx: &OpCtx,
    ) -> Result<()> {
        self.with_write(ctx, |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            for (row_id, score) in scores {
                tx.execute(
                    "UPDATE memories SET relevance_score = ?1 WHERE row_id = ?2",
                    params![score, row_id],
                )?;
            }
            ctx.check()?;
            tx.commit()?;
            Ok(())
        })
    }

    /// Insert an association if the unordered pair is new. Returns whether
    /// a row was inserted.
    pub(crate) fn insert_association(
        &self,
        a_hash: &str,
        b_hash: &str,
        similarity: f64,
        kind: AssociationKind,
        discovered_at: DateTime<Utc>,
        ctx: &OpCtx,
    ) -> Result<bool> {
        if a_hash == b_hash {
            return Err(MemoryError::Invalid("association self-loop".to_string()));
        }
        let (lo, hi) = if a_hash < b_hash { (a_hash, b_hash) } else { (b_hash, a_hash) };
        self.with_write(ctx, |conn| {
            let n = conn.execute(
                "INSERT OR IGNORE INTO associations \
                 (a_hash, b_hash, similarity, kind, discovered_at_us) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![lo, hi, similarity, kind.as_str(), discovered_at.timestamp_micros()],
            )?;
            Ok(n > 0)
        })
    }

    /// Whether the unordered pair is already associated.
    pub(crate) fn association_exists(&self, a_hash: &str, b_hash: &str) -> Result<bool> {
        let (lo, hi) = if a_hash < b_hash { (a_hash, b_hash) } else { (b_hash, a_hash) };
        let reader = self.reader()?;
        let count: i64 = reader.query_row(
            "SELECT COUNT(*) FROM associations WHERE a_hash = ?1 AND b_hash = ?2",
            params![lo, hi],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// All associations touching a hash.
    pub fn associations_of(&self, hash: &str) -> Result<Vec<Association>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT a_hash, b_hash, similarity, kind, discovered_at_us FROM associations \
             WHERE a_hash = ?1 OR b_hash = ?1 ORDER BY discovered_at_us DESC",
        )?;
        let rows = stmt
            .query_map(params![hash], |row| {
                Ok(Association {
                    a_hash: row.get(0)?,
                    b_hash: row.get(1)?,
                    similarity: row.get(2)?,
                    kind: AssociationKind::parse_name(&row.get::<_, String>(3)?),
                    discovered_at: micros_to_datetime(row.get(4)?),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Fetch by hash without touching `last_accessed_at`. Consolidation
    /// reads must not count as retrievals.
    pub(crate) fn peek_by_hash(
        &self,
        hash: &str,
        include_archived: bool,
    ) -> Result<Option<Memory>> {
        let reader = self.reader()?;
        let sql = format!(
            "SELECT {MEMORY_COLUMNS} FROM memories m \
             WHERE m.content_hash = ?1 AND (m.archived = 0 OR ?2) \
             ORDER BY m.archived ASC, m.updated_at_us DESC LIMIT 1"
        );
        let memory = reader
            .query_row(&sql, params![hash, include_archived], row_to_memory)
            .optional()?;
        Ok(memory)
    }

    /// Fetch a memory by internal row id.
    pub(crate) fn memory_by_row_id(&self, row_id: i64) -> Result<Option<Memory>> {
        let reader = self.reader()?;
        let sql = format!("SELECT {MEMORY_COLUMNS} FROM memories m WHERE m.row_id = ?1");
        let memory = reader
            .query_row(&sql, params![row_id], row_to_memory)
            .optional()?;
        Ok(memory)
    }

    /// Insert a batch of associations in one transaction, skipping pairs
    /// that already exist. Returns how many rows landed.
    pub(crate) fn insert_associations(
        &self,
        batch: &[Association],
        ctx: &OpCtx,
    ) -> Result<u64> {
        self.with_write(ctx, |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut inserted = 0u64;
            for assoc in batch {
                if assoc.a_hash == assoc.b_hash {
                    return Err(MemoryError::Invalid("association self-loop".to_string()));
                }
                let (lo, hi) = if assoc.a_hash < assoc.b_hash {
                    (&assoc.a_hash, &assoc.b_hash)
                } else {
                    (&assoc.b_hash, &assoc.a_hash)
                };
                inserted += tx.execute(
                    "INSERT OR IGNORE INTO associations \
                     (a_hash, b_hash, similarity, kind, discovered_at_us) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        lo,
                        hi,
                        assoc.similarity,
                        assoc.kind.as_str(),
                        assoc.discovered_at.timestamp_micros()
                    ],
                )? as u64;
            }
            ctx.check()?;
            tx.commit()?;
            Ok(inserted)
        })
    }

    /// Apply a clustering pass atomically: upsert the surviving clusters
    /// and mark replaced ones superseded, all in one transaction.
    pub(crate) fn apply_clusters(
        &self,
        clusters: &[Cluster],
        superseded_ids: &[String],
        ctx: &OpCtx,
    ) -> Result<()> {
        self.with_write(ctx, |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            for cluster in clusters {
                tx.execute(
                    "INSERT INTO clusters \
                     (cluster_id, centroid, created_at_us, last_rebuilt_at_us, superseded) \
                     VALUES (?1, ?2, ?3, ?4, 0) \
                     ON CONFLICT(cluster_id) DO UPDATE SET \
                     centroid = ?2, last_rebuilt_at_us = ?4, superseded = 0",
                    params![
                        cluster.cluster_id,
                        vector_to_bytes(&cluster.centroid),
                        cluster.created_at.timestamp_micros(),
                        cluster.last_rebuilt_at.timestamp_micros(),
                    ],
                )?;
                tx.execute(
                    "DELETE FROM cluster_members WHERE cluster_id = ?1",
                    params![cluster.cluster_id],
                )?;
                for member in &cluster.members {
                    tx.execute(
                        "INSERT INTO cluster_members (cluster_id, member_hash) VALUES (?1, ?2)",
                        params![cluster.cluster_id, member],
                    )?;
                }
            }
            for cluster_id in superseded_ids {
                tx.execute(
                    "UPDATE clusters SET superseded = 1 WHERE cluster_id = ?1",
                    params![cluster_id],
                )?;
            }
            ctx.check()?;
            tx.commit()?;
            Ok(())
        })
    }

    /// Insert compression summaries atomically. Each spec goes through the
    /// normal dedup: an existing live row with the same hash has its
    /// `consolidated_from`/`cluster_id` metadata refreshed instead of a new
    /// insert. Returns `(hash, newly_created)` per spec, in input order.
    pub(crate) fn insert_compressed_summaries(
        &self,
        specs: &[SummarySpec],
        ctx: &OpCtx,
    ) -> Result<Vec<(String, bool)>> {
        let now = Utc::now();
        let outcomes = self.with_write(ctx, |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut outcomes: Vec<(String, bool)> = Vec::with_capacity(specs.len());
            for spec in specs {
                let hex = ContentHash::of_content(&spec.content).to_hex();
                let existing: Option<(i64, String)> = tx
                    .query_row(
                        "SELECT row_id, metadata_json FROM memories \
                         WHERE content_hash = ?1 AND archived = 0",
                        params![hex],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?;

                match existing {
                    Some((row_id, metadata_json)) => {
                        let mut meta: Metadata =
                            serde_json::from_str(&metadata_json).unwrap_or_default();
                        for (k, v) in &spec.metadata {
                            meta.insert(k.clone(), v.clone());
                        }
                        tx.execute(
                            "UPDATE memories SET metadata_json = ?1, updated_at_us = ?2, \
                             last_accessed_at_us = MAX(last_accessed_at_us, ?2) \
                             WHERE row_id = ?3",
                            params![
                                serde_json::to_string(&meta).unwrap_or_default(),
                                now.timestamp_micros(),
                                row_id
                            ],
                        )?;
                        outcomes.push((hex.clone(), false));
                    }
                    None => {
                        tx.execute(
                            "INSERT INTO memories (content_hash, content, tags_json, \
                             metadata_json, memory_type, created_at_us, updated_at_us, \
                             last_accessed_at_us, relevance_score, archived) \
                             VALUES (?1, ?2, ?3, ?4, 'compressed', ?5, ?5, ?5, 0.7, 0)",
                            params![
                                hex,
                                spec.content,
                                serde_json::to_string(&spec.tags).unwrap_or_default(),
                                serde_json::to_string(&spec.metadata).unwrap_or_default(),
                                now.timestamp_micros()
                            ],
                        )?;
                        let row_id = tx.last_insert_rowid();
                        tx.execute(
                            "INSERT INTO embeddings (row_id, vector) VALUES (?1, ?2)",
                            params![row_id, vector_to_bytes(&spec.vector)],
                        )?;
                        for tag in &spec.tags {
                            tx.execute(
                                "INSERT INTO memory_tags (tag, row_id) VALUES (?1, ?2)",
                                params![tag, row_id],
                            )?;
                        }
                        outcomes.push((hex.clone(), true));
                    }
                }
                tx.execute(
                    "UPDATE clusters SET summary_hash = ?1 WHERE cluster_id = ?2",
                    params![hex, spec.cluster_id],
                )?;
            }
            ctx.check()?;
            tx.commit()?;
            Ok(outcomes)
        })?;

        if !outcomes.is_empty() {
            self.reload_index()?;
        }
        for (hash, created) in &outcomes {
            let event = if *created {
                ChangeEvent::Created { memory_hash: hash.clone(), at: now }
            } else {
                ChangeEvent::Updated { memory_hash: hash.clone(), at: now }
            };
            self.bus.publish(event);
        }
        Ok(outcomes)
    }

    /// Archive a batch of rows in one transaction. Returns the hashes that
    /// were flipped.
    pub(crate) fn archive_rows(&self, row_ids: &[i64], ctx: &OpCtx) -> Result<Vec<String>> {
        let hashes = self.with_write(ctx, |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut hashes = Vec::with_capacity(row_ids.len());
            for row_id in row_ids {
                let hash: Option<String> = tx
                    .query_row(
                        "SELECT content_hash FROM memories WHERE row_id = ?1 AND archived = 0",
                        params![row_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                if let Some(hash) = hash {
                    tx.execute(
                        "UPDATE memories SET archived = 1 WHERE row_id = ?1",
                        params![row_id],
                    )?;
                    hashes.push(hash);
                }
            }
            ctx.check()?;
            tx.commit()?;
            Ok(hashes)
        })?;

        let at = Utc::now();
        for hash in &hashes {
            self.bus.publish(ChangeEvent::Archived {
                memory_hash: hash.clone(),
                archived: true,
                at,
            });
        }
        Ok(hashes)
    }

    /// Non-superseded clusters with members, plus their summary hash.
    pub(crate) fn live_clusters(&self) -> Result<Vec<(Cluster, Option<String>)>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT cluster_id, centroid, created_at_us, last_rebuilt_at_us, \
             superseded, summary_hash FROM clusters WHERE superseded = 0",
        )?;
        let mut clusters: Vec<(Cluster, Option<String>)> = stmt
            .query_map([], |row| {
                let blob: Vec<u8> = row.get(1)?;
                Ok((
                    Cluster {
                        cluster_id: row.get(0)?,
                        members: Vec::new(),
                        centroid: vector_from_bytes(&blob).unwrap_or_default(),
                        created_at: micros_to_datetime(row.get(2)?),
                        last_rebuilt_at: micros_to_datetime(row.get(3)?),
                        superseded: row.get(4)?,
                    },
                    row.get(5)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);

        let mut member_stmt = reader.prepare(
            "SELECT member_hash FROM cluster_members WHERE cluster_id = ?1 ORDER BY member_hash",
        )?;
        for (cluster, _) in &mut clusters {
            cluster.members = member_stmt
                .query_map(params![cluster.cluster_id], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
        }
        Ok(clusters)
    }

    /// Whether a hash is a `consolidated_from` parent of a live summary.
    pub(crate) fn is_live_summary_parent(&self, hash: &str) -> Result<bool> {
        let reader = self.reader()?;
        let count: i64 = reader.query_row(
            "SELECT COUNT(*) FROM memories m, \
             json_each(json_extract(m.metadata_json, '$.consolidated_from')) je \
             WHERE m.archived = 0 AND m.memory_type = 'compressed' AND je.value = ?1",
            params![hash],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Last completed run of a consolidation horizon.
    pub(crate) fn last_run(&self, horizon: &str) -> Result<Option<DateTime<Utc>>> {
        let reader = self.reader()?;
        let us: Option<i64> = reader
            .query_row(
                "SELECT last_run_us FROM consolidation_state WHERE horizon = ?1",
                params![horizon],
                |row| row.get(0),
            )
            .optional()?;
        Ok(us.map(micros_to_datetime))
    }

    pub(crate) fn set_last_run(&self, horizon: &str, at: DateTime<Utc>, ctx: &OpCtx) -> Result<()> {
        self.with_write(ctx, |conn| {
            conn.execute(
                "INSERT INTO consolidation_state (horizon, last_run_us) VALUES (?1, ?2) \
                 ON CONFLICT(horizon) DO UPDATE SET last_run_us = ?2",
                params![horizon, at.timestamp_micros()],
            )?;
            Ok(())
        })
    }

    // ========================================================================
    // STATS
    // ========================================================================

    /// Store-level statistics.
    pub fn stats(&self) -> Result<MemoryStats> {
        let reader = self.reader()?;
        let live: i64 = reader.query_row(
            "SELECT COUNT(*) FROM memories WHERE archived = 0",
            [],
            |row| row.get(0),
        )?;
        let archived: i64 = reader.query_row(
            "SELECT COUNT(*) FROM memories WHERE archived = 1",
            [],
            |row| row.get(0),
        )?;
        let mut by_type = std::collections::BTreeMap::new();
        let mut stmt = reader.prepare(
            "SELECT memory_type, COUNT(*) FROM memories WHERE archived = 0 GROUP BY memory_type",
        )?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            by_type.insert(row.get::<_, String>(0)?, row.get::<_, i64>(1)?);
        }
        drop(rows);
        drop(stmt);

        let distinct_tags: i64 = reader.query_row(
            "SELECT COUNT(DISTINCT tag) FROM memory_tags",
            [],
            |row| row.get(0),
        )?;
        let associations: i64 =
            reader.query_row("SELECT COUNT(*) FROM associations", [], |row| row.get(0))?;
        let clusters: i64 = reader.query_row(
            "SELECT COUNT(*) FROM clusters WHERE superseded = 0",
            [],
            |row| row.get(0),
        )?;
        drop(reader);

        let disk_bytes = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);

        Ok(MemoryStats {
            live_memories: live,
            archived_memories: archived,
            by_type,
            distinct_tags,
            associations,
            clusters,
            disk_bytes,
            vector_dimension: self.config.vector_dimension,
            healthy: self.healthy.load(Ordering::SeqCst),
        })
    }
}

// ============================================================================
// SCAN PAGES
// ============================================================================

/// Lazy pager over filtered memories in row-id order.
pub struct ScanPages<'a> {
    store: &'a Store,
    filter: Filter,
    page_size: usize,
    last_row_id: i64,
    done: bool,
}

impl Iterator for ScanPages<'_> {
    type Item = Result<Vec<Memory>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self
            .store
            .scan_page(&self.filter, self.last_row_id, self.page_size)
        {
            Ok(page) => {
                if page.is_empty() {
                    self.done = true;
                    return None;
                }
                self.last_row_id = page.last().map(|m| m.row_id).unwrap_or(i64::MAX);
                if page.len() < self.page_size {
                    self.done = true;
                }
                Some(Ok(page))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

// ============================================================================
// HELPERS
// ============================================================================

pub(crate) fn micros_to_datetime(us: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(us).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Map a SELECT over [`MEMORY_COLUMNS`] to a [`Memory`].
pub(crate) fn row_to_memory(row: &rusqlite::Row<'_>) -> rusqlite::Result<Memory> {
    let tags_json: String = row.get(3)?;
    let metadata_json: String = row.get(4)?;
    let ty: String = row.get(5)?;
    Ok(Memory {
        row_id: row.get(0)?,
        content_hash: row.get(1)?,
        content: row.get(2)?,
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
        memory_type: MemoryType::parse_name(&ty),
        created_at: micros_to_datetime(row.get(6)?),
        updated_at: micros_to_datetime(row.get(7)?),
        last_accessed_at: micros_to_datetime(row.get(8)?),
        relevance_score: row.get(9)?,
        archived: row.get(10)?,
    })
}

/// Validate and canonicalize a tag set: sorted, deduped, bounded.
fn sanitize_tags(tags: Vec<String>, config: &Config) -> Result<Vec<String>> {
    let mut out: Vec<String> = Vec::with_capacity(tags.len());
    for tag in tags {
        if tag.is_empty() {
            return Err(MemoryError::Invalid("empty tag".to_string()));
        }
        if tag.contains(',') {
            return Err(MemoryError::Invalid(format!("tag '{tag}' contains a comma")));
        }
        if tag.len() > config.max_tag_len {
            return Err(MemoryError::Invalid(format!(
                "tag exceeds {} bytes",
                config.max_tag_len
            )));
        }
        if !out.contains(&tag) {
            out.push(tag);
        }
    }
    if out.len() > config.max_tags_per_memory {
        return Err(MemoryError::Invalid(format!(
            "too many tags: {} > {}",
            out.len(),
            config.max_tags_per_memory
        )));
    }
    out.sort();
    Ok(out)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::HashingEmbedder;
    use crate::storage::TimeField;
    use tempfile::TempDir;

    const DIM: usize = 64;

    fn test_store() -> (Store, TempDir) {
        let dir = TempDir::new().unwrap();
        let config = Config {
            vector_dimension: DIM,
            ..Default::default()
        };
        let store = Store::open(
            Some(dir.path().join("memory.db")),
            config,
            Arc::new(HashingEmbedder::new(DIM)),
        )
        .unwrap();
        (store, dir)
    }

    fn store_text(store: &Store, content: &str, tags: &[&str]) -> StoreReceipt {
        store
            .store(
                StoreInput {
                    content: content.to_string(),
                    tags: tags.iter().map(|t| t.to_string()).collect(),
                    ..Default::default()
                },
                &OpCtx::new(),
            )
            .unwrap()
    }

    #[test]
    fn test_store_and_get_round_trip() {
        let (store, _dir) = test_store();
        let receipt = store_text(&store, "the quick brown fox", &["animals"]);
        assert!(!receipt.duplicate);

        let memory = store
            .get_by_hash(&receipt.content_hash, false, &OpCtx::new())
            .unwrap();
        assert_eq!(memory.content, "the quick brown fox");
        assert_eq!(memory.tags, vec!["animals".to_string()]);
        assert!(!memory.archived);
        assert!(memory.created_at <= memory.updated_at);
        assert!(memory.updated_at <= memory.last_accessed_at);
    }

    #[test]
    fn test_duplicate_store_merges_tags() {
        let (store, _dir) = test_store();
        let first = store_text(&store, "alpha beta", &["x"]);
        let second = store_text(&store, "alpha beta", &["y"]);

        assert_eq!(first.content_hash, second.content_hash);
        assert!(!first.duplicate);
        assert!(second.duplicate);

        let memory = store
            .get_by_hash(&first.content_hash, false, &OpCtx::new())
            .unwrap();
        assert_eq!(memory.tags, vec!["x".to_string(), "y".to_string()]);

        let stats = store.stats().unwrap();
        assert_eq!(stats.live_memories, 1);
    }

    #[test]
    fn test_nfc_and_nfd_store_once() {
        let (store, _dir) = test_store();
        let nfc = store_text(&store, "caf\u{00e9} notes", &[]);
        let nfd = store_text(&store, "cafe\u{0301} notes", &[]);
        assert_eq!(nfc.content_hash, nfd.content_hash);
        assert!(nfd.duplicate);
    }

    #[test]
    fn test_empty_content_rejected() {
        let (store, _dir) = test_store();
        let err = store
            .store(
                StoreInput {
                    content: "   ".to_string(),
                    ..Default::default()
                },
                &OpCtx::new(),
            )
            .unwrap_err();
        assert_eq!(err.kind(), "invalid");
    }

    #[test]
    fn test_tag_length_boundary() {
        let (store, _dir) = test_store();
        let config_len = store.config().max_tag_len;

        let at_limit = "t".repeat(config_len);
        store_text(&store, "tag at limit", &[at_limit.as_str()]);

        let over = "t".repeat(config_len + 1);
        let err = store
            .store(
                StoreInput {
                    content: "tag over limit".to_string(),
                    tags: vec![over],
                    ..Default::default()
                },
                &OpCtx::new(),
            )
            .unwrap_err();
        assert_eq!(err.kind(), "invalid");
    }

    #[test]
    fn test_delete_removes_row_and_embedding() {
        let (store, _dir) = test_store();
        let receipt = store_text(&store, "soon to be gone", &["doomed"]);

        assert!(store.delete(&receipt.content_hash, &OpCtx::new()).unwrap());
        let err = store
            .get_by_hash(&receipt.content_hash, true, &OpCtx::new())
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");

        // Embedding row cascaded away.
        let reader = store.reader().unwrap();
        let count: i64 = reader
            .query_row("SELECT COUNT(*) FROM embeddings", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_delete_is_idempotent() {
        let (store, _dir) = test_store();
        let receipt = store_text(&store, "only once", &[]);
        assert!(store.delete(&receipt.content_hash, &OpCtx::new()).unwrap());
        assert!(!store.delete(&receipt.content_hash, &OpCtx::new()).unwrap());
    }

    #[test]
    fn test_delete_by_tags_any() {
        let (store, _dir) = test_store();
        store_text(&store, "one", &["a"]);
        store_text(&store, "two", &["b"]);
        store_text(&store, "three", &["c"]);

        let n = store
            .delete_by_tags(
                &["a".to_string(), "b".to_string()],
                TagMode::Any,
                &OpCtx::new(),
            )
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(store.stats().unwrap().live_memories, 1);
    }

    #[test]
    fn test_knn_returns_stored_memory_first() {
        let (store, _dir) = test_store();
        store_text(&store, "postgres replication lag alert", &[]);
        store_text(&store, "birthday cake recipe vanilla", &[]);

        let embedder = HashingEmbedder::new(DIM);
        let query = embedder.embed("postgres replication lag alert").unwrap();
        let results = store
            .knn(&query, 1, 0.0, &Filter::default(), &OpCtx::new())
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0.content, "postgres replication lag alert");
        assert!(results[0].1 > 0.99); // identical text, cosine 1
    }

    #[test]
    fn test_knn_empty_store_is_empty_not_error() {
        let (store, _dir) = test_store();
        let query = vec![1.0f32; DIM];
        let results = store
            .knn(&query, 5, 0.0, &Filter::default(), &OpCtx::new())
            .unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_knn_min_score_filters() {
        let (store, _dir) = test_store();
        store_text(&store, "alpha", &[]);
        let query = HashingEmbedder::new(DIM).embed("completely unrelated words").unwrap();
        let results = store
            .knn(&query, 5, 0.999, &Filter::default(), &OpCtx::new())
            .unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_knn_respects_tag_filter() {
        let (store, _dir) = test_store();
        store_text(&store, "tagged entry", &["keep"]);
        store_text(&store, "untagged entry", &[]);

        let query = HashingEmbedder::new(DIM).embed("entry").unwrap();
        let filter = Filter::default().with_tags(vec!["keep".to_string()], TagMode::Any);
        let results = store.knn(&query, 10, 0.0, &filter, &OpCtx::new()).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0.content, "tagged entry");
    }

    #[test]
    fn test_exact_match_by_normalized_text() {
        let (store, _dir) = test_store();
        store_text(&store, "caf\u{00e9} notes", &[]);
        let found = store.exact_match("cafe\u{0301} notes", &OpCtx::new()).unwrap();
        assert_eq!(found.content, "caf\u{00e9} notes");

        let err = store.exact_match("never stored", &OpCtx::new()).unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[test]
    fn test_update_tags_and_metadata() {
        let (store, _dir) = test_store();
        let receipt = store_text(&store, "mutable", &["old"]);

        let updated = store
            .update(
                &receipt.content_hash,
                UpdateInput {
                    add_tags: vec!["new".to_string()],
                    remove_tags: vec!["old".to_string()],
                    set_metadata: [(
                        "retention_class".to_string(),
                        crate::memory::MetaValue::String("critical".to_string()),
                    )]
                    .into_iter()
                    .collect(),
                    ..Default::default()
                },
                &OpCtx::new(),
            )
            .unwrap();
        assert_eq!(updated.tags, vec!["new".to_string()]);
        assert_eq!(updated.retention_class(), crate::memory::RetentionClass::Critical);
        assert!(updated.updated_at <= updated.last_accessed_at);
    }

    #[test]
    fn test_update_unknown_hash_not_found() {
        let (store, _dir) = test_store();
        let err = store
            .update(
                &"0".repeat(64),
                UpdateInput {
                    add_tags: vec!["x".to_string()],
                    ..Default::default()
                },
                &OpCtx::new(),
            )
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[test]
    fn test_search_by_tag_parity() {
        let (store, _dir) = test_store();
        let receipt = store_text(&store, "tag parity", &["p", "q"]);

        for tag in ["p", "q"] {
            let hits = store
                .search_by_tag(
                    &[tag.to_string()],
                    TagMode::Any,
                    &Filter::default(),
                    &OpCtx::new(),
                )
                .unwrap();
            assert!(hits.iter().any(|m| m.content_hash == receipt.content_hash));
        }

        let all = store
            .search_by_tag(
                &["p".to_string(), "q".to_string()],
                TagMode::All,
                &Filter::default(),
                &OpCtx::new(),
            )
            .unwrap();
        assert_eq!(all.len(), 1);

        let none = store
            .search_by_tag(
                &["p".to_string(), "absent".to_string()],
                TagMode::All,
                &Filter::default(),
                &OpCtx::new(),
            )
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_all_subset_of_any() {
        let (store, _dir) = test_store();
        store_text(&store, "both tags", &["s", "t"]);
        store_text(&store, "one tag", &["s"]);

        let tags = vec!["s".to_string(), "t".to_string()];
        let all = store
            .search_by_tag(&tags, TagMode::All, &Filter::default(), &OpCtx::new())
            .unwrap();
        let any = store
            .search_by_tag(&tags, TagMode::Any, &Filter::default(), &OpCtx::new())
            .unwrap();
        for m in &all {
            assert!(any.iter().any(|n| n.content_hash == m.content_hash));
        }
        assert!(all.len() <= any.len());
    }

    #[test]
    fn test_archive_and_unarchive() {
        let (store, _dir) = test_store();
        let receipt = store_text(&store, "archivable", &[]);

        store
            .set_archived(&receipt.content_hash, true, &OpCtx::new())
            .unwrap();
        let err = store
            .get_by_hash(&receipt.content_hash, false, &OpCtx::new())
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");

        let archived = store
            .get_by_hash(&receipt.content_hash, true, &OpCtx::new())
            .unwrap();
        assert!(archived.archived);
        assert_eq!(archived.content, "archivable");

        let restored = store.unarchive(&receipt.content_hash, &OpCtx::new()).unwrap();
        assert!(!restored.archived);
        assert!(store
            .get_by_hash(&receipt.content_hash, false, &OpCtx::new())
            .is_ok());
    }

    #[test]
    fn test_scan_pages_lazily() {
        let (store, _dir) = test_store();
        for i in 0..7 {
            store_text(&store, &format!("page item {i}"), &[]);
        }

        let mut total = 0;
        let mut pages = 0;
        for page in store.scan(Filter::default(), 3) {
            let page = page.unwrap();
            total += page.len();
            pages += 1;
        }
        assert_eq!(total, 7);
        assert_eq!(pages, 3);
    }

    #[test]
    fn test_time_filter_half_open() {
        let (store, _dir) = test_store();
        let receipt = store_text(&store, "timed", &[]);
        let memory = store
            .get_by_hash(&receipt.content_hash, false, &OpCtx::new())
            .unwrap();

        let range = crate::timeparse::TimeRange::new(
            memory.created_at,
            memory.created_at + chrono::Duration::microseconds(1),
        );
        let filter = Filter::default().with_time_range(range);
        let hits: Vec<Memory> = store
            .scan(filter, 10)
            .collect::<Result<Vec<_>>>()
            .unwrap()
            .into_iter()
            .flatten()
            .collect();
        assert_eq!(hits.len(), 1);

        // End-exclusive: a range ending exactly at created_at misses.
        let range = crate::timeparse::TimeRange::new(
            memory.created_at - chrono::Duration::days(1),
            memory.created_at,
        );
        let filter = Filter {
            time_range: Some(range),
            time_field: TimeField::CreatedAt,
            ..Default::default()
        };
        let hits: Vec<Memory> = store
            .scan(filter, 10)
            .collect::<Result<Vec<_>>>()
            .unwrap()
            .into_iter()
            .flatten()
            .collect();
        assert!(hits.is_empty());
    }

    #[test]
    fn test_stats_empty_store_zeros() {
        let (store, _dir) = test_store();
        let stats = store.stats().unwrap();
        assert_eq!(stats.live_memories, 0);
        assert_eq!(stats.archived_memories, 0);
        assert_eq!(stats.associations, 0);
        assert_eq!(stats.vector_dimension, DIM);
    }

    #[test]
    fn test_association_dedup_unordered() {
        let (store, _dir) = test_store();
        let a = store_text(&store, "assoc a", &[]).content_hash;
        let b = store_text(&store, "assoc b", &[]).content_hash;
        let now = Utc::now();

        assert!(store
            .insert_association(&a, &b, 0.5, AssociationKind::Creative, now, &OpCtx::new())
            .unwrap());
        // Reversed order is the same unordered pair.
        assert!(!store
            .insert_association(&b, &a, 0.6, AssociationKind::Creative, now, &OpCtx::new())
            .unwrap());
        assert!(store.association_exists(&a, &b).unwrap());
        assert!(store.association_exists(&b, &a).unwrap());
    }

    #[test]
    fn test_association_self_loop_rejected() {
        let (store, _dir) = test_store();
        let a = store_text(&store, "self", &[]).content_hash;
        let err = store
            .insert_association(&a, &a, 0.5, AssociationKind::Creative, Utc::now(), &OpCtx::new())
            .unwrap_err();
        assert_eq!(err.kind(), "invalid");
    }

    #[test]
    fn test_cancelled_ctx_is_surfaced() {
        let (store, _dir) = test_store();
        let token = tokio_util::sync::CancellationToken::new();
        token.cancel();
        let ctx = OpCtx::with_token(token);

        let err = store
            .store(
                StoreInput {
                    content: "never lands".to_string(),
                    ..Default::default()
                },
                &ctx,
            )
            .unwrap_err();
        assert_eq!(err.kind(), "cancelled");
    }

    #[test]
    fn test_malformed_hash_is_invalid() {
        let (store, _dir) = test_store();
        let err = store.get_by_hash("nothex", false, &OpCtx::new()).unwrap_err();
        assert_eq!(err.kind(), "invalid");
    }

    #[test]
    fn test_events_published_in_commit_order() {
        let (store, _dir) = test_store();
        let mut rx = store.events().subscribe();

        let receipt = store_text(&store, "event source", &[]);
        store_text(&store, "event source", &["again"]);
        store.delete(&receipt.content_hash, &OpCtx::new()).unwrap();

        let e1 = rx.try_recv().unwrap();
        let e2 = rx.try_recv().unwrap();
        let e3 = rx.try_recv().unwrap();
        assert!(matches!(e1, ChangeEvent::Created { .. }));
        assert!(matches!(e2, ChangeEvent::Updated { .. }));
        assert!(matches!(e3, ChangeEvent::Deleted { .. }));
    }
}
