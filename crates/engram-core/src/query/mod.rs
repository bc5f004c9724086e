//! Query planner.
//!
//! Dispatches the retrieval surface: semantic search, time-bounded recall,
//! tag lookup, exact match, and a raw-score debug variant. Result counts
//! are clamped to the configured `max_k`; clamping is never an error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ctx::OpCtx;
use crate::error::{MemoryError, Result};
use crate::memory::{Memory, TagMode};
use crate::storage::{Filter, Store, TimeField};
use crate::timeparse;

// ============================================================================
// REQUEST TYPES
// ============================================================================

/// Which instant column `recall` filters on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecallTarget {
    /// Filter on `created_at` (the default).
    #[default]
    Created,
    /// Filter on `last_accessed_at`, for "what did I look at last week".
    Accessed,
}

/// A memory with its retrieval score, when the operation produced one.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Scored {
    pub memory: Memory,
    /// Similarity surfaced in [0, 1]; absent for purely time-ordered recall.
    pub score: Option<f64>,
}

/// Diagnostic output of `debug_retrieve`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugRetrieval {
    /// First 8 components of the query embedding.
    pub query_embedding_head: Vec<f32>,
    /// Raw cosine scores alongside the surfaced ones.
    pub hits: Vec<DebugHit>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugHit {
    pub content_hash: String,
    pub cosine: f64,
    pub surfaced: f64,
}

impl Store {
    fn clamp_k(&self, k: usize) -> usize {
        k.min(self.config().max_k).max(1)
    }

    // ========================================================================
    // RETRIEVE
    // ========================================================================

    /// Semantic search: embed the query text and rank by cosine.
    pub fn retrieve(
        &self,
        query_text: &str,
        k: usize,
        min_score: f64,
        filter: &Filter,
        ctx: &OpCtx,
    ) -> Result<Vec<Scored>> {
        ctx.check()?;
        if query_text.trim().is_empty() {
            return Err(MemoryError::Invalid("query text must be non-empty".to_string()));
        }
        let query = self.embedder().embed(query_text)?;
        let k = self.clamp_k(k);
        let results = self.knn(&query, k, min_score, filter, ctx)?;
        Ok(results
            .into_iter()
            .map(|(memory, score)| Scored {
                memory,
                score: Some(score),
            })
            .collect())
    }

    /// Same as [`Store::retrieve`] but returns raw cosine scores and the
    /// head of the query embedding, for diagnosing ranking issues.
    pub fn debug_retrieve(
        &self,
        query_text: &str,
        k: usize,
        ctx: &OpCtx,
    ) -> Result<DebugRetrieval> {
        ctx.check()?;
        if query_text.trim().is_empty() {
            return Err(MemoryError::Invalid("query text must be non-empty".to_string()));
        }
        let query = self.embedder().embed(query_text)?;
        let k = self.clamp_k(k);
        let results = self.knn(&query, k, 0.0, &Filter::default(), ctx)?;
        Ok(DebugRetrieval {
            query_embedding_head: query.iter().take(8).copied().collect(),
            hits: results
                .into_iter()
                .map(|(memory, surfaced)| DebugHit {
                    content_hash: memory.content_hash,
                    cosine: surfaced * 2.0 - 1.0,
                    surfaced,
                })
                .collect(),
        })
    }

    // ========================================================================
    // RECALL
    // ========================================================================

    /// Time-bounded retrieval from a natural-language phrase.
    ///
    /// The longest parsable time fragment becomes the range filter; any
    /// residual words are embedded and searched within that range. A phrase
    /// that is pure time expression returns the newest memories in range.
    /// Compound phrases (`a and b`) run one query per range and dedupe by
    /// hash, keeping the first occurrence. Ranges lying entirely in the
    /// future are rejected.
    pub fn recall(
        &self,
        phrase: &str,
        k: usize,
        filter: &Filter,
        target: RecallTarget,
        now: Option<DateTime<Utc>>,
        ctx: &OpCtx,
    ) -> Result<Vec<Scored>> {
        ctx.check()?;
        let now = now.unwrap_or_else(Utc::now);
        let k = self.clamp_k(k);

        let (ranges, residual) = timeparse::extract(phrase, now).ok_or_else(|| {
            MemoryError::Invalid(format!("no recognizable time expression in '{phrase}'"))
        })?;
        for range in &ranges {
            if range.is_entirely_future(now) {
                return Err(MemoryError::Invalid(format!(
                    "time expression in '{phrase}' lies in the future"
                )));
            }
        }

        let time_field = match target {
            RecallTarget::Created => TimeField::CreatedAt,
            RecallTarget::Accessed => TimeField::LastAccessedAt,
        };

        let query = if residual.trim().is_empty() {
            None
        } else {
            Some(self.embedder().embed(&residual)?)
        };

        let mut seen: Vec<String> = Vec::new();
        let mut out: Vec<Scored> = Vec::new();
        for range in &ranges {
            ctx.check()?;
            let mut scoped = filter.clone();
            scoped.time_range = Some(*range);
            scoped.time_field = time_field;

            match &query {
                Some(vec) => {
                    for (memory, score) in self.knn(vec, k, 0.0, &scoped, ctx)? {
                        if !seen.contains(&memory.content_hash) {
                            seen.push(memory.content_hash.clone());
                            out.push(Scored {
                                memory,
                                score: Some(score),
                            });
                        }
                    }
                }
                None => {
                    for memory in self.recent(&scoped, k, ctx)? {
                        if !seen.contains(&memory.content_hash) {
                            seen.push(memory.content_hash.clone());
                            out.push(Scored {
                                memory,
                                score: None,
                            });
                        }
                    }
                }
            }
        }

        // Pure time recall orders the union by recency; semantic recall
        // keeps per-range score order from the per-range queries.
        if query.is_none() {
            out.sort_by(|a, b| {
                let (ta, tb) = match target {
                    RecallTarget::Created => (a.memory.created_at, b.memory.created_at),
                    RecallTarget::Accessed => (a.memory.last_accessed_at, b.memory.last_accessed_at),
                };
                tb.cmp(&ta).then_with(|| a.memory.row_id.cmp(&b.memory.row_id))
            });
            out.truncate(k);
            // Only rows actually returned count as accessed.
            let ids: Vec<i64> = out.iter().map(|s| s.memory.row_id).collect();
            if !ids.is_empty() {
                let touched_at = self.touch(&ids, ctx)?;
                for scored in &mut out {
                    scored.memory.last_accessed_at = touched_at;
                }
            }
        } else {
            out.truncate(k);
        }
        Ok(out)
    }

    // ========================================================================
    // TAG SEARCH (planner surface)
    // ========================================================================

    /// Tag lookup, newest-updated first, clamped to `max_k` when `k` given.
    pub fn search_tags(
        &self,
        tags: &[String],
        mode: TagMode,
        filter: &Filter,
        k: Option<usize>,
        ctx: &OpCtx,
    ) -> Result<Vec<Memory>> {
        let mut memories = self.search_by_tag(tags, mode, filter, ctx)?;
        if let Some(k) = k {
            memories.truncate(self.clamp_k(k));
        }
        Ok(memories)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::embeddings::HashingEmbedder;
    use crate::memory::StoreInput;
    use std::sync::Arc;
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

    fn store_text(store: &Store, content: &str, tags: &[&str]) -> String {
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
            .content_hash
    }

    /// Rewrite a row's created_at so recall windows can be exercised
    /// deterministically against an injected `now`.
    fn backdate(store: &Store, hash: &str, to: DateTime<Utc>) {
        let writer = store.writer().unwrap();
        writer
            .execute(
                "UPDATE memories SET created_at_us = ?1, updated_at_us = ?1, \
                 last_accessed_at_us = ?1 WHERE content_hash = ?2",
                rusqlite::params![to.timestamp_micros(), hash],
            )
            .unwrap();
    }

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn test_retrieve_round_trip_top_one() {
        let (store, _dir) = test_store();
        let hash = store_text(
            &store,
            "we chose postgres for the analytics backend because of partitioning",
            &[],
        );
        store_text(&store, "lunch options near the office are limited", &[]);

        let results = store
            .retrieve(
                "we chose postgres for the analytics backend because of partitioning",
                1,
                0.0,
                &Filter::default(),
                &OpCtx::new(),
            )
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].memory.content_hash, hash);
        assert!(results[0].score.unwrap() > 0.99);
    }

    #[test]
    fn test_retrieve_k_clamped_to_max() {
        let (store, _dir) = test_store();
        store_text(&store, "just one memory", &[]);
        // Far beyond max_k: clamped, not an error.
        let results = store
            .retrieve("one memory", 10_000, 0.0, &Filter::default(), &OpCtx::new())
            .unwrap();
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn test_retrieve_empty_query_rejected() {
        let (store, _dir) = test_store();
        let err = store
            .retrieve("  ", 5, 0.0, &Filter::default(), &OpCtx::new())
            .unwrap_err();
        assert_eq!(err.kind(), "invalid");
    }

    #[test]
    fn test_recall_last_week_scenario() {
        let (store, _dir) = test_store();
        let now = at("2025-02-10T12:00:00Z");

        let hash = store_text(&store, "db decision", &["decision"]);
        backdate(&store, &hash, at("2025-02-05T09:00:00Z"));

        let results = store
            .recall(
                "decisions last week",
                10,
                &Filter::default(),
                RecallTarget::Created,
                Some(now),
                &OpCtx::new(),
            )
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].memory.content_hash, hash);
    }

    #[test]
    fn test_recall_future_phrase_rejected() {
        let (store, _dir) = test_store();
        let now = at("2025-02-10T12:00:00Z");
        let err = store
            .recall(
                "decisions tomorrow",
                10,
                &Filter::default(),
                RecallTarget::Created,
                Some(now),
                &OpCtx::new(),
            )
            .unwrap_err();
        assert_eq!(err.kind(), "invalid");
    }

    #[test]
    fn test_recall_compound_union_ordered_by_created_desc() {
        let (store, _dir) = test_store();
        let now = at("2025-02-10T12:00:00Z");

        let a = store_text(&store, "A", &[]);
        backdate(&store, &a, at("2025-02-03T10:00:00Z"));
        let b = store_text(&store, "B", &[]);
        backdate(&store, &b, at("2024-12-15T10:00:00Z"));

        let results = store
            .recall(
                "last week and December 2024",
                10,
                &Filter::default(),
                RecallTarget::Created,
                Some(now),
                &OpCtx::new(),
            )
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].memory.content_hash, a);
        assert_eq!(results[1].memory.content_hash, b);
        assert!(results[0].score.is_none());
    }

    #[test]
    fn test_recall_without_time_expression_rejected() {
        let (store, _dir) = test_store();
        let err = store
            .recall(
                "database thoughts",
                10,
                &Filter::default(),
                RecallTarget::Created,
                Some(at("2025-02-10T12:00:00Z")),
                &OpCtx::new(),
            )
            .unwrap_err();
        assert_eq!(err.kind(), "invalid");
    }

    #[test]
    fn test_recall_dedupes_overlapping_ranges() {
        let (store, _dir) = test_store();
        let now = at("2025-02-10T12:00:00Z");
        let hash = store_text(&store, "seen once", &[]);
        backdate(&store, &hash, at("2025-02-04T10:00:00Z"));

        // Both fragments cover the same memory.
        let results = store
            .recall(
                "last week and this month",
                10,
                &Filter::default(),
                RecallTarget::Created,
                Some(now),
                &OpCtx::new(),
            )
            .unwrap();
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn test_recall_semantic_residual_filters_range() {
        let (store, _dir) = test_store();
        let now = at("2025-02-10T12:00:00Z");

        let in_range = store_text(&store, "database migration decision for invoicing", &[]);
        backdate(&store, &in_range, at("2025-02-04T10:00:00Z"));
        let out_of_range = store_text(&store, "database migration decision for payments", &[]);
        backdate(&store, &out_of_range, at("2024-06-01T10:00:00Z"));

        let results = store
            .recall(
                "database migration decisions last week",
                10,
                &Filter::default(),
                RecallTarget::Created,
                Some(now),
                &OpCtx::new(),
            )
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].memory.content_hash, in_range);
        assert!(results[0].score.is_some());
    }

    #[test]
    fn test_debug_retrieve_exposes_raw_scores() {
        let (store, _dir) = test_store();
        store_text(&store, "raw score target", &[]);
        let debug = store
            .debug_retrieve("raw score target", 5, &OpCtx::new())
            .unwrap();
        assert_eq!(debug.query_embedding_head.len(), 8);
        assert_eq!(debug.hits.len(), 1);
        let hit = &debug.hits[0];
        assert!((hit.surfaced - (hit.cosine + 1.0) / 2.0).abs() < 1e-9);
        assert!(hit.cosine > 0.99);
    }

    #[test]
    fn test_search_tags_orders_by_updated_desc() {
        let (store, _dir) = test_store();
        let first = store_text(&store, "older", &["shared"]);
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = store_text(&store, "newer", &["shared"]);

        let results = store
            .search_tags(
                &["shared".to_string()],
                TagMode::Any,
                &Filter::default(),
                None,
                &OpCtx::new(),
            )
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].content_hash, second);
        assert_eq!(results[1].content_hash, first);
    }
}
