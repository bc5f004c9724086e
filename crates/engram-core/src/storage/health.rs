//! Health check and repair.
//!
//! Startup self-check of the embedding↔row alignment, vector integrity,
//! and tag-index consistency. Issues are repairable in place; a non-ok
//! report blocks writes only under `strict_health`.

use rusqlite::params;
use serde::Serialize;

use crate::ctx::OpCtx;
use crate::embeddings::{vector_from_bytes, vector_to_bytes};
use crate::error::Result;

use super::sqlite::Store;

/// Rows re-embedded per write transaction.
const REEMBED_BATCH: usize = 64;

/// Tag-index rows sampled during the consistency check.
const TAG_SAMPLE: usize = 64;

/// One detected problem.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthIssue {
    /// Stable issue kind: `wal_disabled`, `bad_vector`, `orphan_embedding`,
    /// `missing_embedding`, `tag_index_mismatch`.
    pub kind: String,
    pub detail: String,
}

impl HealthIssue {
    fn new(kind: &str, detail: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            detail: detail.into(),
        }
    }
}

/// Structured result of a health check.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub ok: bool,
    pub issues: Vec<HealthIssue>,
    pub actions_taken: Vec<String>,
}

impl Store {
    /// Run the startup self-check. With `repair`, fixes what it can:
    /// orphan embeddings are deleted, rows with missing or degenerate
    /// vectors are re-embedded, and a mismatched tag index is rebuilt.
    pub fn health_check(&self, repair: bool) -> Result<HealthReport> {
        let ctx = OpCtx::new();
        let mut issues: Vec<HealthIssue> = Vec::new();
        let mut actions: Vec<String> = Vec::new();

        // 1. WAL journaling must be on.
        let journal_mode: String = {
            let reader = self.reader()?;
            reader.query_row("PRAGMA journal_mode", [], |row| row.get(0))?
        };
        if !journal_mode.eq_ignore_ascii_case("wal") {
            issues.push(HealthIssue::new(
                "wal_disabled",
                format!("journal_mode is '{journal_mode}'"),
            ));
        }

        // 2 + 3. Vector integrity and row alignment.
        let dim = self.config().vector_dimension;
        let mut reembed: Vec<i64> = Vec::new();
        let mut orphan_embeddings: Vec<i64> = Vec::new();
        {
            let reader = self.reader()?;

            let mut stmt = reader.prepare(
                "SELECT e.row_id, e.vector, m.row_id IS NULL \
                 FROM embeddings e LEFT JOIN memories m ON m.row_id = e.row_id",
            )?;
            let rows: Vec<(i64, Vec<u8>, bool)> = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            drop(stmt);

            for (row_id, blob, orphaned) in rows {
                if orphaned {
                    issues.push(HealthIssue::new(
                        "orphan_embedding",
                        format!("embedding row {row_id} has no memory"),
                    ));
                    orphan_embeddings.push(row_id);
                    continue;
                }
                match vector_from_bytes(&blob) {
                    Some(v) if v.len() == dim && v.iter().any(|x| *x != 0.0) => {}
                    Some(v) if v.len() != dim => {
                        issues.push(HealthIssue::new(
                            "bad_vector",
                            format!("row {row_id} has {}-dim vector, expected {dim}", v.len()),
                        ));
                        reembed.push(row_id);
                    }
                    _ => {
                        issues.push(HealthIssue::new(
                            "bad_vector",
                            format!("row {row_id} has a zero or torn vector"),
                        ));
                        reembed.push(row_id);
                    }
                }
            }

            let mut stmt = reader.prepare(
                "SELECT m.row_id FROM memories m \
                 LEFT JOIN embeddings e ON e.row_id = m.row_id WHERE e.row_id IS NULL",
            )?;
            let missing: Vec<i64> = stmt
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            drop(stmt);
            for row_id in missing {
                issues.push(HealthIssue::new(
                    "missing_embedding",
                    format!("memory row {row_id} has no embedding"),
                ));
                reembed.push(row_id);
            }
        }

        // 4. Sampled tag-index parity.
        let tag_mismatch = self.sample_tag_parity()?;
        if let Some(detail) = tag_mismatch {
            issues.push(HealthIssue::new("tag_index_mismatch", detail));
        }

        // wal_disabled is never repairable in place.
        let mut unrepaired = issues.iter().filter(|i| i.kind == "wal_disabled").count();
        if repair {
            if !orphan_embeddings.is_empty() {
                self.with_writer_batch(&ctx, &orphan_embeddings, |tx, row_id| {
                    tx.execute("DELETE FROM embeddings WHERE row_id = ?1", params![row_id])?;
                    Ok(())
                })?;
                actions.push(format!(
                    "deleted {} orphan embedding(s)",
                    orphan_embeddings.len()
                ));
            }
            if !reembed.is_empty() {
                let n = self.reembed_rows(&reembed, &ctx)?;
                unrepaired += reembed.len() - n;
                actions.push(format!("re-embedded {n} row(s)"));
            }
            if issues.iter().any(|i| i.kind == "tag_index_mismatch") {
                self.rebuild_tag_index(&ctx)?;
                actions.push("rebuilt tag index".to_string());
            }
            if !actions.is_empty() {
                self.reload_index()?;
            }
        } else {
            unrepaired = issues.len();
        }
        let ok = unrepaired == 0;

        self.set_healthy(ok);
        tracing::info!(
            ok,
            issues = issues.len(),
            actions = actions.len(),
            "health check complete"
        );

        if !issues.is_empty() {
            if let Some(log) = self.ops_log() {
                let status = if ok { "repaired" } else { "failed" };
                let detail = format!(
                    "issues: [{}]; actions: [{}]",
                    issues
                        .iter()
                        .map(|i| i.kind.as_str())
                        .collect::<Vec<_>>()
                        .join(", "),
                    actions.join(", ")
                );
                let record = crate::opslog::OpsRecord::health(status, detail, chrono::Utc::now());
                if let Err(e) = log.append(&record) {
                    tracing::warn!("could not append health record: {e}");
                }
            }
        }

        Ok(HealthReport {
            ok,
            issues,
            actions_taken: actions,
        })
    }

    /// Compare `tags_json` with the inverted index for a bounded sample of
    /// rows. Returns a description of the first mismatch.
    fn sample_tag_parity(&self) -> Result<Option<String>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(&format!(
            "SELECT m.row_id, m.tags_json FROM memories m ORDER BY m.row_id LIMIT {TAG_SAMPLE}"
        ))?;
        let sample: Vec<(i64, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);

        let mut tag_stmt =
            reader.prepare("SELECT tag FROM memory_tags WHERE row_id = ?1 ORDER BY tag")?;
        for (row_id, tags_json) in sample {
            let mut declared: Vec<String> =
                serde_json::from_str(&tags_json).unwrap_or_default();
            declared.sort();
            let indexed: Vec<String> = tag_stmt
                .query_map(params![row_id], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            if declared != indexed {
                return Ok(Some(format!(
                    "row {row_id}: tags_json {declared:?} != index {indexed:?}"
                )));
            }
        }
        Ok(None)
    }

    /// Rebuild the inverted tag index from `memories.tags_json`.
    pub(crate) fn rebuild_tag_index(&self, ctx: &OpCtx) -> Result<()> {
        let rows: Vec<(i64, String)> = {
            let reader = self.reader()?;
            let mut stmt = reader.prepare("SELECT row_id, tags_json FROM memories")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let mut conn = self.writer()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM memory_tags", [])?;
        for (row_id, tags_json) in rows {
            let tags: Vec<String> = serde_json::from_str(&tags_json).unwrap_or_default();
            for tag in tags {
                tx.execute(
                    "INSERT OR IGNORE INTO memory_tags (tag, row_id) VALUES (?1, ?2)",
                    params![tag, row_id],
                )?;
            }
        }
        ctx.check()?;
        tx.commit()?;
        Ok(())
    }

    /// Re-embed flagged rows from their stored content, in write
    /// transactions of [`REEMBED_BATCH`] rows.
    fn reembed_rows(&self, row_ids: &[i64], ctx: &OpCtx) -> Result<usize> {
        let mut done = 0usize;
        for batch in row_ids.chunks(REEMBED_BATCH) {
            ctx.check()?;

            // Embed outside the write transaction.
            let mut vectors: Vec<(i64, Vec<f32>)> = Vec::with_capacity(batch.len());
            {
                let reader = self.reader()?;
                let mut stmt =
                    reader.prepare("SELECT content FROM memories WHERE row_id = ?1")?;
                for &row_id in batch {
                    let content: Option<String> = stmt
                        .query_map(params![row_id], |row| row.get(0))?
                        .next()
                        .transpose()?;
                    let Some(content) = content else { continue };
                    match self.embedder().embed(&content) {
                        Ok(v) => vectors.push((row_id, v)),
                        Err(e) => {
                            tracing::warn!(row_id, "re-embed failed: {e}");
                        }
                    }
                }
            }

            let mut conn = self.writer()?;
            let tx = conn.transaction()?;
            for (row_id, vector) in &vectors {
                tx.execute(
                    "INSERT INTO embeddings (row_id, vector) VALUES (?1, ?2) \
                     ON CONFLICT(row_id) DO UPDATE SET vector = ?2",
                    params![row_id, vector_to_bytes(vector)],
                )?;
            }
            ctx.check()?;
            tx.commit()?;
            done += vectors.len();
        }
        Ok(done)
    }

    /// Run a per-row write closure over batches in single transactions.
    fn with_writer_batch(
        &self,
        ctx: &OpCtx,
        rows: &[i64],
        f: impl Fn(&rusqlite::Transaction<'_>, i64) -> Result<()>,
    ) -> Result<()> {
        for batch in rows.chunks(REEMBED_BATCH) {
            ctx.check()?;
            let mut conn = self.writer()?;
            let tx = conn.transaction()?;
            for &row_id in batch {
                f(&tx, row_id)?;
            }
            tx.commit()?;
        }
        Ok(())
    }

}
