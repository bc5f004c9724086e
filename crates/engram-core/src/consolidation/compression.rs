//! Monthly compression pass (runs after clustering).
//!
//! Each sufficiently large cluster without a live summary is compressed
//! into one `compressed` memory: the top members by decayed relevance,
//! concatenated and capped, with provenance in `consolidated_from`. The
//! member memories are left untouched; archival is a separate concern.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::ctx::OpCtx;
use crate::error::Result;
use crate::memory::{meta_keys, normalize, Memory, Metadata, MetaValue};
use crate::storage::{Store, SummarySpec};

/// Members quoted in the summary content.
const TOP_MEMBERS: usize = 3;

/// Hard cap on summary content length, in characters.
const MAX_SUMMARY_CHARS: usize = 500;

/// Build the deterministic summary content for a cluster.
fn summary_content(member_count: usize, top: &[&Memory]) -> String {
    let mut content = format!("[cluster {member_count} memories] ");
    content.push_str(
        &top.iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join(" | "),
    );
    if content.chars().count() > MAX_SUMMARY_CHARS {
        content = content.chars().take(MAX_SUMMARY_CHARS - 1).collect();
        content.push('…');
    }
    normalize(&content)
}

pub(crate) fn run(
    store: &Store,
    _now: DateTime<Utc>,
    ctx: &OpCtx,
) -> Result<BTreeMap<String, i64>> {
    let min_size = store.config().cluster_min_size;
    let max_tags = store.config().max_tags_per_memory;

    // Scanning: clusters still lacking a live summary.
    let clusters = store.live_clusters()?;
    let mut specs: Vec<SummarySpec> = Vec::new();
    let mut skipped_summarized = 0i64;

    for (cluster, summary_hash) in &clusters {
        ctx.check()?;
        if cluster.members.len() < min_size {
            continue;
        }
        if let Some(hash) = summary_hash {
            // A summary exists; only regenerate if it was deleted.
            if store.peek_by_hash(hash, true)?.is_some() {
                skipped_summarized += 1;
                continue;
            }
        }

        // Computing: hydrate members, pick the top by decayed relevance.
        let mut members: Vec<Memory> = Vec::with_capacity(cluster.members.len());
        for hash in &cluster.members {
            if let Some(memory) = store.peek_by_hash(hash, true)? {
                members.push(memory);
            }
        }
        if members.len() < min_size {
            continue;
        }

        let mut ranked: Vec<&Memory> = members.iter().collect();
        ranked.sort_by(|a, b| {
            b.relevance_score
                .partial_cmp(&a.relevance_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.row_id.cmp(&b.row_id))
        });
        let top: Vec<&Memory> = ranked.into_iter().take(TOP_MEMBERS).collect();
        let content = summary_content(members.len(), &top);

        let mut tags: Vec<String> = members
            .iter()
            .flat_map(|m| m.tags.iter().cloned())
            .collect();
        tags.push("consolidated".to_string());
        tags.sort();
        tags.dedup();
        tags.truncate(max_tags);

        let mut member_hashes: Vec<String> = members
            .iter()
            .map(|m| m.content_hash.clone())
            .collect();
        member_hashes.sort();

        let mut metadata = Metadata::new();
        metadata.insert(
            meta_keys::CONSOLIDATED_FROM.to_string(),
            MetaValue::StringList(member_hashes),
        );
        metadata.insert(
            meta_keys::CLUSTER_ID.to_string(),
            MetaValue::String(cluster.cluster_id.clone()),
        );

        if cluster.centroid.is_empty() {
            tracing::warn!(cluster_id = %cluster.cluster_id, "cluster has no centroid; skipping");
            continue;
        }

        specs.push(SummarySpec {
            cluster_id: cluster.cluster_id.clone(),
            content,
            tags,
            metadata,
            vector: cluster.centroid.clone(),
        });
    }

    // Writing: all summaries land in one transaction.
    let outcomes = store.insert_compressed_summaries(&specs, ctx)?;
    let created = outcomes.iter().filter(|(_, created)| *created).count() as i64;
    let merged = outcomes.len() as i64 - created;

    let mut counts = BTreeMap::new();
    counts.insert("clusters_considered".to_string(), clusters.len() as i64);
    counts.insert("already_summarized".to_string(), skipped_summarized);
    counts.insert("summaries_created".to_string(), created);
    counts.insert("summaries_merged".to_string(), merged);
    Ok(counts)
}
