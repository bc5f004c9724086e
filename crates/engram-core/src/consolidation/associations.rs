//! Weekly association discovery.
//!
//! Samples recently-modified live memories and compares each against its
//! nearest-neighbor candidate pool. Pairs inside the discovery window
//! become creative associations; pairs at or above the window's upper edge
//! become semantic ones. Existing pairs are never re-emitted.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Duration, Utc};

use crate::ctx::OpCtx;
use crate::error::Result;
use crate::memory::{Association, AssociationKind, Memory};
use crate::storage::{Filter, Store, TimeField};

/// Sample window: memories modified within this many days.
const SAMPLE_WINDOW_DAYS: i64 = 30;

/// Hard cap on the sample size.
const SAMPLE_CAP: usize = 2_000;

/// Candidate pool per sampled memory.
const CANDIDATE_POOL: usize = 500;

/// Pages scanned per batch.
const SCAN_PAGE: usize = 500;

pub(crate) fn run(
    store: &Store,
    now: DateTime<Utc>,
    ctx: &OpCtx,
) -> Result<BTreeMap<String, i64>> {
    let [window_min, window_max] = store.config().association_window;

    // Scanning: live memories modified in the sample window, newest first,
    // capped. Row-id paging keeps the scan lazy; the cap bounds the work.
    let filter = Filter {
        time_range: Some(crate::timeparse::TimeRange::new(
            now - Duration::days(SAMPLE_WINDOW_DAYS),
            now,
        )),
        time_field: TimeField::UpdatedAt,
        ..Default::default()
    };
    let mut sample: Vec<Memory> = Vec::new();
    for page in store.scan(filter, SCAN_PAGE) {
        ctx.check()?;
        sample.extend(page?);
        if sample.len() >= SAMPLE_CAP {
            sample.truncate(SAMPLE_CAP);
            tracing::debug!(cap = SAMPLE_CAP, "association sample capped");
            break;
        }
    }

    // Computing: pairwise similarity against each memory's neighbor pool.
    let mut pending: Vec<Association> = Vec::new();
    let mut seen_pairs: HashSet<(String, String)> = HashSet::new();
    let mut candidates_considered = 0i64;
    for memory in &sample {
        ctx.check()?;
        let neighbors = {
            let index = store.index()?;
            index.neighbors_of(memory.row_id, CANDIDATE_POOL)?
        };
        for (neighbor_row, cos) in neighbors {
            candidates_considered += 1;
            let sim = f64::from(cos);
            let kind = if sim >= window_max {
                AssociationKind::Semantic
            } else if sim >= window_min {
                AssociationKind::Creative
            } else {
                continue;
            };

            let Some(other) = store.memory_by_row_id(neighbor_row)? else {
                continue;
            };
            if other.archived || other.content_hash == memory.content_hash {
                continue;
            }

            let pair = canonical_pair(&memory.content_hash, &other.content_hash);
            if !seen_pairs.insert(pair.clone()) {
                continue;
            }
            if store.association_exists(&pair.0, &pair.1)? {
                continue;
            }
            pending.push(Association {
                a_hash: memory.content_hash.clone(),
                b_hash: other.content_hash.clone(),
                similarity: sim,
                discovered_at: now,
                kind,
            });
        }
    }

    // Writing: one transaction for the whole batch.
    let creative = pending
        .iter()
        .filter(|a| a.kind == AssociationKind::Creative)
        .count() as i64;
    let semantic = pending.len() as i64 - creative;
    let inserted = store.insert_associations(&pending, ctx)?;

    let mut counts = BTreeMap::new();
    counts.insert("sampled".to_string(), sample.len() as i64);
    counts.insert("candidates".to_string(), candidates_considered);
    counts.insert("creative".to_string(), creative);
    counts.insert("semantic".to_string(), semantic);
    counts.insert("inserted".to_string(), inserted as i64);
    Ok(counts)
}

fn canonical_pair(a: &str, b: &str) -> (String, String) {
    if a < b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}
