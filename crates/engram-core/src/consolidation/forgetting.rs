//! Controlled forgetting (quarterly and yearly pass).
//!
//! Archives memories whose relevance has decayed below the threshold and
//! that have not been touched within the inactivity window. Critical
//! memories and parents of live summaries are exempt. Nothing is deleted;
//! archival is reversible through `unarchive`.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};

use crate::ctx::OpCtx;
use crate::error::Result;
use crate::memory::RetentionClass;
use crate::storage::{Filter, Store};

/// Pages scanned per batch.
const SCAN_PAGE: usize = 500;

pub(crate) fn run(
    store: &Store,
    now: DateTime<Utc>,
    ctx: &OpCtx,
) -> Result<BTreeMap<String, i64>> {
    let threshold = store.config().forget_threshold;
    let cutoff = now - Duration::days(store.config().forget_inactivity_days);

    // Scanning + Computing: collect eligible rows, no writes yet.
    let mut examined = 0i64;
    let mut eligible: Vec<i64> = Vec::new();
    for page in store.scan(Filter::default(), SCAN_PAGE) {
        ctx.check()?;
        for memory in page? {
            examined += 1;
            if memory.relevance_score >= threshold {
                continue;
            }
            if memory.last_accessed_at >= cutoff {
                continue;
            }
            if memory.retention_class() == RetentionClass::Critical {
                continue;
            }
            if store.is_live_summary_parent(&memory.content_hash)? {
                continue;
            }
            eligible.push(memory.row_id);
        }
    }

    // Writing: archive the batch in one transaction.
    let archived = store.archive_rows(&eligible, ctx)?;

    let mut counts = BTreeMap::new();
    counts.insert("examined".to_string(), examined);
    counts.insert("archived".to_string(), archived.len() as i64);
    Ok(counts)
}
