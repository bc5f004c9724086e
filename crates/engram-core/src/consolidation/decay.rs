//! Daily decay pass.
//!
//! Recomputes every live memory's relevance score from its age, retention
//! class, and recent access count, then prunes access-log rows that have
//! aged out of the bonus window. Deterministic for a fixed reference
//! instant, so back-to-back runs are idempotent.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};

use crate::config::RetentionDays;
use crate::ctx::OpCtx;
use crate::error::Result;
use crate::memory::{MemoryType, RetentionClass};
use crate::storage::{Filter, Store};

/// Days of access history contributing to the bonus.
const ACCESS_WINDOW_DAYS: i64 = 30;

/// Pages scanned per batch.
const SCAN_PAGE: usize = 500;

/// The decay formula:
/// `base(type) * exp(-age_days / tau(class)) * (1 + access_bonus)`,
/// clamped to [0, 1]. Compressed summaries start from a lower base.
pub fn decay_score(
    memory_type: &MemoryType,
    class: RetentionClass,
    age_days: f64,
    accesses_in_window: i64,
    retention: &RetentionDays,
) -> f64 {
    let base = match memory_type {
        MemoryType::Compressed => 0.7,
        _ => 1.0,
    };
    let tau = retention.tau(class).max(f64::MIN_POSITIVE);
    let access_bonus = (((1 + accesses_in_window.max(0)) as f64).log10() / 2.0).min(0.5);
    (base * (-age_days.max(0.0) / tau).exp() * (1.0 + access_bonus)).clamp(0.0, 1.0)
}

/// Run the daily pass. Returns counters for the run record.
pub(crate) fn run(
    store: &Store,
    now: DateTime<Utc>,
    ctx: &OpCtx,
) -> Result<BTreeMap<String, i64>> {
    let window_start = now - Duration::days(ACCESS_WINDOW_DAYS);

    // Scanning + Computing: no writes until the full plan exists.
    let mut scored = 0i64;
    let mut updates: Vec<(i64, f64)> = Vec::new();
    for page in store.scan(Filter::default(), SCAN_PAGE) {
        ctx.check()?;
        for memory in page? {
            let age_days =
                (now - memory.created_at).num_seconds().max(0) as f64 / 86_400.0;
            let accesses = store.accesses_since(memory.row_id, window_start)?;
            let score = decay_score(
                &memory.memory_type,
                memory.retention_class(),
                age_days,
                accesses,
                &store.config().retention_days,
            );
            scored += 1;
            if (score - memory.relevance_score).abs() > 1e-12 {
                updates.push((memory.row_id, score));
            }
        }
    }

    // Writing.
    let updated = updates.len() as i64;
    store.update_relevance(&updates, ctx)?;
    let pruned = store.prune_access_log(window_start, ctx)?;

    let mut counts = BTreeMap::new();
    counts.insert("scored".to_string(), scored);
    counts.insert("updated".to_string(), updated);
    counts.insert("access_log_pruned".to_string(), pruned as i64);
    Ok(counts)
}
