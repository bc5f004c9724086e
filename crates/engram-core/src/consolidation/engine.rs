//! Consolidation engine.
//!
//! Owns pass execution over a shared store. A pass moves through
//! `Idle → Scanning → Computing → Writing → Idle`; the pass modules keep
//! all writes in their final phase, so an error or cancellation before
//! Writing leaves the store untouched, and a Writing error aborts its
//! transaction. Passes of the same horizon are serialized; different
//! horizons may run concurrently.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::ctx::OpCtx;
use crate::error::{MemoryError, Result};
use crate::events::ChangeEvent;
use crate::opslog::{OpsLog, OpsRecord};
use crate::storage::Store;

use super::{associations, clustering, compression, decay, forgetting};

// ============================================================================
// HORIZONS
// ============================================================================

/// Time horizon of a consolidation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Horizon {
    Daily,
    Weekly,
    Monthly,
    Quarterly,
    Yearly,
}

impl Horizon {
    pub const ALL: [Horizon; 5] = [
        Horizon::Daily,
        Horizon::Weekly,
        Horizon::Monthly,
        Horizon::Quarterly,
        Horizon::Yearly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Horizon::Daily => "daily",
            Horizon::Weekly => "weekly",
            Horizon::Monthly => "monthly",
            Horizon::Quarterly => "quarterly",
            Horizon::Yearly => "yearly",
        }
    }

    /// The nominal period; used for missed-window catch-up.
    pub fn period(&self) -> Duration {
        match self {
            Horizon::Daily => Duration::days(1),
            Horizon::Weekly => Duration::days(7),
            Horizon::Monthly => Duration::days(30),
            Horizon::Quarterly => Duration::days(91),
            Horizon::Yearly => Duration::days(365),
        }
    }

    fn slot(&self) -> usize {
        match self {
            Horizon::Daily => 0,
            Horizon::Weekly => 1,
            Horizon::Monthly => 2,
            Horizon::Quarterly => 3,
            Horizon::Yearly => 4,
        }
    }
}

impl std::fmt::Display for Horizon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// PASS STATE & OUTCOME
// ============================================================================

/// Observable state of a horizon's pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PassState {
    #[default]
    Idle,
    Scanning,
    Computing,
    Writing,
}

/// Result of one completed pass.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PassOutcome {
    pub horizon: Horizon,
    pub status: String,
    pub counts: BTreeMap<String, i64>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

// ============================================================================
// ENGINE
// ============================================================================

/// Runs consolidation passes against a shared store.
pub struct ConsolidationEngine {
    store: Arc<Store>,
    ops_log: Option<Arc<OpsLog>>,
    /// One lock per horizon serializes same-horizon passes while letting
    /// different horizons overlap.
    horizon_locks: [Mutex<()>; 5],
    states: Mutex<BTreeMap<&'static str, PassState>>,
}

impl ConsolidationEngine {
    pub fn new(store: Arc<Store>, ops_log: Option<Arc<OpsLog>>) -> Self {
        Self {
            store,
            ops_log,
            horizon_locks: Default::default(),
            states: Mutex::new(BTreeMap::new()),
        }
    }

    /// Current state of a horizon's pass.
    pub fn state(&self, horizon: Horizon) -> PassState {
        self.states
            .lock()
            .ok()
            .and_then(|s| s.get(horizon.as_str()).copied())
            .unwrap_or_default()
    }

    fn set_state(&self, horizon: Horizon, state: PassState) {
        if let Ok(mut states) = self.states.lock() {
            states.insert(horizon.as_str(), state);
        }
    }

    /// Run one pass now. `now` is injected so tests and catch-up runs are
    /// deterministic. A cancelled pass leaves `last_run` unchanged.
    pub fn run_pass(
        &self,
        horizon: Horizon,
        now: DateTime<Utc>,
        ctx: &OpCtx,
    ) -> Result<PassOutcome> {
        let _serialize = self.horizon_locks[horizon.slot()]
            .lock()
            .map_err(|_| MemoryError::Corruption("horizon lock poisoned".to_string()))?;

        let started_at = Utc::now();
        tracing::info!(horizon = %horizon, "consolidation pass starting");
        self.set_state(horizon, PassState::Scanning);

        // Pass modules do Scanning + Computing without writes and keep all
        // writes in their final phase; the engine reflects the coarse state.
        let result = (|| {
            let counts = match horizon {
                Horizon::Daily => decay::run(&self.store, now, ctx)?,
                Horizon::Weekly => associations::run(&self.store, now, ctx)?,
                Horizon::Monthly => {
                    self.set_state(horizon, PassState::Computing);
                    let mut counts = clustering::run(&self.store, now, ctx)?;
                    self.set_state(horizon, PassState::Writing);
                    counts.extend(compression::run(&self.store, now, ctx)?);
                    counts
                }
                Horizon::Quarterly | Horizon::Yearly => {
                    forgetting::run(&self.store, now, ctx)?
                }
            };
            Ok::<_, MemoryError>(counts)
        })();
        self.set_state(horizon, PassState::Idle);

        let finished_at = Utc::now();
        match result {
            Ok(counts) => {
                self.store.set_last_run(horizon.as_str(), now, ctx)?;
                self.record(horizon, "completed", &counts, finished_at);
                tracing::info!(horizon = %horizon, ?counts, "consolidation pass completed");
                Ok(PassOutcome {
                    horizon,
                    status: "completed".to_string(),
                    counts,
                    started_at,
                    finished_at,
                })
            }
            Err(MemoryError::Cancelled) => {
                // last_run deliberately untouched: the window is still owed.
                self.record(horizon, "cancelled", &BTreeMap::new(), finished_at);
                tracing::info!(horizon = %horizon, "consolidation pass cancelled");
                Err(MemoryError::Cancelled)
            }
            Err(e) => {
                self.record(horizon, "failed", &BTreeMap::new(), finished_at);
                tracing::warn!(horizon = %horizon, "consolidation pass failed: {e}");
                Err(MemoryError::Consolidation(format!(
                    "{horizon} pass failed: {e}"
                )))
            }
        }
    }

    /// Startup catch-up: run each horizon at most once if more than its
    /// period has elapsed since the recorded `last_run`. Missed windows do
    /// not stack.
    pub fn run_due_passes(&self, now: DateTime<Utc>, ctx: &OpCtx) -> Result<Vec<PassOutcome>> {
        let mut outcomes = Vec::new();
        for horizon in Horizon::ALL {
            ctx.check()?;
            let due = match self.store.last_run(horizon.as_str())? {
                Some(last) => now - last > horizon.period(),
                // Never run: start the clock instead of consolidating an
                // empty or freshly attached store.
                None => {
                    self.store.set_last_run(horizon.as_str(), now, ctx)?;
                    false
                }
            };
            if due {
                outcomes.push(self.run_pass(horizon, now, ctx)?);
            }
        }
        Ok(outcomes)
    }

    fn record(
        &self,
        horizon: Horizon,
        status: &str,
        counts: &BTreeMap<String, i64>,
        at: DateTime<Utc>,
    ) {
        self.store.events().publish(ChangeEvent::ConsolidationRun {
            pass: horizon.as_str().to_string(),
            status: status.to_string(),
            counts: counts.clone(),
            at,
        });
        if let Some(log) = &self.ops_log {
            let record =
                OpsRecord::consolidation(horizon.as_str(), status, counts.clone(), at);
            if let Err(e) = log.append(&record) {
                tracing::warn!("could not append ops record: {e}");
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
