//! Operation dispatch.
//!
//! Maps request envelopes onto core operations. Core calls are synchronous
//! (SQLite, embedding), so each request runs on the blocking pool under a
//! per-class timeout; hitting the timeout cancels the operation's context,
//! which rolls back any open transaction before commit.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use engram_core::{
    ConsolidationEngine, Filter, Horizon, Memory, MemoryError, MemoryType, OpCtx,
    RecallTarget, Store, StoreInput, TagMode, UpdateInput,
};

use crate::protocol::{ErrorObject, Request, Response};

// ============================================================================
// TIMEOUTS
// ============================================================================

/// Per-class operation budgets.
#[derive(Debug, Clone, Copy)]
pub struct ServiceTimeouts {
    pub read: Duration,
    pub write: Duration,
    pub consolidation: Duration,
}

impl Default for ServiceTimeouts {
    fn default() -> Self {
        Self {
            read: Duration::from_secs(10),
            write: Duration::from_secs(30),
            consolidation: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpClass {
    Read,
    Write,
    Consolidation,
}

fn classify(op: &str) -> Option<OpClass> {
    Some(match op {
        "get_by_hash" | "retrieve" | "recall" | "search_by_tag" | "exact_match"
        | "debug_retrieve" | "stats" => OpClass::Read,
        "store" | "update" | "delete" | "delete_by_tags" | "unarchive" | "health_check" => {
            OpClass::Write
        }
        "run_consolidation" => OpClass::Consolidation,
        _ => return None,
    })
}

// ============================================================================
// PARAMETER SHAPES
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
#[derive(Default)]
struct FilterParams {
    tags: Vec<String>,
    tag_mode: TagMode,
    types: Vec<String>,
    include_archived: bool,
}

impl FilterParams {
    fn into_filter(self) -> Filter {
        Filter {
            tags: self.tags,
            tag_mode: self.tag_mode,
            types: self
                .types
                .iter()
                .map(|t| MemoryType::parse_name(t))
                .collect(),
            include_archived: self.include_archived,
            ..Default::default()
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct GetParams {
    hash: String,
    #[serde(default)]
    include_archived: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct HashParams {
    hash: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct UpdateParams {
    hash: String,
    delta: UpdateInput,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct DeleteByTagsParams {
    tags: Vec<String>,
    #[serde(default)]
    mode: TagMode,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RetrieveParams {
    query_text: String,
    #[serde(default = "default_k")]
    k: usize,
    #[serde(default)]
    min_score: f64,
    #[serde(default)]
    filter: FilterParams,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RecallParams {
    phrase: String,
    #[serde(default = "default_k")]
    k: usize,
    #[serde(default)]
    target: RecallTarget,
    /// Reference instant override, for deterministic testing.
    #[serde(default)]
    now: Option<DateTime<Utc>>,
    #[serde(default)]
    filter: FilterParams,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct SearchByTagParams {
    tags: Vec<String>,
    #[serde(default)]
    mode: TagMode,
    #[serde(default)]
    k: Option<usize>,
    #[serde(default)]
    filter: FilterParams,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ExactMatchParams {
    text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct DebugRetrieveParams {
    query_text: String,
    #[serde(default = "default_k")]
    k: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
#[derive(Default)]
struct HealthParams {
    repair: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ConsolidationParams {
    horizon: String,
    #[serde(default)]
    now: Option<DateTime<Utc>>,
}

fn default_k() -> usize {
    10
}

// ============================================================================
// SERVICE
// ============================================================================

/// Dispatches requests against a shared store and consolidation engine.
pub struct MemoryService {
    store: Arc<Store>,
    engine: Arc<ConsolidationEngine>,
    timeouts: ServiceTimeouts,
}

impl MemoryService {
    pub fn new(store: Arc<Store>, engine: Arc<ConsolidationEngine>) -> Self {
        Self::with_timeouts(store, engine, ServiceTimeouts::default())
    }

    pub fn with_timeouts(
        store: Arc<Store>,
        engine: Arc<ConsolidationEngine>,
        timeouts: ServiceTimeouts,
    ) -> Self {
        Self {
            store,
            engine,
            timeouts,
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Handle one request. Notifications (no id) are dropped silently,
    /// whatever their operation; everything else gets exactly one response
    /// echoing the correlation id.
    pub async fn handle(&self, request: Request) -> Option<Response> {
        let Some(id) = request.id else {
            tracing::debug!(op = %request.op, "dropping notification");
            return None;
        };
        let response = match self.execute(&request.op, request.params).await {
            Ok(result) => Response::success(id, result),
            Err(e) => {
                tracing::debug!(op = %request.op, "operation failed: {e}");
                Response::failure(id, ErrorObject::from(&e))
            }
        };
        Some(response)
    }

    async fn execute(
        &self,
        op: &str,
        params: Option<Value>,
    ) -> Result<Value, MemoryError> {
        let class = classify(op)
            .ok_or_else(|| MemoryError::Invalid(format!("unknown operation '{op}'")))?;
        let budget = match class {
            OpClass::Read => self.timeouts.read,
            OpClass::Write => self.timeouts.write,
            OpClass::Consolidation => self.timeouts.consolidation,
        };

        let token = CancellationToken::new();
        let store = self.store.clone();
        let engine = self.engine.clone();
        let op_name = op.to_string();
        let task_token = token.clone();
        let task = tokio::task::spawn_blocking(move || {
            let ctx = OpCtx::with_token(task_token);
            dispatch_blocking(&store, &engine, &op_name, params, &ctx)
        });

        match tokio::time::timeout(budget, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(MemoryError::Corruption(format!(
                "operation worker failed: {join_error}"
            ))),
            Err(_) => {
                // Rolls the operation back at its next cancellation point;
                // a commit already in flight is not interrupted.
                token.cancel();
                Err(MemoryError::Timeout(format!(
                    "'{op}' exceeded {}s",
                    budget.as_secs()
                )))
            }
        }
    }
}

// ============================================================================
// BLOCKING DISPATCH
// ============================================================================

fn parse<T: serde::de::DeserializeOwned>(params: Option<Value>) -> Result<T, MemoryError> {
    let value = params.unwrap_or_else(|| Value::Object(serde_json::Map::new()));
    serde_json::from_value(value)
        .map_err(|e| MemoryError::Invalid(format!("bad parameters: {e}")))
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, MemoryError> {
    serde_json::to_value(value)
        .map_err(|e| MemoryError::Corruption(format!("result serialization: {e}")))
}

fn memories_value(memories: &[Memory]) -> Result<Value, MemoryError> {
    to_value(&memories)
}

fn dispatch_blocking(
    store: &Store,
    engine: &ConsolidationEngine,
    op: &str,
    params: Option<Value>,
    ctx: &OpCtx,
) -> Result<Value, MemoryError> {
    match op {
        "store" => {
            let input: StoreInput = parse(params)?;
            to_value(&store.store(input, ctx)?)
        }
        "get_by_hash" => {
            let p: GetParams = parse(params)?;
            to_value(&store.get_by_hash(&p.hash, p.include_archived, ctx)?)
        }
        "update" => {
            let p: UpdateParams = parse(params)?;
            to_value(&store.update(&p.hash, p.delta, ctx)?)
        }
        "delete" => {
            let p: HashParams = parse(params)?;
            let deleted = store.delete(&p.hash, ctx)?;
            Ok(serde_json::json!({ "deleted": deleted }))
        }
        "delete_by_tags" => {
            let p: DeleteByTagsParams = parse(params)?;
            let count = store.delete_by_tags(&p.tags, p.mode, ctx)?;
            Ok(serde_json::json!({ "deleted": count }))
        }
        "retrieve" => {
            let p: RetrieveParams = parse(params)?;
            let filter = p.filter.into_filter();
            to_value(&store.retrieve(&p.query_text, p.k, p.min_score, &filter, ctx)?)
        }
        "recall" => {
            let p: RecallParams = parse(params)?;
            let filter = p.filter.into_filter();
            to_value(&store.recall(&p.phrase, p.k, &filter, p.target, p.now, ctx)?)
        }
        "search_by_tag" => {
            let p: SearchByTagParams = parse(params)?;
            let filter = p.filter.into_filter();
            let memories = store.search_tags(&p.tags, p.mode, &filter, p.k, ctx)?;
            memories_value(&memories)
        }
        "exact_match" => {
            let p: ExactMatchParams = parse(params)?;
            to_value(&store.exact_match(&p.text, ctx)?)
        }
        "debug_retrieve" => {
            let p: DebugRetrieveParams = parse(params)?;
            to_value(&store.debug_retrieve(&p.query_text, p.k, ctx)?)
        }
        "stats" => to_value(&store.stats()?),
        "health_check" => {
            let p: HealthParams = parse(params)?;
            to_value(&store.health_check(p.repair)?)
        }
        "unarchive" => {
            let p: HashParams = parse(params)?;
            to_value(&store.unarchive(&p.hash, ctx)?)
        }
        "run_consolidation" => {
            let p: ConsolidationParams = parse(params)?;
            let horizon = match p.horizon.as_str() {
                "daily" => Horizon::Daily,
                "weekly" => Horizon::Weekly,
                "monthly" => Horizon::Monthly,
                "quarterly" => Horizon::Quarterly,
                "yearly" => Horizon::Yearly,
                other => {
                    return Err(MemoryError::Invalid(format!(
                        "unknown horizon '{other}'"
                    )))
                }
            };
            let now = p.now.unwrap_or_else(Utc::now);
            to_value(&engine.run_pass(horizon, now, ctx)?)
        }
        // classify() already rejected anything else.
        other => Err(MemoryError::Invalid(format!("unknown operation '{other}'"))),
    }
}

// ============================================================================
// TESTS
// ============================================================================
