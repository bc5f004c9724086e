//! Engine configuration.
//!
//! All options are discovered at startup and frozen for the lifetime of the
//! process; the store takes the config by value at open and never re-reads it.

use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, Result};
use crate::memory::RetentionClass;

/// Decay time constants in days, one per retention class.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionDays {
    pub critical: f64,
    pub reference: f64,
    pub standard: f64,
    pub temporary: f64,
}

impl Default for RetentionDays {
    fn default() -> Self {
        Self {
            critical: 365.0,
            reference: 180.0,
            standard: 30.0,
            temporary: 7.0,
        }
    }
}

impl RetentionDays {
    /// Tau for a retention class.
    pub fn tau(&self, class: RetentionClass) -> f64 {
        match class {
            RetentionClass::Critical => self.critical,
            RetentionClass::Reference => self.reference,
            RetentionClass::Standard => self.standard,
            RetentionClass::Temporary => self.temporary,
        }
    }
}

/// Cron-style fields for each consolidation horizon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedules {
    pub daily: String,
    pub weekly: String,
    pub monthly: String,
    pub quarterly: String,
    pub yearly: String,
}

impl Default for Schedules {
    fn default() -> Self {
        // cron crate syntax: sec min hour day month weekday
        Self {
            daily: "0 0 3 * * *".to_string(),
            weekly: "0 30 3 * * Sun".to_string(),
            monthly: "0 0 4 1 * *".to_string(),
            quarterly: "0 0 5 1 Jan,Apr,Jul,Oct *".to_string(),
            yearly: "0 0 6 1 Jan *".to_string(),
        }
    }
}

/// Engine configuration, frozen at open.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Embedding dimension `D`; must match the embedder. Changing it on an
    /// existing store requires migration.
    pub vector_dimension: usize,
    /// Maximum byte length of a single tag.
    pub max_tag_len: usize,
    /// Maximum number of tags on one memory.
    pub max_tags_per_memory: usize,
    /// Cap on result counts; larger `k` values are clamped, not rejected.
    pub max_k: usize,
    /// Enables the hostname tagging policy.
    pub include_hostname: bool,
    /// Decay time constants per retention class.
    pub retention_days: RetentionDays,
    /// `[min, max)` cosine similarity for creative associations; `max` and
    /// above yields semantic associations.
    pub association_window: [f64; 2],
    /// Minimum members for a cluster to form.
    pub cluster_min_size: usize,
    /// Target median neighborhood size used to tune the clustering radius.
    pub cluster_target_neighborhood: usize,
    /// Relevance score below which a memory becomes eligible for archival.
    pub forget_threshold: f64,
    /// Days of inactivity required before archival.
    pub forget_inactivity_days: i64,
    /// Cron fields per consolidation horizon.
    pub schedules: Schedules,
    /// Block writes while health issues are unresolved.
    pub strict_health: bool,
    /// SQLite busy timeout in milliseconds.
    pub busy_timeout_ms: u64,
    /// Write retry attempts after the busy timeout fires.
    pub retry_attempts: u32,
    /// First backoff step in milliseconds; doubles per attempt.
    pub retry_backoff_ms: u64,
    /// Capacity of the per-process query embedding cache.
    pub embedding_cache_size: usize,
    /// Ops log rotation threshold in bytes.
    pub ops_log_max_bytes: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vector_dimension: 384,
            max_tag_len: 128,
            max_tags_per_memory: 64,
            max_k: 100,
            include_hostname: false,
            retention_days: RetentionDays::default(),
            association_window: [0.3, 0.7],
            cluster_min_size: 5,
            cluster_target_neighborhood: 8,
            forget_threshold: 0.1,
            forget_inactivity_days: 90,
            schedules: Schedules::default(),
            strict_health: false,
            busy_timeout_ms: 5000,
            retry_attempts: 5,
            retry_backoff_ms: 50,
            embedding_cache_size: 1000,
            ops_log_max_bytes: 16 * 1024 * 1024,
        }
    }
}

impl Config {
    /// Validate internal consistency. Called once at open.
    pub fn validate(&self) -> Result<()> {
        if self.vector_dimension == 0 {
            return Err(MemoryError::Invalid("vector_dimension must be > 0".into()));
        }
        if self.max_tag_len == 0 || self.max_tags_per_memory == 0 {
            return Err(MemoryError::Invalid("tag limits must be > 0".into()));
        }
        if self.max_k == 0 {
            return Err(MemoryError::Invalid("max_k must be > 0".into()));
        }
        let [lo, hi] = self.association_window;
        if !(0.0..=1.0).contains(&lo) || !(0.0..=1.0).contains(&hi) || lo >= hi {
            return Err(MemoryError::Invalid(format!(
                "association_window [{lo}, {hi}] must satisfy 0 <= min < max <= 1"
            )));
        }
        if self.cluster_min_size < 2 {
            return Err(MemoryError::Invalid("cluster_min_size must be >= 2".into()));
        }
        if !(0.0..=1.0).contains(&self.forget_threshold) {
            return Err(MemoryError::Invalid("forget_threshold must be in [0, 1]".into()));
        }
        for (name, expr) in [
            ("daily", &self.schedules.daily),
            ("weekly", &self.schedules.weekly),
            ("monthly", &self.schedules.monthly),
            ("quarterly", &self.schedules.quarterly),
            ("yearly", &self.schedules.yearly),
        ] {
            use std::str::FromStr;
            cron::Schedule::from_str(expr).map_err(|e| {
                MemoryError::Invalid(format!("bad {name} schedule '{expr}': {e}"))
            })?;
        }
        Ok(())
    }
}
