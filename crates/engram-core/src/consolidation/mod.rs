//! Autonomous consolidation.
//!
//! Scheduled passes over the store: daily decay scoring, weekly association
//! discovery, monthly clustering and compression, quarterly/yearly
//! controlled forgetting. Passes never delete; forgetting archives.

mod associations;
mod clustering;
mod compression;
mod decay;
mod engine;
mod forgetting;
mod scheduler;

pub use decay::decay_score;
pub use engine::{ConsolidationEngine, Horizon, PassOutcome, PassState};
pub use scheduler::{PassRequest, Scheduler};
