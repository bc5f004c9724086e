//! Consolidation scheduler.
//!
//! A pure producer of "run this pass now" signals. Cron expressions from
//! the configuration are evaluated against wall-clock time and due
//! horizons are sent over a channel; the consolidation engine owns the
//! store and does the actual work. Missed-window catch-up at startup is
//! the engine's `run_due_passes`, not the scheduler's concern.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{MemoryError, Result};

use super::Horizon;

/// Buffered pass signals; overflow drops the oldest request's slot by
/// back-pressure (the sender awaits).
const CHANNEL_CAPACITY: usize = 16;

/// A request to run one pass.
#[derive(Debug, Clone)]
pub struct PassRequest {
    pub horizon: Horizon,
    /// The cron occurrence that triggered this request.
    pub scheduled_for: DateTime<Utc>,
}

/// Cron-driven signal source for the consolidation engine.
pub struct Scheduler {
    schedules: Vec<(Horizon, Schedule)>,
    tx: mpsc::Sender<PassRequest>,
}

impl Scheduler {
    /// Build from the frozen config. Returns the scheduler and the
    /// receiving end the engine driver should consume.
    pub fn new(config: &Config) -> Result<(Self, mpsc::Receiver<PassRequest>)> {
        let exprs = [
            (Horizon::Daily, config.schedules.daily.as_str()),
            (Horizon::Weekly, config.schedules.weekly.as_str()),
            (Horizon::Monthly, config.schedules.monthly.as_str()),
            (Horizon::Quarterly, config.schedules.quarterly.as_str()),
            (Horizon::Yearly, config.schedules.yearly.as_str()),
        ];
        let mut schedules = Vec::with_capacity(exprs.len());
        for (horizon, expr) in exprs {
            let schedule = Schedule::from_str(expr).map_err(|e| {
                MemoryError::Invalid(format!("bad {horizon} schedule '{expr}': {e}"))
            })?;
            schedules.push((horizon, schedule));
        }
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        Ok((Self { schedules, tx }, rx))
    }

    /// Every horizon firing at the earliest upcoming occurrence after
    /// `after`. More than one horizon can share an instant.
    pub fn next_fires(&self, after: DateTime<Utc>) -> Vec<(Horizon, DateTime<Utc>)> {
        let upcoming: Vec<(Horizon, DateTime<Utc>)> = self
            .schedules
            .iter()
            .filter_map(|(horizon, schedule)| {
                schedule.after(&after).next().map(|at| (*horizon, at))
            })
            .collect();
        let Some(earliest) = upcoming.iter().map(|(_, at)| *at).min() else {
            return Vec::new();
        };
        upcoming
            .into_iter()
            .filter(|(_, at)| *at == earliest)
            .collect()
    }

    /// Drive the schedule until cancelled. Sends one [`PassRequest`] per
    /// due horizon; sending awaits if the engine is behind.
    pub async fn run(self, cancel: CancellationToken) {
        loop {
            let now = Utc::now();
            let due = self.next_fires(now);
            if due.is_empty() {
                tracing::warn!("no upcoming schedule occurrences; scheduler stopping");
                return;
            }
            let fire_at = due[0].1;
            let wait = (fire_at - Utc::now()).to_std().unwrap_or_default();

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }

            for (horizon, scheduled_for) in due {
                tracing::debug!(%horizon, %scheduled_for, "scheduling consolidation pass");
                if self
                    .tx
                    .send(PassRequest {
                        horizon,
                        scheduled_for,
                    })
                    .await
                    .is_err()
                {
                    // Receiver gone; the engine shut down.
                    return;
                }
            }
        }
    }
}
