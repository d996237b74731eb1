//! Job engine and mode executors.
//!
//! A job is one long-lived dispatch loop: bulk distribution, a scheduled
//! buy/sell series, or a reward payout run. The engine owns job state and
//! the bounded worker pool; executors only report progress through the
//! shared, lock-protected record.

pub mod control;
pub mod distribution;
pub mod engine;
pub mod executor;
pub mod rewards;
pub mod trading;

pub use control::ControlToken;
pub use distribution::DistributionExecutor;
pub use engine::{EngineSettings, JobEngine};
pub use executor::{Executor, ExecutorContext};
pub use rewards::RewardsExecutor;
pub use trading::{AutoBuyExecutor, AutoSellExecutor};

use crate::error::{DispatchError, Result};
use serde::Serialize;
use std::time::Instant;

/// The closed set of executor kinds. Submission strings outside this set are
/// rejected before anything is queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobMode {
    Distribution,
    AutoBuy,
    AutoSell,
    Rewards,
}

impl JobMode {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "distribution" => Ok(JobMode::Distribution),
            "auto_buy" => Ok(JobMode::AutoBuy),
            "auto_sell" => Ok(JobMode::AutoSell),
            "rewards" => Ok(JobMode::Rewards),
            other => Err(DispatchError::UnknownJobMode(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobMode::Distribution => "distribution",
            JobMode::AutoBuy => "auto_buy",
            JobMode::AutoSell => "auto_sell",
            JobMode::Rewards => "rewards",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobState {
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

/// The live job record. Mutated only under its own lock; terminal once
/// `is_done` is set.
#[derive(Debug)]
pub struct Job {
    pub id: u64,
    pub title: String,
    pub mode: JobMode,
    pub priority: u8,
    pub state: JobState,
    pub total_count: u64,
    pub done_count: u64,
    pub failed_count: u64,
    pub is_done: bool,
    pub error: Option<String>,
    pub started_at: Option<Instant>,
}

impl Job {
    pub fn new(id: u64, title: String, mode: JobMode, priority: u8) -> Self {
        Self {
            id,
            title,
            mode,
            priority,
            state: JobState::Queued,
            total_count: 0,
            done_count: 0,
            failed_count: 0,
            is_done: false,
            error: None,
            started_at: None,
        }
    }

    pub fn progress(&self) -> JobProgress {
        let eta_secs = match self.started_at {
            Some(started) if self.done_count > 0 && self.total_count > 0 => {
                let elapsed = started.elapsed().as_secs_f64();
                let rate = self.done_count as f64 / elapsed.max(f64::EPSILON);
                let remaining = self
                    .total_count
                    .saturating_sub(self.done_count + self.failed_count);
                Some((remaining as f64 / rate) as u64)
            }
            _ => None,
        };
        JobProgress {
            id: self.id,
            state: self.state,
            total_count: self.total_count,
            done_count: self.done_count,
            failed_count: self.failed_count,
            is_done: self.is_done,
            eta_secs,
            error: self.error.clone(),
        }
    }
}

/// Externally observable snapshot: state and counts are the whole story.
#[derive(Debug, Clone, Serialize)]
pub struct JobProgress {
    pub id: u64,
    pub state: JobState,
    pub total_count: u64,
    pub done_count: u64,
    pub failed_count: u64,
    pub is_done: bool,
    pub eta_secs: Option<u64>,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_unknown_modes() {
        assert_eq!(JobMode::parse("auto_buy").unwrap(), JobMode::AutoBuy);
        assert!(matches!(
            JobMode::parse("yield_farm"),
            Err(DispatchError::UnknownJobMode(_))
        ));
    }
}
