// src/jobs/executor.rs
use crate::error::{DispatchError, Result};
use crate::explorer::ExplorerClient;
use crate::jobs::control::ControlToken;
use crate::jobs::Job;
use crate::pipeline::{GasPolicy, TransactionPipeline};
use crate::token::TokenService;
use async_trait::async_trait;
use ethers::types::Address;
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// One work loop per job mode. `run` drives the job to completion or
/// cancellation; configuration-class errors detected before the first unit
/// are returned and fail the job, while per-unit failures are recorded
/// through the context and the loop continues.
#[async_trait]
pub trait Executor: Send {
    async fn run(self: Box<Self>, ctx: ExecutorContext) -> Result<()>;
}

/// Everything an executor needs, injected by the engine: the shared
/// pipeline, token and explorer services, the job's lock-protected record,
/// and its control token.
pub struct ExecutorContext {
    pub job_id: u64,
    pub pipeline: Arc<TransactionPipeline>,
    pub tokens: Arc<TokenService>,
    pub explorer: Arc<ExplorerClient>,
    pub record: Arc<Mutex<Job>>,
    pub control: Arc<ControlToken>,
    pub control_poll: Duration,
    pub unit_interval: Duration,
    pub gas_policy: GasPolicy,
}

impl ExecutorContext {
    /// Fixes the unit count before the first unit runs.
    pub async fn set_total(&self, total: u64) {
        self.record.lock().await.total_count = total;
    }

    /// The pre-unit suspension point: honors pause, detects cancel.
    pub async fn begin_unit(&self) -> bool {
        self.control.checkpoint(self.control_poll).await
    }

    /// Records one unit outcome under the job's lock.
    pub async fn record_unit<T>(&self, result: &Result<T>) {
        let mut job = self.record.lock().await;
        match result {
            Ok(_) => {
                job.done_count += 1;
                debug!(
                    "Job #{}: unit {}/{} done",
                    self.job_id,
                    job.done_count + job.failed_count,
                    job.total_count
                );
            }
            Err(e) => {
                job.failed_count += 1;
                warn!(
                    "Job #{}: unit {}/{} failed: {}",
                    self.job_id,
                    job.done_count + job.failed_count,
                    job.total_count,
                    e
                );
            }
        }
    }

    /// Sleeps the configured interval between units, waking for cancel.
    pub async fn sleep_between_units(&self, interval: Duration) -> bool {
        self.control
            .interruptible_sleep(interval, self.control_poll)
            .await
    }

    /// Job-level gas override, falling back to the engine-wide policy.
    pub fn effective_gas(&self, override_gwei: Option<f64>) -> GasPolicy {
        match override_gwei {
            Some(gwei) => GasPolicy::FixedGwei(gwei),
            None => self.gas_policy.clone(),
        }
    }

    pub fn effective_interval(&self, override_secs: Option<u64>) -> Duration {
        override_secs
            .map(Duration::from_secs)
            .unwrap_or(self.unit_interval)
    }
}

/// Parses a configured address, surfacing a configuration-class error.
pub(crate) fn parse_address(s: &str) -> Result<Address> {
    s.trim()
        .parse::<Address>()
        .map_err(|e| DispatchError::FatalConfig(format!("bad address '{}': {}", s, e)))
}

/// `None`, empty, or the literal `BNB` mean the native coin.
pub(crate) fn parse_optional_token(s: &Option<String>) -> Result<Option<Address>> {
    match s.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(v) if v.eq_ignore_ascii_case("bnb") => Ok(None),
        Some(v) => parse_address(v).map(Some),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optional_token_treats_bnb_as_native() {
        assert_eq!(parse_optional_token(&None).unwrap(), None);
        assert_eq!(parse_optional_token(&Some("BNB".to_string())).unwrap(), None);
        assert_eq!(parse_optional_token(&Some("bnb".to_string())).unwrap(), None);
        let addr = "0x000000000000000000000000000000000000beef";
        assert!(parse_optional_token(&Some(addr.to_string()))
            .unwrap()
            .is_some());
        assert!(parse_optional_token(&Some("garbage".to_string())).is_err());
    }
}
