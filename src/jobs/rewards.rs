// src/jobs/rewards.rs
use crate::error::{DispatchError, Result};
use crate::jobs::executor::{parse_address, Executor, ExecutorContext};
use crate::pipeline::{CallSpec, SenderAccount};
use crate::token::{scale_amount, transfer_calldata};
use async_trait::async_trait;
use ethers::types::{Address, U256};
use log::{debug, info, warn};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct RewardEntry {
    recipient: String,
    amount: String,
}

#[derive(Debug, Deserialize)]
struct RewardsConfig {
    sender_key: String,
    token_address: String,
    rewards: Vec<RewardEntry>,
    #[serde(default)]
    min_holding: Option<String>,
    #[serde(default)]
    gas_price_gwei: Option<f64>,
    #[serde(default)]
    unit_interval_secs: Option<u64>,
}

/// One token transfer per qualifying recipient. Qualification is an
/// optional minimum holding checked through the explorer; the qualifying
/// set, and with it `total_count`, is fixed before the first unit runs.
pub struct RewardsExecutor {
    sender: SenderAccount,
    token: Address,
    rewards: Vec<(Address, String)>,
    min_holding: Option<String>,
    gas_override: Option<f64>,
    interval_override: Option<u64>,
}

impl RewardsExecutor {
    pub fn from_config(config: &serde_json::Value, chain_id: u64) -> Result<Self> {
        let cfg: RewardsConfig = serde_json::from_value(config.clone())
            .map_err(|e| DispatchError::FatalConfig(format!("rewards config: {}", e)))?;
        if cfg.rewards.is_empty() {
            return Err(DispatchError::FatalConfig(
                "rewards job has no recipients".to_string(),
            ));
        }

        let rewards = cfg
            .rewards
            .iter()
            .map(|entry| Ok((parse_address(&entry.recipient)?, entry.amount.clone())))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            sender: SenderAccount::from_private_key(&cfg.sender_key, chain_id)?,
            token: parse_address(&cfg.token_address)?,
            rewards,
            min_holding: cfg.min_holding,
            gas_override: cfg.gas_price_gwei,
            interval_override: cfg.unit_interval_secs,
        })
    }
}

#[async_trait]
impl Executor for RewardsExecutor {
    async fn run(self: Box<Self>, ctx: ExecutorContext) -> Result<()> {
        let gas = ctx.effective_gas(self.gas_override);
        let interval = ctx.effective_interval(self.interval_override);

        let meta = ctx.tokens.metadata(self.token).await?;
        let threshold = match &self.min_holding {
            Some(min) => Some(scale_amount(min, meta.decimals)?),
            None => None,
        };

        let mut qualifying: Vec<(Address, U256)> = Vec::new();
        for (recipient, amount) in &self.rewards {
            let scaled = scale_amount(amount, meta.decimals)?;
            let qualifies = match threshold {
                None => true,
                Some(min) => match ctx.explorer.token_balance(self.token, *recipient).await {
                    Ok(balance) => balance >= min,
                    Err(e) => {
                        warn!(
                            "Job #{}: holding check failed for {:?} ({}); excluding",
                            ctx.job_id, recipient, e
                        );
                        false
                    }
                },
            };
            if qualifies {
                qualifying.push((*recipient, scaled));
            } else {
                debug!("Job #{}: {:?} below minimum holding", ctx.job_id, recipient);
            }
        }

        let total = qualifying.len() as u64;
        ctx.set_total(total).await;
        info!(
            "Job #{}: {} of {} reward recipients qualify ({} {})",
            ctx.job_id,
            total,
            self.rewards.len(),
            meta.symbol,
            meta.decimals
        );

        for (index, (recipient, scaled)) in qualifying.iter().enumerate() {
            if !ctx.begin_unit().await {
                break;
            }

            let spec =
                CallSpec::contract_call(self.token, transfer_calldata(*recipient, *scaled));
            let result = ctx.pipeline.send(&self.sender, spec, &gas).await;
            match &result {
                Ok(hash) => info!(
                    "Job #{}: reward {}/{} to {:?}: {:#x}",
                    ctx.job_id,
                    index + 1,
                    total,
                    recipient,
                    hash
                ),
                Err(e) => warn!(
                    "Job #{}: reward {}/{} to {:?} failed: {}",
                    ctx.job_id,
                    index + 1,
                    total,
                    recipient,
                    e
                ),
            }
            ctx.record_unit(&result).await;

            if index + 1 < qualifying.len() && !ctx.sleep_between_units(interval).await {
                break;
            }
        }

        Ok(())
    }
}
