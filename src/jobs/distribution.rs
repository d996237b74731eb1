// src/jobs/distribution.rs
use crate::error::{DispatchError, Result};
use crate::jobs::executor::{parse_address, parse_optional_token, Executor, ExecutorContext};
use crate::pipeline::{CallSpec, SenderAccount};
use crate::token::{scale_amount, transfer_calldata};
use async_trait::async_trait;
use ethers::types::Address;
use log::{info, warn};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct DistributionConfig {
    sender_key: String,
    recipients: Vec<String>,
    amount_each: String,
    #[serde(default)]
    token_address: Option<String>,
    #[serde(default)]
    gas_price_gwei: Option<f64>,
    #[serde(default)]
    unit_interval_secs: Option<u64>,
}

/// One send per recipient address: native BNB, or an ERC-20 transfer with
/// the token's decimals fetched fresh at job start.
pub struct DistributionExecutor {
    sender: SenderAccount,
    token: Option<Address>,
    recipients: Vec<Address>,
    amount_each: String,
    gas_override: Option<f64>,
    interval_override: Option<u64>,
}

impl DistributionExecutor {
    pub fn from_config(config: &serde_json::Value, chain_id: u64) -> Result<Self> {
        let cfg: DistributionConfig = serde_json::from_value(config.clone())
            .map_err(|e| DispatchError::FatalConfig(format!("distribution config: {}", e)))?;
        if cfg.recipients.is_empty() {
            return Err(DispatchError::FatalConfig(
                "distribution job has no recipients".to_string(),
            ));
        }

        let sender = SenderAccount::from_private_key(&cfg.sender_key, chain_id)?;
        let token = parse_optional_token(&cfg.token_address)?;
        let recipients = cfg
            .recipients
            .iter()
            .map(|s| parse_address(s))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            sender,
            token,
            recipients,
            amount_each: cfg.amount_each,
            gas_override: cfg.gas_price_gwei,
            interval_override: cfg.unit_interval_secs,
        })
    }
}

#[async_trait]
impl Executor for DistributionExecutor {
    async fn run(self: Box<Self>, ctx: ExecutorContext) -> Result<()> {
        let total = self.recipients.len() as u64;
        ctx.set_total(total).await;

        let gas = ctx.effective_gas(self.gas_override);
        let interval = ctx.effective_interval(self.interval_override);

        let token_plan = match self.token {
            Some(token) => {
                let meta = ctx.tokens.metadata(token).await?;
                let scaled = scale_amount(&self.amount_each, meta.decimals)?;
                info!(
                    "Job #{}: distributing {} {} ({} decimals) to {} recipients",
                    ctx.job_id, self.amount_each, meta.symbol, meta.decimals, total
                );
                Some((token, scaled))
            }
            None => {
                info!(
                    "Job #{}: distributing {} BNB to {} recipients",
                    ctx.job_id, self.amount_each, total
                );
                None
            }
        };
        let native_amount = scale_amount(&self.amount_each, 18)?;

        for (index, recipient) in self.recipients.iter().enumerate() {
            if !ctx.begin_unit().await {
                break;
            }

            let spec = match token_plan {
                Some((token, scaled)) => {
                    CallSpec::contract_call(token, transfer_calldata(*recipient, scaled))
                }
                None => CallSpec::native_transfer(*recipient, native_amount),
            };

            let result = ctx.pipeline.send(&self.sender, spec, &gas).await;
            match &result {
                Ok(hash) => info!(
                    "Job #{}: sent {}/{} to {:?}: {:#x}",
                    ctx.job_id,
                    index + 1,
                    total,
                    recipient,
                    hash
                ),
                Err(e) => warn!(
                    "Job #{}: send {}/{} to {:?} failed: {}",
                    ctx.job_id,
                    index + 1,
                    total,
                    recipient,
                    e
                ),
            }
            ctx.record_unit(&result).await;

            if index + 1 < self.recipients.len() && !ctx.sleep_between_units(interval).await {
                break;
            }
        }

        Ok(())
    }
}
