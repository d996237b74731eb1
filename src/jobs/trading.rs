// src/jobs/trading.rs
//! Scheduled auto-buy and auto-sell loops against the PancakeSwap router.

use crate::error::{DispatchError, Result};
use crate::jobs::executor::{parse_address, Executor, ExecutorContext};
use crate::pipeline::{CallSpec, SenderAccount};
use crate::token::{
    approve_calldata, scale_amount, swap_deadline, swap_exact_eth_for_tokens_calldata,
    swap_exact_tokens_for_eth_calldata,
};
use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
use log::{debug, info, warn};
use serde::Deserialize;

/// PancakeSwap v2 router on BSC mainnet.
const DEFAULT_ROUTER: &str = "0x10ED43C718714eb63d5aA57B78B54704E256024E";
/// Wrapped BNB on BSC mainnet.
const DEFAULT_WBNB: &str = "0xbb4CdB9CBd36B01bD1cBaEBF2De08d9173bc095c";
/// Router deadline slack per swap.
const SWAP_DEADLINE_SECS: u64 = 300;

fn parse_or_default(configured: &Option<String>, default: &str) -> Result<Address> {
    match configured {
        Some(s) => parse_address(s),
        None => parse_address(default),
    }
}

#[derive(Debug, Deserialize)]
struct AutoBuyConfig {
    sender_key: String,
    token_address: String,
    spend_bnb_each: String,
    cycles: u64,
    #[serde(default)]
    router_address: Option<String>,
    #[serde(default)]
    wbnb_address: Option<String>,
    #[serde(default)]
    min_tokens_out: Option<String>,
    #[serde(default)]
    max_bnb_price_usd: Option<f64>,
    #[serde(default)]
    gas_price_gwei: Option<f64>,
    #[serde(default)]
    interval_secs: Option<u64>,
}

/// One router buy per scheduled cycle, optionally gated on the current BNB
/// price from the explorer.
pub struct AutoBuyExecutor {
    sender: SenderAccount,
    token: Address,
    router: Address,
    wbnb: Address,
    spend_each: String,
    cycles: u64,
    min_tokens_out: Option<String>,
    max_price_usd: Option<f64>,
    gas_override: Option<f64>,
    interval_override: Option<u64>,
}

impl AutoBuyExecutor {
    pub fn from_config(config: &serde_json::Value, chain_id: u64) -> Result<Self> {
        let cfg: AutoBuyConfig = serde_json::from_value(config.clone())
            .map_err(|e| DispatchError::FatalConfig(format!("auto_buy config: {}", e)))?;
        if cfg.cycles == 0 {
            return Err(DispatchError::FatalConfig(
                "auto_buy job needs at least one cycle".to_string(),
            ));
        }

        Ok(Self {
            sender: SenderAccount::from_private_key(&cfg.sender_key, chain_id)?,
            token: parse_address(&cfg.token_address)?,
            router: parse_or_default(&cfg.router_address, DEFAULT_ROUTER)?,
            wbnb: parse_or_default(&cfg.wbnb_address, DEFAULT_WBNB)?,
            spend_each: cfg.spend_bnb_each,
            cycles: cfg.cycles,
            min_tokens_out: cfg.min_tokens_out,
            max_price_usd: cfg.max_bnb_price_usd,
            gas_override: cfg.gas_price_gwei,
            interval_override: cfg.interval_secs,
        })
    }
}

#[async_trait]
impl Executor for AutoBuyExecutor {
    async fn run(self: Box<Self>, ctx: ExecutorContext) -> Result<()> {
        ctx.set_total(self.cycles).await;

        let gas = ctx.effective_gas(self.gas_override);
        let interval = ctx.effective_interval(self.interval_override);
        let spend_wei = scale_amount(&self.spend_each, 18)?;

        let min_out = match &self.min_tokens_out {
            Some(min) => {
                let meta = ctx.tokens.metadata(self.token).await?;
                scale_amount(min, meta.decimals)?
            }
            None => U256::zero(),
        };

        info!(
            "Job #{}: auto-buy {} cycles of {} BNB into {:?}",
            ctx.job_id, self.cycles, self.spend_each, self.token
        );

        for cycle in 0..self.cycles {
            if !ctx.begin_unit().await {
                break;
            }

            if let Some(cap) = self.max_price_usd {
                match ctx.explorer.bnb_price_usd().await {
                    Ok(price) if price > cap => {
                        warn!(
                            "Job #{}: cycle {} skipped, BNB at ${:.2} above cap ${:.2}",
                            ctx.job_id,
                            cycle + 1,
                            price,
                            cap
                        );
                        let skipped: Result<H256> = Err(DispatchError::Explorer(format!(
                            "BNB price {:.2} above cap {:.2}",
                            price, cap
                        )));
                        ctx.record_unit(&skipped).await;
                        if cycle + 1 < self.cycles && !ctx.sleep_between_units(interval).await {
                            break;
                        }
                        continue;
                    }
                    Ok(price) => debug!("Job #{}: BNB at ${:.2}, under cap", ctx.job_id, price),
                    // The gate feeds a decision, it is not a precondition.
                    Err(e) => warn!("Job #{}: price gate unavailable ({})", ctx.job_id, e),
                }
            }

            let data = swap_exact_eth_for_tokens_calldata(
                min_out,
                vec![self.wbnb, self.token],
                self.sender.address(),
                swap_deadline(SWAP_DEADLINE_SECS),
            );
            let spec = CallSpec::contract_call(self.router, data).with_value(spend_wei);
            let result = ctx.pipeline.send(&self.sender, spec, &gas).await;
            match &result {
                Ok(hash) => info!(
                    "Job #{}: buy cycle {}/{} confirmed: {:#x}",
                    ctx.job_id,
                    cycle + 1,
                    self.cycles,
                    hash
                ),
                Err(e) => warn!(
                    "Job #{}: buy cycle {}/{} failed: {}",
                    ctx.job_id,
                    cycle + 1,
                    self.cycles,
                    e
                ),
            }
            ctx.record_unit(&result).await;

            if cycle + 1 < self.cycles && !ctx.sleep_between_units(interval).await {
                break;
            }
        }

        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct AutoSellConfig {
    sender_key: String,
    token_address: String,
    sell_amount_each: String,
    cycles: u64,
    #[serde(default)]
    router_address: Option<String>,
    #[serde(default)]
    wbnb_address: Option<String>,
    #[serde(default)]
    min_bnb_out: Option<String>,
    #[serde(default)]
    gas_price_gwei: Option<f64>,
    #[serde(default)]
    interval_secs: Option<u64>,
}

/// One router sell per scheduled cycle. The sell amount is scaled by the
/// token's fetched decimal count, and the router allowance is topped up
/// through the pipeline before the first cycle when needed.
pub struct AutoSellExecutor {
    sender: SenderAccount,
    token: Address,
    router: Address,
    wbnb: Address,
    sell_each: String,
    cycles: u64,
    min_bnb_out: Option<String>,
    gas_override: Option<f64>,
    interval_override: Option<u64>,
}

impl AutoSellExecutor {
    pub fn from_config(config: &serde_json::Value, chain_id: u64) -> Result<Self> {
        let cfg: AutoSellConfig = serde_json::from_value(config.clone())
            .map_err(|e| DispatchError::FatalConfig(format!("auto_sell config: {}", e)))?;
        if cfg.cycles == 0 {
            return Err(DispatchError::FatalConfig(
                "auto_sell job needs at least one cycle".to_string(),
            ));
        }

        Ok(Self {
            sender: SenderAccount::from_private_key(&cfg.sender_key, chain_id)?,
            token: parse_address(&cfg.token_address)?,
            router: parse_or_default(&cfg.router_address, DEFAULT_ROUTER)?,
            wbnb: parse_or_default(&cfg.wbnb_address, DEFAULT_WBNB)?,
            sell_each: cfg.sell_amount_each,
            cycles: cfg.cycles,
            min_bnb_out: cfg.min_bnb_out,
            gas_override: cfg.gas_price_gwei,
            interval_override: cfg.interval_secs,
        })
    }
}

#[async_trait]
impl Executor for AutoSellExecutor {
    async fn run(self: Box<Self>, ctx: ExecutorContext) -> Result<()> {
        ctx.set_total(self.cycles).await;

        let gas = ctx.effective_gas(self.gas_override);
        let interval = ctx.effective_interval(self.interval_override);

        let meta = ctx.tokens.metadata(self.token).await?;
        let sell_each = scale_amount(&self.sell_each, meta.decimals)?;
        let min_out = match &self.min_bnb_out {
            Some(min) => scale_amount(min, 18)?,
            None => U256::zero(),
        };

        info!(
            "Job #{}: auto-sell {} cycles of {} {} ({} decimals)",
            ctx.job_id, self.cycles, self.sell_each, meta.symbol, meta.decimals
        );

        let needed = sell_each * U256::from(self.cycles);
        let allowance = ctx
            .tokens
            .allowance(self.token, self.sender.address(), self.router)
            .await?;
        if allowance < needed {
            info!(
                "Job #{}: router allowance {} below {}, approving",
                ctx.job_id, allowance, needed
            );
            let spec =
                CallSpec::contract_call(self.token, approve_calldata(self.router, needed));
            // Without the approval no cycle can succeed, so its failure
            // fails the job before the first unit.
            ctx.pipeline.send(&self.sender, spec, &gas).await?;
        }

        for cycle in 0..self.cycles {
            if !ctx.begin_unit().await {
                break;
            }

            let data = swap_exact_tokens_for_eth_calldata(
                sell_each,
                min_out,
                vec![self.token, self.wbnb],
                self.sender.address(),
                swap_deadline(SWAP_DEADLINE_SECS),
            );
            let spec = CallSpec::contract_call(self.router, data);
            let result = ctx.pipeline.send(&self.sender, spec, &gas).await;
            match &result {
                Ok(hash) => info!(
                    "Job #{}: sell cycle {}/{} confirmed: {:#x}",
                    ctx.job_id,
                    cycle + 1,
                    self.cycles,
                    hash
                ),
                Err(e) => warn!(
                    "Job #{}: sell cycle {}/{} failed: {}",
                    ctx.job_id,
                    cycle + 1,
                    self.cycles,
                    e
                ),
            }
            ctx.record_unit(&result).await;

            if cycle + 1 < self.cycles && !ctx.sleep_between_units(interval).await {
                break;
            }
        }

        Ok(())
    }
}
