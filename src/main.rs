// src/main.rs
use anyhow::{anyhow, Context, Result};
use bsc_wallet_sender::{
    chain::EvmClientFactory,
    config::load_config,
    explorer::ExplorerClient,
    jobs::{EngineSettings, JobEngine},
    limiter::ApiRateLimiter,
    nonce::NonceAuthority,
    pipeline::TransactionPipeline,
    store::MemoryJobStore,
    token::TokenService,
    utils::setup_logging,
    EndpointPool, RetryPolicy,
};
use clap::{Parser, Subcommand};
use log::info;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "bsc-wallet-sender", about = "Bulk transaction dispatch for BSC")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Probe every configured RPC endpoint and report status.
    Probe,
    /// Submit a bulk distribution job and watch it to completion.
    /// The sender key is read from the SENDER_KEY environment variable.
    Distribute {
        /// File with one recipient address per line.
        #[arg(long)]
        recipients_file: PathBuf,
        /// Amount per recipient, in token units (or BNB when no token).
        #[arg(long)]
        amount: String,
        /// ERC-20 contract address; omit for native BNB.
        #[arg(long)]
        token: Option<String>,
        #[arg(long, default_value_t = 5)]
        priority: u8,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging().expect("Failed to initialize logging");
    let cli = Cli::parse();

    let config = load_config().map_err(|e| anyhow!(e))?;

    let factory = Arc::new(EvmClientFactory::new(
        config.chain_id,
        Duration::from_secs(config.connection_timeout_secs),
    ));
    let pool = Arc::new(EndpointPool::new(
        config.rpc_urls.clone(),
        factory,
        Duration::from_secs(config.endpoint_freshness_secs),
        Duration::from_secs(config.probe_timeout_secs),
    ));

    match cli.command {
        Command::Probe => {
            for probe in pool.probe_all().await {
                if probe.online {
                    println!(
                        "ONLINE   {:>5}ms  block {:>10}  {}",
                        probe.latency_ms.unwrap_or(0),
                        probe.block.unwrap_or(0),
                        probe.url
                    );
                } else {
                    println!(
                        "OFFLINE           {}  ({})",
                        probe.url,
                        probe.error.unwrap_or_default()
                    );
                }
            }
            Ok(())
        }
        Command::Distribute {
            recipients_file,
            amount,
            token,
            priority,
        } => {
            let sender_key = std::env::var("SENDER_KEY")
                .context("SENDER_KEY environment variable not set")?;
            let recipients: Vec<String> = std::fs::read_to_string(&recipients_file)
                .with_context(|| format!("cannot read {}", recipients_file.display()))?
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(str::to_string)
                .collect();
            info!("Loaded {} recipients from {}", recipients.len(), recipients_file.display());

            let limiter = Arc::new(ApiRateLimiter::new(config.rate_max_rps, config.rate_burst));
            let nonce = Arc::new(NonceAuthority::new(
                pool.clone(),
                Duration::from_secs(config.nonce_resync_secs),
                config.max_pending_per_account,
            ));
            let pipeline = Arc::new(TransactionPipeline::new(
                pool.clone(),
                nonce,
                limiter.clone(),
                config.chain_id,
                Duration::from_secs(config.confirm_timeout_secs),
                Duration::from_secs(config.receipt_poll_secs),
                RetryPolicy::new(
                    config.broadcast_max_retries,
                    Duration::from_millis(config.broadcast_retry_delay_ms),
                    Duration::from_secs(8),
                ),
                config.gas_limit,
            ));
            let tokens = Arc::new(TokenService::new(pool.clone(), limiter.clone()));
            let explorer = Arc::new(ExplorerClient::new(
                config.explorer_url.clone(),
                config.explorer_api_keys.clone(),
                limiter.clone(),
            ));
            let store = Arc::new(MemoryJobStore::new());

            let engine = JobEngine::new(
                pipeline,
                tokens,
                explorer,
                store,
                EngineSettings::from_config(&config),
            );
            engine.start();

            let job_config = serde_json::json!({
                "sender_key": sender_key,
                "recipients": recipients,
                "amount_each": amount,
                "token_address": token,
            });
            let id = engine
                .submit("cli distribution", "distribution", job_config, priority)
                .await
                .map_err(|e| anyhow!(e))?;

            loop {
                match engine.progress(id).await {
                    Some(progress) if progress.is_done => {
                        println!(
                            "Job #{} {:?}: {}/{} done, {} failed",
                            id,
                            progress.state,
                            progress.done_count,
                            progress.total_count,
                            progress.failed_count
                        );
                        break;
                    }
                    Some(progress) => {
                        println!(
                            "Job #{}: {}/{} done, {} failed{}",
                            id,
                            progress.done_count,
                            progress.total_count,
                            progress.failed_count,
                            progress
                                .eta_secs
                                .map(|eta| format!(", ~{}s left", eta))
                                .unwrap_or_default()
                        );
                    }
                    None => break,
                }
                tokio::time::sleep(Duration::from_secs(2)).await;
            }

            engine.shutdown().await;
            Ok(())
        }
    }
}
