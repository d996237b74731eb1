use std::env;

/// BSC mainnet public endpoints, used when RPC_URLS is not set.
const DEFAULT_RPC_URLS: [&str; 5] = [
    "https://bsc-dataseed.binance.org/",
    "https://bsc-dataseed1.defibit.io/",
    "https://bsc-dataseed1.ninicoin.io/",
    "https://bsc-dataseed2.defibit.io/",
    "https://bsc-dataseed3.defibit.io/",
];

#[derive(Debug, Clone)]
pub struct Config {
    pub rpc_urls: Vec<String>,
    pub chain_id: u64,
    pub connection_timeout_secs: u64,
    pub endpoint_freshness_secs: u64,
    pub probe_timeout_secs: u64,
    pub nonce_resync_secs: u64,
    pub max_pending_per_account: usize,
    pub rate_max_rps: u32,
    pub rate_burst: u32,
    pub gas_price_gwei: Option<f64>,
    pub gas_limit: Option<u64>,
    pub confirm_timeout_secs: u64,
    pub receipt_poll_secs: u64,
    pub broadcast_max_retries: u32,
    pub broadcast_retry_delay_ms: u64,
    pub max_concurrent_jobs: usize,
    pub unit_interval_secs: u64,
    pub control_poll_secs: u64,
    pub explorer_url: String,
    pub explorer_api_keys: Vec<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Config {
            rpc_urls: env::var("RPC_URLS")
                .map(|s| {
                    s.split(',')
                        .map(|p| p.trim().to_string())
                        .filter(|p| !p.is_empty())
                        .collect()
                })
                .unwrap_or_else(|_| DEFAULT_RPC_URLS.iter().map(|s| s.to_string()).collect()),
            chain_id: env::var("CHAIN_ID")
                .unwrap_or_else(|_| "56".to_string())
                .parse()
                .unwrap_or(56),
            connection_timeout_secs: env::var("CONNECTION_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .unwrap_or(30),
            endpoint_freshness_secs: env::var("ENDPOINT_FRESHNESS_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .unwrap_or(30),
            probe_timeout_secs: env::var("PROBE_TIMEOUT_SECS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .unwrap_or(10),
            nonce_resync_secs: env::var("NONCE_RESYNC_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .unwrap_or(30),
            max_pending_per_account: env::var("MAX_PENDING_PER_ACCOUNT")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .unwrap_or(20),
            rate_max_rps: env::var("RATE_MAX_RPS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .unwrap_or(5),
            rate_burst: env::var("RATE_BURST")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .unwrap_or(10),
            gas_price_gwei: env::var("GAS_PRICE_GWEI").ok().and_then(|v| v.parse().ok()),
            gas_limit: env::var("GAS_LIMIT").ok().and_then(|v| v.parse().ok()),
            confirm_timeout_secs: env::var("CONFIRM_TIMEOUT_SECS")
                .unwrap_or_else(|_| "45".to_string())
                .parse()
                .unwrap_or(45),
            receipt_poll_secs: env::var("RECEIPT_POLL_SECS")
                .unwrap_or_else(|_| "3".to_string())
                .parse()
                .unwrap_or(3),
            broadcast_max_retries: env::var("BROADCAST_MAX_RETRIES")
                .unwrap_or_else(|_| "3".to_string())
                .parse()
                .unwrap_or(3),
            broadcast_retry_delay_ms: env::var("BROADCAST_RETRY_DELAY_MS")
                .unwrap_or_else(|_| "500".to_string())
                .parse()
                .unwrap_or(500),
            max_concurrent_jobs: env::var("MAX_CONCURRENT_JOBS")
                .unwrap_or_else(|_| "3".to_string())
                .parse()
                .unwrap_or(3),
            unit_interval_secs: env::var("UNIT_INTERVAL_SECS")
                .unwrap_or_else(|_| "1".to_string())
                .parse()
                .unwrap_or(1),
            control_poll_secs: env::var("CONTROL_POLL_SECS")
                .unwrap_or_else(|_| "1".to_string())
                .parse()
                .unwrap_or(1),
            explorer_url: env::var("EXPLORER_URL")
                .unwrap_or_else(|_| "https://api.bscscan.com/api".to_string()),
            explorer_api_keys: env::var("EXPLORER_API_KEYS")
                .map(|s| {
                    s.split(',')
                        .map(|p| p.trim().to_string())
                        .filter(|p| !p.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
        }
    }

    pub fn validate_and_log(&self) {
        log::info!(
            "Configuration loaded: {} endpoints, chain id {}, {} concurrent jobs",
            self.rpc_urls.len(),
            self.chain_id,
            self.max_concurrent_jobs
        );
        log::debug!("Full configuration: {:?}", self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_bsc_mainnet() {
        let config = Config::from_env();
        assert!(!config.rpc_urls.is_empty());
        assert!(config.probe_timeout_secs > 0);
        assert!(config.confirm_timeout_secs > 0);
    }
}
