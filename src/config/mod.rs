pub mod settings;

pub use settings::Config;

use crate::error::DispatchError;
use std::sync::Arc;
use url::Url;

/// Loads the application configuration as an `Arc<Config>`, validating the
/// fields the dispatch core cannot run without.
pub fn load_config() -> Result<Arc<Config>, DispatchError> {
    dotenv::dotenv().ok();

    let config = Config::from_env();

    if config.rpc_urls.is_empty() {
        return Err(DispatchError::FatalConfig(
            "RPC_URLS cannot be empty".to_string(),
        ));
    }
    for raw in &config.rpc_urls {
        Url::parse(raw).map_err(|e| {
            DispatchError::FatalConfig(format!("Invalid RPC URL '{}': {}", raw, e))
        })?;
    }
    if config.chain_id == 0 {
        return Err(DispatchError::FatalConfig(
            "CHAIN_ID cannot be zero".to_string(),
        ));
    }
    if config.max_concurrent_jobs == 0 {
        return Err(DispatchError::FatalConfig(
            "MAX_CONCURRENT_JOBS must be at least 1".to_string(),
        ));
    }

    config.validate_and_log();
    Ok(Arc::new(config))
}
