//! Explorer API client (BscScan-style).
//!
//! Consumed only for the balance and price lookups feeding executor decision
//! logic. Every call flows through the shared rate limiter under the active
//! API key's resource name; repeated failures rotate to the next key.

use crate::error::{DispatchError, Result};
use crate::limiter::ApiRateLimiter;
use ethers::types::{Address, U256};
use log::{debug, warn};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const ROTATE_AFTER_FAILURES: u32 = 3;

pub struct ExplorerClient {
    http: reqwest::Client,
    base_url: String,
    api_keys: Vec<String>,
    current_key: AtomicUsize,
    consecutive_failures: AtomicU32,
    limiter: Arc<ApiRateLimiter>,
}

impl ExplorerClient {
    pub fn new(base_url: String, api_keys: Vec<String>, limiter: Arc<ApiRateLimiter>) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            base_url,
            api_keys,
            current_key: AtomicUsize::new(0),
            consecutive_failures: AtomicU32::new(0),
            limiter,
        }
    }

    /// ERC-20 balance of `holder` as reported by the explorer.
    pub async fn token_balance(&self, token: Address, holder: Address) -> Result<U256> {
        let result = self
            .request(vec![
                ("module", "account".to_string()),
                ("action", "tokenbalance".to_string()),
                ("contractaddress", format!("{:#x}", token)),
                ("address", format!("{:#x}", holder)),
                ("tag", "latest".to_string()),
            ])
            .await?;
        U256::from_dec_str(result.trim())
            .map_err(|e| DispatchError::Parse(format!("bad tokenbalance '{}': {}", result, e)))
    }

    /// Current BNB/USD quote.
    pub async fn bnb_price_usd(&self) -> Result<f64> {
        self.limiter.acquire(&self.resource_key()).await?;
        let response = self
            .http
            .get(&self.base_url)
            .query(&self.with_key(vec![
                ("module", "stats".to_string()),
                ("action", "bnbprice".to_string()),
            ]))
            .send()
            .await
            .map_err(|e| self.note_failure(format!("bnbprice request failed: {}", e)))?;
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| self.note_failure(format!("bnbprice bad body: {}", e)))?;

        let price = body
            .get("result")
            .and_then(|r| r.get("ethusd"))
            .and_then(|p| p.as_str())
            .and_then(|p| p.parse::<f64>().ok())
            .ok_or_else(|| self.note_failure(format!("bnbprice missing ethusd: {}", body)))?;
        self.note_success();
        Ok(price)
    }

    async fn request(&self, params: Vec<(&'static str, String)>) -> Result<String> {
        self.limiter.acquire(&self.resource_key()).await?;

        let response = self
            .http
            .get(&self.base_url)
            .query(&self.with_key(params))
            .send()
            .await
            .map_err(|e| self.note_failure(format!("explorer request failed: {}", e)))?;
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| self.note_failure(format!("explorer bad body: {}", e)))?;

        let status = body.get("status").and_then(|s| s.as_str()).unwrap_or("0");
        if status != "1" {
            let message = body
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("NOTOK");
            return Err(self.note_failure(format!("explorer rejected call: {}", message)));
        }

        let result = body
            .get("result")
            .and_then(|r| r.as_str())
            .map(str::to_string)
            .ok_or_else(|| self.note_failure("explorer result missing".to_string()))?;
        self.note_success();
        Ok(result)
    }

    fn with_key(&self, mut params: Vec<(&'static str, String)>) -> Vec<(&'static str, String)> {
        if let Some(key) = self.active_key() {
            params.push(("apikey", key));
        }
        params
    }

    fn active_key(&self) -> Option<String> {
        if self.api_keys.is_empty() {
            return None;
        }
        let idx = self.current_key.load(Ordering::Relaxed) % self.api_keys.len();
        Some(self.api_keys[idx].clone())
    }

    /// Resource key for the rate limiter: each API key is its own resource.
    fn resource_key(&self) -> String {
        let idx = if self.api_keys.is_empty() {
            0
        } else {
            self.current_key.load(Ordering::Relaxed) % self.api_keys.len()
        };
        format!("explorer:key{}", idx)
    }

    fn note_failure(&self, message: String) -> DispatchError {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= ROTATE_AFTER_FAILURES && self.api_keys.len() > 1 {
            let next = self.current_key.fetch_add(1, Ordering::Relaxed) + 1;
            self.consecutive_failures.store(0, Ordering::Relaxed);
            warn!(
                "Explorer key rotated after {} failures (now key index {})",
                failures,
                next % self.api_keys.len()
            );
        }
        DispatchError::Explorer(message)
    }

    fn note_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        debug!("Explorer call succeeded via {}", self.resource_key());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_with_keys(keys: &[&str]) -> ExplorerClient {
        ExplorerClient::new(
            "https://api.bscscan.com/api".to_string(),
            keys.iter().map(|s| s.to_string()).collect(),
            Arc::new(ApiRateLimiter::new(100, 100)),
        )
    }

    #[test]
    fn rotates_key_after_repeated_failures() {
        let client = client_with_keys(&["k1", "k2"]);
        assert_eq!(client.active_key().as_deref(), Some("k1"));

        client.note_failure("boom".to_string());
        client.note_failure("boom".to_string());
        assert_eq!(client.active_key().as_deref(), Some("k1"));

        client.note_failure("boom".to_string());
        assert_eq!(client.active_key().as_deref(), Some("k2"));
    }

    #[test]
    fn success_resets_failure_streak() {
        let client = client_with_keys(&["k1", "k2"]);
        client.note_failure("boom".to_string());
        client.note_failure("boom".to_string());
        client.note_success();
        client.note_failure("boom".to_string());
        assert_eq!(client.active_key().as_deref(), Some("k1"));
    }

    #[test]
    fn keyless_operation_is_allowed() {
        let client = client_with_keys(&[]);
        assert_eq!(client.active_key(), None);
        assert_eq!(client.resource_key(), "explorer:key0");
    }
}
