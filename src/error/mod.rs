// src/error/mod.rs
use log::{debug, error, info, warn};
use rand::Rng;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;

#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// Endpoint unreachable or client could not be constructed.
    #[error("Connectivity Error [{endpoint}]: {message}")]
    Connectivity { endpoint: String, message: String },

    /// Generic RPC failure from an otherwise reachable endpoint.
    #[error("RPC Error: {0}")]
    Rpc(String),

    /// Local and network nonce counters disagree; triggers resync.
    #[error("Nonce Drift: {0}")]
    NonceDrift(String),

    /// Confirmation was not observed within the bounded wait.
    #[error("Transaction Timeout: {hash} not confirmed within {waited_secs}s")]
    TransactionTimeout { hash: String, waited_secs: u64 },

    /// Transaction was mined but reverted on-chain.
    #[error("Transaction Reverted: {0}")]
    TransactionReverted(String),

    /// Sender balance cannot cover value + gas.
    #[error("Insufficient Funds: {0}")]
    InsufficientFunds(String),

    /// Unusable key or malformed job configuration; aborts the job.
    #[error("Fatal Config Error: {0}")]
    FatalConfig(String),

    /// Rate limiter could not grant a slot within its own timeout.
    #[error("Rate Limit Timeout: {0}")]
    RateLimitTimeout(String),

    /// Malformed data from the chain or an API response.
    #[error("Parse Error: {0}")]
    Parse(String),

    /// Job store rejected or lost a record.
    #[error("Store Error: {0}")]
    Store(String),

    /// Explorer API failure after key rotation was exhausted.
    #[error("Explorer Error: {0}")]
    Explorer(String),

    /// Submission named a mode outside the closed executor set.
    #[error("Unknown job mode: {0}")]
    UnknownJobMode(String),

    /// Signing failed before broadcast.
    #[error("Signing Error: {0}")]
    Signing(String),
}

impl From<serde_json::Error> for DispatchError {
    fn from(err: serde_json::Error) -> Self {
        DispatchError::Parse(format!("JSON error: {}", err))
    }
}

impl From<url::ParseError> for DispatchError {
    fn from(err: url::ParseError) -> Self {
        DispatchError::FatalConfig(format!("Invalid URL: {}", err))
    }
}

impl DispatchError {
    /// Whether the operation may succeed if tried again later.
    pub fn is_recoverable(&self) -> bool {
        match self {
            DispatchError::Connectivity { .. } => true,
            DispatchError::Rpc(_) => true,
            DispatchError::NonceDrift(_) => true, // resync self-heals
            DispatchError::TransactionTimeout { .. } => true,
            DispatchError::TransactionReverted(_) => false, // nonce consumed
            DispatchError::InsufficientFunds(_) => false,   // needs funding
            DispatchError::FatalConfig(_) => false,
            DispatchError::RateLimitTimeout(_) => true,
            DispatchError::Parse(_) => false,
            DispatchError::Store(_) => true,
            DispatchError::Explorer(_) => true,
            DispatchError::UnknownJobMode(_) => false,
            DispatchError::Signing(_) => false,
        }
    }

    /// Whether an immediate bounded retry is worthwhile. Only transient
    /// connectivity-class failures qualify; nonce and validation failures
    /// are never retried at this level.
    pub fn should_retry(&self) -> bool {
        matches!(
            self,
            DispatchError::Connectivity { .. } | DispatchError::Explorer(_)
        )
    }

    /// Whether this failure means the transaction was never accepted by the
    /// network, so its nonce ticket can be released for reuse.
    pub fn failed_before_broadcast(&self) -> bool {
        match self {
            DispatchError::Connectivity { .. } => true,
            DispatchError::NonceDrift(_) => true,
            DispatchError::InsufficientFunds(_) => true,
            DispatchError::Signing(_) => true,
            DispatchError::FatalConfig(_) => true,
            DispatchError::Rpc(_) => true, // rejected at submission, not mined
            _ => false,
        }
    }
}

/// Maps a raw provider error string into the taxonomy. RPC nodes disagree on
/// exact wording, so matching is substring-based and lowercased.
pub fn normalize_rpc_error(endpoint: &str, raw: &str) -> DispatchError {
    let msg = raw.to_lowercase();

    if msg.contains("nonce too low") || msg.contains("nonce too high") {
        DispatchError::NonceDrift(raw.to_string())
    } else if msg.contains("insufficient funds") {
        DispatchError::InsufficientFunds(raw.to_string())
    } else if msg.contains("underpriced") {
        DispatchError::Rpc(raw.to_string())
    } else if msg.contains("timeout") || msg.contains("timed out") {
        DispatchError::Connectivity {
            endpoint: endpoint.to_string(),
            message: raw.to_string(),
        }
    } else if msg.contains("connection") || msg.contains("connect") || msg.contains("dns") {
        DispatchError::Connectivity {
            endpoint: endpoint.to_string(),
            message: raw.to_string(),
        }
    } else {
        DispatchError::Rpc(raw.to_string())
    }
}

/// Retry policy with exponential backoff and jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Delay before the given attempt (attempt 0 runs immediately).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::from_millis(0);
        }

        let mut delay_ms = self
            .base_delay
            .as_millis()
            .saturating_mul(2_u128.pow(attempt - 1))
            .min(self.max_delay.as_millis()) as u64;
        if delay_ms > 0 {
            delay_ms += rand::thread_rng().gen_range(0..(delay_ms / 4).max(1));
        }

        let delay = Duration::from_millis(delay_ms.min(self.max_delay.as_millis() as u64));
        debug!("Retry attempt {}: delay = {:?}", attempt, delay);
        delay
    }

    /// Executes `operation` until it succeeds, returns a non-retryable error,
    /// or the attempts run out.
    pub async fn execute<F, T, Fut>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut last_error = None;

        for attempt in 0..self.max_attempts {
            if attempt > 0 {
                sleep(self.delay_for_attempt(attempt)).await;
            }

            match operation().await {
                Ok(result) => {
                    if attempt > 0 {
                        info!("Operation succeeded after {} retries", attempt);
                    }
                    return Ok(result);
                }
                Err(e) => {
                    if !e.should_retry() {
                        warn!("Non-retryable error on attempt {}: {}", attempt + 1, e);
                        return Err(e);
                    }
                    warn!("Attempt {} failed: {} (retrying...)", attempt + 1, e);
                    last_error = Some(e);
                }
            }
        }

        error!("All {} retry attempts failed", self.max_attempts);
        Err(last_error.unwrap_or_else(|| DispatchError::Rpc("max retries exceeded".to_string())))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(500), Duration::from_secs(8))
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn normalize_classifies_nonce_and_funds() {
        assert!(matches!(
            normalize_rpc_error("http://x", "nonce too low: next 7, got 5"),
            DispatchError::NonceDrift(_)
        ));
        assert!(matches!(
            normalize_rpc_error("http://x", "insufficient funds for gas * price + value"),
            DispatchError::InsufficientFunds(_)
        ));
        assert!(matches!(
            normalize_rpc_error("http://x", "error sending request: connection refused"),
            DispatchError::Connectivity { .. }
        ));
    }

    #[test]
    fn broadcast_flag_rule() {
        let conn = DispatchError::Connectivity {
            endpoint: "http://x".into(),
            message: "refused".into(),
        };
        assert!(conn.failed_before_broadcast());
        let timeout = DispatchError::TransactionTimeout {
            hash: "0xabc".into(),
            waited_secs: 45,
        };
        assert!(!timeout.failed_before_broadcast());
        assert!(!DispatchError::TransactionReverted("0xabc".into()).failed_before_broadcast());
    }

    #[tokio::test]
    async fn retry_stops_on_non_retryable() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(2));
        let calls = AtomicU32::new(0);
        let result: Result<()> = policy
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(DispatchError::FatalConfig("bad key".into())) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_exhausts_attempts_on_connectivity() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(2));
        let calls = AtomicU32::new(0);
        let result: Result<()> = policy
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(DispatchError::Connectivity {
                        endpoint: "http://x".into(),
                        message: "refused".into(),
                    })
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
