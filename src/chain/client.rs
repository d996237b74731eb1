// src/chain/client.rs
use crate::error::{normalize_rpc_error, DispatchError, Result};
use async_trait::async_trait;
use ethers::providers::{Http, Middleware, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, BlockId, BlockNumber, Bytes, TransactionReceipt, H256, U256};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// The node operations the dispatch core consumes. Everything else a node
/// offers is out of scope; keeping the surface narrow lets tests substitute
/// a scripted implementation.
#[async_trait]
pub trait ChainClient: Send + Sync {
    fn endpoint(&self) -> &str;

    /// Latest block number; doubles as the health probe.
    async fn latest_block(&self) -> Result<u64>;

    /// Pending-inclusive transaction count for an account.
    async fn transaction_count(&self, account: Address) -> Result<u64>;

    async fn gas_price(&self) -> Result<U256>;

    async fn estimate_gas(&self, tx: &TypedTransaction) -> Result<U256>;

    async fn call(&self, tx: &TypedTransaction) -> Result<Bytes>;

    async fn send_raw_transaction(&self, rlp: Bytes) -> Result<H256>;

    async fn transaction_receipt(&self, hash: H256) -> Result<Option<TransactionReceipt>>;
}

/// Builds a client for an endpoint URL. The pool calls this lazily so a bad
/// URL only costs its own probe, and tests can inject scripted clients.
pub trait ClientFactory: Send + Sync {
    fn create(&self, url: &str) -> Result<Arc<dyn ChainClient>>;
}

/// `ChainClient` over an ethers JSON-RPC HTTP provider.
///
/// Construction applies the chain-specific transport settings BSC needs: a
/// bounded request timeout on the shared HTTP client and a polling interval
/// matched to the ~3s block time.
pub struct EvmChainClient {
    url: String,
    chain_id: u64,
    provider: Provider<Http>,
}

impl EvmChainClient {
    pub fn connect(url: &str, chain_id: u64, request_timeout: Duration) -> Result<Self> {
        let parsed = Url::parse(url).map_err(|e| DispatchError::Connectivity {
            endpoint: url.to_string(),
            message: format!("invalid endpoint URL: {}", e),
        })?;

        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| DispatchError::Connectivity {
                endpoint: url.to_string(),
                message: format!("HTTP client build failed: {}", e),
            })?;

        let provider =
            Provider::new(Http::new_with_client(parsed, http)).interval(Duration::from_millis(3000));

        Ok(Self {
            url: url.to_string(),
            chain_id,
            provider,
        })
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn map_err(&self, e: impl std::fmt::Display) -> DispatchError {
        normalize_rpc_error(&self.url, &e.to_string())
    }
}

#[async_trait]
impl ChainClient for EvmChainClient {
    fn endpoint(&self) -> &str {
        &self.url
    }

    async fn latest_block(&self) -> Result<u64> {
        let block = self
            .provider
            .get_block_number()
            .await
            .map_err(|e| self.map_err(e))?;
        Ok(block.as_u64())
    }

    async fn transaction_count(&self, account: Address) -> Result<u64> {
        let count = self
            .provider
            .get_transaction_count(account, Some(BlockId::Number(BlockNumber::Pending)))
            .await
            .map_err(|e| self.map_err(e))?;
        Ok(count.as_u64())
    }

    async fn gas_price(&self) -> Result<U256> {
        self.provider
            .get_gas_price()
            .await
            .map_err(|e| self.map_err(e))
    }

    async fn estimate_gas(&self, tx: &TypedTransaction) -> Result<U256> {
        self.provider
            .estimate_gas(tx, None)
            .await
            .map_err(|e| self.map_err(e))
    }

    async fn call(&self, tx: &TypedTransaction) -> Result<Bytes> {
        self.provider.call(tx, None).await.map_err(|e| self.map_err(e))
    }

    async fn send_raw_transaction(&self, rlp: Bytes) -> Result<H256> {
        let pending = self
            .provider
            .send_raw_transaction(rlp)
            .await
            .map_err(|e| self.map_err(e))?;
        Ok(pending.tx_hash())
    }

    async fn transaction_receipt(&self, hash: H256) -> Result<Option<TransactionReceipt>> {
        self.provider
            .get_transaction_receipt(hash)
            .await
            .map_err(|e| self.map_err(e))
    }
}

/// Production factory producing [`EvmChainClient`]s.
pub struct EvmClientFactory {
    chain_id: u64,
    request_timeout: Duration,
}

impl EvmClientFactory {
    pub fn new(chain_id: u64, request_timeout: Duration) -> Self {
        Self {
            chain_id,
            request_timeout,
        }
    }
}

impl ClientFactory for EvmClientFactory {
    fn create(&self, url: &str) -> Result<Arc<dyn ChainClient>> {
        let client = EvmChainClient::connect(url, self.chain_id, self.request_timeout)?;
        Ok(Arc::new(client))
    }
}
