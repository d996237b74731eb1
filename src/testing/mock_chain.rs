// src/testing/mock_chain.rs
use crate::chain::{ChainClient, ClientFactory, EndpointPool};
use crate::error::{DispatchError, Result, RetryPolicy};
use crate::limiter::ApiRateLimiter;
use crate::nonce::NonceAuthority;
use crate::pipeline::TransactionPipeline;
use async_trait::async_trait;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, TransactionReceipt, H256, U256, U64};
use ethers::utils::keccak256;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Well-known throwaway key for offline signing in tests.
pub const TEST_PRIVATE_KEY: &str =
    "4c0883a69102937d6231471b5dbb6204fe51296170827936ea5cce4b76994b0f";

/// What happens to receipts for transactions sent through the mock.
#[derive(Debug, Clone, Copy)]
pub enum ReceiptBehavior {
    /// Receipt with status 1 after the given number of polls.
    SuccessAfter(u32),
    /// Receipt with status 0 after the given number of polls.
    RevertAfter(u32),
    /// No receipt, ever: the confirmation wait must time out.
    Never,
}

struct MockState {
    endpoint: String,
    block: AtomicU64,
    transaction_count: AtomicU64,
    gas_price_wei: AtomicU64,
    probe_failures: AtomicUsize,
    probe_count: AtomicUsize,
    send_failures: AtomicUsize,
    call_responses: Mutex<HashMap<[u8; 4], Bytes>>,
    receipt_behavior: Mutex<ReceiptBehavior>,
    receipts: Mutex<HashMap<H256, (ReceiptBehavior, u32)>>,
    sent: Mutex<Vec<Bytes>>,
    estimated_calldata: Mutex<Vec<Bytes>>,
}

/// Scripted `ChainClient`. Cloning shares the underlying state, so a test
/// can keep a handle while the pool owns another.
#[derive(Clone)]
pub struct MockChainClient {
    state: Arc<MockState>,
}

impl MockChainClient {
    pub fn new(endpoint: &str) -> Self {
        Self {
            state: Arc::new(MockState {
                endpoint: endpoint.to_string(),
                block: AtomicU64::new(1_000_000),
                transaction_count: AtomicU64::new(0),
                gas_price_wei: AtomicU64::new(5_000_000_000),
                probe_failures: AtomicUsize::new(0),
                probe_count: AtomicUsize::new(0),
                send_failures: AtomicUsize::new(0),
                call_responses: Mutex::new(HashMap::new()),
                receipt_behavior: Mutex::new(ReceiptBehavior::SuccessAfter(0)),
                receipts: Mutex::new(HashMap::new()),
                sent: Mutex::new(Vec::new()),
                estimated_calldata: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Fail this many probes before recovering; `usize::MAX` fails forever.
    pub fn with_probe_failures(self, count: usize) -> Self {
        self.state.probe_failures.store(count, Ordering::SeqCst);
        self
    }

    /// Fail this many broadcasts with a connectivity error.
    pub fn with_send_failures(self, count: usize) -> Self {
        self.state.send_failures.store(count, Ordering::SeqCst);
        self
    }

    pub fn with_transaction_count(self, count: u64) -> Self {
        self.state.transaction_count.store(count, Ordering::SeqCst);
        self
    }

    pub fn with_gas_price(self, wei: u64) -> Self {
        self.state.gas_price_wei.store(wei, Ordering::SeqCst);
        self
    }

    pub fn with_call_response(self, selector: [u8; 4], response: Bytes) -> Self {
        self.state
            .call_responses
            .lock()
            .unwrap()
            .insert(selector, response);
        self
    }

    pub fn with_receipt_behavior(self, behavior: ReceiptBehavior) -> Self {
        *self.state.receipt_behavior.lock().unwrap() = behavior;
        self
    }

    pub fn set_transaction_count(&self, count: u64) {
        self.state.transaction_count.store(count, Ordering::SeqCst);
    }

    pub fn probe_count(&self) -> usize {
        self.state.probe_count.load(Ordering::SeqCst)
    }

    pub fn sent_transactions(&self) -> Vec<Bytes> {
        self.state.sent.lock().unwrap().clone()
    }

    /// Calldata of every transaction that reached gas estimation, in order.
    pub fn estimated_calldata(&self) -> Vec<Bytes> {
        self.state.estimated_calldata.lock().unwrap().clone()
    }

    pub fn endpoint_url(&self) -> String {
        self.state.endpoint.clone()
    }

    fn connectivity(&self, message: &str) -> DispatchError {
        DispatchError::Connectivity {
            endpoint: self.state.endpoint.clone(),
            message: message.to_string(),
        }
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    fn endpoint(&self) -> &str {
        &self.state.endpoint
    }

    async fn latest_block(&self) -> Result<u64> {
        self.state.probe_count.fetch_add(1, Ordering::SeqCst);
        let remaining = self.state.probe_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            if remaining != usize::MAX {
                self.state.probe_failures.fetch_sub(1, Ordering::SeqCst);
            }
            return Err(self.connectivity("probe refused"));
        }
        Ok(self.state.block.load(Ordering::SeqCst))
    }

    async fn transaction_count(&self, _account: Address) -> Result<u64> {
        Ok(self.state.transaction_count.load(Ordering::SeqCst))
    }

    async fn gas_price(&self) -> Result<U256> {
        Ok(U256::from(self.state.gas_price_wei.load(Ordering::SeqCst)))
    }

    async fn estimate_gas(&self, tx: &TypedTransaction) -> Result<U256> {
        if let Some(data) = tx.data() {
            self.state
                .estimated_calldata
                .lock()
                .unwrap()
                .push(data.clone());
        }
        Ok(U256::from(60_000u64))
    }

    async fn call(&self, tx: &TypedTransaction) -> Result<Bytes> {
        let data = tx.data().cloned().unwrap_or_default();
        if data.len() < 4 {
            return Err(DispatchError::Rpc("call without selector".to_string()));
        }
        let mut selector = [0u8; 4];
        selector.copy_from_slice(&data[..4]);
        self.state
            .call_responses
            .lock()
            .unwrap()
            .get(&selector)
            .cloned()
            .ok_or_else(|| {
                DispatchError::Rpc(format!("no scripted response for selector {:02x?}", selector))
            })
    }

    async fn send_raw_transaction(&self, rlp: Bytes) -> Result<H256> {
        let remaining = self.state.send_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            if remaining != usize::MAX {
                self.state.send_failures.fetch_sub(1, Ordering::SeqCst);
            }
            return Err(self.connectivity("connection refused during broadcast"));
        }

        let hash = H256::from(keccak256(&rlp));
        self.state.sent.lock().unwrap().push(rlp);
        let behavior = *self.state.receipt_behavior.lock().unwrap();
        self.state
            .receipts
            .lock()
            .unwrap()
            .insert(hash, (behavior, 0));
        // Mimic the pending count a live node would report.
        self.state.transaction_count.fetch_add(1, Ordering::SeqCst);
        Ok(hash)
    }

    async fn transaction_receipt(&self, hash: H256) -> Result<Option<TransactionReceipt>> {
        let mut receipts = self.state.receipts.lock().unwrap();
        let Some((behavior, polls)) = receipts.get_mut(&hash) else {
            return Ok(None);
        };
        *polls += 1;
        let status = match behavior {
            ReceiptBehavior::SuccessAfter(n) => {
                if *polls > *n {
                    Some(1u64)
                } else {
                    None
                }
            }
            ReceiptBehavior::RevertAfter(n) => {
                if *polls > *n {
                    Some(0u64)
                } else {
                    None
                }
            }
            ReceiptBehavior::Never => None,
        };
        Ok(status.map(|s| TransactionReceipt {
            transaction_hash: hash,
            status: Some(U64::from(s)),
            ..Default::default()
        }))
    }
}

/// `ClientFactory` serving registered mocks; unknown URLs get a fresh
/// default mock so pool tests can stay terse.
pub struct MockChainFactory {
    clients: Mutex<HashMap<String, MockChainClient>>,
}

impl MockChainFactory {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, url: &str, client: MockChainClient) {
        self.clients.lock().unwrap().insert(url.to_string(), client);
    }
}

impl ClientFactory for MockChainFactory {
    fn create(&self, url: &str) -> Result<Arc<dyn ChainClient>> {
        let mut clients = self.clients.lock().unwrap();
        let client = clients
            .entry(url.to_string())
            .or_insert_with(|| MockChainClient::new(url))
            .clone();
        Ok(Arc::new(client))
    }
}

/// Single-endpoint pool backed by the given mock.
pub fn mock_pool(client: MockChainClient) -> EndpointPool {
    let url = client.endpoint_url();
    let factory = MockChainFactory::new();
    factory.register(&url, client);
    EndpointPool::new(
        vec![url],
        Arc::new(factory),
        Duration::from_secs(60),
        Duration::from_secs(2),
    )
}

/// Full pipeline over a mock chain, tuned for fast tests: tight receipt
/// polling and a sub-second confirmation timeout.
pub fn mock_pipeline(client: MockChainClient) -> TransactionPipeline {
    let pool = Arc::new(mock_pool(client));
    let nonce = Arc::new(NonceAuthority::new(
        pool.clone(),
        Duration::from_secs(3600),
        20,
    ));
    let limiter = Arc::new(ApiRateLimiter::new(1000, 1000));
    TransactionPipeline::new(
        pool,
        nonce,
        limiter,
        56,
        Duration::from_millis(400),
        Duration::from_millis(20),
        RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(4)),
        None,
    )
}
