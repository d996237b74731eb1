//! Shared build → sign → broadcast → confirm pipeline.
//!
//! Every executor funnels its units through [`TransactionPipeline::send`],
//! which is the single place the nonce resolution rule is applied: a failure
//! before the network accepted the transaction releases the ticket
//! (`broadcast = false`); anything after acceptance consumes it.

use crate::chain::{ChainClient, EndpointPool};
use crate::error::{DispatchError, Result, RetryPolicy};
use crate::limiter::ApiRateLimiter;
use crate::nonce::NonceAuthority;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, TransactionReceipt, TransactionRequest, H256, U256, U64};
use ethers::utils::parse_units;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;

const DEFAULT_TRANSFER_GAS: u64 = 21_000;
const DEFAULT_CONTRACT_GAS: u64 = 100_000;

/// Fee rule for one send: an explicit operator override, or whatever the
/// network currently suggests.
#[derive(Debug, Clone)]
pub enum GasPolicy {
    NetworkSuggested,
    FixedGwei(f64),
}

impl GasPolicy {
    pub fn from_override(gwei: Option<f64>) -> Self {
        match gwei {
            Some(v) => GasPolicy::FixedGwei(v),
            None => GasPolicy::NetworkSuggested,
        }
    }

    async fn resolve(&self, client: &dyn ChainClient) -> Result<U256> {
        match self {
            GasPolicy::FixedGwei(gwei) => {
                let parsed = parse_units(gwei.to_string(), "gwei").map_err(|e| {
                    DispatchError::FatalConfig(format!("bad gas price override {}: {}", gwei, e))
                })?;
                Ok(parsed.into())
            }
            GasPolicy::NetworkSuggested => client.gas_price().await,
        }
    }
}

/// One transaction to dispatch: target, attached value, optional calldata.
#[derive(Debug, Clone)]
pub struct CallSpec {
    pub to: Address,
    pub value: U256,
    pub data: Option<Bytes>,
    pub gas_limit: Option<u64>,
}

impl CallSpec {
    pub fn native_transfer(to: Address, amount_wei: U256) -> Self {
        Self {
            to,
            value: amount_wei,
            data: None,
            gas_limit: None,
        }
    }

    pub fn contract_call(to: Address, data: Bytes) -> Self {
        Self {
            to,
            value: U256::zero(),
            data: Some(data),
            gas_limit: None,
        }
    }

    pub fn with_value(mut self, value: U256) -> Self {
        self.value = value;
        self
    }

    pub fn with_gas_limit(mut self, gas: u64) -> Self {
        self.gas_limit = Some(gas);
        self
    }
}

/// A sending account: parsed key plus cached address.
#[derive(Debug, Clone)]
pub struct SenderAccount {
    wallet: LocalWallet,
    address: Address,
}

impl SenderAccount {
    /// Parses a hex private key. An unusable key is a configuration-class
    /// failure: the job must abort before its first unit.
    pub fn from_private_key(key: &str, chain_id: u64) -> Result<Self> {
        let trimmed = key.trim().trim_start_matches("0x");
        let wallet: LocalWallet = trimmed
            .parse()
            .map_err(|e| DispatchError::FatalConfig(format!("unusable signing key: {}", e)))?;
        let wallet = wallet.with_chain_id(chain_id);
        let address = wallet.address();
        Ok(Self { wallet, address })
    }

    pub fn address(&self) -> Address {
        self.address
    }
}

/// Outcome classification plumbing for a single dispatched transaction.
pub struct TransactionPipeline {
    pool: Arc<EndpointPool>,
    nonce: Arc<NonceAuthority>,
    limiter: Arc<ApiRateLimiter>,
    chain_id: u64,
    confirm_timeout: Duration,
    receipt_poll: Duration,
    retry: RetryPolicy,
    gas_limit_override: Option<u64>,
}

impl TransactionPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: Arc<EndpointPool>,
        nonce: Arc<NonceAuthority>,
        limiter: Arc<ApiRateLimiter>,
        chain_id: u64,
        confirm_timeout: Duration,
        receipt_poll: Duration,
        retry: RetryPolicy,
        gas_limit_override: Option<u64>,
    ) -> Self {
        Self {
            pool,
            nonce,
            limiter,
            chain_id,
            confirm_timeout,
            receipt_poll,
            retry,
            gas_limit_override,
        }
    }

    pub fn nonce_authority(&self) -> Arc<NonceAuthority> {
        self.nonce.clone()
    }

    /// Builds, signs, broadcasts and confirms one transaction. Returns the
    /// hash on confirmed success; the error kind tells the caller whether
    /// the unit may be retried. The nonce ticket is always resolved before
    /// this returns, whatever the exit path.
    pub async fn send(
        &self,
        sender: &SenderAccount,
        spec: CallSpec,
        gas_policy: &GasPolicy,
    ) -> Result<H256> {
        let client = self.pool.get_connection().await?;
        let rpc_key = format!("rpc:{}", client.endpoint());

        self.limiter.acquire(&rpc_key).await?;
        let gas_price = gas_policy.resolve(client.as_ref()).await?;

        let ticket = self.nonce.reserve(sender.address()).await?;
        let nonce_value = ticket.value;

        let is_contract_call = spec.data.is_some();
        let mut request = TransactionRequest::new()
            .from(sender.address())
            .to(spec.to)
            .value(spec.value)
            .gas_price(gas_price)
            .nonce(nonce_value)
            .chain_id(self.chain_id);
        if let Some(data) = spec.data.clone() {
            request = request.data(data);
        }
        let mut tx: TypedTransaction = request.into();

        let gas_limit = match spec.gas_limit.or(self.gas_limit_override) {
            Some(g) => U256::from(g),
            None => {
                self.estimate_gas_safely(client.as_ref(), &rpc_key, &tx, is_contract_call)
                    .await
            }
        };
        tx.set_gas(gas_limit);

        let signature = match self.sign(sender, &tx).await {
            Ok(sig) => sig,
            Err(e) => {
                self.nonce.fail(ticket, false, &e.to_string()).await;
                return Err(e);
            }
        };
        let raw = tx.rlp_signed(&signature);

        let hash = match self.broadcast(client.clone(), &rpc_key, raw).await {
            Ok(hash) => hash,
            Err(e) => {
                if matches!(e, DispatchError::Connectivity { .. }) {
                    self.pool.report_failure(client.endpoint()).await;
                }
                let accepted = !e.failed_before_broadcast();
                self.nonce.fail(ticket, accepted, &e.to_string()).await;
                return Err(e);
            }
        };

        debug!(
            "Broadcast tx {:#x} from {:?} (nonce {}, gas price {})",
            hash,
            sender.address(),
            nonce_value,
            gas_price
        );

        match self.await_receipt(client, &rpc_key, hash).await {
            Ok(receipt) => {
                if receipt.status == Some(U64::from(1)) {
                    self.nonce.complete(ticket).await;
                    info!("✅ Confirmed tx {:#x} (nonce {})", hash, nonce_value);
                    Ok(hash)
                } else {
                    let err = DispatchError::TransactionReverted(format!("{:#x}", hash));
                    self.nonce.fail(ticket, true, &err.to_string()).await;
                    Err(err)
                }
            }
            Err(e) => {
                // Confirmation never observed: the network may still mine
                // it, so the value stays consumed.
                self.nonce.fail(ticket, true, &e.to_string()).await;
                Err(e)
            }
        }
    }

    async fn sign(
        &self,
        sender: &SenderAccount,
        tx: &TypedTransaction,
    ) -> Result<ethers::types::Signature> {
        sender
            .wallet
            .sign_transaction(tx)
            .await
            .map_err(|e| DispatchError::Signing(e.to_string()))
    }

    /// Estimates gas with a 20% safety margin, falling back to conservative
    /// defaults when estimation itself fails.
    async fn estimate_gas_safely(
        &self,
        client: &dyn ChainClient,
        rpc_key: &str,
        tx: &TypedTransaction,
        is_contract_call: bool,
    ) -> U256 {
        let _ = self.limiter.acquire(rpc_key).await;
        match client.estimate_gas(tx).await {
            Ok(estimate) => estimate * U256::from(120u64) / U256::from(100u64),
            Err(e) => {
                let fallback = if is_contract_call {
                    DEFAULT_CONTRACT_GAS
                } else {
                    DEFAULT_TRANSFER_GAS
                };
                warn!("Gas estimation failed ({}); using default {}", e, fallback);
                U256::from(fallback)
            }
        }
    }

    /// Broadcasts under the rate limiter with a bounded retry that covers
    /// transient connectivity errors only.
    async fn broadcast(
        &self,
        client: Arc<dyn ChainClient>,
        rpc_key: &str,
        raw: Bytes,
    ) -> Result<H256> {
        self.retry
            .execute(|| {
                let client = client.clone();
                let raw = raw.clone();
                let rpc_key = rpc_key.to_string();
                async move {
                    self.limiter.acquire(&rpc_key).await?;
                    client.send_raw_transaction(raw).await
                }
            })
            .await
    }

    /// Polls for the receipt until the bounded confirmation timeout. No lock
    /// is held while waiting.
    async fn await_receipt(
        &self,
        client: Arc<dyn ChainClient>,
        rpc_key: &str,
        hash: H256,
    ) -> Result<TransactionReceipt> {
        let started = Instant::now();
        let deadline = started + self.confirm_timeout;

        loop {
            self.limiter.acquire(rpc_key).await?;
            match client.transaction_receipt(hash).await {
                Ok(Some(receipt)) => return Ok(receipt),
                Ok(None) => {}
                Err(e) => {
                    // A flaky poll is not a verdict; keep waiting.
                    warn!("Receipt poll failed for {:#x}: {}", hash, e);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(DispatchError::TransactionTimeout {
                    hash: format!("{:#x}", hash),
                    waited_secs: started.elapsed().as_secs(),
                });
            }
            sleep(self.receipt_poll.min(deadline - now)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{mock_pipeline, MockChainClient, ReceiptBehavior, TEST_PRIVATE_KEY};
    use pretty_assertions::assert_eq;

    fn recipient() -> Address {
        Address::from_low_u64_be(0xfeed)
    }

    #[tokio::test]
    async fn success_completes_ticket() {
        let client = MockChainClient::new("http://a").with_transaction_count(3);
        let pipeline = mock_pipeline(client.clone());
        let sender = SenderAccount::from_private_key(TEST_PRIVATE_KEY, 56).unwrap();

        let hash = pipeline
            .send(
                &sender,
                CallSpec::native_transfer(recipient(), U256::from(1000u64)),
                &GasPolicy::NetworkSuggested,
            )
            .await
            .unwrap();
        assert_ne!(hash, H256::zero());

        let stats = pipeline.nonce_authority().stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(pipeline.nonce_authority().pending_total().await, 0);
    }

    #[tokio::test]
    async fn revert_consumes_nonce() {
        let client = MockChainClient::new("http://a")
            .with_transaction_count(3)
            .with_receipt_behavior(ReceiptBehavior::RevertAfter(0));
        let pipeline = mock_pipeline(client.clone());
        let sender = SenderAccount::from_private_key(TEST_PRIVATE_KEY, 56).unwrap();

        let err = pipeline
            .send(
                &sender,
                CallSpec::native_transfer(recipient(), U256::from(1000u64)),
                &GasPolicy::NetworkSuggested,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::TransactionReverted(_)));

        // Nonce 3 is consumed; the next send must use 4.
        let next = pipeline.nonce_authority().reserve(sender.address()).await.unwrap();
        assert_eq!(next.value, 4);
    }

    #[tokio::test]
    async fn broadcast_failure_releases_nonce() {
        let client = MockChainClient::new("http://a")
            .with_transaction_count(3)
            .with_send_failures(usize::MAX);
        let pipeline = mock_pipeline(client.clone());
        let sender = SenderAccount::from_private_key(TEST_PRIVATE_KEY, 56).unwrap();

        let err = pipeline
            .send(
                &sender,
                CallSpec::native_transfer(recipient(), U256::from(1000u64)),
                &GasPolicy::NetworkSuggested,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Connectivity { .. }));

        // The value was never broadcast, so the very next reserve gets it.
        let next = pipeline.nonce_authority().reserve(sender.address()).await.unwrap();
        assert_eq!(next.value, 3);
    }

    #[tokio::test]
    async fn confirmation_timeout_is_typed() {
        let client = MockChainClient::new("http://a")
            .with_transaction_count(3)
            .with_receipt_behavior(ReceiptBehavior::Never);
        let pipeline = mock_pipeline(client.clone());
        let sender = SenderAccount::from_private_key(TEST_PRIVATE_KEY, 56).unwrap();

        let err = pipeline
            .send(
                &sender,
                CallSpec::native_transfer(recipient(), U256::from(1000u64)),
                &GasPolicy::NetworkSuggested,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::TransactionTimeout { .. }));

        // Sent-but-unconfirmed: the value stays consumed.
        let next = pipeline.nonce_authority().reserve(sender.address()).await.unwrap();
        assert_eq!(next.value, 4);
    }

    #[test]
    fn bad_key_is_fatal_config() {
        let err = SenderAccount::from_private_key("zz-not-hex", 56).unwrap_err();
        assert!(matches!(err, DispatchError::FatalConfig(_)));
    }
}
