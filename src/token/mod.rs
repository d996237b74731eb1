//! Token metadata and calldata helpers.
//!
//! Decimal counts differ per token and must be read from the contract, so
//! every job fetches metadata fresh through here instead of assuming the
//! 18-decimal default. Calldata builders cover the ERC-20 surface the
//! executors need plus the two PancakeSwap router swaps.

use crate::chain::EndpointPool;
use crate::error::{DispatchError, Result};
use crate::limiter::ApiRateLimiter;
use ethers::abi::{self, ParamType, Token};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, TransactionRequest, U256};
use ethers::utils::{id, parse_units};
use log::warn;
use once_cell::sync::Lazy;
use std::sync::Arc;

static DECIMALS_SELECTOR: Lazy<[u8; 4]> = Lazy::new(|| id("decimals()"));
static SYMBOL_SELECTOR: Lazy<[u8; 4]> = Lazy::new(|| id("symbol()"));
static BALANCE_OF_SELECTOR: Lazy<[u8; 4]> = Lazy::new(|| id("balanceOf(address)"));
static ALLOWANCE_SELECTOR: Lazy<[u8; 4]> = Lazy::new(|| id("allowance(address,address)"));
static TRANSFER_SELECTOR: Lazy<[u8; 4]> = Lazy::new(|| id("transfer(address,uint256)"));
static APPROVE_SELECTOR: Lazy<[u8; 4]> = Lazy::new(|| id("approve(address,uint256)"));
static SWAP_ETH_FOR_TOKENS_SELECTOR: Lazy<[u8; 4]> =
    Lazy::new(|| id("swapExactETHForTokens(uint256,address[],address,uint256)"));
static SWAP_TOKENS_FOR_ETH_SELECTOR: Lazy<[u8; 4]> =
    Lazy::new(|| id("swapExactTokensForETH(uint256,uint256,address[],address,uint256)"));

/// Metadata fetched fresh from the token contract.
#[derive(Debug, Clone)]
pub struct TokenMetadata {
    pub address: Address,
    pub symbol: String,
    pub decimals: u8,
}

/// Read-only token queries routed through the endpoint pool under the rate
/// limiter.
pub struct TokenService {
    pool: Arc<EndpointPool>,
    limiter: Arc<ApiRateLimiter>,
}

impl TokenService {
    pub fn new(pool: Arc<EndpointPool>, limiter: Arc<ApiRateLimiter>) -> Self {
        Self { pool, limiter }
    }

    pub async fn metadata(&self, token: Address) -> Result<TokenMetadata> {
        let decimals = self.decimals(token).await?;
        let symbol = self.symbol(token).await?;
        Ok(TokenMetadata {
            address: token,
            symbol,
            decimals,
        })
    }

    pub async fn decimals(&self, token: Address) -> Result<u8> {
        let out = self.eth_call(token, DECIMALS_SELECTOR.to_vec()).await?;
        let tokens = abi::decode(&[ParamType::Uint(8)], &out)
            .map_err(|e| DispatchError::Parse(format!("decimals() decode failed: {}", e)))?;
        let value = tokens
            .into_iter()
            .next()
            .and_then(Token::into_uint)
            .ok_or_else(|| DispatchError::Parse("decimals() returned no uint".to_string()))?;
        Ok(value.as_u64() as u8)
    }

    pub async fn symbol(&self, token: Address) -> Result<String> {
        // Some contracts return bytes32, others revert on symbol() entirely;
        // fall back to a placeholder rather than failing a job over a label.
        let out = match self.eth_call(token, SYMBOL_SELECTOR.to_vec()).await {
            Ok(out) => out,
            Err(e) => {
                warn!("symbol() call failed for {:?}: {}", token, e);
                return Ok("?".to_string());
            }
        };
        match abi::decode(&[ParamType::String], &out) {
            Ok(tokens) => Ok(tokens
                .into_iter()
                .next()
                .and_then(Token::into_string)
                .unwrap_or_else(|| "?".to_string())),
            Err(e) => {
                warn!("symbol() decode failed for {:?}: {}", token, e);
                Ok("?".to_string())
            }
        }
    }

    pub async fn balance_of(&self, token: Address, owner: Address) -> Result<U256> {
        let mut data = BALANCE_OF_SELECTOR.to_vec();
        data.extend(abi::encode(&[Token::Address(owner)]));
        let out = self.eth_call(token, data).await?;
        decode_uint(&out, "balanceOf")
    }

    pub async fn allowance(&self, token: Address, owner: Address, spender: Address) -> Result<U256> {
        let mut data = ALLOWANCE_SELECTOR.to_vec();
        data.extend(abi::encode(&[Token::Address(owner), Token::Address(spender)]));
        let out = self.eth_call(token, data).await?;
        decode_uint(&out, "allowance")
    }

    async fn eth_call(&self, to: Address, data: Vec<u8>) -> Result<Bytes> {
        let client = self.pool.get_connection().await?;
        self.limiter
            .acquire(&format!("rpc:{}", client.endpoint()))
            .await?;
        let tx: TypedTransaction = TransactionRequest::new().to(to).data(data).into();
        client.call(&tx).await
    }
}

fn decode_uint(out: &[u8], what: &str) -> Result<U256> {
    let tokens = abi::decode(&[ParamType::Uint(256)], out)
        .map_err(|e| DispatchError::Parse(format!("{}() decode failed: {}", what, e)))?;
    tokens
        .into_iter()
        .next()
        .and_then(Token::into_uint)
        .ok_or_else(|| DispatchError::Parse(format!("{}() returned no uint", what)))
}

/// Scales a human-readable decimal amount (`"1.5"`) into base units using
/// the token's fetched decimal count.
pub fn scale_amount(amount: &str, decimals: u8) -> Result<U256> {
    let parsed = parse_units(amount, u32::from(decimals)).map_err(|e| {
        DispatchError::Parse(format!(
            "cannot scale '{}' by {} decimals: {}",
            amount, decimals, e
        ))
    })?;
    Ok(parsed.into())
}

pub fn transfer_calldata(recipient: Address, amount: U256) -> Bytes {
    let mut data = TRANSFER_SELECTOR.to_vec();
    data.extend(abi::encode(&[Token::Address(recipient), Token::Uint(amount)]));
    Bytes::from(data)
}

pub fn approve_calldata(spender: Address, amount: U256) -> Bytes {
    let mut data = APPROVE_SELECTOR.to_vec();
    data.extend(abi::encode(&[Token::Address(spender), Token::Uint(amount)]));
    Bytes::from(data)
}

pub fn swap_exact_eth_for_tokens_calldata(
    amount_out_min: U256,
    path: Vec<Address>,
    to: Address,
    deadline: U256,
) -> Bytes {
    let mut data = SWAP_ETH_FOR_TOKENS_SELECTOR.to_vec();
    data.extend(abi::encode(&[
        Token::Uint(amount_out_min),
        Token::Array(path.into_iter().map(Token::Address).collect()),
        Token::Address(to),
        Token::Uint(deadline),
    ]));
    Bytes::from(data)
}

pub fn swap_exact_tokens_for_eth_calldata(
    amount_in: U256,
    amount_out_min: U256,
    path: Vec<Address>,
    to: Address,
    deadline: U256,
) -> Bytes {
    let mut data = SWAP_TOKENS_FOR_ETH_SELECTOR.to_vec();
    data.extend(abi::encode(&[
        Token::Uint(amount_in),
        Token::Uint(amount_out_min),
        Token::Array(path.into_iter().map(Token::Address).collect()),
        Token::Address(to),
        Token::Uint(deadline),
    ]));
    Bytes::from(data)
}

/// Router deadline `secs` from now, as a unix timestamp.
pub fn swap_deadline(secs: u64) -> U256 {
    U256::from(chrono::Utc::now().timestamp() as u64 + secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{mock_pool, MockChainClient};
    use pretty_assertions::assert_eq;

    #[test]
    fn scale_amount_uses_fetched_decimals() {
        assert_eq!(
            scale_amount("1.5", 9).unwrap(),
            U256::from(1_500_000_000u64)
        );
        assert_eq!(
            scale_amount("2", 18).unwrap(),
            U256::from(2u64) * U256::exp10(18)
        );
        assert!(scale_amount("not-a-number", 18).is_err());
    }

    #[test]
    fn transfer_calldata_layout() {
        let recipient = Address::from_low_u64_be(0xbeef);
        let data = transfer_calldata(recipient, U256::from(7u64));
        assert_eq!(&data[..4], &*TRANSFER_SELECTOR);
        // Two 32-byte words follow the selector.
        assert_eq!(data.len(), 4 + 64);
        assert_eq!(U256::from_big_endian(&data[36..68]), U256::from(7u64));
    }

    #[tokio::test]
    async fn decimals_read_from_contract() {
        let client = MockChainClient::new("http://a")
            .with_call_response(*DECIMALS_SELECTOR, abi::encode(&[Token::Uint(U256::from(9u64))]).into());
        let pool = Arc::new(mock_pool(client));
        let service = TokenService::new(pool, Arc::new(ApiRateLimiter::new(100, 100)));

        let decimals = service.decimals(Address::from_low_u64_be(1)).await.unwrap();
        assert_eq!(decimals, 9);
    }
}
