//! RPC facade for one chain endpoint
//!
//! The faucet core talks to nodes only through [`RpcClient`]. The production
//! implementation wraps an ethers HTTP provider; tests substitute fakes.

use crate::config::ChainConfig;
use crate::error::{FaucetError, FaucetResult, RpcFailure};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider, ProviderError, RpcError};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// Number of recent blocks sampled by the fee oracle
const FEE_HISTORY_BLOCKS: u64 = 5;

/// Priority tiers reported by the fee oracle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FeeTier {
    Slow,
    Standard,
    Fast,
}

impl FeeTier {
    pub const ALL: [FeeTier; 3] = [FeeTier::Slow, FeeTier::Standard, FeeTier::Fast];

    /// Reward percentile sampled from `eth_feeHistory`
    fn percentile(self) -> f64 {
        match self {
            FeeTier::Slow => 10.0,
            FeeTier::Standard => 50.0,
            FeeTier::Fast => 90.0,
        }
    }
}

/// EIP-1559 fee pair suggested for one tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeSuggestion {
    pub max_priority_fee_per_gas: U256,
    pub max_fee_per_gas: U256,
}

pub type FeeSuggestions = BTreeMap<FeeTier, FeeSuggestion>;

/// Inclusion status of a transaction as reported by the node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionInclusion {
    /// `None` while the transaction sits in the mempool
    pub block_number: Option<u64>,
}

impl TransactionInclusion {
    pub fn is_mined(&self) -> bool {
        self.block_number.is_some()
    }
}

/// Operations the sender needs from a node
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RpcClient: Send + Sync {
    async fn estimate_gas(&self, tx: &TypedTransaction) -> Result<U256, RpcFailure>;

    async fn gas_price(&self) -> Result<U256, RpcFailure>;

    async fn get_balance(&self, address: Address) -> Result<U256, RpcFailure>;

    /// Transaction count at the latest block, or including the mempool
    async fn get_transaction_count(
        &self,
        address: Address,
        include_pending: bool,
    ) -> Result<u64, RpcFailure>;

    async fn get_transaction(
        &self,
        hash: H256,
    ) -> Result<Option<TransactionInclusion>, RpcFailure>;

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256, RpcFailure>;

    /// Fee-market suggestions per tier; "not available" on legacy chains
    async fn suggest_fees(&self) -> Result<FeeSuggestions, RpcFailure>;
}

/// ethers-backed [`RpcClient`]
pub struct ChainProvider {
    chain_id: u64,
    http: Provider<Http>,
}

impl ChainProvider {
    /// Create a new chain provider
    pub fn new(config: &ChainConfig) -> FaucetResult<Self> {
        let http = Provider::<Http>::try_from(config.rpc_url.as_str())
            .map_err(|e| {
                FaucetError::Config(format!(
                    "Invalid RPC URL for chain {}: {}",
                    config.chain_id, e
                ))
            })?
            .interval(Duration::from_millis(100));

        debug!("Added HTTP provider for chain {}: {}", config.chain_id, config.rpc_url);

        Ok(Self {
            chain_id: config.chain_id,
            http,
        })
    }
}

#[async_trait]
impl RpcClient for ChainProvider {
    async fn estimate_gas(&self, tx: &TypedTransaction) -> Result<U256, RpcFailure> {
        self.http.estimate_gas(tx, None).await.map_err(to_failure)
    }

    async fn gas_price(&self) -> Result<U256, RpcFailure> {
        self.http.get_gas_price().await.map_err(to_failure)
    }

    async fn get_balance(&self, address: Address) -> Result<U256, RpcFailure> {
        self.http.get_balance(address, None).await.map_err(to_failure)
    }

    async fn get_transaction_count(
        &self,
        address: Address,
        include_pending: bool,
    ) -> Result<u64, RpcFailure> {
        let block = if include_pending {
            BlockNumber::Pending
        } else {
            BlockNumber::Latest
        };

        let count = self
            .http
            .get_transaction_count(address, Some(block.into()))
            .await
            .map_err(to_failure)?;

        if count > U256::from(u64::MAX) {
            return Err(RpcFailure::transport(format!(
                "transaction count {} out of range",
                count
            )));
        }
        Ok(count.as_u64())
    }

    async fn get_transaction(
        &self,
        hash: H256,
    ) -> Result<Option<TransactionInclusion>, RpcFailure> {
        let tx = self.http.get_transaction(hash).await.map_err(to_failure)?;
        Ok(tx.map(|tx| TransactionInclusion {
            block_number: tx.block_number.map(|n| n.as_u64()),
        }))
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256, RpcFailure> {
        let pending = self.http.send_raw_transaction(raw).await.map_err(to_failure)?;
        debug!("Chain {} accepted {:?}", self.chain_id, pending.tx_hash());
        Ok(pending.tx_hash())
    }

    async fn suggest_fees(&self) -> Result<FeeSuggestions, RpcFailure> {
        let percentiles: Vec<f64> = FeeTier::ALL.iter().map(|t| t.percentile()).collect();

        let history = self
            .http
            .fee_history(FEE_HISTORY_BLOCKS, BlockNumber::Latest, &percentiles)
            .await
            .map_err(to_failure)?;

        suggestions_from_history(&history)
    }
}

/// Derive tiered suggestions from fee history.
///
/// The last `base_fee_per_gas` entry is the base fee of the next block; the
/// max fee leaves room for two full base-fee increases.
pub fn suggestions_from_history(history: &FeeHistory) -> Result<FeeSuggestions, RpcFailure> {
    let base_fee = history
        .base_fee_per_gas
        .last()
        .copied()
        .filter(|fee| !fee.is_zero())
        .ok_or_else(|| RpcFailure::unsupported("fee market not available"))?;

    let mut suggestions = FeeSuggestions::new();
    for (column, tier) in FeeTier::ALL.iter().enumerate() {
        let rewards: Vec<U256> = history
            .reward
            .iter()
            .filter_map(|block| block.get(column).copied())
            .collect();

        let priority = if rewards.is_empty() {
            U256::zero()
        } else {
            rewards.iter().fold(U256::zero(), |acc, r| acc.saturating_add(*r))
                / U256::from(rewards.len())
        };

        suggestions.insert(
            *tier,
            FeeSuggestion {
                max_priority_fee_per_gas: priority,
                max_fee_per_gas: base_fee.saturating_mul(U256::from(2)).saturating_add(priority),
            },
        );
    }

    Ok(suggestions)
}

fn to_failure(err: ProviderError) -> RpcFailure {
    match RpcError::as_error_response(&err) {
        Some(resp) => RpcFailure::new(resp.message.clone(), resp.code),
        None => RpcFailure::transport(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RpcErrorKind;
    use ethers::providers::{HttpClientError, JsonRpcError};

    fn gwei(n: u64) -> U256 {
        U256::from(n) * U256::exp10(9)
    }

    fn history(base_fees: Vec<U256>, reward: Vec<Vec<U256>>) -> FeeHistory {
        FeeHistory {
            base_fee_per_gas: base_fees,
            gas_used_ratio: vec![0.5; reward.len()],
            oldest_block: U256::from(100),
            reward,
        }
    }

    #[test]
    fn test_suggestions_per_tier() {
        let history = history(
            vec![gwei(10), gwei(12)],
            vec![
                vec![gwei(1), gwei(2), gwei(4)],
                vec![gwei(1), gwei(4), gwei(6)],
            ],
        );

        let suggestions = suggestions_from_history(&history).unwrap();
        assert_eq!(suggestions.len(), 3);

        let standard = suggestions[&FeeTier::Standard];
        assert_eq!(standard.max_priority_fee_per_gas, gwei(3));
        assert_eq!(standard.max_fee_per_gas, gwei(27));

        let slow = suggestions[&FeeTier::Slow];
        assert_eq!(slow.max_fee_per_gas, gwei(25));
    }

    #[test]
    fn test_missing_base_fee_is_unsupported() {
        let err = suggestions_from_history(&history(vec![], vec![])).unwrap_err();
        assert_eq!(err.kind(), RpcErrorKind::Unsupported);

        let err = suggestions_from_history(&history(vec![U256::zero()], vec![])).unwrap_err();
        assert_eq!(err.kind(), RpcErrorKind::Unsupported);
    }

    #[test]
    fn test_node_error_keeps_code_and_message() {
        let err = ProviderError::from(HttpClientError::JsonRpcError(JsonRpcError {
            code: -32000,
            message: "nonce too low: next nonce 7, tx nonce 5".to_string(),
            data: None,
        }));

        let failure = to_failure(err);
        assert_eq!(failure.code, -32000);
        assert_eq!(failure.message, "nonce too low: next nonce 7, tx nonce 5");
        assert_eq!(failure.kind(), RpcErrorKind::KnownTransaction);
    }

    #[test]
    fn test_transport_error_has_no_code() {
        let failure = to_failure(ProviderError::CustomError("connection refused".to_string()));
        assert_eq!(failure.code, 0);
        assert!(failure.message.contains("connection refused"));
        assert_eq!(failure.kind(), RpcErrorKind::Transient);
    }

    #[test]
    fn test_provider_rejects_bad_url() {
        let config = ChainConfig {
            chain_id: 1,
            name: "broken".to_string(),
            rpc_url: "not a url".to_string(),
            symbol: "ETH".to_string(),
            explorer_urls: vec![],
            enabled: true,
        };
        assert!(matches!(ChainProvider::new(&config), Err(FaucetError::Config(_))));
    }
}
