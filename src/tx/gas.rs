//! Fee selection and replacement bumping for legacy and EIP-1559 chains

use super::retry::{self, RetryPolicy};
use crate::chain::provider::{FeeSuggestion, FeeSuggestions, RpcClient};
use crate::chain::ChainRuntimeState;
use crate::error::RpcFailure;

use ethers::types::U256;
use tracing::{debug, info, warn};

/// Fee attached to one signed variant of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GasPrice {
    Legacy(U256),
    Eip1559 {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}

impl GasPrice {
    /// Upper bound paid per unit of gas
    pub fn max_fee(&self) -> U256 {
        match self {
            GasPrice::Legacy(price) => *price,
            GasPrice::Eip1559 {
                max_fee_per_gas, ..
            } => *max_fee_per_gas,
        }
    }

    /// Tip offered to the block producer
    pub fn priority_fee(&self) -> U256 {
        match self {
            GasPrice::Legacy(price) => *price,
            GasPrice::Eip1559 {
                max_priority_fee_per_gas,
                ..
            } => *max_priority_fee_per_gas,
        }
    }

    /// Whether every component is at least the matching one in `previous`
    pub fn dominates(&self, previous: &GasPrice) -> bool {
        self.max_fee() >= previous.max_fee() && self.priority_fee() >= previous.priority_fee()
    }
}

/// Chooses fees for new transfers and their replacements
pub struct GasEstimator {
    /// Minimum increase over the previous fee cap for a replacement
    bump_percent: u64,
    policy: RetryPolicy,
}

impl GasEstimator {
    /// Create a new gas estimator
    pub fn new(bump_percent: u64, policy: RetryPolicy) -> Self {
        Self {
            bump_percent,
            policy,
        }
    }

    /// Compute the fee for the next variant of a transfer.
    ///
    /// Falls back to legacy pricing, permanently for the chain, when the fee
    /// oracle fails.
    pub async fn next_fee(
        &self,
        rpc: &dyn RpcClient,
        state: &ChainRuntimeState,
        previous: Option<&GasPrice>,
    ) -> Result<GasPrice, RpcFailure> {
        if state.use_fee_market() {
            match retry::retry_call(&self.policy, "suggest_fees", retry::classify_fee_market, move || {
                rpc.suggest_fees()
            })
            .await
            {
                Ok(suggestions) => match conservative(&suggestions) {
                    Some(suggested) => return Ok(self.replace_eip1559(suggested, previous)),
                    None => self.disable_fee_market(state, "fee oracle returned no tiers"),
                },
                Err(e) => self.disable_fee_market(state, &e.to_string()),
            }
        }

        let current =
            retry::retry_call(&self.policy, "gas_price", retry::transient_only, move || rpc.gas_price())
                .await?;
        Ok(self.replace_legacy(current, previous))
    }

    fn disable_fee_market(&self, state: &ChainRuntimeState, reason: &str) {
        if state.disable_fee_market() {
            info!(
                "Chain {} switched to legacy gas pricing: {}",
                state.chain_id(),
                reason
            );
            crate::metrics::record_fee_mode(state.chain_id(), false);
        }
        warn!("Fee oracle failed on chain {}: {}", state.chain_id(), reason);
    }

    /// EIP-1559 fee: adopt the suggestion outright, or bump over `previous`
    pub fn replace_eip1559(&self, suggested: FeeSuggestion, previous: Option<&GasPrice>) -> GasPrice {
        let fee = match previous {
            None => GasPrice::Eip1559 {
                max_fee_per_gas: suggested.max_fee_per_gas,
                max_priority_fee_per_gas: suggested.max_priority_fee_per_gas,
            },
            Some(prev) => GasPrice::Eip1559 {
                max_fee_per_gas: suggested.max_fee_per_gas.max(self.bump(prev.max_fee())),
                max_priority_fee_per_gas: suggested
                    .max_priority_fee_per_gas
                    .max(prev.priority_fee()),
            },
        };

        debug!("EIP-1559 fee {:?} (previous {:?})", fee, previous);
        fee
    }

    /// Legacy price: current network price, never below a bumped `previous`
    pub fn replace_legacy(&self, current: U256, previous: Option<&GasPrice>) -> GasPrice {
        let price = match previous {
            None => current,
            Some(prev) => current.max(self.bump(prev.max_fee())),
        };

        debug!("Legacy gas price {} (previous {:?})", price, previous);
        GasPrice::Legacy(price)
    }

    fn bump(&self, value: U256) -> U256 {
        value.saturating_mul(U256::from(100 + self.bump_percent)) / 100
    }
}

/// Suggestion with the smallest max fee among the returned tiers
pub fn conservative(suggestions: &FeeSuggestions) -> Option<FeeSuggestion> {
    suggestions
        .values()
        .min_by_key(|s| s.max_fee_per_gas)
        .copied()
}
