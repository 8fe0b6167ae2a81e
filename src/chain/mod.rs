//! Chain module - per-network RPC access, runtime state and background resync
//!
//! This module provides:
//! - The `RpcClient` facade and its ethers-backed implementation
//! - Per-chain nonce, fee-mode and diagnostic state
//! - Startup rebuild of nonces from the node and periodic ratchet resync

pub mod provider;
pub mod state;

pub use provider::{ChainProvider, RpcClient};
pub use state::{ChainRuntimeState, ChainStatus};

use crate::config::{ChainConfig, SenderConfig, Settings};
use crate::error::{FaucetError, FaucetResult, RpcFailure};
use crate::tx::retry::{self, RetryPolicy};
use crate::tx::{TransactionSender, TxSigner};

use dashmap::DashMap;
use ethers::types::U256;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Everything needed to serve payouts on one configured network
pub struct ChainHandle {
    pub key: String,
    pub config: ChainConfig,
    pub state: Arc<ChainRuntimeState>,
    pub rpc: Arc<dyn RpcClient>,
    pub sender: Arc<TransactionSender>,
}

/// Status view entry for one chain
#[derive(Debug, Clone, Serialize)]
pub struct ChainSummary {
    pub key: String,
    pub name: String,
    pub symbol: String,
    #[serde(flatten)]
    pub status: ChainStatus,
}

/// Manages all configured chains
pub struct ChainManager {
    /// Chain handles indexed by config key
    chains: DashMap<String, Arc<ChainHandle>>,
    sync_interval: Duration,
    policy: RetryPolicy,
    /// Shutdown signal
    shutdown: Arc<RwLock<bool>>,
}

impl ChainManager {
    /// Manager with no chains yet
    pub fn empty(sender: &SenderConfig) -> Self {
        Self {
            chains: DashMap::new(),
            sync_interval: Duration::from_secs(sender.sync_interval_secs),
            policy: RetryPolicy::bounded(&sender.retry),
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    /// Connect every enabled chain and rebuild its nonces from the node
    pub async fn new(settings: &Settings, signer: Arc<dyn TxSigner>) -> FaucetResult<Self> {
        let manager = Self::empty(&settings.sender);
        let value = settings
            .payout_wei()
            .map_err(|e| FaucetError::Config(e.to_string()))?;

        for (key, chain_config) in settings.enabled_chains() {
            info!(
                "Initializing chain {} (ID: {})",
                chain_config.name, chain_config.chain_id
            );

            let rpc: Arc<dyn RpcClient> = Arc::new(ChainProvider::new(chain_config)?);
            manager
                .add_chain(
                    key,
                    chain_config.clone(),
                    rpc,
                    signer.clone(),
                    settings.sender.clone(),
                    value,
                )
                .await?;

            info!("Chain {} initialized successfully", chain_config.name);
        }

        Ok(manager)
    }

    /// Seed state for one chain from its on-chain counts and register it
    pub async fn add_chain(
        &self,
        key: &str,
        config: ChainConfig,
        rpc: Arc<dyn RpcClient>,
        signer: Arc<dyn TxSigner>,
        sender_config: SenderConfig,
        value: U256,
    ) -> FaucetResult<Arc<ChainHandle>> {
        let chain_id = config.chain_id;
        let address = signer.address();
        let client = rpc.as_ref();
        let rpc_error = |source: RpcFailure| FaucetError::Rpc { chain_id, source };

        let pending = retry::retry_call(&self.policy, "get_transaction_count", retry::transient_only, move || {
            client.get_transaction_count(address, true)
        })
        .await
        .map_err(rpc_error)?;
        let confirmed = retry::retry_call(&self.policy, "get_transaction_count", retry::transient_only, move || {
            client.get_transaction_count(address, false)
        })
        .await
        .map_err(rpc_error)?;
        let balance = retry::retry_call(&self.policy, "get_balance", retry::transient_only, move || {
            client.get_balance(address)
        })
        .await
        .map_err(rpc_error)?;

        let state = Arc::new(ChainRuntimeState::new(chain_id, pending, confirmed));
        state.record_balance(balance).await;
        crate::metrics::record_nonces(chain_id, state.pending_nonce(), state.confirmed_nonce());
        crate::metrics::record_fee_mode(chain_id, true);
        crate::metrics::record_wallet_balance(chain_id, balance);

        info!(
            "Chain {} wallet {:?}: pending nonce {}, confirmed nonce {}, balance {}",
            chain_id, address, pending, confirmed, balance
        );

        let sender = Arc::new(TransactionSender::new(
            state.clone(),
            rpc.clone(),
            signer,
            sender_config,
            value,
        ));

        let handle = Arc::new(ChainHandle {
            key: key.to_string(),
            config,
            state,
            rpc,
            sender,
        });
        self.chains.insert(key.to_string(), handle.clone());
        Ok(handle)
    }

    /// Get the handle for a configured chain key
    pub fn get(&self, key: &str) -> FaucetResult<Arc<ChainHandle>> {
        self.chains
            .get(key)
            .map(|c| c.clone())
            .ok_or_else(|| FaucetError::ChainNotFound(key.to_string()))
    }

    /// Status of every chain, ordered by key
    pub async fn statuses(&self) -> Vec<ChainSummary> {
        let handles: Vec<Arc<ChainHandle>> = self.chains.iter().map(|e| e.value().clone()).collect();

        let mut summaries = Vec::with_capacity(handles.len());
        for handle in handles {
            summaries.push(ChainSummary {
                key: handle.key.clone(),
                name: handle.config.name.clone(),
                symbol: handle.config.symbol.clone(),
                status: handle.state.status().await,
            });
        }
        summaries.sort_by(|a, b| a.key.cmp(&b.key));
        summaries
    }

    /// Get all connected chain IDs
    pub fn connected_chains(&self) -> Vec<u64> {
        self.chains.iter().map(|e| e.value().config.chain_id).collect()
    }

    /// Periodically resync every chain until stopped
    pub async fn run_sync(&self) {
        let mut handles = Vec::new();

        for entry in self.chains.iter() {
            let chain = entry.value().clone();
            let shutdown = self.shutdown.clone();
            let policy = self.policy.clone();
            let interval = self.sync_interval;

            handles.push(tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    if *shutdown.read().await {
                        break;
                    }
                    sync_once(&chain, &policy).await;
                }
            }));
        }

        futures::future::join_all(handles).await;
    }

    /// Stop the resync loops
    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
        info!("Chain manager stopped");
    }
}

/// Advance the confirmed ratchet from the node's latest count and refresh the balance
pub async fn sync_once(chain: &ChainHandle, policy: &RetryPolicy) {
    let chain_id = chain.config.chain_id;
    let address = chain.sender.signer_address();
    let client = chain.rpc.as_ref();

    match retry::retry_call(policy, "get_transaction_count", retry::transient_only, move || {
        client.get_transaction_count(address, false)
    })
    .await
    {
        Ok(latest) => {
            let before = chain.state.confirmed_nonce();
            let after = chain.state.advance_confirmed(latest);
            if after > before {
                debug!("Chain {} confirmed nonce resynced {} -> {}", chain_id, before, after);
            }
        }
        Err(e) => {
            warn!("Nonce resync failed on chain {}: {}", chain_id, e);
            crate::metrics::record_rpc_error(chain_id, "get_transaction_count");
            chain.state.record_error(e.message).await;
        }
    }

    match retry::retry_call(policy, "get_balance", retry::transient_only, move || {
        client.get_balance(address)
    })
    .await
    {
        Ok(balance) => {
            chain.state.record_balance(balance).await;
            crate::metrics::record_wallet_balance(chain_id, balance);
            if balance < chain.sender.value().saturating_mul(U256::from(2)) {
                error!("Faucet wallet on chain {} is low: {}", chain_id, balance);
            }
        }
        Err(e) => {
            warn!("Balance refresh failed on chain {}: {}", chain_id, e);
            crate::metrics::record_rpc_error(chain_id, "get_balance");
            chain.state.record_error(e.message).await;
        }
    }
}
