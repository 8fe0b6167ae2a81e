//! In-memory node and signer used by tests

use crate::chain::provider::{
    FeeSuggestion, FeeSuggestions, FeeTier, RpcClient, TransactionInclusion,
};
use crate::error::{FaucetResult, RpcFailure};
use crate::tx::signer::{SignedTransfer, TxSigner, WalletSigner};

use async_trait::async_trait;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, H256, U256};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

pub const DEV_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

pub fn gwei(n: u64) -> U256 {
    U256::from(n) * U256::exp10(9)
}

pub fn ether(n: u64) -> U256 {
    U256::from(n) * U256::exp10(18)
}

/// When broadcast transactions get mined
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mining {
    Immediately,
    Never,
    /// Mine the first variant once this many broadcasts have been seen
    FirstVariantAfter(usize),
}

#[derive(Debug)]
pub struct FakeNode {
    pub balance: U256,
    pub gas_price: U256,
    pub fees: Result<FeeSuggestions, RpcFailure>,
    pub latest_count: u64,
    pub pending_count: u64,
    pub mining: Mining,
    pub estimate_error: Option<RpcFailure>,
    pub send_error: Option<RpcFailure>,
    pub lookup_error: Option<RpcFailure>,
    pub broadcasts: Vec<H256>,
    pub mined: HashSet<H256>,
    pub fee_calls: usize,
}

impl Default for FakeNode {
    fn default() -> Self {
        let mut fees = FeeSuggestions::new();
        for (tier, priority, max) in [
            (FeeTier::Slow, 1, 25),
            (FeeTier::Standard, 2, 30),
            (FeeTier::Fast, 3, 40),
        ] {
            fees.insert(
                tier,
                FeeSuggestion {
                    max_priority_fee_per_gas: gwei(priority),
                    max_fee_per_gas: gwei(max),
                },
            );
        }

        Self {
            balance: ether(100),
            gas_price: gwei(10),
            fees: Ok(fees),
            latest_count: 0,
            pending_count: 0,
            mining: Mining::Immediately,
            estimate_error: None,
            send_error: None,
            lookup_error: None,
            broadcasts: Vec::new(),
            mined: HashSet::new(),
            fee_calls: 0,
        }
    }
}

/// Scriptable [`RpcClient`]
#[derive(Debug, Default)]
pub struct FakeRpc {
    pub node: Mutex<FakeNode>,
}

impl FakeRpc {
    pub fn new(node: FakeNode) -> Arc<Self> {
        Arc::new(Self {
            node: Mutex::new(node),
        })
    }

    pub fn broadcasts(&self) -> Vec<H256> {
        self.node.lock().unwrap().broadcasts.clone()
    }

    pub fn fee_calls(&self) -> usize {
        self.node.lock().unwrap().fee_calls
    }
}

#[async_trait]
impl RpcClient for FakeRpc {
    async fn estimate_gas(&self, _tx: &TypedTransaction) -> Result<U256, RpcFailure> {
        match &self.node.lock().unwrap().estimate_error {
            Some(err) => Err(err.clone()),
            None => Ok(U256::from(21_000u64)),
        }
    }

    async fn gas_price(&self) -> Result<U256, RpcFailure> {
        Ok(self.node.lock().unwrap().gas_price)
    }

    async fn get_balance(&self, _address: Address) -> Result<U256, RpcFailure> {
        Ok(self.node.lock().unwrap().balance)
    }

    async fn get_transaction_count(
        &self,
        _address: Address,
        include_pending: bool,
    ) -> Result<u64, RpcFailure> {
        let node = self.node.lock().unwrap();
        Ok(if include_pending {
            node.pending_count
        } else {
            node.latest_count
        })
    }

    async fn get_transaction(
        &self,
        hash: H256,
    ) -> Result<Option<TransactionInclusion>, RpcFailure> {
        let node = self.node.lock().unwrap();
        if let Some(err) = &node.lookup_error {
            return Err(err.clone());
        }
        if node.mined.contains(&hash) {
            return Ok(Some(TransactionInclusion {
                block_number: Some(1),
            }));
        }
        if node.broadcasts.contains(&hash) {
            return Ok(Some(TransactionInclusion { block_number: None }));
        }
        Ok(None)
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256, RpcFailure> {
        let hash = H256::from(ethers::utils::keccak256(&raw));
        let mut node = self.node.lock().unwrap();

        if !node.broadcasts.contains(&hash) {
            node.broadcasts.push(hash);
        }
        match node.mining {
            Mining::Immediately => {
                node.mined.insert(hash);
            }
            Mining::FirstVariantAfter(n) if node.broadcasts.len() >= n => {
                let first = node.broadcasts[0];
                node.mined.insert(first);
            }
            _ => {}
        }

        match &node.send_error {
            Some(err) => Err(err.clone()),
            None => Ok(hash),
        }
    }

    async fn suggest_fees(&self) -> Result<FeeSuggestions, RpcFailure> {
        let mut node = self.node.lock().unwrap();
        node.fee_calls += 1;
        node.fees.clone()
    }
}

/// Wallet signer that keeps every transaction it signed
pub struct RecordingSigner {
    inner: WalletSigner,
    pub signed: Mutex<Vec<TypedTransaction>>,
}

impl RecordingSigner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: WalletSigner::from_key(DEV_KEY).unwrap(),
            signed: Mutex::new(Vec::new()),
        })
    }

    pub fn signed(&self) -> Vec<TypedTransaction> {
        self.signed.lock().unwrap().clone()
    }
}

impl TxSigner for RecordingSigner {
    fn address(&self) -> Address {
        self.inner.address()
    }

    fn sign(&self, tx: &TypedTransaction) -> FaucetResult<SignedTransfer> {
        self.signed.lock().unwrap().push(tx.clone());
        self.inner.sign(tx)
    }
}
