//! Transaction sender: nonce window, fee escalation and confirmation polling
//!
//! One call to [`TransactionSender::send`] drives a single payout through
//! `Reserved -> AwaitingWindow -> Submitting -> AwaitingConfirmation` until it
//! ends `Confirmed` or `Failed`.

use super::gas::{GasEstimator, GasPrice};
use super::retry::{self, RetryPolicy};
use super::signer::TxSigner;
use crate::chain::provider::RpcClient;
use crate::chain::ChainRuntimeState;
use crate::config::SenderConfig;
use crate::error::FaucetError;

use ethers::prelude::*;
use ethers::types::transaction::eip2718::TypedTransaction;
use std::fmt;
use std::sync::Arc;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

/// Final result of a payout
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Confirmed(H256),
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPhase {
    Reserved,
    AwaitingWindow,
    Submitting,
    AwaitingConfirmation,
    Confirmed,
    Failed,
}

impl fmt::Display for TransferPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferPhase::Reserved => "reserved",
            TransferPhase::AwaitingWindow => "awaiting-window",
            TransferPhase::Submitting => "submitting",
            TransferPhase::AwaitingConfirmation => "awaiting-confirmation",
            TransferPhase::Confirmed => "confirmed",
            TransferPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One in-flight payout; owns its nonce exclusively
#[derive(Debug)]
struct PendingTransfer {
    reserved_nonce: u64,
    destination: Address,
    value: U256,
    chain_id: u64,
    /// Fee of the latest variant; never decreases
    fee: Option<GasPrice>,
    fee_computed_at: Option<Instant>,
    /// Every variant broadcast for this nonce, oldest first
    submitted_hashes: Vec<H256>,
    /// Set when a confirmation round found nothing
    escalation_due: bool,
    phase: TransferPhase,
}

impl PendingTransfer {
    fn new(reserved_nonce: u64, destination: Address, value: U256, chain_id: u64) -> Self {
        Self {
            reserved_nonce,
            destination,
            value,
            chain_id,
            fee: None,
            fee_computed_at: None,
            submitted_hashes: Vec::new(),
            escalation_due: false,
            phase: TransferPhase::Reserved,
        }
    }

    fn transition(&mut self, phase: TransferPhase) {
        if self.phase != phase {
            debug!(
                "Transfer nonce {} on chain {}: {} -> {}",
                self.reserved_nonce, self.chain_id, self.phase, phase
            );
            self.phase = phase;
        }
    }

    /// Whether a new variant should be built and broadcast now
    fn submission_due(&self, now: Instant, fee_refresh: std::time::Duration) -> bool {
        self.submitted_hashes.is_empty()
            || self.escalation_due
            || self
                .fee_computed_at
                .map_or(true, |at| now.duration_since(at) >= fee_refresh)
    }

    fn record_hash(&mut self, hash: H256) {
        if !self.submitted_hashes.contains(&hash) {
            self.submitted_hashes.push(hash);
        }
    }
}

/// Why a build-and-send attempt stopped
#[derive(Debug)]
enum SendError {
    /// This attempt is abandoned; the poll loop tries again later
    Step(String),
    /// The transfer ends
    Fatal(String),
}

/// Transaction sender for one chain
pub struct TransactionSender {
    state: Arc<ChainRuntimeState>,
    rpc: Arc<dyn RpcClient>,
    signer: Arc<dyn TxSigner>,
    gas_estimator: GasEstimator,
    config: SenderConfig,
    /// Amount paid per transfer
    value: U256,
    /// Bounded retries for individual RPC calls
    policy: RetryPolicy,
    /// Balance must be known before spending
    balance_policy: RetryPolicy,
}

impl TransactionSender {
    /// Create a new transaction sender
    pub fn new(
        state: Arc<ChainRuntimeState>,
        rpc: Arc<dyn RpcClient>,
        signer: Arc<dyn TxSigner>,
        config: SenderConfig,
        value: U256,
    ) -> Self {
        let policy = RetryPolicy::bounded(&config.retry);
        let balance_policy = RetryPolicy::unbounded(&config.retry);

        Self {
            state,
            rpc,
            signer,
            gas_estimator: GasEstimator::new(config.fee_bump_percent, policy.clone()),
            config,
            value,
            policy,
            balance_policy,
        }
    }

    pub fn signer_address(&self) -> Address {
        self.signer.address()
    }

    pub fn value(&self) -> U256 {
        self.value
    }

    /// Pay `value` to `destination`; resolves once the payout is mined or
    /// cannot proceed.
    pub async fn send(&self, destination: Address) -> TransferOutcome {
        let chain_id = self.state.chain_id();
        let started = Instant::now();

        self.state.mark_requested().await;
        crate::metrics::record_transfer_requested(chain_id);

        let Some(nonce) = self.state.reserve_nonce() else {
            let reason = format!("Nonce space exhausted on chain {}", chain_id);
            error!("{}", reason);
            self.state.record_error(reason.clone()).await;
            crate::metrics::record_transfer_failed(chain_id);
            return TransferOutcome::Failed(reason);
        };
        let mut transfer = PendingTransfer::new(nonce, destination, self.value, chain_id);
        info!(
            "Transfer of {} to {:?} on chain {} reserved nonce {}",
            self.value, destination, chain_id, nonce
        );

        let outcome = self.drive(&mut transfer).await;

        match &outcome {
            TransferOutcome::Confirmed(hash) => {
                info!(
                    "Transfer nonce {} on chain {} confirmed: {:?} ({} variants)",
                    nonce,
                    chain_id,
                    hash,
                    transfer.submitted_hashes.len()
                );
                crate::metrics::record_transfer_confirmed(chain_id);
                crate::metrics::record_transfer_latency(chain_id, started.elapsed().as_secs_f64());
            }
            TransferOutcome::Failed(reason) => {
                error!("Transfer nonce {} on chain {} failed: {}", nonce, chain_id, reason);
                // Nothing of ours can land at this nonce; hand it to the next transfer
                if transfer.submitted_hashes.is_empty() {
                    self.state.release_nonce(nonce);
                }
                self.state.record_error(reason.clone()).await;
                crate::metrics::record_transfer_failed(chain_id);
            }
        }

        outcome
    }

    async fn drive(&self, transfer: &mut PendingTransfer) -> TransferOutcome {
        let window = i128::from(self.config.window);
        transfer.transition(TransferPhase::AwaitingWindow);

        loop {
            let delta = self.state.nonce_delta(transfer.reserved_nonce);

            if (0..window).contains(&delta)
                && transfer.submission_due(Instant::now(), self.config.fee_refresh())
            {
                transfer.transition(TransferPhase::Submitting);
                match self.build_and_send(transfer).await {
                    Ok(()) => {}
                    Err(SendError::Step(reason)) => {
                        warn!(
                            "Submission of nonce {} on chain {} deferred: {}",
                            transfer.reserved_nonce, transfer.chain_id, reason
                        );
                        self.state.record_error(reason).await;
                    }
                    Err(SendError::Fatal(reason)) => {
                        transfer.transition(TransferPhase::Failed);
                        return TransferOutcome::Failed(reason);
                    }
                }
                transfer.transition(TransferPhase::AwaitingWindow);
            }

            if delta <= 0 && !transfer.submitted_hashes.is_empty() {
                transfer.transition(TransferPhase::AwaitingConfirmation);
                match self.confirm(transfer).await {
                    Ok(Some(hash)) => {
                        transfer.transition(TransferPhase::Confirmed);
                        return TransferOutcome::Confirmed(hash);
                    }
                    Ok(None) if delta < 0 => {
                        transfer.transition(TransferPhase::Failed);
                        return TransferOutcome::Failed(self.nonce_spent(transfer));
                    }
                    Ok(None) => {
                        debug!(
                            "Nonce {} on chain {} not mined yet, escalating",
                            transfer.reserved_nonce, transfer.chain_id
                        );
                        transfer.escalation_due = true;
                        transfer.transition(TransferPhase::AwaitingWindow);
                    }
                    Err(reason) => {
                        transfer.transition(TransferPhase::Failed);
                        return TransferOutcome::Failed(reason);
                    }
                }
            } else if delta < 0 {
                transfer.transition(TransferPhase::Failed);
                return TransferOutcome::Failed(self.nonce_spent(transfer));
            }

            sleep(self.config.poll_interval()).await;
        }
    }

    fn nonce_spent(&self, transfer: &PendingTransfer) -> String {
        format!(
            "Nonce {} on chain {} was used by another transaction",
            transfer.reserved_nonce, transfer.chain_id
        )
    }

    /// Build, sign and broadcast a variant for the transfer's nonce
    async fn build_and_send(&self, transfer: &mut PendingTransfer) -> Result<(), SendError> {
        let rpc = self.rpc.as_ref();
        let from = self.signer.address();

        let estimate: TypedTransaction = TransactionRequest::new()
            .from(from)
            .to(transfer.destination)
            .value(transfer.value)
            .into();
        let estimate = &estimate;
        let gas_limit = retry::retry_call(&self.policy, "estimate_gas", retry::transient_only, move || {
            rpc.estimate_gas(estimate)
        })
        .await
        .map_err(|e| SendError::Step(format!("Gas estimation failed: {}", e.message)))?;

        let fee = self
            .gas_estimator
            .next_fee(rpc, &self.state, transfer.fee.as_ref())
            .await
            .map_err(|e| SendError::Fatal(e.message))?;
        debug_assert!(transfer.fee.map_or(true, |prev| fee.dominates(&prev)));
        transfer.fee = Some(fee);
        transfer.fee_computed_at = Some(Instant::now());
        transfer.escalation_due = false;

        let tx = self.build_tx(transfer, from, gas_limit, fee);
        let signed = self
            .signer
            .sign(&tx)
            .map_err(|e| SendError::Fatal(e.to_string()))?;

        let balance = retry::retry_call(&self.balance_policy, "get_balance", retry::always, move || {
            rpc.get_balance(from)
        })
        .await
        .map_err(|e| SendError::Fatal(e.message))?;

        self.state.record_balance(balance).await;
        crate::metrics::record_wallet_balance(transfer.chain_id, balance);

        // Keep a reserve so the last payout never strands the account without gas
        if balance < transfer.value.saturating_mul(U256::from(2)) {
            warn!(
                "Balance {} on chain {} below reserve for payout {}",
                balance, transfer.chain_id, transfer.value
            );
            return Err(SendError::Fatal(
                FaucetError::FaucetDry {
                    chain_id: transfer.chain_id,
                }
                .to_string(),
            ));
        }

        transfer.record_hash(signed.hash);

        let raw = signed.raw;
        match retry::retry(&self.policy, "send_raw_transaction", retry::broadcast, move || {
            rpc.send_raw_transaction(raw.clone())
        })
        .await
        {
            Ok(Some(_)) => {
                info!(
                    "Broadcast {:?} for nonce {} on chain {} with {:?}",
                    signed.hash, transfer.reserved_nonce, transfer.chain_id, fee
                );
                crate::metrics::record_broadcast(transfer.chain_id);
            }
            Ok(None) => {
                debug!(
                    "Node already knows a variant of nonce {} on chain {}",
                    transfer.reserved_nonce, transfer.chain_id
                );
            }
            Err(e) => {
                warn!(
                    "Broadcast of {:?} on chain {} failed: {}",
                    signed.hash, transfer.chain_id, e
                );
                crate::metrics::record_rpc_error(transfer.chain_id, "send_raw_transaction");
                self.state.record_error(e.message).await;
            }
        }

        Ok(())
    }

    fn build_tx(
        &self,
        transfer: &PendingTransfer,
        from: Address,
        gas_limit: U256,
        fee: GasPrice,
    ) -> TypedTransaction {
        match fee {
            GasPrice::Legacy(price) => TransactionRequest::new()
                .from(from)
                .to(transfer.destination)
                .value(transfer.value)
                .nonce(transfer.reserved_nonce)
                .gas(gas_limit)
                .gas_price(price)
                .chain_id(transfer.chain_id)
                .into(),
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => Eip1559TransactionRequest::new()
                .from(from)
                .to(transfer.destination)
                .value(transfer.value)
                .nonce(transfer.reserved_nonce)
                .gas(gas_limit)
                .max_fee_per_gas(max_fee_per_gas)
                .max_priority_fee_per_gas(max_priority_fee_per_gas)
                .chain_id(transfer.chain_id)
                .into(),
        }
    }

    /// Poll every broadcast variant; any mined one settles the transfer
    async fn confirm(&self, transfer: &PendingTransfer) -> Result<Option<H256>, String> {
        let rpc = self.rpc.as_ref();

        for attempt in 1..=self.config.confirm_attempts {
            for &hash in &transfer.submitted_hashes {
                let inclusion =
                    retry::retry_call(&self.policy, "get_transaction", retry::transient_only, move || {
                        rpc.get_transaction(hash)
                    })
                    .await
                    .map_err(|e| e.message)?;

                if inclusion.is_some_and(|i| i.is_mined()) {
                    self.state
                        .advance_confirmed(transfer.reserved_nonce.saturating_add(1));
                    self.state.mark_confirmed().await;
                    return Ok(Some(hash));
                }

                sleep(self.config.confirm_hash_interval()).await;
            }

            debug!(
                "Nonce {} on chain {}: no variant mined (attempt {}/{})",
                transfer.reserved_nonce, transfer.chain_id, attempt, self.config.confirm_attempts
            );
            sleep(self.config.confirm_attempt_interval()).await;
        }

        Ok(None)
    }
}
