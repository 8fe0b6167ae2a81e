//! Per-chain runtime state shared by every transfer on that chain

use crate::tx::NonceSequencer;

use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ethers::types::{Address, U256};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

/// Number of distinct error strings kept for diagnostics
const MAX_RECENT_ERRORS: usize = 10;

/// Advisory fields; last write wins
#[derive(Debug, Default)]
struct Diagnostics {
    last_seen_balance: Option<U256>,
    last_requested_at: Option<DateTime<Utc>>,
    last_confirmed_at: Option<DateTime<Utc>>,
    recent_errors: VecDeque<String>,
}

/// Mutable state of one configured network
#[derive(Debug)]
pub struct ChainRuntimeState {
    chain_id: u64,
    nonces: NonceSequencer,
    /// Starts optimistic; cleared once the fee oracle fails
    use_fee_market: AtomicBool,
    diagnostics: RwLock<Diagnostics>,
    /// Requester -> last time a payout was granted
    requester_cooldown: DashMap<Address, DateTime<Utc>>,
}

/// Read-only snapshot for the status view
#[derive(Debug, Clone, Serialize)]
pub struct ChainStatus {
    pub chain_id: u64,
    pub pending_nonce: u64,
    pub confirmed_nonce: u64,
    pub fee_market: bool,
    pub last_seen_balance: Option<String>,
    pub last_requested_at: Option<DateTime<Utc>>,
    pub last_confirmed_at: Option<DateTime<Utc>>,
    pub tracked_requesters: usize,
    pub recent_errors: Vec<String>,
}

impl ChainRuntimeState {
    /// Create state seeded from on-chain transaction counts
    pub fn new(chain_id: u64, pending_nonce: u64, confirmed_nonce: u64) -> Self {
        Self {
            chain_id,
            nonces: NonceSequencer::new(pending_nonce, confirmed_nonce),
            use_fee_market: AtomicBool::new(true),
            diagnostics: RwLock::new(Diagnostics::default()),
            requester_cooldown: DashMap::new(),
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn reserve_nonce(&self) -> Option<u64> {
        let nonce = self.nonces.reserve();
        crate::metrics::record_nonces(self.chain_id, self.nonces.pending(), self.confirmed_nonce());
        nonce
    }

    /// Return a nonce whose transfer never broadcast
    pub fn release_nonce(&self, nonce: u64) {
        self.nonces.release(nonce);
        crate::metrics::record_nonces(self.chain_id, self.nonces.pending(), self.confirmed_nonce());
    }

    pub fn advance_confirmed(&self, candidate: u64) -> u64 {
        let confirmed = self.nonces.advance_confirmed(candidate);
        crate::metrics::record_nonces(self.chain_id, self.nonces.pending(), confirmed);
        confirmed
    }

    pub fn pending_nonce(&self) -> u64 {
        self.nonces.pending()
    }

    pub fn confirmed_nonce(&self) -> u64 {
        self.nonces.confirmed()
    }

    pub fn nonce_delta(&self, nonce: u64) -> i128 {
        self.nonces.delta(nonce)
    }

    pub fn use_fee_market(&self) -> bool {
        self.use_fee_market.load(Ordering::SeqCst)
    }

    /// Switch to legacy pricing. Returns true if this call made the switch.
    pub fn disable_fee_market(&self) -> bool {
        self.use_fee_market.swap(false, Ordering::SeqCst)
    }

    pub async fn record_balance(&self, balance: U256) {
        self.diagnostics.write().await.last_seen_balance = Some(balance);
    }

    #[cfg(test)]
    pub async fn last_seen_balance(&self) -> Option<U256> {
        self.diagnostics.read().await.last_seen_balance
    }

    pub async fn mark_requested(&self) {
        self.diagnostics.write().await.last_requested_at = Some(Utc::now());
    }

    pub async fn mark_confirmed(&self) {
        self.diagnostics.write().await.last_confirmed_at = Some(Utc::now());
    }

    /// Remember an error string; duplicates are ignored, oldest evicted first
    pub async fn record_error(&self, message: impl Into<String>) {
        let message = message.into();
        let mut diagnostics = self.diagnostics.write().await;
        let errors = &mut diagnostics.recent_errors;

        if errors.contains(&message) {
            return;
        }
        if errors.len() == MAX_RECENT_ERRORS {
            errors.pop_front();
        }
        errors.push_back(message);
    }

    pub async fn recent_errors(&self) -> Vec<String> {
        self.diagnostics.read().await.recent_errors.iter().cloned().collect()
    }

    /// Atomically check the cooldown for `requester` and record `now` if it
    /// has passed. On refusal returns the seconds left to wait.
    pub fn try_claim_requester(
        &self,
        requester: Address,
        now: DateTime<Utc>,
        cooldown: Duration,
    ) -> Result<(), u64> {
        match self.requester_cooldown.entry(requester) {
            Entry::Occupied(mut entry) => {
                let ready_at = *entry.get() + cooldown;
                if now < ready_at {
                    let remaining = (ready_at - now).num_seconds().max(1);
                    return Err(remaining as u64);
                }
                entry.insert(now);
            }
            Entry::Vacant(entry) => {
                entry.insert(now);
            }
        }
        Ok(())
    }

    /// Forget a claim, e.g. when the payout failed
    pub fn release_requester(&self, requester: &Address) {
        self.requester_cooldown.remove(requester);
    }

    pub fn requester_count(&self) -> usize {
        self.requester_cooldown.len()
    }

    /// Snapshot for the status view
    pub async fn status(&self) -> ChainStatus {
        let diagnostics = self.diagnostics.read().await;
        ChainStatus {
            chain_id: self.chain_id,
            pending_nonce: self.pending_nonce(),
            confirmed_nonce: self.confirmed_nonce(),
            fee_market: self.use_fee_market(),
            last_seen_balance: diagnostics.last_seen_balance.map(|b| b.to_string()),
            last_requested_at: diagnostics.last_requested_at,
            last_confirmed_at: diagnostics.last_confirmed_at,
            tracked_requesters: self.requester_count(),
            recent_errors: diagnostics.recent_errors.iter().cloned().collect(),
        }
    }
}
