//! Nonce sequencing for reliable transaction submission
//!
//! Handles:
//! - Lock-free reservation of the next nonce for a chain
//! - Giving back nonces of transfers that failed before broadcasting
//! - A monotone "confirmed" ratchet tracking the next nonce expected on chain
//! - Window arithmetic between the two

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Per-chain nonce state
#[derive(Debug)]
pub struct NonceSequencer {
    /// Next nonce to hand out
    pending: AtomicU64,
    /// Next nonce expected on chain; only ever raised
    confirmed: AtomicU64,
    /// Nonces below `pending` that were given back and must be reused first
    released: Mutex<BTreeSet<u64>>,
}

impl NonceSequencer {
    /// Create a sequencer seeded from on-chain transaction counts
    pub fn new(pending: u64, confirmed: u64) -> Self {
        Self {
            pending: AtomicU64::new(pending.max(confirmed)),
            confirmed: AtomicU64::new(confirmed),
            released: Mutex::new(BTreeSet::new()),
        }
    }

    /// Reserve the next nonce. Never hands out the same value twice.
    ///
    /// Returns `None` once the account nonce space is exhausted (EIP-2681
    /// caps nonces below `u64::MAX`).
    pub fn reserve(&self) -> Option<u64> {
        if let Some(nonce) = self.take_released() {
            debug!("Reused released nonce {}", nonce);
            return Some(nonce);
        }

        let nonce = self
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_add(1))
            .ok()?;
        debug!("Reserved nonce {}", nonce);
        Some(nonce)
    }

    /// Give back a nonce whose transfer ended without broadcasting anything.
    ///
    /// The newest reservation rewinds the counter; an older one is queued and
    /// handed to the next [`reserve`](Self::reserve) so no gap is left on
    /// chain. Nonces already consumed on chain are dropped.
    pub fn release(&self, nonce: u64) {
        if nonce < self.confirmed() {
            return;
        }

        let rewound = nonce.checked_add(1).is_some_and(|next| {
            self.pending
                .compare_exchange(next, nonce, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        });

        if rewound {
            debug!("Released newest nonce {}", nonce);
        } else {
            debug!("Queued released nonce {} for reuse", nonce);
            self.released_set().insert(nonce);
        }
    }

    fn take_released(&self) -> Option<u64> {
        let confirmed = self.confirmed();
        let mut released = self.released_set();
        // Anything below the ratchet was used on chain by someone else
        *released = released.split_off(&confirmed);
        released.pop_first()
    }

    fn released_set(&self) -> MutexGuard<'_, BTreeSet<u64>> {
        self.released.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Raise the confirmed nonce to `candidate` if it is larger.
    ///
    /// Returns the value held after the update.
    pub fn advance_confirmed(&self, candidate: u64) -> u64 {
        let previous = self.confirmed.fetch_max(candidate, Ordering::SeqCst);
        // Keep reservations ahead of anything observed on chain
        self.pending.fetch_max(candidate, Ordering::SeqCst);
        previous.max(candidate)
    }

    pub fn pending(&self) -> u64 {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn confirmed(&self) -> u64 {
        self.confirmed.load(Ordering::SeqCst)
    }

    /// Signed distance between `nonce` and the next nonce expected on chain
    pub fn delta(&self, nonce: u64) -> i128 {
        i128::from(nonce) - i128::from(self.confirmed())
    }
}
