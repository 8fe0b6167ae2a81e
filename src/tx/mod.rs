//! Transaction submission: nonce sequencing, fee selection, retries and signing

mod gas;
mod nonce;
pub mod retry;
mod sender;
pub mod signer;

pub use nonce::NonceSequencer;
pub use sender::{TransactionSender, TransferOutcome};
pub use signer::{TxSigner, WalletSigner};
