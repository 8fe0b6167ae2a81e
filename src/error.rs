//! Error types for the faucet

use thiserror::Error;

/// JSON-RPC "method not found"
const METHOD_NOT_FOUND: i64 = -32601;

/// Main error type for the faucet
#[derive(Error, Debug)]
pub enum FaucetError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("RPC error on chain {chain_id}: {source}")]
    Rpc {
        chain_id: u64,
        #[source]
        source: RpcFailure,
    },

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Chain {0} not found")]
    ChainNotFound(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Address {address} must wait {remaining_secs}s before requesting again")]
    Cooldown { address: String, remaining_secs: u64 },

    #[error("Faucet is dry")]
    FaucetDry { chain_id: u64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FaucetError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            FaucetError::Rpc { source, .. } => source.kind() == RpcErrorKind::Transient,
            _ => false,
        }
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(self, FaucetError::FaucetDry { .. } | FaucetError::Wallet(_))
    }
}

/// Result type for faucet operations
pub type FaucetResult<T> = Result<T, FaucetError>;

/// Typed failure surfaced by the RPC facade
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} (code {code})")]
pub struct RpcFailure {
    pub message: String,
    pub code: i64,
}

/// Classification of RPC failures used by the retry policies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcErrorKind {
    /// Timeouts, 5xx, malformed responses
    Transient,
    /// A variant of this transaction (or a predecessor) is already accepted
    KnownTransaction,
    /// The node does not support the requested feature
    Unsupported,
}

impl RpcFailure {
    pub fn new(message: impl Into<String>, code: i64) -> Self {
        Self {
            message: message.into(),
            code,
        }
    }

    /// Failure with no JSON-RPC error code (transport level)
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(message, 0)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(message, METHOD_NOT_FOUND)
    }

    pub fn kind(&self) -> RpcErrorKind {
        let msg = self.message.to_lowercase();

        if msg.contains("already known")
            || msg.contains("known transaction")
            || msg.contains("replacement transaction underpriced")
            || msg.contains("nonce too low")
        {
            return RpcErrorKind::KnownTransaction;
        }

        if self.code == METHOD_NOT_FOUND
            || msg.contains("not supported")
            || msg.contains("not available")
            || msg.contains("does not exist")
        {
            return RpcErrorKind::Unsupported;
        }

        RpcErrorKind::Transient
    }
}
