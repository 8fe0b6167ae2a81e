//! Transaction signing and encoding

use crate::error::{FaucetError, FaucetResult};

use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, H256};

/// A signed, encoded transaction ready for broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransfer {
    pub raw: Bytes,
    pub hash: H256,
}

/// Pure signing boundary: no I/O
pub trait TxSigner: Send + Sync {
    fn address(&self) -> Address;

    /// Sign `tx` (legacy or EIP-1559, by its shape) and encode it
    fn sign(&self, tx: &TypedTransaction) -> FaucetResult<SignedTransfer>;
}

/// Signer holding a hex private key in memory
pub struct WalletSigner {
    wallet: LocalWallet,
}

impl WalletSigner {
    pub fn new(wallet: LocalWallet) -> Self {
        Self { wallet }
    }

    /// Load the wallet from the environment variable named in config
    pub fn from_env(var: &str) -> FaucetResult<Self> {
        let key = std::env::var(var).map_err(|_| {
            FaucetError::Wallet(format!("No wallet configured. Set {}", var))
        })?;
        Self::from_key(&key)
    }

    pub fn from_key(key: &str) -> FaucetResult<Self> {
        key.trim()
            .trim_start_matches("0x")
            .parse::<LocalWallet>()
            .map(Self::new)
            .map_err(|e| FaucetError::Wallet(format!("Invalid private key: {}", e)))
    }
}

impl TxSigner for WalletSigner {
    fn address(&self) -> Address {
        self.wallet.address()
    }

    fn sign(&self, tx: &TypedTransaction) -> FaucetResult<SignedTransfer> {
        let signature = self
            .wallet
            .sign_transaction_sync(tx)
            .map_err(|e| FaucetError::Wallet(e.to_string()))?;

        Ok(SignedTransfer {
            raw: tx.rlp_signed(&signature),
            hash: tx.hash(&signature),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::DEV_KEY;
    use ethers::types::{Eip1559TransactionRequest, TransactionRequest, U256};
    use ethers::utils::keccak256;

    fn legacy(nonce: u64, price: u64) -> TypedTransaction {
        TransactionRequest::new()
            .to(Address::repeat_byte(0x11))
            .value(1_000u64)
            .nonce(nonce)
            .gas(21_000u64)
            .gas_price(price)
            .chain_id(5u64)
            .into()
    }

    #[test]
    fn test_derives_known_address() {
        let signer = WalletSigner::from_key(DEV_KEY).unwrap();
        let expected: Address = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266".parse().unwrap();
        assert_eq!(signer.address(), expected);
    }

    #[test]
    fn test_hash_is_keccak_of_raw() {
        let signer = WalletSigner::from_key(DEV_KEY).unwrap();
        let signed = signer.sign(&legacy(0, 1_000_000_000)).unwrap();
        assert_eq!(signed.hash, H256::from(keccak256(&signed.raw)));
    }

    #[test]
    fn test_fee_bump_produces_new_hash() {
        let signer = WalletSigner::from_key(DEV_KEY).unwrap();
        let a = signer.sign(&legacy(3, 1_000_000_000)).unwrap();
        let b = signer.sign(&legacy(3, 1_200_000_000)).unwrap();
        assert_ne!(a.hash, b.hash);
    }

    #[test]
    fn test_eip1559_is_typed_envelope() {
        let signer = WalletSigner::from_key(DEV_KEY).unwrap();
        let tx: TypedTransaction = Eip1559TransactionRequest::new()
            .to(Address::repeat_byte(0x22))
            .value(U256::from(1u64))
            .nonce(0u64)
            .gas(21_000u64)
            .max_fee_per_gas(30_000_000_000u64)
            .max_priority_fee_per_gas(1_000_000_000u64)
            .chain_id(5u64)
            .into();

        let signed = signer.sign(&tx).unwrap();
        assert_eq!(signed.raw.first(), Some(&0x02));
    }

    #[test]
    fn test_rejects_garbage_key() {
        assert!(matches!(
            WalletSigner::from_key("not-a-key"),
            Err(FaucetError::Wallet(_))
        ));
    }
}
