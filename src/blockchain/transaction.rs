use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::crypto::{verify_signature, Address, CryptoError, DigitalSignature, Wallet};

/// Errors that can occur during transaction operations
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("Signing key does not belong to the sender address")]
    UnauthorizedSigner,

    #[error("No signature in transaction")]
    MissingSignature,

    #[error("Transaction already signed")]
    AlreadySigned,

    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),

    #[error("System error: {0}")]
    SystemError(String),
}

/// A transfer of value between two addresses.
///
/// A transaction without `from_address` is a mining reward minted by the
/// network and needs no signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Sender's address, `None` for a mining reward
    pub from_address: Option<Address>,

    /// Recipient's address
    pub to_address: Address,

    /// Amount being transferred
    pub amount: f64,

    /// Creation time in milliseconds since the Unix epoch
    pub timestamp: i64,

    /// Signature over the transaction digest
    pub signature: Option<DigitalSignature>,
}

impl Transaction {
    /// Creates a new unsigned transfer
    pub fn new(from_address: Address, to_address: Address, amount: f64) -> Self {
        Transaction {
            from_address: Some(from_address),
            to_address,
            amount,
            timestamp: Utc::now().timestamp_millis(),
            signature: None,
        }
    }

    /// Creates a mining reward paid to `to_address`
    pub fn new_reward(to_address: Address, amount: f64) -> Self {
        Transaction {
            from_address: None,
            to_address,
            amount,
            timestamp: Utc::now().timestamp_millis(),
            signature: None,
        }
    }

    /// Checks if the transaction is a mining reward
    pub fn is_reward(&self) -> bool {
        self.from_address.is_none()
    }

    /// Hex encoded SHA-256 digest of the signed fields.
    ///
    /// `json!` sorts object keys, so every node produces the same bytes.
    pub fn calculate_digest(&self) -> Result<String, TransactionError> {
        let data = serde_json::json!({
            "from_address": self.from_address.as_ref().map(|a| a.0.as_str()),
            "to_address": self.to_address.0,
            "amount": self.amount,
            "timestamp": self.timestamp,
        });

        let bytes =
            serde_json::to_vec(&data).map_err(|e| TransactionError::SystemError(e.to_string()))?;

        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    /// Signs the transaction with the sender's wallet
    pub fn sign(&mut self, wallet: &Wallet) -> Result<(), TransactionError> {
        if self.from_address.as_ref() != Some(wallet.address()) {
            return Err(TransactionError::UnauthorizedSigner);
        }

        if self.signature.is_some() {
            return Err(TransactionError::AlreadySigned);
        }

        let digest = self.calculate_digest()?;
        self.signature = Some(wallet.sign(digest.as_bytes()));

        Ok(())
    }

    /// Checks the signature against the sender's public key.
    ///
    /// Rewards are always valid. An unsigned transfer is an error; a transfer
    /// whose address or signature cannot be decoded is simply invalid.
    pub fn is_valid(&self) -> Result<bool, TransactionError> {
        let from_address = match &self.from_address {
            Some(address) => address,
            None => return Ok(true),
        };

        let signature = match &self.signature {
            Some(sig) if !sig.is_empty() => sig,
            _ => return Err(TransactionError::MissingSignature),
        };

        let public_key = match from_address.to_public_key() {
            Ok(key) => key,
            Err(_) => return Ok(false),
        };

        let digest = self.calculate_digest()?;

        Ok(verify_signature(digest.as_bytes(), signature, &public_key).unwrap_or(false))
    }
}
