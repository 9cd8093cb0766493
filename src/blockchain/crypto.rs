use ed25519_dalek::{
    Signature, Signer, SigningKey, Verifier, VerifyingKey, PUBLIC_KEY_LENGTH, SECRET_KEY_LENGTH,
    SIGNATURE_LENGTH,
};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::fmt;
use std::str::FromStr;

/// Errors from decoding keys, addresses and signatures
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Not valid base58: {0}")]
    Base58(#[from] bs58::decode::Error),

    #[error("Not valid hex: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("Malformed key: {0}")]
    InvalidKey(String),

    #[error("Signature must be 64 bytes, got {0}")]
    InvalidSignature(usize),
}

/// An account on the ledger.
///
/// The address is the base58 text of the owner's Ed25519 verifying key, so a
/// peer checks a transfer's signature from the transaction alone, with no key
/// registry to consult.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(pub String);

impl Address {
    pub fn from_public_key(public_key: &VerifyingKey) -> Self {
        Address(bs58::encode(public_key.as_bytes()).into_string())
    }

    /// Decodes the verifying key this address stands for
    pub fn to_public_key(&self) -> Result<VerifyingKey, CryptoError> {
        let bytes: [u8; PUBLIC_KEY_LENGTH] = bs58::decode(&self.0)
            .into_vec()?
            .try_into()
            .map_err(|bytes: Vec<u8>| {
                CryptoError::InvalidKey(format!("address decodes to {} bytes", bytes.len()))
            })?;

        VerifyingKey::from_bytes(&bytes).map_err(|e| CryptoError::InvalidKey(e.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Accepts only text that decodes to a usable verifying key
impl FromStr for Address {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let address = Address(s.trim().to_string());
        address.to_public_key()?;
        Ok(address)
    }
}

/// A base58 encoded Ed25519 signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigitalSignature(pub String);

impl DigitalSignature {
    pub fn from_signature(signature: &Signature) -> Self {
        DigitalSignature(bs58::encode(signature.to_bytes()).into_string())
    }

    pub fn to_signature(&self) -> Result<Signature, CryptoError> {
        let bytes: [u8; SIGNATURE_LENGTH] = bs58::decode(&self.0)
            .into_vec()?
            .try_into()
            .map_err(|bytes: Vec<u8>| CryptoError::InvalidSignature(bytes.len()))?;

        Ok(Signature::from_bytes(&bytes))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A signing key and the address it controls
#[derive(Debug, Clone)]
pub struct Wallet {
    signing_key: SigningKey,
    address: Address,
}

impl Wallet {
    /// Generates a fresh keypair from the OS random source
    pub fn new() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    pub fn from_secret_key(secret_key: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; SECRET_KEY_LENGTH] = secret_key.try_into().map_err(|_| {
            CryptoError::InvalidKey(format!(
                "secret key must be {} bytes, got {}",
                SECRET_KEY_LENGTH,
                secret_key.len()
            ))
        })?;

        Ok(Self::from_signing_key(SigningKey::from_bytes(&bytes)))
    }

    /// Restores a wallet from the hex text handed out by `POST /wallet/new`
    pub fn from_hex(secret_key_hex: &str) -> Result<Self, CryptoError> {
        Self::from_secret_key(&hex::decode(secret_key_hex.trim())?)
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let address = Address::from_public_key(&signing_key.verifying_key());
        Wallet {
            signing_key,
            address,
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn sign(&self, digest: &[u8]) -> DigitalSignature {
        DigitalSignature::from_signature(&self.signing_key.sign(digest))
    }

    pub fn export_secret_key(&self) -> Vec<u8> {
        self.signing_key.to_bytes().to_vec()
    }
}

impl Default for Wallet {
    fn default() -> Self {
        Self::new()
    }
}

/// Verifies a signature against a digest and public key.
///
/// Malformed signatures are errors; a well-formed signature that does not
/// match is `Ok(false)`.
pub fn verify_signature(
    digest: &[u8],
    signature: &DigitalSignature,
    public_key: &VerifyingKey,
) -> Result<bool, CryptoError> {
    let signature = signature.to_signature()?;
    Ok(public_key.verify(digest, &signature).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_verifies_from_address() {
        let wallet = Wallet::new();
        let key = wallet.address().to_public_key().unwrap();
        let signature = wallet.sign(b"transfer digest");

        assert!(verify_signature(b"transfer digest", &signature, &key).unwrap());
        assert!(!verify_signature(b"another digest", &signature, &key).unwrap());
    }

    #[test]
    fn test_verification_with_other_key_fails() {
        let signer = Wallet::new();
        let other = Wallet::new().address().to_public_key().unwrap();
        let signature = signer.sign(b"digest");

        assert!(!verify_signature(b"digest", &signature, &other).unwrap());
    }

    #[test]
    fn test_malformed_signature_is_an_error() {
        let key = Wallet::new().address().to_public_key().unwrap();

        let short = DigitalSignature("abc".to_string());
        assert!(matches!(
            verify_signature(b"digest", &short, &key),
            Err(CryptoError::InvalidSignature(_))
        ));

        let not_base58 = DigitalSignature("0OIl".to_string());
        assert!(matches!(
            verify_signature(b"digest", &not_base58, &key),
            Err(CryptoError::Base58(_))
        ));
    }

    #[test]
    fn test_address_parsing() {
        let wallet = Wallet::new();
        let parsed: Address = wallet.address().to_string().parse().unwrap();
        assert_eq!(&parsed, wallet.address());

        assert!("not base58!".parse::<Address>().is_err());
        // Valid base58 but too short for a key
        assert!("3mJr7AoUXx2Wqd".parse::<Address>().is_err());
    }

    #[test]
    fn test_wallet_from_hex_roundtrip() {
        let wallet = Wallet::new();
        let secret = hex::encode(wallet.export_secret_key());

        let restored = Wallet::from_hex(&secret).unwrap();
        assert_eq!(restored.address(), wallet.address());

        assert!(matches!(Wallet::from_hex("not-hex"), Err(CryptoError::Hex(_))));
        assert!(matches!(Wallet::from_hex("abcd"), Err(CryptoError::InvalidKey(_))));
    }
}
