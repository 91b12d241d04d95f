//! Minimal Ethereum signer implementation using k256
//!
//! Implements only what the ledger path needs:
//! - Key parsing (hex or raw bytes)
//! - Address derivation
//! - Recoverable prehash signing

use std::fmt;
use std::str::FromStr;

use alloy_primitives::{keccak256, Address, B256};
use k256::ecdsa::{RecoveryId, SigningKey, VerifyingKey};

/// Recoverable secp256k1 signature in Ethereum's (r, s, parity) form
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoverableSignature {
    pub r: [u8; 32],
    pub s: [u8; 32],
    pub y_parity: bool,
}

impl RecoverableSignature {
    /// 65-byte `r || s || v` with legacy `v = 27 + parity`
    pub fn to_bytes(&self) -> [u8; 65] {
        let mut out = [0u8; 65];
        out[..32].copy_from_slice(&self.r);
        out[32..64].copy_from_slice(&self.s);
        out[64] = 27 + self.y_parity as u8;
        out
    }
}

/// A minimal Ethereum private key signer
#[derive(Clone)]
pub struct EvmSigner {
    key: SigningKey,
    /// Cached Ethereum address (derived from public key)
    address: Address,
}

impl EvmSigner {
    pub fn new(key: SigningKey) -> Self {
        let address = Self::derive_address(&key);
        Self { key, address }
    }

    /// Generate a random private key
    pub fn random() -> Self {
        let key = SigningKey::random(&mut rand::rngs::OsRng);
        Self::new(key)
    }

    /// Create a signer from raw bytes (32 bytes)
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SignerError> {
        let key = SigningKey::from_slice(bytes).map_err(|_| SignerError::InvalidKey)?;
        Ok(Self::new(key))
    }

    /// Create a signer from a hex string (with or without 0x prefix)
    pub fn from_hex(s: &str) -> Result<Self, SignerError> {
        let s = s.trim();
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(s).map_err(|_| SignerError::InvalidHex)?;
        Self::from_bytes(&bytes)
    }

    pub fn address(&self) -> Address {
        self.address
    }

    fn derive_address(key: &SigningKey) -> Address {
        Self::address_from_verifying_key(key.verifying_key())
    }

    fn address_from_verifying_key(key: &VerifyingKey) -> Address {
        // Uncompressed point is 0x04 || x || y; the address hashes x || y
        let public_key = key.to_encoded_point(false);
        let hash = keccak256(&public_key.as_bytes()[1..]);
        Address::from_slice(&hash[12..])
    }

    /// Sign a 32-byte hash
    pub fn sign_hash_sync(&self, hash: &B256) -> Result<RecoverableSignature, SignerError> {
        let (signature, recovery_id) = self
            .key
            .sign_prehash_recoverable(hash.as_slice())
            .map_err(|_| SignerError::SigningFailed)?;

        Ok(RecoverableSignature {
            r: signature.r().to_bytes().into(),
            s: signature.s().to_bytes().into(),
            y_parity: recovery_id.is_y_odd(),
        })
    }
}

impl FromStr for EvmSigner {
    type Err = SignerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl fmt::Debug for EvmSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvmSigner")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// Errors that can occur during signing operations
#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    #[error("Invalid private key")]
    InvalidKey,
    #[error("Invalid hex string")]
    InvalidHex,
    #[error("Signing failed")]
    SigningFailed,
    #[error("Invalid signature format")]
    InvalidSignature,
    #[error("Signature recovery failed")]
    RecoveryFailed,
}

/// Recover the signing address from a signature over `hash`
pub fn recover_address(signature: &RecoverableSignature, hash: &B256) -> Result<Address, SignerError> {
    let sig = k256::ecdsa::Signature::from_scalars(signature.r, signature.s)
        .map_err(|_| SignerError::InvalidSignature)?;
    let recid = RecoveryId::new(signature.y_parity, false);
    let recovered = VerifyingKey::recover_from_prehash(hash.as_slice(), &sig, recid)
        .map_err(|_| SignerError::RecoveryFailed)?;
    Ok(EvmSigner::address_from_verifying_key(&recovered))
}

/// Trait for types that can sign hashes
#[async_trait::async_trait]
pub trait Signer: Send + Sync {
    fn address(&self) -> Address;

    async fn sign_hash(&self, hash: &B256) -> Result<RecoverableSignature, SignerError>;
}

#[async_trait::async_trait]
impl Signer for EvmSigner {
    fn address(&self) -> Address {
        self.address
    }

    async fn sign_hash(&self, hash: &B256) -> Result<RecoverableSignature, SignerError> {
        self.sign_hash_sync(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_signer() {
        let signer = EvmSigner::random();
        assert_ne!(signer.address(), Address::ZERO);
    }

    #[test]
    fn test_from_hex() {
        let hex_key = "0x0000000000000000000000000000000000000000000000000000000000000001";
        let signer = EvmSigner::from_str(hex_key).unwrap();

        // Known address for private key = 1 (checksummed format)
        assert_eq!(signer.address().to_string(), "0x7E5F4552091A69125d5DfCb7b8C2659029395Bdf");
    }

    #[test]
    fn test_rejects_bad_keys() {
        assert!(matches!(EvmSigner::from_hex("zz"), Err(SignerError::InvalidHex)));
        assert!(matches!(EvmSigner::from_hex("00"), Err(SignerError::InvalidKey)));
        // Zero is not a valid scalar
        assert!(EvmSigner::from_hex(&"00".repeat(32)).is_err());
    }

    #[test]
    fn test_sign_and_recover() {
        let signer = EvmSigner::random();
        let hash = keccak256(b"test message");

        let signature = signer.sign_hash_sync(&hash).unwrap();
        assert_eq!(recover_address(&signature, &hash).unwrap(), signer.address());

        let bytes = signature.to_bytes();
        assert!(bytes[64] == 27 || bytes[64] == 28);
    }

    #[tokio::test]
    async fn test_async_signing_via_trait() {
        let signer: Box<dyn Signer> = Box::new(EvmSigner::random());
        let hash = keccak256(b"test");
        let signature = signer.sign_hash(&hash).await.unwrap();
        assert_eq!(recover_address(&signature, &hash).unwrap(), signer.address());
    }
}
