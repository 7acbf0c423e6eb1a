//! Ethereum-compatible recoverable ECDSA signatures.
//!
//! Signatures are 65 bytes in `r || s || v` layout with `v` in {27, 28}, computed
//! over `keccak256("\x19Ethereum Signed Message:\n" || len || hash)`.

use alloy_primitives::{keccak256, Address, B256};
use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use std::fmt;

use crate::error::SignatureError;

/// Length of an encoded signature.
pub const SIGNATURE_LEN: usize = 65;

/// Offset added to the recovery id, as defined in the yellow paper.
const RECOVERY_OFFSET: u8 = 27;

/// Private key material used to sign channel states.
#[derive(Clone)]
pub struct Credentials {
    key: SigningKey,
}

impl Credentials {
    /// Generate a fresh random key.
    pub fn random() -> Self {
        Self {
            key: SigningKey::random(&mut rand::rngs::OsRng),
        }
    }

    /// Parse a hex encoded 32-byte private key (with or without `0x`).
    pub fn from_hex(key: &str) -> Result<Self, SignatureError> {
        let bytes = hex::decode(key.trim_start_matches("0x"))
            .map_err(|e| SignatureError::InvalidKey(e.to_string()))?;
        let key =
            SigningKey::from_slice(&bytes).map_err(|e| SignatureError::InvalidKey(e.to_string()))?;
        Ok(Self { key })
    }

    /// Hex encoding of the private key.
    pub fn to_hex(&self) -> String {
        hex::encode(self.key.to_bytes())
    }

    /// On-chain address controlled by this key.
    pub fn address(&self) -> Address {
        address_of(self.key.verifying_key())
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}

fn address_of(key: &VerifyingKey) -> Address {
    let point = key.to_encoded_point(false);
    let hash = keccak256(&point.as_bytes()[1..]);
    Address::from_slice(&hash[12..])
}

/// Prefix `data` with the Ethereum signed-message header and hash it again.
pub fn rehash_with_ethereum_prefix(data: &[u8]) -> B256 {
    let mut msg = format!("\x19Ethereum Signed Message:\n{}", data.len()).into_bytes();
    msg.extend_from_slice(data);
    keccak256(&msg)
}

/// Sign `hash` the way Ethereum clients sign personal messages.
pub fn sign_hash_eth(credentials: &Credentials, hash: &[u8]) -> Result<Vec<u8>, SignatureError> {
    let prehash = rehash_with_ethereum_prefix(hash);
    let (signature, recovery_id) = credentials
        .key
        .sign_prehash_recoverable(prehash.as_slice())
        .map_err(|e| SignatureError::Ecdsa(e.to_string()))?;

    let mut out = Vec::with_capacity(SIGNATURE_LEN);
    out.extend_from_slice(&signature.to_bytes());
    out.push(recovery_id.to_byte() + RECOVERY_OFFSET);
    tracing::trace!(signer = %credentials.address(), "hash signed");
    Ok(out)
}

/// Check that `expected` produced `signature` over `hash`.
///
/// Malformed signatures are errors. A well-formed signature from another
/// signer yields `Ok(false)`. The signature bytes are never modified.
pub fn verify_signature_eth(
    hash: &[u8],
    signature: &[u8],
    expected: &Address,
) -> Result<bool, SignatureError> {
    if signature.len() != SIGNATURE_LEN {
        return Err(SignatureError::InvalidLength(signature.len()));
    }
    let v = signature[SIGNATURE_LEN - 1];
    if v != RECOVERY_OFFSET && v != RECOVERY_OFFSET + 1 {
        return Err(SignatureError::InvalidRecoveryByte(v));
    }
    let recovery_id =
        RecoveryId::from_byte(v - RECOVERY_OFFSET).ok_or(SignatureError::InvalidRecoveryByte(v))?;
    let rs = Signature::from_slice(&signature[..SIGNATURE_LEN - 1])
        .map_err(|e| SignatureError::Ecdsa(e.to_string()))?;

    let prehash = rehash_with_ethereum_prefix(hash);
    let signer = VerifyingKey::recover_from_prehash(prehash.as_slice(), &rs, recovery_id)
        .map_err(|e| SignatureError::Ecdsa(e.to_string()))?;

    Ok(address_of(&signer) == *expected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_verify() {
        let creds = Credentials::random();
        let hash = keccak256(b"channel state");

        let sig = sign_hash_eth(&creds, hash.as_slice()).unwrap();
        assert_eq!(sig.len(), SIGNATURE_LEN);
        assert!(sig[64] == 27 || sig[64] == 28);
        assert!(verify_signature_eth(hash.as_slice(), &sig, &creds.address()).unwrap());
    }

    #[test]
    fn wrong_signer_is_false_not_error() {
        let signer = Credentials::random();
        let other = Credentials::random();
        let hash = keccak256(b"channel state");

        let sig = sign_hash_eth(&signer, hash.as_slice()).unwrap();
        assert!(!verify_signature_eth(hash.as_slice(), &sig, &other.address()).unwrap());
    }

    #[test]
    fn malformed_signatures_are_errors() {
        let creds = Credentials::random();
        let hash = keccak256(b"channel state");
        let mut sig = sign_hash_eth(&creds, hash.as_slice()).unwrap();

        assert_eq!(
            verify_signature_eth(hash.as_slice(), &sig[..64], &creds.address()),
            Err(SignatureError::InvalidLength(64))
        );

        sig[64] = 1;
        let before = sig.clone();
        assert_eq!(
            verify_signature_eth(hash.as_slice(), &sig, &creds.address()),
            Err(SignatureError::InvalidRecoveryByte(1))
        );
        assert_eq!(sig, before);
    }

    #[test]
    fn hex_key_roundtrip() {
        let creds = Credentials::random();
        let parsed = Credentials::from_hex(&format!("0x{}", creds.to_hex())).unwrap();
        assert_eq!(parsed.address(), creds.address());
        assert!(Credentials::from_hex("zz").is_err());
    }
}
