//! Keys, signatures and hashing.
//!
//! Signatures are secp256k1 ECDSA in compact form over the SHA-256 digest
//! of the signed payload. Keys travel as hex of the compressed point.

use crate::error::ChainError;
use once_cell::sync::Lazy;
use rand::rngs::OsRng;
use secp256k1::{
    constants::{COMPACT_SIGNATURE_SIZE, PUBLIC_KEY_SIZE, SECRET_KEY_SIZE},
    ecdsa::Signature,
    All, Message, PublicKey, Secp256k1, SecretKey,
};
use sha2::{Digest, Sha256};

static SECP256K1_CONTEXT: Lazy<Secp256k1<All>> = Lazy::new(Secp256k1::new);

/// SHA-256 digest used for block hashes, merkle roots and transaction ids.
pub type Hash = [u8; 32];

pub fn sha256(data: &[u8]) -> Hash {
    Sha256::digest(data).into()
}

/// Signature checks consumed by the consensus core.
pub trait SignatureService: Send + Sync {
    fn verify(&self, public_key: &[u8], message: &[u8], signature: &[u8]) -> bool;
}

/// Default [`SignatureService`] backed by secp256k1 ECDSA over SHA-256.
#[derive(Debug, Clone, Copy, Default)]
pub struct Secp256k1Verifier;

impl SignatureService for Secp256k1Verifier {
    fn verify(&self, public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
        verify_signature(public_key, message, signature).is_ok()
    }
}

/// Node identity: signs blocks, votes and voting totals.
#[derive(Debug, Clone)]
pub struct KeyPair {
    pub secret_key: SecretKey,
    pub public_key: PublicKey,
}

fn crypto_err(context: &str, e: impl std::fmt::Display) -> ChainError {
    ChainError::CryptoError(format!("{}: {}", context, e))
}

/// Every payload is signed over its SHA-256 digest.
fn payload_digest(payload: &[u8]) -> Result<Message, ChainError> {
    Message::from_digest_slice(&Sha256::digest(payload)).map_err(|e| crypto_err("bad digest", e))
}

impl KeyPair {
    pub fn generate() -> Result<Self, ChainError> {
        Ok(Self::from_secret_key(SecretKey::new(&mut OsRng)))
    }

    pub fn from_secret_key(secret_key: SecretKey) -> Self {
        let public_key = PublicKey::from_secret_key(&SECP256K1_CONTEXT, &secret_key);
        KeyPair {
            secret_key,
            public_key,
        }
    }

    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, ChainError> {
        if bytes.len() != SECRET_KEY_SIZE {
            return Err(ChainError::CryptoError(format!(
                "Secret key must be {} bytes, got {}",
                SECRET_KEY_SIZE,
                bytes.len()
            )));
        }
        let secret_key =
            SecretKey::from_slice(bytes).map_err(|e| crypto_err("unusable secret key", e))?;
        Ok(Self::from_secret_key(secret_key))
    }

    /// Parses `node.private_key` from the config.
    pub fn from_secret_hex(hex_str: &str) -> Result<Self, ChainError> {
        let bytes = hex::decode(hex_str.trim())?;
        Self::from_secret_bytes(&bytes)
    }

    /// Compressed public key bytes.
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.public_key.serialize()
    }

    /// Lower-case hex of the compressed public key, the form used to look the
    /// node up in the honor list and the candidate registry.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key_bytes())
    }

    /// Compact signature over `payload`.
    pub fn sign(&self, payload: &[u8]) -> Result<[u8; COMPACT_SIGNATURE_SIZE], ChainError> {
        let digest = payload_digest(payload)?;
        Ok(SECP256K1_CONTEXT
            .sign_ecdsa(&digest, &self.secret_key)
            .serialize_compact())
    }
}

/// Checks a compact signature made by [`KeyPair::sign`] against a compressed
/// public key.
pub fn verify_signature(
    public_key: &[u8],
    payload: &[u8],
    signature: &[u8],
) -> Result<(), ChainError> {
    if public_key.len() != PUBLIC_KEY_SIZE {
        return Err(ChainError::CryptoError(format!(
            "Public key must be {} bytes, got {}",
            PUBLIC_KEY_SIZE,
            public_key.len()
        )));
    }
    if signature.len() != COMPACT_SIGNATURE_SIZE {
        return Err(ChainError::CryptoError(format!(
            "Signature must be {} bytes, got {}",
            COMPACT_SIGNATURE_SIZE,
            signature.len()
        )));
    }
    let public_key =
        PublicKey::from_slice(public_key).map_err(|e| crypto_err("unusable public key", e))?;
    let signature =
        Signature::from_compact(signature).map_err(|e| crypto_err("malformed signature", e))?;

    SECP256K1_CONTEXT
        .verify_ecdsa(&payload_digest(payload)?, &signature, &public_key)
        .map_err(|_| ChainError::CryptoError("Signature verification failed".to_string()))
}
