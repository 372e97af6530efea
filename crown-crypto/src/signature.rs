//! Signed-message scheme used by broadcasts, pings, votes and sporks.
//!
//! A message string is prefixed with a network magic, hashed with double SHA256 and the digest is
//! signed with ed25519.

use ed25519_dalek::{PublicKey, Signature, Verifier};
use log::debug;
use thiserror::Error;

use crate::hash::sha256d;
use crate::keypair::NodeKeyPair;

pub const MESSAGE_MAGIC: &str = "Crown Signed Message:\n";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("invalid secret key")]
    InvalidSecretKey,
    #[error("invalid signature encoding (length {0})")]
    InvalidSignature(usize),
    #[error("signature verification failed")]
    VerificationFailed,
    #[error("hex decoding failed: {0}")]
    Hex(String),
}

/// Digest committed to by a signed message.
pub fn message_digest(message: &str) -> [u8; 32] {
    let mut data = Vec::with_capacity(MESSAGE_MAGIC.len() + message.len());
    data.extend_from_slice(MESSAGE_MAGIC.as_bytes());
    data.extend_from_slice(message.as_bytes());
    sha256d(&data)
}

pub fn parse_public_key(bytes: &[u8]) -> Result<PublicKey, CryptoError> {
    PublicKey::from_bytes(bytes).map_err(|_| CryptoError::InvalidPublicKey)
}

pub fn parse_public_key_hex(hex_str: &str) -> Result<PublicKey, CryptoError> {
    let bytes = hex::decode(hex_str.trim()).map_err(|e| CryptoError::Hex(e.to_string()))?;
    parse_public_key(&bytes)
}

pub fn sign_message(keypair: &NodeKeyPair, message: &str) -> Vec<u8> {
    keypair.sign(&message_digest(message)).to_bytes().to_vec()
}

pub fn verify_message(public_key: &[u8; 32], signature: &[u8], message: &str) -> Result<(), CryptoError> {
    let public_key = parse_public_key(public_key)?;
    let signature =
        Signature::try_from(signature).map_err(|_| CryptoError::InvalidSignature(signature.len()))?;
    public_key.verify(&message_digest(message), &signature).map_err(|_| {
        debug!("signature check failed for message {:?}", message);
        CryptoError::VerificationFailed
    })
}
