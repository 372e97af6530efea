//! Keypair generation and management for node operators and the spork signer.

use ed25519_dalek::{Keypair, PublicKey, SecretKey, Signature, Signer};
use rand::rngs::OsRng;

use crate::signature::CryptoError;

/// An ed25519 key pair held by a running node.
pub struct NodeKeyPair {
    keypair: Keypair,
}

impl NodeKeyPair {
    /// Generates a new random key pair.
    pub fn generate() -> Self {
        let mut csprng = OsRng {};
        let keypair = Keypair::generate(&mut csprng);
        NodeKeyPair { keypair }
    }

    /// Rebuilds a key pair from its 32-byte secret.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let secret = SecretKey::from_bytes(bytes).map_err(|_| CryptoError::InvalidSecretKey)?;
        let public = PublicKey::from(&secret);
        Ok(NodeKeyPair { keypair: Keypair { secret, public } })
    }

    pub fn from_secret_hex(hex_str: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(hex_str.trim()).map_err(|e| CryptoError::Hex(e.to_string()))?;
        Self::from_secret_bytes(&bytes)
    }

    pub fn public_key(&self) -> PublicKey {
        self.keypair.public
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.keypair.public.to_bytes()
    }

    /// Signs the given message with the secret key.
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.keypair.sign(message)
    }
}

impl std::fmt::Debug for NodeKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeKeyPair({})", hex::encode(self.public_key_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_keys_differ() {
        let a = NodeKeyPair::generate();
        let b = NodeKeyPair::generate();
        assert_ne!(a.public_key_bytes(), b.public_key_bytes());
    }

    #[test]
    fn test_rfc8032_vector_public_key() {
        let kp = NodeKeyPair::from_secret_hex(
            "9d61b19deffd5a60ba844af492ec2cc44449c5697b326919703bac031cae7f60",
        )
        .unwrap();
        assert_eq!(
            hex::encode(kp.public_key_bytes()),
            "d75a980182b10ab7d54bfed3c964073a0ee172f3daa62325af021a68f707511a"
        );
    }

    #[test]
    fn test_bad_secret_rejected() {
        assert!(matches!(NodeKeyPair::from_secret_bytes(&[1u8; 5]), Err(CryptoError::InvalidSecretKey)));
        assert!(matches!(NodeKeyPair::from_secret_hex("xyz"), Err(CryptoError::Hex(_))));
    }
}
