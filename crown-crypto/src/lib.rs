//! Cryptographic primitives for the Crown quorum layer.

pub mod hash;
pub mod keypair;
pub mod signature;

pub use keypair::NodeKeyPair;
pub use signature::{sign_message, verify_message, CryptoError};
