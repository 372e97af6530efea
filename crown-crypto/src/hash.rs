//! Hashing helpers and standard script construction.

use crown_shared_types::{Hash, PubKeyHash, PublicKey};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

/// Calculate SHA256 hash of input data
pub fn calculate_sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Double SHA256, the digest signed messages are committed to.
pub fn sha256d(data: &[u8]) -> Hash {
    calculate_sha256(&calculate_sha256(data))
}

/// RIPEMD160(SHA256(data)).
pub fn hash160(data: &[u8]) -> PubKeyHash {
    let sha = calculate_sha256(data);
    let mut hasher = Ripemd160::new();
    hasher.update(sha);
    hasher.finalize().into()
}

/// Builds `OP_DUP OP_HASH160 <hash> OP_EQUALVERIFY OP_CHECKSIG`.
pub fn p2pkh_script(pubkey_hash: &PubKeyHash) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.push(0x76);
    script.push(0xA9);
    script.push(0x14);
    script.extend_from_slice(pubkey_hash);
    script.push(0x88);
    script.push(0xAC);
    script
}

/// Payee script for a node public key.
pub fn script_for_pubkey(pubkey: &PublicKey) -> Vec<u8> {
    p2pkh_script(&hash160(pubkey))
}
