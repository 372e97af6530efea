//! Plain data shared by every Crown quorum crate: outpoints, transactions and wire messages.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hash as StdHash;
use std::str::FromStr;
use thiserror::Error;

pub mod messages;

pub use messages::{
    Inventory, InventoryType, LockVote, NodeBroadcast, NodeKind, NodePing, PaymentWinner,
    QuorumMessage, SporkMessage, SyncItem,
};

pub type Hash = [u8; 32];
pub type PublicKey = [u8; 32];
pub type PubKeyHash = [u8; 20];

/// Identifies a peer connection as seen by the network layer.
pub type PeerId = u64;

/// Represents a reference to a specific transaction output.
///
/// Ordering is lexicographic on `(txid, vout)` and is used wherever the quorum layer needs a
/// deterministic order over nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, StdHash, Default, Serialize, Deserialize)]
pub struct OutPoint {
    /// The transaction ID (hash) of the transaction containing the output.
    pub txid: Hash,
    /// The index of the output within that transaction.
    pub vout: u32,
}

impl OutPoint {
    pub fn new(txid: Hash, vout: u32) -> Self {
        OutPoint { txid, vout }
    }

    /// Short form `"<txid-hex>-<vout>"`, used in signed payloads and reference-node tables.
    pub fn to_short_string(&self) -> String {
        format!("{}-{}", hex::encode(self.txid), self.vout)
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_short_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseOutPointError {
    #[error("missing '-' separator in outpoint {0}")]
    MissingSeparator(String),
    #[error("invalid txid hex: {0}")]
    InvalidTxid(String),
    #[error("invalid output index: {0}")]
    InvalidIndex(String),
}

impl FromStr for OutPoint {
    type Err = ParseOutPointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (txid_hex, vout) = s
            .rsplit_once('-')
            .ok_or_else(|| ParseOutPointError::MissingSeparator(s.to_string()))?;
        let bytes = hex::decode(txid_hex).map_err(|e| ParseOutPointError::InvalidTxid(e.to_string()))?;
        let txid: Hash = bytes
            .try_into()
            .map_err(|_| ParseOutPointError::InvalidTxid(txid_hex.to_string()))?;
        let vout = vout
            .parse::<u32>()
            .map_err(|_| ParseOutPointError::InvalidIndex(vout.to_string()))?;
        Ok(OutPoint { txid, vout })
    }
}

/// Represents a transaction input, referencing a previous transaction's output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    /// The `OutPoint` referencing the output being spent.
    pub previous_output: OutPoint,
    /// The script signature, providing proof of ownership.
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

impl TxInput {
    pub fn new(previous_output: OutPoint) -> Self {
        TxInput { previous_output, script_sig: Vec::new(), sequence: u32::MAX }
    }
}

/// Represents a transaction output, specifying a value and a locking script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    /// The value of the output in satoshis.
    pub value: u64,
    /// The locking script (scriptPubKey) that defines the conditions for spending this output.
    pub script_pubkey: Vec<u8>,
}

impl TxOutput {
    pub fn new(value: u64, script_pubkey: Vec<u8>) -> Self {
        TxOutput { value, script_pubkey }
    }

    /// Extracts the public key hash from a P2PKH script, if applicable.
    pub fn extract_public_key_hash(&self) -> Option<PubKeyHash> {
        // OP_DUP OP_HASH160 <20 bytes> OP_EQUALVERIFY OP_CHECKSIG
        if self.script_pubkey.len() == 25
            && self.script_pubkey[0] == 0x76
            && self.script_pubkey[1] == 0xA9
            && self.script_pubkey[2] == 0x14
            && self.script_pubkey[23] == 0x88
            && self.script_pubkey[24] == 0xAC
        {
            let mut public_key_hash = [0u8; 20];
            public_key_hash.copy_from_slice(&self.script_pubkey[3..23]);
            Some(public_key_hash)
        } else {
            None
        }
    }
}

/// The transaction shapes the quorum layer has to look at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transaction {
    Standard {
        version: u32,
        inputs: Vec<TxInput>,
        outputs: Vec<TxOutput>,
        lock_time: u32,
    },
    Coinbase {
        version: u32,
        height: u64,
        outputs: Vec<TxOutput>,
        lock_time: u32,
    },
}

impl Transaction {
    pub fn standard(inputs: Vec<TxInput>, outputs: Vec<TxOutput>) -> Self {
        Transaction::Standard { version: 1, inputs, outputs, lock_time: 0 }
    }

    pub fn coinbase(height: u64, outputs: Vec<TxOutput>) -> Self {
        Transaction::Coinbase { version: 1, height, outputs, lock_time: 0 }
    }

    /// Returns the inputs; a coinbase has none.
    pub fn get_inputs(&self) -> &[TxInput] {
        match self {
            Transaction::Standard { inputs, .. } => inputs,
            Transaction::Coinbase { .. } => &[],
        }
    }

    pub fn get_outputs(&self) -> &[TxOutput] {
        match self {
            Transaction::Standard { outputs, .. } => outputs,
            Transaction::Coinbase { outputs, .. } => outputs,
        }
    }

    pub fn get_outputs_mut(&mut self) -> &mut Vec<TxOutput> {
        match self {
            Transaction::Standard { outputs, .. } => outputs,
            Transaction::Coinbase { outputs, .. } => outputs,
        }
    }

    pub fn get_lock_time(&self) -> u32 {
        match self {
            Transaction::Standard { lock_time, .. } => *lock_time,
            Transaction::Coinbase { lock_time, .. } => *lock_time,
        }
    }

    pub fn is_coinbase(&self) -> bool {
        matches!(self, Transaction::Coinbase { .. })
    }

    /// Sum of all output values, saturating on overflow.
    pub fn total_output_value(&self) -> u64 {
        self.get_outputs()
            .iter()
            .fold(0u64, |acc, out| acc.saturating_add(out.value))
    }

    /// Returns the canonical byte representation of the transaction.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Box<bincode::ErrorKind>> {
        bincode::serialize(self)
    }

    /// Calculates the transaction ID.
    pub fn txid(&self) -> Hash {
        match self.to_bytes() {
            Ok(bytes) => blake3::hash(&bytes).into(),
            Err(_) => [0u8; 32],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outpoint_short_string_round_trip() {
        let text = "099c01bea63abd1692f60806bb646fa1d288e2d049281225f17e499024084e28-0";
        let outpoint: OutPoint = text.parse().unwrap();
        assert_eq!(outpoint.vout, 0);
        assert_eq!(outpoint.to_short_string(), text);
    }

    #[test]
    fn test_outpoint_parse_rejects_garbage() {
        assert!(matches!("abcd".parse::<OutPoint>(), Err(ParseOutPointError::MissingSeparator(_))));
        assert!(matches!("zz-1".parse::<OutPoint>(), Err(ParseOutPointError::InvalidTxid(_))));
        assert!(matches!("00-1".parse::<OutPoint>(), Err(ParseOutPointError::InvalidTxid(_))));
        let bad_index = format!("{}-x", hex::encode([1u8; 32]));
        assert!(matches!(bad_index.parse::<OutPoint>(), Err(ParseOutPointError::InvalidIndex(_))));
    }

    #[test]
    fn test_outpoint_ordering_uses_txid_then_vout() {
        let a = OutPoint::new([1u8; 32], 5);
        let b = OutPoint::new([2u8; 32], 0);
        let c = OutPoint::new([2u8; 32], 1);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_txid_changes_with_outputs() {
        let tx1 = Transaction::standard(vec![], vec![TxOutput::new(1, vec![])]);
        let tx2 = Transaction::standard(vec![], vec![TxOutput::new(2, vec![])]);
        assert_ne!(tx1.txid(), tx2.txid());
        assert_eq!(tx1.txid(), tx1.clone().txid());
    }

    #[test]
    fn test_extract_public_key_hash() {
        let mut script = vec![0x76, 0xA9, 0x14];
        script.extend_from_slice(&[7u8; 20]);
        script.extend_from_slice(&[0x88, 0xAC]);
        let out = TxOutput::new(10, script);
        assert_eq!(out.extract_public_key_hash(), Some([7u8; 20]));
        assert_eq!(TxOutput::new(10, vec![0x6a]).extract_public_key_hash(), None);
    }
}
