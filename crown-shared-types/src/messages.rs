//! Quorum-layer wire messages and the inventory vectors that announce them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hash as StdHash;
use std::net::SocketAddr;

use crate::{Hash, OutPoint, PublicKey, Transaction};

/// The two classes of collateralized service node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, StdHash, Serialize, Deserialize)]
pub enum NodeKind {
    Masternode,
    Systemnode,
}

impl NodeKind {
    pub const ALL: [NodeKind; 2] = [NodeKind::Masternode, NodeKind::Systemnode];

    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Masternode => "masternode",
            NodeKind::Systemnode => "systemnode",
        }
    }

    /// Index used for per-class tables.
    pub fn index(&self) -> usize {
        match self {
            NodeKind::Masternode => 0,
            NodeKind::Systemnode => 1,
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Heartbeat proving a node is online and following the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePing {
    pub outpoint: OutPoint,
    /// Hash of a recent block the node saw when signing.
    pub block_hash: Hash,
    pub sig_time: i64,
    pub signature: Vec<u8>,
}

impl NodePing {
    pub fn hash(&self) -> Hash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"ping");
        hasher.update(&self.outpoint.txid);
        hasher.update(&self.outpoint.vout.to_le_bytes());
        hasher.update(&self.sig_time.to_le_bytes());
        hasher.finalize().into()
    }
}

/// Signed node announcement binding a collateral outpoint to an address and operator key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeBroadcast {
    pub outpoint: OutPoint,
    pub addr: SocketAddr,
    /// Key controlling the collateral; its P2PKH script is the payee.
    pub collateral_pubkey: PublicKey,
    /// Key the running node signs pings and votes with.
    pub operator_pubkey: PublicKey,
    pub signature: Vec<u8>,
    pub sig_time: i64,
    pub protocol_version: u32,
    pub last_ping: NodePing,
}

impl NodeBroadcast {
    pub fn hash(&self) -> Hash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"broadcast");
        hasher.update(&self.outpoint.txid);
        hasher.update(&self.outpoint.vout.to_le_bytes());
        hasher.update(&self.sig_time.to_le_bytes());
        hasher.update(&self.collateral_pubkey);
        hasher.finalize().into()
    }
}

/// A vote naming the payee for one future block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentWinner {
    pub voter: OutPoint,
    pub block_height: u64,
    pub payee: Vec<u8>,
    pub signature: Vec<u8>,
}

impl PaymentWinner {
    pub fn hash(&self) -> Hash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"winner");
        hasher.update(&self.payee);
        hasher.update(&self.block_height.to_le_bytes());
        hasher.update(&self.voter.txid);
        hasher.update(&self.voter.vout.to_le_bytes());
        hasher.finalize().into()
    }
}

/// A masternode's vote to lock the inputs of one transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockVote {
    pub voter: OutPoint,
    pub tx_hash: Hash,
    pub block_height: u64,
    pub signature: Vec<u8>,
}

impl LockVote {
    /// One identity per `(voter, tx)`; the height is not part of it.
    pub fn hash(&self) -> Hash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"lockvote");
        hasher.update(&self.voter.txid);
        hasher.update(&self.voter.vout.to_le_bytes());
        hasher.update(&self.tx_hash);
        hasher.finalize().into()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SporkMessage {
    pub id: u32,
    pub value: i64,
    pub signed_at: i64,
    pub signature: Vec<u8>,
}

impl SporkMessage {
    pub fn hash(&self) -> Hash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"spork");
        hasher.update(&self.id.to_le_bytes());
        hasher.update(&self.value.to_le_bytes());
        hasher.update(&self.signed_at.to_le_bytes());
        hasher.finalize().into()
    }
}

/// What a sync-status count refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncItem {
    List,
    Winners,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, StdHash, Serialize, Deserialize)]
pub enum InventoryType {
    TxLockRequest,
    TxLockVote,
    Spork,
    MasternodeWinner,
    MasternodeAnnounce,
    MasternodePing,
    SystemnodeWinner,
    SystemnodeAnnounce,
    SystemnodePing,
}

impl InventoryType {
    pub fn winner(kind: NodeKind) -> Self {
        match kind {
            NodeKind::Masternode => InventoryType::MasternodeWinner,
            NodeKind::Systemnode => InventoryType::SystemnodeWinner,
        }
    }

    pub fn announce(kind: NodeKind) -> Self {
        match kind {
            NodeKind::Masternode => InventoryType::MasternodeAnnounce,
            NodeKind::Systemnode => InventoryType::SystemnodeAnnounce,
        }
    }

    pub fn ping(kind: NodeKind) -> Self {
        match kind {
            NodeKind::Masternode => InventoryType::MasternodePing,
            NodeKind::Systemnode => InventoryType::SystemnodePing,
        }
    }

    /// The node class a per-class item belongs to.
    pub fn node_kind(&self) -> Option<NodeKind> {
        match self {
            InventoryType::MasternodeWinner | InventoryType::MasternodeAnnounce | InventoryType::MasternodePing => {
                Some(NodeKind::Masternode)
            }
            InventoryType::SystemnodeWinner | InventoryType::SystemnodeAnnounce | InventoryType::SystemnodePing => {
                Some(NodeKind::Systemnode)
            }
            InventoryType::TxLockRequest | InventoryType::TxLockVote | InventoryType::Spork => None,
        }
    }
}

/// Announces that the sender has an object with the given hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, StdHash, Serialize, Deserialize)]
pub struct Inventory {
    pub kind: InventoryType,
    pub hash: Hash,
}

impl Inventory {
    pub fn new(kind: InventoryType, hash: Hash) -> Self {
        Inventory { kind, hash }
    }
}

/// Every message the quorum layer sends or receives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuorumMessage {
    /// InstantSend lock request carrying the transaction.
    LockRequest(Transaction),
    LockVote(LockVote),
    /// Ask a peer to announce every lock vote it knows.
    LockList,
    Winner(NodeKind, PaymentWinner),
    /// Ask for recent payment winners; carries the number of blocks wanted.
    GetWinners(NodeKind, u32),
    SyncStatusCount(NodeKind, SyncItem, u32),
    Spork(SporkMessage),
    GetSporks,
    Broadcast(NodeKind, NodeBroadcast),
    Ping(NodeKind, NodePing),
    /// Ask for the node list, or only the entry for one outpoint.
    ListRequest(NodeKind, Option<OutPoint>),
}

impl QuorumMessage {
    /// Returns the network command string for this message.
    pub fn command(&self) -> &'static str {
        match self {
            QuorumMessage::LockRequest(_) => "ix",
            QuorumMessage::LockVote(_) => "txlvote",
            QuorumMessage::LockList => "ixlocklist",
            QuorumMessage::Winner(NodeKind::Masternode, _) => "mnw",
            QuorumMessage::Winner(NodeKind::Systemnode, _) => "snw",
            QuorumMessage::GetWinners(NodeKind::Masternode, _) => "mnget",
            QuorumMessage::GetWinners(NodeKind::Systemnode, _) => "snget",
            QuorumMessage::SyncStatusCount(NodeKind::Masternode, _, _) => "ssc",
            QuorumMessage::SyncStatusCount(NodeKind::Systemnode, _, _) => "snssc",
            QuorumMessage::Spork(_) => "spork",
            QuorumMessage::GetSporks => "getsporks",
            QuorumMessage::Broadcast(NodeKind::Masternode, _) => "mnb",
            QuorumMessage::Broadcast(NodeKind::Systemnode, _) => "snb",
            QuorumMessage::Ping(NodeKind::Masternode, _) => "mnp",
            QuorumMessage::Ping(NodeKind::Systemnode, _) => "snp",
            QuorumMessage::ListRequest(NodeKind::Masternode, _) => "dseg",
            QuorumMessage::ListRequest(NodeKind::Systemnode, _) => "sndseg",
        }
    }
}
