//! Crown's masternode and systemnode quorum layer.
//!
//! Collateral-backed nodes announce themselves, are ranked per block by a deterministic score,
//! vote on who the next coinbase pays, vote to lock InstantSend transactions, and obey network-wide
//! sporks. [`QuorumContext`] owns all of it and is the only entry point the node needs.

pub mod active;
pub mod announce;
pub mod chain;
pub mod constants;
pub mod context;
pub mod error;
pub mod instantsend;
pub mod memory;
pub mod node;
pub mod params;
pub mod payments;
pub mod registry;
pub mod reprocess;
pub mod score;
pub mod spork;
pub mod sync;

pub use active::{ActiveNode, ActiveStatus};
pub use chain::{Budget, ChainMutator, ChainState, Clock, Coin, ManualClock, Mempool, Peer, PeerNetwork, SystemClock};
pub use context::{Collaborators, MaintenanceReport, QuorumConfig, QuorumContext};
pub use error::{Accepted, QuorumError, QuorumResult, RejectKind};
pub use instantsend::InstantLockEngine;
pub use memory::{MemoryBudget, MemoryChain, MemoryMempool, MemoryNetwork};
pub use node::{NodeEntry, NodeState};
pub use params::{ClassParams, Network, NetworkParams};
pub use payments::PaymentVotingEngine;
pub use registry::NodeRegistry;
pub use reprocess::ReprocessingBridge;
pub use spork::{SporkEngine, SporkId};
pub use sync::{SyncStage, SyncTracker};
