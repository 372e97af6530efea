//! Shared fixtures: a synced in-memory chain, a quorum context on top of it and announced nodes.
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use crown_crypto::hash::script_for_pubkey;
use crown_crypto::NodeKeyPair;
use crown_masternode::announce::create_broadcast;
use crown_masternode::constants::{COIN, PROTOCOL_VERSION};
use crown_masternode::{
    Accepted, ChainState, Clock, Coin, Collaborators, ManualClock, MemoryBudget, MemoryChain, MemoryMempool,
    MemoryNetwork, Network, Peer, QuorumConfig, QuorumContext, QuorumResult,
};
use crown_shared_types::{NodeBroadcast, NodeKind, OutPoint, QuorumMessage};

pub const NOW: i64 = 1_600_000_000;
pub const TIP: u64 = 300;
pub const COLLATERAL_HEIGHT: u64 = 10;

pub struct Harness {
    pub ctx: QuorumContext,
    pub chain: Arc<MemoryChain>,
    pub network: Arc<MemoryNetwork>,
    pub mempool: Arc<MemoryMempool>,
    pub budget: Arc<MemoryBudget>,
    pub clock: Arc<ManualClock>,
    spork_secret: [u8; 32],
}

impl Harness {
    pub fn new(network: Network) -> Self {
        Self::with_spork_secret(network, [0xA5; 32])
    }

    /// Contexts built with the same secret accept each other's sporks.
    pub fn with_spork_secret(network: Network, spork_secret: [u8; 32]) -> Self {
        let chain = Arc::new(MemoryChain::with_blocks(TIP, NOW - TIP as i64 * 60, 60));
        let peers = Arc::new(MemoryNetwork::default());
        let mempool = Arc::new(MemoryMempool::default());
        let budget = Arc::new(MemoryBudget::default());
        let clock = Arc::new(ManualClock::new(NOW));
        let spork_key = NodeKeyPair::from_secret_bytes(&spork_secret).unwrap();
        let config = QuorumConfig {
            network,
            spork_pubkey: Some(spork_key.public_key_bytes()),
            reference_overrides: HashMap::new(),
        };
        let collaborators = Collaborators {
            chain: chain.clone(),
            mutator: chain.clone(),
            mempool: mempool.clone(),
            network: peers.clone(),
            budget: budget.clone(),
            clock: clock.clone(),
        };
        Harness {
            ctx: QuorumContext::new(&config, collaborators),
            chain,
            network: peers,
            mempool,
            budget,
            clock,
            spork_secret,
        }
    }

    pub fn regtest() -> Self {
        Self::new(Network::Regtest)
    }

    pub fn spork_key(&self) -> NodeKeyPair {
        NodeKeyPair::from_secret_bytes(&self.spork_secret).unwrap()
    }

    /// Drives both classes through sporks, list and winners with a quiet network.
    pub fn finish_sync(&self) {
        self.ctx.maintenance();
        for step in [10, 30, 30] {
            self.clock.advance(step);
            self.ctx.maintenance();
        }
        assert!(self.ctx.is_synced(NodeKind::Masternode));
        assert!(self.ctx.is_synced(NodeKind::Systemnode));
    }

    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    /// Funds and announces `count` nodes of `kind`; every one must be accepted.
    pub fn announce_nodes(&self, kind: NodeKind, count: u8) -> Vec<TestNode> {
        (0..count)
            .map(|index| {
                let node = TestNode::new(kind, index);
                assert_eq!(self.announce(&node), Ok(Accepted::Added), "node {} not accepted", index);
                node
            })
            .collect()
    }

    pub fn fund(&self, node: &TestNode) {
        self.chain.add_coin(
            node.outpoint,
            Coin {
                value: node.collateral_value(),
                script_pubkey: script_for_pubkey(&node.collateral.public_key_bytes()),
                height: COLLATERAL_HEIGHT,
            },
        );
    }

    pub fn broadcast_for(&self, node: &TestNode) -> NodeBroadcast {
        let ping_block = self.chain.block_hash_at(TIP - 12).unwrap();
        create_broadcast(
            &node.collateral,
            &node.operator(),
            node.outpoint,
            node.addr,
            PROTOCOL_VERSION,
            ping_block,
            self.now() - 1_800,
        )
    }

    pub fn announce(&self, node: &TestNode) -> QuorumResult {
        self.fund(node);
        let broadcast = self.broadcast_for(node);
        self.ctx.process_message(&peer(1), QuorumMessage::Broadcast(node.kind, broadcast))
    }
}

/// A node with deterministic keys so the operator key can be rebuilt at will.
pub struct TestNode {
    pub kind: NodeKind,
    pub collateral: NodeKeyPair,
    pub operator_secret: [u8; 32],
    pub outpoint: OutPoint,
    pub addr: SocketAddr,
}

impl TestNode {
    pub fn new(kind: NodeKind, index: u8) -> Self {
        let class = kind.index() as u8;
        let seed = index.wrapping_mul(2).wrapping_add(1);
        let collateral = NodeKeyPair::from_secret_bytes(&[seed; 32]).unwrap();
        let mut operator_secret = [seed.wrapping_add(1); 32];
        operator_secret[0] = class;
        let mut txid = [index.wrapping_add(1); 32];
        txid[0] = 0xC0 | class;
        TestNode {
            kind,
            collateral,
            operator_secret,
            outpoint: OutPoint::new(txid, u32::from(class)),
            addr: format!("10.{}.0.{}:18444", class, index + 1).parse().unwrap(),
        }
    }

    pub fn operator(&self) -> NodeKeyPair {
        NodeKeyPair::from_secret_bytes(&self.operator_secret).unwrap()
    }

    pub fn payee(&self) -> Vec<u8> {
        script_for_pubkey(&self.collateral.public_key_bytes())
    }

    pub fn collateral_value(&self) -> u64 {
        match self.kind {
            NodeKind::Masternode => 10_000 * COIN,
            NodeKind::Systemnode => 500 * COIN,
        }
    }
}

pub fn peer(id: u64) -> Peer {
    Peer { id, addr: format!("198.51.100.{}:9340", id).parse().unwrap(), version: PROTOCOL_VERSION }
}

/// Looks a node up by outpoint; panics on an unknown one.
pub fn node_at<'a>(nodes: &'a [TestNode], outpoint: &OutPoint) -> &'a TestNode {
    nodes.iter().find(|node| &node.outpoint == outpoint).unwrap()
}
