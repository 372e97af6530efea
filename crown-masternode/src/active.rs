//! The node this process runs, if it was started with an operator key.
//!
//! The collateral lives in a remote wallet which announces the node. Once a broadcast naming our
//! operator key is in the registry the node is started and keeps itself alive with pings.

use std::fmt;
use std::net::SocketAddr;

use crown_crypto::NodeKeyPair;
use crown_shared_types::{Inventory, InventoryType, NodeKind, NodePing, OutPoint, PublicKey};
use log::{debug, info, warn};

use crate::announce::create_ping;
use crate::chain::{ChainState, PeerNetwork};
use crate::registry::NodeRegistry;

/// Pings name the block this far below the tip so they survive a short reorg.
pub const PING_BLOCK_DEPTH: u64 = 12;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActiveStatus {
    Initial,
    SyncInProcess,
    InputTooNew,
    NotCapable(String),
    Started,
}

impl fmt::Display for ActiveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActiveStatus::Initial => f.write_str("node initializing"),
            ActiveStatus::SyncInProcess => f.write_str("sync in process, waiting for the chain"),
            ActiveStatus::InputTooNew => f.write_str("collateral needs more confirmations"),
            ActiveStatus::NotCapable(reason) => write!(f, "not capable: {}", reason),
            ActiveStatus::Started => f.write_str("node successfully started"),
        }
    }
}

pub struct ActiveNode {
    kind: NodeKind,
    operator_key: NodeKeyPair,
    outpoint: Option<OutPoint>,
    addr: Option<SocketAddr>,
    status: ActiveStatus,
}

impl ActiveNode {
    pub fn new(kind: NodeKind, operator_key: NodeKeyPair) -> Self {
        ActiveNode { kind, operator_key, outpoint: None, addr: None, status: ActiveStatus::Initial }
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn operator_pubkey(&self) -> PublicKey {
        self.operator_key.public_key_bytes()
    }

    pub fn operator_key(&self) -> &NodeKeyPair {
        &self.operator_key
    }

    pub fn status(&self) -> &ActiveStatus {
        &self.status
    }

    pub fn outpoint(&self) -> Option<OutPoint> {
        self.outpoint
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    pub fn is_started(&self) -> bool {
        self.status == ActiveStatus::Started
    }

    /// Identity used for votes, once started.
    pub fn voter(&self) -> Option<(OutPoint, &NodeKeyPair)> {
        match (self.is_started(), self.outpoint) {
            (true, Some(outpoint)) => Some((outpoint, &self.operator_key)),
            _ => None,
        }
    }

    /// Starts the node for a collateral announced by a remote wallet.
    pub fn enable_remote(&mut self, outpoint: OutPoint, addr: SocketAddr) {
        if self.is_started() {
            return;
        }
        info!("{} started remotely for {} at {}", self.kind, outpoint, addr);
        self.outpoint = Some(outpoint);
        self.addr = Some(addr);
        self.status = ActiveStatus::Started;
    }

    /// Advances the start-up state and pings when due; returns the ping sent, if any.
    pub fn manage_status(
        &mut self,
        registry: &mut NodeRegistry,
        chain: &dyn ChainState,
        network: &dyn PeerNetwork,
        synced: bool,
        now: i64,
    ) -> Option<NodePing> {
        if !synced {
            self.status = ActiveStatus::SyncInProcess;
            return None;
        }
        if self.status == ActiveStatus::SyncInProcess {
            self.status = ActiveStatus::Initial;
        }

        if !self.is_started() {
            let pubkey = self.operator_pubkey();
            let found = registry
                .find_by_operator(&pubkey)
                .filter(|entry| entry.is_enabled())
                .map(|entry| (entry.outpoint, entry.addr, entry.input_age(chain)));
            match found {
                Some((_, _, age)) if age.map_or(true, |age| age < registry.params().min_confirmations) => {
                    self.status = ActiveStatus::InputTooNew;
                    return None;
                }
                Some((outpoint, addr, _)) => self.enable_remote(outpoint, addr),
                None => {
                    self.status = ActiveStatus::NotCapable(format!("not in the {} list", self.kind));
                    debug!("{} {}", self.kind, self.status);
                    return None;
                }
            }
        }
        self.send_ping(registry, chain, network, now)
    }

    fn send_ping(
        &mut self,
        registry: &mut NodeRegistry,
        chain: &dyn ChainState,
        network: &dyn PeerNetwork,
        now: i64,
    ) -> Option<NodePing> {
        let outpoint = self.outpoint?;
        let ping_seconds = registry.params().ping_seconds;
        let entry = match registry.find(&outpoint) {
            Some(entry) => entry,
            None => {
                warn!("{} {} vanished from the list", self.kind, outpoint);
                self.status = ActiveStatus::NotCapable(format!("{} not in the {} list", outpoint, self.kind));
                return None;
            }
        };
        if entry.is_pinged_within(ping_seconds, now) {
            return None;
        }
        let broadcast_hash = entry.to_broadcast().map(|broadcast| broadcast.hash());

        let tip = chain.tip_height()?;
        let block_hash = chain.block_hash_at(tip.saturating_sub(PING_BLOCK_DEPTH))?;
        let ping = create_ping(&self.operator_key, outpoint, block_hash, now);

        if let Some(hash) = broadcast_hash {
            registry.update_seen_broadcast_ping(&hash, &ping);
        }
        if let Some(entry) = registry.find_mut(&outpoint) {
            entry.last_ping = Some(ping.clone());
        }
        registry.insert_seen_ping(ping.clone());
        network.relay(Inventory::new(InventoryType::ping(self.kind), ping.hash()));
        debug!("{} {} pinged at {}", self.kind, outpoint, now);
        Some(ping)
    }
}

impl fmt::Debug for ActiveNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveNode")
            .field("kind", &self.kind)
            .field("operator", &hex::encode(self.operator_pubkey()))
            .field("outpoint", &self.outpoint)
            .field("status", &self.status)
            .finish()
    }
}
