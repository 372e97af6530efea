//! A registered node and its lifecycle.

use std::net::SocketAddr;

use crown_crypto::hash::script_for_pubkey;
use crown_shared_types::{NodeBroadcast, NodeKind, NodePing, OutPoint, PublicKey};
use log::debug;

use crate::chain::ChainState;
use crate::params::ClassParams;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Enabled,
    Expired,
    Remove,
    /// The collateral was spent. Terminal.
    VinSpent,
}

/// Pure lifecycle transition.
///
/// `last_ping_time` is the signing time of the newest accepted ping, `collateral_ok` whether the
/// collateral output is still unspent with the exact required amount.
pub fn next_state(
    current: NodeState,
    last_ping_time: Option<i64>,
    now: i64,
    collateral_ok: bool,
    params: &ClassParams,
) -> NodeState {
    if current == NodeState::VinSpent {
        return NodeState::VinSpent;
    }
    let pinged_within = |seconds: i64| last_ping_time.map_or(false, |t| now - t < seconds);
    if !pinged_within(params.removal_seconds) {
        NodeState::Remove
    } else if !pinged_within(params.expiration_seconds) {
        NodeState::Expired
    } else if !collateral_ok {
        NodeState::VinSpent
    } else {
        NodeState::Enabled
    }
}

/// Whether `outpoint` is unspent and holds exactly the class collateral.
pub fn collateral_is_valid(chain: &dyn ChainState, outpoint: &OutPoint, params: &ClassParams) -> bool {
    chain
        .coin(outpoint)
        .map_or(false, |coin| coin.value == params.collateral)
}

/// Registry entry for one collateral outpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEntry {
    pub kind: NodeKind,
    pub outpoint: OutPoint,
    pub addr: SocketAddr,
    pub collateral_pubkey: PublicKey,
    pub operator_pubkey: PublicKey,
    pub signature: Vec<u8>,
    pub sig_time: i64,
    pub protocol_version: u32,
    pub last_ping: Option<NodePing>,
    pub state: NodeState,
    pub last_checked: i64,
}

impl NodeEntry {
    pub fn from_broadcast(kind: NodeKind, broadcast: &NodeBroadcast) -> Self {
        NodeEntry {
            kind,
            outpoint: broadcast.outpoint,
            addr: broadcast.addr,
            collateral_pubkey: broadcast.collateral_pubkey,
            operator_pubkey: broadcast.operator_pubkey,
            signature: broadcast.signature.clone(),
            sig_time: broadcast.sig_time,
            protocol_version: broadcast.protocol_version,
            last_ping: Some(broadcast.last_ping.clone()),
            state: NodeState::Enabled,
            last_checked: 0,
        }
    }

    /// Replaces the announcement fields with a newer broadcast.
    pub fn update_from(&mut self, broadcast: &NodeBroadcast) {
        self.addr = broadcast.addr;
        self.collateral_pubkey = broadcast.collateral_pubkey;
        self.operator_pubkey = broadcast.operator_pubkey;
        self.signature = broadcast.signature.clone();
        self.sig_time = broadcast.sig_time;
        self.protocol_version = broadcast.protocol_version;
        self.last_ping = Some(broadcast.last_ping.clone());
    }

    pub fn to_broadcast(&self) -> Option<NodeBroadcast> {
        let last_ping = self.last_ping.clone()?;
        Some(NodeBroadcast {
            outpoint: self.outpoint,
            addr: self.addr,
            collateral_pubkey: self.collateral_pubkey,
            operator_pubkey: self.operator_pubkey,
            signature: self.signature.clone(),
            sig_time: self.sig_time,
            protocol_version: self.protocol_version,
            last_ping,
        })
    }

    /// Script the node is paid to.
    pub fn payee_script(&self) -> Vec<u8> {
        script_for_pubkey(&self.collateral_pubkey)
    }

    pub fn is_enabled(&self) -> bool {
        self.state == NodeState::Enabled
    }

    pub fn last_ping_time(&self) -> Option<i64> {
        self.last_ping.as_ref().map(|p| p.sig_time)
    }

    pub fn is_pinged_within(&self, seconds: i64, now: i64) -> bool {
        self.last_ping_time().map_or(false, |t| now - t < seconds)
    }

    pub fn is_broadcasted_within(&self, seconds: i64, now: i64) -> bool {
        now - self.sig_time < seconds
    }

    /// Confirmations of the collateral, `None` if it is spent.
    pub fn input_age(&self, chain: &dyn ChainState) -> Option<u64> {
        chain.coin_confirmations(&self.outpoint)
    }

    /// Re-evaluates the lifecycle state, at most once per `check_seconds` unless forced.
    pub fn check(&mut self, chain: &dyn ChainState, params: &ClassParams, now: i64, force: bool) -> NodeState {
        if !force && now - self.last_checked < params.check_seconds {
            return self.state;
        }
        self.last_checked = now;
        let collateral_ok = self.state == NodeState::VinSpent || collateral_is_valid(chain, &self.outpoint, params);
        let state = next_state(self.state, self.last_ping_time(), now, collateral_ok, params);
        if state != self.state {
            debug!("{} {} state {:?} -> {:?}", self.kind, self.outpoint, self.state, state);
            self.state = state;
        }
        state
    }
}
