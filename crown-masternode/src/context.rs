//! The quorum context: owns every engine and routes network messages, new tips and timers to them.
//!
//! Every entry point takes the chain guard first, then engine locks in a fixed order: sporks,
//! masternode registry, systemnode registry, masternode payments, systemnode payments,
//! instantsend, sync state, and the active node last. Locks that are not needed are skipped, never
//! taken out of order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crown_crypto::NodeKeyPair;
use crown_shared_types::{
    Hash, Inventory, InventoryType, LockVote, NodeBroadcast, NodeKind, NodePing, OutPoint, PaymentWinner,
    QuorumMessage, SporkMessage, SyncItem, Transaction,
};
use log::{debug, error, info, warn};

use crate::active::{ActiveNode, ActiveStatus};
use crate::announce::{process_broadcast, process_ping, AnnounceEnv};
use crate::chain::{lock, Budget, ChainMutator, ChainState, Clock, Mempool, Peer, PeerNetwork};
use crate::constants::{DOS_REPEATED_WINNER_REQUEST, OWN_VOTE_OFFSET, PROTOCOL_VERSION};
use crate::error::{Accepted, QuorumError, QuorumResult, RejectKind};
use crate::instantsend::{InstantLockEngine, LockEnv};
use crate::params::{Network, NetworkParams};
use crate::payments::{min_payment_proto, PaymentEnv, PaymentVotingEngine};
use crate::registry::NodeRegistry;
use crate::reprocess::{ReprocessReport, ReprocessingBridge};
use crate::spork::{SporkAction, SporkEngine, SporkId};
use crate::sync::{FulfilledRequests, SyncStage, SyncTracker};

/// Settings the context is built from.
#[derive(Debug, Clone)]
pub struct QuorumConfig {
    pub network: Network,
    /// Replaces the network's spork key, for private test networks.
    pub spork_pubkey: Option<[u8; 32]>,
    /// Extra reference nodes and their vote weights.
    pub reference_overrides: HashMap<OutPoint, u32>,
}

impl Default for QuorumConfig {
    fn default() -> Self {
        Self { network: Network::Mainnet, spork_pubkey: None, reference_overrides: HashMap::new() }
    }
}

impl QuorumConfig {
    pub fn network_params(&self) -> NetworkParams {
        let mut params = NetworkParams::for_network(self.network);
        if let Some(pubkey) = self.spork_pubkey {
            params.spork_pubkey = pubkey;
        }
        params
            .reference_weights
            .extend(self.reference_overrides.iter().map(|(outpoint, weight)| (*outpoint, *weight)));
        params
    }
}

/// The parts of the node the context talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub chain: Arc<dyn ChainState>,
    pub mutator: Arc<dyn ChainMutator>,
    pub mempool: Arc<dyn Mempool>,
    pub network: Arc<dyn PeerNetwork>,
    pub budget: Arc<dyn Budget>,
    pub clock: Arc<dyn Clock>,
}

/// What one maintenance pass removed and whether the active node pinged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Removed registry entries, indexed by [`NodeKind::index`].
    pub removed_nodes: [usize; 2],
    pub removed_votes: [usize; 2],
    pub removed_locks: usize,
    pub pinged: bool,
}

pub struct QuorumContext {
    params: NetworkParams,
    chain_guard: Mutex<()>,
    chain: Arc<dyn ChainState>,
    mempool: Arc<dyn Mempool>,
    network: Arc<dyn PeerNetwork>,
    budget: Arc<dyn Budget>,
    clock: Arc<dyn Clock>,
    reprocessor: ReprocessingBridge,
    sporks: Mutex<SporkEngine>,
    registries: [Mutex<NodeRegistry>; 2],
    payments: [Mutex<PaymentVotingEngine>; 2],
    instantsend: Mutex<InstantLockEngine>,
    sync: [Mutex<SyncTracker>; 2],
    fulfilled: Mutex<FulfilledRequests>,
    active: Mutex<Option<ActiveNode>>,
}

impl QuorumContext {
    pub fn new(config: &QuorumConfig, collaborators: Collaborators) -> Self {
        let params = config.network_params();
        let now = collaborators.clock.now();
        info!(
            "quorum context for {} ({} reference nodes)",
            params.network,
            params.reference_weights.len()
        );
        Self {
            chain_guard: Mutex::new(()),
            reprocessor: ReprocessingBridge::new(collaborators.mutator),
            sporks: Mutex::new(SporkEngine::new(params.spork_pubkey)),
            registries: [
                Mutex::new(NodeRegistry::new(params.masternode.clone())),
                Mutex::new(NodeRegistry::new(params.systemnode.clone())),
            ],
            payments: [
                Mutex::new(PaymentVotingEngine::new(params.masternode.clone())),
                Mutex::new(PaymentVotingEngine::new(params.systemnode.clone())),
            ],
            instantsend: Mutex::new(InstantLockEngine::new()),
            sync: [Mutex::new(SyncTracker::new(now)), Mutex::new(SyncTracker::new(now))],
            fulfilled: Mutex::new(FulfilledRequests::default()),
            active: Mutex::new(None),
            chain: collaborators.chain,
            mempool: collaborators.mempool,
            network: collaborators.network,
            budget: collaborators.budget,
            clock: collaborators.clock,
            params,
        }
    }

    pub fn params(&self) -> &NetworkParams {
        &self.params
    }

    /// Runs this process as a masternode or systemnode signing with `operator_key`.
    pub fn set_active_node(&self, kind: NodeKind, operator_key: NodeKeyPair) {
        let node = ActiveNode::new(kind, operator_key);
        info!("running as {} with operator key {}", kind, hex::encode(node.operator_pubkey()));
        *lock(&self.active) = Some(node);
    }

    pub fn active_status(&self) -> Option<ActiveStatus> {
        lock(&self.active).as_ref().map(|node| node.status().clone())
    }

    pub fn set_spork_signer(&self, keypair: NodeKeyPair) -> Result<(), QuorumError> {
        lock(&self.sporks).set_signer(keypair)
    }

    /// Signs, stores and relays a new spork value.
    pub fn update_spork(&self, spork: SporkId, value: i64) -> Result<SporkMessage, QuorumError> {
        let _chain = lock(&self.chain_guard);
        let (record, inventory) = lock(&self.sporks).update(spork, value, self.clock.now())?;
        self.network.relay(inventory);
        Ok(record)
    }

    pub fn is_spork_active(&self, spork: SporkId) -> bool {
        lock(&self.sporks).is_active(spork, self.clock.now())
    }

    pub fn spork_value(&self, spork: SporkId) -> i64 {
        lock(&self.sporks).value(spork)
    }

    pub fn node_count(&self, kind: NodeKind) -> usize {
        lock(&self.registries[kind.index()]).len()
    }

    pub fn enabled_count(&self, kind: NodeKind) -> usize {
        lock(&self.registries[kind.index()]).count_enabled(None)
    }

    /// Enabled nodes of `kind` ordered by their score at `height`, best first.
    pub fn ranked_nodes(&self, kind: NodeKind, height: u64) -> Vec<OutPoint> {
        let _chain = lock(&self.chain_guard);
        lock(&self.registries[kind.index()])
            .ranked(self.chain.as_ref(), height, 0, self.clock.now())
            .into_iter()
            .map(|scored| scored.outpoint)
            .collect()
    }

    pub fn sync_stage(&self, kind: NodeKind) -> SyncStage {
        lock(&self.sync[kind.index()]).stage()
    }

    /// Chain caught up and the class's node list and winners pulled from peers.
    pub fn is_synced(&self, kind: NodeKind) -> bool {
        self.chain.is_synced() && lock(&self.sync[kind.index()]).is_synced()
    }

    pub fn block_payee(&self, kind: NodeKind, height: u64) -> Option<Vec<u8>> {
        lock(&self.payments[kind.index()]).block_payee(height)
    }

    pub fn required_payments_string(&self, kind: NodeKind, height: u64) -> String {
        lock(&self.payments[kind.index()]).required_payments_string(height)
    }

    pub fn lock_signatures(&self, tx_hash: &Hash) -> Option<usize> {
        lock(&self.instantsend).signatures_count(tx_hash)
    }

    pub fn is_input_locked(&self, outpoint: &OutPoint) -> bool {
        lock(&self.instantsend).is_input_locked(outpoint)
    }

    pub fn instantsend_summary(&self) -> String {
        lock(&self.instantsend).to_string()
    }

    /// Handles one quorum-layer message and penalises the sender when the reject carries a DoS weight.
    pub fn process_message(&self, peer: &Peer, message: QuorumMessage) -> QuorumResult {
        let _chain = lock(&self.chain_guard);
        let now = self.clock.now();
        let command = message.command();
        let result = match message {
            QuorumMessage::Spork(spork) => self.on_spork(&spork, now),
            QuorumMessage::GetSporks => self.on_get_sporks(peer),
            QuorumMessage::Broadcast(kind, broadcast) => self.on_broadcast(kind, &broadcast, now),
            QuorumMessage::Ping(kind, ping) => self.on_ping(peer, kind, &ping, now),
            QuorumMessage::ListRequest(kind, requested) => lock(&self.registries[kind.index()])
                .process_list_request(peer, requested, self.network.as_ref(), now, self.params.is_mainnet()),
            QuorumMessage::Winner(kind, winner) => self.on_winner(peer, kind, &winner, now),
            QuorumMessage::GetWinners(kind, needed) => self.on_get_winners(peer, kind, needed, now),
            QuorumMessage::SyncStatusCount(kind, item, count) => self.on_status_count(kind, item, count),
            QuorumMessage::LockRequest(tx) => self.on_lock_request(peer, &tx, now),
            QuorumMessage::LockVote(vote) => self.on_lock_vote(peer, &vote, now),
            QuorumMessage::LockList => lock(&self.instantsend).process_lock_list(self.network.as_ref()),
        };

        match &result {
            Ok(accepted) => debug!("{} from peer {}: {:?}", command, peer.id, accepted),
            Err(reject) if reject.dos() > 0 => {
                warn!("{} from peer {} rejected ({}), misbehaving +{}", command, peer.id, reject, reject.dos());
                self.network.misbehaving(peer.id, reject.dos());
            }
            Err(reject) => debug!("{} from peer {} rejected: {}", command, peer.id, reject),
        }
        result
    }

    fn on_spork(&self, spork: &SporkMessage, now: i64) -> QuorumResult {
        let action = lock(&self.sporks).process(spork)?;
        self.network.relay(Inventory::new(InventoryType::Spork, spork.hash()));
        match action {
            SporkAction::None => {}
            SporkAction::ClearBudget => {
                info!("spork {} cleared the budget", spork.id);
                self.budget.clear();
            }
            SporkAction::Reprocess(blocks) => {
                if let Err(e) = self.reprocessor.reprocess(blocks, now) {
                    error!("spork-triggered reprocess of {} blocks failed: {}", blocks, e);
                }
            }
        }
        Ok(Accepted::Updated)
    }

    fn on_get_sporks(&self, peer: &Peer) -> QuorumResult {
        let sporks = lock(&self.sporks);
        for record in sporks.records() {
            self.network.push(peer.id, QuorumMessage::Spork(record.clone()));
        }
        Ok(Accepted::Served)
    }

    fn min_proto(&self, kind: NodeKind, now: i64) -> u32 {
        min_payment_proto(self.params.class(kind), &lock(&self.sporks), now)
    }

    fn announce_env(&self, kind: NodeKind, now: i64) -> AnnounceEnv<'_> {
        AnnounceEnv {
            chain: self.chain.as_ref(),
            network: self.network.as_ref(),
            params: &self.params,
            now,
            min_proto: self.min_proto(kind, now),
        }
    }

    fn on_broadcast(&self, kind: NodeKind, broadcast: &NodeBroadcast, now: i64) -> QuorumResult {
        let env = self.announce_env(kind, now);
        let result = match kind {
            NodeKind::Masternode => process_broadcast(&mut lock(&self.registries[0]), None, broadcast, &env),
            NodeKind::Systemnode => {
                let masternodes = lock(&self.registries[0]);
                let mut systemnodes = lock(&self.registries[1]);
                process_broadcast(&mut systemnodes, Some(&*masternodes), broadcast, &env)
            }
        };

        let hash = broadcast.hash();
        match &result {
            Ok(_) => lock(&self.sync[kind.index()]).added_list_item(hash, false, now),
            Err(RejectKind::Stale(_)) => lock(&self.sync[kind.index()]).added_list_item(hash, true, now),
            Err(_) => {}
        }

        if result.is_ok() && broadcast.protocol_version == PROTOCOL_VERSION {
            let mut active = lock(&self.active);
            if let Some(node) = active.as_mut() {
                if node.kind() == kind && node.operator_pubkey() == broadcast.operator_pubkey {
                    node.enable_remote(broadcast.outpoint, broadcast.addr);
                }
            }
        }
        result
    }

    fn on_ping(&self, peer: &Peer, kind: NodeKind, ping: &NodePing, now: i64) -> QuorumResult {
        let env = self.announce_env(kind, now);
        let mut registry = lock(&self.registries[kind.index()]);
        let result = process_ping(&mut registry, ping, &env);
        if let Err(reject) = &result {
            let missing = registry.find(&ping.outpoint).is_none();
            if !matches!(reject, RejectKind::Stale(_)) && (reject.dos() > 0 || missing) {
                registry.ask_for_entry(peer, &ping.outpoint, self.network.as_ref(), now);
            }
        }
        result
    }

    fn on_winner(&self, peer: &Peer, kind: NodeKind, winner: &PaymentWinner, now: i64) -> QuorumResult {
        let idx = kind.index();
        let synced = self.is_synced(kind);
        let sporks = lock(&self.sporks);
        let mut registry = lock(&self.registries[idx]);
        let mut payments = lock(&self.payments[idx]);
        let env = PaymentEnv {
            chain: self.chain.as_ref(),
            network: self.network.as_ref(),
            budget: self.budget.as_ref(),
            params: &self.params,
            sporks: &sporks,
            now,
            synced,
        };
        let result = payments.process_winner(&mut registry, peer, winner, &env);

        let hash = winner.hash();
        match &result {
            Ok(_) => lock(&self.sync[idx]).added_winner(hash, false, now),
            Err(RejectKind::Stale(_)) => lock(&self.sync[idx]).added_winner(hash, true, now),
            Err(_) => {}
        }
        result
    }

    fn on_get_winners(&self, peer: &Peer, kind: NodeKind, needed: u32, now: i64) -> QuorumResult {
        if !self.is_synced(kind) {
            return Err(RejectKind::ignored(format!("{} winners not synced yet", kind)));
        }
        let command = QuorumMessage::GetWinners(kind, needed).command();
        {
            let mut fulfilled = lock(&self.fulfilled);
            let ip = peer.addr.ip();
            if self.params.is_mainnet() && fulfilled.has_fulfilled(&ip, command, now) {
                warn!("peer {} already asked for {} winners", peer.addr, kind);
                return Err(RejectKind::malformed(
                    format!("{} requested again too soon", command),
                    DOS_REPEATED_WINNER_REQUEST,
                ));
            }
            fulfilled.add_fulfilled(ip, command, now);
        }

        let tip = self.chain.tip_height().ok_or_else(|| RejectKind::ignored("no chain tip"))?;
        let enabled = lock(&self.registries[kind.index()]).count_enabled(None);
        lock(&self.payments[kind.index()]).sync(peer, needed, tip, enabled, self.network.as_ref());
        Ok(Accepted::Served)
    }

    fn on_status_count(&self, kind: NodeKind, item: SyncItem, count: u32) -> QuorumResult {
        if lock(&self.sync[kind.index()]).process_status_count(item, count) {
            Ok(Accepted::Served)
        } else {
            Err(RejectKind::ignored(format!("{} sync count for {:?} not expected", kind, item)))
        }
    }

    fn on_lock_request(&self, peer: &Peer, tx: &Transaction, now: i64) -> QuorumResult {
        let (result, pending) = {
            let sporks = lock(&self.sporks);
            let mut registry = lock(&self.registries[NodeKind::Masternode.index()]);
            let mut instantsend = lock(&self.instantsend);
            let active = lock(&self.active);
            let env = self.lock_env(&sporks, active.as_ref(), now);
            let result = instantsend.process_lock_request(&mut registry, peer, tx, &env);
            (result, instantsend.take_reprocess_request())
        };
        self.run_pending_reprocess(pending, now);
        result
    }

    fn on_lock_vote(&self, peer: &Peer, vote: &LockVote, now: i64) -> QuorumResult {
        let (result, pending) = {
            let sporks = lock(&self.sporks);
            let mut registry = lock(&self.registries[NodeKind::Masternode.index()]);
            let mut instantsend = lock(&self.instantsend);
            let active = lock(&self.active);
            let env = self.lock_env(&sporks, active.as_ref(), now);
            let result = instantsend.process_vote(&mut registry, peer, vote, &env);
            (result, instantsend.take_reprocess_request())
        };
        self.run_pending_reprocess(pending, now);
        result
    }

    fn lock_env<'a>(&'a self, sporks: &'a SporkEngine, active: Option<&'a ActiveNode>, now: i64) -> LockEnv<'a> {
        LockEnv {
            chain: self.chain.as_ref(),
            mempool: self.mempool.as_ref(),
            network: self.network.as_ref(),
            sporks,
            now,
            voter: active.filter(|node| node.kind() == NodeKind::Masternode).and_then(ActiveNode::voter),
        }
    }

    fn run_pending_reprocess(&self, pending: Option<u64>, now: i64) {
        if let Some(blocks) = pending {
            if let Err(e) = self.reprocessor.reprocess(blocks, now) {
                error!("lock-triggered reprocess of {} blocks failed: {}", blocks, e);
            }
        }
    }

    /// Whether the object behind an inventory announcement is already known.
    pub fn already_have(&self, inventory: &Inventory) -> bool {
        let _chain = lock(&self.chain_guard);
        let hash = &inventory.hash;
        match (inventory.kind, inventory.kind.node_kind()) {
            (InventoryType::TxLockRequest, _) => lock(&self.instantsend).tx_lock_requested(hash),
            (InventoryType::TxLockVote, _) => lock(&self.instantsend).already_have(hash),
            (InventoryType::Spork, _) => lock(&self.sporks).has_seen(hash),
            (InventoryType::MasternodeWinner | InventoryType::SystemnodeWinner, Some(kind)) => {
                lock(&self.payments[kind.index()]).has_vote(hash)
            }
            (InventoryType::MasternodeAnnounce | InventoryType::SystemnodeAnnounce, Some(kind)) => {
                lock(&self.registries[kind.index()]).seen_broadcast(hash).is_some()
            }
            (InventoryType::MasternodePing | InventoryType::SystemnodePing, Some(kind)) => {
                lock(&self.registries[kind.index()]).seen_ping(hash).is_some()
            }
            _ => false,
        }
    }

    /// Pushes the object behind `inventory` to `peer`; `false` when it is not known.
    pub fn get_data(&self, peer: &Peer, inventory: &Inventory) -> bool {
        let _chain = lock(&self.chain_guard);
        let hash = &inventory.hash;
        let message = match (inventory.kind, inventory.kind.node_kind()) {
            (InventoryType::TxLockRequest, _) => {
                lock(&self.instantsend).lock_request(hash).cloned().map(QuorumMessage::LockRequest)
            }
            (InventoryType::TxLockVote, _) => lock(&self.instantsend).vote(hash).cloned().map(QuorumMessage::LockVote),
            (InventoryType::Spork, _) => lock(&self.sporks).by_hash(hash).cloned().map(QuorumMessage::Spork),
            (InventoryType::MasternodeWinner | InventoryType::SystemnodeWinner, Some(kind)) => lock(
                &self.payments[kind.index()],
            )
            .vote(hash)
            .cloned()
            .map(|winner| QuorumMessage::Winner(kind, winner)),
            (InventoryType::MasternodeAnnounce | InventoryType::SystemnodeAnnounce, Some(kind)) => lock(
                &self.registries[kind.index()],
            )
            .seen_broadcast(hash)
            .cloned()
            .map(|broadcast| QuorumMessage::Broadcast(kind, broadcast)),
            (InventoryType::MasternodePing | InventoryType::SystemnodePing, Some(kind)) => lock(
                &self.registries[kind.index()],
            )
            .seen_ping(hash)
            .cloned()
            .map(|ping| QuorumMessage::Ping(kind, ping)),
            _ => None,
        };
        match message {
            Some(message) => {
                self.network.push(peer.id, message);
                true
            }
            None => {
                debug!("peer {} asked for unknown {:?} {}", peer.id, inventory.kind, hex::encode(hash));
                false
            }
        }
    }

    /// Casts the active node's payment vote for the block `OWN_VOTE_OFFSET` past the new tip.
    pub fn new_tip(&self, height: u64) -> Vec<PaymentWinner> {
        let _chain = lock(&self.chain_guard);
        let now = self.clock.now();
        let target = height + OWN_VOTE_OFFSET;
        let mut cast = Vec::new();
        for kind in NodeKind::ALL {
            if !self.is_synced(kind) {
                continue;
            }
            let idx = kind.index();
            let sporks = lock(&self.sporks);
            let mut registry = lock(&self.registries[idx]);
            let mut payments = lock(&self.payments[idx]);
            let active = lock(&self.active);
            let (voter, key) = match active.as_ref().filter(|node| node.kind() == kind).and_then(ActiveNode::voter) {
                Some(voter) => voter,
                None => continue,
            };
            let env = PaymentEnv {
                chain: self.chain.as_ref(),
                network: self.network.as_ref(),
                budget: self.budget.as_ref(),
                params: &self.params,
                sporks: &sporks,
                now,
                synced: true,
            };
            if let Some(winner) = payments.process_block(&mut registry, &voter, key, target, &env) {
                cast.push(winner);
            }
        }
        cast
    }

    /// Writes the class payment for `height` into a coinbase being assembled.
    pub fn fill_block_payee(&self, kind: NodeKind, tx: &mut Transaction, height: u64, block_value: u64) -> Option<Vec<u8>> {
        let _chain = lock(&self.chain_guard);
        let now = self.clock.now();
        let synced = self.is_synced(kind);
        let sporks = lock(&self.sporks);
        let mut registry = lock(&self.registries[kind.index()]);
        let payments = lock(&self.payments[kind.index()]);
        let env = self.payment_env(&sporks, now, synced);
        payments.fill_block_payee(&mut registry, tx, height, block_value, &env)
    }

    /// Block validation hook: does the coinbase honour the decided payee of every class?
    pub fn is_block_payee_valid(
        &self,
        tx: &Transaction,
        height: u64,
        value_created: u64,
        block_time: i64,
        prev_block_time: i64,
    ) -> bool {
        let _chain = lock(&self.chain_guard);
        let now = self.clock.now();
        NodeKind::ALL.iter().all(|kind| {
            let synced = self.is_synced(*kind);
            let sporks = lock(&self.sporks);
            let payments = lock(&self.payments[kind.index()]);
            let env = self.payment_env(&sporks, now, synced);
            payments.is_block_payee_valid(tx, height, value_created, block_time, prev_block_time, &env)
        })
    }

    fn payment_env<'a>(&'a self, sporks: &'a SporkEngine, now: i64, synced: bool) -> PaymentEnv<'a> {
        PaymentEnv {
            chain: self.chain.as_ref(),
            network: self.network.as_ref(),
            budget: self.budget.as_ref(),
            params: &self.params,
            sporks,
            now,
            synced,
        }
    }

    /// Asks `peer` for whatever the current sync stage of each class still needs.
    pub fn request_sync(&self, peer: &Peer) -> usize {
        let _chain = lock(&self.chain_guard);
        let now = self.clock.now();
        let mut asked = 0;
        let mut sporks_asked = false;
        for kind in NodeKind::ALL {
            let idx = kind.index();
            let stage = lock(&self.sync[idx]).stage();
            match stage {
                SyncStage::Sporks if !sporks_asked => {
                    self.network.push(peer.id, QuorumMessage::GetSporks);
                    sporks_asked = true;
                    asked += 1;
                }
                SyncStage::List => {
                    let mut registry = lock(&self.registries[idx]);
                    if registry.request_list(peer, self.network.as_ref(), now, self.params.is_mainnet()) {
                        asked += 1;
                    }
                }
                SyncStage::Winners => {
                    let enabled = lock(&self.registries[idx]).count_enabled(None) as u32;
                    self.network.push(peer.id, QuorumMessage::GetWinners(kind, enabled));
                    asked += 1;
                }
                _ => {}
            }
        }
        asked
    }

    /// Periodic housekeeping: sync progress, expiry sweeps and the active node's ping.
    pub fn maintenance(&self) -> MaintenanceReport {
        let _chain = lock(&self.chain_guard);
        let now = self.clock.now();
        let chain = self.chain.as_ref();
        let chain_synced = chain.is_synced();
        let tip = chain.tip_height();
        let mut report = MaintenanceReport::default();

        for kind in NodeKind::ALL {
            let idx = kind.index();
            let class = self.params.class(kind);
            let enforcement = lock(&self.sporks).is_active(class.payment_enforcement_spork, now);
            let stage = lock(&self.sync[idx]).tick(now, chain_synced, enforcement);
            debug!("{} sync stage {:?}", kind, stage);

            let min_proto = self.min_proto(kind, now);
            let size = {
                let mut registry = lock(&self.registries[idx]);
                report.removed_nodes[idx] = registry.check_and_remove(chain, now, false, min_proto).len();
                registry.len()
            };
            if let Some(tip) = tip {
                report.removed_votes[idx] = lock(&self.payments[idx]).check_and_remove(tip, size).len();
            }
        }
        report.removed_locks = lock(&self.instantsend).check_and_remove(chain, now);
        lock(&self.fulfilled).check_and_remove(now);

        let active_kind = lock(&self.active).as_ref().map(ActiveNode::kind);
        if let Some(kind) = active_kind {
            let synced = self.is_synced(kind);
            let mut registry = lock(&self.registries[kind.index()]);
            let mut active = lock(&self.active);
            if let Some(node) = active.as_mut() {
                report.pinged = node.manage_status(&mut registry, chain, self.network.as_ref(), synced, now).is_some();
            }
        }

        if report != MaintenanceReport::default() {
            info!(
                "maintenance removed nodes {:?}, votes {:?}, locks {}",
                report.removed_nodes, report.removed_votes, report.removed_locks
            );
        }
        report
    }

    /// Rolls the chain back `blocks` blocks and re-derives the tip.
    pub fn reprocess(&self, blocks: u64) -> Result<ReprocessReport, QuorumError> {
        let _chain = lock(&self.chain_guard);
        self.reprocessor.reprocess(blocks, self.clock.now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryBudget, MemoryChain, MemoryMempool, MemoryNetwork};
    use crate::chain::ManualClock;

    const NOW: i64 = 1_600_000_000;

    fn context() -> (QuorumContext, Arc<MemoryNetwork>, Arc<ManualClock>, NodeKeyPair) {
        let chain = Arc::new(MemoryChain::with_blocks(200, NOW - 200 * 60, 60));
        let network = Arc::new(MemoryNetwork::default());
        let clock = Arc::new(ManualClock::new(NOW));
        let spork_key = NodeKeyPair::generate();
        let config = QuorumConfig {
            network: Network::Regtest,
            spork_pubkey: Some(spork_key.public_key_bytes()),
            reference_overrides: HashMap::new(),
        };
        let collaborators = Collaborators {
            chain: chain.clone(),
            mutator: chain,
            mempool: Arc::new(MemoryMempool::default()),
            network: network.clone(),
            budget: Arc::new(MemoryBudget::default()),
            clock: clock.clone(),
        };
        (QuorumContext::new(&config, collaborators), network, clock, spork_key)
    }

    fn peer() -> Peer {
        Peer { id: 7, addr: "198.51.100.7:9340".parse().unwrap(), version: PROTOCOL_VERSION }
    }

    #[test]
    fn test_config_overrides_reach_params() {
        let outpoint = OutPoint::new([4u8; 32], 1);
        let config = QuorumConfig {
            network: Network::Testnet,
            spork_pubkey: Some([9u8; 32]),
            reference_overrides: [(outpoint, 3)].into_iter().collect(),
        };
        let params = config.network_params();
        assert_eq!(params.spork_pubkey, [9u8; 32]);
        assert_eq!(params.vote_weight(&outpoint), 3);
        assert_eq!(params.network, Network::Testnet);
    }

    #[test]
    fn test_bad_spork_signature_is_punished() {
        let (ctx, network, _, _) = context();
        let forged = SporkMessage { id: SporkId::InstantX.id(), value: 1, signed_at: NOW, signature: vec![0u8; 64] };
        let result = ctx.process_message(&peer(), QuorumMessage::Spork(forged));
        assert!(matches!(result, Err(RejectKind::SignatureInvalid { .. })));
        assert_eq!(network.misbehaviour(7), 100);
    }

    #[test]
    fn test_signed_spork_is_relayed_and_served() {
        let (ctx, network, _, spork_key) = context();
        ctx.set_spork_signer(spork_key).unwrap();
        let record = ctx.update_spork(SporkId::InstantX, 4_000_000_000).unwrap();
        assert!(!ctx.is_spork_active(SporkId::InstantX));
        assert_eq!(network.relayed().len(), 1);

        let inventory = Inventory::new(InventoryType::Spork, record.hash());
        assert!(ctx.already_have(&inventory));
        assert!(ctx.get_data(&peer(), &inventory));
        assert_eq!(ctx.process_message(&peer(), QuorumMessage::GetSporks), Ok(Accepted::Served));
        assert_eq!(network.pushed_to(7).len(), 2);
    }

    #[test]
    fn test_winner_request_waits_for_sync() {
        let (ctx, network, _, _) = context();
        let result = ctx.process_message(&peer(), QuorumMessage::GetWinners(NodeKind::Masternode, 10));
        assert!(matches!(result, Err(RejectKind::Ignored(_))));
        assert_eq!(network.misbehaviour(7), 0);
    }

    #[test]
    fn test_unexpected_status_count_is_ignored() {
        let (ctx, _, _, _) = context();
        let result = ctx.process_message(&peer(), QuorumMessage::SyncStatusCount(NodeKind::Systemnode, SyncItem::List, 5));
        assert!(matches!(result, Err(RejectKind::Ignored(_))));
    }

    #[test]
    fn test_maintenance_walks_sync_and_requests_follow_stage() {
        let (ctx, network, clock, _) = context();
        ctx.maintenance();
        assert_eq!(ctx.sync_stage(NodeKind::Masternode), SyncStage::Sporks);
        assert_eq!(ctx.request_sync(&peer()), 1);
        assert_eq!(network.pushed_to(7), vec![QuorumMessage::GetSporks]);

        clock.advance(10);
        ctx.maintenance();
        assert_eq!(ctx.sync_stage(NodeKind::Systemnode), SyncStage::List);
        assert_eq!(ctx.request_sync(&peer()), 2);

        clock.advance(30);
        ctx.maintenance();
        clock.advance(30);
        ctx.maintenance();
        assert!(ctx.is_synced(NodeKind::Masternode));
        assert!(ctx.is_synced(NodeKind::Systemnode));
    }

    #[test]
    fn test_unknown_inventory_is_not_served() {
        let (ctx, network, _, _) = context();
        let inventory = Inventory::new(InventoryType::SystemnodePing, [3u8; 32]);
        assert!(!ctx.already_have(&inventory));
        assert!(!ctx.get_data(&peer(), &inventory));
        assert!(network.pushed_to(7).is_empty());
    }
}
