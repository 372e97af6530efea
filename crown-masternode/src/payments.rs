//! Payment-winner voting: which node the coinbase of each block must pay.
//!
//! The top ten nodes at `h - 100` vote for the payee of block `h`. Once one payee script collects
//! six votes, block validation requires the coinbase to pay it the class share at the class slot.
//! Below that threshold any payee is accepted so the chain keeps moving.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crown_crypto::{sign_message, verify_message, NodeKeyPair};
use crown_shared_types::{
    Hash, Inventory, InventoryType, OutPoint, PaymentWinner, QuorumMessage, SyncItem, Transaction, TxOutput,
};
use log::{debug, info, warn};

use crate::chain::{Budget, ChainState, Peer, PeerNetwork};
use crate::constants::{
    DOS_WINNER_BAD_SIGNATURE, DOS_WINNER_RANK_ABUSE, LAST_PAID_MIN_VOTES, MIN_PAYMENT_PROTO_VERSION_CURR,
    MIN_PAYMENT_PROTO_VERSION_PREV, MIN_PAYMENT_RETENTION_BLOCKS, MIN_WINNER_PEER_PROTO_VERSION, NEVER_PAID_SECONDS,
    NEVER_PAID_SPREAD, PAYMENT_RANK_OFFSET, PAYMENT_SIGNATURES_REQUIRED, PAYMENT_SIGNATURES_TOTAL,
    SCHEDULED_PAYMENT_WINDOW, WINNER_LOOKAHEAD_BLOCKS,
};
use crate::error::{Accepted, QuorumResult, RejectKind};
use crate::node::NodeEntry;
use crate::params::{ClassParams, Network, NetworkParams};
use crate::registry::NodeRegistry;
use crate::score::block_hash_for_height;
use crate::spork::{SporkEngine, SporkId};

/// The string a payment vote signature covers.
pub fn winner_signing_message(voter: &OutPoint, block_height: u64, payee: &[u8]) -> String {
    format!("{}{}{}", voter.to_short_string(), block_height, hex::encode(payee))
}

/// Builds a signed vote for `payee` at `block_height`.
pub fn create_winner(operator_key: &NodeKeyPair, voter: OutPoint, block_height: u64, payee: Vec<u8>) -> PaymentWinner {
    let message = winner_signing_message(&voter, block_height, &payee);
    PaymentWinner { voter, block_height, payee, signature: sign_message(operator_key, &message) }
}

/// Share of the votes for one block that name one payee script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payee {
    pub script: Vec<u8>,
    pub votes: u32,
}

/// The ballot for one block height.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockPayees {
    pub height: u64,
    pub payees: Vec<Payee>,
}

impl BlockPayees {
    pub fn new(height: u64) -> Self {
        BlockPayees { height, payees: Vec::new() }
    }

    pub fn add_payee(&mut self, script: &[u8], weight: u32) {
        match self.payees.iter_mut().find(|payee| payee.script == script) {
            Some(payee) => payee.votes += weight,
            None => self.payees.push(Payee { script: script.to_vec(), votes: weight }),
        }
    }

    /// Payee with the most votes; the earliest one named wins a tie.
    pub fn winner(&self) -> Option<&Payee> {
        self.payees.iter().fold(None, |best: Option<&Payee>, payee| match best {
            Some(best) if best.votes >= payee.votes => Some(best),
            _ => Some(payee),
        })
    }

    pub fn has_payee_with_votes(&self, script: &[u8], votes: u32) -> bool {
        self.payees.iter().any(|payee| payee.script == script && payee.votes >= votes)
    }

    /// Whether a payee has reached the signature threshold.
    pub fn is_decided(&self) -> bool {
        self.payees.iter().any(|payee| payee.votes >= PAYMENT_SIGNATURES_REQUIRED)
    }

    /// Checks a coinbase against the ballot.
    ///
    /// Undecided ballots accept anything. Otherwise some decided payee must be paid exactly
    /// `payment`, and once `enforce_slot` is set the output must sit at `slot`.
    pub fn is_transaction_valid(&self, tx: &Transaction, payment: u64, slot: usize, enforce_slot: bool) -> bool {
        if !self.is_decided() {
            return true;
        }
        let outputs = tx.get_outputs();
        let mut possible = Vec::new();
        for payee in self.payees.iter().filter(|payee| payee.votes >= PAYMENT_SIGNATURES_REQUIRED) {
            let position = outputs
                .iter()
                .position(|output| output.script_pubkey == payee.script && output.value == payment);
            match position {
                Some(position) if enforce_slot && position != slot => {
                    warn!("payment to {} at output {} instead of {}", hex::encode(&payee.script), position, slot);
                    return false;
                }
                Some(_) => return true,
                None => possible.push(hex::encode(&payee.script)),
            }
        }
        debug!("block {} is missing a payment of {} to {}", self.height, payment, possible.join(","));
        false
    }

    pub fn required_payments_string(&self) -> String {
        if self.payees.is_empty() {
            return "Unknown".to_string();
        }
        self.payees
            .iter()
            .map(|payee| format!("{}:{}", hex::encode(&payee.script), payee.votes))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Lowest protocol a node of this class must run to be paid.
pub fn min_payment_proto(params: &ClassParams, sporks: &SporkEngine, now: i64) -> u32 {
    if sporks.is_active(params.dont_pay_old_spork, now) {
        MIN_PAYMENT_PROTO_VERSION_CURR
    } else {
        MIN_PAYMENT_PROTO_VERSION_PREV
    }
}

/// Everything a payment handler reads besides the registry and the engine.
pub struct PaymentEnv<'a> {
    pub chain: &'a dyn ChainState,
    pub network: &'a dyn PeerNetwork,
    pub budget: &'a dyn Budget,
    pub params: &'a NetworkParams,
    pub sporks: &'a SporkEngine,
    pub now: i64,
    /// Whether node-list and winner sync finished; signature failures are only punished then.
    pub synced: bool,
}

/// Votes and ballots for one node class.
pub struct PaymentVotingEngine {
    params: ClassParams,
    votes: HashMap<Hash, PaymentWinner>,
    blocks: BTreeMap<u64, BlockPayees>,
    last_vote: HashMap<OutPoint, u64>,
    last_own_vote_height: u64,
}

impl PaymentVotingEngine {
    pub fn new(params: ClassParams) -> Self {
        PaymentVotingEngine {
            params,
            votes: HashMap::new(),
            blocks: BTreeMap::new(),
            last_vote: HashMap::new(),
            last_own_vote_height: 0,
        }
    }

    pub fn params(&self) -> &ClassParams {
        &self.params
    }

    pub fn min_payment_proto(&self, sporks: &SporkEngine, now: i64) -> u32 {
        min_payment_proto(&self.params, sporks, now)
    }

    /// At most one vote per voter per height. The first call records the height.
    pub fn can_vote(&mut self, voter: &OutPoint, height: u64) -> bool {
        if self.last_vote.get(voter) == Some(&height) {
            return false;
        }
        self.last_vote.insert(*voter, height);
        true
    }

    /// Records a vote with the given weight; `false` for duplicates or an unknown rank block.
    pub fn add_winning_vote(&mut self, chain: &dyn ChainState, winner: &PaymentWinner, weight: u32) -> bool {
        if block_hash_for_height(chain, winner.block_height.saturating_sub(PAYMENT_RANK_OFFSET)).is_err() {
            return false;
        }
        let hash = winner.hash();
        if self.votes.contains_key(&hash) {
            return false;
        }
        self.votes.insert(hash, winner.clone());
        self.blocks
            .entry(winner.block_height)
            .or_insert_with(|| BlockPayees::new(winner.block_height))
            .add_payee(&winner.payee, weight);
        true
    }

    pub fn has_vote(&self, hash: &Hash) -> bool {
        self.votes.contains_key(hash)
    }

    pub fn vote(&self, hash: &Hash) -> Option<&PaymentWinner> {
        self.votes.get(hash)
    }

    pub fn ballot(&self, height: u64) -> Option<&BlockPayees> {
        self.blocks.get(&height)
    }

    /// The payee with the most votes for `height`.
    pub fn block_payee(&self, height: u64) -> Option<Vec<u8>> {
        self.blocks.get(&height)?.winner().map(|payee| payee.script.clone())
    }

    /// Whether `script` is already the leading payee of a block between `tip` and `tip + 8`,
    /// not counting `not_height`.
    pub fn is_scheduled(&self, script: &[u8], tip: u64, not_height: u64) -> bool {
        (tip..=tip + SCHEDULED_PAYMENT_WINDOW)
            .filter(|height| *height != not_height)
            .any(|height| self.block_payee(height).map_or(false, |payee| payee == script))
    }

    pub fn is_transaction_valid(&self, tx: &Transaction, height: u64, value_created: u64, pos_start_height: u64) -> bool {
        match self.blocks.get(&height) {
            Some(ballot) => ballot.is_transaction_valid(
                tx,
                self.params.payment(value_created),
                self.params.payment_slot,
                height >= pos_start_height,
            ),
            None => true,
        }
    }

    pub fn required_payments_string(&self, height: u64) -> String {
        self.blocks
            .get(&height)
            .map(|ballot| ballot.required_payments_string())
            .unwrap_or_else(|| "Unknown".to_string())
    }

    /// Time of the last block that paid `entry` with at least two votes, looking back
    /// `1.25 * enabled` blocks. Zero if none.
    pub fn last_paid(&self, chain: &dyn ChainState, entry: &NodeEntry, enabled: usize) -> i64 {
        let tip = match chain.tip_height() {
            Some(tip) => tip,
            None => return 0,
        };
        let script = entry.payee_script();
        let depth = (enabled * 5 / 4) as u64;
        let mut height = tip;
        for _ in 0..depth {
            if height == 0 {
                break;
            }
            let paid = self
                .blocks
                .get(&height)
                .map_or(false, |ballot| ballot.has_payee_with_votes(&script, LAST_PAID_MIN_VOTES));
            if paid {
                let offset = (payment_spread(entry) % NEVER_PAID_SPREAD) as i64;
                return chain.block_time_at(height).unwrap_or(0) + offset;
            }
            height -= 1;
        }
        0
    }

    /// Seconds since `entry` was last paid. Nodes unpaid for a month or more get a
    /// deterministic value above a month so their order is stable.
    pub fn seconds_since_payment(&self, chain: &dyn ChainState, entry: &NodeEntry, enabled: usize, now: i64) -> i64 {
        let seconds = now - self.last_paid(chain, entry, enabled);
        if seconds < NEVER_PAID_SECONDS {
            return seconds;
        }
        NEVER_PAID_SECONDS + (payment_spread(entry) % NEVER_PAID_SPREAD) as i64
    }

    /// Handles a received vote.
    pub fn process_winner(
        &mut self,
        registry: &mut NodeRegistry,
        peer: &Peer,
        winner: &PaymentWinner,
        env: &PaymentEnv<'_>,
    ) -> QuorumResult {
        let kind = self.params.kind;
        if peer.version < MIN_WINNER_PEER_PROTO_VERSION {
            return Err(RejectKind::ignored(format!("peer {} too old for {} winners", peer.id, kind)));
        }
        let tip = env
            .chain
            .tip_height()
            .ok_or_else(|| RejectKind::ignored("no chain tip"))?;

        let hash = winner.hash();
        if self.votes.contains_key(&hash) {
            debug!("{} winner {} already seen at tip {}", kind, hex::encode(hash), tip);
            return Err(RejectKind::stale(format!("{} winner {} already seen", kind, hex::encode(hash))));
        }

        let first_block = tip.saturating_sub((registry.count_enabled(None) * 5 / 4) as u64);
        if winner.block_height < first_block || winner.block_height > tip + WINNER_LOOKAHEAD_BLOCKS {
            debug!(
                "{} winner for {} out of range [{}, {}]",
                kind,
                winner.block_height,
                first_block,
                tip + WINNER_LOOKAHEAD_BLOCKS
            );
            return Err(RejectKind::ignored(format!("{} winner height {} out of range", kind, winner.block_height)));
        }

        self.check_voter(registry, peer, winner, env)?;

        if !self.can_vote(&winner.voter, winner.block_height) {
            debug!("{} {} already voted for {}", kind, winner.voter, winner.block_height);
            return Err(RejectKind::stale(format!("{} already voted for {}", winner.voter, winner.block_height)));
        }

        let operator = registry.find(&winner.voter).map(|entry| entry.operator_pubkey);
        let message = winner_signing_message(&winner.voter, winner.block_height, &winner.payee);
        let verified = operator.map(|key| verify_message(&key, &winner.signature, &message));
        if !matches!(verified, Some(Ok(()))) {
            warn!("{} winner from {} has an invalid signature", kind, winner.voter);
            registry.ask_for_entry(peer, &winner.voter, env.network, env.now);
            let dos = if env.synced { DOS_WINNER_BAD_SIGNATURE } else { 0 };
            return Err(RejectKind::bad_signature(format!("{} winner from {}", kind, winner.voter), dos));
        }

        let before = self.votes_for(winner.block_height, &winner.payee);
        if !self.add_winning_vote(env.chain, winner, env.params.vote_weight(&winner.voter)) {
            return Err(RejectKind::ignored(format!("{} winner for unknown block {}", kind, winner.block_height)));
        }
        let after = self.votes_for(winner.block_height, &winner.payee);
        info!(
            "{} winning vote from {} for {} at {} ({} votes)",
            kind,
            winner.voter,
            hex::encode(&winner.payee),
            winner.block_height,
            after
        );
        env.network.relay(Inventory::new(InventoryType::winner(kind), hash));

        if before < PAYMENT_SIGNATURES_REQUIRED && after >= PAYMENT_SIGNATURES_REQUIRED {
            Ok(Accepted::QuorumReached)
        } else {
            Ok(Accepted::Added)
        }
    }

    fn votes_for(&self, height: u64, script: &[u8]) -> u32 {
        self.blocks
            .get(&height)
            .and_then(|ballot| ballot.payees.iter().find(|payee| payee.script == script))
            .map_or(0, |payee| payee.votes)
    }

    /// A voter must be known, current and in the top ten at `h - 100`; reference nodes always pass.
    fn check_voter(
        &self,
        registry: &mut NodeRegistry,
        peer: &Peer,
        winner: &PaymentWinner,
        env: &PaymentEnv<'_>,
    ) -> QuorumResult<()> {
        if env.params.is_reference_node(&winner.voter) {
            return Ok(());
        }
        let protocol_version = match registry.find(&winner.voter) {
            Some(entry) => entry.protocol_version,
            None => {
                registry.ask_for_entry(peer, &winner.voter, env.network, env.now);
                return Err(RejectKind::UnknownSigner(winner.voter));
            }
        };
        if protocol_version < MIN_WINNER_PEER_PROTO_VERSION {
            return Err(RejectKind::ignored(format!("{} runs protocol {}", winner.voter, protocol_version)));
        }

        let rank_height = winner.block_height.saturating_sub(PAYMENT_RANK_OFFSET);
        match registry.rank_of(env.chain, &winner.voter, rank_height, MIN_WINNER_PEER_PROTO_VERSION, env.now) {
            Some(rank) if rank <= PAYMENT_SIGNATURES_TOTAL => Ok(()),
            Some(rank) if rank > PAYMENT_SIGNATURES_TOTAL * 2 && env.synced => Err(RejectKind::malformed(
                format!("{} not in the top {} ({})", winner.voter, PAYMENT_SIGNATURES_TOTAL, rank),
                DOS_WINNER_RANK_ABUSE,
            )),
            Some(rank) => Err(RejectKind::ignored(format!(
                "{} not in the top {} ({})",
                winner.voter, PAYMENT_SIGNATURES_TOTAL, rank
            ))),
            None => Err(RejectKind::ignored(format!("{} has no rank at {}", winner.voter, rank_height))),
        }
    }

    /// Casts our own vote for `height` when we are eligible.
    pub fn process_block(
        &mut self,
        registry: &mut NodeRegistry,
        voter: &OutPoint,
        operator_key: &NodeKeyPair,
        height: u64,
        env: &PaymentEnv<'_>,
    ) -> Option<PaymentWinner> {
        let kind = self.params.kind;
        if !env.params.is_reference_node(voter) {
            let rank_height = height.saturating_sub(PAYMENT_RANK_OFFSET);
            match registry.rank_of(env.chain, voter, rank_height, MIN_WINNER_PEER_PROTO_VERSION, env.now) {
                Some(rank) if rank <= PAYMENT_SIGNATURES_TOTAL => {}
                Some(rank) => {
                    debug!("{} {} not in the top {} ({})", kind, voter, PAYMENT_SIGNATURES_TOTAL, rank);
                    return None;
                }
                None => {
                    debug!("{} {} is not ranked at {}", kind, voter, rank_height);
                    return None;
                }
            }
        }
        if height <= self.last_own_vote_height {
            return None;
        }
        if env.budget.is_budget_payment_block(height) {
            debug!("{} block {} is paid by the budget", kind, height);
            return None;
        }

        let tip = env.chain.tip_height()?;
        let enabled = registry.count_enabled(None);
        let min_proto = self.min_payment_proto(env.sporks, env.now);
        let (next, _) = registry.next_in_queue_for_payment(
            env.chain,
            height,
            min_proto,
            env.now,
            |entry| self.is_scheduled(&entry.payee_script(), tip, height),
            |entry| self.seconds_since_payment(env.chain, entry, enabled, env.now),
        );
        let payee = match next.and_then(|outpoint| registry.find(&outpoint)) {
            Some(entry) => entry.payee_script(),
            None => {
                debug!("{} found no node to pay at {}", kind, height);
                return None;
            }
        };

        let winner = create_winner(operator_key, *voter, height, payee);
        if !self.add_winning_vote(env.chain, &winner, env.params.vote_weight(voter)) {
            return None;
        }
        info!("{} voted for {} at {}", kind, hex::encode(&winner.payee), height);
        env.network.relay(Inventory::new(InventoryType::winner(kind), winner.hash()));
        self.last_own_vote_height = height;
        Some(winner)
    }

    /// Pushes every vote in `[tip - needed, tip + 20]` to `peer`, then the count.
    pub fn sync(&self, peer: &Peer, needed: u32, tip: u64, enabled: usize, network: &dyn PeerNetwork) -> u32 {
        let needed = u64::from(needed).min((enabled * 5 / 4) as u64);
        let low = tip.saturating_sub(needed);
        let high = tip + WINNER_LOOKAHEAD_BLOCKS;
        let mut sent = 0;
        for winner in self.votes.values() {
            if winner.block_height >= low && winner.block_height <= high {
                network.push(peer.id, QuorumMessage::Winner(self.params.kind, winner.clone()));
                sent += 1;
            }
        }
        network.push(peer.id, QuorumMessage::SyncStatusCount(self.params.kind, SyncItem::Winners, sent));
        debug!("{} sent {} winners to {}", self.params.kind, sent, peer.id);
        sent
    }

    /// Drops ballots older than `max(1.25 * registry size, 1000)` blocks; returns the removed vote hashes.
    pub fn check_and_remove(&mut self, tip: u64, registry_size: usize) -> Vec<Hash> {
        let limit = ((registry_size * 5 / 4) as u64).max(MIN_PAYMENT_RETENTION_BLOCKS);
        let old: Vec<Hash> = self
            .votes
            .iter()
            .filter(|(_, winner)| tip.saturating_sub(winner.block_height) > limit)
            .map(|(hash, _)| *hash)
            .collect();
        for hash in &old {
            if let Some(winner) = self.votes.remove(hash) {
                debug!("{} removing old payment vote for {}", self.params.kind, winner.block_height);
                self.blocks.remove(&winner.block_height);
            }
        }
        old
    }

    /// Writes the class payment into a coinbase for `height`; returns the payee, if any.
    ///
    /// The ballot winner is paid when there is one, otherwise the highest-scoring enabled node.
    pub fn fill_block_payee(
        &self,
        registry: &mut NodeRegistry,
        tx: &mut Transaction,
        height: u64,
        block_value: u64,
        env: &PaymentEnv<'_>,
    ) -> Option<Vec<u8>> {
        let payee = match self.block_payee(height) {
            Some(payee) => payee,
            None => {
                let min_proto = self.min_payment_proto(env.sporks, env.now);
                match registry.current_winner(env.chain, height, min_proto, env.now) {
                    Some(entry) => entry.payee_script(),
                    None => {
                        debug!("{} no node to pay at {}", self.params.kind, height);
                        return None;
                    }
                }
            }
        };

        let payment = self.params.payment(block_value);
        let slot = self.params.payment_slot;
        let outputs = tx.get_outputs_mut();
        if outputs.is_empty() {
            outputs.push(TxOutput::new(block_value, Vec::new()));
        }
        while outputs.len() <= slot {
            outputs.push(TxOutput::new(0, Vec::new()));
        }
        outputs[slot] = TxOutput::new(payment, payee.clone());
        outputs[0].value = outputs[0].value.saturating_sub(payment);
        info!("{} payment of {} to {} at {}", self.params.kind, payment, hex::encode(&payee), height);
        Some(payee)
    }

    /// Block-level payee rule, including budget blocks and the enforcement spork.
    pub fn is_block_payee_valid(
        &self,
        tx: &Transaction,
        height: u64,
        value_created: u64,
        block_time: i64,
        prev_block_time: i64,
        env: &PaymentEnv<'_>,
    ) -> bool {
        let kind = self.params.kind;
        if !env.synced {
            debug!("not synced, skipping {} payee checks", kind);
            return true;
        }

        let superblocks = env.sporks.is_active(SporkId::EnableSuperblocks, env.now) || env.params.network == Network::Testnet;
        if superblocks && env.budget.is_budget_payment_block(height) {
            if env.budget.is_transaction_valid(tx, height) {
                return true;
            }
            warn!("invalid budget payment at {}", height);
            return !env.sporks.is_active(SporkId::MasternodeBudgetEnforcement, env.now);
        }

        if self.is_transaction_valid(tx, height, value_created, env.params.pos_start_height) {
            return true;
        }
        if block_time - prev_block_time > env.params.chain_stall_seconds {
            info!("chain stall of {} seconds, accepting block {} without {} payment", block_time - prev_block_time, height, kind);
            return true;
        }
        warn!("invalid {} payment at {}: {}", kind, height, self.required_payments_string(height));
        !env.sporks.is_active(self.params.payment_enforcement_spork, env.now)
    }

    pub fn oldest_block(&self) -> Option<u64> {
        self.blocks.keys().next().copied()
    }

    pub fn newest_block(&self) -> Option<u64> {
        self.blocks.keys().next_back().copied()
    }

    pub fn clear(&mut self) {
        self.votes.clear();
        self.blocks.clear();
        self.last_vote.clear();
    }
}

impl fmt::Display for PaymentVotingEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} votes: {}, blocks: {}", self.params.kind, self.votes.len(), self.blocks.len())
    }
}

/// Deterministic per-node value used to spread payment order.
fn payment_spread(entry: &NodeEntry) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&entry.outpoint.txid);
    hasher.update(&entry.outpoint.vout.to_le_bytes());
    hasher.update(&entry.sig_time.to_le_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryChain;

    fn coinbase(outputs: Vec<TxOutput>) -> Transaction {
        Transaction::coinbase(10, outputs)
    }

    #[test]
    fn test_can_vote_once_per_height() {
        let mut engine = PaymentVotingEngine::new(ClassParams::masternode());
        let voter = OutPoint::new([1u8; 32], 0);
        assert!(engine.can_vote(&voter, 10));
        assert!(!engine.can_vote(&voter, 10));
        assert!(engine.can_vote(&voter, 11));
    }

    #[test]
    fn test_ballot_accepts_anything_below_threshold() {
        let mut ballot = BlockPayees::new(500);
        ballot.add_payee(&[1u8; 25], PAYMENT_SIGNATURES_REQUIRED - 1);
        assert!(!ballot.is_decided());
        assert!(ballot.is_transaction_valid(&coinbase(vec![]), 45, 1, true));
    }

    #[test]
    fn test_decided_ballot_requires_payee_amount_and_slot() {
        let mut ballot = BlockPayees::new(500);
        let script = vec![7u8; 25];
        ballot.add_payee(&script, PAYMENT_SIGNATURES_REQUIRED);
        let good = coinbase(vec![TxOutput::new(55, vec![]), TxOutput::new(45, script.clone())]);
        let wrong_amount = coinbase(vec![TxOutput::new(56, vec![]), TxOutput::new(44, script.clone())]);
        let wrong_slot = coinbase(vec![TxOutput::new(45, script.clone()), TxOutput::new(55, vec![])]);
        assert!(ballot.is_transaction_valid(&good, 45, 1, true));
        assert!(!ballot.is_transaction_valid(&wrong_amount, 45, 1, true));
        assert!(!ballot.is_transaction_valid(&wrong_slot, 45, 1, true));
        assert!(ballot.is_transaction_valid(&wrong_slot, 45, 1, false));
    }

    #[test]
    fn test_winner_prefers_most_votes_then_first_named() {
        let mut ballot = BlockPayees::new(1);
        ballot.add_payee(&[1u8], 2);
        ballot.add_payee(&[2u8], 2);
        assert_eq!(ballot.winner().unwrap().script, vec![1u8]);
        ballot.add_payee(&[2u8], 1);
        assert_eq!(ballot.winner().unwrap().script, vec![2u8]);
        assert_eq!(ballot.required_payments_string(), "01:2, 02:3");
        assert_eq!(BlockPayees::new(2).required_payments_string(), "Unknown");
    }

    #[test]
    fn test_add_winning_vote_needs_rank_block_and_dedupes() {
        let chain = MemoryChain::with_blocks(150, 0, 60);
        let mut engine = PaymentVotingEngine::new(ClassParams::masternode());
        let winner = PaymentWinner { voter: OutPoint::new([1u8; 32], 0), block_height: 160, payee: vec![9u8], signature: vec![] };
        assert!(engine.add_winning_vote(&chain, &winner, 1));
        assert!(!engine.add_winning_vote(&chain, &winner, 1));
        assert_eq!(engine.block_payee(160), Some(vec![9u8]));

        let too_far = PaymentWinner { block_height: 400, ..winner };
        assert!(!engine.add_winning_vote(&chain, &too_far, 1));
    }

    #[test]
    fn test_reference_weight_decides_alone() {
        let chain = MemoryChain::with_blocks(150, 0, 60);
        let mut engine = PaymentVotingEngine::new(ClassParams::masternode());
        let winner = PaymentWinner { voter: OutPoint::new([1u8; 32], 0), block_height: 160, payee: vec![9u8], signature: vec![] };
        engine.add_winning_vote(&chain, &winner, 100);
        assert!(engine.ballot(160).unwrap().is_decided());
    }

    #[test]
    fn test_is_scheduled_skips_the_height_being_decided() {
        let chain = MemoryChain::with_blocks(150, 0, 60);
        let mut engine = PaymentVotingEngine::new(ClassParams::masternode());
        let winner = PaymentWinner { voter: OutPoint::new([1u8; 32], 0), block_height: 152, payee: vec![9u8], signature: vec![] };
        engine.add_winning_vote(&chain, &winner, 1);
        assert!(engine.is_scheduled(&[9u8], 150, 151));
        assert!(!engine.is_scheduled(&[9u8], 150, 152));
        assert!(!engine.is_scheduled(&[9u8], 160, 0));
    }

    #[test]
    fn test_check_and_remove_keeps_retention_window() {
        let chain = MemoryChain::with_blocks(1_200, 0, 60);
        let mut engine = PaymentVotingEngine::new(ClassParams::masternode());
        for height in [150u64, 1_100] {
            let winner = PaymentWinner { voter: OutPoint::new([1u8; 32], 0), block_height: height, payee: vec![9u8], signature: vec![] };
            engine.add_winning_vote(&chain, &winner, 1);
        }
        let removed = engine.check_and_remove(1_200, 10);
        assert_eq!(removed.len(), 1);
        assert_eq!(engine.oldest_block(), Some(1_100));
        assert_eq!(engine.newest_block(), Some(1_100));
    }

    #[test]
    fn test_min_payment_proto_follows_spork() {
        let engine = PaymentVotingEngine::new(ClassParams::systemnode());
        let sporks = SporkEngine::new([0u8; 32]);
        assert_eq!(engine.min_payment_proto(&sporks, 1_600_000_000), MIN_PAYMENT_PROTO_VERSION_PREV);
    }
}
