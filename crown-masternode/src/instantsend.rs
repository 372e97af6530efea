//! InstantSend: the top ten masternodes vote to lock the inputs of a transaction before it is mined.
//!
//! A lock request names the transaction; each eligible masternode signs `(tx hash, height)` where
//! the height is derived from the age of the youngest input so an attacker cannot pick the quorum.
//! Six matching votes complete the lock. Two complete locks on the same input cancel each other.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crown_crypto::{sign_message, verify_message, NodeKeyPair};
use crown_shared_types::{Hash, Inventory, InventoryType, LockVote, OutPoint, Transaction};
use log::{debug, info, warn};

use crate::chain::{ChainState, Mempool, Peer, PeerNetwork};
use crate::constants::{
    COIN, INSTANTX_SIGNATURES_REQUIRED, INSTANTX_SIGNATURES_TOTAL, IX_ACCEPTED_BLOCK_COUNT, IX_HEIGHT_OFFSET,
    IX_LOCK_EXPIRATION_SECONDS, IX_LOCK_TIMEOUT_SECONDS, IX_MIN_INPUT_CONFIRMATIONS, IX_REPROCESS_BLOCKS,
    IX_UNKNOWN_VOTE_WINDOW, MIN_INSTANTX_PROTO_VERSION,
};
use crate::error::{Accepted, QuorumResult, RejectKind};
use crate::registry::NodeRegistry;
use crate::spork::{SporkEngine, SporkId};

/// The string a lock vote signature covers.
pub fn lock_vote_signing_message(tx_hash: &Hash, block_height: u64) -> String {
    format!("{}{}", hex::encode(tx_hash), block_height)
}

pub fn create_lock_vote(operator_key: &NodeKeyPair, voter: OutPoint, tx_hash: Hash, block_height: u64) -> LockVote {
    let message = lock_vote_signing_message(&tx_hash, block_height);
    LockVote { voter, tx_hash, block_height, signature: sign_message(operator_key, &message) }
}

/// Votes gathered for one transaction.
#[derive(Debug, Clone)]
pub struct TransactionLock {
    pub tx_hash: Hash,
    /// Height the quorum is ranked at; 0 until the lock request has been seen.
    pub block_height: u64,
    pub votes: Vec<LockVote>,
    pub expiration: i64,
    pub timeout: i64,
    completed: bool,
}

impl TransactionLock {
    fn new(tx_hash: Hash, block_height: u64, now: i64) -> Self {
        TransactionLock {
            tx_hash,
            block_height,
            votes: Vec::new(),
            expiration: now + IX_LOCK_EXPIRATION_SECONDS,
            timeout: now + IX_LOCK_TIMEOUT_SECONDS,
            completed: false,
        }
    }

    /// Votes cast for the lock's own height. Votes carry no proof of their height, so others don't count.
    pub fn count_signatures(&self) -> usize {
        if self.block_height == 0 {
            return 0;
        }
        self.votes.iter().filter(|vote| vote.block_height == self.block_height).count()
    }

    pub fn is_complete(&self) -> bool {
        self.count_signatures() >= INSTANTX_SIGNATURES_REQUIRED
    }
}

/// Collaborators and local identity for one InstantSend call.
pub struct LockEnv<'a> {
    pub chain: &'a dyn ChainState,
    pub mempool: &'a dyn Mempool,
    pub network: &'a dyn PeerNetwork,
    pub sporks: &'a SporkEngine,
    pub now: i64,
    /// Our masternode outpoint and operator key when we run one.
    pub voter: Option<(OutPoint, &'a NodeKeyPair)>,
}

#[derive(Default)]
pub struct InstantLockEngine {
    lock_requests: HashMap<Hash, Transaction>,
    rejected: HashMap<Hash, Transaction>,
    locks: BTreeMap<Hash, TransactionLock>,
    votes: HashMap<Hash, LockVote>,
    locked_inputs: HashMap<OutPoint, Hash>,
    /// Voter collateral txid -> time its next unknown vote is allowed.
    unknown_votes: HashMap<Hash, i64>,
    complete_locks: usize,
    pending_reprocess: Option<u64>,
}

impl InstantLockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Structural checks on a lock request. Inputs we cannot resolve are let through.
    pub fn is_ix_tx_valid(&self, tx: &Transaction, chain: &dyn ChainState, sporks: &SporkEngine) -> bool {
        let txid = tx.txid();
        if tx.get_outputs().is_empty() || tx.get_lock_time() != 0 {
            return false;
        }
        let max_value = u64::try_from(sporks.value(SporkId::MaxValue)).unwrap_or(0).saturating_mul(COIN);
        if tx.total_output_value() > max_value {
            info!("lock request {} value too high", hex::encode(txid));
            return false;
        }
        let missing = tx.get_inputs().iter().any(|input| {
            chain
                .transaction(&input.previous_output.txid)
                .map_or(true, |prev| prev.get_outputs().len() <= input.previous_output.vout as usize)
        });
        if missing {
            debug!("lock request {} has unknown inputs", hex::encode(txid));
        }
        true
    }

    /// Creates or re-targets the lock for `tx`; returns its height, or `None` if an input is too young.
    fn create_new_lock(&mut self, tx: &Transaction, chain: &dyn ChainState, now: i64) -> Option<u64> {
        let txid = tx.txid();
        let mut tx_age = 0;
        for input in tx.get_inputs() {
            tx_age = chain.coin_confirmations(&input.previous_output).unwrap_or(0);
            if tx_age < IX_MIN_INPUT_CONFIRMATIONS {
                info!("lock request {} spends an input with {} confirmations", hex::encode(txid), tx_age);
                return None;
            }
        }
        let tip = chain.tip_height()?;
        let height = (tip + IX_HEIGHT_OFFSET).saturating_sub(tx_age);

        match self.locks.get_mut(&txid) {
            Some(lock) => {
                debug!("lock {} exists, height now {}", hex::encode(txid), height);
                lock.block_height = height;
            }
            None => {
                debug!("new lock {} at height {}", hex::encode(txid), height);
                self.locks.insert(txid, TransactionLock::new(txid, height, now));
            }
        }
        self.lock_requests.insert(txid, tx.clone());
        Some(height)
    }

    /// Handles a lock request (`ix`).
    pub fn process_lock_request(
        &mut self,
        registry: &mut NodeRegistry,
        peer: &Peer,
        tx: &Transaction,
        env: &LockEnv<'_>,
    ) -> QuorumResult {
        if !env.sporks.is_active(SporkId::InstantX, env.now) {
            return Err(RejectKind::ignored("instantsend is disabled"));
        }
        if !env.chain.is_synced() {
            return Err(RejectKind::ignored("chain not synced"));
        }
        let txid = tx.txid();
        if self.tx_lock_requested(&txid) {
            return Err(RejectKind::stale(format!("lock request {} already seen", hex::encode(txid))));
        }
        if !self.is_ix_tx_valid(tx, env.chain, env.sporks) {
            return Err(RejectKind::ignored(format!("lock request {} is not lockable", hex::encode(txid))));
        }
        if env.chain.transaction_age(&txid) > IX_ACCEPTED_BLOCK_COUNT {
            return Err(RejectKind::ignored(format!("lock request {} is too old", hex::encode(txid))));
        }
        let height = self
            .create_new_lock(tx, env.chain, env.now)
            .ok_or_else(|| RejectKind::ignored(format!("lock request {} spends young inputs", hex::encode(txid))))?;

        match env.mempool.accept(tx) {
            Ok(()) => {
                env.network.relay(Inventory::new(InventoryType::TxLockRequest, txid));
                self.do_consensus_vote(registry, txid, height, env);
                info!("lock request {} from peer {} accepted", hex::encode(txid), peer.id);
                Ok(Accepted::Added)
            }
            Err(reason) => {
                info!("lock request {} from peer {} rejected: {}", hex::encode(txid), peer.id, reason);
                self.lock_requests.remove(&txid);
                self.rejected.insert(txid, tx.clone());
                for input in tx.get_inputs() {
                    self.locked_inputs.entry(input.previous_output).or_insert(txid);
                }
                let complete = self.locks.get(&txid).map_or(false, TransactionLock::is_complete);
                if complete && self.cancel_conflicting_locks(tx, env).is_none() {
                    info!("lock {} is already complete, reprocessing", hex::encode(txid));
                    self.request_reprocess(IX_REPROCESS_BLOCKS);
                    self.lock_requests.insert(txid, tx.clone());
                }
                Ok(Accepted::Served)
            }
        }
    }

    /// Casts our own vote if we run a masternode in the top ten at `height`.
    fn do_consensus_vote(&mut self, registry: &mut NodeRegistry, tx_hash: Hash, height: u64, env: &LockEnv<'_>) {
        let (voter, key) = match env.voter {
            Some(voter) => voter,
            None => return,
        };
        match registry.rank_of(env.chain, &voter, height, MIN_INSTANTX_PROTO_VERSION, env.now) {
            Some(rank) if rank <= INSTANTX_SIGNATURES_TOTAL => {
                debug!("in the lock quorum at {} (rank {})", height, rank);
            }
            Some(rank) => {
                debug!("not in the top {} for locks ({})", INSTANTX_SIGNATURES_TOTAL, rank);
                return;
            }
            None => {
                debug!("our masternode is not ranked at {}", height);
                return;
            }
        }
        let vote = create_lock_vote(key, voter, tx_hash, height);
        let hash = vote.hash();
        if let Some(lock) = self.locks.get_mut(&tx_hash) {
            lock.votes.push(vote.clone());
        }
        self.votes.insert(hash, vote);
        env.network.relay(Inventory::new(InventoryType::TxLockVote, hash));
    }

    /// Handles a lock vote (`txlvote`).
    pub fn process_vote(
        &mut self,
        registry: &mut NodeRegistry,
        peer: &Peer,
        vote: &LockVote,
        env: &LockEnv<'_>,
    ) -> QuorumResult {
        if !env.sporks.is_active(SporkId::InstantX, env.now) {
            return Err(RejectKind::ignored("instantsend is disabled"));
        }
        if !env.chain.is_synced() {
            return Err(RejectKind::ignored("chain not synced"));
        }
        let hash = vote.hash();
        if self.votes.contains_key(&hash) {
            return Err(RejectKind::stale(format!("lock vote {} already seen", hex::encode(hash))));
        }
        if env.chain.transaction_age(&vote.tx_hash) > IX_ACCEPTED_BLOCK_COUNT {
            info!("lock vote for old transaction {}", hex::encode(vote.tx_hash));
            return Err(RejectKind::ignored(format!("transaction {} is too old to lock", hex::encode(vote.tx_hash))));
        }
        self.votes.insert(hash, vote.clone());

        // A conflict still means the vote was valid and stored.
        let outcome = self.process_consensus_vote(registry, peer, vote, env);
        if matches!(outcome, Err(ref reject) if !matches!(reject, RejectKind::Conflict(..))) {
            return outcome;
        }

        if !self.tx_lock_requested(&vote.tx_hash) && !self.allow_unknown_vote(&vote.voter, env.now) {
            warn!("masternode {} is spamming lock votes for {}", vote.voter, hex::encode(vote.tx_hash));
            return Err(RejectKind::ignored(format!("{} exceeds the unknown vote rate", vote.voter)));
        }
        env.network.relay(Inventory::new(InventoryType::TxLockVote, hash));
        outcome
    }

    /// Votes may precede the request they belong to; those are allowed at the network's average pace.
    fn allow_unknown_vote(&mut self, voter: &OutPoint, now: i64) -> bool {
        let next = *self.unknown_votes.entry(voter.txid).or_insert(now + IX_UNKNOWN_VOTE_WINDOW);
        if next > now && next - self.average_vote_time() > IX_UNKNOWN_VOTE_WINDOW {
            return false;
        }
        self.unknown_votes.insert(voter.txid, now + IX_UNKNOWN_VOTE_WINDOW);
        true
    }

    fn average_vote_time(&self) -> i64 {
        if self.unknown_votes.is_empty() {
            return 0;
        }
        self.unknown_votes.values().sum::<i64>() / self.unknown_votes.len() as i64
    }

    /// Checks rank and signature, then adds the vote to its lock.
    fn process_consensus_vote(
        &mut self,
        registry: &mut NodeRegistry,
        peer: &Peer,
        vote: &LockVote,
        env: &LockEnv<'_>,
    ) -> QuorumResult {
        let rank = match registry.rank_of(env.chain, &vote.voter, vote.block_height, MIN_INSTANTX_PROTO_VERSION, env.now) {
            Some(rank) => rank,
            None => {
                debug!("lock vote from unranked masternode {}", vote.voter);
                registry.ask_for_entry(peer, &vote.voter, env.network, env.now);
                return Err(RejectKind::UnknownSigner(vote.voter));
            }
        };
        if rank > INSTANTX_SIGNATURES_TOTAL {
            return Err(RejectKind::ignored(format!(
                "{} not in the top {} ({})",
                vote.voter, INSTANTX_SIGNATURES_TOTAL, rank
            )));
        }

        let message = lock_vote_signing_message(&vote.tx_hash, vote.block_height);
        let valid = registry
            .find(&vote.voter)
            .map_or(false, |entry| verify_message(&entry.operator_pubkey, &vote.signature, &message).is_ok());
        if !valid {
            // Could be a masternode we have stale keys for; no penalty.
            registry.ask_for_entry(peer, &vote.voter, env.network, env.now);
            return Err(RejectKind::bad_signature(format!("lock vote from {}", vote.voter), 0));
        }

        let lock = self.locks.entry(vote.tx_hash).or_insert_with(|| {
            debug!("new lock {} from a vote", hex::encode(vote.tx_hash));
            TransactionLock::new(vote.tx_hash, 0, env.now)
        });
        lock.votes.push(vote.clone());
        let signatures = lock.count_signatures();
        debug!("lock {} has {} votes", hex::encode(vote.tx_hash), signatures);
        if signatures < INSTANTX_SIGNATURES_REQUIRED {
            return Ok(Accepted::Added);
        }
        self.complete_lock(&vote.tx_hash, env)
    }

    fn complete_lock(&mut self, tx_hash: &Hash, env: &LockEnv<'_>) -> QuorumResult {
        let first = match self.locks.get_mut(tx_hash) {
            Some(lock) if !lock.completed => {
                lock.completed = true;
                true
            }
            _ => false,
        };
        if first {
            self.complete_locks += 1;
            info!("lock {} is complete", hex::encode(tx_hash));
        }

        let tx = self.lock_requests.get(tx_hash).or_else(|| self.rejected.get(tx_hash)).cloned();
        if let Some(tx) = tx {
            if let Some((ours, theirs)) = self.cancel_conflicting_locks(&tx, env) {
                return Err(RejectKind::Conflict(ours, theirs));
            }
            if self.lock_requests.contains_key(tx_hash) {
                for input in tx.get_inputs() {
                    self.locked_inputs.entry(input.previous_output).or_insert(*tx_hash);
                }
            }
        }
        if self.rejected.contains_key(tx_hash) {
            info!("rejected transaction {} is locked, reprocessing", hex::encode(tx_hash));
            self.request_reprocess(IX_REPROCESS_BLOCKS);
        }
        Ok(if first { Accepted::QuorumReached } else { Accepted::Updated })
    }

    /// If another transaction already holds one of `tx`'s inputs, expires both locks, releases
    /// their inputs and asks for a reprocess. Returns the pair.
    pub fn check_for_conflicting_locks(&mut self, tx: &Transaction, now: i64) -> Option<(Hash, Hash)> {
        let txid = tx.txid();
        let other = tx
            .get_inputs()
            .iter()
            .filter_map(|input| self.locked_inputs.get(&input.previous_output))
            .find(|holder| **holder != txid)
            .copied()?;
        warn!("conflicting locks {} and {}, cancelling both", hex::encode(txid), hex::encode(other));
        for hash in [txid, other] {
            if let Some(lock) = self.locks.get_mut(&hash) {
                lock.expiration = now;
            }
        }
        self.locked_inputs.retain(|_, holder| *holder != txid && *holder != other);
        self.request_reprocess(IX_REPROCESS_BLOCKS);
        Some((txid, other))
    }

    /// Like [`check_for_conflicting_locks`](Self::check_for_conflicting_locks), and also evicts
    /// both transactions from the mempool.
    fn cancel_conflicting_locks(&mut self, tx: &Transaction, env: &LockEnv<'_>) -> Option<(Hash, Hash)> {
        let (ours, theirs) = self.check_for_conflicting_locks(tx, env.now)?;
        env.mempool.remove(&ours);
        env.mempool.remove(&theirs);
        Some((ours, theirs))
    }

    fn request_reprocess(&mut self, blocks: u64) {
        self.pending_reprocess = Some(self.pending_reprocess.map_or(blocks, |pending| pending.max(blocks)));
    }

    /// Reprocess depth requested since the last call.
    pub fn take_reprocess_request(&mut self) -> Option<u64> {
        self.pending_reprocess.take()
    }

    /// Announces every known vote (`ixlocklist`).
    pub fn process_lock_list(&self, network: &dyn PeerNetwork) -> QuorumResult {
        for hash in self.votes.keys() {
            network.relay(Inventory::new(InventoryType::TxLockVote, *hash));
        }
        Ok(Accepted::Served)
    }

    /// Drops expired locks along with their request, inputs and votes. Inputs go back only where
    /// the expired transaction is still the one holding them.
    pub fn check_and_remove(&mut self, chain: &dyn ChainState, now: i64) -> usize {
        let expired: Vec<Hash> = self
            .locks
            .values()
            .filter(|lock| now > lock.expiration)
            .map(|lock| lock.tx_hash)
            .collect();
        for tx_hash in &expired {
            info!("removing expired lock {}", hex::encode(tx_hash));
            let rejected = self.rejected.remove(tx_hash);
            if let Some(tx) = self.lock_requests.remove(tx_hash).or(rejected) {
                for input in tx.get_inputs() {
                    if self.locked_inputs.get(&input.previous_output) == Some(tx_hash) {
                        self.locked_inputs.remove(&input.previous_output);
                    }
                }
            }
            if let Some(lock) = self.locks.remove(tx_hash) {
                for vote in &lock.votes {
                    self.votes.remove(&vote.hash());
                }
            }
        }

        let locks = &self.locks;
        self.votes.retain(|_, vote| {
            locks.contains_key(&vote.tx_hash) && chain.transaction_age(&vote.tx_hash) <= IX_ACCEPTED_BLOCK_COUNT
        });
        expired.len()
    }

    /// Signatures counted for `tx_hash`; `None` when there is no lock.
    pub fn signatures_count(&self, tx_hash: &Hash) -> Option<usize> {
        self.locks.get(tx_hash).map(TransactionLock::count_signatures)
    }

    pub fn is_lock_timed_out(&self, tx_hash: &Hash, now: i64) -> bool {
        self.locks.get(tx_hash).map_or(false, |lock| now > lock.timeout)
    }

    pub fn tx_lock_requested(&self, tx_hash: &Hash) -> bool {
        self.lock_requests.contains_key(tx_hash) || self.rejected.contains_key(tx_hash)
    }

    pub fn already_have(&self, vote_hash: &Hash) -> bool {
        self.votes.contains_key(vote_hash)
    }

    pub fn vote(&self, vote_hash: &Hash) -> Option<&LockVote> {
        self.votes.get(vote_hash)
    }

    pub fn lock_request(&self, tx_hash: &Hash) -> Option<&Transaction> {
        self.lock_requests.get(tx_hash)
    }

    pub fn lock(&self, tx_hash: &Hash) -> Option<&TransactionLock> {
        self.locks.get(tx_hash)
    }

    /// Transaction holding `outpoint`, if any.
    pub fn locked_by(&self, outpoint: &OutPoint) -> Option<Hash> {
        self.locked_inputs.get(outpoint).copied()
    }

    pub fn is_input_locked(&self, outpoint: &OutPoint) -> bool {
        self.locked_inputs.contains_key(outpoint)
    }

    pub fn complete_locks_count(&self) -> usize {
        self.complete_locks
    }

    pub fn clear(&mut self) {
        self.locked_inputs.clear();
        self.votes.clear();
        self.lock_requests.clear();
        self.locks.clear();
        self.unknown_votes.clear();
        self.rejected.clear();
    }
}

impl fmt::Display for InstantLockEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Transaction lock requests: {}, Transaction locks: {}, Locked Inputs: {}, Transaction lock votes: {}",
            self.lock_requests.len(),
            self.locks.len(),
            self.locked_inputs.len(),
            self.votes.len()
        )
    }
}
