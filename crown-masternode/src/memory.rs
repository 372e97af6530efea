//! In-memory collaborators backing the standalone node and the test suites.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crown_shared_types::{Hash, Inventory, OutPoint, PeerId, QuorumMessage, Transaction};
use log::{debug, warn};

use crate::chain::{lock, Budget, ChainMutator, ChainState, Coin, Mempool, PeerNetwork};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRecord {
    pub hash: Hash,
    pub time: i64,
}

#[derive(Debug, Default)]
struct ChainInner {
    blocks: Vec<BlockRecord>,
    coins: HashMap<OutPoint, Coin>,
    transactions: HashMap<Hash, (Transaction, Option<u64>)>,
    failed: Vec<(BlockRecord, i64)>,
    reconsidered: Vec<BlockRecord>,
    detached: Vec<BlockRecord>,
    synced: bool,
    fail_disconnect: bool,
    disconnects: usize,
    activations: usize,
    mempool_resyncs: usize,
}

/// A block list plus UTXO table, enough to answer every `ChainState` question.
#[derive(Debug, Default)]
pub struct MemoryChain {
    inner: Mutex<ChainInner>,
}

/// Deterministic block hash for generated chains.
pub fn block_hash_for(height: u64, salt: u64) -> Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"block");
    hasher.update(&height.to_le_bytes());
    hasher.update(&salt.to_le_bytes());
    hasher.finalize().into()
}

impl MemoryChain {
    /// A synced chain with blocks `0..=tip`, spaced `spacing` seconds apart from `start_time`.
    pub fn with_blocks(tip: u64, start_time: i64, spacing: i64) -> Self {
        let chain = MemoryChain::default();
        {
            let mut inner = lock(&chain.inner);
            inner.synced = true;
            for height in 0..=tip {
                inner.blocks.push(BlockRecord {
                    hash: block_hash_for(height, 0),
                    time: start_time + height as i64 * spacing,
                });
            }
        }
        chain
    }

    /// Appends a block and returns its hash.
    pub fn push_block(&self, time: i64) -> Hash {
        let mut inner = lock(&self.inner);
        let height = inner.blocks.len() as u64;
        let hash = block_hash_for(height, inner.disconnects as u64);
        inner.blocks.push(BlockRecord { hash, time });
        hash
    }

    pub fn add_coin(&self, outpoint: OutPoint, coin: Coin) {
        lock(&self.inner).coins.insert(outpoint, coin);
    }

    pub fn spend_coin(&self, outpoint: &OutPoint) -> Option<Coin> {
        lock(&self.inner).coins.remove(outpoint)
    }

    /// Records a transaction; `height` is `None` while it is unconfirmed.
    pub fn add_transaction(&self, tx: Transaction, height: Option<u64>) {
        let txid = tx.txid();
        lock(&self.inner).transactions.insert(txid, (tx, height));
    }

    pub fn set_synced(&self, synced: bool) {
        lock(&self.inner).synced = synced;
    }

    /// Marks a block as rejected at `time`, detaching it from the active chain if it is the tip.
    pub fn mark_failed(&self, record: BlockRecord, time: i64) {
        let mut inner = lock(&self.inner);
        if inner.blocks.last() == Some(&record) {
            inner.blocks.pop();
        }
        inner.failed.push((record, time));
    }

    pub fn set_fail_disconnect(&self, fail: bool) {
        lock(&self.inner).fail_disconnect = fail;
    }

    pub fn tip_record(&self) -> Option<BlockRecord> {
        lock(&self.inner).blocks.last().cloned()
    }

    pub fn failed_count(&self) -> usize {
        lock(&self.inner).failed.len()
    }

    pub fn disconnects(&self) -> usize {
        lock(&self.inner).disconnects
    }

    pub fn activations(&self) -> usize {
        lock(&self.inner).activations
    }

    pub fn mempool_resyncs(&self) -> usize {
        lock(&self.inner).mempool_resyncs
    }
}

impl ChainState for MemoryChain {
    fn tip_height(&self) -> Option<u64> {
        let inner = lock(&self.inner);
        inner.blocks.len().checked_sub(1).map(|h| h as u64)
    }

    fn block_hash_at(&self, height: u64) -> Option<Hash> {
        lock(&self.inner).blocks.get(height as usize).map(|b| b.hash)
    }

    fn height_of(&self, hash: &Hash) -> Option<u64> {
        lock(&self.inner)
            .blocks
            .iter()
            .position(|b| &b.hash == hash)
            .map(|h| h as u64)
    }

    fn block_time_at(&self, height: u64) -> Option<i64> {
        lock(&self.inner).blocks.get(height as usize).map(|b| b.time)
    }

    fn coin(&self, outpoint: &OutPoint) -> Option<Coin> {
        lock(&self.inner).coins.get(outpoint).cloned()
    }

    fn transaction(&self, txid: &Hash) -> Option<Transaction> {
        lock(&self.inner).transactions.get(txid).map(|(tx, _)| tx.clone())
    }

    fn transaction_age(&self, txid: &Hash) -> u64 {
        let inner = lock(&self.inner);
        let tip = match inner.blocks.len().checked_sub(1) {
            Some(tip) => tip as u64,
            None => return 0,
        };
        match inner.transactions.get(txid) {
            Some((_, Some(height))) if *height <= tip => tip - height + 1,
            _ => 0,
        }
    }

    fn is_synced(&self) -> bool {
        lock(&self.inner).synced
    }
}

impl ChainMutator for MemoryChain {
    fn reset_failed_since(&self, since: i64) -> usize {
        let mut inner = lock(&self.inner);
        let (reset, kept): (Vec<_>, Vec<_>) = inner.failed.drain(..).partition(|(_, time)| *time >= since);
        inner.failed = kept;
        let count = reset.len();
        inner.reconsidered.extend(reset.into_iter().map(|(record, _)| record));
        count
    }

    fn disconnect_tip(&self) -> Result<Hash, String> {
        let mut inner = lock(&self.inner);
        if inner.fail_disconnect {
            return Err("disconnect refused".to_string());
        }
        if inner.blocks.len() <= 1 {
            return Err("cannot disconnect genesis".to_string());
        }
        let record = inner.blocks.pop().ok_or_else(|| "empty chain".to_string())?;
        let hash = record.hash;
        inner.detached.push(record);
        inner.disconnects += 1;
        Ok(hash)
    }

    fn activate_best_chain(&self) -> Result<(), String> {
        let mut inner = lock(&self.inner);
        while let Some(record) = inner.detached.pop() {
            inner.blocks.push(record);
        }
        let reconsidered: Vec<_> = inner.reconsidered.drain(..).collect();
        inner.blocks.extend(reconsidered);
        inner.activations += 1;
        Ok(())
    }

    fn resync_mempool(&self) {
        lock(&self.inner).mempool_resyncs += 1;
    }
}

/// Accepts transactions unless they spend an input another pooled transaction already spends.
#[derive(Debug, Default)]
pub struct MemoryMempool {
    inner: Mutex<MempoolInner>,
}

#[derive(Debug, Default)]
struct MempoolInner {
    transactions: HashMap<Hash, Transaction>,
    spent_by: HashMap<OutPoint, Hash>,
}

impl MemoryMempool {
    pub fn contains(&self, txid: &Hash) -> bool {
        lock(&self.inner).transactions.contains_key(txid)
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Mempool for MemoryMempool {
    fn accept(&self, tx: &Transaction) -> Result<(), String> {
        let txid = tx.txid();
        let mut inner = lock(&self.inner);
        for input in tx.get_inputs() {
            if let Some(other) = inner.spent_by.get(&input.previous_output) {
                if other != &txid {
                    return Err(format!("input {} already spent by {}", input.previous_output, hex::encode(other)));
                }
            }
        }
        for input in tx.get_inputs() {
            inner.spent_by.insert(input.previous_output, txid);
        }
        inner.transactions.insert(txid, tx.clone());
        Ok(())
    }

    fn remove(&self, txid: &Hash) {
        let mut inner = lock(&self.inner);
        if inner.transactions.remove(txid).is_some() {
            inner.spent_by.retain(|_, spender| spender != txid);
        }
    }
}

/// Records everything the quorum layer sends so callers can inspect it.
#[derive(Debug, Default)]
pub struct MemoryNetwork {
    relayed: Mutex<Vec<Inventory>>,
    pushed: Mutex<Vec<(PeerId, QuorumMessage)>>,
    misbehaviour: Mutex<HashMap<PeerId, u32>>,
}

impl MemoryNetwork {
    pub fn relayed(&self) -> Vec<Inventory> {
        lock(&self.relayed).clone()
    }

    pub fn pushed_to(&self, peer: PeerId) -> Vec<QuorumMessage> {
        lock(&self.pushed)
            .iter()
            .filter(|(p, _)| *p == peer)
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub fn misbehaviour(&self, peer: PeerId) -> u32 {
        lock(&self.misbehaviour).get(&peer).copied().unwrap_or(0)
    }

    pub fn clear(&self) {
        lock(&self.relayed).clear();
        lock(&self.pushed).clear();
    }
}

impl PeerNetwork for MemoryNetwork {
    fn relay(&self, inventory: Inventory) {
        debug!("relay {:?} {}", inventory.kind, hex::encode(inventory.hash));
        lock(&self.relayed).push(inventory);
    }

    fn push(&self, peer: PeerId, message: QuorumMessage) {
        debug!("push {} to peer {}", message.command(), peer);
        lock(&self.pushed).push((peer, message));
    }

    fn misbehaving(&self, peer: PeerId, score: u32) {
        warn!("peer {} misbehaving, score +{}", peer, score);
        *lock(&self.misbehaviour).entry(peer).or_insert(0) += score;
    }
}

/// Budget collaborator with a configurable set of superblock heights.
#[derive(Debug, Default)]
pub struct MemoryBudget {
    payment_blocks: Mutex<HashSet<u64>>,
    valid: Mutex<HashSet<Hash>>,
    clears: AtomicUsize,
}

impl MemoryBudget {
    pub fn add_payment_block(&self, height: u64) {
        lock(&self.payment_blocks).insert(height);
    }

    /// Marks a transaction as paying the budget correctly.
    pub fn approve(&self, txid: Hash) {
        lock(&self.valid).insert(txid);
    }

    pub fn clears(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }
}

impl Budget for MemoryBudget {
    fn clear(&self) {
        lock(&self.payment_blocks).clear();
        lock(&self.valid).clear();
        self.clears.fetch_add(1, Ordering::SeqCst);
    }

    fn is_budget_payment_block(&self, height: u64) -> bool {
        lock(&self.payment_blocks).contains(&height)
    }

    fn is_transaction_valid(&self, tx: &Transaction, _height: u64) -> bool {
        lock(&self.valid).contains(&tx.txid())
    }

    fn required_payments_string(&self, height: u64) -> String {
        if self.is_budget_payment_block(height) {
            "budget".to_string()
        } else {
            "Unknown".to_string()
        }
    }
}
