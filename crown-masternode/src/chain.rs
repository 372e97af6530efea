//! Interfaces to the parts of the node the quorum layer does not own.
//!
//! Heights and hashes are resolved through these traits at the time of use; nothing here hands
//! out references into chain storage, so a reorganisation can never leave an engine holding a
//! dangling block index.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use crown_shared_types::{Hash, Inventory, OutPoint, PeerId, QuorumMessage, Transaction};

/// An unspent output as seen by the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coin {
    pub value: u64,
    pub script_pubkey: Vec<u8>,
    /// Height of the block that created the output.
    pub height: u64,
}

/// The peer a message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Peer {
    pub id: PeerId,
    pub addr: SocketAddr,
    pub version: u32,
}

impl Peer {
    /// A connection from this machine or the local network; list-request limits do not apply.
    pub fn is_local(&self) -> bool {
        is_local_addr(&self.addr.ip())
    }
}

/// Loopback, unspecified, or an RFC1918 private IPv4 address.
pub fn is_local_addr(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_unspecified(),
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
    }
}

/// Read access to the active chain.
pub trait ChainState: Send + Sync {
    fn tip_height(&self) -> Option<u64>;
    /// Hash of the active-chain block at `height`, `None` above the tip.
    fn block_hash_at(&self, height: u64) -> Option<Hash>;
    fn height_of(&self, hash: &Hash) -> Option<u64>;
    fn block_time_at(&self, height: u64) -> Option<i64>;
    fn coin(&self, outpoint: &OutPoint) -> Option<Coin>;
    fn transaction(&self, txid: &Hash) -> Option<Transaction>;
    /// Confirmations of a transaction, 0 when unconfirmed or unknown.
    fn transaction_age(&self, txid: &Hash) -> u64;
    /// Whether the node has caught up with the network.
    fn is_synced(&self) -> bool;

    /// Confirmations of an unspent output, `None` once spent.
    fn coin_confirmations(&self, outpoint: &OutPoint) -> Option<u64> {
        let coin = self.coin(outpoint)?;
        let tip = self.tip_height()?;
        Some(tip.saturating_sub(coin.height) + 1)
    }
}

pub trait Mempool: Send + Sync {
    fn accept(&self, tx: &Transaction) -> Result<(), String>;
    fn remove(&self, txid: &Hash);
}

/// Outbound side of the connection manager.
pub trait PeerNetwork: Send + Sync {
    fn relay(&self, inventory: Inventory);
    fn push(&self, peer: PeerId, message: QuorumMessage);
    fn misbehaving(&self, peer: PeerId, score: u32);
}

/// Superblock budget collaborator.
pub trait Budget: Send + Sync {
    fn clear(&self);
    fn is_budget_payment_block(&self, height: u64) -> bool;
    fn is_transaction_valid(&self, tx: &Transaction, height: u64) -> bool;
    fn required_payments_string(&self, height: u64) -> String;
}

/// Write access used when quorum results force the chain to be re-derived.
pub trait ChainMutator: Send + Sync {
    /// Clears the failure flag of blocks rejected at or after `since` (unix seconds).
    fn reset_failed_since(&self, since: i64) -> usize;
    fn disconnect_tip(&self) -> Result<Hash, String>;
    fn activate_best_chain(&self) -> Result<(), String>;
    fn resync_mempool(&self);
}

pub trait Clock: Send + Sync {
    /// Unix time in seconds.
    fn now(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now: i64) -> Self {
        ManualClock { now: AtomicI64::new(now) }
    }

    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, seconds: i64) {
        self.now.fetch_add(seconds, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Locks a mutex, recovering the data if a previous holder panicked.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
