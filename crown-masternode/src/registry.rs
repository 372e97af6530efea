//! The list of known nodes of one class, keyed by collateral outpoint.
//!
//! One `NodeRegistry` type serves both masternodes and systemnodes; everything class-specific
//! comes from its [`ClassParams`]. Besides the entries it keeps the seen-broadcast and seen-ping
//! maps used for relay deduplication and the rate-limit tables for list requests.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crown_shared_types::{Hash, NodeBroadcast, NodePing, OutPoint, PublicKey, QuorumMessage, SyncItem};
use log::{debug, info, warn};

use crate::chain::{is_local_addr, ChainState, Peer, PeerNetwork};
use crate::constants::{DOS_REPEATED_LIST_REQUEST, LIST_REQUEST_SECONDS, PAYMENT_RANK_OFFSET};
use crate::error::{Accepted, QuorumResult, RejectKind};
use crate::node::{NodeEntry, NodeState};
use crate::params::ClassParams;
use crate::score::{rank_nodes, ScoredNode};

pub struct NodeRegistry {
    params: ClassParams,
    entries: BTreeMap<OutPoint, NodeEntry>,
    /// Peers that asked us for the full list, and when they may ask again.
    asked_us_for_list: HashMap<IpAddr, i64>,
    we_asked_for_list: HashMap<IpAddr, i64>,
    we_asked_for_entry: HashMap<OutPoint, i64>,
    seen_broadcasts: HashMap<Hash, NodeBroadcast>,
    seen_pings: HashMap<Hash, NodePing>,
}

impl NodeRegistry {
    pub fn new(params: ClassParams) -> Self {
        NodeRegistry {
            params,
            entries: BTreeMap::new(),
            asked_us_for_list: HashMap::new(),
            we_asked_for_list: HashMap::new(),
            we_asked_for_entry: HashMap::new(),
            seen_broadcasts: HashMap::new(),
            seen_pings: HashMap::new(),
        }
    }

    pub fn params(&self) -> &ClassParams {
        &self.params
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &NodeEntry> {
        self.entries.values()
    }

    pub fn find(&self, outpoint: &OutPoint) -> Option<&NodeEntry> {
        self.entries.get(outpoint)
    }

    pub fn find_mut(&mut self, outpoint: &OutPoint) -> Option<&mut NodeEntry> {
        self.entries.get_mut(outpoint)
    }

    /// Entry whose operator signs with `pubkey`.
    pub fn find_by_operator(&self, pubkey: &PublicKey) -> Option<&NodeEntry> {
        self.entries.values().find(|entry| &entry.operator_pubkey == pubkey)
    }

    pub fn find_by_addr(&self, addr: &SocketAddr) -> Option<&NodeEntry> {
        self.entries.values().find(|entry| &entry.addr == addr)
    }

    pub fn has_ip(&self, ip: &IpAddr) -> bool {
        self.entries.values().any(|entry| &entry.addr.ip() == ip)
    }

    /// Inserts an enabled entry; returns `false` if it is not enabled or the outpoint is taken.
    pub fn add(&mut self, entry: NodeEntry) -> bool {
        if !entry.is_enabled() || self.entries.contains_key(&entry.outpoint) {
            return false;
        }
        info!("{} registry: adding {} {} ({} now)", self.params.kind, entry.outpoint, entry.addr, self.entries.len() + 1);
        self.entries.insert(entry.outpoint, entry);
        true
    }

    pub fn remove(&mut self, outpoint: &OutPoint) -> Option<NodeEntry> {
        self.entries.remove(outpoint)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.asked_us_for_list.clear();
        self.we_asked_for_list.clear();
        self.we_asked_for_entry.clear();
        self.seen_broadcasts.clear();
        self.seen_pings.clear();
    }

    /// Enabled entries, optionally only those at or above `min_proto`.
    pub fn count_enabled(&self, min_proto: Option<u32>) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.is_enabled() && min_proto.map_or(true, |p| entry.protocol_version >= p))
            .count()
    }

    /// Re-evaluates every entry (each at most once per check interval unless forced).
    pub fn check_all(&mut self, chain: &dyn ChainState, now: i64, force: bool) {
        for entry in self.entries.values_mut() {
            entry.check(chain, &self.params, now, force);
        }
    }

    /// Drops dead entries and stale bookkeeping; returns the removed outpoints.
    pub fn check_and_remove(
        &mut self,
        chain: &dyn ChainState,
        now: i64,
        force_expired: bool,
        min_proto: u32,
    ) -> Vec<OutPoint> {
        self.check_all(chain, now, false);

        let doomed: Vec<OutPoint> = self
            .entries
            .values()
            .filter(|entry| match entry.state {
                NodeState::Remove | NodeState::VinSpent => true,
                NodeState::Expired => force_expired,
                NodeState::Enabled => entry.protocol_version < min_proto,
            })
            .map(|entry| entry.outpoint)
            .collect();

        for outpoint in &doomed {
            if let Some(entry) = self.entries.remove(outpoint) {
                info!(
                    "{} registry: removing {} {} in state {:?} ({} now)",
                    self.params.kind,
                    outpoint,
                    entry.addr,
                    entry.state,
                    self.entries.len()
                );
            }
            self.seen_broadcasts.retain(|_, b| b.outpoint != *outpoint);
            self.we_asked_for_entry.remove(outpoint);
        }

        self.asked_us_for_list.retain(|_, until| *until >= now);
        self.we_asked_for_list.retain(|_, until| *until >= now);
        self.we_asked_for_entry.retain(|_, until| *until >= now);

        let horizon = now - self.params.removal_seconds * 2;
        self.seen_broadcasts.retain(|_, b| b.last_ping.sig_time >= horizon);
        self.seen_pings.retain(|_, p| p.sig_time >= horizon);

        doomed
    }

    /// Enabled entries at or above `min_proto`, scored for `height`, best first.
    pub fn ranked(&mut self, chain: &dyn ChainState, height: u64, min_proto: u32, now: i64) -> Vec<ScoredNode> {
        self.check_all(chain, now, false);
        let candidates: Vec<OutPoint> = self
            .entries
            .values()
            .filter(|entry| entry.is_enabled() && entry.protocol_version >= min_proto)
            .map(|entry| entry.outpoint)
            .collect();
        rank_nodes(chain, candidates, self.params.min_confirmations, height)
    }

    /// One-based rank of `outpoint` among enabled nodes at `height`, `None` if it is not ranked.
    pub fn rank_of(
        &mut self,
        chain: &dyn ChainState,
        outpoint: &OutPoint,
        height: u64,
        min_proto: u32,
        now: i64,
    ) -> Option<usize> {
        self.ranked(chain, height, min_proto, now)
            .iter()
            .position(|scored| &scored.outpoint == outpoint)
            .map(|index| index + 1)
    }

    /// The highest-scoring enabled node at `height`.
    pub fn current_winner(&mut self, chain: &dyn ChainState, height: u64, min_proto: u32, now: i64) -> Option<&NodeEntry> {
        let best = self.ranked(chain, height, min_proto, now).first().map(|scored| scored.outpoint)?;
        self.entries.get(&best)
    }

    /// Picks the node to pay at `height` and reports how many nodes were eligible.
    ///
    /// Eligible nodes are enabled, at `min_proto` or above, not already scheduled, announced long
    /// enough ago and with a collateral at least as old as the network is large. If fewer than a
    /// third of the network qualifies the announce-age filter is dropped. Of the tenth of the
    /// network unpaid the longest, the one with the highest score at `height - 100` wins.
    pub fn next_in_queue_for_payment<S, P>(
        &mut self,
        chain: &dyn ChainState,
        height: u64,
        min_proto: u32,
        now: i64,
        is_scheduled: S,
        seconds_since_paid: P,
    ) -> (Option<OutPoint>, usize)
    where
        S: Fn(&NodeEntry) -> bool,
        P: Fn(&NodeEntry) -> i64,
    {
        self.check_all(chain, now, false);
        let network_size = self.count_enabled(None);

        let mut filter_sig_time = true;
        let mut queue: Vec<(i64, OutPoint)> = loop {
            let candidates: Vec<(i64, OutPoint)> = self
                .entries
                .values()
                .filter(|entry| entry.is_enabled() && entry.protocol_version >= min_proto)
                .filter(|entry| !is_scheduled(entry))
                .filter(|entry| !filter_sig_time || entry.sig_time + network_size as i64 * 60 <= now)
                .filter(|entry| entry.input_age(chain).map_or(false, |age| age >= network_size as u64))
                .map(|entry| (seconds_since_paid(entry), entry.outpoint))
                .collect();
            if filter_sig_time && candidates.len() < network_size / 3 {
                filter_sig_time = false;
                continue;
            }
            break candidates;
        };
        let eligible = queue.len();

        // Longest unpaid first.
        queue.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        let tenth = (network_size / 10).max(1);
        let shortlist: Vec<OutPoint> = queue.into_iter().take(tenth).map(|(_, outpoint)| outpoint).collect();

        let rank_height = height.saturating_sub(PAYMENT_RANK_OFFSET);
        let winner = rank_nodes(chain, shortlist, self.params.min_confirmations, rank_height)
            .first()
            .map(|scored| scored.outpoint);
        debug!("{} next in queue for {}: {:?} of {} eligible", self.params.kind, height, winner, eligible);
        (winner, eligible)
    }

    /// Asks `peer` for a single entry, at most once per ping interval per outpoint.
    pub fn ask_for_entry(&mut self, peer: &Peer, outpoint: &OutPoint, network: &dyn PeerNetwork, now: i64) -> bool {
        if let Some(until) = self.we_asked_for_entry.get(outpoint) {
            if now < *until {
                return false;
            }
        }
        debug!("{} registry: asking {} for missing entry {}", self.params.kind, peer.id, outpoint);
        network.push(peer.id, QuorumMessage::ListRequest(self.params.kind, Some(*outpoint)));
        self.we_asked_for_entry.insert(*outpoint, now + self.params.min_ping_seconds);
        true
    }

    /// Asks `peer` for the full list; non-local peers on mainnet at most once per 3 hours.
    pub fn request_list(&mut self, peer: &Peer, network: &dyn PeerNetwork, now: i64, mainnet: bool) -> bool {
        let limited = mainnet && !peer.is_local();
        if limited {
            if let Some(until) = self.we_asked_for_list.get(&peer.addr.ip()) {
                if now < *until {
                    debug!("{} registry: already asked {} for the list", self.params.kind, peer.addr);
                    return false;
                }
            }
        }
        network.push(peer.id, QuorumMessage::ListRequest(self.params.kind, None));
        if limited {
            self.we_asked_for_list.insert(peer.addr.ip(), now + LIST_REQUEST_SECONDS);
        }
        true
    }

    /// Answers a list request with the broadcasts and pings of enabled, publicly reachable entries.
    pub fn process_list_request(
        &mut self,
        peer: &Peer,
        requested: Option<OutPoint>,
        network: &dyn PeerNetwork,
        now: i64,
        mainnet: bool,
    ) -> QuorumResult {
        if requested.is_none() && mainnet && !peer.is_local() {
            let ip = peer.addr.ip();
            if let Some(until) = self.asked_us_for_list.get(&ip) {
                if now < *until {
                    warn!("{} registry: peer {} already asked for the list", self.params.kind, peer.addr);
                    return Err(RejectKind::malformed("list requested again too soon", DOS_REPEATED_LIST_REQUEST));
                }
            }
            self.asked_us_for_list.insert(ip, now + LIST_REQUEST_SECONDS);
        }

        let kind = self.params.kind;
        let mut sent: u32 = 0;
        for entry in self.entries.values() {
            if is_local_addr(&entry.addr.ip()) || !entry.is_enabled() {
                continue;
            }
            if requested.map_or(false, |outpoint| outpoint != entry.outpoint) {
                continue;
            }
            let broadcast = match entry.to_broadcast() {
                Some(broadcast) => broadcast,
                None => continue,
            };
            self.seen_broadcasts.entry(broadcast.hash()).or_insert_with(|| broadcast.clone());
            let ping = broadcast.last_ping.clone();
            network.push(peer.id, QuorumMessage::Broadcast(kind, broadcast));
            network.push(peer.id, QuorumMessage::Ping(kind, ping));
            sent += 1;
            if requested.is_some() {
                debug!("{} registry: sent entry {} to {}", kind, entry.outpoint, peer.id);
                return Ok(Accepted::Served);
            }
        }

        if requested.is_none() {
            network.push(peer.id, QuorumMessage::SyncStatusCount(kind, SyncItem::List, sent));
            debug!("{} registry: sent {} entries to {}", kind, sent, peer.id);
        }
        Ok(Accepted::Served)
    }

    pub fn seen_broadcast(&self, hash: &Hash) -> Option<&NodeBroadcast> {
        self.seen_broadcasts.get(hash)
    }

    pub fn insert_seen_broadcast(&mut self, broadcast: NodeBroadcast) {
        self.seen_broadcasts.insert(broadcast.hash(), broadcast);
    }

    /// Forgets a broadcast so the same message can be evaluated again later.
    pub fn forget_broadcast(&mut self, hash: &Hash) {
        self.seen_broadcasts.remove(hash);
    }

    /// Keeps a stored broadcast's embedded ping current so relays of it stay valid.
    pub fn update_seen_broadcast_ping(&mut self, broadcast_hash: &Hash, ping: &NodePing) {
        if let Some(broadcast) = self.seen_broadcasts.get_mut(broadcast_hash) {
            broadcast.last_ping = ping.clone();
        }
    }

    pub fn seen_ping(&self, hash: &Hash) -> Option<&NodePing> {
        self.seen_pings.get(hash)
    }

    pub fn insert_seen_ping(&mut self, ping: NodePing) {
        self.seen_pings.insert(ping.hash(), ping);
    }
}

impl fmt::Display for NodeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}s: {}, enabled: {}, seen broadcasts: {}, seen pings: {}",
            self.params.kind,
            self.entries.len(),
            self.count_enabled(None),
            self.seen_broadcasts.len(),
            self.seen_pings.len()
        )
    }
}
