//! Node announcements (broadcasts) and heartbeats (pings).
//!
//! A broadcast binds a collateral outpoint to a network address and an operator key and is signed
//! by the collateral key. A ping is signed by the operator key and keeps the entry alive. Both are
//! deduplicated through the registry's seen maps before any validation work.

use std::net::{IpAddr, SocketAddr};

use crown_crypto::hash::script_for_pubkey;
use crown_crypto::signature::parse_public_key;
use crown_crypto::{sign_message, verify_message, NodeKeyPair};
use crown_shared_types::{Hash, Inventory, InventoryType, NodeBroadcast, NodeKind, NodePing, OutPoint};
use log::{debug, info, warn};

use crate::chain::{is_local_addr, ChainState, PeerNetwork};
use crate::constants::{DOS_BAD_KEY, DOS_BAD_PING_SIGNATURE, DOS_FUTURE_SIG_TIME, MAX_SIG_TIME_SKEW, PING_MAX_BLOCK_AGE};
use crate::error::{Accepted, QuorumResult, RejectKind};
use crate::node::{collateral_is_valid, NodeEntry};
use crate::params::{Network, NetworkParams};
use crate::registry::NodeRegistry;

/// The string a broadcast signature covers.
pub fn broadcast_signing_message(
    addr: &SocketAddr,
    sig_time: i64,
    collateral_pubkey: &[u8; 32],
    operator_pubkey: &[u8; 32],
    protocol_version: u32,
) -> String {
    format!(
        "{}{}{}{}{}",
        addr,
        sig_time,
        hex::encode(collateral_pubkey),
        hex::encode(operator_pubkey),
        protocol_version
    )
}

/// The string a ping signature covers.
pub fn ping_signing_message(outpoint: &OutPoint, block_hash: &Hash, sig_time: i64) -> String {
    format!("{}{}{}", outpoint.to_short_string(), hex::encode(block_hash), sig_time)
}

pub fn create_ping(operator_key: &NodeKeyPair, outpoint: OutPoint, block_hash: Hash, now: i64) -> NodePing {
    let message = ping_signing_message(&outpoint, &block_hash, now);
    NodePing { outpoint, block_hash, sig_time: now, signature: sign_message(operator_key, &message) }
}

/// Builds a fully signed announcement for `outpoint`.
pub fn create_broadcast(
    collateral_key: &NodeKeyPair,
    operator_key: &NodeKeyPair,
    outpoint: OutPoint,
    addr: SocketAddr,
    protocol_version: u32,
    block_hash: Hash,
    now: i64,
) -> NodeBroadcast {
    let collateral_pubkey = collateral_key.public_key_bytes();
    let operator_pubkey = operator_key.public_key_bytes();
    let message = broadcast_signing_message(&addr, now, &collateral_pubkey, &operator_pubkey, protocol_version);
    NodeBroadcast {
        outpoint,
        addr,
        collateral_pubkey,
        operator_pubkey,
        signature: sign_message(collateral_key, &message),
        sig_time: now,
        protocol_version,
        last_ping: create_ping(operator_key, outpoint, block_hash, now),
    }
}

fn verify_ping_signature(ping: &NodePing, operator_pubkey: &[u8; 32]) -> QuorumResult<()> {
    let message = ping_signing_message(&ping.outpoint, &ping.block_hash, ping.sig_time);
    verify_message(operator_pubkey, &ping.signature, &message)
        .map_err(|e| RejectKind::bad_signature(format!("ping from {}: {}", ping.outpoint, e), DOS_BAD_PING_SIGNATURE))
}

fn check_ping_time(ping: &NodePing, now: i64) -> QuorumResult<()> {
    if ping.sig_time > now + MAX_SIG_TIME_SKEW {
        return Err(RejectKind::malformed(
            format!("ping from {} signed too far in the future", ping.outpoint),
            DOS_FUTURE_SIG_TIME,
        ));
    }
    if ping.sig_time <= now - MAX_SIG_TIME_SKEW {
        return Err(RejectKind::malformed(
            format!("ping from {} signed too far in the past", ping.outpoint),
            DOS_FUTURE_SIG_TIME,
        ));
    }
    Ok(())
}

/// Announced addresses must be IPv4 and publicly routable, except on regtest.
pub fn is_valid_net_addr(addr: &SocketAddr, network: Network) -> bool {
    if network == Network::Regtest {
        return true;
    }
    match addr.ip() {
        IpAddr::V4(v4) => !is_local_addr(&addr.ip()) && !v4.is_broadcast() && !v4.is_link_local(),
        IpAddr::V6(_) => false,
    }
}

/// Everything a broadcast or ping handler reads besides the registry itself.
pub struct AnnounceEnv<'a> {
    pub chain: &'a dyn ChainState,
    pub network: &'a dyn PeerNetwork,
    pub params: &'a NetworkParams,
    pub now: i64,
    /// Nodes below the current payment protocol are ignored.
    pub min_proto: u32,
}

/// Validates a broadcast and adds or refreshes the registry entry.
///
/// `masternodes` is the masternode registry when `registry` holds systemnodes; a systemnode may
/// not reuse an address already announced by a masternode.
pub fn process_broadcast(
    registry: &mut NodeRegistry,
    masternodes: Option<&NodeRegistry>,
    broadcast: &NodeBroadcast,
    env: &AnnounceEnv<'_>,
) -> QuorumResult {
    let kind = registry.params().kind;
    let hash = broadcast.hash();
    if registry.seen_broadcast(&hash).is_some() {
        return Err(RejectKind::stale(format!("{} broadcast {} already seen", kind, hex::encode(hash))));
    }
    registry.insert_seen_broadcast(broadcast.clone());
    debug!("{} broadcast {} from {}", kind, hex::encode(hash), broadcast.outpoint);

    if !is_valid_net_addr(&broadcast.addr, env.params.network) {
        return Err(RejectKind::ignored(format!("{} broadcast with invalid address {}", kind, broadcast.addr)));
    }
    if let Some(masternodes) = masternodes {
        if masternodes.has_ip(&broadcast.addr.ip()) {
            return Err(RejectKind::ignored(format!("a masternode already uses {}", broadcast.addr.ip())));
        }
    }

    check_broadcast(registry, broadcast, env)?;

    if let Some(existing) = registry.find(&broadcast.outpoint) {
        if existing.sig_time >= broadcast.sig_time {
            warn!(
                "{} broadcast for {} signed at {} is not newer than {}",
                kind, broadcast.outpoint, broadcast.sig_time, existing.sig_time
            );
            return Err(RejectKind::stale(format!("{} broadcast for {} is not newer", kind, broadcast.outpoint)));
        }
        // A new collateral key has to prove ownership of the coin again.
        if existing.is_enabled() && existing.collateral_pubkey == broadcast.collateral_pubkey {
            return update_existing(registry, broadcast, env);
        }
    }

    check_inputs_and_add(registry, broadcast, env)
}

/// Checks that need no registry lookup other than the current ping key.
fn check_broadcast(registry: &NodeRegistry, broadcast: &NodeBroadcast, env: &AnnounceEnv<'_>) -> QuorumResult<()> {
    let kind = registry.params().kind;
    if broadcast.sig_time > env.now + MAX_SIG_TIME_SKEW {
        return Err(RejectKind::malformed(
            format!("{} broadcast for {} signed too far in the future", kind, broadcast.outpoint),
            DOS_FUTURE_SIG_TIME,
        ));
    }
    if broadcast.protocol_version < env.min_proto {
        return Err(RejectKind::ignored(format!(
            "{} {} runs outdated protocol {}",
            kind, broadcast.outpoint, broadcast.protocol_version
        )));
    }
    if parse_public_key(&broadcast.collateral_pubkey).is_err() || parse_public_key(&broadcast.operator_pubkey).is_err() {
        return Err(RejectKind::malformed(format!("{} broadcast with an invalid key", kind), DOS_BAD_KEY));
    }

    if broadcast.last_ping.outpoint != broadcast.outpoint {
        return Err(RejectKind::malformed(format!("{} broadcast carries a foreign ping", kind), 0));
    }
    check_ping_time(&broadcast.last_ping, env.now)?;
    let ping_key = registry
        .find(&broadcast.outpoint)
        .map(|entry| entry.operator_pubkey)
        .unwrap_or(broadcast.operator_pubkey);
    verify_ping_signature(&broadcast.last_ping, &ping_key)?;

    let message = broadcast_signing_message(
        &broadcast.addr,
        broadcast.sig_time,
        &broadcast.collateral_pubkey,
        &broadcast.operator_pubkey,
        broadcast.protocol_version,
    );
    if let Err(e) = verify_message(&broadcast.collateral_pubkey, &broadcast.signature, &message) {
        // Old signers produced bad signatures; drop the entry without punishing the relay.
        return Err(RejectKind::bad_signature(format!("{} broadcast for {}: {}", kind, broadcast.outpoint, e), 0));
    }

    if !env.params.is_valid_port(broadcast.addr.port()) {
        return Err(RejectKind::ignored(format!("{} broadcast on wrong port {}", kind, broadcast.addr.port())));
    }
    Ok(())
}

/// Applies a strictly newer broadcast to a known entry. Only the relay is throttled by
/// `min_broadcast_seconds`; the entry always ends up as if the newer broadcast came first.
fn update_existing(registry: &mut NodeRegistry, broadcast: &NodeBroadcast, env: &AnnounceEnv<'_>) -> QuorumResult {
    let params = registry.params().clone();
    let entry = match registry.find_mut(&broadcast.outpoint) {
        Some(entry) => entry,
        None => return Err(RejectKind::UnknownSigner(broadcast.outpoint)),
    };
    let relay = !entry.is_broadcasted_within(params.min_broadcast_seconds, env.now);

    info!("{} got updated entry for {} at {}", params.kind, broadcast.outpoint, broadcast.addr);
    entry.update_from(broadcast);
    entry.check(env.chain, &params, env.now, true);
    if !relay {
        debug!("{} broadcast for {} follows the last one too closely to relay", params.kind, broadcast.outpoint);
    } else if entry.is_enabled() {
        env.network.relay(announcement_inventory(params.kind, broadcast));
    }
    Ok(Accepted::Updated)
}

/// First sighting of an outpoint: the collateral must belong to the signer, hold the exact
/// amount, be old enough, and have confirmed before the broadcast was signed.
fn check_inputs_and_add(registry: &mut NodeRegistry, broadcast: &NodeBroadcast, env: &AnnounceEnv<'_>) -> QuorumResult {
    let params = registry.params().clone();
    let kind = params.kind;

    let coin = match env.chain.coin(&broadcast.outpoint) {
        Some(coin) => coin,
        None => {
            return Err(RejectKind::ignored(format!("{} collateral {} is not unspent", kind, broadcast.outpoint)));
        }
    };
    if coin.script_pubkey != script_for_pubkey(&broadcast.collateral_pubkey) {
        return Err(RejectKind::ignored(format!("{} collateral {} is not owned by the signer", kind, broadcast.outpoint)));
    }
    if !collateral_is_valid(env.chain, &broadcast.outpoint, &params) {
        return Err(RejectKind::ignored(format!("{} collateral {} has the wrong amount", kind, broadcast.outpoint)));
    }

    let age = env.chain.coin_confirmations(&broadcast.outpoint).unwrap_or(0);
    if age < params.min_confirmations {
        // Let it be checked again once we have more blocks.
        registry.forget_broadcast(&broadcast.hash());
        return Err(RejectKind::ignored(format!(
            "{} collateral {} has {} of {} confirmations",
            kind, broadcast.outpoint, age, params.min_confirmations
        )));
    }
    let confirmation_height = coin.height + params.min_confirmations - 1;
    if let Some(confirmed_at) = env.chain.block_time_at(confirmation_height) {
        if confirmed_at > broadcast.sig_time {
            return Err(RejectKind::ignored(format!(
                "{} broadcast for {} signed at {} before its collateral confirmed at {}",
                kind, broadcast.outpoint, broadcast.sig_time, confirmed_at
            )));
        }
    }

    registry.remove(&broadcast.outpoint);
    let mut entry = NodeEntry::from_broadcast(kind, broadcast);
    entry.check(env.chain, &params, env.now, true);
    if !registry.add(entry) {
        return Err(RejectKind::ignored(format!("{} {} is not enabled", kind, broadcast.outpoint)));
    }
    info!("{} new entry {} at {}", kind, broadcast.outpoint, broadcast.addr);

    let local = env.params.network != Network::Regtest && is_local_addr(&broadcast.addr.ip());
    if !local {
        env.network.relay(announcement_inventory(kind, broadcast));
    }
    Ok(Accepted::Added)
}

/// Validates a ping and refreshes the entry it belongs to.
///
/// `UnknownSigner` means the entry is missing or too old to accept pings; the caller should ask
/// the sending peer for it.
pub fn process_ping(registry: &mut NodeRegistry, ping: &NodePing, env: &AnnounceEnv<'_>) -> QuorumResult {
    let params = registry.params().clone();
    let kind = params.kind;
    let hash = ping.hash();
    if registry.seen_ping(&hash).is_some() {
        return Err(RejectKind::stale(format!("{} ping {} already seen", kind, hex::encode(hash))));
    }
    registry.insert_seen_ping(ping.clone());

    check_ping_time(ping, env.now)?;

    let entry = match registry.find(&ping.outpoint) {
        Some(entry) if entry.protocol_version >= env.min_proto => entry,
        _ => {
            debug!("{} ping from unknown or outdated {}", kind, ping.outpoint);
            return Err(RejectKind::UnknownSigner(ping.outpoint));
        }
    };
    if entry.is_pinged_within(params.min_ping_seconds - 60, ping.sig_time) {
        debug!("{} ping from {} arrived too early", kind, ping.outpoint);
        return Err(RejectKind::ignored(format!("{} ping from {} arrived too early", kind, ping.outpoint)));
    }
    verify_ping_signature(ping, &entry.operator_pubkey)?;

    let tip = env.chain.tip_height().unwrap_or(0);
    match env.chain.height_of(&ping.block_hash) {
        Some(height) if height + PING_MAX_BLOCK_AGE < tip => {
            return Err(RejectKind::ignored(format!("{} ping from {} names an old block", kind, ping.outpoint)));
        }
        Some(_) => {}
        None => {
            return Err(RejectKind::ignored(format!("{} ping from {} names an unknown block", kind, ping.outpoint)));
        }
    }

    let old_broadcast_hash = entry.to_broadcast().map(|b| b.hash());
    if let Some(hash) = old_broadcast_hash {
        registry.update_seen_broadcast_ping(&hash, ping);
    }
    let enabled = match registry.find_mut(&ping.outpoint) {
        Some(entry) => {
            entry.last_ping = Some(ping.clone());
            entry.check(env.chain, &params, env.now, true);
            entry.is_enabled()
        }
        None => false,
    };
    if !enabled {
        return Err(RejectKind::ignored(format!("{} {} is not enabled after ping", kind, ping.outpoint)));
    }

    debug!("{} ping accepted from {}", kind, ping.outpoint);
    env.network.relay(Inventory::new(InventoryType::ping(kind), hash));
    Ok(Accepted::Updated)
}

pub fn announcement_inventory(kind: NodeKind, broadcast: &NodeBroadcast) -> Inventory {
    Inventory::new(InventoryType::announce(kind), broadcast.hash())
}
