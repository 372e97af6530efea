//! Network-wide feature switches signed by a single well-known key.
//!
//! A spork is "active" once its value, read as a unix timestamp, lies in the past. Value-carrying
//! sporks (`MaxValue`, `ReconsiderBlocks`) are read through [`SporkEngine::value`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crown_crypto::{sign_message, verify_message, NodeKeyPair};
use crown_shared_types::{Hash, Inventory, InventoryType, SporkMessage};
use log::{debug, info, warn};

use crate::constants::DOS_BAD_SPORK_SIGNATURE;
use crate::error::{Accepted, QuorumError, QuorumResult, RejectKind};

/// Value reported for ids nobody knows: 2099-01-01, never active.
pub const SPORK_UNKNOWN_VALUE: i64 = 4_070_908_800;

/// Long past; the feature is on.
const ON: i64 = 978_307_200;
const OFF: i64 = SPORK_UNKNOWN_VALUE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SporkId {
    InstantX,
    InstantXBlockFiltering,
    EnableMasternodePayments,
    MaxValue,
    MasternodeScanning,
    MasternodePaymentEnforcement,
    MasternodeBudgetEnforcement,
    MasternodeDontPayOldNodes,
    ResetBudget,
    ReconsiderBlocks,
    EnableSuperblocks,
    SystemnodePaymentEnforcement,
    SystemnodeDontPayOldNodes,
    DisconnectOldNodes,
    NftTx,
}

impl SporkId {
    pub const ALL: [SporkId; 15] = [
        SporkId::InstantX,
        SporkId::InstantXBlockFiltering,
        SporkId::EnableMasternodePayments,
        SporkId::MaxValue,
        SporkId::MasternodeScanning,
        SporkId::MasternodePaymentEnforcement,
        SporkId::MasternodeBudgetEnforcement,
        SporkId::MasternodeDontPayOldNodes,
        SporkId::ResetBudget,
        SporkId::ReconsiderBlocks,
        SporkId::EnableSuperblocks,
        SporkId::SystemnodePaymentEnforcement,
        SporkId::SystemnodeDontPayOldNodes,
        SporkId::DisconnectOldNodes,
        SporkId::NftTx,
    ];

    /// Numeric id used on the wire.
    pub fn id(&self) -> u32 {
        match self {
            SporkId::InstantX => 2,
            SporkId::InstantXBlockFiltering => 3,
            SporkId::EnableMasternodePayments => 4,
            SporkId::MaxValue => 5,
            SporkId::MasternodeScanning => 7,
            SporkId::MasternodePaymentEnforcement => 8,
            SporkId::MasternodeBudgetEnforcement => 9,
            SporkId::MasternodeDontPayOldNodes => 10,
            SporkId::ResetBudget => 11,
            SporkId::ReconsiderBlocks => 12,
            SporkId::EnableSuperblocks => 13,
            SporkId::SystemnodePaymentEnforcement => 14,
            SporkId::SystemnodeDontPayOldNodes => 15,
            SporkId::DisconnectOldNodes => 16,
            SporkId::NftTx => 17,
        }
    }

    pub fn from_id(id: u32) -> Option<SporkId> {
        SporkId::ALL.iter().copied().find(|spork| spork.id() == id)
    }

    pub fn name(&self) -> &'static str {
        match self {
            SporkId::InstantX => "SPORK_2_INSTANTX",
            SporkId::InstantXBlockFiltering => "SPORK_3_INSTANTX_BLOCK_FILTERING",
            SporkId::EnableMasternodePayments => "SPORK_4_ENABLE_MASTERNODE_PAYMENTS",
            SporkId::MaxValue => "SPORK_5_MAX_VALUE",
            SporkId::MasternodeScanning => "SPORK_7_MASTERNODE_SCANNING",
            SporkId::MasternodePaymentEnforcement => "SPORK_8_MASTERNODE_PAYMENT_ENFORCEMENT",
            SporkId::MasternodeBudgetEnforcement => "SPORK_9_MASTERNODE_BUDGET_ENFORCEMENT",
            SporkId::MasternodeDontPayOldNodes => "SPORK_10_MASTERNODE_DONT_PAY_OLD_NODES",
            SporkId::ResetBudget => "SPORK_11_RESET_BUDGET",
            SporkId::ReconsiderBlocks => "SPORK_12_RECONSIDER_BLOCKS",
            SporkId::EnableSuperblocks => "SPORK_13_ENABLE_SUPERBLOCKS",
            SporkId::SystemnodePaymentEnforcement => "SPORK_14_SYSTEMNODE_PAYMENT_ENFORCEMENT",
            SporkId::SystemnodeDontPayOldNodes => "SPORK_15_SYSTEMNODE_DONT_PAY_OLD_NODES",
            SporkId::DisconnectOldNodes => "SPORK_16_DISCONNECT_OLD_NODES",
            SporkId::NftTx => "SPORK_17_NFT_TX",
        }
    }

    /// Compiled-in value used until a signed record is seen.
    pub fn default_value(&self) -> i64 {
        match self {
            SporkId::InstantX
            | SporkId::InstantXBlockFiltering
            | SporkId::EnableMasternodePayments
            | SporkId::MasternodeScanning => ON,
            // Largest lockable output, in whole coins.
            SporkId::MaxValue => 10_000,
            SporkId::ResetBudget | SporkId::ReconsiderBlocks => 0,
            SporkId::MasternodePaymentEnforcement
            | SporkId::MasternodeBudgetEnforcement
            | SporkId::MasternodeDontPayOldNodes
            | SporkId::EnableSuperblocks
            | SporkId::SystemnodePaymentEnforcement
            | SporkId::SystemnodeDontPayOldNodes
            | SporkId::DisconnectOldNodes
            | SporkId::NftTx => OFF,
        }
    }
}

impl fmt::Display for SporkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SporkId {
    type Err = QuorumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SporkId::ALL
            .iter()
            .copied()
            .find(|spork| spork.name() == s)
            .ok_or_else(|| QuorumError::NotFound(format!("unknown spork {}", s)))
    }
}

/// The exact string a spork signature covers: id, value and signing time in decimal.
pub fn spork_signing_message(id: u32, value: i64, signed_at: i64) -> String {
    format!("{}{}{}", id, value, signed_at)
}

/// What accepting a spork requires of the rest of the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SporkAction {
    None,
    ClearBudget,
    /// Disconnect and revalidate this many blocks.
    Reprocess(u64),
}

fn action_for(id: u32, value: i64) -> SporkAction {
    match SporkId::from_id(id) {
        Some(SporkId::ResetBudget) if value == 1 => SporkAction::ClearBudget,
        Some(SporkId::ReconsiderBlocks) if value > 0 => SporkAction::Reprocess(value as u64),
        _ => SporkAction::None,
    }
}

/// Latest signed record per spork id.
pub struct SporkEngine {
    pubkey: [u8; 32],
    records: BTreeMap<u32, SporkMessage>,
    by_hash: BTreeMap<Hash, SporkMessage>,
    signer: Option<NodeKeyPair>,
}

impl SporkEngine {
    pub fn new(pubkey: [u8; 32]) -> Self {
        SporkEngine { pubkey, records: BTreeMap::new(), by_hash: BTreeMap::new(), signer: None }
    }

    /// Verifies a received record and stores it if newer than the one held.
    ///
    /// On success the caller relays the inventory and runs the returned action.
    pub fn process(&mut self, spork: &SporkMessage) -> QuorumResult<SporkAction> {
        let hash = spork.hash();
        if let Some(current) = self.records.get(&spork.id) {
            if current.signed_at >= spork.signed_at {
                debug!("spork {} seen {}", spork.id, hex::encode(hash));
                return Err(RejectKind::stale(format!(
                    "spork {} signed at {} is not newer than {}",
                    spork.id, spork.signed_at, current.signed_at
                )));
            }
            debug!("spork {} updated {}", spork.id, hex::encode(hash));
        }

        let message = spork_signing_message(spork.id, spork.value, spork.signed_at);
        if let Err(e) = verify_message(&self.pubkey, &spork.signature, &message) {
            warn!("spork {} has an invalid signature: {}", spork.id, e);
            return Err(RejectKind::bad_signature(format!("spork {}: {}", spork.id, e), DOS_BAD_SPORK_SIGNATURE));
        }

        info!("spork {} set to {} (signed at {})", spork.id, spork.value, spork.signed_at);
        self.store(spork.clone());
        Ok(action_for(spork.id, spork.value))
    }

    fn store(&mut self, spork: SporkMessage) {
        if let Some(previous) = self.records.get(&spork.id) {
            self.by_hash.remove(&previous.hash());
        }
        self.by_hash.insert(spork.hash(), spork.clone());
        self.records.insert(spork.id, spork);
    }

    pub fn value(&self, spork: SporkId) -> i64 {
        self.value_by_id(spork.id())
    }

    /// Stored value, else the compiled default, else a far-future time.
    pub fn value_by_id(&self, id: u32) -> i64 {
        if let Some(record) = self.records.get(&id) {
            return record.value;
        }
        match SporkId::from_id(id) {
            Some(spork) => spork.default_value(),
            None => {
                debug!("unknown spork {}", id);
                SPORK_UNKNOWN_VALUE
            }
        }
    }

    pub fn is_active(&self, spork: SporkId, now: i64) -> bool {
        self.value(spork) < now
    }

    pub fn record(&self, id: u32) -> Option<&SporkMessage> {
        self.records.get(&id)
    }

    pub fn by_hash(&self, hash: &Hash) -> Option<&SporkMessage> {
        self.by_hash.get(hash)
    }

    pub fn has_seen(&self, hash: &Hash) -> bool {
        self.by_hash.contains_key(hash)
    }

    /// Every stored record, ordered by id; the answer to `GETSPORKS`.
    pub fn records(&self) -> impl Iterator<Item = &SporkMessage> {
        self.records.values()
    }

    /// Installs the spork private key after checking it matches the network key.
    pub fn set_signer(&mut self, keypair: NodeKeyPair) -> Result<(), QuorumError> {
        if keypair.public_key_bytes() != self.pubkey {
            return Err(QuorumError::InvalidConfig("spork key does not match the network spork pubkey".to_string()));
        }
        info!("initialised as spork signer");
        self.signer = Some(keypair);
        Ok(())
    }

    /// Signs and stores a new value; returns the record and inventory to relay.
    pub fn update(&mut self, spork: SporkId, value: i64, now: i64) -> Result<(SporkMessage, Inventory), QuorumError> {
        let signer = self
            .signer
            .as_ref()
            .ok_or_else(|| QuorumError::InvalidConfig("no spork key configured".to_string()))?;
        let message = spork_signing_message(spork.id(), value, now);
        let record = SporkMessage { id: spork.id(), value, signed_at: now, signature: sign_message(signer, &message) };
        verify_message(&self.pubkey, &record.signature, &message)?;
        let inventory = Inventory::new(InventoryType::Spork, record.hash());
        self.store(record.clone());
        info!("signed spork {} = {}", spork, value);
        Ok((record, inventory))
    }
}

impl fmt::Debug for SporkEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SporkEngine")
            .field("pubkey", &hex::encode(self.pubkey))
            .field("records", &self.records.len())
            .field("signer", &self.signer.is_some())
            .finish()
    }
}
