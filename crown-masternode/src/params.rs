//! Per-network and per-node-class parameters.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crown_shared_types::{NodeKind, OutPoint};
use serde::{Deserialize, Serialize};

use crate::constants::COIN;
use crate::error::QuorumError;
use crate::spork::SporkId;

/// Vote weight given to a reference node's payment votes.
pub const REFERENCE_NODE_WEIGHT: u32 = 100;

const MAINNET_REFERENCE_NODE: &str = "099c01bea63abd1692f60806bb646fa1d288e2d049281225f17e499024084e28-0";
const TESTNET_REFERENCE_NODE: &str = "fbc16ae5229d6d99181802fd76a4feee5e7640164dcebc7f8feb04a7bea026f8-0";
const REGTEST_REFERENCE_NODE: &str = "e466f5d8beb4c2d22a314310dc58e0ea89505c95409754d0d68fb874952608cc-1";

// ed25519 spork keys per network.
const MAINNET_SPORK_PUBKEY: [u8; 32] = [
    0x3d, 0x40, 0x17, 0xc3, 0xe8, 0x43, 0x89, 0x5a, 0x92, 0xb7, 0x0a, 0xa7, 0x4d, 0x1b, 0x7e, 0xbc,
    0x9c, 0x98, 0x2c, 0xcf, 0x2e, 0xc4, 0x96, 0x8c, 0xc0, 0xcd, 0x55, 0xf1, 0x2a, 0xf4, 0x66, 0x0c,
];
const TESTNET_SPORK_PUBKEY: [u8; 32] = [
    0xfc, 0x51, 0xcd, 0x8e, 0x62, 0x18, 0xa1, 0xa3, 0x8d, 0xa4, 0x7e, 0xd0, 0x02, 0x30, 0xf0, 0x58,
    0x08, 0x16, 0xed, 0x13, 0xba, 0x33, 0x03, 0xac, 0x5d, 0xeb, 0x91, 0x15, 0x48, 0x90, 0x80, 0x25,
];
const REGTEST_SPORK_PUBKEY: [u8; 32] = [
    0xd7, 0x5a, 0x98, 0x01, 0x82, 0xb1, 0x0a, 0xb7, 0xd5, 0x4b, 0xfe, 0xd3, 0xc9, 0x64, 0x07, 0x3a,
    0x0e, 0xe1, 0x72, 0xf3, 0xda, 0xa6, 0x23, 0x25, 0xaf, 0x02, 0x1a, 0x68, 0xf7, 0x07, 0x51, 0x1a,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
        };
        f.write_str(name)
    }
}

impl FromStr for Network {
    type Err = QuorumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mainnet" | "main" => Ok(Network::Mainnet),
            "testnet" | "test" => Ok(Network::Testnet),
            "regtest" => Ok(Network::Regtest),
            other => Err(QuorumError::InvalidConfig(format!("unknown network {}", other))),
        }
    }
}

/// Everything that differs between masternodes and systemnodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassParams {
    pub kind: NodeKind,
    /// Exact collateral amount, in base units.
    pub collateral: u64,
    /// Coinbase output index the payment must occupy once PoS is active.
    pub payment_slot: usize,
    /// Share of the created value paid to the winner, in percent.
    pub payment_percent: u64,
    pub min_confirmations: u64,
    pub check_seconds: i64,
    pub min_broadcast_seconds: i64,
    pub min_ping_seconds: i64,
    pub ping_seconds: i64,
    pub expiration_seconds: i64,
    pub removal_seconds: i64,
    pub payment_enforcement_spork: SporkId,
    pub dont_pay_old_spork: SporkId,
}

impl ClassParams {
    pub fn masternode() -> Self {
        ClassParams {
            kind: NodeKind::Masternode,
            collateral: 10_000 * COIN,
            payment_slot: 1,
            payment_percent: 45,
            min_confirmations: 15,
            check_seconds: 5,
            min_broadcast_seconds: 5 * 60,
            min_ping_seconds: 10 * 60,
            ping_seconds: 5 * 60,
            expiration_seconds: 65 * 60,
            removal_seconds: 75 * 60,
            payment_enforcement_spork: SporkId::MasternodePaymentEnforcement,
            dont_pay_old_spork: SporkId::MasternodeDontPayOldNodes,
        }
    }

    pub fn systemnode() -> Self {
        ClassParams {
            kind: NodeKind::Systemnode,
            collateral: 500 * COIN,
            payment_slot: 2,
            payment_percent: 10,
            payment_enforcement_spork: SporkId::SystemnodePaymentEnforcement,
            dont_pay_old_spork: SporkId::SystemnodeDontPayOldNodes,
            ..ClassParams::masternode()
        }
    }

    /// Payment owed to the winner of a block creating `value_created`.
    pub fn payment(&self, value_created: u64) -> u64 {
        ((value_created as u128 * self.payment_percent as u128) / 100) as u64
    }
}

/// Parameters of one network instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkParams {
    pub network: Network,
    /// The only port mainnet nodes may announce; other networks must not use it.
    pub default_port: u16,
    pub mainnet_port: u16,
    pub spork_pubkey: [u8; 32],
    /// Height at which payment slots become fixed.
    pub pos_start_height: u64,
    /// A block arriving this long after its parent may skip node payments.
    pub chain_stall_seconds: i64,
    /// Bootstrap affordance: payment votes from these outpoints count with the given weight.
    pub reference_weights: HashMap<OutPoint, u32>,
    pub masternode: ClassParams,
    pub systemnode: ClassParams,
}

impl NetworkParams {
    pub fn mainnet() -> Self {
        NetworkParams {
            network: Network::Mainnet,
            default_port: 9340,
            mainnet_port: 9340,
            spork_pubkey: MAINNET_SPORK_PUBKEY,
            pos_start_height: 2_330_000,
            chain_stall_seconds: 60 * 60,
            reference_weights: reference_table(MAINNET_REFERENCE_NODE),
            masternode: ClassParams::masternode(),
            systemnode: ClassParams::systemnode(),
        }
    }

    pub fn testnet() -> Self {
        NetworkParams {
            network: Network::Testnet,
            default_port: 18333,
            spork_pubkey: TESTNET_SPORK_PUBKEY,
            pos_start_height: 5_000,
            reference_weights: reference_table(TESTNET_REFERENCE_NODE),
            ..NetworkParams::mainnet()
        }
    }

    pub fn regtest() -> Self {
        NetworkParams {
            network: Network::Regtest,
            default_port: 18444,
            spork_pubkey: REGTEST_SPORK_PUBKEY,
            pos_start_height: 200,
            reference_weights: reference_table(REGTEST_REFERENCE_NODE),
            ..NetworkParams::mainnet()
        }
    }

    pub fn for_network(network: Network) -> Self {
        match network {
            Network::Mainnet => Self::mainnet(),
            Network::Testnet => Self::testnet(),
            Network::Regtest => Self::regtest(),
        }
    }

    pub fn class(&self, kind: NodeKind) -> &ClassParams {
        match kind {
            NodeKind::Masternode => &self.masternode,
            NodeKind::Systemnode => &self.systemnode,
        }
    }

    pub fn is_mainnet(&self) -> bool {
        self.network == Network::Mainnet
    }

    /// Port rule for announcements: mainnet nodes must use the mainnet port, others must not.
    pub fn is_valid_port(&self, port: u16) -> bool {
        if self.is_mainnet() {
            port == self.mainnet_port
        } else {
            port != self.mainnet_port
        }
    }

    pub fn is_reference_node(&self, outpoint: &OutPoint) -> bool {
        self.reference_weights.contains_key(outpoint)
    }

    /// Weight of a payment vote cast by `outpoint`.
    pub fn vote_weight(&self, outpoint: &OutPoint) -> u32 {
        self.reference_weights.get(outpoint).copied().unwrap_or(1)
    }
}

fn reference_table(text: &str) -> HashMap<OutPoint, u32> {
    text.parse::<OutPoint>()
        .ok()
        .map(|outpoint| (outpoint, REFERENCE_NODE_WEIGHT))
        .into_iter()
        .collect()
}
