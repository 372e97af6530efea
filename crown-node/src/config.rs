use std::collections::HashMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use crown_crypto::signature::parse_public_key_hex;
use crown_crypto::NodeKeyPair;
use crown_masternode::{Network, QuorumConfig};
use crown_shared_types::{NodeKind, OutPoint};
use serde::{Deserialize, Serialize};

pub const APP_NAME: &str = "crown-node";
pub const CONFIG_NAME: &str = "node-config";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub network: String,
    pub log_level: String,
    pub log_file: Option<String>,
    pub maintenance_interval_secs: u64,
    /// Hex ed25519 key replacing the network's spork key.
    pub spork_pubkey: Option<String>,
    /// Hex spork private key; lets this node sign sporks.
    pub spork_key: Option<String>,
    /// "masternode" or "systemnode"; only used with `operator_key`.
    pub node_kind: String,
    /// Hex operator secret key of the node this process runs.
    pub operator_key: Option<String>,
    /// Extra reference nodes as `<txid>-<vout>=<weight>`.
    pub reference_nodes: Vec<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            network: "mainnet".to_string(),
            log_level: "info".to_string(),
            log_file: None,
            maintenance_interval_secs: 1,
            spork_pubkey: None,
            spork_key: None,
            node_kind: "masternode".to_string(),
            operator_key: None,
            reference_nodes: Vec::new(),
        }
    }
}

impl NodeConfig {
    /// Loads the config from `path`, or from the platform config dir when `None`.
    pub fn load(path: Option<&Path>) -> Result<Self, confy::ConfyError> {
        match path {
            Some(path) => confy::load_path(path),
            None => confy::load(APP_NAME, CONFIG_NAME),
        }
    }

    pub fn store(&self, path: Option<&Path>) -> Result<(), confy::ConfyError> {
        match path {
            Some(path) => confy::store_path(path, self),
            None => confy::store(APP_NAME, CONFIG_NAME, self),
        }
    }

    pub fn quorum_config(&self) -> Result<QuorumConfig> {
        let network: Network = self.network.parse()?;
        let spork_pubkey = self
            .spork_pubkey
            .as_deref()
            .map(|hex| parse_public_key_hex(hex).map(|key| key.to_bytes()))
            .transpose()
            .context("spork pubkey")?;
        let mut reference_overrides = HashMap::new();
        for entry in &self.reference_nodes {
            let (outpoint, weight) = parse_reference(entry)?;
            reference_overrides.insert(outpoint, weight);
        }
        Ok(QuorumConfig { network, spork_pubkey, reference_overrides })
    }

    pub fn node_kind(&self) -> Result<NodeKind> {
        NodeKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.name() == self.node_kind.to_ascii_lowercase())
            .ok_or_else(|| anyhow!("unknown node kind {}", self.node_kind))
    }

    pub fn operator_keypair(&self) -> Result<Option<NodeKeyPair>> {
        self.operator_key
            .as_deref()
            .map(NodeKeyPair::from_secret_hex)
            .transpose()
            .context("operator key")
    }

    pub fn spork_keypair(&self) -> Result<Option<NodeKeyPair>> {
        self.spork_key.as_deref().map(NodeKeyPair::from_secret_hex).transpose().context("spork key")
    }
}

fn parse_reference(entry: &str) -> Result<(OutPoint, u32)> {
    let (outpoint, weight) = entry
        .split_once('=')
        .ok_or_else(|| anyhow!("reference node {} is not <outpoint>=<weight>", entry))?;
    let outpoint: OutPoint = outpoint.parse().with_context(|| format!("reference node {}", entry))?;
    let weight: u32 = weight.parse().with_context(|| format!("reference weight {}", entry))?;
    Ok((outpoint, weight))
}
