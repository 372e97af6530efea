use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use crown_masternode::{
    Collaborators, MemoryBudget, MemoryChain, MemoryMempool, MemoryNetwork, QuorumContext, SystemClock,
};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod maintenance;

use config::NodeConfig;

/// Crown quorum node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Network to run on (mainnet, testnet, regtest)
    #[arg(long)]
    network: Option<String>,

    /// Set logging level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Path to the log file (optional). If not provided, logs will only go to stdout.
    #[arg(long)]
    log_file: Option<String>,

    /// Seconds between maintenance passes
    #[arg(long)]
    interval: Option<u64>,

    /// Config file to use instead of the platform default
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Spork public key (hex) replacing the network default
    #[arg(long)]
    spork_pubkey: Option<String>,

    /// Operator secret key (hex) of the node this process runs
    #[arg(long)]
    operator_key: Option<String>,

    /// Node class of the operator key (masternode, systemnode)
    #[arg(long)]
    node_kind: Option<String>,

    /// Extra reference nodes as <txid>-<vout>=<weight>
    #[arg(long, value_delimiter = ',')]
    reference_nodes: Option<Vec<String>>,
}

impl Args {
    fn apply(self, cfg: &mut NodeConfig) {
        if let Some(network) = self.network {
            cfg.network = network;
        }
        if let Some(log_level) = self.log_level {
            cfg.log_level = log_level;
        }
        if self.log_file.is_some() {
            cfg.log_file = self.log_file;
        }
        if let Some(interval) = self.interval {
            cfg.maintenance_interval_secs = interval;
        }
        if self.spork_pubkey.is_some() {
            cfg.spork_pubkey = self.spork_pubkey;
        }
        if self.operator_key.is_some() {
            cfg.operator_key = self.operator_key;
        }
        if let Some(node_kind) = self.node_kind {
            cfg.node_kind = node_kind;
        }
        if let Some(reference_nodes) = self.reference_nodes {
            cfg.reference_nodes = reference_nodes;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config_path = args.config.clone();

    let mut cfg = match NodeConfig::load(config_path.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration: {:?}. Using default.", e);
            NodeConfig::default()
        }
    };
    args.apply(&mut cfg);

    let filter = EnvFilter::try_new(&cfg.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let _log_guard = match &cfg.log_file {
        Some(path) => {
            let file = File::create(path).with_context(|| format!("creating log file {}", path))?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            builder
                .with_writer(writer)
                .try_init()
                .map_err(|e| anyhow::anyhow!("installing subscriber: {}", e))?;
            Some(guard)
        }
        None => {
            builder.try_init().map_err(|e| anyhow::anyhow!("installing subscriber: {}", e))?;
            None
        }
    };

    info!("Loaded configuration: {:#?}", cfg);
    let quorum_config = cfg.quorum_config()?;
    let kind = cfg.node_kind()?;

    // In-memory collaborators until the chain and connection manager are wired in.
    let chain = Arc::new(MemoryChain::with_blocks(0, 0, 60));
    let network = Arc::new(MemoryNetwork::default());
    let collaborators = Collaborators {
        chain: chain.clone(),
        mutator: chain,
        mempool: Arc::new(MemoryMempool::default()),
        network,
        budget: Arc::new(MemoryBudget::default()),
        clock: Arc::new(SystemClock),
    };
    let context = Arc::new(QuorumContext::new(&quorum_config, collaborators));

    if let Some(operator) = cfg.operator_keypair()? {
        context.set_active_node(kind, operator);
    }
    if let Some(spork_key) = cfg.spork_keypair()? {
        if let Err(e) = context.set_spork_signer(spork_key) {
            warn!("Ignoring spork key: {}", e);
        }
    }

    let (shutdown_sender, _) = broadcast::channel(1);
    let interval = Duration::from_secs(cfg.maintenance_interval_secs.max(1));
    let maintenance = maintenance::start_maintenance(context.clone(), interval, shutdown_sender.subscribe());

    info!("Quorum layer running on {}. Press Ctrl+C to shut down gracefully.", quorum_config.network);

    signal::ctrl_c().await.context("listening for ctrl-c")?;
    info!("Ctrl+C received, sending shutdown signal.");
    if shutdown_sender.send(()).is_err() {
        warn!("maintenance task already stopped");
    }
    if let Err(e) = maintenance.await {
        error!("maintenance task failed: {}", e);
    }
    if let Some(status) = context.active_status() {
        info!("Active node status at shutdown: {}", status);
    }

    match cfg.store(config_path.as_deref()) {
        Ok(()) => info!("Configuration updated and stored."),
        Err(e) => error!("Failed to store configuration: {:?}", e),
    }

    Ok(())
}
