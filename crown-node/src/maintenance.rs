use std::sync::Arc;
use std::time::Duration;

use crown_masternode::QuorumContext;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Runs `QuorumContext::maintenance` every `interval` until a shutdown signal arrives.
pub fn start_maintenance(
    context: Arc<QuorumContext>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<u64> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        let mut passes = 0u64;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = context.maintenance();
                    passes += 1;
                    debug!("maintenance pass {}: {:?}", passes, report);
                }
                _ = shutdown.recv() => {
                    info!("maintenance stopped after {} passes", passes);
                    break;
                }
            }
        }
        passes
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crown_masternode::{
        Collaborators, ManualClock, MemoryBudget, MemoryChain, MemoryMempool, MemoryNetwork, Network, QuorumConfig,
        SyncStage,
    };
    use crown_shared_types::NodeKind;

    #[tokio::test(start_paused = true)]
    async fn test_loop_drives_sync_until_shutdown() {
        let chain = Arc::new(MemoryChain::with_blocks(10, 0, 60));
        let clock = Arc::new(ManualClock::new(1_000));
        let collaborators = Collaborators {
            chain: chain.clone(),
            mutator: chain,
            mempool: Arc::new(MemoryMempool::default()),
            network: Arc::new(MemoryNetwork::default()),
            budget: Arc::new(MemoryBudget::default()),
            clock: clock.clone(),
        };
        let config = QuorumConfig { network: Network::Regtest, ..QuorumConfig::default() };
        let context = Arc::new(QuorumContext::new(&config, collaborators));

        let (sender, receiver) = broadcast::channel(1);
        let handle = start_maintenance(context.clone(), Duration::from_secs(1), receiver);
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(context.sync_stage(NodeKind::Masternode), SyncStage::Sporks);

        sender.send(()).unwrap();
        let passes = handle.await.unwrap();
        assert!(passes >= 1);
    }
}
