//! Re-deriving the tip after quorum results change what the chain should have accepted.

use std::sync::Arc;

use log::{error, info, warn};

use crate::chain::ChainMutator;
use crate::constants::REPROCESS_SECONDS_PER_BLOCK;
use crate::error::QuorumError;

/// What one reprocess run did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReprocessReport {
    /// Blocks whose failure flag was cleared.
    pub reset: usize,
    pub disconnected: u64,
}

/// Clears recent block failures, rolls back `n` blocks and lets the chain pick its best tip again.
///
/// Callers must hold the chain guard for the duration of [`ReprocessingBridge::reprocess`].
pub struct ReprocessingBridge {
    mutator: Arc<dyn ChainMutator>,
}

impl ReprocessingBridge {
    pub fn new(mutator: Arc<dyn ChainMutator>) -> Self {
        ReprocessingBridge { mutator }
    }

    pub fn reprocess(&self, blocks: u64, now: i64) -> Result<ReprocessReport, QuorumError> {
        let since = reconsider_since(now, blocks);
        let reset = self.mutator.reset_failed_since(since);
        info!("reprocessing {} blocks, {} failed blocks reconsidered", blocks, reset);

        let mut report = ReprocessReport { reset, disconnected: 0 };
        let mut failure = None;
        for _ in 0..blocks {
            match self.mutator.disconnect_tip() {
                Ok(hash) => {
                    report.disconnected += 1;
                    info!("reprocess disconnected {}", hex::encode(hash));
                }
                Err(reason) => {
                    error!("reprocess stopped after {} blocks: {}", report.disconnected, reason);
                    self.mutator.resync_mempool();
                    failure = Some(reason);
                    break;
                }
            }
        }

        if let Err(reason) = self.mutator.activate_best_chain() {
            warn!("activating the best chain after reprocess failed: {}", reason);
            return Err(QuorumError::Reprocess(reason));
        }
        match failure {
            Some(reason) => Err(QuorumError::Reprocess(reason)),
            None => Ok(report),
        }
    }
}

/// Oldest failure time a rollback of `blocks` reconsiders. Saturates for absurd depths.
fn reconsider_since(now: i64, blocks: u64) -> i64 {
    let window = i64::try_from(blocks).unwrap_or(i64::MAX).saturating_mul(REPROCESS_SECONDS_PER_BLOCK);
    now.saturating_sub(window)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainState;
    use crate::memory::{BlockRecord, MemoryChain};

    #[test]
    fn test_reprocess_rolls_back_and_restores_tip() {
        let chain = Arc::new(MemoryChain::with_blocks(20, 0, 60));
        let bridge = ReprocessingBridge::new(chain.clone());
        let report = bridge.reprocess(5, 10_000).unwrap();
        assert_eq!(report.disconnected, 5);
        assert_eq!(chain.disconnects(), 5);
        assert_eq!(chain.activations(), 1);
        assert_eq!(chain.tip_height(), Some(20));
    }

    #[test]
    fn test_reprocess_reconsiders_recent_failures_only() {
        let chain = Arc::new(MemoryChain::with_blocks(10, 0, 60));
        chain.mark_failed(BlockRecord { hash: [1u8; 32], time: 0 }, 9_000);
        chain.mark_failed(BlockRecord { hash: [2u8; 32], time: 0 }, 1_000);
        let bridge = ReprocessingBridge::new(chain.clone());
        // 2 blocks look back 600 seconds from 9_500.
        let report = bridge.reprocess(2, 9_500).unwrap();
        assert_eq!(report.reset, 1);
        assert_eq!(chain.failed_count(), 1);
    }

    #[test]
    fn test_disconnect_failure_resyncs_mempool() {
        let chain = Arc::new(MemoryChain::with_blocks(10, 0, 60));
        chain.set_fail_disconnect(true);
        let bridge = ReprocessingBridge::new(chain.clone());
        assert!(matches!(bridge.reprocess(3, 1_000), Err(QuorumError::Reprocess(_))));
        assert_eq!(chain.mempool_resyncs(), 1);
        assert_eq!(chain.activations(), 1);
    }

    #[test]
    fn test_huge_depth_saturates_and_stops_at_genesis() {
        assert_eq!(reconsider_since(1_000, u64::MAX), 1_000 - i64::MAX);
        assert_eq!(reconsider_since(1_000, 2), 1_000 - 600);

        let chain = Arc::new(MemoryChain::with_blocks(10, 0, 60));
        chain.mark_failed(BlockRecord { hash: [3u8; 32], time: 0 }, 0);
        let bridge = ReprocessingBridge::new(chain.clone());
        assert!(matches!(bridge.reprocess(u64::MAX, 1_000), Err(QuorumError::Reprocess(_))));
        assert_eq!(chain.failed_count(), 0);
        assert_eq!(chain.disconnects(), 10);
        // The detached blocks come back along with the reconsidered one.
        assert_eq!(chain.tip_height(), Some(11));
    }
}
