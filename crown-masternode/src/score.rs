//! Deterministic, hash-based ranking of registered nodes for a block height.
//!
//! A node's score for height `h` is `blake3(outpoint || confirmation block hash || hash seen at h)`
//! read as a big-endian 256-bit integer. Ranking sorts by score, highest first. Equal scores are
//! ordered by ascending outpoint so every implementation agrees on the order even on a collision.

use std::cmp::Ordering;

use crown_shared_types::{Hash, OutPoint};
use primitive_types::U256;

use crate::chain::ChainState;
use crate::error::QuorumError;

/// The hash a voter for block `height` can already see: the parent of `height`.
///
/// Defined up to `tip + 1`, which resolves to the tip itself.
pub fn block_hash_for_height(chain: &dyn ChainState, height: u64) -> Result<Hash, QuorumError> {
    let tip = chain
        .tip_height()
        .ok_or_else(|| QuorumError::NotFound("chain has no tip".to_string()))?;
    if height > tip + 1 {
        return Err(QuorumError::NotFound(format!("height {} is beyond tip {} + 1", height, tip)));
    }
    chain
        .block_hash_at(height.saturating_sub(1))
        .ok_or_else(|| QuorumError::NotFound(format!("no block at height {}", height.saturating_sub(1))))
}

/// Hash of the block at which the collateral reached `min_confirmations`.
pub fn confirmation_block_hash(
    chain: &dyn ChainState,
    outpoint: &OutPoint,
    min_confirmations: u64,
) -> Result<Hash, QuorumError> {
    let coin = chain
        .coin(outpoint)
        .ok_or_else(|| QuorumError::NotFound(format!("collateral {} not in the UTXO set", outpoint)))?;
    let confirmation_height = coin.height + min_confirmations.saturating_sub(1);
    chain.block_hash_at(confirmation_height).ok_or_else(|| {
        QuorumError::NotFound(format!(
            "collateral {} not yet confirmed at height {}",
            outpoint, confirmation_height
        ))
    })
}

pub fn calculate_score(
    chain: &dyn ChainState,
    outpoint: &OutPoint,
    min_confirmations: u64,
    target_height: u64,
) -> Result<U256, QuorumError> {
    let confirmation_hash = confirmation_block_hash(chain, outpoint, min_confirmations)?;
    let target_hash = block_hash_for_height(chain, target_height)?;

    let mut hasher = blake3::Hasher::new();
    hasher.update(&outpoint.txid);
    hasher.update(&outpoint.vout.to_le_bytes());
    hasher.update(&confirmation_hash);
    hasher.update(&target_hash);
    Ok(U256::from_big_endian(hasher.finalize().as_bytes()))
}

/// A node with its score for one height.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoredNode {
    pub outpoint: OutPoint,
    pub score: U256,
}

impl Ord for ScoredNode {
    /// `Less` means "ranks ahead of".
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .score
            .cmp(&self.score)
            .then_with(|| self.outpoint.cmp(&other.outpoint))
    }
}

impl PartialOrd for ScoredNode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Scores every candidate for `target_height` and returns them best first.
///
/// Candidates whose score cannot be computed are left out rather than ranked last.
pub fn rank_nodes<I>(
    chain: &dyn ChainState,
    candidates: I,
    min_confirmations: u64,
    target_height: u64,
) -> Vec<ScoredNode>
where
    I: IntoIterator<Item = OutPoint>,
{
    let mut scored: Vec<ScoredNode> = candidates
        .into_iter()
        .filter_map(|outpoint| {
            calculate_score(chain, &outpoint, min_confirmations, target_height)
                .ok()
                .map(|score| ScoredNode { outpoint, score })
        })
        .collect();
    scored.sort();
    scored
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Coin;
    use crate::memory::MemoryChain;

    fn chain_with_coins(count: u8) -> (MemoryChain, Vec<OutPoint>) {
        let chain = MemoryChain::with_blocks(100, 0, 60);
        let outpoints: Vec<OutPoint> = (1..=count).map(|i| OutPoint::new([i; 32], 0)).collect();
        for outpoint in &outpoints {
            chain.add_coin(*outpoint, Coin { value: 1, script_pubkey: vec![], height: 10 });
        }
        (chain, outpoints)
    }

    #[test]
    fn test_target_hash_allows_tip_plus_one_only() {
        let chain = MemoryChain::with_blocks(100, 0, 60);
        assert_eq!(block_hash_for_height(&chain, 101).unwrap(), chain.block_hash_at(100).unwrap());
        assert!(matches!(block_hash_for_height(&chain, 102), Err(QuorumError::NotFound(_))));
    }

    #[test]
    fn test_score_depends_on_target_height() {
        let (chain, outpoints) = chain_with_coins(1);
        let a = calculate_score(&chain, &outpoints[0], 15, 50).unwrap();
        let b = calculate_score(&chain, &outpoints[0], 15, 51).unwrap();
        assert_ne!(a, b);
        assert_eq!(a, calculate_score(&chain, &outpoints[0], 15, 50).unwrap());
    }

    #[test]
    fn test_unconfirmed_collateral_has_no_score() {
        let (chain, outpoints) = chain_with_coins(1);
        // Coin at height 10 needs block 10 + 200 - 1 for 200 confirmations.
        assert!(calculate_score(&chain, &outpoints[0], 200, 50).is_err());
        assert!(calculate_score(&chain, &OutPoint::new([99u8; 32], 0), 15, 50).is_err());
    }

    #[test]
    fn test_rank_excludes_failures_and_sorts_descending() {
        let (chain, mut outpoints) = chain_with_coins(5);
        outpoints.push(OutPoint::new([77u8; 32], 3));
        let ranked = rank_nodes(&chain, outpoints.clone(), 15, 60);
        assert_eq!(ranked.len(), 5);
        assert!(ranked.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn test_equal_scores_break_by_outpoint() {
        let low = ScoredNode { outpoint: OutPoint::new([1u8; 32], 0), score: U256::from(5u64) };
        let high = ScoredNode { outpoint: OutPoint::new([2u8; 32], 0), score: U256::from(5u64) };
        let mut nodes = vec![high, low];
        nodes.sort();
        assert_eq!(nodes[0].outpoint, low.outpoint);
    }
}
