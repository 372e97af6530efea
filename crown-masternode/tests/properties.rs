use std::collections::{HashMap, HashSet};

use crown_crypto::hash::script_for_pubkey;
use crown_crypto::NodeKeyPair;
use crown_masternode::announce::{create_broadcast, process_broadcast, AnnounceEnv};
use crown_masternode::constants::PROTOCOL_VERSION;
use crown_masternode::node::next_state;
use crown_masternode::score::{rank_nodes, ScoredNode};
use crown_masternode::{
    ChainState, ClassParams, Coin, MemoryChain, MemoryNetwork, NetworkParams, NodeRegistry, NodeState,
    PaymentVotingEngine,
};
use crown_shared_types::{NodeBroadcast, NodeKind, OutPoint};
use primitive_types::U256;
use proptest::prelude::*;

fn chain_with(ids: &HashSet<u8>) -> (MemoryChain, Vec<OutPoint>) {
    let chain = MemoryChain::with_blocks(120, 0, 60);
    let outpoints: Vec<OutPoint> = ids.iter().map(|id| OutPoint::new([*id; 32], u32::from(*id % 3))).collect();
    for outpoint in &outpoints {
        chain.add_coin(*outpoint, Coin { value: 1, script_pubkey: vec![], height: 5 });
    }
    (chain, outpoints)
}

const ANNOUNCE_TIP: u64 = 120;

struct Announcer {
    chain: MemoryChain,
    collateral: NodeKeyPair,
    operator: NodeKeyPair,
    outpoint: OutPoint,
}

impl Announcer {
    fn new() -> Self {
        let chain = MemoryChain::with_blocks(ANNOUNCE_TIP, 0, 60);
        let collateral = NodeKeyPair::from_secret_bytes(&[0x21; 32]).unwrap();
        let outpoint = OutPoint::new([0x22; 32], 0);
        chain.add_coin(
            outpoint,
            Coin {
                value: ClassParams::masternode().collateral,
                script_pubkey: script_for_pubkey(&collateral.public_key_bytes()),
                height: 1,
            },
        );
        Announcer { chain, collateral, operator: NodeKeyPair::from_secret_bytes(&[0x23; 32]).unwrap(), outpoint }
    }

    fn now(&self) -> i64 {
        ANNOUNCE_TIP as i64 * 60
    }

    fn broadcast(&self, sig_time: i64, host: u8) -> NodeBroadcast {
        create_broadcast(
            &self.collateral,
            &self.operator,
            self.outpoint,
            format!("203.0.113.{}:18444", host).parse().unwrap(),
            PROTOCOL_VERSION,
            self.chain.block_hash_at(ANNOUNCE_TIP).unwrap(),
            sig_time,
        )
    }

    fn apply(&self, broadcasts: &[&NodeBroadcast]) -> NodeRegistry {
        let params = NetworkParams::regtest();
        let network = MemoryNetwork::default();
        let env = AnnounceEnv { chain: &self.chain, network: &network, params: &params, now: self.now(), min_proto: 70057 };
        let mut registry = NodeRegistry::new(ClassParams::masternode());
        for broadcast in broadcasts {
            assert!(process_broadcast(&mut registry, None, broadcast, &env).is_ok());
        }
        registry
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_latest_broadcast_wins(
        older_age in 1i64..3_000,
        step in 1i64..3_000,
        hosts in (1u8..=254, 1u8..=254),
    ) {
        let announcer = Announcer::new();
        let newer_age = (older_age - step).max(0);
        let first = announcer.broadcast(announcer.now() - older_age, hosts.0);
        let second = announcer.broadcast(announcer.now() - newer_age, hosts.1);

        let both = announcer.apply(&[&first, &second]);
        let latest = announcer.apply(&[&second]);
        prop_assert!(latest.find(&announcer.outpoint).is_some());
        prop_assert_eq!(both.find(&announcer.outpoint), latest.find(&announcer.outpoint));
    }
}

proptest! {
    #[test]
    fn test_ranking_ignores_candidate_order(
        ids in proptest::collection::hash_set(1u8..=250, 1..24),
        height in 20u64..=121,
    ) {
        let (chain, outpoints) = chain_with(&ids);
        let forward = rank_nodes(&chain, outpoints.clone(), 15, height);
        let backward = rank_nodes(&chain, outpoints.iter().rev().copied(), 15, height);
        prop_assert_eq!(&forward, &backward);
        prop_assert_eq!(forward.len(), outpoints.len());
        prop_assert!(forward.windows(2).all(|pair| pair[0].score >= pair[1].score));
    }

    #[test]
    fn test_one_vote_per_voter_per_height(votes in proptest::collection::vec((0u8..4, 0u64..6), 0..64)) {
        let mut engine = PaymentVotingEngine::new(ClassParams::masternode());
        let mut model: HashMap<u8, u64> = HashMap::new();
        for (voter, height) in votes {
            let outpoint = OutPoint::new([voter; 32], 0);
            let expected = model.get(&voter) != Some(&height);
            prop_assert_eq!(engine.can_vote(&outpoint, height), expected);
            model.insert(voter, height);
        }
    }

    #[test]
    fn test_equal_scores_order_by_outpoint(a in any::<[u8; 32]>(), b in any::<[u8; 32]>(), score in any::<u64>()) {
        let first = ScoredNode { outpoint: OutPoint::new(a, 0), score: U256::from(score) };
        let second = ScoredNode { outpoint: OutPoint::new(b, 0), score: U256::from(score) };
        prop_assert_eq!(first.cmp(&second), first.outpoint.cmp(&second.outpoint));
        prop_assert_eq!(first.cmp(&second), second.cmp(&first).reverse());
    }

    #[test]
    fn test_enabled_means_recent_ping_and_good_collateral(
        ping_age in proptest::option::of(0i64..10_000),
        collateral_ok in any::<bool>(),
        spent in any::<bool>(),
    ) {
        let params = ClassParams::systemnode();
        let now = 1_000_000;
        let current = if spent { NodeState::VinSpent } else { NodeState::Enabled };
        let state = next_state(current, ping_age.map(|age| now - age), now, collateral_ok, &params);
        if spent {
            prop_assert_eq!(state, NodeState::VinSpent);
        } else if state == NodeState::Enabled {
            prop_assert!(collateral_ok);
            prop_assert!(ping_age.map_or(false, |age| age < params.expiration_seconds));
        } else if ping_age.map_or(true, |age| age >= params.removal_seconds) {
            prop_assert_eq!(state, NodeState::Remove);
        }
    }
}
