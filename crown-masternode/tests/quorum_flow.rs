//! End-to-end flows through `QuorumContext` with in-memory collaborators.

mod common;

use common::{node_at, peer, Harness, TestNode, TIP};
use crown_crypto::NodeKeyPair;
use crown_masternode::announce::create_ping;
use crown_masternode::constants::{COIN, IX_LOCK_EXPIRATION_SECONDS, OWN_VOTE_OFFSET, PAYMENT_RANK_OFFSET};
use crown_masternode::instantsend::create_lock_vote;
use crown_masternode::payments::create_winner;
use crown_masternode::{Accepted, ActiveStatus, ChainState, Coin, Mempool, Network, RejectKind, SporkId};
use crown_shared_types::{
    Inventory, InventoryType, NodeKind, OutPoint, QuorumMessage, SyncItem, Transaction, TxInput, TxOutput,
};

#[test]
fn test_payment_quorum_decides_the_payee() {
    let h = Harness::regtest();
    h.finish_sync();
    let nodes = h.announce_nodes(NodeKind::Masternode, 12);
    assert_eq!(h.ctx.enabled_count(NodeKind::Masternode), 12);

    let target = TIP + 5;
    let ranked = h.ctx.ranked_nodes(NodeKind::Masternode, target - PAYMENT_RANK_OFFSET);
    assert_eq!(ranked.len(), 12);
    let payee = nodes[0].payee();

    for (rank, voter) in ranked.iter().take(10).enumerate() {
        let node = node_at(&nodes, voter);
        let winner = create_winner(&node.operator(), *voter, target, payee.clone());
        let expected = if rank == 5 { Accepted::QuorumReached } else { Accepted::Added };
        assert_eq!(h.ctx.process_message(&peer(2), QuorumMessage::Winner(NodeKind::Masternode, winner)), Ok(expected));
    }
    assert_eq!(h.ctx.block_payee(NodeKind::Masternode, target), Some(payee.clone()));

    // The same vote again is a duplicate.
    let first = node_at(&nodes, &ranked[0]);
    let repeat = create_winner(&first.operator(), ranked[0], target, payee.clone());
    assert!(matches!(
        h.ctx.process_message(&peer(2), QuorumMessage::Winner(NodeKind::Masternode, repeat)),
        Err(RejectKind::Stale(_))
    ));

    // Ranks 11 and 12 are outside the quorum but close enough not to be punished.
    for voter in &ranked[10..] {
        let node = node_at(&nodes, voter);
        let winner = create_winner(&node.operator(), *voter, target, payee.clone());
        assert!(matches!(
            h.ctx.process_message(&peer(2), QuorumMessage::Winner(NodeKind::Masternode, winner)),
            Err(RejectKind::Ignored(_))
        ));
    }
    assert_eq!(h.network.misbehaviour(2), 0);

    let value = 10 * COIN;
    let block_time = h.chain.block_time_at(TIP).unwrap() + 60;
    let mut coinbase = Transaction::coinbase(target, vec![TxOutput::new(value, vec![0x51])]);
    assert!(h.ctx.is_block_payee_valid(&coinbase, target, value, block_time, block_time - 60));

    h.ctx.set_spork_signer(h.spork_key()).unwrap();
    h.ctx.update_spork(SporkId::MasternodePaymentEnforcement, h.now() - 1).unwrap();
    assert!(h.ctx.is_spork_active(SporkId::MasternodePaymentEnforcement));
    assert!(!h.ctx.is_block_payee_valid(&coinbase, target, value, block_time, block_time - 60));
    // A long stall lets the block through anyway.
    assert!(h.ctx.is_block_payee_valid(&coinbase, target, value, block_time + 7_200, block_time - 60));

    assert_eq!(h.ctx.fill_block_payee(NodeKind::Masternode, &mut coinbase, target, value), Some(payee.clone()));
    let outputs = coinbase.get_outputs();
    assert_eq!(outputs[1].script_pubkey, payee);
    assert_eq!(outputs[1].value, value * 45 / 100);
    assert_eq!(outputs[0].value, value - value * 45 / 100);
    assert!(h.ctx.is_block_payee_valid(&coinbase, target, value, block_time, block_time - 60));
}

#[test]
fn test_vote_from_unknown_node_asks_for_it() {
    let h = Harness::regtest();
    let stranger = OutPoint::new([0xEE; 32], 4);
    let winner = create_winner(&NodeKeyPair::generate(), stranger, TIP + 1, vec![0x51]);
    assert_eq!(
        h.ctx.process_message(&peer(3), QuorumMessage::Winner(NodeKind::Masternode, winner)),
        Err(RejectKind::UnknownSigner(stranger))
    );
    assert_eq!(
        h.network.pushed_to(3),
        vec![QuorumMessage::ListRequest(NodeKind::Masternode, Some(stranger))]
    );
    assert_eq!(h.network.misbehaviour(3), 0);
}

#[test]
fn test_instantsend_lock_and_conflict_reprocess() {
    let h = Harness::regtest();
    let nodes = h.announce_nodes(NodeKind::Masternode, 12);

    let spent = OutPoint::new([0x77; 32], 0);
    h.chain.add_coin(spent, Coin { value: 5 * COIN, script_pubkey: vec![], height: TIP - 20 });
    // 21 confirmations put the lock at tip + 4 - 21.
    let lock_height = TIP + 4 - 21;

    let tx1 = Transaction::standard(vec![TxInput::new(spent)], vec![TxOutput::new(5 * COIN, vec![0x01])]);
    let tx2 = Transaction::standard(vec![TxInput::new(spent)], vec![TxOutput::new(4 * COIN, vec![0x02])]);
    let (txid1, txid2) = (tx1.txid(), tx2.txid());

    assert_eq!(h.ctx.process_message(&peer(4), QuorumMessage::LockRequest(tx1)), Ok(Accepted::Added));
    assert!(h.mempool.contains(&txid1));
    assert!(h.ctx.already_have(&Inventory::new(InventoryType::TxLockRequest, txid1)));

    let quorum: Vec<OutPoint> = h.ctx.ranked_nodes(NodeKind::Masternode, lock_height).into_iter().take(6).collect();
    for (i, voter) in quorum.iter().enumerate() {
        let vote = create_lock_vote(&node_at(&nodes, voter).operator(), *voter, txid1, lock_height);
        let expected = if i == 5 { Accepted::QuorumReached } else { Accepted::Added };
        assert_eq!(h.ctx.process_message(&peer(4), QuorumMessage::LockVote(vote)), Ok(expected));
    }
    assert_eq!(h.ctx.lock_signatures(&txid1), Some(6));
    assert!(h.ctx.is_input_locked(&spent));

    // The double spend is refused by the mempool but still collects votes.
    assert_eq!(h.ctx.process_message(&peer(5), QuorumMessage::LockRequest(tx2)), Ok(Accepted::Served));
    assert!(!h.mempool.contains(&txid2));
    let mut last = None;
    for voter in &quorum {
        let vote = create_lock_vote(&node_at(&nodes, voter).operator(), *voter, txid2, lock_height);
        last = Some(h.ctx.process_message(&peer(5), QuorumMessage::LockVote(vote)));
    }
    assert_eq!(last, Some(Err(RejectKind::Conflict(txid2, txid1))));
    assert!(!h.ctx.is_input_locked(&spent));
    // Both sides of the conflict are evicted from the mempool.
    assert!(!h.mempool.contains(&txid1));
    assert!(h.mempool.is_empty());
    assert_eq!(h.chain.disconnects(), 15);
    assert_eq!(h.chain.activations(), 1);
    assert_eq!(h.chain.tip_height(), Some(TIP));
    assert_eq!(h.network.misbehaviour(5), 0);
}

#[test]
fn test_expired_rejected_request_unlocks_its_inputs() {
    let h = Harness::regtest();
    let spent = OutPoint::new([0x79; 32], 0);
    h.chain.add_coin(spent, Coin { value: 5 * COIN, script_pubkey: vec![], height: TIP - 20 });

    let pooled = Transaction::standard(vec![TxInput::new(spent)], vec![TxOutput::new(5 * COIN, vec![0x03])]);
    h.mempool.accept(&pooled).unwrap();
    let request = Transaction::standard(vec![TxInput::new(spent)], vec![TxOutput::new(4 * COIN, vec![0x04])]);
    assert_eq!(h.ctx.process_message(&peer(4), QuorumMessage::LockRequest(request)), Ok(Accepted::Served));
    assert!(h.ctx.is_input_locked(&spent));

    h.clock.advance(IX_LOCK_EXPIRATION_SECONDS + 1);
    let report = h.ctx.maintenance();
    assert_eq!(report.removed_locks, 1);
    assert!(!h.ctx.is_input_locked(&spent));
    assert!(h.mempool.contains(&pooled.txid()));
}

#[test]
fn test_young_inputs_cannot_be_locked() {
    let h = Harness::regtest();
    let fresh = OutPoint::new([0x78; 32], 0);
    h.chain.add_coin(fresh, Coin { value: COIN, script_pubkey: vec![], height: TIP - 2 });
    let tx = Transaction::standard(vec![TxInput::new(fresh)], vec![TxOutput::new(COIN, vec![0x01])]);
    assert!(matches!(
        h.ctx.process_message(&peer(4), QuorumMessage::LockRequest(tx)),
        Err(RejectKind::Ignored(_))
    ));
}

#[test]
fn test_sporks_travel_between_nodes_and_trigger_actions() {
    let signer = Harness::regtest();
    let follower = Harness::regtest();
    signer.ctx.set_spork_signer(signer.spork_key()).unwrap();

    let reset = signer.ctx.update_spork(SporkId::ResetBudget, 1).unwrap();
    let reconsider = signer.ctx.update_spork(SporkId::ReconsiderBlocks, 3).unwrap();
    assert_eq!(signer.budget.clears(), 0);

    assert_eq!(follower.ctx.process_message(&peer(6), QuorumMessage::Spork(reset.clone())), Ok(Accepted::Updated));
    assert_eq!(follower.budget.clears(), 1);
    assert_eq!(follower.ctx.process_message(&peer(6), QuorumMessage::Spork(reconsider)), Ok(Accepted::Updated));
    assert_eq!(follower.chain.disconnects(), 3);
    assert_eq!(follower.ctx.spork_value(SporkId::ReconsiderBlocks), 3);

    // Replays are stale and do not run the action again.
    assert!(matches!(
        follower.ctx.process_message(&peer(6), QuorumMessage::Spork(reset)),
        Err(RejectKind::Stale(_))
    ));
    assert_eq!(follower.budget.clears(), 1);
}

#[test]
fn test_active_node_starts_pings_and_votes() {
    let h = Harness::regtest();
    h.finish_sync();
    let nodes = h.announce_nodes(NodeKind::Masternode, 12);

    let target = TIP + OWN_VOTE_OFFSET;
    let top = h.ctx.ranked_nodes(NodeKind::Masternode, target - PAYMENT_RANK_OFFSET)[0];
    h.ctx.set_active_node(NodeKind::Masternode, node_at(&nodes, &top).operator());

    let report = h.ctx.maintenance();
    assert!(report.pinged);
    assert_eq!(h.ctx.active_status(), Some(ActiveStatus::Started));

    let cast = h.ctx.new_tip(TIP);
    assert_eq!(cast.len(), 1);
    assert_eq!(cast[0].voter, top);
    assert_eq!(cast[0].block_height, target);
    assert_eq!(h.ctx.block_payee(NodeKind::Masternode, target), Some(cast[0].payee.clone()));
    assert!(h.ctx.already_have(&Inventory::new(InventoryType::MasternodeWinner, cast[0].hash())));

    // One vote per height.
    assert!(h.ctx.new_tip(TIP).is_empty());
}

#[test]
fn test_repeated_winner_request_on_mainnet_is_punished() {
    let h = Harness::new(Network::Mainnet);
    h.finish_sync();
    let requester = peer(8);
    assert_eq!(
        h.ctx.process_message(&requester, QuorumMessage::GetWinners(NodeKind::Masternode, 10)),
        Ok(Accepted::Served)
    );
    assert_eq!(
        h.network.pushed_to(8).last(),
        Some(&QuorumMessage::SyncStatusCount(NodeKind::Masternode, SyncItem::Winners, 0))
    );
    let again = h.ctx.process_message(&requester, QuorumMessage::GetWinners(NodeKind::Masternode, 10));
    assert!(matches!(again, Err(RejectKind::Malformed { dos: 20, .. })));
    assert_eq!(h.network.misbehaviour(8), 20);
}

#[test]
fn test_ping_refreshes_entry_and_bad_ping_is_punished() {
    let h = Harness::regtest();
    let node = TestNode::new(NodeKind::Masternode, 0);
    assert_eq!(h.announce(&node), Ok(Accepted::Added));

    let recent_block = h.chain.block_hash_at(TIP - 12).unwrap();
    let ping = create_ping(&node.operator(), node.outpoint, recent_block, h.now());
    assert_eq!(h.ctx.process_message(&peer(9), QuorumMessage::Ping(NodeKind::Masternode, ping.clone())), Ok(Accepted::Updated));
    let inventory = Inventory::new(InventoryType::MasternodePing, ping.hash());
    assert!(h.network.relayed().contains(&inventory));
    assert!(h.ctx.get_data(&peer(9), &inventory));
    assert_eq!(h.network.pushed_to(9), vec![QuorumMessage::Ping(NodeKind::Masternode, ping.clone())]);

    // Seen pings are dropped before any checks.
    assert!(matches!(
        h.ctx.process_message(&peer(9), QuorumMessage::Ping(NodeKind::Masternode, ping)),
        Err(RejectKind::Stale(_))
    ));

    h.clock.advance(600);
    let forged = create_ping(&NodeKeyPair::generate(), node.outpoint, recent_block, h.now());
    let result = h.ctx.process_message(&peer(9), QuorumMessage::Ping(NodeKind::Masternode, forged));
    assert!(matches!(result, Err(RejectKind::SignatureInvalid { dos: 33, .. })));
    assert_eq!(h.network.misbehaviour(9), 33);
    assert_eq!(
        h.network.pushed_to(9).last(),
        Some(&QuorumMessage::ListRequest(NodeKind::Masternode, Some(node.outpoint)))
    );
}

#[test]
fn test_systemnode_may_not_reuse_masternode_address() {
    let h = Harness::regtest();
    let masternode = TestNode::new(NodeKind::Masternode, 0);
    assert_eq!(h.announce(&masternode), Ok(Accepted::Added));

    let mut systemnode = TestNode::new(NodeKind::Systemnode, 0);
    systemnode.addr = "10.0.0.1:18445".parse().unwrap();
    assert!(matches!(h.announce(&systemnode), Err(RejectKind::Ignored(_))));

    let systemnode = TestNode::new(NodeKind::Systemnode, 1);
    assert_eq!(h.announce(&systemnode), Ok(Accepted::Added));
    assert_eq!(h.ctx.node_count(NodeKind::Systemnode), 1);
    assert_eq!(h.ctx.node_count(NodeKind::Masternode), 1);
}

#[test]
fn test_wrong_collateral_amount_is_not_added() {
    let h = Harness::regtest();
    let node = TestNode::new(NodeKind::Systemnode, 3);
    h.chain.add_coin(
        node.outpoint,
        Coin { value: node.collateral_value() + 1, script_pubkey: node.payee(), height: common::COLLATERAL_HEIGHT },
    );
    let broadcast = h.broadcast_for(&node);
    let result = h.ctx.process_message(&peer(1), QuorumMessage::Broadcast(NodeKind::Systemnode, broadcast.clone()));
    assert!(matches!(result, Err(RejectKind::Ignored(_))));
    assert_eq!(h.ctx.node_count(NodeKind::Systemnode), 0);
    // Seen broadcasts are not re-validated.
    assert!(matches!(
        h.ctx.process_message(&peer(1), QuorumMessage::Broadcast(NodeKind::Systemnode, broadcast)),
        Err(RejectKind::Stale(_))
    ));
}
