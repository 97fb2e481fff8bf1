//! Locator construction, inventory responses, GetData batching, and
//! level-set bundles, driven through the DAG manager's sync services with an
//! in-memory peer.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crossbeam_channel::Receiver;

use braid::block::{genesis_hash, Block};
use braid::config::ConsensusParams;
use braid::consensus::dag::DagManager;
use braid::consensus::vertex::{Milestone, VertexRecord};
use braid::network::{InvKind, Message};
use braid::peer::{Peer, PeerManager};
use braid::pow;
use braid::store::BlockStore;
use braid::Hash;

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

struct SyncNode {
    dag: DagManager,
    /// Milestone hashes in height order, genesis excluded.
    milestones: Vec<Hash>,
}

fn milestone_block_on(snapshot: &Arc<Milestone>, prev: Hash, time: u64) -> Arc<Block> {
    let mut block = Block::new(
        snapshot.ms_hash,
        prev,
        prev,
        time,
        pow::target_to_compact(snapshot.block_target),
    );
    block.solve_to(&snapshot.milestone_target);
    Arc::new(block)
}

/// A node whose best chain carries `count` self-sealing milestones.
fn sync_node(count: usize) -> SyncNode {
    let store = Arc::new(BlockStore::open_temporary().unwrap());
    let peers = Arc::new(PeerManager::new());
    let dag = DagManager::new(store, peers, ConsensusParams::default()).unwrap();

    let t0 = unix_now();
    let mut prev = genesis_hash();
    let mut milestones = Vec::new();
    for i in 0..count {
        let head = dag.milestone_head();
        let ms = milestone_block_on(&head, prev, t0 + (i as u64 + 1) * 10);
        dag.add_new_block(Arc::clone(&ms), None);
        dag.wait();
        std::thread::sleep(Duration::from_millis(10));
        dag.wait();
        prev = ms.hash();
        milestones.push(ms.hash());
    }
    assert_eq!(dag.best_milestone_height(), count as u64);
    SyncNode { dag, milestones }
}

fn recv(rx: &Receiver<Message>) -> Message {
    rx.recv_timeout(Duration::from_secs(5)).expect("message")
}

#[test]
fn locator_walks_back_to_genesis() {
    let node = sync_node(3);
    let (peer, rx) = Peer::new([1u8; 32]);

    node.dag.request_inv(None, 10, Arc::clone(&peer));
    node.dag.wait();

    match recv(&rx) {
        Message::GetInv { locator, .. } => {
            assert_eq!(locator.len(), 4);
            assert_eq!(locator[0], node.milestones[2]);
            assert_eq!(locator[1], node.milestones[1]);
            assert_eq!(locator[2], node.milestones[0]);
            assert_eq!(locator[3], genesis_hash());
        }
        other => panic!("expected GetInv, got {other:?}"),
    }
    assert_eq!(peer.last_get_inv_end(), genesis_hash());
    assert_eq!(peer.get_inv_task_count(), 1);
}

#[test]
fn locator_length_is_capped() {
    let node = sync_node(5);
    let (peer, rx) = Peer::new([1u8; 32]);

    node.dag.request_inv(None, 2, Arc::clone(&peer));
    node.dag.wait();

    match recv(&rx) {
        Message::GetInv { locator, .. } => {
            assert_eq!(locator.len(), 2);
            assert_eq!(locator[0], node.milestones[4]);
            assert_eq!(locator[1], node.milestones[3]);
        }
        other => panic!("expected GetInv, got {other:?}"),
    }
}

#[test]
fn empty_locator_answers_empty_inv() {
    let node = sync_node(3);
    let (peer, rx) = Peer::new([1u8; 32]);

    node.dag.respond_request_inv(vec![], 7, Arc::clone(&peer));
    node.dag.wait();

    match recv(&rx) {
        Message::Inv { hashes, nonce } => {
            assert!(hashes.is_empty());
            assert_eq!(nonce, 7);
        }
        other => panic!("expected Inv, got {other:?}"),
    }
}

#[test]
fn genesis_only_intersection_signals_widening() {
    let node = sync_node(3);
    let (peer, rx) = Peer::new([1u8; 32]);

    node.dag
        .respond_request_inv(vec![[9u8; 32], genesis_hash()], 7, Arc::clone(&peer));
    node.dag.wait();

    match recv(&rx) {
        Message::Inv { hashes, .. } => assert_eq!(hashes, vec![genesis_hash()]),
        other => panic!("expected Inv, got {other:?}"),
    }
}

#[test]
fn bootstrapping_peer_is_served_from_genesis() {
    let node = sync_node(3);
    let (peer, rx) = Peer::new([1u8; 32]);

    // A fresh peer's locator is nothing but genesis.
    node.dag
        .respond_request_inv(vec![genesis_hash()], 7, Arc::clone(&peer));
    node.dag.wait();

    match recv(&rx) {
        Message::Inv { hashes, .. } => {
            assert_eq!(
                hashes,
                vec![node.milestones[0], node.milestones[1], node.milestones[2]]
            );
        }
        other => panic!("expected Inv, got {other:?}"),
    }
}

#[test]
fn peer_at_our_head_gets_empty_inv() {
    let node = sync_node(3);
    let (peer, rx) = Peer::new([1u8; 32]);

    node.dag
        .respond_request_inv(vec![node.milestones[2]], 7, Arc::clone(&peer));
    node.dag.wait();

    match recv(&rx) {
        Message::Inv { hashes, .. } => assert!(hashes.is_empty()),
        other => panic!("expected Inv, got {other:?}"),
    }
}

#[test]
fn inventory_continues_after_the_intersection() {
    let node = sync_node(3);
    let (peer, rx) = Peer::new([1u8; 32]);

    node.dag
        .respond_request_inv(vec![node.milestones[0]], 7, Arc::clone(&peer));
    node.dag.wait();

    match recv(&rx) {
        Message::Inv { hashes, .. } => {
            assert_eq!(hashes, vec![node.milestones[1], node.milestones[2]]);
        }
        other => panic!("expected Inv, got {other:?}"),
    }
    assert_eq!(peer.last_sent_inv_hash(), node.milestones[2]);
}

#[test]
fn inventory_skips_hashes_already_sent() {
    let node = sync_node(3);
    let (peer, rx) = Peer::new([1u8; 32]);
    peer.set_last_sent_inv_hash(node.milestones[1]);

    node.dag
        .respond_request_inv(vec![node.milestones[0]], 7, Arc::clone(&peer));
    node.dag.wait();

    match recv(&rx) {
        Message::Inv { hashes, .. } => assert_eq!(hashes, vec![node.milestones[2]]),
        other => panic!("expected Inv, got {other:?}"),
    }
}

#[test]
fn empty_inv_requests_the_pending_set() {
    let node = sync_node(1);
    let (peer, rx) = Peer::new([1u8; 32]);

    node.dag.callback_request_inv(vec![], 7, Arc::clone(&peer));
    node.dag.wait();

    match recv(&rx) {
        Message::GetData { kind, hashes, nonces } => {
            assert_eq!(kind, InvKind::PendingSet);
            assert!(hashes.is_empty());
            assert_eq!(nonces.len(), 1);
        }
        other => panic!("expected GetData, got {other:?}"),
    }
    assert_eq!(peer.get_data_task_count(), 1);
}

#[test]
fn genesis_inv_widens_the_locator() {
    let node = sync_node(3);
    let (peer, rx) = Peer::new([1u8; 32]);
    // Pretend our previous locator ended mid-chain with length 2.
    peer.set_last_get_inv_end(node.milestones[1]);
    peer.set_last_get_inv_length(2);

    node.dag
        .callback_request_inv(vec![genesis_hash()], 7, Arc::clone(&peer));
    node.dag.wait();

    match recv(&rx) {
        Message::GetInv { locator, .. } => {
            // Doubled length, starting from the previous end.
            assert_eq!(locator[0], node.milestones[1]);
            assert!(locator.len() <= 4);
        }
        other => panic!("expected GetInv, got {other:?}"),
    }
}

#[test]
fn repeated_genesis_inv_disconnects_the_peer() {
    let node = sync_node(1);
    let (peer, _rx) = Peer::new([1u8; 32]);
    peer.set_last_get_inv_end(genesis_hash());

    node.dag
        .callback_request_inv(vec![genesis_hash()], 7, Arc::clone(&peer));
    node.dag.wait();

    assert!(peer.is_disconnected());
}

#[test]
fn get_data_batches_and_deduplicates() {
    let node = sync_node(1);
    let (peer, rx) = Peer::new([1u8; 32]);

    let wanted: Vec<Hash> = (0u8..7).map(|i| [i + 100; 32]).collect();
    node.dag
        .callback_request_inv(wanted.clone(), 7, Arc::clone(&peer));
    node.dag.wait();

    // Default max_get_data_size is 5: two messages, 5 + 2.
    match recv(&rx) {
        Message::GetData { kind, hashes, nonces } => {
            assert_eq!(kind, InvKind::LevelSet);
            assert_eq!(hashes.len(), 5);
            assert_eq!(nonces.len(), 5);
        }
        other => panic!("expected GetData, got {other:?}"),
    }
    match recv(&rx) {
        Message::GetData { hashes, .. } => assert_eq!(hashes.len(), 2),
        other => panic!("expected GetData, got {other:?}"),
    }
    for h in &wanted {
        assert!(node.dag.is_downloading(h));
    }
    assert_eq!(peer.get_data_task_count(), 7);

    // Re-requesting the same inventory downloads nothing new.
    node.dag
        .callback_request_inv(wanted.clone(), 8, Arc::clone(&peer));
    node.dag.wait();
    assert!(rx.try_recv().is_err());
}

#[test]
fn level_set_bundle_puts_the_milestone_first() {
    let node = sync_node(3);
    let (peer, rx) = Peer::new([1u8; 32]);
    let target = node.milestones[1];

    node.dag
        .respond_request_lvs(vec![target], vec![7], Arc::clone(&peer));
    node.dag.wait();

    let payload = match recv(&rx) {
        Message::Bundle { nonce, payload } => {
            assert_eq!(nonce, 7);
            payload
        }
        other => panic!("expected Bundle, got {other:?}"),
    };
    assert_eq!(peer.last_sent_bundle_hash(), target);

    let records: Vec<VertexRecord> = bincode::deserialize(&payload).unwrap();
    assert_eq!(records[0].block.hash(), target);
    assert!(records[0].is_milestone);

    // Same multiset of blocks as the in-memory level set.
    let height = node.dag.get_height(&target).unwrap();
    let mut from_records: Vec<Hash> = records.iter().map(|r| r.block.hash()).collect();
    let mut from_chain: Vec<Hash> = node
        .dag
        .get_main_chain_level_set(height)
        .unwrap()
        .iter()
        .map(|b| b.hash())
        .collect();
    from_records.sort();
    from_chain.sort();
    assert_eq!(from_records, from_chain);
}

#[test]
fn unknown_level_set_answers_not_found() {
    let node = sync_node(1);
    let (peer, rx) = Peer::new([1u8; 32]);

    node.dag
        .respond_request_lvs(vec![[9u8; 32]], vec![7], Arc::clone(&peer));
    node.dag.wait();

    match recv(&rx) {
        Message::NotFound { hash, nonce } => {
            assert_eq!(hash, [9u8; 32]);
            assert_eq!(nonce, 7);
        }
        other => panic!("expected NotFound, got {other:?}"),
    }
}

#[test]
fn pending_set_bundle_carries_the_pending_blocks() {
    let node = sync_node(1);
    let head = node.dag.milestone_head();

    // One plain pending block on top of the head.
    let mut pending = Block::new(
        head.ms_hash,
        head.ms_hash,
        head.ms_hash,
        unix_now() + 100,
        pow::target_to_compact(head.block_target),
    );
    let target = pending.target();
    loop {
        let h = pending.hash();
        if pow::meets_target(&h, &target) && !pow::meets_target(&h, &head.milestone_target) {
            break;
        }
        pending.nonce += 1;
    }
    let pending = Arc::new(pending);
    node.dag.add_new_block(Arc::clone(&pending), None);
    node.dag.wait();

    let (peer, rx) = Peer::new([1u8; 32]);
    node.dag.respond_request_pending(7, Arc::clone(&peer));
    node.dag.wait();

    match recv(&rx) {
        Message::Bundle { payload, .. } => {
            let blocks: Vec<Block> = bincode::deserialize(&payload).unwrap();
            assert_eq!(blocks.len(), 1);
            assert_eq!(blocks[0].hash(), pending.hash());
        }
        other => panic!("expected Bundle, got {other:?}"),
    }
}
