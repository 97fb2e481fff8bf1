//! End-to-end DAG manager scenarios: admission, milestone promotion, fork
//! tracking, flush gating, and punctuality.
//!
//! Each test drives a `DagManager` over a temporary store through the public
//! API, the way blocks arrive from peers, and observes the listener
//! callbacks plus the store state.

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use braid::block::{genesis_hash, Block};
use braid::config::ConsensusParams;
use braid::consensus::dag::DagManager;
use braid::consensus::vertex::Milestone;
use braid::peer::PeerManager;
use braid::pow;
use braid::store::BlockStore;
use braid::{constants, Hash};

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

/// A node under test with callback recorders.
struct Node {
    dag: DagManager,
    store: Arc<BlockStore>,
    /// (block hash, is_main) per OnChainUpdated.
    updates: Arc<Mutex<Vec<(Hash, bool)>>>,
    /// Milestone hash per OnLvsConfirmed.
    confirmed: Arc<Mutex<Vec<Hash>>>,
}

fn node_with(params: ConsensusParams) -> Node {
    let store = Arc::new(BlockStore::open_temporary().unwrap());
    let peers = Arc::new(PeerManager::new());
    let dag = DagManager::new(Arc::clone(&store), peers, params).unwrap();

    let updates = Arc::new(Mutex::new(Vec::new()));
    let updates_sink = Arc::clone(&updates);
    dag.register_on_chain_updated(Box::new(move |block, is_main| {
        updates_sink.lock().unwrap().push((block.hash(), is_main));
    }));

    let confirmed = Arc::new(Mutex::new(Vec::new()));
    let confirmed_sink = Arc::clone(&confirmed);
    dag.register_on_lvs_confirmed(Box::new(move |vertices, _created, _removed| {
        // In-memory order puts the milestone vertex last.
        let ms = vertices.last().expect("level set is never empty");
        confirmed_sink.lock().unwrap().push(ms.hash);
    }));

    Node {
        dag,
        store,
        updates,
        confirmed,
    }
}

impl Node {
    fn submit(&self, block: &Arc<Block>) {
        self.dag.add_new_block(Arc::clone(block), None);
    }

    /// Drain all three workers, letting cross-worker flush hops finish.
    fn settle(&self) {
        self.dag.wait();
        std::thread::sleep(Duration::from_millis(20));
        self.dag.wait();
    }

    fn snapshot_of(&self, ms_hash: &Hash) -> Arc<Milestone> {
        self.dag
            .get_ms_vertex(ms_hash)
            .and_then(|v| v.snapshot.clone())
            .expect("milestone snapshot")
    }
}

fn bits_of(snapshot: &Arc<Milestone>) -> u32 {
    pow::target_to_compact(snapshot.block_target)
}

/// A block under `snapshot` solved to the block target but deliberately
/// missing the milestone bound.
fn plain_block_on(snapshot: &Arc<Milestone>, prev: Hash, tip: Hash, time: u64) -> Arc<Block> {
    let mut block = Block::new(snapshot.ms_hash, prev, tip, time, bits_of(snapshot));
    let target = block.target();
    loop {
        let hash = block.hash();
        if pow::meets_target(&hash, &target) && !pow::meets_target(&hash, &snapshot.milestone_target)
        {
            break;
        }
        block.nonce += 1;
    }
    Arc::new(block)
}

/// A milestone candidate under `snapshot`.
fn milestone_block_on(snapshot: &Arc<Milestone>, prev: Hash, tip: Hash, time: u64) -> Arc<Block> {
    let mut block = Block::new(snapshot.ms_hash, prev, tip, time, bits_of(snapshot));
    block.solve_to(&snapshot.milestone_target);
    Arc::new(block)
}

/// Grow the best chain by one self-sealing milestone and return its hash.
fn grow_best_by_milestone(node: &Node, prev: &mut Hash, time: u64) -> Hash {
    let head = node.dag.milestone_head();
    let ms = milestone_block_on(&head, *prev, *prev, time);
    node.submit(&ms);
    node.settle();
    *prev = ms.hash();
    ms.hash()
}

// ── Scenario 1: straight-line growth ──

#[test]
fn straight_line_growth() {
    let node = node_with(ConsensusParams::default());
    let t0 = unix_now();
    let mut prev = genesis_hash();
    let mut milestones = Vec::new();

    for i in 1..=10u64 {
        let head = node.dag.milestone_head();
        let block = if i % 3 == 0 {
            milestone_block_on(&head, prev, prev, t0 + i * 10)
        } else {
            plain_block_on(&head, prev, prev, t0 + i * 10)
        };
        node.submit(&block);
        node.settle();
        prev = block.hash();
        if i % 3 == 0 {
            milestones.push(block.hash());
        }
    }

    assert_eq!(node.dag.best_milestone_height(), 3);
    assert_eq!(node.dag.milestone_head().ms_hash, milestones[2]);
    assert_eq!(node.dag.chain_count(), 1);

    let updates = node.updates.lock().unwrap();
    assert_eq!(updates.len(), 3);
    assert!(updates.iter().all(|(_, is_main)| *is_main));
    let fired: Vec<Hash> = updates.iter().map(|(h, _)| *h).collect();
    assert_eq!(fired, milestones);
}

// ── Scenario 2: out-of-order arrival ──

#[test]
fn out_of_order_arrival_goes_through_the_obc() {
    let node = node_with(ConsensusParams::default());
    let t0 = unix_now();
    let head = node.dag.milestone_head();
    let g = genesis_hash();

    let b1 = plain_block_on(&head, g, g, t0 + 1);
    let b2 = plain_block_on(&head, b1.hash(), g, t0 + 2);

    node.submit(&b2);
    node.settle();
    // Parked: known to the node but not part of the DAG.
    assert!(node.store.exists(&b2.hash()));
    assert!(!node.store.dag_exists(&b2.hash()));
    assert_eq!(node.store.obc_len(), 1);

    node.submit(&b1);
    node.settle();
    assert!(node.store.dag_exists(&b1.hash()));
    assert!(node.store.dag_exists(&b2.hash()));
    assert_eq!(node.store.obc_len(), 0);
}

#[test]
fn obc_release_cascades_through_generations() {
    let node = node_with(ConsensusParams::default());
    let t0 = unix_now();
    let head = node.dag.milestone_head();
    let g = genesis_hash();

    let b1 = plain_block_on(&head, g, g, t0 + 1);
    let b2 = plain_block_on(&head, b1.hash(), g, t0 + 2);
    let b3 = plain_block_on(&head, b2.hash(), g, t0 + 3);

    // Grandchild first, then child, then the root: two orphan generations.
    node.submit(&b3);
    node.submit(&b2);
    node.settle();
    assert_eq!(node.store.obc_len(), 2);

    node.submit(&b1);
    node.settle();
    assert_eq!(node.store.obc_len(), 0);
    for b in [&b1, &b2, &b3] {
        assert!(node.store.dag_exists(&b.hash()));
    }
}

#[test]
fn readmitting_a_known_block_is_a_noop() {
    let node = node_with(ConsensusParams::default());
    let t0 = unix_now();
    let head = node.dag.milestone_head();
    let g = genesis_hash();

    let b1 = plain_block_on(&head, g, g, t0 + 1);
    node.submit(&b1);
    node.settle();
    assert!(node.store.dag_exists(&b1.hash()));

    node.submit(&b1);
    node.settle();
    assert_eq!(node.dag.chain_count(), 1);
    assert_eq!(node.store.obc_len(), 0);
    assert!(node.updates.lock().unwrap().is_empty());
}

// ── Scenario 3: fork, shorter loses ──

#[test]
fn shorter_fork_does_not_take_best() {
    let node = node_with(ConsensusParams::default());
    let t0 = unix_now();
    let mut prev = genesis_hash();
    let mut hashes = Vec::new();

    for i in 1..=10u64 {
        let head = node.dag.milestone_head();
        let block = if i % 3 == 0 {
            milestone_block_on(&head, prev, prev, t0 + i * 10)
        } else {
            plain_block_on(&head, prev, prev, t0 + i * 10)
        };
        node.submit(&block);
        node.settle();
        prev = block.hash();
        hashes.push(block.hash());
    }
    let b3 = hashes[2];
    let b5 = hashes[4];
    let b9 = hashes[8];
    assert_eq!(node.dag.milestone_head().ms_hash, b9);

    // A milestone candidate referencing B3 and extending B5: a new chain.
    let fork_ms = milestone_block_on(&node.snapshot_of(&b3), b5, b5, t0 + 110);
    node.submit(&fork_ms);
    node.settle();

    assert_eq!(node.dag.chain_count(), 2);
    assert_eq!(node.dag.milestone_head().ms_hash, b9);
    let updates = node.updates.lock().unwrap();
    let (last_hash, last_main) = updates.last().copied().unwrap();
    assert_eq!(last_hash, fork_ms.hash());
    assert!(!last_main);
}

// ── Scenario 4: fork, longer wins ──

#[test]
fn longer_fork_takes_best_at_the_switch() {
    let node = node_with(ConsensusParams::default());
    let t0 = unix_now();
    let mut prev = genesis_hash();
    let mut hashes = Vec::new();

    for i in 1..=10u64 {
        let head = node.dag.milestone_head();
        let block = if i % 3 == 0 {
            milestone_block_on(&head, prev, prev, t0 + i * 10)
        } else {
            plain_block_on(&head, prev, prev, t0 + i * 10)
        };
        node.submit(&block);
        node.settle();
        prev = block.hash();
        hashes.push(block.hash());
    }
    let b3 = hashes[2];
    let b5 = hashes[4];
    let b9 = hashes[8];

    // Fork from B3 and keep extending it with milestones until the
    // accumulated work overtakes the first chain.
    let mut fork_head = {
        let fork_ms = milestone_block_on(&node.snapshot_of(&b3), b5, b5, t0 + 110);
        node.submit(&fork_ms);
        node.settle();
        fork_ms.hash()
    };
    assert_eq!(node.dag.milestone_head().ms_hash, b9);

    let mut switched_at = None;
    for i in 0..20u64 {
        let snapshot = node.snapshot_of(&fork_head);
        let ms = milestone_block_on(&snapshot, fork_head, fork_head, t0 + 120 + i * 10);
        node.submit(&ms);
        node.settle();
        fork_head = ms.hash();
        if node.dag.milestone_head().ms_hash == fork_head {
            switched_at = Some(fork_head);
            break;
        }
    }

    let switched_at = switched_at.expect("the growing fork eventually wins");
    assert_eq!(node.dag.milestone_head().ms_hash, switched_at);

    let updates = node.updates.lock().unwrap();
    // The switching milestone fired with is_main = true; every fork update
    // before it fired with is_main = false.
    let switch_pos = updates
        .iter()
        .position(|(h, _)| *h == switched_at)
        .expect("switch milestone notified");
    assert!(updates[switch_pos].1);
    for (hash, is_main) in updates.iter().take(switch_pos).skip(3) {
        assert!(!is_main, "pre-switch fork update {hash:?} must not be main");
    }
}

// ── Scenario 5: flush gating ──

fn gating_params(delete_fork_threshold: usize) -> ConsensusParams {
    ConsensusParams {
        punctuality_threshold: 3,
        delete_fork_threshold,
        ..ConsensusParams::default()
    }
}

#[test]
fn flush_waits_for_fork_agreement() {
    // A huge delete threshold keeps the fork alive for the whole test.
    let node = node_with(gating_params(100));
    let t0 = unix_now();
    let mut prev = genesis_hash();

    let m1 = grow_best_by_milestone(&node, &mut prev, t0 + 10);
    let _m2 = grow_best_by_milestone(&node, &mut prev, t0 + 20);
    let _m3 = grow_best_by_milestone(&node, &mut prev, t0 + 30);
    assert!(node.confirmed.lock().unwrap().is_empty());

    // Fork disagreeing with the best chain from height 2 onwards.
    let fork_ms = milestone_block_on(&node.snapshot_of(&m1), m1, m1, t0 + 45);
    node.submit(&fork_ms);
    node.settle();
    assert_eq!(node.dag.chain_count(), 2);

    // Extending the best chain flushes M1 (the fork agrees there) and then
    // stalls: the fork disagrees at height 2.
    for i in 5..=8u64 {
        grow_best_by_milestone(&node, &mut prev, t0 + i * 10);
    }
    let confirmed = node.confirmed.lock().unwrap().clone();
    assert_eq!(confirmed, vec![m1]);
    assert!(node.store.db_exists(&m1));
}

#[test]
fn fork_deletion_unblocks_the_flush() {
    let node = node_with(gating_params(2));
    let t0 = unix_now();
    let mut prev = genesis_hash();

    let m1 = grow_best_by_milestone(&node, &mut prev, t0 + 10);
    let m2 = grow_best_by_milestone(&node, &mut prev, t0 + 20);
    let _m3 = grow_best_by_milestone(&node, &mut prev, t0 + 30);

    let fork_ms = milestone_block_on(&node.snapshot_of(&m1), m1, m1, t0 + 45);
    node.submit(&fork_ms);
    node.settle();
    assert_eq!(node.dag.chain_count(), 2);

    // The stale fork falls behind the prune bar and is deleted, after which
    // flushing resumes past the old fork point.
    for i in 5..=9u64 {
        grow_best_by_milestone(&node, &mut prev, t0 + i * 10);
    }
    assert_eq!(node.dag.chain_count(), 1);
    let confirmed = node.confirmed.lock().unwrap().clone();
    assert!(confirmed.contains(&m1));
    assert!(confirmed.contains(&m2));
    // Flushes happen oldest first.
    assert_eq!(confirmed[0], m1);
    assert_eq!(confirmed[1], m2);
}

// ── Scenario 6: punctuality drop ──

#[test]
fn block_referencing_an_ancient_milestone_is_dropped() {
    let node = node_with(ConsensusParams::default());
    let t0 = unix_now();
    let mut prev = genesis_hash();
    let mut milestones = Vec::new();

    for i in 1..=12u64 {
        milestones.push(grow_best_by_milestone(&node, &mut prev, t0 + i * 10));
    }
    let m1 = milestones[0];
    assert!(node.store.db_exists(&m1), "old milestones have been flushed");

    // best height 12, referenced height 1: stale beyond the window.
    let late = plain_block_on(&node.snapshot_of(&m1), m1, m1, t0 + 130);
    node.submit(&late);
    node.settle();

    assert!(!node.store.exists(&late.hash()));
    assert!(!node.dag.exists_node(&late.hash()));
}

// ── Boundary: orphan arrivals while the OBC is disabled ──

#[test]
fn stale_head_disables_orphan_collection() {
    let node = node_with(ConsensusParams::default());
    // Timestamps far in the past: after the first milestone the node sees
    // itself as deep in catch-up and bypasses the orphan container.
    let t0 = constants::GENESIS_TIME;
    let mut prev = genesis_hash();
    grow_best_by_milestone(&node, &mut prev, t0 + 10);
    assert!(!node.store.obc_enabled());

    let head = node.dag.milestone_head();
    let orphan = plain_block_on(&head, [9u8; 32], prev, t0 + 20);
    node.submit(&orphan);
    node.settle();

    assert!(!node.store.exists(&orphan.hash()));
    assert_eq!(node.store.obc_len(), 0);
}

// ── Listener faults ──

#[test]
fn panicking_listener_does_not_stall_the_flush_pipeline() {
    let node = node_with(gating_params(100));
    node.dag
        .register_on_lvs_confirmed(Box::new(|_, _, _| panic!("listener fault")));

    let t0 = unix_now();
    let mut prev = genesis_hash();
    let m1 = grow_best_by_milestone(&node, &mut prev, t0 + 10);
    for i in 2..=6u64 {
        grow_best_by_milestone(&node, &mut prev, t0 + i * 10);
    }

    // The flush persisted and the purge ran despite the panicking listener.
    assert!(node.store.db_exists(&m1));
    assert!(node.dag.get_ms_vertex(&m1).is_some(), "store still serves it");
    assert_eq!(node.dag.best_milestone_height(), 6);
}

// ── Invariants ──

#[test]
fn flushes_are_monotonic_and_stored() {
    let node = node_with(gating_params(2));
    let t0 = unix_now();
    let mut prev = genesis_hash();
    for i in 1..=10u64 {
        grow_best_by_milestone(&node, &mut prev, t0 + i * 10);
    }

    let confirmed = node.confirmed.lock().unwrap().clone();
    assert!(!confirmed.is_empty());
    let mut last_height = 0;
    for ms_hash in &confirmed {
        assert!(node.store.db_exists(ms_hash));
        let height = node.dag.get_height(ms_hash).unwrap();
        assert!(height > last_height || last_height == 0);
        last_height = height;
    }
    // Flushed milestones are served from the store by height.
    let first = node.store.get_milestone_at(1).unwrap();
    assert_eq!(first.hash, confirmed[0]);
}
