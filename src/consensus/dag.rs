//! The DAG manager: block admission, milestone promotion, fork tracking,
//! flushing, and the sync services peers lean on.
//!
//! Three single-threaded workers divide the writes: `verify` owns the chains,
//! the chain set, the orphan admission decisions, and the milestone-vertex
//! map; `sync` serves locators and inventory and only reads; `storage` writes
//! finalized level sets and re-enters `verify` for the final cache purge.
//! Tasks cross workers by submitting follow-up tasks, never by waiting.

use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;

use crate::block::{genesis_hash, Block};
use crate::config::ConsensusParams;
use crate::consensus::chain::{block_outputs, Chain, VerifyError};
use crate::consensus::chainset::ChainSet;
use crate::consensus::obc::{MASK_MILESTONE, MASK_PREV, MASK_TIP};
use crate::consensus::vertex::{Milestone, Vertex, VertexRecord};
use crate::consensus::worker::Worker;
use crate::network::{InvKind, Message};
use crate::peer::{GetDataTask, GetInvTask, Peer, PeerManager};
use crate::store::BlockStore;
use crate::transaction::{Txoc, Utxo, UtxoKey};
use crate::{pow, short_hash, Hash};

/// Listener invoked after a level set is durably stored.
pub type OnLvsConfirmed =
    Box<dyn Fn(&[Arc<Vertex>], &HashMap<UtxoKey, Utxo>, &HashSet<UtxoKey>) + Send + Sync>;

/// Listener invoked when a chain gains a milestone; `is_main` marks the best
/// chain at the moment of the update.
pub type OnChainUpdated = Box<dyn Fn(&Arc<Block>, bool) + Send + Sync>;

/// Counters accumulated as level sets are stored.
#[derive(Clone, Debug, Default)]
pub struct StatData {
    pub tx_count: u64,
    pub block_count: u64,
    /// Timestamp of the first flushed block.
    pub start_time: u64,
    pub flush_failures: u64,
    pub last_flush_error: Option<String>,
}

/// The top-level consensus orchestrator.
pub struct DagManager {
    inner: Arc<DagInner>,
}

struct DagInner {
    params: ConsensusParams,
    store: Arc<BlockStore>,
    peers: Arc<PeerManager>,

    chains: RwLock<ChainSet>,
    /// Milestone hash -> milestone vertex, for every in-memory chain.
    ms_vertices: DashMap<Hash, Arc<Vertex>>,
    /// Level sets currently requested from peers.
    downloading: DashSet<Hash>,

    verify_pool: Worker,
    sync_pool: Worker,
    storage_pool: Worker,

    on_lvs_confirmed: RwLock<Option<OnLvsConfirmed>>,
    on_chain_updated: RwLock<Option<OnChainUpdated>>,
    stats: RwLock<StatData>,
}

impl DagManager {
    pub fn new(
        store: Arc<BlockStore>,
        peers: Arc<PeerManager>,
        params: ConsensusParams,
    ) -> Result<Self, VerifyError> {
        let chain = Arc::new(Chain::new(Arc::clone(&store), params.clone())?);
        let ms_vertices = DashMap::new();
        let head = store
            .get_milestone_at(store.head_height())
            .expect("chain construction verified the head milestone");
        ms_vertices.insert(head.hash, head);

        Ok(DagManager {
            inner: Arc::new(DagInner {
                params,
                store,
                peers,
                chains: RwLock::new(ChainSet::new(chain)),
                ms_vertices,
                downloading: DashSet::new(),
                verify_pool: Worker::new("verify"),
                sync_pool: Worker::new("sync"),
                storage_pool: Worker::new("storage"),
                on_lvs_confirmed: RwLock::new(None),
                on_chain_updated: RwLock::new(None),
                stats: RwLock::new(StatData::default()),
            }),
        })
    }

    // ── Admission ──

    /// Submit a block for admission; runs on the verify worker.
    pub fn add_new_block(&self, block: Arc<Block>, peer: Option<Arc<Peer>>) {
        let inner = Arc::clone(&self.inner);
        self.inner
            .verify_pool
            .execute(move || inner.process_new_block(block, peer));
    }

    // ── Sync services (read-only, sync worker) ──

    /// Ask `peer` what it has, walking back `length` milestones from
    /// `from` (best head when `None`).
    pub fn request_inv(&self, from: Option<Hash>, length: usize, peer: Arc<Peer>) {
        let inner = Arc::clone(&self.inner);
        self.inner
            .sync_pool
            .execute(move || inner.request_inv(from, length, &peer));
    }

    /// Handle a peer's Inv answer to our GetInv.
    pub fn callback_request_inv(&self, hashes: Vec<Hash>, nonce: u32, peer: Arc<Peer>) {
        let inner = Arc::clone(&self.inner);
        self.inner
            .sync_pool
            .execute(move || inner.callback_request_inv(hashes, nonce, &peer));
    }

    /// Answer a peer's GetInv with the milestones beyond its locator.
    pub fn respond_request_inv(&self, locator: Vec<Hash>, nonce: u32, peer: Arc<Peer>) {
        let inner = Arc::clone(&self.inner);
        self.inner
            .sync_pool
            .execute(move || inner.respond_request_inv(locator, nonce, &peer));
    }

    /// Serve level-set bundles, one per requested milestone hash.
    pub fn respond_request_lvs(&self, hashes: Vec<Hash>, nonces: Vec<u32>, peer: Arc<Peer>) {
        debug_assert_eq!(hashes.len(), nonces.len());
        for (hash, nonce) in hashes.into_iter().zip(nonces) {
            let inner = Arc::clone(&self.inner);
            let peer = Arc::clone(&peer);
            self.inner
                .sync_pool
                .execute(move || inner.respond_request_lvs(hash, nonce, &peer));
        }
    }

    /// Serve the best chain's pending set.
    pub fn respond_request_pending(&self, nonce: u32, peer: Arc<Peer>) {
        let inner = Arc::clone(&self.inner);
        self.inner
            .sync_pool
            .execute(move || inner.respond_request_pending(nonce, &peer));
    }

    // ── Read accessors (any thread) ──

    pub fn milestone_head(&self) -> Arc<Milestone> {
        self.inner.best_chain().head()
    }

    pub fn best_milestone_height(&self) -> u64 {
        self.inner.best_chain().head_height()
    }

    pub fn is_main_chain_milestone(&self, hash: &Hash) -> bool {
        self.inner.is_main_chain_milestone(hash)
    }

    pub fn get_ms_vertex(&self, hash: &Hash) -> Option<Arc<Vertex>> {
        self.inner.get_ms_vertex(hash)
    }

    /// Height of a block on the best chain (cache first, store second).
    pub fn get_height(&self, hash: &Hash) -> Option<u64> {
        self.inner.get_height(hash)
    }

    /// True when any in-memory chain knows the block.
    pub fn exists_node(&self, hash: &Hash) -> bool {
        self.inner.chains.read().iter().any(|c| c.knows_block(hash))
    }

    pub fn chain_count(&self) -> usize {
        self.inner.chains.read().len()
    }

    /// True when a level set download is in flight for `hash`.
    pub fn is_downloading(&self, hash: &Hash) -> bool {
        self.inner.downloading.contains(hash)
    }

    /// Blocks of the best-chain level set at `height`, cache or store.
    pub fn get_main_chain_level_set(&self, height: u64) -> Option<Vec<Arc<Block>>> {
        let best = self.inner.best_chain();
        if height < best.least_height_cached() {
            return self.inner.store.get_level_set_blocks_at(height);
        }
        let ms = best.milestone_at_height(height)?;
        let vertices = ms.level_set_vertices();
        if vertices.len() != ms.level_set_size() {
            return self.inner.store.get_level_set_blocks_at(height);
        }
        Some(vertices.iter().map(|v| Arc::clone(&v.block)).collect())
    }

    /// Serialized best-chain level set (milestone first) for bundles.
    pub fn get_main_chain_raw_level_set(&self, hash: &Hash) -> Option<Vec<u8>> {
        self.inner.get_main_chain_raw_level_set(hash)
    }

    pub fn get_stat_data(&self) -> StatData {
        self.inner.stats.read().clone()
    }

    pub fn register_on_lvs_confirmed(&self, callback: OnLvsConfirmed) {
        *self.inner.on_lvs_confirmed.write() = Some(callback);
    }

    pub fn register_on_chain_updated(&self, callback: OnChainUpdated) {
        *self.inner.on_chain_updated.write() = Some(callback);
    }

    // ── Lifecycle ──

    /// Block until all three workers are idle.
    pub fn wait(&self) {
        while !self.inner.verify_pool.is_idle()
            || !self.inner.storage_pool.is_idle()
            || !self.inner.sync_pool.is_idle()
        {
            std::thread::yield_now();
        }
    }

    /// Drain and stop the workers: sync first, verify, then storage, so
    /// late cache-purge tasks still drain.
    pub fn stop(&self) {
        tracing::info!("stopping DAG");
        self.wait();
        self.inner.sync_pool.stop();
        self.inner.verify_pool.stop();
        self.inner.storage_pool.stop();
        tracing::info!("DAG stopped");
    }
}

impl DagInner {
    fn best_chain(&self) -> Arc<Chain> {
        Arc::clone(self.chains.read().best())
    }

    // ── Admission pipeline (verify worker) ──

    fn process_new_block(self: &Arc<Self>, block: Arc<Block>, peer: Option<Arc<Peer>>) {
        let mut queue: VecDeque<(Arc<Block>, Option<Arc<Peer>>)> =
            VecDeque::from([(block, peer)]);
        while let Some((block, peer)) = queue.pop_front() {
            for released in self.admit_block(block, peer) {
                queue.push_back((released, None));
            }
        }
    }

    /// One block through the admission pipeline. Returns the orphans its
    /// arrival released, which re-enter the pipeline.
    fn admit_block(self: &Arc<Self>, block: Arc<Block>, peer: Option<Arc<Peer>>) -> Vec<Arc<Block>> {
        let hash = block.hash();
        tracing::trace!(block = %short_hash(&hash), "admitting block");

        if block.is_genesis() {
            tracing::trace!("abort adding the genesis block");
            return vec![];
        }
        if self.store.exists(&hash) {
            tracing::trace!(block = %short_hash(&hash), "abort adding existing block");
            return vec![];
        }

        if let Err(e) = block.verify() {
            tracing::trace!(block = %short_hash(&hash), error = %e, "syntax check failed");
            return vec![];
        }

        // Solidity.
        let mut mask = 0u8;
        if !self.store.dag_exists(&block.milestone_parent) {
            mask |= MASK_MILESTONE;
        }
        if !self.store.dag_exists(&block.tip_parent) {
            mask |= MASK_TIP;
        }
        if !self.store.dag_exists(&block.prev_parent) {
            mask |= MASK_PREV;
        }

        if self.store.is_weakly_solid(&block) {
            if self.store.any_link_is_orphan(&block) {
                tracing::info!(
                    block = %short_hash(&hash),
                    mask,
                    "block is not solid (link in orphan container)"
                );
                self.store.add_block_to_obc(block, mask);
                return vec![];
            }
        } else {
            // At least one parent is entirely unknown.
            if let Some(ms) = self.get_ms_vertex(&block.milestone_parent) {
                if !self.check_punctuality(&hash, &ms) {
                    return vec![];
                }
            }
            tracing::info!(
                block = %short_hash(&hash),
                mask,
                prev = %short_hash(&block.prev_parent),
                tip = %short_hash(&block.tip_parent),
                ms = %short_hash(&block.milestone_parent),
                "block is not solid"
            );
            if self.store.add_block_to_obc(Arc::clone(&block), mask) {
                if let Some(peer) = &peer {
                    peer.start_sync();
                }
            } else {
                tracing::debug!(block = %short_hash(&hash), "orphan dropped");
            }
            return vec![];
        }

        // Difficulty against the referenced milestone snapshot.
        let Some(ms) = self.get_ms_vertex(&block.milestone_parent) else {
            tracing::warn!(
                block = %short_hash(&hash),
                "block has missing or invalid milestone link"
            );
            return vec![];
        };
        let snapshot = ms.snapshot.as_ref().expect("milestone vertex has a snapshot");
        let expected = pow::target_to_compact(snapshot.block_target);
        if block.bits != expected {
            tracing::warn!(
                block = %short_hash(&hash),
                declared = block.bits,
                expected,
                "unexpected change in difficulty"
            );
            return vec![];
        }

        // Punctuality.
        if !self.check_punctuality(&hash, &ms) {
            return vec![];
        }

        // Accept.
        self.store.cache(Arc::clone(&block));
        if let Some(peer) = &peer {
            self.peers.relay_block(&block, Some(&peer.id));
        }
        self.add_block_to_pending(&block);
        self.store.release_blocks(&hash)
    }

    /// A block is punctual when its referenced milestone is within the
    /// punctuality window of the best head.
    fn check_punctuality(&self, block_hash: &Hash, ms: &Arc<Vertex>) -> bool {
        let best_height = self.best_chain().head_height();
        if best_height > ms.height
            && best_height - ms.height >= self.params.punctuality_threshold
        {
            tracing::info!(
                block = %short_hash(block_hash),
                referenced = ms.height,
                best = best_height,
                "block is too old"
            );
            return false;
        }
        true
    }

    /// Distribute an accepted block to every chain and promote it if it is a
    /// milestone candidate.
    fn add_block_to_pending(self: &Arc<Self>, block: &Arc<Block>) {
        let utxos = block_outputs(block);
        {
            let chains = self.chains.read();
            for chain in chains.iter() {
                chain.add_pending_block(Arc::clone(block));
                if !block.is_first_registration() {
                    chain.add_pending_utxos(&utxos);
                }
            }
        }

        let ms_hash = block.milestone_parent;
        let (best, best_head_hash) = {
            let chains = self.chains.read();
            let best = Arc::clone(chains.best());
            let head = best.head().ms_hash;
            (best, head)
        };

        // The referenced milestone on the best chain or in the store.
        let ms_vertex = best
            .get_vertex_cache(&ms_hash)
            .filter(|v| v.is_milestone)
            .or_else(|| self.store.get_vertex(&ms_hash).filter(|v| v.is_milestone));

        if let Some(ms_vertex) = ms_vertex {
            let snapshot = ms_vertex.snapshot.as_ref().expect("milestone has snapshot");
            if check_ms_pow(block, snapshot) {
                if ms_vertex.hash == best_head_hash {
                    // Extends the best chain in place.
                    tracing::debug!(
                        block = %short_hash(&block.hash()),
                        ms = %short_hash(&ms_hash),
                        "updating main chain head"
                    );
                    if self.process_milestone(&best, block) {
                        self.notify_chain_updated(block, true);
                        self.evaluate_obc();
                        self.delete_forks();
                        self.flush_trigger();
                    }
                } else {
                    // A fork off the best chain (or off the stored prefix).
                    self.create_fork(&best, block);
                }
            }
            return;
        }

        // The referenced milestone may head or sit inside a fork chain.
        let candidates: Vec<(usize, Arc<Chain>)> = {
            let chains = self.chains.read();
            chains
                .iter()
                .enumerate()
                .filter(|(i, _)| !chains.is_best(*i))
                .map(|(i, c)| (i, Arc::clone(c)))
                .collect()
        };

        for (index, chain) in candidates {
            let Some(ms_vertex) = chain.get_vertex_cache(&ms_hash).filter(|v| v.is_milestone)
            else {
                continue;
            };
            let snapshot = ms_vertex.snapshot.as_ref().expect("milestone has snapshot");
            if !check_ms_pow(block, snapshot) {
                return;
            }
            if ms_hash == chain.head().ms_hash {
                // The fork grows at its head.
                tracing::debug!(
                    block = %short_hash(&block.hash()),
                    ms = %short_hash(&ms_hash),
                    "a fork grows"
                );
                if self.process_milestone(&chain, block) {
                    let is_main = self.chains.write().update_best(index);
                    self.notify_chain_updated(block, is_main);
                    if is_main {
                        tracing::debug!(
                            head = %short_hash(&self.best_chain().head().ms_hash),
                            "switched to the best chain"
                        );
                    }
                }
            } else {
                self.create_fork(&chain, block);
            }
            return;
        }
    }

    /// Fork `parent` at the candidate's referenced milestone and verify the
    /// candidate on the copy.
    fn create_fork(self: &Arc<Self>, parent: &Arc<Chain>, block: &Arc<Block>) {
        tracing::debug!(
            block = %short_hash(&block.hash()),
            ms = %short_hash(&block.milestone_parent),
            total_chains = self.chains.read().len(),
            "a fork is created"
        );
        let fork = match Chain::fork(parent, block) {
            Ok(fork) => Arc::new(fork),
            Err(e) => {
                tracing::warn!(
                    block = %short_hash(&block.hash()),
                    error = %e,
                    "fork construction failed"
                );
                return;
            }
        };
        if self.process_milestone(&fork, block) {
            let is_main = self.chains.write().emplace(Arc::clone(&fork));
            self.notify_chain_updated(block, is_main);
            if is_main {
                tracing::debug!(
                    head = %short_hash(&fork.head().ms_hash),
                    "switched to the best chain"
                );
            }
        }
    }

    /// Run the branch-local verification and register the new milestone.
    fn process_milestone(&self, chain: &Arc<Chain>, block: &Arc<Block>) -> bool {
        match chain.verify(block) {
            Ok(vertex) => {
                self.ms_vertices.insert(vertex.hash, vertex);
                if self.downloading.remove(&block.hash()).is_some() {
                    tracing::debug!(
                        remaining = self.downloading.len(),
                        "removed from downloading"
                    );
                }
                true
            }
            Err(e) => {
                tracing::warn!(
                    block = %short_hash(&block.hash()),
                    error = %e,
                    "milestone verification failed"
                );
                false
            }
        }
    }

    fn notify_chain_updated(&self, block: &Arc<Block>, is_main: bool) {
        if let Some(callback) = self.on_chain_updated.read().as_ref() {
            callback(block, is_main);
        }
    }

    /// Enable the orphan container when the head is fresh, disable it when
    /// the node is deep in catch-up.
    fn evaluate_obc(&self) {
        let head_time = self.best_chain().head().ms_time;
        let now = unix_now();
        if now.saturating_sub(head_time) < self.params.obc_enable_threshold_secs {
            self.store.enable_obc();
        } else {
            self.store.disable_obc();
        }
    }

    /// Prune forks whose head chainwork fell behind the milestone
    /// `delete_fork_threshold` positions before the best head.
    fn delete_forks(&self) {
        let best = self.best_chain();
        let milestones = best.milestones_snapshot();
        if milestones.len() <= self.params.delete_fork_threshold {
            return;
        }
        let bar = milestones[milestones.len() - self.params.delete_fork_threshold].chainwork;

        let removed = self.chains.write().remove_forks(|chain| {
            if chain.head().chainwork >= bar {
                return false;
            }
            // A divergent milestone with a flush in flight pins its chain
            // for this round; the prune re-evaluates after the purge.
            let pinned = chain.milestones_snapshot().iter().any(|m| {
                m.stored()
                    && best
                        .milestone_at_height(m.height)
                        .map_or(true, |shared| shared.ms_hash != m.ms_hash)
            });
            !pinned
        });

        for chain in removed {
            // Release milestone vertices not shared with the best chain.
            for ms in chain.milestones_snapshot().iter().rev() {
                if best.has_milestone(&ms.ms_hash) || self.store.is_milestone_in_db(&ms.ms_hash) {
                    break;
                }
                self.ms_vertices.remove(&ms.ms_hash);
            }
            tracing::info!(
                head = %short_hash(&chain.head().ms_hash),
                total_chains = self.chains.read().len(),
                "deleted fork"
            );
        }
    }

    // ── Flush pipeline ──

    /// Walk the best chain from its oldest in-memory milestone and flush
    /// every milestone beyond the punctuality window that all live forks
    /// agree on; stop at the first disagreement.
    fn flush_trigger(self: &Arc<Self>) {
        let (best, forks) = {
            let chains = self.chains.read();
            let best = Arc::clone(chains.best());
            let forks: Vec<Arc<Chain>> = chains
                .iter()
                .filter(|c| !Arc::ptr_eq(c, &best))
                .cloned()
                .collect();
            (best, forks)
        };

        let milestones = best.milestones_snapshot();
        let window = self.params.punctuality_threshold as usize;
        if milestones.len() <= window {
            return;
        }

        for ms in milestones.iter().take(milestones.len() - window) {
            if ms.stored() {
                continue;
            }
            for fork in &forks {
                match fork.milestone_at_height(ms.height) {
                    Some(fork_ms) if fork_ms.ms_hash == ms.ms_hash => {}
                    // The fork is rooted above this height on the stored
                    // prefix; it cannot disagree here.
                    None if fork.least_height_cached() > ms.height => {}
                    _ => return,
                }
            }
            self.flush_to_store(&best, Arc::clone(ms));
        }
    }

    /// Dispatch one milestone flush to the storage worker.
    fn flush_to_store(self: &Arc<Self>, best: &Arc<Chain>, ms: Arc<Milestone>) {
        tracing::debug!(
            ms = %short_hash(&ms.ms_hash),
            height = ms.height,
            "flushing milestone"
        );
        self.update_stat_on_lvs_stored(&ms);
        let (vertices, txoc) = best.get_data_to_store(&ms);
        if !ms.mark_stored() {
            return;
        }

        let inner = Arc::clone(self);
        self.storage_pool.execute(move || inner.flush_task(ms, vertices, txoc));
    }

    /// Storage-worker half of the flush: persist, notify, then schedule the
    /// in-memory purge back on the verify worker.
    fn flush_task(self: &Arc<Self>, ms: Arc<Milestone>, vertices: Vec<Arc<Vertex>>, txoc: Txoc) {
        tracing::debug!(
            vertices = vertices.len(),
            created = txoc.created().len(),
            removed = txoc.spent().len(),
            "persisting level set"
        );

        let result = (|| -> Result<(), crate::store::StoreError> {
            self.store.store_level_set(&vertices)?;
            self.store.update_prev_redem_hashes(&ms.reg_change)?;
            for vertex in &vertices {
                self.store.uncache(&vertex.hash);
            }
            for (key, utxo) in txoc.created() {
                self.store.add_utxo(key, utxo)?;
            }
            for key in txoc.spent().keys() {
                self.store.remove_utxo(key)?;
            }
            self.store.save_head_height(ms.height)?;
            self.store.save_best_chain_work(ms.chainwork)?;
            Ok(())
        })();

        if let Err(e) = result {
            tracing::error!(
                ms = %short_hash(&ms.ms_hash),
                error = %e,
                "level-set flush failed"
            );
            let mut stats = self.stats.write();
            stats.flush_failures += 1;
            stats.last_flush_error = Some(e.to_string());
            return;
        }

        if let Some(callback) = self.on_lvs_confirmed.read().as_ref() {
            let spent_keys: HashSet<UtxoKey> = txoc.spent_keys();
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                callback(&vertices, txoc.created(), &spent_keys)
            }));
            if outcome.is_err() {
                tracing::error!("level-set listener panicked; continuing with purge");
            }
        }

        let ms_hash = ms.ms_hash;
        let vertex_hashes: Vec<Hash> = vertices.iter().map(|v| v.hash).collect();
        let inner = Arc::clone(self);
        self.verify_pool.execute(move || {
            tracing::trace!(ms = %short_hash(&ms_hash), "purging flushed level set");
            inner.ms_vertices.remove(&ms_hash);
            let chains: Vec<Arc<Chain>> = inner.chains.read().iter().cloned().collect();
            for chain in chains {
                chain.pop_oldest(&vertex_hashes, &txoc);
            }
        });
        tracing::trace!(ms = %short_hash(&ms.ms_hash), "end of flush");
    }

    fn update_stat_on_lvs_stored(&self, ms: &Arc<Milestone>) {
        let mut stats = self.stats.write();
        stats.tx_count += ms.valid_tx_count() as u64;
        stats.block_count += ms.level_set_size() as u64;
        if stats.start_time == 0 {
            if let Some(first) = ms.level_set_vertices().first() {
                stats.start_time = first.block.time;
            }
        }
    }

    // ── Milestone lookups ──

    fn get_ms_vertex(&self, hash: &Hash) -> Option<Arc<Vertex>> {
        if let Some(vertex) = self.ms_vertices.get(hash) {
            return Some(Arc::clone(vertex.value()));
        }
        let stored = self.store.get_vertex(hash).filter(|v| v.snapshot.is_some());
        if stored.is_none() {
            tracing::trace!(ms = %short_hash(hash), "milestone not found");
        }
        stored
    }

    fn is_main_chain_milestone(&self, hash: &Hash) -> bool {
        self.best_chain().has_milestone(hash) || self.store.is_milestone_in_db(hash)
    }

    fn get_height(&self, hash: &Hash) -> Option<u64> {
        self.best_chain()
            .get_vertex_cache(hash)
            .map(|v| v.height)
            .or_else(|| self.store.get_height(hash))
    }

    // ── Sync services (sync worker) ──

    fn request_inv(self: &Arc<Self>, from: Option<Hash>, length: usize, peer: &Arc<Peer>) {
        let locator = self.construct_locator(from, length);
        if locator.is_empty() {
            tracing::debug!("request_inv: empty locator");
            return;
        }

        peer.set_last_get_inv_end(*locator.last().expect("locator is non-empty"));
        peer.set_last_get_inv_length(locator.len());

        let task = GetInvTask::new(self.params.sync_task_timeout());
        let nonce = task.nonce;
        peer.add_pending_get_inv_task(task);
        peer.send_message(Message::GetInv { locator, nonce });
    }

    fn construct_locator(&self, from: Option<Hash>, length: usize) -> Vec<Hash> {
        let start = match from {
            Some(hash) => self.get_ms_vertex(&hash),
            None => {
                let head = self.best_chain().head();
                self.get_ms_vertex(&head.ms_hash)
            }
        };
        match start {
            Some(cursor) => self.traverse_milestone_backward(cursor, length),
            None => vec![],
        }
    }

    fn traverse_milestone_backward(&self, mut cursor: Arc<Vertex>, length: usize) -> Vec<Hash> {
        let mut result = Vec::with_capacity(length);
        for _ in 0..length {
            debug_assert!(cursor.is_milestone);
            result.push(cursor.hash);
            if cursor.hash == genesis_hash() {
                break;
            }
            match self.get_ms_vertex(&cursor.milestone_hash()) {
                Some(parent) => cursor = parent,
                None => break,
            }
        }
        result
    }

    /// Main-chain milestone hashes after `height`, spanning the store and
    /// then the best chain's in-memory deque.
    fn traverse_milestone_forward(&self, height: u64, length: usize) -> Vec<Hash> {
        let mut result = Vec::with_capacity(length);
        let best = self.best_chain();
        let mut cursor = height + 1;

        let db_head = self.store.head_height();
        while cursor <= db_head && result.len() < length {
            match self.store.get_milestone_at(cursor) {
                Some(vertex) => result.push(vertex.hash),
                None => break,
            }
            cursor += 1;
        }

        let chain_head = best.head_height();
        while cursor <= chain_head && result.len() < length {
            match best.milestone_at_height(cursor) {
                Some(ms) if result.last() != Some(&ms.ms_hash) => result.push(ms.ms_hash),
                Some(_) => {}
                None => break,
            }
            cursor += 1;
        }

        result
    }

    fn respond_request_inv(&self, locator: Vec<Hash>, nonce: u32, peer: &Arc<Peer>) {
        if locator.is_empty() {
            peer.send_message(Message::Inv { hashes: vec![], nonce });
            return;
        }

        let mut hashes: Vec<Hash> = vec![];
        let head_hash = self.best_chain().head().ms_hash;

        for start in &locator {
            if *start == head_hash {
                // The peer already reached our head.
                tracing::debug!(
                    peer = %short_hash(&peer.id),
                    "peer is at our head, sending empty inv"
                );
                peer.send_message(Message::Inv { hashes: vec![], nonce });
                return;
            }
            // Genesis is common to every node, so it only counts as an
            // intersection for a bootstrapping peer whose locator is nothing
            // but genesis; in a longer locator it means "no intersection,
            // widen".
            if (*start != genesis_hash() || locator.len() == 1)
                && self.is_main_chain_milestone(start)
            {
                if let Some(height) = self.get_height(start) {
                    tracing::debug!(height, "constructing inv from locator intersection");
                    hashes =
                        self.traverse_milestone_forward(height, self.params.max_inventory_size);
                    break;
                }
            }
        }

        if hashes.is_empty() {
            // No intersection: tell the peer to widen its locator.
            hashes.push(genesis_hash());
        } else {
            // Trim everything up to the most recent hash already sent to
            // this peer via Inv or Bundle, avoiding duplicated GetData.
            let inv_mark = peer.last_sent_inv_hash();
            let bundle_mark = peer.last_sent_bundle_hash();
            let cut = hashes
                .iter()
                .position(|h| *h == inv_mark)
                .or_else(|| hashes.iter().position(|h| *h == bundle_mark));
            if let Some(cut) = cut {
                hashes.drain(..=cut);
            }
            if let Some(last) = hashes.last() {
                peer.set_last_sent_inv_hash(*last);
            } else {
                tracing::debug!(
                    peer = %short_hash(&peer.id),
                    "inv sublist is empty, sending empty inv"
                );
            }
        }

        peer.send_message(Message::Inv { hashes, nonce });
    }

    fn callback_request_inv(self: &Arc<Self>, hashes: Vec<Hash>, nonce: u32, peer: &Arc<Peer>) {
        if hashes.is_empty() {
            // Same height as the peer: ask for its pending set.
            tracing::info!(
                peer = %short_hash(&peer.id),
                "empty inv, requesting the peer's pending set"
            );
            let task = GetDataTask::new(InvKind::PendingSet, None, self.params.sync_task_timeout());
            let task_nonce = task.nonce;
            peer.add_pending_get_data_task(task);
            peer.send_message(Message::GetData {
                kind: InvKind::PendingSet,
                hashes: vec![],
                nonces: vec![task_nonce],
            });
        } else if hashes.len() == 1 && hashes[0] == genesis_hash() {
            if peer.last_get_inv_end() == genesis_hash() {
                tracing::info!(
                    peer = %short_hash(&peer.id),
                    "peer answered a genesis-anchored locator with genesis"
                );
                peer.disconnect();
                return;
            }
            // Probably on a fork: widen the locator.
            let length = (peer.last_get_inv_length() * 2).min(self.params.max_get_inv_length);
            tracing::debug!(length, "possible fork, sending a larger locator");
            self.request_inv(Some(peer.last_get_inv_end()), length, peer);
        } else {
            self.request_data(hashes, peer);
        }

        peer.remove_pending_get_inv_task(nonce);
    }

    fn request_data(&self, requests: Vec<Hash>, peer: &Arc<Peer>) {
        let mut hashes: Vec<Hash> = vec![];
        let mut nonces: Vec<u32> = vec![];
        let mut flush = |hashes: &mut Vec<Hash>, nonces: &mut Vec<u32>| {
            if hashes.is_empty() {
                return;
            }
            tracing::debug!(
                first = %short_hash(&hashes[0]),
                last = %short_hash(hashes.last().expect("non-empty")),
                "requesting level sets"
            );
            peer.send_message(Message::GetData {
                kind: InvKind::LevelSet,
                hashes: std::mem::take(hashes),
                nonces: std::mem::take(nonces),
            });
        };

        for hash in requests {
            if self.downloading.contains(&hash) || self.store.dag_exists(&hash) {
                continue;
            }
            let task = GetDataTask::new(
                InvKind::LevelSet,
                Some(hash),
                self.params.sync_task_timeout(),
            );
            hashes.push(hash);
            nonces.push(task.nonce);
            peer.add_pending_get_data_task(task);
            self.downloading.insert(hash);

            if hashes.len() >= self.params.max_get_data_size {
                flush(&mut hashes, &mut nonces);
            }
        }
        flush(&mut hashes, &mut nonces);
    }

    fn respond_request_lvs(&self, hash: Hash, nonce: u32, peer: &Arc<Peer>) {
        match self.get_main_chain_raw_level_set(&hash) {
            Some(payload) => {
                tracing::debug!(
                    ms = %short_hash(&hash),
                    nonce,
                    peer = %short_hash(&peer.id),
                    "sending level-set bundle"
                );
                peer.set_last_sent_bundle_hash(hash);
                peer.send_message(Message::Bundle { nonce, payload });
            }
            None => {
                tracing::debug!(
                    ms = %short_hash(&hash),
                    "milestone not found, sending NotFound"
                );
                peer.send_message(Message::NotFound { hash, nonce });
            }
        }
    }

    fn respond_request_pending(&self, nonce: u32, peer: &Arc<Peer>) {
        let blocks: Vec<Block> = self
            .best_chain()
            .pending_blocks()
            .iter()
            .map(|b| (**b).clone())
            .collect();
        let payload = bincode::serialize(&blocks).expect("block serialization is infallible");
        peer.send_message(Message::Bundle { nonce, payload });
    }

    fn get_main_chain_raw_level_set(&self, hash: &Hash) -> Option<Vec<u8>> {
        let height = self.get_height(hash)?;
        let best = self.best_chain();
        if height < best.least_height_cached() {
            return self.store.get_raw_level_set_at(height);
        }

        let ms = best.milestone_at_height(height)?;
        let vertices = ms.level_set_vertices();
        if vertices.len() != ms.level_set_size() {
            // A flush won the race; the store has it now.
            return self.store.get_raw_level_set_at(height);
        }

        // Same order as the stored form: the milestone goes first.
        let mut records: Vec<VertexRecord> = Vec::with_capacity(vertices.len());
        records.push(VertexRecord::from_vertex(
            vertices.last().expect("level set is non-empty"),
        ));
        for vertex in &vertices[..vertices.len() - 1] {
            records.push(VertexRecord::from_vertex(vertex));
        }
        bincode::serialize(&records).ok()
    }
}

/// True when the block's proof hash meets the milestone bound of the
/// referenced snapshot.
pub fn check_ms_pow(block: &Arc<Block>, ms: &Arc<Milestone>) -> bool {
    pow::hash_to_scalar(&block.hash()) <= ms.milestone_target
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
