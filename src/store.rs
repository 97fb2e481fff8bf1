//! Durable block/vertex/UTXO storage plus the in-memory admission caches.
//!
//! The `BlockStore` collaborator persists finalized level-sets in sled trees
//! and fronts two in-memory structures the admission pipeline leans on: the
//! block cache (admitted but unflushed blocks) and the orphan block
//! container. Admission policy for the OBC is decided by the DAG manager;
//! the store only houses it.
//!
//! Serialized level-sets place the milestone vertex FIRST; the in-memory
//! level-set convention is milestone LAST. `store_level_set` converts.

use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use primitive_types::U256;

use crate::block::Block;
use crate::consensus::obc::OrphanBlockContainer;
use crate::consensus::vertex::{Vertex, VertexRecord};
use crate::transaction::{Address, RegChange, Utxo, UtxoKey};
use crate::{Hash, ZERO_HASH};

/// Errors from store operations.
#[derive(Clone, Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("level set is empty")]
    EmptyLevelSet,
}

impl From<sled::Error> for StoreError {
    fn from(e: sled::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

impl From<bincode::Error> for StoreError {
    fn from(e: bincode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

const META_HEAD_HEIGHT: &[u8] = b"head_height";
const META_BEST_CHAIN_WORK: &[u8] = b"best_chain_work";

/// The durable store collaborator.
pub struct BlockStore {
    #[allow(dead_code)]
    db: sled::Db,
    /// block hash -> bincode(VertexRecord)
    vertices: sled::Tree,
    /// height (u64 BE) -> milestone hash
    milestones: sled::Tree,
    /// height (u64 BE) -> bincode(Vec<Hash>), milestone hash first
    level_sets: sled::Tree,
    /// utxo key -> bincode(Utxo)
    utxos: sled::Tree,
    /// address -> latest registration block hash
    registrations: sled::Tree,
    meta: sled::Tree,

    block_cache: DashMap<Hash, Arc<Block>>,
    obc: Mutex<OrphanBlockContainer>,
}

impl BlockStore {
    /// Open or create a store at the given path, seeding genesis if absent.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// Open a temporary store (for testing).
    pub fn open_temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, StoreError> {
        let store = BlockStore {
            vertices: db.open_tree("vertices")?,
            milestones: db.open_tree("milestones")?,
            level_sets: db.open_tree("level_sets")?,
            utxos: db.open_tree("utxos")?,
            registrations: db.open_tree("registrations")?,
            meta: db.open_tree("meta")?,
            db,
            block_cache: DashMap::new(),
            obc: Mutex::new(OrphanBlockContainer::new()),
        };
        store.seed_genesis()?;
        Ok(store)
    }

    fn seed_genesis(&self) -> Result<(), StoreError> {
        let genesis = Vertex::genesis();
        if self.vertices.contains_key(genesis.hash)? {
            return Ok(());
        }
        self.store_level_set(&[Arc::clone(&genesis)])?;
        self.save_head_height(0)?;
        let account = genesis.block.transactions[0].outputs[0].address;
        self.registrations.insert(account, &genesis.hash[..])?;
        Ok(())
    }

    // ── Existence ──

    /// True when the hash is durably stored.
    pub fn db_exists(&self, hash: &Hash) -> bool {
        self.vertices.contains_key(hash).unwrap_or(false)
    }

    /// True when the hash is in the cache or durably stored.
    pub fn dag_exists(&self, hash: &Hash) -> bool {
        self.block_cache.contains_key(hash) || self.db_exists(hash)
    }

    /// True when the hash is anywhere: DAG or orphan container.
    pub fn exists(&self, hash: &Hash) -> bool {
        self.dag_exists(hash) || self.obc.lock().contains(hash)
    }

    // ── Block cache ──

    pub fn cache(&self, block: Arc<Block>) {
        self.block_cache.insert(block.hash(), block);
    }

    pub fn uncache(&self, hash: &Hash) {
        self.block_cache.remove(hash);
    }

    pub fn get_block_cache(&self, hash: &Hash) -> Option<Arc<Block>> {
        self.block_cache.get(hash).map(|e| Arc::clone(e.value()))
    }

    /// Cache first, database second.
    pub fn find_block(&self, hash: &Hash) -> Option<Arc<Block>> {
        if let Some(block) = self.get_block_cache(hash) {
            return Some(block);
        }
        self.get_vertex(hash).map(|v| Arc::clone(&v.block))
    }

    // ── Vertices and level sets ──

    pub fn get_vertex(&self, hash: &Hash) -> Option<Arc<Vertex>> {
        let bytes = self.vertices.get(hash).ok().flatten()?;
        let record: VertexRecord = bincode::deserialize(&bytes).ok()?;
        Some(record.into_vertex())
    }

    pub fn get_height(&self, hash: &Hash) -> Option<u64> {
        let bytes = self.vertices.get(hash).ok().flatten()?;
        let record: VertexRecord = bincode::deserialize(&bytes).ok()?;
        Some(record.height)
    }

    /// The milestone vertex at a main-chain height.
    pub fn get_milestone_at(&self, height: u64) -> Option<Arc<Vertex>> {
        let hash = self.milestones.get(height.to_be_bytes()).ok().flatten()?;
        let hash: Hash = hash.as_ref().try_into().ok()?;
        self.get_vertex(&hash)
    }

    /// True when the hash is a flushed main-chain milestone.
    pub fn is_milestone_in_db(&self, hash: &Hash) -> bool {
        match self.get_vertex(hash) {
            Some(v) if v.is_milestone => self
                .milestones
                .get(v.height.to_be_bytes())
                .ok()
                .flatten()
                .is_some_and(|stored| stored.as_ref() == hash),
            _ => false,
        }
    }

    /// Hashes of the level set at a height, milestone first.
    pub fn get_level_set_hashes_at(&self, height: u64) -> Option<Vec<Hash>> {
        let bytes = self.level_sets.get(height.to_be_bytes()).ok().flatten()?;
        bincode::deserialize(&bytes).ok()
    }

    pub fn get_level_set_blocks_at(&self, height: u64) -> Option<Vec<Arc<Block>>> {
        let hashes = self.get_level_set_hashes_at(height)?;
        hashes
            .iter()
            .map(|h| self.get_vertex(h).map(|v| Arc::clone(&v.block)))
            .collect()
    }

    pub fn get_level_set_vertices_at(&self, height: u64) -> Option<Vec<Arc<Vertex>>> {
        let hashes = self.get_level_set_hashes_at(height)?;
        hashes.iter().map(|h| self.get_vertex(h)).collect()
    }

    /// Serialized level set at a height: bincode of the vertex records with
    /// the milestone first. This is the bundle payload served to peers.
    pub fn get_raw_level_set_at(&self, height: u64) -> Option<Vec<u8>> {
        let hashes = self.get_level_set_hashes_at(height)?;
        let mut records = Vec::with_capacity(hashes.len());
        for h in &hashes {
            let bytes = self.vertices.get(h).ok().flatten()?;
            let record: VertexRecord = bincode::deserialize(&bytes).ok()?;
            records.push(record);
        }
        bincode::serialize(&records).ok()
    }

    /// Persist one level set. `vertices` arrives in the in-memory order
    /// (milestone LAST); the on-disk hash list is written milestone first.
    pub fn store_level_set(&self, vertices: &[Arc<Vertex>]) -> Result<(), StoreError> {
        let ms = vertices.last().ok_or(StoreError::EmptyLevelSet)?;
        debug_assert!(ms.is_milestone);
        let height = ms.height;

        for vertex in vertices {
            let record = VertexRecord::from_vertex(vertex);
            self.vertices.insert(vertex.hash, bincode::serialize(&record)?)?;
        }

        let mut hashes: Vec<Hash> = Vec::with_capacity(vertices.len());
        hashes.push(ms.hash);
        hashes.extend(vertices[..vertices.len() - 1].iter().map(|v| v.hash));
        self.level_sets
            .insert(height.to_be_bytes(), bincode::serialize(&hashes)?)?;
        self.milestones.insert(height.to_be_bytes(), &ms.hash[..])?;
        Ok(())
    }

    // ── Head metadata ──

    pub fn head_height(&self) -> u64 {
        self.meta
            .get(META_HEAD_HEIGHT)
            .ok()
            .flatten()
            .and_then(|b| b.as_ref().try_into().ok().map(u64::from_be_bytes))
            .unwrap_or(0)
    }

    pub fn save_head_height(&self, height: u64) -> Result<(), StoreError> {
        self.meta.insert(META_HEAD_HEIGHT, &height.to_be_bytes()[..])?;
        Ok(())
    }

    pub fn best_chain_work(&self) -> U256 {
        self.meta
            .get(META_BEST_CHAIN_WORK)
            .ok()
            .flatten()
            .map(|b| U256::from_big_endian(b.as_ref()))
            .unwrap_or_default()
    }

    pub fn save_best_chain_work(&self, work: U256) -> Result<(), StoreError> {
        self.meta
            .insert(META_BEST_CHAIN_WORK, &work.to_big_endian()[..])?;
        Ok(())
    }

    // ── UTXO table ──

    pub fn add_utxo(&self, key: &UtxoKey, utxo: &Utxo) -> Result<(), StoreError> {
        self.utxos.insert(key, bincode::serialize(utxo)?)?;
        Ok(())
    }

    pub fn remove_utxo(&self, key: &UtxoKey) -> Result<(), StoreError> {
        self.utxos.remove(key)?;
        Ok(())
    }

    pub fn get_utxo(&self, key: &UtxoKey) -> Option<Utxo> {
        let bytes = self.utxos.get(key).ok().flatten()?;
        bincode::deserialize(&bytes).ok()
    }

    pub fn utxo_exists(&self, key: &UtxoKey) -> bool {
        self.utxos.contains_key(key).unwrap_or(false)
    }

    // ── Registration table ──

    pub fn get_prev_redem_hash(&self, address: &Address) -> Option<Hash> {
        self.registrations
            .get(address)
            .ok()
            .flatten()
            .and_then(|b| b.as_ref().try_into().ok())
    }

    /// Apply a level set's registration rotations.
    pub fn update_prev_redem_hashes(&self, change: &RegChange) -> Result<(), StoreError> {
        for entry in change.iter() {
            if entry.updated == ZERO_HASH {
                self.registrations.remove(entry.address)?;
            } else {
                self.registrations.insert(entry.address, &entry.updated[..])?;
            }
        }
        Ok(())
    }

    /// Undo a level set's registration rotations.
    pub fn rollback_prev_redem_hashes(&self, change: &RegChange) -> Result<(), StoreError> {
        self.update_prev_redem_hashes(&change.inverse())
    }

    // ── Orphan container ──

    pub fn is_solid(&self, block: &Block) -> bool {
        block.parents().into_iter().all(|p| self.dag_exists(p))
    }

    pub fn is_weakly_solid(&self, block: &Block) -> bool {
        let obc = self.obc.lock();
        block
            .parents()
            .into_iter()
            .all(|p| self.dag_exists(p) || obc.contains(p))
    }

    pub fn any_link_is_orphan(&self, block: &Block) -> bool {
        self.obc.lock().any_link_is_orphan(block)
    }

    pub fn add_block_to_obc(&self, block: Arc<Block>, mask: u8) -> bool {
        self.obc.lock().add(block, mask)
    }

    /// Release every orphan unblocked by `hash` becoming available.
    pub fn release_blocks(&self, hash: &Hash) -> Vec<Arc<Block>> {
        self.obc.lock().release(hash)
    }

    pub fn enable_obc(&self) {
        let mut obc = self.obc.lock();
        if !obc.is_enabled() {
            tracing::info!("enabling orphan block container");
            obc.enable();
        }
    }

    pub fn disable_obc(&self) {
        let mut obc = self.obc.lock();
        if obc.is_enabled() {
            tracing::info!("disabling orphan block container");
            obc.disable();
        }
    }

    pub fn obc_enabled(&self) -> bool {
        self.obc.lock().is_enabled()
    }

    pub fn obc_len(&self) -> usize {
        self.obc.lock().len()
    }
}
