//! Per-block vertex metadata and milestone snapshots.
//!
//! A `Vertex` wraps an admitted block with the fields derived during
//! level-set verification. A `Milestone` is the chain-state summary sealed
//! at a milestone boundary; it holds weak references back to the vertices of
//! its level set (the vertex owns its snapshot, so the cycle never keeps
//! memory alive past a flush).

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use primitive_types::U256;
use serde::{Deserialize, Serialize};

use crate::block::Block;
use crate::transaction::{RegChange, Txoc};
use crate::{constants, pow, Hash};

/// Redemption state of a registration vertex.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum RedemptionStatus {
    /// The vertex carries no registration.
    None = 0,
    /// Registration not yet spent by a later redemption.
    NotYetRedeemed = 1,
    /// A later redemption spent this registration.
    Redeemed = 2,
}

/// Validity of a vertex's transaction set, decided at sealing time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum TxValidity {
    Unknown = 0,
    Valid = 1,
    /// Transactions were rejected (bad inputs or sortition violation); the
    /// vertex itself remains sealed.
    Invalid = 2,
}

/// A block plus the metadata derived when its level set was verified.
///
/// All fields are fixed at sealing except the redemption status, which flips
/// in place when a later level set redeems this vertex's registration.
#[derive(Debug)]
pub struct Vertex {
    pub block: Arc<Block>,
    /// Content hash of the block, cached at construction.
    pub hash: Hash,
    /// Height of the milestone sealing this vertex (its own height if it is
    /// a milestone).
    pub height: u64,
    /// Position on the miner's own chain (prev-parent edges), genesis = 0.
    pub miner_chain_height: u64,
    /// Mining reward accumulated along the miner chain up to this vertex.
    pub cumulative_reward: u64,
    /// Total fee of the vertex's valid transactions.
    pub fee: u64,
    pub is_milestone: bool,
    redeemed: AtomicU8,
    validity: AtomicU8,
    /// Present iff `is_milestone`.
    pub snapshot: Option<Arc<Milestone>>,
}

impl Vertex {
    /// A sealed non-milestone vertex.
    pub fn new(
        block: Arc<Block>,
        height: u64,
        miner_chain_height: u64,
        cumulative_reward: u64,
        fee: u64,
        redeemed: RedemptionStatus,
        validity: TxValidity,
    ) -> Self {
        let hash = block.hash();
        Vertex {
            block,
            hash,
            height,
            miner_chain_height,
            cumulative_reward,
            fee,
            is_milestone: false,
            redeemed: AtomicU8::new(redeemed as u8),
            validity: AtomicU8::new(validity as u8),
            snapshot: None,
        }
    }

    /// The milestone parent referenced by the contained block.
    pub fn milestone_hash(&self) -> Hash {
        self.block.milestone_parent
    }

    pub fn redemption_status(&self) -> RedemptionStatus {
        match self.redeemed.load(Ordering::Acquire) {
            1 => RedemptionStatus::NotYetRedeemed,
            2 => RedemptionStatus::Redeemed,
            _ => RedemptionStatus::None,
        }
    }

    /// Flip an unredeemed registration to redeemed. Called when a later
    /// level set spends this vertex's registration output.
    pub fn mark_redeemed(&self) {
        self.redeemed
            .store(RedemptionStatus::Redeemed as u8, Ordering::Release);
    }

    pub fn tx_validity(&self) -> TxValidity {
        match self.validity.load(Ordering::Acquire) {
            1 => TxValidity::Valid,
            2 => TxValidity::Invalid,
            _ => TxValidity::Unknown,
        }
    }

    /// Number of valid transactions carried by this vertex.
    pub fn valid_tx_count(&self) -> usize {
        match self.tx_validity() {
            TxValidity::Valid => self.block.transactions.len(),
            _ => 0,
        }
    }

    /// A milestone vertex carrying its freshly-computed snapshot.
    ///
    /// `sealed` lists the level set's non-milestone vertices in sealing
    /// order; the milestone's own weak reference is appended last.
    #[allow(clippy::too_many_arguments)]
    pub fn new_milestone(
        block: Arc<Block>,
        height: u64,
        miner_chain_height: u64,
        cumulative_reward: u64,
        fee: u64,
        redeemed: RedemptionStatus,
        validity: TxValidity,
        sealed: Vec<Weak<Vertex>>,
        seed: MilestoneSeed,
    ) -> Arc<Vertex> {
        let hash = block.hash();
        let ms_time = block.time;
        Arc::new_cyclic(|weak_self: &Weak<Vertex>| {
            let mut level_set = sealed;
            level_set.push(weak_self.clone());
            Vertex {
                block,
                hash,
                height,
                miner_chain_height,
                cumulative_reward,
                fee,
                is_milestone: true,
                redeemed: AtomicU8::new(redeemed as u8),
                validity: AtomicU8::new(validity as u8),
                snapshot: Some(Arc::new(Milestone {
                    height,
                    chainwork: seed.chainwork,
                    block_target: seed.block_target,
                    milestone_target: seed.milestone_target,
                    hash_rate: seed.hash_rate,
                    reg_change: seed.reg_change,
                    txoc: seed.txoc,
                    ms_hash: hash,
                    ms_time,
                    level_set,
                    stored: AtomicBool::new(false),
                })),
            }
        })
    }

    /// The genesis vertex: milestone zero, sealed and stored by definition.
    pub fn genesis() -> Arc<Vertex> {
        let block = Arc::new(Block::genesis());
        let hash = block.hash();
        let target = block.target();
        Arc::new_cyclic(|weak_self: &Weak<Vertex>| {
            let snapshot = Milestone {
                height: 0,
                chainwork: pow::block_work(target),
                block_target: target,
                milestone_target: pow::milestone_target(target, constants::MILESTONE_TARGET_SHIFT),
                hash_rate: 0,
                reg_change: RegChange::default(),
                txoc: Txoc::default(),
                ms_hash: hash,
                ms_time: block.time,
                level_set: vec![weak_self.clone()],
                stored: AtomicBool::new(true),
            };
            Vertex {
                block,
                hash,
                height: 0,
                miner_chain_height: 0,
                cumulative_reward: 0,
                fee: 0,
                is_milestone: true,
                redeemed: AtomicU8::new(RedemptionStatus::NotYetRedeemed as u8),
                validity: AtomicU8::new(TxValidity::Valid as u8),
                snapshot: Some(Arc::new(snapshot)),
            }
        })
    }
}

/// Snapshot inputs computed by the chain before the milestone vertex exists.
#[derive(Debug)]
pub struct MilestoneSeed {
    pub chainwork: U256,
    pub block_target: U256,
    pub milestone_target: U256,
    pub hash_rate: u64,
    pub reg_change: RegChange,
    pub txoc: Txoc,
}

/// Chain-state summary sealed by one milestone.
#[derive(Debug)]
pub struct Milestone {
    pub height: u64,
    /// Cumulative proof-of-work of the chain up to this milestone.
    pub chainwork: U256,
    /// Difficulty target every block under the next milestone must declare.
    pub block_target: U256,
    /// Stricter bound a proof hash must meet to become a milestone.
    pub milestone_target: U256,
    /// Estimated network hash rate at this boundary.
    pub hash_rate: u64,
    /// Registration rotations sealed by this level set.
    pub reg_change: RegChange,
    /// UTXO delta of this level set, kept until the flush purge.
    pub txoc: Txoc,
    /// Hash of the milestone block.
    pub ms_hash: Hash,
    /// Timestamp of the milestone block.
    pub ms_time: u64,
    /// The sealed vertices; the milestone vertex itself is last.
    pub(crate) level_set: Vec<Weak<Vertex>>,
    pub(crate) stored: AtomicBool,
}

impl Milestone {
    /// Weak references to the sealed vertices, milestone vertex last.
    /// Upgrades fail only after the level set has been flushed; callers then
    /// read from the Store instead.
    pub fn level_set(&self) -> &[Weak<Vertex>] {
        &self.level_set
    }

    /// Upgraded level set; empty entries are skipped.
    pub fn level_set_vertices(&self) -> Vec<Arc<Vertex>> {
        self.level_set.iter().filter_map(Weak::upgrade).collect()
    }

    pub fn level_set_size(&self) -> usize {
        self.level_set.len()
    }

    pub fn stored(&self) -> bool {
        self.stored.load(Ordering::Acquire)
    }

    /// Transition `stored` false→true. Returns false when already stored,
    /// making the flush idempotent.
    pub fn mark_stored(&self) -> bool {
        !self.stored.swap(true, Ordering::AcqRel)
    }

    /// Number of valid transactions across the level set.
    pub fn valid_tx_count(&self) -> usize {
        self.level_set
            .iter()
            .filter_map(Weak::upgrade)
            .map(|v| v.valid_tx_count())
            .sum()
    }
}

/// Serialized form of a vertex for the Store (and bundle payloads).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VertexRecord {
    pub block: Block,
    pub height: u64,
    pub miner_chain_height: u64,
    pub cumulative_reward: u64,
    pub fee: u64,
    pub is_milestone: bool,
    pub redeemed: RedemptionStatus,
    pub validity: TxValidity,
    pub snapshot: Option<MilestoneRecord>,
}

/// Serialized form of a milestone snapshot; the level set is kept as hashes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MilestoneRecord {
    pub height: u64,
    pub chainwork: U256,
    pub block_target: U256,
    pub milestone_target: U256,
    pub hash_rate: u64,
    pub reg_change: RegChange,
    pub ms_hash: Hash,
    pub ms_time: u64,
    pub level_set: Vec<Hash>,
}

impl VertexRecord {
    pub fn from_vertex(vertex: &Vertex) -> Self {
        VertexRecord {
            block: (*vertex.block).clone(),
            height: vertex.height,
            miner_chain_height: vertex.miner_chain_height,
            cumulative_reward: vertex.cumulative_reward,
            fee: vertex.fee,
            is_milestone: vertex.is_milestone,
            redeemed: vertex.redemption_status(),
            validity: vertex.tx_validity(),
            snapshot: vertex.snapshot.as_deref().map(MilestoneRecord::from_milestone),
        }
    }

    /// Rebuild an in-memory vertex. The snapshot's level set comes back with
    /// dead weak references; readers of flushed milestones use the hash list
    /// on the record and fetch vertices from the Store.
    pub fn into_vertex(self) -> Arc<Vertex> {
        let block = Arc::new(self.block);
        let hash = block.hash();
        if self.is_milestone {
            let record = self.snapshot.expect("milestone record carries a snapshot");
            Arc::new_cyclic(|weak_self: &Weak<Vertex>| {
                let mut level_set: Vec<Weak<Vertex>> = Vec::with_capacity(record.level_set.len());
                for _ in 0..record.level_set.len().saturating_sub(1) {
                    level_set.push(Weak::new());
                }
                level_set.push(weak_self.clone());
                Vertex {
                    block,
                    hash,
                    height: self.height,
                    miner_chain_height: self.miner_chain_height,
                    cumulative_reward: self.cumulative_reward,
                    fee: self.fee,
                    is_milestone: true,
                    redeemed: AtomicU8::new(self.redeemed as u8),
                    validity: AtomicU8::new(self.validity as u8),
                    snapshot: Some(Arc::new(Milestone {
                        height: record.height,
                        chainwork: record.chainwork,
                        block_target: record.block_target,
                        milestone_target: record.milestone_target,
                        hash_rate: record.hash_rate,
                        reg_change: record.reg_change,
                        txoc: Txoc::default(),
                        ms_hash: record.ms_hash,
                        ms_time: record.ms_time,
                        level_set,
                        stored: AtomicBool::new(true),
                    })),
                }
            })
        } else {
            Arc::new(Vertex {
                block,
                hash,
                height: self.height,
                miner_chain_height: self.miner_chain_height,
                cumulative_reward: self.cumulative_reward,
                fee: self.fee,
                is_milestone: false,
                redeemed: AtomicU8::new(self.redeemed as u8),
                validity: AtomicU8::new(self.validity as u8),
                snapshot: None,
            })
        }
    }
}

impl MilestoneRecord {
    pub fn from_milestone(ms: &Milestone) -> Self {
        MilestoneRecord {
            height: ms.height,
            chainwork: ms.chainwork,
            block_target: ms.block_target,
            milestone_target: ms.milestone_target,
            hash_rate: ms.hash_rate,
            reg_change: ms.reg_change.clone(),
            ms_hash: ms.ms_hash,
            ms_time: ms.ms_time,
            level_set: ms
                .level_set
                .iter()
                .filter_map(|w| w.upgrade().map(|v| v.hash))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn genesis_vertex_closes_its_own_level_set() {
        let genesis = Vertex::genesis();
        let snapshot = genesis.snapshot.as_ref().unwrap();
        assert_eq!(snapshot.height, 0);
        assert!(snapshot.stored());
        let lvs = snapshot.level_set_vertices();
        assert_eq!(lvs.len(), 1);
        assert_eq!(lvs[0].hash, genesis.hash);
    }

    #[test]
    fn mark_stored_is_monotonic() {
        let genesis = Vertex::genesis();
        let snapshot = genesis.snapshot.as_ref().unwrap();
        // Genesis starts stored; a second transition reports false.
        assert!(!snapshot.mark_stored());
    }

    #[test]
    fn redemption_flips_in_place() {
        let block = Arc::new(Block::genesis());
        let vertex = Vertex::new(
            block,
            1,
            1,
            1,
            0,
            RedemptionStatus::NotYetRedeemed,
            TxValidity::Valid,
        );
        assert_eq!(vertex.redemption_status(), RedemptionStatus::NotYetRedeemed);
        vertex.mark_redeemed();
        assert_eq!(vertex.redemption_status(), RedemptionStatus::Redeemed);
    }

    #[test]
    fn vertex_record_round_trip() {
        let genesis = Vertex::genesis();
        let record = VertexRecord::from_vertex(&genesis);
        let bytes = bincode::serialize(&record).unwrap();
        let back: VertexRecord = bincode::deserialize(&bytes).unwrap();
        let restored = back.into_vertex();
        assert_eq!(restored.hash, genesis.hash);
        assert!(restored.is_milestone);
        let snapshot = restored.snapshot.as_ref().unwrap();
        assert_eq!(snapshot.chainwork, genesis.snapshot.as_ref().unwrap().chainwork);
    }
}
