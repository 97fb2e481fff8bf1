//! Orphan Block Container: parking for blocks whose parents have not landed.
//!
//! Each entry carries a 3-bit mask of which parents are missing. An inverted
//! index from missing-parent hash to waiting children lets a newly-arrived
//! block release everything it unblocks in one pass. Released blocks are
//! re-submitted to the verifier, which releases their own children in turn,
//! so cascades need no recursion here.

use std::collections::HashMap;
use std::sync::Arc;

use crate::block::Block;
use crate::Hash;

/// Mask bit: milestone parent missing.
pub const MASK_MILESTONE: u8 = 1 << 0;
/// Mask bit: tip parent missing.
pub const MASK_TIP: u8 = 1 << 1;
/// Mask bit: prev parent missing.
pub const MASK_PREV: u8 = 1 << 2;

#[derive(Debug)]
struct ObcEntry {
    block: Arc<Block>,
    mask: u8,
    /// Insertion sequence, fixing the release order.
    seq: u64,
}

/// The orphan block container.
///
/// Not synchronized internally; the Store serializes access.
#[derive(Debug, Default)]
pub struct OrphanBlockContainer {
    entries: HashMap<Hash, ObcEntry>,
    /// missing parent hash -> hashes of children waiting on it
    waiting: HashMap<Hash, Vec<Hash>>,
    enabled: bool,
    next_seq: u64,
}

impl OrphanBlockContainer {
    pub fn new() -> Self {
        OrphanBlockContainer {
            enabled: true,
            ..Default::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    /// Disable orphan collection. Entries already parked stay until released.
    pub fn disable(&mut self) {
        self.enabled = false;
    }

    /// Park a block with its missing-parent mask. Returns false when the
    /// container is disabled (the block is dropped) or the mask is empty.
    pub fn add(&mut self, block: Arc<Block>, mask: u8) -> bool {
        if !self.enabled || mask == 0 {
            return false;
        }
        let hash = block.hash();
        if self.entries.contains_key(&hash) {
            return true;
        }
        for (bit, parent) in [
            (MASK_MILESTONE, block.milestone_parent),
            (MASK_TIP, block.tip_parent),
            (MASK_PREV, block.prev_parent),
        ] {
            if mask & bit != 0 {
                let children = self.waiting.entry(parent).or_default();
                if !children.contains(&hash) {
                    children.push(hash);
                }
            }
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(hash, ObcEntry { block, mask, seq });
        true
    }

    /// A newly-available parent clears its bit on every waiting child; the
    /// children whose masks reach zero are removed and returned in insertion
    /// order, ready for re-submission to the verifier.
    pub fn release(&mut self, parent: &Hash) -> Vec<Arc<Block>> {
        let Some(children) = self.waiting.remove(parent) else {
            return vec![];
        };
        let mut ready: Vec<(u64, Arc<Block>)> = Vec::new();
        for child in children {
            let Some(entry) = self.entries.get_mut(&child) else {
                continue;
            };
            if entry.block.milestone_parent == *parent {
                entry.mask &= !MASK_MILESTONE;
            }
            if entry.block.tip_parent == *parent {
                entry.mask &= !MASK_TIP;
            }
            if entry.block.prev_parent == *parent {
                entry.mask &= !MASK_PREV;
            }
            if entry.mask == 0 {
                let entry = self.entries.remove(&child).unwrap();
                ready.push((entry.seq, entry.block));
            }
        }
        ready.sort_by_key(|(seq, _)| *seq);
        ready.into_iter().map(|(_, block)| block).collect()
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.entries.contains_key(hash)
    }

    /// True when any of the block's parents is itself parked here.
    pub fn any_link_is_orphan(&self, block: &Block) -> bool {
        block.parents().into_iter().any(|p| self.entries.contains_key(p))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.waiting.clear();
    }
}
