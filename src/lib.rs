//! # Braid
//!
//! A proof-of-work cryptocurrency node organized around a block-DAG rather
//! than a linear chain:
//! - **Three parent edges per block** — milestone, prev (miner chain), tip
//! - **Milestone chains** — blocks whose proof meets a stricter target seal
//!   level-sets; multiple candidate chains coexist until work decides
//! - **Concurrent admission** — blocks arrive out of order from peers and are
//!   parked in an orphan container until their parents land
//! - **Level-set finality** — milestones confirmed by every live fork are
//!   flushed to durable storage and announced to listeners

pub mod block;
pub mod config;
pub mod consensus;
pub mod network;
pub mod peer;
pub mod pow;
pub mod store;
pub mod transaction;

/// Protocol constants
pub mod constants {
    /// Maximum height lag of a block's referenced milestone behind the best
    /// head. Doubles as the in-memory confirmation window: milestones deeper
    /// than this on the best chain become eligible for flushing.
    pub const PUNCTUALITY_THRESHOLD: u64 = 10;
    /// Fork chains whose head chainwork falls behind the milestone this many
    /// positions before the best head are deleted.
    pub const DELETE_FORK_THRESHOLD: usize = 5;
    /// Seconds before an outstanding GetInv/GetData task expires.
    pub const SYNC_TASK_TIMEOUT_SECS: u64 = 180;
    /// Maximum number of hashes per GetData message.
    pub const MAX_GET_DATA_SIZE: usize = 5;
    /// Locator length cap when widening after a fork mismatch.
    pub const MAX_GET_INV_LENGTH: usize = 500;
    /// Maximum number of hashes in a single Inv message.
    pub const MAX_INVENTORY_SIZE: usize = 1000;
    /// The orphan container is enabled only when the best milestone is at
    /// most this many seconds old; a node deep in sync drops orphans instead.
    pub const OBC_ENABLE_THRESHOLD_SECS: u64 = 300;
    /// Minimum miner-chain height before a block may carry transactions.
    pub const SORTITION_THRESHOLD: u64 = 2;
    /// Scales the hash-rate-dependent valid-distance bound.
    pub const SORTITION_COEFFICIENT: u64 = 100;
    /// Target seconds between milestones; input to the retarget schedule.
    pub const TARGET_MILESTONE_SPACING_SECS: u64 = 10;
    /// Milestone target = block target >> this shift.
    pub const MILESTONE_TARGET_SHIFT: usize = 5;
    /// Default locator length for an initial sync request.
    pub const INITIAL_LOCATOR_LENGTH: usize = 10;
    /// Maximum transactions per block.
    pub const MAX_BLOCK_TXS: usize = 128;
    /// Protocol version stamped into block headers.
    pub const BLOCK_VERSION: u32 = 1;
    /// Timestamp of the genesis block (fixed for all networks).
    pub const GENESIS_TIME: u64 = 1_650_000_000;
}

/// 32-byte hash used throughout the protocol
pub type Hash = [u8; 32];

/// The all-zero hash, used as the null parent sentinel of genesis.
pub const ZERO_HASH: Hash = [0u8; 32];

/// Compute a domain-separated BLAKE3 hash.
///
/// The domain MUST be valid UTF-8 (all braid domains use ASCII). Panics at
/// runtime if it is not; that is a programming error, not an input error.
pub fn hash_domain(domain: &[u8], data: &[u8]) -> Hash {
    let domain_str = std::str::from_utf8(domain).expect("hash_domain: domain must be valid UTF-8");
    let mut hasher = blake3::Hasher::new_derive_key(domain_str);
    hasher.update(data);
    *hasher.finalize().as_bytes()
}

/// Compute BLAKE3 hash of length-prefixed concatenated slices.
///
/// Each part is prefixed with its length as a little-endian u64, preventing
/// ambiguous concatenation (e.g., `["AB","C"]` vs `["A","BC"]`).
pub fn hash_concat(parts: &[&[u8]]) -> Hash {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}

/// Short hex prefix of a hash for log lines.
pub fn short_hash(h: &Hash) -> String {
    hex::encode(&h[..8])
}
