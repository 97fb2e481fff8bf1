//! Block model: the three-parent DAG unit.
//!
//! Every block references a milestone parent (the most recent milestone the
//! miner saw), a prev parent (the miner's own previous block), and a tip
//! parent (an arbitrary recent block, weaving the DAG together). Genesis is
//! the sole block whose parents are the null hash.

use primitive_types::U256;
use serde::{Deserialize, Serialize};

use crate::transaction::Transaction;
use crate::{constants, pow, Hash, ZERO_HASH};

/// Block structure errors.
#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum BlockError {
    #[error("block is missing a parent reference")]
    MissingParent,
    #[error("proof hash does not meet the declared target")]
    ProofOfWork,
    #[error("block has too many transactions")]
    TooManyTransactions,
    #[error("registration transaction must be first in the block")]
    RegistrationPosition,
    #[error("block carries more than one registration")]
    MultipleRegistrations,
    #[error("duplicate transaction in block")]
    DuplicateTransaction,
    #[error("first registration block must contain exactly one transaction")]
    MalformedFirstRegistration,
    #[error(transparent)]
    Transaction(#[from] crate::transaction::TxError),
}

/// A block in the DAG.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Block {
    pub version: u32,
    /// Hash of the most recent milestone known to the miner.
    pub milestone_parent: Hash,
    /// Hash of the miner's previous block on its own miner chain.
    pub prev_parent: Hash,
    /// Hash of a recent block chosen to weave the DAG.
    pub tip_parent: Hash,
    /// Unix seconds.
    pub time: u64,
    /// Compact encoding of the block difficulty target.
    pub bits: u32,
    pub nonce: u64,
    pub transactions: Vec<Transaction>,
}

impl PartialEq for Block {
    fn eq(&self, other: &Self) -> bool {
        self.hash() == other.hash()
    }
}

impl Eq for Block {}

impl Block {
    pub fn new(
        milestone_parent: Hash,
        prev_parent: Hash,
        tip_parent: Hash,
        time: u64,
        bits: u32,
    ) -> Self {
        Block {
            version: constants::BLOCK_VERSION,
            milestone_parent,
            prev_parent,
            tip_parent,
            time,
            bits,
            nonce: 0,
            transactions: vec![],
        }
    }

    /// The genesis block. Deterministic; its parents are the null hash and it
    /// registers the network's founding account.
    pub fn genesis() -> Block {
        let mut block = Block::new(
            ZERO_HASH,
            ZERO_HASH,
            ZERO_HASH,
            constants::GENESIS_TIME,
            pow::target_to_compact(pow::max_target()),
        );
        block.transactions = vec![Transaction::first_registration(crate::hash_domain(
            b"braid.genesis",
            b"founding-account",
        ))];
        block.solve();
        block
    }

    /// Merkle-style root over the block's transaction hashes.
    pub fn tx_root(&self) -> Hash {
        if self.transactions.is_empty() {
            return ZERO_HASH;
        }
        let hashes: Vec<Hash> = self.transactions.iter().map(|tx| tx.hash()).collect();
        let parts: Vec<&[u8]> = hashes.iter().map(|h| h.as_slice()).collect();
        crate::hash_concat(&parts)
    }

    /// Content hash of the block header; doubles as the proof hash.
    pub fn hash(&self) -> Hash {
        let tx_root = self.tx_root();
        crate::hash_domain(
            b"braid.block.header",
            &crate::hash_concat(&[
                &self.version.to_le_bytes(),
                &self.milestone_parent,
                &self.prev_parent,
                &self.tip_parent,
                &self.time.to_le_bytes(),
                &self.bits.to_le_bytes(),
                &self.nonce.to_le_bytes(),
                &tx_root,
            ]),
        )
    }

    /// The block's difficulty target decoded from compact form.
    pub fn target(&self) -> U256 {
        pow::compact_to_target(self.bits)
    }

    /// Expected work of this block's solve.
    pub fn work(&self) -> U256 {
        pow::block_work(self.target())
    }

    pub fn is_genesis(&self) -> bool {
        self.milestone_parent == ZERO_HASH
            && self.prev_parent == ZERO_HASH
            && self.tip_parent == ZERO_HASH
    }

    pub fn parents(&self) -> [&Hash; 3] {
        [&self.milestone_parent, &self.prev_parent, &self.tip_parent]
    }

    /// True when the block's only transaction introduces a new account.
    pub fn is_first_registration(&self) -> bool {
        self.transactions.len() == 1 && self.transactions[0].is_first_registration()
    }

    /// The block's registration transaction, if it carries one.
    pub fn registration(&self) -> Option<&Transaction> {
        self.transactions.first().filter(|tx| tx.is_registration())
    }

    /// Syntactic verification: parent presence, proof-of-work against the
    /// declared target, and transaction structure. Knows nothing about the
    /// DAG; contextual rules (difficulty, punctuality, solidity) are applied
    /// by the admission pipeline.
    pub fn verify(&self) -> Result<(), BlockError> {
        if !self.is_genesis()
            && (self.milestone_parent == ZERO_HASH
                || self.prev_parent == ZERO_HASH
                || self.tip_parent == ZERO_HASH)
        {
            return Err(BlockError::MissingParent);
        }

        if !pow::meets_target(&self.hash(), &self.target()) {
            return Err(BlockError::ProofOfWork);
        }

        if self.transactions.len() > constants::MAX_BLOCK_TXS {
            return Err(BlockError::TooManyTransactions);
        }

        let mut seen = std::collections::HashSet::new();
        let mut registrations = 0usize;
        for (i, tx) in self.transactions.iter().enumerate() {
            tx.validate_structure()?;
            if !seen.insert(tx.hash()) {
                return Err(BlockError::DuplicateTransaction);
            }
            if tx.is_registration() {
                registrations += 1;
                if i != 0 {
                    return Err(BlockError::RegistrationPosition);
                }
            }
            if tx.is_first_registration() && self.transactions.len() != 1 {
                return Err(BlockError::MalformedFirstRegistration);
            }
        }
        if registrations > 1 {
            return Err(BlockError::MultipleRegistrations);
        }

        Ok(())
    }

    /// Grind the nonce until the proof hash meets the block target.
    pub fn solve(&mut self) {
        let target = self.target();
        while !pow::meets_target(&self.hash(), &target) {
            self.nonce = self.nonce.wrapping_add(1);
        }
    }

    /// Grind the nonce until the proof hash meets `target` (used to mint
    /// milestone candidates, whose bound is stricter than the block target).
    pub fn solve_to(&mut self, target: &U256) {
        while !pow::meets_target(&self.hash(), target) {
            self.nonce = self.nonce.wrapping_add(1);
        }
    }
}

/// Hash of the genesis block, computed once.
pub fn genesis_hash() -> Hash {
    static HASH: std::sync::OnceLock<Hash> = std::sync::OnceLock::new();
    *HASH.get_or_init(|| Block::genesis().hash())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::{Transaction, TxInput, TxOutPoint, TxOutput};

    #[test]
    fn genesis_is_deterministic() {
        assert_eq!(Block::genesis().hash(), Block::genesis().hash());
        assert_eq!(Block::genesis().hash(), genesis_hash());
        assert!(Block::genesis().is_genesis());
        assert!(Block::genesis().is_first_registration());
    }

    #[test]
    fn genesis_verifies() {
        Block::genesis().verify().unwrap();
    }

    #[test]
    fn solved_block_verifies() {
        let g = genesis_hash();
        let mut block = Block::new(g, g, g, constants::GENESIS_TIME + 1, Block::genesis().bits);
        block.solve();
        block.verify().unwrap();
    }

    #[test]
    fn missing_parent_rejected() {
        let g = genesis_hash();
        let mut block = Block::new(g, ZERO_HASH, g, constants::GENESIS_TIME + 1, Block::genesis().bits);
        block.solve();
        assert_eq!(block.verify(), Err(BlockError::MissingParent));
    }

    #[test]
    fn unsolved_block_rejected() {
        let g = genesis_hash();
        // A target of 1 is unmeetable without astronomic luck; nonce 0 won't do.
        let block = Block::new(g, g, g, constants::GENESIS_TIME + 1, pow::target_to_compact(1.into()));
        assert_eq!(block.verify(), Err(BlockError::ProofOfWork));
    }

    #[test]
    fn registration_must_lead_the_block() {
        let g = genesis_hash();
        let mut block = Block::new(g, g, g, constants::GENESIS_TIME + 1, Block::genesis().bits);
        block.transactions = vec![
            Transaction::new(
                vec![TxInput::new(TxOutPoint::new([1u8; 32], 0, 0), vec![1])],
                vec![TxOutput::new(1, [2u8; 32])],
            ),
            Transaction::redemption([3u8; 32], 0, [4u8; 32], vec![1]),
        ];
        block.solve();
        assert_eq!(block.verify(), Err(BlockError::RegistrationPosition));
    }

    #[test]
    fn first_registration_must_be_alone() {
        let g = genesis_hash();
        let mut block = Block::new(g, g, g, constants::GENESIS_TIME + 1, Block::genesis().bits);
        block.transactions = vec![
            Transaction::first_registration([1u8; 32]),
            Transaction::new(
                vec![TxInput::new(TxOutPoint::new([1u8; 32], 0, 0), vec![1])],
                vec![TxOutput::new(1, [2u8; 32])],
            ),
        ];
        block.solve();
        assert_eq!(block.verify(), Err(BlockError::MalformedFirstRegistration));
    }
}
