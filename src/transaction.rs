//! Transactions, UTXOs, and the per-block output-change sets.
//!
//! Three transaction forms exist on the DAG:
//! - **First registration** — the single way a new account enters the miner
//!   chain: one synthetic input pointing at the null outpoint, one zero-value
//!   output naming the account.
//! - **Redemption** — rotates an account's registration: spends the account's
//!   current unredeemed registration output and creates the next one,
//!   collecting accumulated mining reward in the process.
//! - **Payment** — ordinary value transfer; inputs reference unspent outputs
//!   visible on the verifying branch.
//!
//! Signature contents are opaque to the engine; the external signature scheme
//! authenticates them before blocks reach consensus.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::{Hash, ZERO_HASH};

/// Account identifier: fingerprint of the account's verification key.
pub type Address = Hash;

/// Key of a transaction output in the ledger.
pub type UtxoKey = Hash;

/// Output-index sentinel marking registration outpoints.
pub const UNCONNECTED: u32 = u32::MAX;

/// Reference to a transaction output by block position.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxOutPoint {
    pub block_hash: Hash,
    pub tx_index: u32,
    pub out_index: u32,
}

impl TxOutPoint {
    pub fn new(block_hash: Hash, tx_index: u32, out_index: u32) -> Self {
        TxOutPoint {
            block_hash,
            tx_index,
            out_index,
        }
    }

    /// The registration outpoint of a block: spends the block's registration
    /// output regardless of transaction position.
    pub fn registration(block_hash: Hash) -> Self {
        TxOutPoint {
            block_hash,
            tx_index: 0,
            out_index: UNCONNECTED,
        }
    }

    pub fn is_registration(&self) -> bool {
        self.out_index == UNCONNECTED
    }

    /// Ledger key of the referenced output.
    pub fn key(&self) -> UtxoKey {
        utxo_key(&self.block_hash, self.tx_index, self.out_index)
    }
}

/// Fold a block position into a ledger key.
///
/// XORs the index words into the tail of the block hash, keeping keys cheap
/// to derive in both directions of a flush.
pub fn utxo_key(block_hash: &Hash, tx_index: u32, out_index: u32) -> UtxoKey {
    let mut key = *block_hash;
    let tx = tx_index.to_le_bytes();
    let out = out_index.to_le_bytes();
    for i in 0..4 {
        key[24 + i] ^= tx[i];
        key[28 + i] ^= out[i];
    }
    key
}

/// A transaction input: outpoint plus opaque authorization data.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    pub outpoint: TxOutPoint,
    pub signature: Vec<u8>,
}

impl TxInput {
    pub fn new(outpoint: TxOutPoint, signature: Vec<u8>) -> Self {
        TxInput { outpoint, signature }
    }
}

/// A transaction output: value bound to an account.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub value: u64,
    pub address: Address,
}

impl TxOutput {
    pub fn new(value: u64, address: Address) -> Self {
        TxOutput { value, address }
    }
}

/// Transaction structure errors.
#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum TxError {
    #[error("transaction has no outputs")]
    NoOutputs,
    #[error("transaction has no inputs")]
    NoInputs,
    #[error("duplicate outpoint within transaction")]
    DuplicateOutpoint,
    #[error("registration transaction must have exactly one input and one output")]
    MalformedRegistration,
    #[error("first registration output must carry zero value")]
    NonZeroRegistrationValue,
}

/// A transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
}

impl Transaction {
    pub fn new(inputs: Vec<TxInput>, outputs: Vec<TxOutput>) -> Self {
        Transaction { inputs, outputs }
    }

    /// The first-registration transaction for `address`.
    pub fn first_registration(address: Address) -> Self {
        Transaction {
            inputs: vec![TxInput::new(TxOutPoint::registration(ZERO_HASH), vec![])],
            outputs: vec![TxOutput::new(0, address)],
        }
    }

    /// A redemption spending the registration output of `prev_reg_block`,
    /// collecting `reward` and re-registering under `address`.
    pub fn redemption(prev_reg_block: Hash, reward: u64, address: Address, signature: Vec<u8>) -> Self {
        Transaction {
            inputs: vec![TxInput::new(TxOutPoint::registration(prev_reg_block), signature)],
            outputs: vec![TxOutput::new(reward, address)],
        }
    }

    /// Content hash of the transaction.
    pub fn hash(&self) -> Hash {
        let bytes = bincode::serialize(self).expect("transaction serialization is infallible");
        crate::hash_domain(b"braid.transaction", &bytes)
    }

    /// True for a registration in either form (first or redemption).
    pub fn is_registration(&self) -> bool {
        self.inputs.len() == 1 && self.outputs.len() == 1 && self.inputs[0].outpoint.is_registration()
    }

    /// True for the synthetic registration that introduces a new account.
    pub fn is_first_registration(&self) -> bool {
        self.is_registration() && self.inputs[0].outpoint.block_hash == ZERO_HASH
    }

    /// True for a redemption of an existing registration.
    pub fn is_redemption(&self) -> bool {
        self.is_registration() && self.inputs[0].outpoint.block_hash != ZERO_HASH
    }

    /// Structural validation, independent of any ledger state.
    pub fn validate_structure(&self) -> Result<(), TxError> {
        if self.outputs.is_empty() {
            return Err(TxError::NoOutputs);
        }
        if self.inputs.is_empty() {
            return Err(TxError::NoInputs);
        }
        let unique: HashSet<_> = self.inputs.iter().map(|i| i.outpoint).collect();
        if unique.len() != self.inputs.len() {
            return Err(TxError::DuplicateOutpoint);
        }
        if self.inputs.iter().any(|i| i.outpoint.is_registration()) {
            if !self.is_registration() {
                return Err(TxError::MalformedRegistration);
            }
            if self.is_first_registration() && self.outputs[0].value != 0 {
                return Err(TxError::NonZeroRegistrationValue);
            }
        }
        Ok(())
    }

    pub fn output_value(&self) -> u64 {
        self.outputs.iter().map(|o| o.value).sum()
    }
}

/// An unspent transaction output pinned to its block position.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub output: TxOutput,
    pub block_hash: Hash,
    pub tx_index: u32,
    pub out_index: u32,
}

impl Utxo {
    pub fn new(output: TxOutput, block_hash: Hash, tx_index: u32, out_index: u32) -> Self {
        Utxo {
            output,
            block_hash,
            tx_index,
            out_index,
        }
    }

    pub fn key(&self) -> UtxoKey {
        utxo_key(&self.block_hash, self.tx_index, self.out_index)
    }

    pub fn value(&self) -> u64 {
        self.output.value
    }
}

/// Transaction-output changeset: outputs created and outputs spent.
///
/// Produced per block during level-set verification and merged into the
/// level-set delta handed to the flush pipeline. Spent entries keep their
/// full output values so a fork rollback can reinstate them.
#[derive(Clone, Debug, Default)]
pub struct Txoc {
    created: HashMap<UtxoKey, Utxo>,
    spent: HashMap<UtxoKey, Utxo>,
}

impl Txoc {
    pub fn add_created(&mut self, utxo: Utxo) {
        self.created.insert(utxo.key(), utxo);
    }

    pub fn add_spent(&mut self, utxo: Utxo) {
        let key = utxo.key();
        // An output created and spent within the same changeset cancels out.
        if self.created.remove(&key).is_none() {
            self.spent.insert(key, utxo);
        }
    }

    pub fn merge(&mut self, other: Txoc) {
        for (_, utxo) in other.created {
            self.add_created(utxo);
        }
        for (_, utxo) in other.spent {
            self.add_spent(utxo);
        }
    }

    pub fn created(&self) -> &HashMap<UtxoKey, Utxo> {
        &self.created
    }

    pub fn spent(&self) -> &HashMap<UtxoKey, Utxo> {
        &self.spent
    }

    pub fn spent_keys(&self) -> HashSet<UtxoKey> {
        self.spent.keys().copied().collect()
    }

    pub fn contains_spent(&self, key: &UtxoKey) -> bool {
        self.spent.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.spent.is_empty()
    }
}

/// One account's registration rotation within a level set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegEntry {
    pub address: Address,
    /// Registration hash before this level set; `ZERO_HASH` for a first
    /// registration.
    pub previous: Hash,
    /// Registration hash after this level set.
    pub updated: Hash,
}

/// Registration deltas sealed by a milestone.
///
/// Applying a `RegChange` and then its [`inverse`](RegChange::inverse) leaves
/// the registration table unchanged.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegChange {
    entries: Vec<RegEntry>,
}

impl RegChange {
    pub fn add(&mut self, address: Address, previous: Hash, updated: Hash) {
        self.entries.push(RegEntry {
            address,
            previous,
            updated,
        });
    }

    pub fn inverse(&self) -> RegChange {
        let entries = self
            .entries
            .iter()
            .rev()
            .map(|e| RegEntry {
                address: e.address,
                previous: e.updated,
                updated: e.previous,
            })
            .collect();
        RegChange { entries }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, RegEntry> {
        self.entries.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(tag: u8) -> Address {
        [tag; 32]
    }

    #[test]
    fn first_registration_shape() {
        let tx = Transaction::first_registration(addr(1));
        assert!(tx.is_registration());
        assert!(tx.is_first_registration());
        assert!(!tx.is_redemption());
        tx.validate_structure().unwrap();
    }

    #[test]
    fn redemption_shape() {
        let tx = Transaction::redemption([7u8; 32], 42, addr(1), vec![1, 2, 3]);
        assert!(tx.is_redemption());
        assert!(!tx.is_first_registration());
        tx.validate_structure().unwrap();
    }

    #[test]
    fn first_registration_rejects_value() {
        let mut tx = Transaction::first_registration(addr(1));
        tx.outputs[0].value = 5;
        assert_eq!(
            tx.validate_structure(),
            Err(TxError::NonZeroRegistrationValue)
        );
    }

    #[test]
    fn duplicate_outpoint_rejected() {
        let op = TxOutPoint::new([3u8; 32], 0, 0);
        let tx = Transaction::new(
            vec![TxInput::new(op, vec![]), TxInput::new(op, vec![])],
            vec![TxOutput::new(1, addr(2))],
        );
        assert_eq!(tx.validate_structure(), Err(TxError::DuplicateOutpoint));
    }

    #[test]
    fn utxo_key_distinguishes_indices() {
        let h = [9u8; 32];
        let a = utxo_key(&h, 0, 0);
        let b = utxo_key(&h, 0, 1);
        let c = utxo_key(&h, 1, 0);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(b, c);
    }

    #[test]
    fn txoc_created_then_spent_cancels() {
        let utxo = Utxo::new(TxOutput::new(3, addr(1)), [4u8; 32], 0, 0);
        let mut txoc = Txoc::default();
        txoc.add_created(utxo.clone());
        txoc.add_spent(utxo);
        assert!(txoc.is_empty());
    }

    #[test]
    fn txoc_merge_combines() {
        let mut a = Txoc::default();
        a.add_created(Utxo::new(TxOutput::new(3, addr(1)), [4u8; 32], 0, 0));
        let mut b = Txoc::default();
        b.add_spent(Utxo::new(TxOutput::new(5, addr(2)), [5u8; 32], 0, 0));
        a.merge(b);
        assert_eq!(a.created().len(), 1);
        assert_eq!(a.spent().len(), 1);
    }

    #[test]
    fn reg_change_inverse_round_trips() {
        let mut change = RegChange::default();
        change.add(addr(1), ZERO_HASH, [1u8; 32]);
        change.add(addr(2), [2u8; 32], [3u8; 32]);
        let inv = change.inverse();
        let double = inv.inverse();
        let original: Vec<_> = change.iter().cloned().collect();
        let round: Vec<_> = double.iter().rev().cloned().collect();
        // Double inversion restores entries (order reversed twice).
        assert_eq!(original.len(), round.len());
        for entry in &original {
            assert!(double.iter().any(|e| e == entry));
        }
    }
}
