//! A candidate milestone branch: pending blocks, the milestone deque, the
//! branch-local UTXO ledger, and level-set verification.
//!
//! Verification computes everything into locals and commits only after the
//! whole level set checks out, so a failed `verify` leaves the chain exactly
//! as it was. Forking copies the shared milestone prefix (`Arc` clones) and
//! rolls the divergent suffix back into the pending set.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::RwLock;
use primitive_types::U256;

use crate::block::Block;
use crate::config::ConsensusParams;
use crate::consensus::vertex::{
    Milestone, MilestoneSeed, RedemptionStatus, TxValidity, Vertex,
};
use crate::store::BlockStore;
use crate::transaction::{utxo_key, Address, RegChange, Txoc, Utxo, UtxoKey};
use crate::{pow, short_hash, Hash, ZERO_HASH};

/// Errors from level-set verification.
#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum VerifyError {
    #[error("candidate does not reference this chain's head milestone")]
    WrongMilestoneParent,
    #[error("missing dependency vertex {}", short_hash(.0))]
    MissingDependency(Hash),
    #[error("fork milestone {} unknown to the parent chain and the store", short_hash(.0))]
    UnknownForkPoint(Hash),
    #[error("no milestone found at store head height {0}")]
    MissingHeadMilestone(u64),
}

/// Branch-local UTXO ledger: deltas accumulated since the last flush.
#[derive(Clone, Debug, Default)]
pub struct ChainLedger {
    /// Candidate outputs of admitted-but-unsealed blocks.
    pending: HashMap<UtxoKey, Utxo>,
    /// Outputs created by sealed level sets on this branch.
    confirmed: HashMap<UtxoKey, Utxo>,
    /// Outputs spent by sealed level sets on this branch.
    removed: HashMap<UtxoKey, Utxo>,
}

impl ChainLedger {
    pub fn add_pending(&mut self, utxos: &[Utxo]) {
        for utxo in utxos {
            self.pending.insert(utxo.key(), utxo.clone());
        }
    }

    pub fn confirmed_get(&self, key: &UtxoKey) -> Option<&Utxo> {
        self.confirmed.get(key)
    }

    pub fn is_removed(&self, key: &UtxoKey) -> bool {
        self.removed.contains_key(key)
    }

    /// Apply a sealed level set's changeset.
    fn seal(&mut self, txoc: &Txoc) {
        for (key, utxo) in txoc.created() {
            self.pending.remove(key);
            self.confirmed.insert(*key, utxo.clone());
        }
        for (key, utxo) in txoc.spent() {
            self.confirmed.remove(key);
            self.removed.insert(*key, utxo.clone());
        }
    }

    /// Drop pending candidates of sealed blocks (sealed outputs live in
    /// `confirmed` or were rejected with their block's transactions).
    fn discard_pending(&mut self, keys: impl Iterator<Item = UtxoKey>) {
        for key in keys {
            self.pending.remove(&key);
        }
    }

    /// Forget a flushed level set's changeset (the store holds it now).
    fn purge_flushed(&mut self, txoc: &Txoc) {
        for key in txoc.created().keys() {
            self.confirmed.remove(key);
            self.pending.remove(key);
        }
        for key in txoc.spent().keys() {
            self.removed.remove(key);
        }
    }

    /// Undo a sealed level set's changeset (fork rollback).
    fn rollback(&mut self, txoc: &Txoc) {
        for key in txoc.created().keys() {
            self.confirmed.remove(key);
        }
        for (key, utxo) in txoc.spent() {
            self.removed.remove(key);
            self.confirmed.insert(*key, utxo.clone());
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn confirmed_len(&self) -> usize {
        self.confirmed.len()
    }
}

/// One candidate branch of milestones.
pub struct Chain {
    params: ConsensusParams,
    store: Arc<BlockStore>,
    /// Admitted blocks not yet sealed by a milestone on this branch.
    pending: RwLock<HashMap<Hash, Arc<Block>>>,
    /// Oldest in-memory milestone at the front.
    milestones: RwLock<VecDeque<Arc<Milestone>>>,
    /// Sealed-but-unflushed vertices on this branch.
    verified: RwLock<HashMap<Hash, Arc<Vertex>>>,
    ledger: RwLock<ChainLedger>,
    /// Branch view of the registration table; `ZERO_HASH` marks a
    /// known-absent account, other lookups fall through to the store.
    registrations: RwLock<HashMap<Address, Hash>>,
}

impl Chain {
    /// A chain rooted at the store's current head milestone.
    pub fn new(store: Arc<BlockStore>, params: ConsensusParams) -> Result<Self, VerifyError> {
        let head_height = store.head_height();
        let head = store
            .get_milestone_at(head_height)
            .and_then(|v| v.snapshot.clone())
            .ok_or(VerifyError::MissingHeadMilestone(head_height))?;
        Ok(Chain {
            params,
            store,
            pending: RwLock::new(HashMap::new()),
            milestones: RwLock::new(VecDeque::from([head])),
            verified: RwLock::new(HashMap::new()),
            ledger: RwLock::new(ChainLedger::default()),
            registrations: RwLock::new(HashMap::new()),
        })
    }

    /// Copy-on-fork: a new branch rooted at the milestone referenced by
    /// `fork_block`. Level sets sealed after the fork point return to the
    /// pending set; ledger and registration deltas roll back. The new chain
    /// has NOT verified `fork_block` yet.
    pub fn fork(parent: &Chain, fork_block: &Arc<Block>) -> Result<Chain, VerifyError> {
        let fork_ms_hash = fork_block.milestone_parent;
        let parent_deque = parent.milestones.read();

        let (deque, rolled_back): (VecDeque<Arc<Milestone>>, Vec<Arc<Milestone>>) =
            match parent_deque.iter().position(|m| m.ms_hash == fork_ms_hash) {
                Some(idx) => (
                    parent_deque.iter().take(idx + 1).cloned().collect(),
                    parent_deque.iter().skip(idx + 1).cloned().collect(),
                ),
                None => {
                    // The fork point lives only in the store: root the new
                    // chain there and roll back the whole in-memory suffix.
                    // Milestones with a flush in flight keep their deltas;
                    // the storage purge removes them chain-wide.
                    let vertex = parent
                        .store
                        .get_vertex(&fork_ms_hash)
                        .filter(|v| v.is_milestone)
                        .ok_or(VerifyError::UnknownForkPoint(fork_ms_hash))?;
                    let snapshot = vertex
                        .snapshot
                        .clone()
                        .ok_or(VerifyError::UnknownForkPoint(fork_ms_hash))?;
                    let rolled: Vec<Arc<Milestone>> = parent_deque
                        .iter()
                        .filter(|m| m.height > snapshot.height && !m.stored())
                        .cloned()
                        .collect();
                    (VecDeque::from([snapshot]), rolled)
                }
            };

        let mut pending = parent.pending.read().clone();
        let mut verified = parent.verified.read().clone();
        let mut ledger = parent.ledger.read().clone();
        let mut registrations = parent.registrations.read().clone();

        for ms in rolled_back.iter().rev() {
            ledger.rollback(&ms.txoc);
            for entry in ms.reg_change.inverse().iter() {
                registrations.insert(entry.address, entry.updated);
            }
            for vertex in ms.level_set_vertices() {
                verified.remove(&vertex.hash);
                pending.insert(vertex.hash, Arc::clone(&vertex.block));
                if !vertex.block.is_first_registration() {
                    ledger.add_pending(&block_outputs(&vertex.block));
                }
            }
        }

        Ok(Chain {
            params: parent.params.clone(),
            store: Arc::clone(&parent.store),
            pending: RwLock::new(pending),
            milestones: RwLock::new(deque),
            verified: RwLock::new(verified),
            ledger: RwLock::new(ledger),
            registrations: RwLock::new(registrations),
        })
    }

    // ── Pending side ──

    /// Idempotent insert into the pending set.
    pub fn add_pending_block(&self, block: Arc<Block>) {
        self.pending.write().entry(block.hash()).or_insert(block);
    }

    pub fn add_pending_utxos(&self, utxos: &[Utxo]) {
        self.ledger.write().add_pending(utxos);
    }

    pub fn has_pending(&self, hash: &Hash) -> bool {
        self.pending.read().contains_key(hash)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.read().len()
    }

    pub fn pending_blocks(&self) -> Vec<Arc<Block>> {
        self.pending.read().values().cloned().collect()
    }

    // ── Milestone deque ──

    pub fn head(&self) -> Arc<Milestone> {
        Arc::clone(self.milestones.read().back().expect("chain always has a head"))
    }

    pub fn head_height(&self) -> u64 {
        self.head().height
    }

    pub fn chainwork(&self) -> U256 {
        self.head().chainwork
    }

    pub fn milestones_snapshot(&self) -> Vec<Arc<Milestone>> {
        self.milestones.read().iter().cloned().collect()
    }

    pub fn milestone_count(&self) -> usize {
        self.milestones.read().len()
    }

    /// Height of the oldest in-memory milestone.
    pub fn least_height_cached(&self) -> u64 {
        self.milestones.read().front().map(|m| m.height).unwrap_or(0)
    }

    pub fn has_milestone(&self, hash: &Hash) -> bool {
        self.milestones.read().iter().any(|m| m.ms_hash == *hash)
    }

    pub fn milestone_at_height(&self, height: u64) -> Option<Arc<Milestone>> {
        let deque = self.milestones.read();
        let front = deque.front()?.height;
        if height < front {
            return None;
        }
        deque.get((height - front) as usize).cloned()
    }

    // ── Vertex cache ──

    pub fn get_vertex_cache(&self, hash: &Hash) -> Option<Arc<Vertex>> {
        self.verified.read().get(hash).map(Arc::clone)
    }

    /// True when the hash is known to this chain, pending or sealed.
    pub fn knows_block(&self, hash: &Hash) -> bool {
        self.pending.read().contains_key(hash) || self.verified.read().contains_key(hash)
    }

    // ── Verification ──

    /// Verify `block` as the next milestone of this chain.
    ///
    /// Determines the level set (pending blocks reachable from the candidate
    /// through parent edges), derives each vertex's miner-chain height,
    /// reward, redemption and transaction validity, computes the new
    /// snapshot, and commits. On error nothing is mutated.
    pub fn verify(&self, block: &Arc<Block>) -> Result<Arc<Vertex>, VerifyError> {
        let head = self.head();
        if block.milestone_parent != head.ms_hash {
            return Err(VerifyError::WrongMilestoneParent);
        }

        let order = self.collect_level_set(block);
        debug_assert_eq!(order.last().map(|b| b.hash()), Some(block.hash()));

        let height = head.height + 1;
        let level_set_size = order.len() as u64;
        let mut batch: HashMap<Hash, Arc<Vertex>> = HashMap::new();
        let mut sealed: Vec<Arc<Vertex>> = Vec::with_capacity(order.len());
        let mut txoc = Txoc::default();
        let mut reg_change = RegChange::default();
        let mut reg_overlay: HashMap<Address, Hash> = HashMap::new();
        let mut redeemed_marks: Vec<Arc<Vertex>> = Vec::new();

        for b in order.iter().take(order.len() - 1) {
            let prev = self
                .resolve_vertex(&b.prev_parent, &batch)
                .ok_or(VerifyError::MissingDependency(b.prev_parent))?;
            let miner_chain_height = prev.miner_chain_height + 1;
            let cumulative_reward = prev.cumulative_reward.saturating_add(1);

            let outcome = self.validate_transactions(
                b,
                miner_chain_height,
                cumulative_reward,
                &head,
                &batch,
                &txoc,
                &reg_overlay,
            );
            let (validity, fee) = apply_outcome(
                b,
                outcome,
                &mut txoc,
                &mut reg_change,
                &mut reg_overlay,
                &mut redeemed_marks,
            );
            let redeemed = registration_status(b, validity);

            let vertex = Arc::new(Vertex::new(
                Arc::clone(b),
                height,
                miner_chain_height,
                cumulative_reward,
                fee,
                redeemed,
                validity,
            ));
            batch.insert(vertex.hash, Arc::clone(&vertex));
            sealed.push(vertex);
        }

        // The candidate itself, carrying the new snapshot.
        let prev = self
            .resolve_vertex(&block.prev_parent, &batch)
            .ok_or(VerifyError::MissingDependency(block.prev_parent))?;
        let miner_chain_height = prev.miner_chain_height + 1;
        let cumulative_reward = prev.cumulative_reward.saturating_add(level_set_size);

        let outcome = self.validate_transactions(
            block,
            miner_chain_height,
            cumulative_reward,
            &head,
            &batch,
            &txoc,
            &reg_overlay,
        );
        let (validity, fee) = apply_outcome(
            block,
            outcome,
            &mut txoc,
            &mut reg_change,
            &mut reg_overlay,
            &mut redeemed_marks,
        );
        let redeemed = registration_status(block, validity);

        let dt = block.time.saturating_sub(head.ms_time).max(1);
        let block_target = pow::next_block_target(
            head.block_target,
            dt,
            self.params.target_milestone_spacing_secs,
        );
        let ms_vertex = Vertex::new_milestone(
            Arc::clone(block),
            height,
            miner_chain_height,
            cumulative_reward,
            fee,
            redeemed,
            validity,
            sealed.iter().map(Arc::downgrade).collect(),
            MilestoneSeed {
                chainwork: order
                    .iter()
                    .fold(head.chainwork, |acc, b| acc.saturating_add(b.work())),
                block_target,
                milestone_target: pow::milestone_target(
                    block_target,
                    self.params.milestone_target_shift,
                ),
                hash_rate: pow::estimate_hash_rate(
                    head.hash_rate,
                    order.len(),
                    head.block_target,
                    dt,
                ),
                reg_change,
                txoc,
            },
        );
        let snapshot = ms_vertex
            .snapshot
            .as_ref()
            .expect("candidate is a milestone");
        sealed.push(Arc::clone(&ms_vertex));

        // Commit.
        {
            let mut pending = self.pending.write();
            for v in &sealed {
                pending.remove(&v.hash);
            }
        }
        {
            let mut ledger = self.ledger.write();
            ledger.seal(&snapshot.txoc);
            ledger.discard_pending(
                sealed
                    .iter()
                    .flat_map(|v| block_outputs(&v.block))
                    .map(|u| u.key()),
            );
        }
        {
            let mut verified = self.verified.write();
            for v in &sealed {
                verified.insert(v.hash, Arc::clone(v));
            }
        }
        {
            let mut registrations = self.registrations.write();
            for (address, hash) in reg_overlay {
                registrations.insert(address, hash);
            }
        }
        for v in redeemed_marks {
            v.mark_redeemed();
        }
        self.milestones.write().push_back(Arc::clone(snapshot));

        tracing::debug!(
            ms = %short_hash(&ms_vertex.hash),
            height,
            level_set = sealed.len(),
            "sealed level set"
        );
        Ok(ms_vertex)
    }

    /// Pending blocks reachable from `candidate` through parent edges, in
    /// topological order (parents first), candidate last.
    fn collect_level_set(&self, candidate: &Arc<Block>) -> Vec<Arc<Block>> {
        let pending = self.pending.read();
        let mut order: Vec<Arc<Block>> = Vec::new();
        let mut visited: HashSet<Hash> = HashSet::new();
        let mut stack: Vec<(Arc<Block>, bool)> = vec![(Arc::clone(candidate), false)];

        while let Some((block, expanded)) = stack.pop() {
            if expanded {
                order.push(block);
                continue;
            }
            if !visited.insert(block.hash()) {
                continue;
            }
            stack.push((Arc::clone(&block), true));
            for parent in block.parents() {
                if visited.contains(parent) {
                    continue;
                }
                if let Some(parent_block) = pending.get(parent) {
                    stack.push((Arc::clone(parent_block), false));
                }
            }
        }
        order
    }

    /// Resolve the vertex a hash refers to: the current batch first, then
    /// this branch's sealed cache, then the store.
    fn resolve_vertex(
        &self,
        hash: &Hash,
        batch: &HashMap<Hash, Arc<Vertex>>,
    ) -> Option<Arc<Vertex>> {
        batch
            .get(hash)
            .map(Arc::clone)
            .or_else(|| self.get_vertex_cache(hash))
            .or_else(|| self.store.get_vertex(hash))
    }

    /// Current registration hash of an account on this branch.
    fn current_registration(
        &self,
        address: &Address,
        overlay: &HashMap<Address, Hash>,
    ) -> Option<Hash> {
        let live = |h: &Hash| if *h == ZERO_HASH { None } else { Some(*h) };
        if let Some(h) = overlay.get(address) {
            return live(h);
        }
        if let Some(h) = self.registrations.read().get(address) {
            return live(h);
        }
        self.store.get_prev_redem_hash(address)
    }

    /// Validate a block's transactions against the branch ledger.
    #[allow(clippy::too_many_arguments)]
    fn validate_transactions(
        &self,
        block: &Arc<Block>,
        miner_chain_height: u64,
        cumulative_reward: u64,
        head: &Arc<Milestone>,
        batch: &HashMap<Hash, Arc<Vertex>>,
        lvs_txoc: &Txoc,
        reg_overlay: &HashMap<Address, Hash>,
    ) -> TxOutcome {
        if block.transactions.is_empty() {
            return TxOutcome::Clean;
        }

        let block_hash = block.hash();
        let mut delta = Txoc::default();
        let mut fee = 0u64;
        let mut registration = None;
        let mut redeemed = None;
        let ledger = self.ledger.read();

        for (tx_index, tx) in block.transactions.iter().enumerate() {
            if tx.is_first_registration() {
                let address = tx.outputs[0].address;
                if self.current_registration(&address, reg_overlay).is_some() {
                    return TxOutcome::Invalid("account already registered");
                }
                registration = Some((address, ZERO_HASH, block_hash));
                // Zero-value registration output never enters the ledger.
                continue;
            }

            if tx.is_redemption() {
                let address = tx.outputs[0].address;
                let Some(current) = self.current_registration(&address, reg_overlay) else {
                    return TxOutcome::Invalid("redemption of unregistered account");
                };
                if tx.inputs[0].outpoint.block_hash != current {
                    return TxOutcome::Invalid("redemption does not spend the latest registration");
                }
                let Some(old_vertex) = self.resolve_vertex(&current, batch) else {
                    return TxOutcome::Invalid("previous registration vertex unavailable");
                };
                let available = cumulative_reward.saturating_sub(old_vertex.cumulative_reward);
                if tx.outputs[0].value > available {
                    return TxOutcome::Invalid("redemption value exceeds accrued reward");
                }
                // Spend the old registration output; a first registration
                // created none.
                if !old_vertex.block.is_first_registration() {
                    let old_key = utxo_key(&current, 0, 0);
                    match self.resolve_utxo(&old_key, &ledger, lvs_txoc, &delta) {
                        Some(utxo) => delta.add_spent(utxo),
                        None => return TxOutcome::Invalid("previous registration already spent"),
                    }
                }
                delta.add_created(Utxo::new(
                    tx.outputs[0].clone(),
                    block_hash,
                    tx_index as u32,
                    0,
                ));
                registration = Some((address, current, block_hash));
                redeemed = Some(old_vertex);
                continue;
            }

            // Payment: subject to sortition.
            if miner_chain_height < self.params.sortition_threshold {
                return TxOutcome::Invalid("miner chain below sortition threshold");
            }
            if !self.is_valid_distance(block, head) {
                return TxOutcome::Invalid("sortition distance bound violated");
            }

            let mut in_value = 0u64;
            for input in &tx.inputs {
                let key = input.outpoint.key();
                let Some(utxo) = self.resolve_utxo(&key, &ledger, lvs_txoc, &delta) else {
                    return TxOutcome::Invalid("input references no unspent output");
                };
                in_value = in_value.saturating_add(utxo.value());
                delta.add_spent(utxo);
            }
            let out_value = tx.output_value();
            if in_value < out_value {
                return TxOutcome::Invalid("outputs exceed inputs");
            }
            fee = fee.saturating_add(in_value - out_value);
            for (out_index, output) in tx.outputs.iter().enumerate() {
                delta.add_created(Utxo::new(
                    output.clone(),
                    block_hash,
                    tx_index as u32,
                    out_index as u32,
                ));
            }
        }

        TxOutcome::Valid {
            delta,
            fee,
            registration,
            redeemed,
        }
    }

    /// Look up a spendable output: level-set-local creations first, then the
    /// branch ledger, then the store; spends already recorded exclude it.
    fn resolve_utxo(
        &self,
        key: &UtxoKey,
        ledger: &ChainLedger,
        lvs_txoc: &Txoc,
        delta: &Txoc,
    ) -> Option<Utxo> {
        if delta.contains_spent(key) || lvs_txoc.contains_spent(key) || ledger.is_removed(key) {
            return None;
        }
        delta
            .created()
            .get(key)
            .or_else(|| lvs_txoc.created().get(key))
            .or_else(|| ledger.confirmed_get(key))
            .cloned()
            .or_else(|| self.store.get_utxo(key))
    }

    /// Hash-rate-scaled sortition bound: the busier the network, the closer
    /// a transaction block must sit to its miner chain's recent work.
    fn is_valid_distance(&self, block: &Arc<Block>, head: &Arc<Milestone>) -> bool {
        if head.hash_rate == 0 {
            return true;
        }
        let bound = (pow::max_target() / U256::from(head.hash_rate))
            .saturating_mul(U256::from(self.params.sortition_coefficient));
        let distance = pow::hash_to_scalar(&crate::hash_domain(
            b"braid.sortition",
            &crate::hash_concat(&[&block.prev_parent, &block.hash()]),
        ));
        distance <= bound
    }

    // ── Flush support ──

    /// The closure for one milestone flush: level-set vertices (in-memory
    /// order, milestone last) plus the UTXO delta.
    pub fn get_data_to_store(&self, ms: &Arc<Milestone>) -> (Vec<Arc<Vertex>>, Txoc) {
        (ms.level_set_vertices(), ms.txoc.clone())
    }

    /// Purge a flushed milestone: drop its vertices from the caches, its
    /// deltas from the ledger, and pop the stored prefix of the deque.
    pub fn pop_oldest(&self, vertex_hashes: &[Hash], txoc: &Txoc) {
        {
            // Lock order: pending before verified, everywhere.
            let mut pending = self.pending.write();
            let mut verified = self.verified.write();
            for hash in vertex_hashes {
                pending.remove(hash);
                verified.remove(hash);
            }
        }
        self.ledger.write().purge_flushed(txoc);
        let mut deque = self.milestones.write();
        while deque.len() > 1 && deque.front().is_some_and(|m| m.stored()) {
            deque.pop_front();
        }
    }

    #[cfg(test)]
    pub(crate) fn ledger_snapshot(&self) -> ChainLedger {
        self.ledger.read().clone()
    }
}

fn registration_status(block: &Arc<Block>, validity: TxValidity) -> RedemptionStatus {
    if validity == TxValidity::Valid && block.registration().is_some() {
        RedemptionStatus::NotYetRedeemed
    } else {
        RedemptionStatus::None
    }
}

fn apply_outcome(
    block: &Arc<Block>,
    outcome: TxOutcome,
    txoc: &mut Txoc,
    reg_change: &mut RegChange,
    reg_overlay: &mut HashMap<Address, Hash>,
    redeemed_marks: &mut Vec<Arc<Vertex>>,
) -> (TxValidity, u64) {
    match outcome {
        TxOutcome::Clean => (TxValidity::Valid, 0),
        TxOutcome::Valid {
            delta,
            fee,
            registration,
            redeemed,
        } => {
            if let Some((address, previous, updated)) = registration {
                reg_change.add(address, previous, updated);
                reg_overlay.insert(address, updated);
            }
            if let Some(old_vertex) = redeemed {
                redeemed_marks.push(old_vertex);
            }
            txoc.merge(delta);
            (TxValidity::Valid, fee)
        }
        TxOutcome::Invalid(reason) => {
            tracing::warn!(
                block = %short_hash(&block.hash()),
                reason,
                "transactions rejected at sealing"
            );
            (TxValidity::Invalid, 0)
        }
    }
}

enum TxOutcome {
    /// No transactions at all.
    Clean,
    Valid {
        delta: Txoc,
        fee: u64,
        registration: Option<(Address, Hash, Hash)>,
        redeemed: Option<Arc<Vertex>>,
    },
    Invalid(&'static str),
}

/// All outputs of a block as UTXO candidates.
pub fn block_outputs(block: &Arc<Block>) -> Vec<Utxo> {
    let hash = block.hash();
    let mut utxos = Vec::new();
    for (tx_index, tx) in block.transactions.iter().enumerate() {
        for (out_index, output) in tx.outputs.iter().enumerate() {
            utxos.push(Utxo::new(
                output.clone(),
                hash,
                tx_index as u32,
                out_index as u32,
            ));
        }
    }
    utxos
}
