//! Peer collaborator: per-peer sync bookkeeping and outbound messaging.
//!
//! The transport itself lives outside the engine; a `Peer` here is the
//! engine-facing handle: an outbound message queue plus the synchronization
//! state the DAG manager reads and updates while serving inventory and data
//! requests. The `PeerManager` tracks connected peers, relays admitted
//! blocks, and surfaces peers whose sync tasks have timed out.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};

use crate::block::Block;
use crate::network::{InvKind, Message};
use crate::{Hash, ZERO_HASH};

/// Peer identifier: fingerprint of the peer's transport identity.
pub type PeerId = Hash;

/// An outstanding GetInv request awaiting its Inv.
#[derive(Clone, Debug)]
pub struct GetInvTask {
    pub nonce: u32,
    created: Instant,
    timeout: Duration,
}

impl GetInvTask {
    pub fn new(timeout: Duration) -> Self {
        GetInvTask {
            nonce: rand::random(),
            created: Instant::now(),
            timeout,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.created.elapsed() > self.timeout
    }
}

/// An outstanding GetData request awaiting its Bundle or NotFound.
#[derive(Clone, Debug)]
pub struct GetDataTask {
    pub kind: InvKind,
    /// The requested milestone hash; `None` for a pending-set request.
    pub hash: Option<Hash>,
    pub nonce: u32,
    created: Instant,
    timeout: Duration,
}

impl GetDataTask {
    pub fn new(kind: InvKind, hash: Option<Hash>, timeout: Duration) -> Self {
        GetDataTask {
            kind,
            hash,
            nonce: rand::random(),
            created: Instant::now(),
            timeout,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.created.elapsed() > self.timeout
    }
}

/// The engine-facing handle of one connected peer.
pub struct Peer {
    pub id: PeerId,
    outbox: Sender<Message>,
    disconnect: AtomicBool,
    /// Set by `start_sync`; the node's sync driver consumes it.
    sync_requested: AtomicBool,

    // Last request we made to this peer, to avoid redundant GetInv loops.
    last_get_inv_end: Mutex<Hash>,
    last_get_inv_length: AtomicUsize,
    // Most recent milestone hash we sent via Inv / Bundle, to trim
    // re-requests of data the peer already has in flight.
    last_sent_inv_hash: Mutex<Hash>,
    last_sent_bundle_hash: Mutex<Hash>,

    get_inv_tasks: Mutex<HashMap<u32, GetInvTask>>,
    get_data_tasks: Mutex<BTreeMap<u32, GetDataTask>>,
}

impl Peer {
    /// Create a peer handle; the receiver side is handed to the transport.
    pub fn new(id: PeerId) -> (Arc<Peer>, Receiver<Message>) {
        let (tx, rx) = unbounded();
        let peer = Arc::new(Peer {
            id,
            outbox: tx,
            disconnect: AtomicBool::new(false),
            sync_requested: AtomicBool::new(false),
            last_get_inv_end: Mutex::new(ZERO_HASH),
            last_get_inv_length: AtomicUsize::new(0),
            last_sent_inv_hash: Mutex::new(ZERO_HASH),
            last_sent_bundle_hash: Mutex::new(ZERO_HASH),
            get_inv_tasks: Mutex::new(HashMap::new()),
            get_data_tasks: Mutex::new(BTreeMap::new()),
        });
        (peer, rx)
    }

    pub fn send_message(&self, message: Message) {
        if self.is_disconnected() {
            return;
        }
        if self.outbox.send(message).is_err() {
            tracing::debug!(peer = %crate::short_hash(&self.id), "outbox closed");
        }
    }

    /// Flag this peer as a sync source; the node's sync driver picks it up.
    pub fn start_sync(&self) {
        self.sync_requested.store(true, Ordering::Release);
    }

    /// Consume the sync-requested flag.
    pub fn take_sync_request(&self) -> bool {
        self.sync_requested.swap(false, Ordering::AcqRel)
    }

    pub fn disconnect(&self) {
        self.disconnect.store(true, Ordering::Release);
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnect.load(Ordering::Acquire)
    }

    // ── GetInv bookkeeping ──

    pub fn add_pending_get_inv_task(&self, task: GetInvTask) {
        self.get_inv_tasks.lock().insert(task.nonce, task);
    }

    pub fn remove_pending_get_inv_task(&self, nonce: u32) -> Option<GetInvTask> {
        self.get_inv_tasks.lock().remove(&nonce)
    }

    pub fn get_inv_task_count(&self) -> usize {
        self.get_inv_tasks.lock().len()
    }

    // ── GetData bookkeeping ──

    pub fn add_pending_get_data_task(&self, task: GetDataTask) {
        self.get_data_tasks.lock().insert(task.nonce, task);
    }

    pub fn remove_pending_get_data_task(&self, nonce: u32) -> Option<GetDataTask> {
        self.get_data_tasks.lock().remove(&nonce)
    }

    pub fn get_data_task_count(&self) -> usize {
        self.get_data_tasks.lock().len()
    }

    /// True when any outstanding sync task has outlived its timeout.
    pub fn has_expired_task(&self) -> bool {
        self.get_inv_tasks.lock().values().any(|t| t.is_expired())
            || self.get_data_tasks.lock().values().any(|t| t.is_expired())
    }

    // ── Last-request trackers ──

    pub fn last_get_inv_end(&self) -> Hash {
        *self.last_get_inv_end.lock()
    }

    pub fn set_last_get_inv_end(&self, hash: Hash) {
        *self.last_get_inv_end.lock() = hash;
    }

    pub fn last_get_inv_length(&self) -> usize {
        self.last_get_inv_length.load(Ordering::Acquire)
    }

    pub fn set_last_get_inv_length(&self, length: usize) {
        self.last_get_inv_length.store(length, Ordering::Release);
    }

    pub fn last_sent_inv_hash(&self) -> Hash {
        *self.last_sent_inv_hash.lock()
    }

    pub fn set_last_sent_inv_hash(&self, hash: Hash) {
        *self.last_sent_inv_hash.lock() = hash;
    }

    pub fn last_sent_bundle_hash(&self) -> Hash {
        *self.last_sent_bundle_hash.lock()
    }

    pub fn set_last_sent_bundle_hash(&self, hash: Hash) {
        *self.last_sent_bundle_hash.lock() = hash;
    }
}

/// Registry of connected peers.
#[derive(Default)]
pub struct PeerManager {
    peers: RwLock<HashMap<PeerId, Arc<Peer>>>,
}

impl PeerManager {
    pub fn new() -> Self {
        PeerManager::default()
    }

    pub fn register(&self, peer: Arc<Peer>) {
        self.peers.write().insert(peer.id, peer);
    }

    pub fn remove(&self, id: &PeerId) -> Option<Arc<Peer>> {
        self.peers.write().remove(id)
    }

    pub fn get(&self, id: &PeerId) -> Option<Arc<Peer>> {
        self.peers.read().get(id).map(Arc::clone)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    /// Relay a block to every connected peer except its deliverer.
    pub fn relay_block(&self, block: &Arc<Block>, from: Option<&PeerId>) {
        let peers = self.peers.read();
        for (id, peer) in peers.iter() {
            if Some(id) == from || peer.is_disconnected() {
                continue;
            }
            peer.send_message(Message::NewBlock(Box::new((**block).clone())));
        }
    }

    /// Disconnect and return every peer with an expired sync task.
    pub fn sweep_expired(&self) -> Vec<Arc<Peer>> {
        let mut expired = Vec::new();
        let mut peers = self.peers.write();
        peers.retain(|_, peer| {
            if peer.has_expired_task() {
                tracing::warn!(peer = %crate::short_hash(&peer.id), "sync task timed out, disconnecting");
                peer.disconnect();
                expired.push(Arc::clone(peer));
                false
            } else {
                true
            }
        });
        expired
    }
}
