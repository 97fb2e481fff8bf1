//! Wire protocol message definitions for synchronization.
//!
//! Semantic conventions:
//! - An `Inv` with no hashes means "we are at the same head".
//! - An `Inv` of exactly `[genesis]` means "no locator intersection, widen
//!   your locator".
//! - A `Bundle` payload is a serialized level set with the milestone vertex
//!   first.

use serde::{Deserialize, Serialize};

use crate::block::Block;
use crate::Hash;

/// What a GetData request is asking for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvKind {
    /// The level set sealed by a milestone hash.
    LevelSet,
    /// The responder's current pending set.
    PendingSet,
}

/// Network protocol messages.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Message {
    // ── Block relay ──
    /// Announce a newly admitted block.
    NewBlock(Box<Block>),

    // ── DAG sync ──
    /// Ask a peer which milestones it has, walking back from our locator.
    GetInv { locator: Vec<Hash>, nonce: u32 },

    /// Milestone hashes the responder has beyond the locator intersection.
    Inv { hashes: Vec<Hash>, nonce: u32 },

    /// Request level sets (one nonce per hash) or the pending set.
    GetData {
        kind: InvKind,
        hashes: Vec<Hash>,
        nonces: Vec<u32>,
    },

    /// A serialized level set (milestone vertex first) or pending set.
    Bundle { nonce: u32, payload: Vec<u8> },

    /// The requested milestone is unknown to the responder.
    NotFound { hash: Hash, nonce: u32 },
}

impl Message {
    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).expect("message serialization is infallible")
    }

    pub fn decode(bytes: &[u8]) -> Result<Message, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_round_trip() {
        let msg = Message::GetInv {
            locator: vec![[1u8; 32], [2u8; 32]],
            nonce: 7,
        };
        let bytes = msg.encode();
        match Message::decode(&bytes).unwrap() {
            Message::GetInv { locator, nonce } => {
                assert_eq!(locator.len(), 2);
                assert_eq!(nonce, 7);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn new_block_round_trip() {
        let msg = Message::NewBlock(Box::new(Block::genesis()));
        let decoded = Message::decode(&msg.encode()).unwrap();
        match decoded {
            Message::NewBlock(block) => assert_eq!(block.hash(), crate::block::genesis_hash()),
            other => panic!("wrong variant: {other:?}"),
        }
    }
}
