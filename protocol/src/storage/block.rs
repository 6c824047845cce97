//! # Block Structure
//!
//! A block is a head (height, link to the predecessor, production time) and
//! a body of raw transaction records. The body is opaque to this module:
//! each entry is whatever the transaction verifier knows how to decode.
//!
//! ## Block Layout
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │  BlockHead                                  │
//! │  ├── height: u64          (genesis = 1)     │
//! │  ├── prev_block_hash: [u8; 32]              │
//! │  └── time: u64            (unix millis)     │
//! ├─────────────────────────────────────────────┤
//! │  body: Vec<Vec<u8>>       (raw tx records)  │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## Hash Computation
//!
//! `hash = BLAKE3(height || prev_block_hash || time || body_root)`, with the
//! integers big-endian. `body_root` is a binary Merkle root over the BLAKE3
//! of every body entry, so reordering the body changes the hash.
//!
//! Heights start at 1. A block at height `h > 1` is only valid on a chain
//! whose block at `h - 1` hashes to `prev_block_hash`; that check needs the
//! store and lives in `storage::chain`.

use serde::{Deserialize, Serialize};

/// Height of the first block of every chain.
pub const GENESIS_HEIGHT: u64 = 1;

/// BLAKE3 digest of `data`.
pub fn blake3_hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

// ---------------------------------------------------------------------------
// BlockHead
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHead {
    /// Position in the chain. Genesis is 1.
    pub height: u64,
    /// Hash of the block at `height - 1`. All zeros for genesis.
    pub prev_block_hash: [u8; 32],
    /// Unix timestamp (milliseconds) when this block was produced.
    pub time: u64,
}

// ---------------------------------------------------------------------------
// Block
// ---------------------------------------------------------------------------

/// A full block: head plus the ordered list of raw transaction records.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub head: BlockHead,
    pub body: Vec<Vec<u8>>,
}

impl Block {
    /// The genesis block: height 1, zeroed predecessor, time zero, empty
    /// body. Every node derives the same hash for it.
    pub fn genesis() -> Self {
        Block {
            head: BlockHead {
                height: GENESIS_HEIGHT,
                prev_block_hash: [0u8; 32],
                time: 0,
            },
            body: Vec::new(),
        }
    }

    /// Builds the block that extends `parent`, stamped with the current time.
    pub fn new(parent: &Block, body: Vec<Vec<u8>>) -> Self {
        let time = chrono::Utc::now().timestamp_millis().max(0) as u64;
        Self::with_time(parent, body, time)
    }

    /// Same as [`Block::new`] with an explicit timestamp.
    pub fn with_time(parent: &Block, body: Vec<Vec<u8>>, time: u64) -> Self {
        Block {
            head: BlockHead {
                height: parent.head.height + 1,
                prev_block_hash: parent.hash(),
                time,
            },
            body,
        }
    }

    pub fn height(&self) -> u64 {
        self.head.height
    }

    pub fn tx_count(&self) -> usize {
        self.body.len()
    }

    /// The block hash. Covers the head and the body root.
    pub fn hash(&self) -> [u8; 32] {
        let body_root = compute_body_root(&self.body);
        let mut preimage = Vec::with_capacity(8 + 32 + 8 + 32);
        preimage.extend_from_slice(&self.head.height.to_be_bytes());
        preimage.extend_from_slice(&self.head.prev_block_hash);
        preimage.extend_from_slice(&self.head.time.to_be_bytes());
        preimage.extend_from_slice(&body_root);
        blake3_hash(&preimage)
    }

    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash())
    }

    /// Wire/disk encoding (bincode).
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

// ---------------------------------------------------------------------------
// Merkle Tree
// ---------------------------------------------------------------------------

/// Binary Merkle root over the body entries.
///
/// Leaves are `BLAKE3(entry)`, internal nodes `BLAKE3(left || right)`, and an
/// odd node is paired with itself. An empty body has a root of all zeros.
pub fn compute_body_root(body: &[Vec<u8>]) -> [u8; 32] {
    if body.is_empty() {
        return [0u8; 32];
    }

    let mut hashes: Vec<[u8; 32]> = body.iter().map(|entry| blake3_hash(entry)).collect();

    while hashes.len() > 1 {
        let mut next_level = Vec::with_capacity((hashes.len() + 1) / 2);
        for chunk in hashes.chunks(2) {
            let right = chunk.get(1).unwrap_or(&chunk[0]);
            let mut combined = [0u8; 64];
            combined[..32].copy_from_slice(&chunk[0]);
            combined[32..].copy_from_slice(right);
            next_level.push(blake3_hash(&combined));
        }
        hashes = next_level;
    }

    hashes[0]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
