//! # Chain View
//!
//! Typed access to the chain kept in a [`BlockStore`]. Keeps the head
//! (height, hash, time) cached in memory, maintains the height index, and
//! answers the one question every block path asks: does this block attach
//! to what we already have?
//!
//! A fresh store is seeded with the genesis block on [`Chain::open`], so the
//! local height is never below 1.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use super::block::{Block, GENESIS_HEIGHT};
use super::db::{BlockStore, DbError, DbResult};

/// Key holding the hash of the current head block.
pub const NOW_BLOCK_HASH: &[u8] = b"now_block_hash";

/// Key holding the list of known mining addresses.
pub const MINING_ADDRESS: &[u8] = b"mining_address";

const HEIGHT_INDEX_PREFIX: &[u8] = b"height:";

fn height_key(height: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(HEIGHT_INDEX_PREFIX.len() + 8);
    key.extend_from_slice(HEIGHT_INDEX_PREFIX);
    key.extend_from_slice(&height.to_be_bytes());
    key
}

fn to_hash(bytes: &[u8]) -> DbResult<[u8; 32]> {
    bytes
        .try_into()
        .map_err(|_| DbError::Inconsistent(format!("expected 32-byte hash, got {}", bytes.len())))
}

/// Cached summary of the head block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainHead {
    pub height: u64,
    pub hash: [u8; 32],
    pub time: u64,
}

impl ChainHead {
    fn of(block: &Block) -> Self {
        Self {
            height: block.head.height,
            hash: block.hash(),
            time: block.head.time,
        }
    }
}

/// How a block relates to the stored chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuity {
    /// Height 1. Always attaches.
    Genesis,
    /// The predecessor is stored and sits exactly one height below.
    Linked,
    /// No stored block hashes to `prev_block_hash`. We are behind.
    MissingParent,
    /// The predecessor exists but its height is not `height - 1`.
    HeightMismatch { parent_height: u64 },
}

impl Continuity {
    pub fn is_attached(self) -> bool {
        matches!(self, Continuity::Genesis | Continuity::Linked)
    }
}

pub struct Chain {
    store: Arc<dyn BlockStore>,
    head: RwLock<ChainHead>,
}

impl Chain {
    /// Opens the chain kept in `store`, writing genesis if the store is empty.
    pub fn open(store: Arc<dyn BlockStore>) -> DbResult<Self> {
        let head = match store.get(NOW_BLOCK_HASH)? {
            Some(bytes) => {
                let hash = to_hash(&bytes)?;
                let block = load_block(store.as_ref(), &hash)?.ok_or_else(|| {
                    DbError::Inconsistent(format!("head block {} missing", hex::encode(hash)))
                })?;
                ChainHead::of(&block)
            }
            None => {
                let genesis = Block::genesis();
                let head = ChainHead::of(&genesis);
                store.put_batch(&commit_entries(&genesis, &head.hash, true)?)?;
                info!(hash = %hex::encode(head.hash), "chain initialised with genesis block");
                head
            }
        };

        debug!(height = head.height, "chain opened");
        Ok(Self {
            store,
            head: RwLock::new(head),
        })
    }

    pub fn head(&self) -> ChainHead {
        *self.head.read()
    }

    pub fn height(&self) -> u64 {
        self.head.read().height
    }

    pub fn block_by_hash(&self, hash: &[u8; 32]) -> DbResult<Option<Block>> {
        load_block(self.store.as_ref(), hash)
    }

    pub fn block_at_height(&self, height: u64) -> DbResult<Option<Block>> {
        match self.store.get(&height_key(height))? {
            Some(bytes) => self.block_by_hash(&to_hash(&bytes)?),
            None => Ok(None),
        }
    }

    /// Checks `block` against the stored chain. Looks the predecessor up by
    /// `prev_block_hash`, never by height.
    pub fn check_continuity(&self, block: &Block) -> DbResult<Continuity> {
        let height = block.head.height;
        if height <= GENESIS_HEIGHT {
            return Ok(Continuity::Genesis);
        }
        match self.block_by_hash(&block.head.prev_block_hash)? {
            Some(parent) if parent.head.height + 1 == height => Ok(Continuity::Linked),
            Some(parent) => Ok(Continuity::HeightMismatch {
                parent_height: parent.head.height,
            }),
            None => Ok(Continuity::MissingParent),
        }
    }

    /// Persists `block` and advances the head if the block is higher.
    ///
    /// Returns `false` without writing when a block is already indexed at
    /// that height. The caller is expected to have validated the block.
    ///
    /// The head lock is held from the existence check to the write, so two
    /// commits at one height cannot both land.
    pub fn commit(&self, block: &Block) -> DbResult<bool> {
        let height = block.head.height;
        let mut head = self.head.write();
        if self.store.get(&height_key(height))?.is_some() {
            debug!(height, "block already stored at height, skipping");
            return Ok(false);
        }

        let new_head = ChainHead::of(block);
        let advances = height > head.height;
        self.store
            .put_batch(&commit_entries(block, &new_head.hash, advances)?)?;
        if advances {
            *head = new_head;
        }
        debug!(height, hash = %hex::encode(new_head.hash), advances, "block committed");
        Ok(true)
    }

    pub fn mining_addresses(&self) -> DbResult<Vec<String>> {
        match self.store.get(MINING_ADDRESS)? {
            Some(bytes) => Ok(bincode::deserialize(&bytes)?),
            None => Ok(Vec::new()),
        }
    }

    /// Adds `address` to the mining address list. Duplicates are ignored.
    pub fn add_mining_address(&self, address: &str) -> DbResult<()> {
        let mut addresses = self.mining_addresses()?;
        if addresses.iter().any(|a| a == address) {
            return Ok(());
        }
        addresses.push(address.to_string());
        self.store
            .put(MINING_ADDRESS, &bincode::serialize(&addresses)?)
    }

    pub fn flush(&self) -> DbResult<()> {
        self.store.flush()
    }
}

fn load_block(store: &dyn BlockStore, hash: &[u8; 32]) -> DbResult<Option<Block>> {
    match store.get(hash)? {
        Some(bytes) => Ok(Some(Block::from_bytes(&bytes)?)),
        None => Ok(None),
    }
}

fn commit_entries(
    block: &Block,
    hash: &[u8; 32],
    advance_head: bool,
) -> DbResult<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut entries = vec![
        (hash.to_vec(), block.to_bytes()?),
        (height_key(block.head.height), hash.to_vec()),
    ];
    if advance_head {
        entries.push((NOW_BLOCK_HASH.to_vec(), hash.to_vec()));
    }
    Ok(entries)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
