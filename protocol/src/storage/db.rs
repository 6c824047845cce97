//! # ChainDB — Persistent Storage Engine
//!
//! The node only ever needs a flat key-value store from its database:
//! blocks are stored under their hash and a handful of well-known keys
//! (`now_block_hash`, `mining_address`, the height index) point into them.
//! [`BlockStore`] captures exactly that, and [`ChainDB`] implements it on
//! sled.
//!
//! ## Tree Layout
//!
//! | Tree    | Key                      | Value                  |
//! |---------|--------------------------|------------------------|
//! | `chain` | block hash (32B)         | `bincode(Block)`       |
//! | `chain` | `height:` + height (8B BE) | block hash (32B)     |
//! | `chain` | `now_block_hash`         | head block hash (32B)  |
//! | `chain` | `mining_address`         | `bincode(Vec<String>)` |
//!
//! Block heights are stored big-endian so sled's lexicographic ordering
//! matches numeric ordering.
//!
//! ## Atomicity
//!
//! A block commit writes the block, its height index entry and the new head
//! pointer through [`BlockStore::put_batch`]. sled applies a `Batch`
//! atomically: either everything lands or nothing does.

use sled::{Batch, Db, Tree};
use std::path::Path;

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

/// Errors that can occur during database operations.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("inconsistent chain data: {0}")]
    Inconsistent(String),
}

impl From<bincode::Error> for DbError {
    fn from(e: bincode::Error) -> Self {
        DbError::Serialization(e.to_string())
    }
}

pub type DbResult<T> = Result<T, DbError>;

// ---------------------------------------------------------------------------
// BlockStore
// ---------------------------------------------------------------------------

/// The narrow storage interface the rest of the node consumes.
pub trait BlockStore: Send + Sync {
    fn get(&self, key: &[u8]) -> DbResult<Option<Vec<u8>>>;

    fn put(&self, key: &[u8], value: &[u8]) -> DbResult<()>;

    /// Writes every pair or none of them.
    fn put_batch(&self, entries: &[(Vec<u8>, Vec<u8>)]) -> DbResult<()>;

    fn flush(&self) -> DbResult<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ChainDB
// ---------------------------------------------------------------------------

/// sled-backed [`BlockStore`].
///
/// sled is thread-safe, so `ChainDB` can be shared as `Arc<ChainDB>` without
/// extra locking.
#[derive(Debug, Clone)]
pub struct ChainDB {
    db: Db,
    chain: Tree,
}

impl ChainDB {
    /// Open or create a database at the given filesystem path.
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// A database that is deleted when dropped. Used by tests.
    pub fn open_temporary() -> DbResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> DbResult<Self> {
        let chain = db.open_tree("chain")?;
        Ok(Self { db, chain })
    }

    /// Number of keys stored, blocks and index entries alike.
    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }
}

impl BlockStore for ChainDB {
    fn get(&self, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        Ok(self.chain.get(key)?.map(|v| v.to_vec()))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> DbResult<()> {
        self.chain.insert(key, value)?;
        Ok(())
    }

    fn put_batch(&self, entries: &[(Vec<u8>, Vec<u8>)]) -> DbResult<()> {
        let mut batch = Batch::default();
        for (key, value) in entries {
            batch.insert(key.as_slice(), value.as_slice());
        }
        self.chain.apply_batch(batch)?;
        Ok(())
    }

    fn flush(&self) -> DbResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_temporary_database() {
        let db = ChainDB::open_temporary().expect("should create temp db");
        assert!(db.is_empty());
    }

    #[test]
    fn put_and_get() {
        let db = ChainDB::open_temporary().unwrap();
        db.put(b"now_block_hash", &[7u8; 32]).unwrap();
        assert_eq!(db.get(b"now_block_hash").unwrap(), Some(vec![7u8; 32]));
        assert_eq!(db.get(b"missing").unwrap(), None);
    }

    #[test]
    fn put_overwrites() {
        let db = ChainDB::open_temporary().unwrap();
        db.put(b"k", b"one").unwrap();
        db.put(b"k", b"two").unwrap();
        assert_eq!(db.get(b"k").unwrap(), Some(b"two".to_vec()));
        assert_eq!(db.len(), 1);
    }

    #[test]
    fn batch_writes_all_entries() {
        let db = ChainDB::open_temporary().unwrap();
        let entries = vec![
            (b"a".to_vec(), b"1".to_vec()),
            (b"b".to_vec(), b"2".to_vec()),
            (b"c".to_vec(), b"3".to_vec()),
        ];
        db.put_batch(&entries).unwrap();
        assert_eq!(db.len(), 3);
        assert_eq!(db.get(b"b").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn data_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let db = ChainDB::open(dir.path()).unwrap();
            db.put(b"mining_address", b"addr").unwrap();
            db.flush().unwrap();
        }
        let db = ChainDB::open(dir.path()).unwrap();
        assert_eq!(db.get(b"mining_address").unwrap(), Some(b"addr".to_vec()));
    }
}
