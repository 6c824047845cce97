//! # Storage Module
//!
//! Persistent storage for a peerchain node.
//!
//! ## Architecture
//!
//! ```text
//! block.rs  — Block structure, genesis block, hashing
//! db.rs     — BlockStore trait and its sled implementation
//! chain.rs  — Head cache, height index, continuity checks
//! ```
//!
//! ## Data Flow
//!
//! ```text
//! BlockArrived / BlockResp → validate → Chain::commit → BlockStore
//! ```
//!
//! ## Design Decisions
//!
//! 1. **BLAKE3 for block hashes.** Fast on every architecture that matters.
//!
//! 2. **Blocks keyed by hash.** The predecessor check in block validation
//!    looks the parent up by `prev_block_hash`, so the hash is the primary
//!    key and the height index is secondary.
//!
//! 3. **Bincode for on-disk serialization.** Compact, fast, deterministic.
//!    JSON is for config and peer tables; bincode is for blocks.

pub mod block;
pub mod chain;
pub mod db;

pub use block::{Block, BlockHead};
pub use chain::{Chain, ChainHead, Continuity};
pub use db::{BlockStore, ChainDB, DbError, DbResult};
