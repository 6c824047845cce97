//! # Block Synchronization Engine
//!
//! When a node notices it is behind (a block arrives whose predecessor it
//! does not have) or boots with peers ahead of it, it needs to catch up.
//! This module implements both sides of that: the `BlockSyncEngine` that
//! downloads, validates and commits missing blocks, and the handlers that
//! answer height and block requests from other nodes.
//!
//! ## Protocol Overview
//!
//! ```text
//! Behind Node                        Peer
//! ───────────                       ──────
//!   │  HeightReq                      │
//!   │──────────────────────────────>  │
//!   │  HeightResp (u64 BE)            │
//!   │<──────────────────────────────  │
//!   │                                 │
//!   │  BlockReq (h+1)                 │
//!   │──────────────────────────────>  │
//!   │  BlockResp (bincode Block)      │
//!   │<──────────────────────────────  │
//!   │  ... one request per height ... │
//!   │  commit batch in height order   │
//! ```
//!
//! ## Design Decisions
//!
//! - **Batch then commit.** Missing heights are fetched in batches of
//!   `batch_size`. A batch is only committed once every block in it has
//!   arrived, and then strictly in height order, each block validated
//!   against the chain as it stands after its predecessor was committed.
//!
//! - **One run at a time.** The engine is `Idle` or `Syncing`. A trigger
//!   while syncing is a no-op; the running pass will pick up whatever the
//!   trigger was about.
//!
//! - **Peer rotation.** A peer that cannot answer (timeout, error, bad
//!   block) is skipped for the next connected peer. After
//!   `max_consecutive_failures` failures in a row the run gives up and the
//!   local chain stays where it got to.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::correlator::{expect_kind, RequestCorrelator};
use super::dispatcher::MessageHandler;
use super::error::NetworkError;
use super::message::{MessageEnvelope, MessageKind};
use super::registry::ChannelRegistry;
use super::validators::{BlockRejection, BlockVerifier};
use crate::config;
use crate::storage::{Block, Chain, DbError};

// ---------------------------------------------------------------------------
// SyncConfig
// ---------------------------------------------------------------------------

/// Tuning knobs for the sync engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Heights fetched before a commit pass.
    pub batch_size: u64,

    /// Failed requests in a row after which a run stops.
    pub max_consecutive_failures: u32,

    /// Per-request timeout in milliseconds.
    pub request_timeout_ms: u64,

    /// A peer claiming to be further ahead than this is treated as a failed
    /// step instead of a sync target.
    pub max_height_lead: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: config::SYNC_BATCH_SIZE,
            max_consecutive_failures: config::SYNC_MAX_CONSECUTIVE_FAILURES,
            request_timeout_ms: config::REQUEST_TIMEOUT.as_millis() as u64,
            max_height_lead: config::SYNC_MAX_HEIGHT_LEAD,
        }
    }
}

// ---------------------------------------------------------------------------
// SyncResult
// ---------------------------------------------------------------------------

/// Summary of a sync run or of one committed batch.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SyncResult {
    /// Blocks validated and persisted.
    pub blocks_applied: u64,

    /// Transactions checked across the applied blocks.
    pub transactions_checked: u64,

    /// Chain height when the run finished.
    pub final_height: u64,

    /// Highest height a peer reported during the run.
    pub target_height: u64,
}

// ---------------------------------------------------------------------------
// SyncError
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("a sync run is already in progress")]
    AlreadySyncing,

    #[error("no connected peers to sync from")]
    NoPeers,

    #[error("gave up at height {height} after {failures} consecutive failures")]
    Exhausted { height: u64, failures: u32 },

    #[error("peer claims height {peer_height}, implausibly far ahead of {local_height}")]
    ImplausibleHeight { peer_height: u64, local_height: u64 },

    #[error("peer sent block {got} when {expected} was requested")]
    WrongHeight { expected: u64, got: u64 },

    #[error("invalid block: {0}")]
    InvalidBlock(#[from] BlockRejection),

    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    #[error("database error: {0}")]
    Db(#[from] DbError),
}

/// Current phase of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncState {
    Idle,
    Syncing,
}

/// Clears the syncing flag when a run ends, however it ends.
struct SyncingGuard<'a>(&'a AtomicBool);

impl Drop for SyncingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// BlockSyncEngine
// ---------------------------------------------------------------------------

pub struct BlockSyncEngine {
    config: SyncConfig,
    verifier: Arc<BlockVerifier>,
    registry: Arc<ChannelRegistry>,
    correlator: Arc<RequestCorrelator>,
    syncing: AtomicBool,
    completed_runs: AtomicU64,
}

impl BlockSyncEngine {
    pub fn new(
        config: SyncConfig,
        verifier: Arc<BlockVerifier>,
        registry: Arc<ChannelRegistry>,
        correlator: Arc<RequestCorrelator>,
    ) -> Self {
        Self {
            config,
            verifier,
            registry,
            correlator,
            syncing: AtomicBool::new(false),
            completed_runs: AtomicU64::new(0),
        }
    }

    fn chain(&self) -> &Arc<Chain> {
        self.verifier.chain()
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.config.request_timeout_ms)
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    pub fn state(&self) -> SyncState {
        if self.is_syncing() {
            SyncState::Syncing
        } else {
            SyncState::Idle
        }
    }

    /// Runs that have finished, successfully or not.
    pub fn completed_runs(&self) -> u64 {
        self.completed_runs.load(Ordering::Relaxed)
    }

    fn try_begin(&self) -> Option<SyncingGuard<'_>> {
        self.syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SyncingGuard(&self.syncing))
    }

    /// Starts a background sync run unless one is already going. Returns
    /// whether a run was started.
    pub fn start_sync(self: &Arc<Self>) -> bool {
        if self.is_syncing() {
            debug!("sync already running, trigger ignored");
            return false;
        }
        let engine = self.clone();
        tokio::spawn(async move {
            match engine.sync_now().await {
                Ok(result) => info!(
                    applied = result.blocks_applied,
                    height = result.final_height,
                    target = result.target_height,
                    "block sync finished"
                ),
                Err(SyncError::AlreadySyncing) => {}
                Err(e) => warn!(error = %e, height = engine.chain().height(), "block sync stopped"),
            }
        });
        true
    }

    /// Runs a sync pass on the calling task.
    pub async fn sync_now(&self) -> Result<SyncResult, SyncError> {
        let _guard = self.try_begin().ok_or(SyncError::AlreadySyncing)?;
        info!(height = self.chain().height(), "block sync started");
        let outcome = self.run().await;
        self.completed_runs.fetch_add(1, Ordering::Relaxed);
        outcome
    }

    async fn run(&self) -> Result<SyncResult, SyncError> {
        let peers = self.registry.connected_ips();
        if peers.is_empty() {
            return Err(SyncError::NoPeers);
        }

        let mut result = SyncResult {
            final_height: self.chain().height(),
            ..SyncResult::default()
        };
        let mut failures = 0u32;
        // Peers in a row that reported nothing higher than us.
        let mut caught_up_votes = 0usize;
        let mut cursor = 0usize;

        loop {
            let peer = &peers[cursor % peers.len()];
            match self.step(peer).await {
                Ok((remote, None)) => {
                    result.target_height = result.target_height.max(remote);
                    caught_up_votes += 1;
                    if caught_up_votes >= peers.len() {
                        break;
                    }
                    cursor += 1;
                }
                Ok((remote, Some(applied))) => {
                    result.target_height = result.target_height.max(remote);
                    result.blocks_applied += applied.blocks_applied;
                    result.transactions_checked += applied.transactions_checked;
                    failures = 0;
                    caught_up_votes = 0;
                    if self.chain().height() >= remote {
                        break;
                    }
                }
                Err(e) => {
                    failures += 1;
                    debug!(peer = %peer, error = %e, failures, "sync step failed, rotating peer");
                    if failures >= self.config.max_consecutive_failures {
                        return Err(SyncError::Exhausted {
                            height: self.chain().height(),
                            failures,
                        });
                    }
                    cursor += 1;
                }
            }
        }

        result.final_height = self.chain().height();
        Ok(result)
    }

    /// Asks `peer` for its height and, if it is ahead, fetches and commits
    /// one batch. Returns the peer's height and the batch result, if any.
    async fn step(&self, peer: &str) -> Result<(u64, Option<SyncResult>), SyncError> {
        let local = self.chain().height();
        let remote = self.peer_height(peer).await?;
        if remote.saturating_sub(local) > self.config.max_height_lead {
            return Err(SyncError::ImplausibleHeight {
                peer_height: remote,
                local_height: local,
            });
        }
        if !self.needs_sync(remote) {
            return Ok((remote, None));
        }
        let batch = self.fetch_batch(peer, local, remote).await?;
        let applied = self.apply_blocks(batch)?;
        Ok((remote, Some(applied)))
    }

    pub fn needs_sync(&self, remote_height: u64) -> bool {
        remote_height > self.chain().height()
    }

    /// The first inclusive `(start, end)` batch of `(local, remote]`, or
    /// `None` when there is nothing to fetch.
    pub fn next_batch(&self, local_height: u64, remote_height: u64) -> Option<(u64, u64)> {
        if local_height >= remote_height {
            return None;
        }
        let batch = self.config.batch_size.max(1);
        let start = local_height + 1;
        let end = start.saturating_add(batch - 1).min(remote_height);
        Some((start, end))
    }

    async fn peer_height(&self, peer: &str) -> Result<u64, SyncError> {
        let resp = self
            .correlator
            .request(
                MessageEnvelope::empty(MessageKind::HeightReq),
                peer,
                self.request_timeout(),
            )
            .await?;
        let resp = expect_kind(resp, MessageKind::HeightResp)?;
        resp.payload_u64().ok_or_else(|| {
            SyncError::Network(NetworkError::UnexpectedResponse {
                peer: peer.to_string(),
                detail: "height payload is not 8 bytes".to_string(),
            })
        })
    }

    async fn fetch_block(&self, peer: &str, height: u64) -> Result<Block, SyncError> {
        let req = MessageEnvelope::new(MessageKind::BlockReq, height.to_be_bytes().to_vec());
        let resp = self
            .correlator
            .request(req, peer, self.request_timeout())
            .await?;
        let resp = expect_kind(resp, MessageKind::BlockResp)?;
        let block = Block::from_bytes(resp.payload()).map_err(NetworkError::from)?;
        if block.height() != height {
            return Err(SyncError::WrongHeight {
                expected: height,
                got: block.height(),
            });
        }
        Ok(block)
    }

    /// Fetches the first batch of heights above `local`, one request each.
    async fn fetch_batch(&self, peer: &str, local: u64, remote: u64) -> Result<Vec<Block>, SyncError> {
        let Some((start, end)) = self.next_batch(local, remote) else {
            return Ok(Vec::new());
        };
        let mut blocks = Vec::new();
        for height in start..=end {
            blocks.push(self.fetch_block(peer, height).await?);
        }
        debug!(peer, start, end, "batch fetched");
        Ok(blocks)
    }

    /// Validates and commits `blocks` in height order. Stops at the first
    /// block that does not attach; blocks before it stay committed.
    pub fn apply_blocks(&self, mut blocks: Vec<Block>) -> Result<SyncResult, SyncError> {
        blocks.sort_by_key(Block::height);
        let mut result = SyncResult::default();
        for block in &blocks {
            self.verifier.verify(block)?;
            if self.chain().commit(block)? {
                result.blocks_applied += 1;
                result.transactions_checked += block.tx_count() as u64;
            }
        }
        result.final_height = self.chain().height();
        result.target_height = result.final_height;
        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// Serving side
// ---------------------------------------------------------------------------

/// Answers `HeightReq` with the local chain height.
pub struct HeightRequestHandler {
    chain: Arc<Chain>,
    registry: Arc<ChannelRegistry>,
}

impl HeightRequestHandler {
    pub fn new(chain: Arc<Chain>, registry: Arc<ChannelRegistry>) -> Self {
        Self { chain, registry }
    }
}

#[async_trait]
impl MessageHandler for HeightRequestHandler {
    async fn handle(&self, envelope: &MessageEnvelope) -> bool {
        let height = self.chain.height();
        let reply = envelope.reply(MessageKind::HeightResp, height.to_be_bytes().to_vec());
        if let Err(e) = self.registry.send_to(envelope.source_ip(), reply) {
            debug!(peer = %envelope.source_ip(), error = %e, "height reply not sent");
        }
        true
    }
}

/// Answers `BlockReq` with the block at the requested height, or `Error`.
pub struct BlockRequestHandler {
    chain: Arc<Chain>,
    registry: Arc<ChannelRegistry>,
}

impl BlockRequestHandler {
    pub fn new(chain: Arc<Chain>, registry: Arc<ChannelRegistry>) -> Self {
        Self { chain, registry }
    }

    fn answer(&self, envelope: &MessageEnvelope) -> MessageEnvelope {
        let Some(height) = envelope.payload_u64() else {
            return envelope.error_reply("block request must carry a u64 height");
        };
        match self.chain.block_at_height(height) {
            Ok(Some(block)) => match block.to_bytes() {
                Ok(bytes) => envelope.reply(MessageKind::BlockResp, bytes),
                Err(e) => envelope.error_reply(&format!("block {height} not encodable: {e}")),
            },
            Ok(None) => envelope.error_reply(&format!("no block at height {height}")),
            Err(e) => envelope.error_reply(&format!("storage error: {e}")),
        }
    }
}

#[async_trait]
impl MessageHandler for BlockRequestHandler {
    async fn handle(&self, envelope: &MessageEnvelope) -> bool {
        let reply = self.answer(envelope);
        if let Err(e) = self.registry.send_to(envelope.source_ip(), reply) {
            debug!(peer = %envelope.source_ip(), error = %e, "block reply not sent");
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
