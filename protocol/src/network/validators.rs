//! # Validators
//!
//! Admission checks the dispatcher runs before any handler sees an
//! envelope, plus the block and transaction verification they share with
//! the sync engine.
//!
//! | Kind           | Validator               | Rejects when                              |
//! |----------------|-------------------------|-------------------------------------------|
//! | `BlockArrived` | `BlockArrivedValidator` | seen this height recently, predecessor missing or not at `h - 1`, bad tx |
//! | `Transaction`  | `TransactionValidator`  | undecodable or bad signature              |
//! | `NodeJoin`     | `NodeJoinValidator`     | payload is not an IP, or is our own IP    |
//! | `NodeExit`     | `NodeExitValidator`     | payload IP is not the sender's            |
//!
//! A block whose predecessor we do not have means we are behind, so the
//! block-arrival validator kicks off a catch-up sync before rejecting it.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::cache::TtlCache;
use super::dispatcher::MessageValidator;
use super::message::MessageEnvelope;
use super::sync::BlockSyncEngine;
use super::topology::PeerTopology;
use crate::storage::{Block, Chain, Continuity, DbError};

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

/// Checks one raw transaction record, as carried in a `Transaction`
/// envelope or a block body.
pub trait TransactionVerifier: Send + Sync {
    fn verify(&self, raw: &[u8]) -> Result<(), String>;
}

/// A payload signed with ed25519.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransaction {
    pub public_key: [u8; 32],
    pub data: Vec<u8>,
    pub signature: Vec<u8>,
}

impl SignedTransaction {
    pub fn sign(key: &SigningKey, data: Vec<u8>) -> Self {
        let signature = key.sign(&data).to_bytes().to_vec();
        Self {
            public_key: key.verifying_key().to_bytes(),
            data,
            signature,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    pub fn verify_signature(&self) -> Result<(), String> {
        let key = VerifyingKey::from_bytes(&self.public_key)
            .map_err(|_| "invalid public key".to_string())?;
        let sig_bytes: [u8; 64] = self
            .signature
            .as_slice()
            .try_into()
            .map_err(|_| format!("signature must be 64 bytes, got {}", self.signature.len()))?;
        key.verify(&self.data, &Signature::from_bytes(&sig_bytes))
            .map_err(|_| "signature does not verify".to_string())
    }
}

/// Decodes a [`SignedTransaction`] and checks its signature.
#[derive(Debug, Default, Clone, Copy)]
pub struct SignedTransactionVerifier;

impl TransactionVerifier for SignedTransactionVerifier {
    fn verify(&self, raw: &[u8]) -> Result<(), String> {
        let tx = SignedTransaction::from_bytes(raw).map_err(|e| format!("undecodable: {e}"))?;
        tx.verify_signature()
    }
}

pub struct TransactionValidator {
    verifier: Arc<dyn TransactionVerifier>,
}

impl TransactionValidator {
    pub fn new(verifier: Arc<dyn TransactionVerifier>) -> Self {
        Self { verifier }
    }
}

impl MessageValidator for TransactionValidator {
    fn check(&self, envelope: &MessageEnvelope) -> bool {
        match self.verifier.verify(envelope.payload()) {
            Ok(()) => true,
            Err(reason) => {
                debug!(peer = %envelope.source_ip(), %reason, "transaction rejected");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Blocks
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum BlockRejection {
    #[error("predecessor of block {height} is not stored")]
    MissingParent { height: u64 },

    #[error("block {height} links to a block at height {parent_height}")]
    HeightMismatch { height: u64, parent_height: u64 },

    #[error("transaction {index} in block {height} is invalid: {reason}")]
    InvalidTransaction {
        height: u64,
        index: usize,
        reason: String,
    },

    #[error("storage error: {0}")]
    Storage(#[from] DbError),
}

/// Continuity plus per-transaction checks against the local chain.
pub struct BlockVerifier {
    chain: Arc<Chain>,
    tx_verifier: Arc<dyn TransactionVerifier>,
}

impl BlockVerifier {
    pub fn new(chain: Arc<Chain>, tx_verifier: Arc<dyn TransactionVerifier>) -> Self {
        Self { chain, tx_verifier }
    }

    pub fn chain(&self) -> &Arc<Chain> {
        &self.chain
    }

    pub fn verify(&self, block: &Block) -> Result<(), BlockRejection> {
        let height = block.height();
        match self.chain.check_continuity(block)? {
            Continuity::Genesis | Continuity::Linked => {}
            Continuity::MissingParent => return Err(BlockRejection::MissingParent { height }),
            Continuity::HeightMismatch { parent_height } => {
                return Err(BlockRejection::HeightMismatch {
                    height,
                    parent_height,
                })
            }
        }
        for (index, raw) in block.body.iter().enumerate() {
            self.tx_verifier
                .verify(raw)
                .map_err(|reason| BlockRejection::InvalidTransaction {
                    height,
                    index,
                    reason,
                })?;
        }
        Ok(())
    }
}

/// Cache key used to drop repeated arrivals of the same height.
pub fn block_dedup_key(height: u64) -> String {
    format!("block_height:{height}")
}

pub struct BlockArrivedValidator {
    cache: Arc<TtlCache>,
    verifier: Arc<BlockVerifier>,
    sync: Arc<BlockSyncEngine>,
    dedup_ttl: Duration,
}

impl BlockArrivedValidator {
    pub fn new(
        cache: Arc<TtlCache>,
        verifier: Arc<BlockVerifier>,
        sync: Arc<BlockSyncEngine>,
        dedup_ttl: Duration,
    ) -> Self {
        Self {
            cache,
            verifier,
            sync,
            dedup_ttl,
        }
    }
}

impl MessageValidator for BlockArrivedValidator {
    fn check(&self, envelope: &MessageEnvelope) -> bool {
        let block = match Block::from_bytes(envelope.payload()) {
            Ok(block) => block,
            Err(e) => {
                debug!(peer = %envelope.source_ip(), error = %e, "undecodable block dropped");
                return false;
            }
        };
        let height = block.height();
        if self.cache.check_repeat(&block_dedup_key(height), self.dedup_ttl) {
            debug!(height, peer = %envelope.source_ip(), "duplicate block arrival dropped");
            return false;
        }

        match self.verifier.verify(&block) {
            Ok(()) => true,
            Err(BlockRejection::MissingParent { height }) => {
                info!(
                    height,
                    local_height = self.verifier.chain().height(),
                    "predecessor missing, starting block sync"
                );
                self.sync.start_sync();
                false
            }
            Err(e) => {
                warn!(height, peer = %envelope.source_ip(), error = %e, "block rejected");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Membership
// ---------------------------------------------------------------------------

pub struct NodeJoinValidator {
    topology: Arc<PeerTopology>,
}

impl NodeJoinValidator {
    pub fn new(topology: Arc<PeerTopology>) -> Self {
        Self { topology }
    }
}

impl MessageValidator for NodeJoinValidator {
    fn check(&self, envelope: &MessageEnvelope) -> bool {
        let ip = envelope.payload_str();
        if ip.parse::<IpAddr>().is_err() {
            debug!(peer = %envelope.source_ip(), payload = %ip, "join with malformed ip");
            return false;
        }
        !self.topology.is_self_ip(&ip)
    }
}

/// A node may only announce its own exit.
#[derive(Debug, Default, Clone, Copy)]
pub struct NodeExitValidator;

impl MessageValidator for NodeExitValidator {
    fn check(&self, envelope: &MessageEnvelope) -> bool {
        envelope.payload_str() == envelope.source_ip()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::message::MessageKind;
    use crate::storage::ChainDB;

    fn signed(data: &[u8]) -> Vec<u8> {
        let key = SigningKey::from_bytes(&[7u8; 32]);
        SignedTransaction::sign(&key, data.to_vec()).to_bytes().unwrap()
    }

    fn chain() -> Arc<Chain> {
        let db = Arc::new(ChainDB::open_temporary().unwrap());
        Arc::new(Chain::open(db).unwrap())
    }

    #[test]
    fn signed_transaction_verifies() {
        assert!(SignedTransactionVerifier.verify(&signed(b"pay bob 5")).is_ok());
    }

    #[test]
    fn tampered_transaction_fails() {
        let key = SigningKey::from_bytes(&[7u8; 32]);
        let mut tx = SignedTransaction::sign(&key, b"pay bob 5".to_vec());
        tx.data = b"pay bob 500".to_vec();
        let raw = tx.to_bytes().unwrap();
        assert!(SignedTransactionVerifier.verify(&raw).is_err());
        assert!(SignedTransactionVerifier.verify(b"garbage").is_err());
    }

    #[test]
    fn transaction_validator_checks_payload() {
        let validator = TransactionValidator::new(Arc::new(SignedTransactionVerifier));
        let good = MessageEnvelope::new(MessageKind::Transaction, signed(b"x"));
        let bad = MessageEnvelope::new(MessageKind::Transaction, b"x".to_vec());
        assert!(validator.check(&good));
        assert!(!validator.check(&bad));
    }

    #[test]
    fn block_verifier_checks_continuity_and_body() {
        let chain = chain();
        let verifier = BlockVerifier::new(chain.clone(), Arc::new(SignedTransactionVerifier));
        let genesis = Block::genesis();

        let good = Block::with_time(&genesis, vec![signed(b"a"), signed(b"b")], 1);
        assert!(verifier.verify(&good).is_ok());

        let bad_tx = Block::with_time(&genesis, vec![signed(b"a"), b"junk".to_vec()], 1);
        assert!(matches!(
            verifier.verify(&bad_tx),
            Err(BlockRejection::InvalidTransaction { index: 1, .. })
        ));

        let orphan = Block::with_time(&good, vec![], 2);
        assert!(matches!(
            verifier.verify(&orphan),
            Err(BlockRejection::MissingParent { height: 3 })
        ));
    }

    struct Arrival {
        validator: BlockArrivedValidator,
        chain: Arc<Chain>,
        sync: Arc<BlockSyncEngine>,
    }

    /// A block-arrival validator over a fresh chain. The sync engine has no
    /// peers, so a triggered run ends right away with `NoPeers`.
    fn arrival() -> Arrival {
        use crate::network::correlator::{CorrelatorConfig, RequestCorrelator};
        use crate::network::registry::ChannelRegistry;
        use crate::network::sync::SyncConfig;

        let chain = chain();
        let registry = Arc::new(ChannelRegistry::new());
        let correlator = Arc::new(RequestCorrelator::new(
            registry.clone(),
            &CorrelatorConfig::default(),
        ));
        let verifier = Arc::new(BlockVerifier::new(
            chain.clone(),
            Arc::new(SignedTransactionVerifier),
        ));
        let sync = Arc::new(BlockSyncEngine::new(
            SyncConfig::default(),
            verifier.clone(),
            registry,
            correlator,
        ));
        let validator = BlockArrivedValidator::new(
            Arc::new(TtlCache::new()),
            verifier,
            sync.clone(),
            Duration::from_secs(60),
        );
        Arrival {
            validator,
            chain,
            sync,
        }
    }

    fn arrived(block: &Block) -> MessageEnvelope {
        MessageEnvelope::new(MessageKind::BlockArrived, block.to_bytes().unwrap())
            .from_ip("10.0.0.2")
    }

    #[tokio::test]
    async fn second_arrival_at_a_height_is_dropped() {
        let t = arrival();
        let genesis = Block::genesis();
        let first = Block::with_time(&genesis, vec![signed(b"a")], 1);
        let other = Block::with_time(&genesis, vec![signed(b"b")], 2);

        assert!(t.validator.check(&arrived(&first)));
        assert!(!t.validator.check(&arrived(&first)), "same block again");
        assert!(!t.validator.check(&arrived(&other)), "same height, other block");

        let next = Block::with_time(&first, vec![], 3);
        t.chain.commit(&first).unwrap();
        assert!(t.validator.check(&arrived(&next)));
    }

    #[tokio::test]
    async fn missing_parent_starts_sync_and_rejects() {
        let t = arrival();
        let unknown = Block::with_time(&Block::genesis(), vec![signed(b"a")], 1);
        let orphan = Block::with_time(&unknown, vec![], 2);
        assert_eq!(t.sync.completed_runs(), 0);

        assert!(!t.validator.check(&arrived(&orphan)));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while t.sync.completed_runs() == 0 {
            assert!(tokio::time::Instant::now() < deadline, "no sync run was started");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!t.sync.is_syncing());
        assert_eq!(t.chain.height(), 1);
    }

    #[tokio::test]
    async fn height_mismatch_is_rejected_without_sync() {
        let t = arrival();
        let b2 = Block::with_time(&Block::genesis(), vec![], 1);
        t.chain.commit(&b2).unwrap();

        // Links to the block at height 2 but claims height 5.
        let mut skipped = Block::with_time(&b2, vec![], 2);
        skipped.head.height = 5;
        assert!(matches!(
            t.validator.verifier.verify(&skipped),
            Err(BlockRejection::HeightMismatch {
                height: 5,
                parent_height: 2
            })
        ));

        assert!(!t.validator.check(&arrived(&skipped)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(t.sync.completed_runs(), 0);
        assert!(!t.sync.is_syncing());
    }

    #[tokio::test]
    async fn undecodable_block_is_rejected() {
        let t = arrival();
        let junk = MessageEnvelope::new(MessageKind::BlockArrived, b"not a block".to_vec());
        assert!(!t.validator.check(&junk));
    }

    #[test]
    fn genesis_height_skips_continuity() {
        let verifier = BlockVerifier::new(chain(), Arc::new(SignedTransactionVerifier));
        let mut block = Block::genesis();
        block.head.prev_block_hash = [1u8; 32];
        block.body.push(signed(b"first"));
        assert!(verifier.verify(&block).is_ok());
    }

    #[test]
    fn exit_must_come_from_the_leaving_node() {
        let own = MessageEnvelope::new(MessageKind::NodeExit, "10.0.0.2").from_ip("10.0.0.2");
        let forged = MessageEnvelope::new(MessageKind::NodeExit, "10.0.0.3").from_ip("10.0.0.2");
        assert!(NodeExitValidator.check(&own));
        assert!(!NodeExitValidator.check(&forged));
    }

    #[test]
    fn dedup_key_format() {
        assert_eq!(block_dedup_key(5), "block_height:5");
    }
}
