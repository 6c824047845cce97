//! # Standard Handlers
//!
//! The handlers every node registers, apart from the sync and election
//! ones which live next to their engines.
//!
//! | Kind                     | Handler(s)                                  |
//! |--------------------------|---------------------------------------------|
//! | every response, `Error`  | `ResponseRouter`                            |
//! | `HeartbeatReq`           | `HeartbeatHandler`                          |
//! | `NodesReq`               | `NodesRequestHandler`                       |
//! | `NodeJoin`               | `NodeJoinHandler`                           |
//! | `NodeExit`               | `NodeExitHandler`                           |
//! | `BlockArrived`           | `BlockCommitHandler`, `BlockRelayHandler`   |
//! | `Transaction`            | `TransactionHandler`                        |
//!
//! Request handlers answer on the connection the request came in on,
//! echoing its sequence. A reply that cannot be sent (the peer left in the
//! meantime) is logged and dropped.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use super::correlator::RequestCorrelator;
use super::dispatcher::MessageHandler;
use super::message::{MessageEnvelope, MessageKind};
use super::registry::ChannelRegistry;
use super::topology::PeerTopology;
use crate::storage::{Block, Chain};

fn send_reply(registry: &ChannelRegistry, request: &MessageEnvelope, reply: MessageEnvelope) {
    let kind = reply.kind();
    if let Err(e) = registry.send_to(request.source_ip(), reply) {
        debug!(peer = %request.source_ip(), %kind, error = %e, "reply not sent");
    }
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// Hands responses to whoever is waiting on them.
pub struct ResponseRouter {
    correlator: Arc<RequestCorrelator>,
}

impl ResponseRouter {
    pub fn new(correlator: Arc<RequestCorrelator>) -> Self {
        Self { correlator }
    }
}

#[async_trait]
impl MessageHandler for ResponseRouter {
    async fn handle(&self, envelope: &MessageEnvelope) -> bool {
        if envelope.kind() == MessageKind::Error {
            debug!(peer = %envelope.source_ip(), reason = %envelope.payload_str(), "error envelope received");
        }
        self.correlator.resolve(envelope.clone())
    }
}

// ---------------------------------------------------------------------------
// Membership
// ---------------------------------------------------------------------------

pub struct HeartbeatHandler {
    registry: Arc<ChannelRegistry>,
}

impl HeartbeatHandler {
    pub fn new(registry: Arc<ChannelRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl MessageHandler for HeartbeatHandler {
    async fn handle(&self, envelope: &MessageEnvelope) -> bool {
        send_reply(
            &self.registry,
            envelope,
            envelope.reply(MessageKind::HeartbeatResp, Vec::new()),
        );
        true
    }
}

/// Answers `NodesReq` with our peer list as JSON.
pub struct NodesRequestHandler {
    topology: Arc<PeerTopology>,
    registry: Arc<ChannelRegistry>,
}

impl NodesRequestHandler {
    pub fn new(topology: Arc<PeerTopology>, registry: Arc<ChannelRegistry>) -> Self {
        Self { topology, registry }
    }
}

#[async_trait]
impl MessageHandler for NodesRequestHandler {
    async fn handle(&self, envelope: &MessageEnvelope) -> bool {
        let peers = self.topology.peers_for(envelope.source_ip());
        let reply = match serde_json::to_vec(&peers) {
            Ok(json) => envelope.reply(MessageKind::NodesResp, json),
            Err(e) => envelope.error_reply(&format!("peer list unavailable: {e}")),
        };
        trace!(peer = %envelope.source_ip(), listed = peers.len(), "peer list served");
        send_reply(&self.registry, envelope, reply);
        true
    }
}

/// Answers `NodeJoin` with `"true"` or `"false"`.
pub struct NodeJoinHandler {
    topology: Arc<PeerTopology>,
    registry: Arc<ChannelRegistry>,
}

impl NodeJoinHandler {
    pub fn new(topology: Arc<PeerTopology>, registry: Arc<ChannelRegistry>) -> Self {
        Self { topology, registry }
    }
}

#[async_trait]
impl MessageHandler for NodeJoinHandler {
    async fn handle(&self, envelope: &MessageEnvelope) -> bool {
        let joining = envelope.payload_str();
        let accepted = self.topology.accept_join(&joining);
        debug!(peer = %joining, accepted, "join request");
        send_reply(
            &self.registry,
            envelope,
            envelope.reply(MessageKind::NodeJoinResp, accepted.to_string()),
        );
        true
    }
}

pub struct NodeExitHandler {
    topology: Arc<PeerTopology>,
}

impl NodeExitHandler {
    pub fn new(topology: Arc<PeerTopology>) -> Self {
        Self { topology }
    }
}

#[async_trait]
impl MessageHandler for NodeExitHandler {
    async fn handle(&self, envelope: &MessageEnvelope) -> bool {
        self.topology.handle_exit(envelope.source_ip());
        true
    }
}

// ---------------------------------------------------------------------------
// Blocks & transactions
// ---------------------------------------------------------------------------

/// Persists a validated block. Stops the chain (no relay) if the block is
/// already stored or cannot be written.
pub struct BlockCommitHandler {
    chain: Arc<Chain>,
}

impl BlockCommitHandler {
    pub fn new(chain: Arc<Chain>) -> Self {
        Self { chain }
    }
}

#[async_trait]
impl MessageHandler for BlockCommitHandler {
    async fn handle(&self, envelope: &MessageEnvelope) -> bool {
        let block = match Block::from_bytes(envelope.payload()) {
            Ok(block) => block,
            Err(e) => {
                debug!(error = %e, "undecodable block at commit");
                return false;
            }
        };
        match self.chain.commit(&block) {
            Ok(true) => {
                info!(
                    height = block.height(),
                    hash = %block.hash_hex(),
                    txs = block.tx_count(),
                    from = %envelope.source_ip(),
                    "block committed"
                );
                true
            }
            Ok(false) => {
                trace!(height = block.height(), "block already stored");
                false
            }
            Err(e) => {
                warn!(height = block.height(), error = %e, "block commit failed");
                false
            }
        }
    }
}

/// Forwards a block to every peer except the one it came from.
pub struct BlockRelayHandler {
    registry: Arc<ChannelRegistry>,
}

impl BlockRelayHandler {
    pub fn new(registry: Arc<ChannelRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl MessageHandler for BlockRelayHandler {
    async fn handle(&self, envelope: &MessageEnvelope) -> bool {
        let relay = MessageEnvelope::new(MessageKind::BlockArrived, envelope.payload().to_vec());
        let sent = self.registry.broadcast(&relay, Some(envelope.source_ip()));
        trace!(sent, "block relayed");
        true
    }
}

/// Queues validated transactions for whatever assembles blocks.
pub struct TransactionHandler {
    sink: mpsc::Sender<Vec<u8>>,
}

impl TransactionHandler {
    pub fn new(sink: mpsc::Sender<Vec<u8>>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl MessageHandler for TransactionHandler {
    async fn handle(&self, envelope: &MessageEnvelope) -> bool {
        match self.sink.try_send(envelope.payload().to_vec()) {
            Ok(()) => true,
            Err(e) => {
                warn!(peer = %envelope.source_ip(), error = %e, "transaction dropped");
                false
            }
        }
    }
}
