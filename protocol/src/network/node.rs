//! # Peer Node
//!
//! `PeerNode` is the top-level runtime of a peerchain participant. It builds
//! every service in dependency order, wires validators and handlers into
//! the dispatcher, and owns the background tasks and their shutdown.
//!
//! ```text
//! new()   store → chain → registry → correlator → transport → topology
//!                → verifier → sync → election → dispatcher registrations
//! start() dispatcher loop, cache sweeper, topology init, initial sync,
//!         maintenance loop, master refresh
//! shutdown() NodeExit broadcast, stop tasks, persist peer table, flush
//! ```
//!
//! The transport is supplied by the caller as a factory, since it needs the
//! registry and the inbound queue the node creates. The binary passes a
//! TCP transport; tests pass an in-memory one.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::cache::TtlCache;
use super::consensus::{MasterElection, MasterRequestHandler, NewMasterRequestHandler};
use super::correlator::RequestCorrelator;
use super::dispatcher::Dispatcher;
use super::handlers::{
    BlockCommitHandler, BlockRelayHandler, HeartbeatHandler, NodeExitHandler, NodeJoinHandler,
    NodesRequestHandler, ResponseRouter, TransactionHandler,
};
use super::message::{MessageEnvelope, MessageKind};
use super::registry::ChannelRegistry;
use super::roster::SuperNodeRoster;
use super::sync::{BlockRequestHandler, BlockSyncEngine, HeightRequestHandler, SyncError};
use super::topology::PeerTopology;
use super::transport::Transport;
use super::validators::{
    block_dedup_key, BlockArrivedValidator, BlockRejection, BlockVerifier, NodeExitValidator,
    NodeJoinValidator, SignedTransactionVerifier, TransactionValidator, TransactionVerifier,
};
use crate::config::{self, NodeConfig};
use crate::storage::{Block, BlockStore, Chain, DbError};

// ---------------------------------------------------------------------------
// Errors & stats
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("database error: {0}")]
    Db(#[from] DbError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("block rejected: {0}")]
    Block(#[from] BlockRejection),

    #[error("head block {0} not found")]
    MissingHead(String),

    #[error("node already started")]
    AlreadyStarted,
}

/// Point-in-time counters, sampled by the metrics endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStats {
    pub self_ip: String,
    pub super_node: bool,
    pub active_connections: usize,
    pub passive_connections: usize,
    pub known_peers: usize,
    pub chain_height: u64,
    pub syncing: bool,
    pub master: Option<String>,
    pub dispatched: u64,
    pub rejected: u64,
}

// ---------------------------------------------------------------------------
// PeerNode
// ---------------------------------------------------------------------------

pub struct PeerNode {
    config: NodeConfig,
    chain: Arc<Chain>,
    registry: Arc<ChannelRegistry>,
    correlator: Arc<RequestCorrelator>,
    topology: Arc<PeerTopology>,
    cache: Arc<TtlCache>,
    verifier: Arc<BlockVerifier>,
    sync: Arc<BlockSyncEngine>,
    election: Arc<MasterElection>,
    dispatcher: Arc<Dispatcher>,
    inbound: Mutex<Option<mpsc::Receiver<MessageEnvelope>>>,
    transactions: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PeerNode {
    /// Builds a node with the ed25519 transaction verifier.
    pub fn new<F>(
        config: NodeConfig,
        roster: SuperNodeRoster,
        store: Arc<dyn BlockStore>,
        make_transport: F,
    ) -> Result<Self, NodeError>
    where
        F: FnOnce(Arc<ChannelRegistry>, mpsc::Sender<MessageEnvelope>) -> Arc<dyn Transport>,
    {
        Self::with_verifier(
            config,
            roster,
            store,
            Arc::new(SignedTransactionVerifier),
            make_transport,
        )
    }

    pub fn with_verifier<F>(
        config: NodeConfig,
        roster: SuperNodeRoster,
        store: Arc<dyn BlockStore>,
        tx_verifier: Arc<dyn TransactionVerifier>,
        make_transport: F,
    ) -> Result<Self, NodeError>
    where
        F: FnOnce(Arc<ChannelRegistry>, mpsc::Sender<MessageEnvelope>) -> Arc<dyn Transport>,
    {
        let chain = Arc::new(Chain::open(store)?);
        for record in roster.records() {
            chain.add_mining_address(&record.stake_address_hex())?;
        }

        let registry = Arc::new(ChannelRegistry::new());
        let correlator = Arc::new(RequestCorrelator::new(registry.clone(), &config.correlator));
        let (inbound_tx, inbound_rx) = mpsc::channel(config::INBOUND_QUEUE_CAPACITY);
        let transport = make_transport(registry.clone(), inbound_tx);

        let peer_table_path = config.peer_table_path();
        let topology = Arc::new(PeerTopology::new(
            config.topology.clone(),
            roster,
            config.local_ips.clone(),
            Some(peer_table_path.as_path()),
            registry.clone(),
            correlator.clone(),
            transport,
        )?);

        let cache = Arc::new(TtlCache::new());
        let verifier = Arc::new(BlockVerifier::new(chain.clone(), tx_verifier.clone()));
        let sync = Arc::new(BlockSyncEngine::new(
            config.sync.clone(),
            verifier.clone(),
            registry.clone(),
            correlator.clone(),
        ));
        let election = Arc::new(MasterElection::new(
            &config.election,
            topology.clone(),
            registry.clone(),
            correlator.clone(),
        ));

        let (tx_sink, tx_queue) = mpsc::channel(config::TRANSACTION_QUEUE_CAPACITY);
        let (shutdown, _) = watch::channel(false);

        let node = Self {
            config,
            chain,
            registry,
            correlator,
            topology,
            cache,
            verifier,
            sync,
            election,
            dispatcher: Arc::new(Dispatcher::new()),
            inbound: Mutex::new(Some(inbound_rx)),
            transactions: Mutex::new(Some(tx_queue)),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        };
        node.register(tx_verifier, tx_sink);
        info!(
            self_ip = %node.topology.self_ip(),
            super_node = node.topology.is_super_node(),
            height = node.chain.height(),
            "peer node built"
        );
        Ok(node)
    }

    fn register(
        &self,
        tx_verifier: Arc<dyn TransactionVerifier>,
        tx_sink: mpsc::Sender<Vec<u8>>,
    ) {
        let d = &self.dispatcher;

        d.set_validator(
            MessageKind::BlockArrived,
            Arc::new(BlockArrivedValidator::new(
                self.cache.clone(),
                self.verifier.clone(),
                self.sync.clone(),
                self.config.block_interval(),
            )),
        );
        d.set_validator(
            MessageKind::Transaction,
            Arc::new(TransactionValidator::new(tx_verifier)),
        );
        d.set_validator(
            MessageKind::NodeJoin,
            Arc::new(NodeJoinValidator::new(self.topology.clone())),
        );
        d.set_validator(MessageKind::NodeExit, Arc::new(NodeExitValidator));

        let router = Arc::new(ResponseRouter::new(self.correlator.clone()));
        for kind in MessageKind::ALL.into_iter().filter(|k| k.is_response()) {
            d.add_handler(kind, router.clone());
        }

        let registry = &self.registry;
        d.add_handler(
            MessageKind::HeartbeatReq,
            Arc::new(HeartbeatHandler::new(registry.clone())),
        );
        d.add_handler(
            MessageKind::NodesReq,
            Arc::new(NodesRequestHandler::new(self.topology.clone(), registry.clone())),
        );
        d.add_handler(
            MessageKind::NodeJoin,
            Arc::new(NodeJoinHandler::new(self.topology.clone(), registry.clone())),
        );
        d.add_handler(
            MessageKind::NodeExit,
            Arc::new(NodeExitHandler::new(self.topology.clone())),
        );
        d.add_handler(
            MessageKind::BlockArrived,
            Arc::new(BlockCommitHandler::new(self.chain.clone())),
        );
        d.add_handler(
            MessageKind::BlockArrived,
            Arc::new(BlockRelayHandler::new(registry.clone())),
        );
        d.add_handler(
            MessageKind::Transaction,
            Arc::new(TransactionHandler::new(tx_sink)),
        );
        d.add_handler(
            MessageKind::HeightReq,
            Arc::new(HeightRequestHandler::new(self.chain.clone(), registry.clone())),
        );
        d.add_handler(
            MessageKind::BlockReq,
            Arc::new(BlockRequestHandler::new(self.chain.clone(), registry.clone())),
        );
        d.add_handler(
            MessageKind::NewMasterReq,
            Arc::new(NewMasterRequestHandler::new(self.election.clone(), registry.clone())),
        );
        d.add_handler(
            MessageKind::MasterReq,
            Arc::new(MasterRequestHandler::new(self.election.clone(), registry.clone())),
        );
    }

    // -- Lifecycle ----------------------------------------------------------

    /// Starts the background tasks, forms the peer set and catches up with
    /// the network. Inbound traffic is served from the first step on.
    pub async fn start(&self) -> Result<(), NodeError> {
        let inbound = self.inbound.lock().take().ok_or(NodeError::AlreadyStarted)?;
        let mut tasks = vec![
            self.dispatcher
                .clone()
                .run(inbound, self.shutdown.subscribe()),
            self.cache
                .clone()
                .spawn_sweeper(self.config.cache_sweep_interval(), self.shutdown.subscribe()),
        ];

        let active = self.topology.init().await;

        if active > 0 || self.registry.total_count() > 0 {
            match self.sync.sync_now().await {
                Ok(result) => info!(
                    applied = result.blocks_applied,
                    height = result.final_height,
                    "initial sync done"
                ),
                Err(SyncError::NoPeers) => {}
                Err(e) => warn!(error = %e, "initial sync incomplete"),
            }
        }

        tasks.push(
            self.topology
                .clone()
                .spawn_maintenance(self.shutdown.subscribe()),
        );
        if let Some(master) = self.election.refresh_master().await {
            debug!(master = %master, "master known at startup");
        }

        self.tasks.lock().extend(tasks);
        info!(
            active = self.registry.active_count(),
            height = self.chain.height(),
            "peer node started"
        );
        Ok(())
    }

    /// Leaves the network: announces the exit, stops the background tasks,
    /// persists the peer table and flushes the chain.
    pub async fn shutdown(&self) {
        let told = self.topology.announce_exit();
        debug!(peers = told, "exit announced");
        self.shutdown.send_replace(true);

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                warn!("background task did not stop in time");
            }
        }

        for conn in self.registry.all_connections() {
            self.registry.remove_connection(&conn);
        }
        self.topology.save_peers();
        if let Err(e) = self.chain.flush() {
            warn!(error = %e, "chain flush failed");
        }
        info!("peer node stopped");
    }

    /// A receiver that fires once shutdown starts.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    // -- Blocks & transactions ----------------------------------------------

    /// Builds a block on top of the head, commits it and announces it.
    pub fn publish_block(&self, body: Vec<Vec<u8>>) -> Result<Block, NodeError> {
        let head = self.chain.head();
        let parent = self
            .chain
            .block_by_hash(&head.hash)?
            .ok_or_else(|| NodeError::MissingHead(hex::encode(head.hash)))?;
        let block = Block::new(&parent, body);
        self.import_block(block)
    }

    /// Validates, commits and announces a block produced elsewhere in this
    /// process.
    pub fn import_block(&self, block: Block) -> Result<Block, NodeError> {
        self.verifier.verify(&block)?;
        self.chain.commit(&block)?;
        // Our own announcement must not come back as a fresh arrival.
        self.cache
            .check_repeat(&block_dedup_key(block.height()), self.config.block_interval());
        let payload = block.to_bytes().map_err(DbError::from)?;
        let sent = self
            .registry
            .broadcast(&MessageEnvelope::new(MessageKind::BlockArrived, payload), None);
        info!(height = block.height(), hash = %block.hash_hex(), peers = sent, "block published");
        Ok(block)
    }

    /// Hands out the queue of validated inbound transactions. Only the first
    /// caller gets it.
    pub fn take_transactions(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.transactions.lock().take()
    }

    // -- Accessors ----------------------------------------------------------

    pub fn stats(&self) -> NodeStats {
        NodeStats {
            self_ip: self.topology.self_ip().to_string(),
            super_node: self.topology.is_super_node(),
            active_connections: self.registry.active_count(),
            passive_connections: self.registry.passive_count(),
            known_peers: self.topology.peers().len(),
            chain_height: self.chain.height(),
            syncing: self.sync.is_syncing(),
            master: self.election.current_master(),
            dispatched: self.dispatcher.dispatched_count(),
            rejected: self.dispatcher.rejected_count(),
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn chain(&self) -> &Arc<Chain> {
        &self.chain
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    pub fn correlator(&self) -> &Arc<RequestCorrelator> {
        &self.correlator
    }

    pub fn topology(&self) -> &Arc<PeerTopology> {
        &self.topology
    }

    pub fn sync(&self) -> &Arc<BlockSyncEngine> {
        &self.sync
    }

    pub fn election(&self) -> &Arc<MasterElection> {
        &self.election
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }
}
