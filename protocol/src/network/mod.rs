//! # Network Module
//!
//! Everything between the socket and the chain: envelopes, the connection
//! registry, request/response correlation, dispatch, peer topology, master
//! election, and block sync.
//!
//! ## Architecture
//!
//! ```text
//! message.rs     — Envelope, kind registry, wire frame
//! registry.rs    — Live connections by peer and direction
//! transport.rs   — Transport trait, TCP implementation
//! memory.rs      — In-process transport for tests and benches
//! correlator.rs  — Sequence-numbered request/response
//! dispatcher.rs  — Validator + handler chain per message kind
//! validators.rs  — Block, transaction and membership admission checks
//! handlers.rs    — Heartbeat, peer list, join/exit, block relay, tx intake
//! cache.rs       — TTL dedup cache with a sweeper task
//! peer_table.rs  — Trust-scored peer table persisted as JSON
//! roster.rs      — Static super-node roster
//! topology.rs    — Join, connection ceilings, maintenance
//! consensus.rs   — Master election among super nodes
//! sync.rs        — Catch-up sync and its serving side
//! node.rs        — PeerNode, the lifecycle owner
//! ```
//!
//! ## Design Decisions
//!
//! - Inbound frames from every connection feed one bounded queue. The
//!   dispatcher splits it into one serial lane per source peer, so each
//!   peer's envelopes are handled in arrival order while peers proceed
//!   independently. Responses bypass the lanes and go straight to the
//!   correlator, so a handler blocked on a correlated request never holds
//!   up its own answer.
//! - Shared tables are `DashMap`s; small state that is read far more often
//!   than written (chain head, master, peer table) sits behind
//!   `parking_lot::RwLock`. No lock is held across an `.await`.
//! - Peers are identified by IP. Every node listens on the same port.

pub mod cache;
pub mod consensus;
pub mod correlator;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod memory;
pub mod message;
pub mod node;
pub mod peer_table;
pub mod registry;
pub mod roster;
pub mod sync;
pub mod topology;
pub mod transport;
pub mod validators;

pub use cache::TtlCache;
pub use consensus::{
    ElectionConfig, ElectionError, ElectionOutcome, ElectionPhase, ElectionPolicy, MajorityPolicy,
    MasterElection, MasterState, PolicyKind, UnilateralPolicy,
};
pub use correlator::{CorrelatorConfig, RequestCorrelator};
pub use dispatcher::{DispatchOutcome, Dispatcher, MessageHandler, MessageValidator};
pub use error::{NetworkError, NetworkResult};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use message::{MessageEnvelope, MessageKind};
pub use node::{NodeError, NodeStats, PeerNode};
pub use peer_table::PeerTable;
pub use registry::{ChannelRegistry, Connection, Direction};
pub use roster::{RosterError, SuperNodeRecord, SuperNodeRoster};
pub use sync::{BlockSyncEngine, SyncConfig, SyncError, SyncResult, SyncState};
pub use topology::{ConnectStatus, MaintenanceReport, PeerTopology, TopologyConfig};
pub use transport::{TcpTransport, Transport};
pub use validators::{
    BlockRejection, BlockVerifier, SignedTransaction, SignedTransactionVerifier,
    TransactionVerifier,
};
