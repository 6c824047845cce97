//! # Protocol Configuration & Constants
//!
//! Every tunable number in peerchain lives here, and so does the node
//! configuration file. Components read their defaults from these constants;
//! operators override them through `NodeConfig`.
//!
//! Changing `MAX_FRAME_LENGTH` or the message kind codes in
//! `network::message` breaks compatibility with every other node on the
//! network. Changing the
//! connection ceilings only changes how greedy this node is.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::network::consensus::ElectionConfig;
use crate::network::correlator::CorrelatorConfig;
use crate::network::sync::SyncConfig;
use crate::network::topology::TopologyConfig;

// ---------------------------------------------------------------------------
// Protocol Version
// ---------------------------------------------------------------------------

/// The full protocol version string.
pub const PROTOCOL_VERSION: &str = "0.1.0";

/// Largest frame the transport will accept. Blocks are the biggest payload
/// on the wire; 16 MiB leaves plenty of headroom.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Network Parameters
// ---------------------------------------------------------------------------

/// Default P2P listening port. Every node on the network listens on the same
/// port, so peers are identified by IP alone.
pub const DEFAULT_P2P_PORT: u16 = 8628;

/// Default metrics (Prometheus) port.
pub const DEFAULT_METRICS_PORT: u16 = 8629;

/// Ceiling on connections a normal node initiates.
pub const MAX_ACTIVE_CONNECT_COUNT: usize = 10;

/// Ceiling on connections a super node initiates. Super nodes are the
/// backbone, so they are allowed to reach much further.
pub const MAX_SUPER_ACTIVE_CONNECT_COUNT: usize = 50;

/// Ceiling on inbound connections before join requests are refused.
pub const MAX_PASSIVE_CONNECT_COUNT: usize = 200;

/// How many peers a joining normal node tries to learn about before it stops
/// asking further roster nodes.
pub const TARGET_PEER_COUNT: usize = 8;

/// Time allowed to establish a TCP connection.
pub const PEER_CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Heartbeat period for connection health checks.
pub const PEER_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Default timeout for a correlated request/response round trip.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Inbound envelopes buffered ahead of the dispatcher.
pub const INBOUND_QUEUE_CAPACITY: usize = 1024;

/// Envelopes buffered per source peer once they have left the inbound
/// queue. A peer that overruns its lane has the excess dropped.
pub const DISPATCH_LANE_CAPACITY: usize = 256;

/// A per-peer dispatch lane with nothing to do for this long is closed.
pub const DISPATCH_LANE_IDLE: Duration = Duration::from_secs(30);

/// Validated transactions buffered for the block assembler.
pub const TRANSACTION_QUEUE_CAPACITY: usize = 10_000;

// ---------------------------------------------------------------------------
// Trust Scoring
// ---------------------------------------------------------------------------

/// Trust assigned to a peer learned from someone else's peer list.
pub const INITIAL_PEER_TRUST: u32 = 1;

/// Trust never grows past this. Keeps one long-lived peer from becoming
/// impossible to evict after it goes away.
pub const MAX_PEER_TRUST: u32 = 10;

// ---------------------------------------------------------------------------
// Chain Timing
// ---------------------------------------------------------------------------

/// Expected interval between blocks. Doubles as the TTL for the
/// block-arrival dedup cache.
pub const BLOCK_GEN_TIME: Duration = Duration::from_secs(5);

/// How often expired cache entries are swept.
pub const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Number of blocks fetched before a commit pass during catch-up sync.
pub const SYNC_BATCH_SIZE: u64 = 16;

/// Consecutive failed fetches after which a sync run gives up.
pub const SYNC_MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Largest lead over the local height a peer may claim before its height
/// report is discarded.
pub const SYNC_MAX_HEIGHT_LEAD: u64 = 100_000_000;

// ---------------------------------------------------------------------------
// Node Configuration
// ---------------------------------------------------------------------------

/// Errors raised while loading a configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Top-level node configuration.
///
/// Every field has a default, so an empty JSON object (`{}`) is a valid
/// config file. Component sections are nested under their own keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Directory holding the chain database and the peer table.
    pub data_dir: PathBuf,
    /// Path to the super-node roster (JSON). Relative paths are resolved
    /// against `data_dir`.
    pub roster_path: PathBuf,
    /// Addresses this host answers on. Used to decide whether we are a super
    /// node and to recognise our own IP in peer lists. When empty the node
    /// uses `127.0.0.1`.
    pub local_ips: Vec<String>,
    /// Expected block interval in milliseconds; also the dedup TTL.
    pub block_interval_ms: u64,
    /// Period of the dedup cache sweep in milliseconds.
    pub cache_sweep_interval_ms: u64,
    pub topology: TopologyConfig,
    pub correlator: CorrelatorConfig,
    pub sync: SyncConfig,
    pub election: ElectionConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            roster_path: PathBuf::from("super_nodes.json"),
            local_ips: Vec::new(),
            block_interval_ms: BLOCK_GEN_TIME.as_millis() as u64,
            cache_sweep_interval_ms: CACHE_SWEEP_INTERVAL.as_millis() as u64,
            topology: TopologyConfig::default(),
            correlator: CorrelatorConfig::default(),
            sync: SyncConfig::default(),
            election: ElectionConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Loads a configuration from a JSON file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Where the sled database lives.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("db")
    }

    /// Where the persisted peer table lives.
    pub fn peer_table_path(&self) -> PathBuf {
        self.data_dir.join("peers.json")
    }

    /// The roster path, resolved against the data directory.
    pub fn resolved_roster_path(&self) -> PathBuf {
        if self.roster_path.is_absolute() {
            self.roster_path.clone()
        } else {
            self.data_dir.join(&self.roster_path)
        }
    }

    pub fn block_interval(&self) -> Duration {
        Duration::from_millis(self.block_interval_ms)
    }

    pub fn cache_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.cache_sweep_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ceilings_sanity() {
        // A super node that can reach fewer peers than a normal node would
        // defeat the point of the tier.
        assert!(MAX_SUPER_ACTIVE_CONNECT_COUNT > MAX_ACTIVE_CONNECT_COUNT);
        assert!(TARGET_PEER_COUNT <= MAX_ACTIVE_CONNECT_COUNT);
    }

    #[test]
    fn test_trust_bounds() {
        assert!(INITIAL_PEER_TRUST > 0);
        assert!(INITIAL_PEER_TRUST <= MAX_PEER_TRUST);
    }

    #[test]
    fn test_timing_constants_sanity() {
        assert!(REQUEST_TIMEOUT < PEER_HEARTBEAT_INTERVAL);
        assert!(BLOCK_GEN_TIME.as_millis() > 0);
        assert!(CACHE_SWEEP_INTERVAL >= BLOCK_GEN_TIME);
    }

    #[test]
    fn test_empty_json_is_default_config() {
        let config: NodeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.block_interval_ms, BLOCK_GEN_TIME.as_millis() as u64);
        assert_eq!(config.topology.p2p_port, DEFAULT_P2P_PORT);
        assert_eq!(config.sync.batch_size, SYNC_BATCH_SIZE);
        assert!(config.local_ips.is_empty());
    }

    #[test]
    fn test_partial_section_override() {
        let config: NodeConfig = serde_json::from_str(
            r#"{ "topology": { "max_active_connections": 3 }, "local_ips": ["10.0.0.7"] }"#,
        )
        .unwrap();
        assert_eq!(config.topology.max_active_connections, 3);
        // Untouched fields in the same section keep their defaults.
        assert_eq!(
            config.topology.max_super_active_connections,
            MAX_SUPER_ACTIVE_CONNECT_COUNT
        );
        assert_eq!(config.local_ips, vec!["10.0.0.7".to_string()]);
    }

    #[test]
    fn test_from_json_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{ not json").unwrap();
        let err = NodeConfig::from_json_file(&path).unwrap_err();
        assert!(err.to_string().contains("broken.json"));
    }

    #[test]
    fn test_roster_path_resolution() {
        let mut config = NodeConfig {
            data_dir: PathBuf::from("/var/lib/peerchain"),
            ..NodeConfig::default()
        };
        assert_eq!(
            config.resolved_roster_path(),
            PathBuf::from("/var/lib/peerchain/super_nodes.json")
        );
        config.roster_path = PathBuf::from("/etc/peerchain/roster.json");
        assert_eq!(
            config.resolved_roster_path(),
            PathBuf::from("/etc/peerchain/roster.json")
        );
    }
}
