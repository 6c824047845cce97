//! # CLI Interface
//!
//! Command-line arguments for `peerchain-node`, via `clap` derive. Every
//! flag that overrides the config file can also come from a `PEERCHAIN_*`
//! environment variable.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::logging::LogFormat;

/// peerchain node.
///
/// Joins a permissioned peerchain network as a super node (when one of the
/// local addresses is in the roster) or as a normal node, keeps its chain in
/// sync, and exposes Prometheus metrics.
#[derive(Parser, Debug)]
#[command(
    name = "peerchain-node",
    about = "peerchain super/normal node",
    version,
    propagate_version = true
)]
pub struct PeerchainCli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the node.
    Run(RunArgs),
    /// Create the data directory and write a default config file.
    Init(InitArgs),
    /// Load and validate a super-node roster, then print it.
    Roster(RosterArgs),
    /// Print version information and exit.
    Version,
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Path to the node configuration file (JSON).
    ///
    /// When omitted, the node reads `config.json` from the data directory if
    /// it exists and falls back to built-in defaults otherwise.
    #[arg(long, short = 'c', env = "PEERCHAIN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory for the chain database and the peer table.
    #[arg(long, short = 'd', env = "PEERCHAIN_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Super-node roster file. Relative paths resolve against the data
    /// directory.
    #[arg(long, short = 'r', env = "PEERCHAIN_ROSTER")]
    pub roster: Option<PathBuf>,

    /// Port for P2P traffic. Every node on a network uses the same one.
    #[arg(long, env = "PEERCHAIN_P2P_PORT")]
    pub p2p_port: Option<u16>,

    /// Port for the Prometheus metrics endpoint.
    #[arg(long, env = "PEERCHAIN_METRICS_PORT", default_value_t = peerchain_protocol::config::DEFAULT_METRICS_PORT)]
    pub metrics_port: u16,

    /// Addresses this host answers on, comma separated.
    #[arg(long, env = "PEERCHAIN_LOCAL_IPS", value_delimiter = ',')]
    pub local_ips: Vec<String>,

    /// Log output format.
    #[arg(long, env = "PEERCHAIN_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

#[derive(Parser, Debug)]
pub struct InitArgs {
    /// Data directory to initialize.
    #[arg(long, short = 'd', env = "PEERCHAIN_DATA_DIR", default_value = "data")]
    pub data_dir: PathBuf,

    /// Overwrite an existing config file.
    #[arg(long)]
    pub force: bool,
}

#[derive(Parser, Debug)]
pub struct RosterArgs {
    /// Roster file to check.
    pub path: PathBuf,
}
