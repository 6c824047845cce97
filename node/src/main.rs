// Copyright (c) 2026 The peerchain Authors. MIT License.
// See LICENSE for details.

//! # peerchain Node
//!
//! Entry point for the `peerchain-node` binary. Parses CLI arguments,
//! initializes logging and metrics, opens the chain database, brings the
//! node onto the network and runs until Ctrl+C or SIGTERM.
//!
//! Subcommands:
//!
//! - `run`     — start the node
//! - `init`    — create the data directory and a default config file
//! - `roster`  — validate and print a super-node roster
//! - `version` — print build version information

mod cli;
mod logging;
mod metrics;

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;

use peerchain_protocol::config::{NodeConfig, PROTOCOL_VERSION};
use peerchain_protocol::network::{PeerNode, SuperNodeRoster, TcpTransport, Transport};
use peerchain_protocol::storage::ChainDB;

use cli::{Commands, PeerchainCli};
use logging::LogFormat;
use metrics::NodeMetrics;

/// How often node stats are copied into the Prometheus gauges.
const METRICS_SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = PeerchainCli::parse();

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Init(args) => init_node(args),
        Commands::Roster(args) => show_roster(args),
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Reads the config file and applies CLI overrides on top.
fn load_config(args: &cli::RunArgs) -> Result<NodeConfig> {
    let explicit = args.config.clone();
    let implicit = args
        .data_dir
        .clone()
        .map(|dir| dir.join("config.json"))
        .filter(|path| path.exists());

    let mut config = match explicit.or(implicit) {
        Some(path) => NodeConfig::from_json_file(&path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => NodeConfig::default(),
    };

    if let Some(dir) = &args.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(roster) = &args.roster {
        config.roster_path = roster.clone();
    }
    if let Some(port) = args.p2p_port {
        config.topology.p2p_port = port;
    }
    if !args.local_ips.is_empty() {
        config.local_ips = args.local_ips.clone();
    }
    Ok(config)
}

/// Starts the node and blocks until a shutdown signal arrives.
async fn run_node(args: cli::RunArgs) -> Result<()> {
    logging::init_logging(logging::DEFAULT_FILTER, args.log_format);

    let config = load_config(&args)?;
    tracing::info!(
        p2p_port = config.topology.p2p_port,
        metrics_port = args.metrics_port,
        data_dir = %config.data_dir.display(),
        "starting peerchain-node"
    );

    // --- Roster ---
    let roster_path = config.resolved_roster_path();
    let roster = SuperNodeRoster::load(&roster_path)
        .with_context(|| format!("failed to load roster {}", roster_path.display()))?;
    tracing::info!(super_nodes = roster.len(), path = %roster_path.display(), "roster loaded");

    // --- Persistent storage ---
    let db_path = config.db_path();
    std::fs::create_dir_all(&db_path)
        .with_context(|| format!("failed to create database directory: {}", db_path.display()))?;
    let db = Arc::new(
        ChainDB::open(&db_path)
            .with_context(|| format!("failed to open database at {}", db_path.display()))?,
    );
    tracing::info!(path = %db_path.display(), "database opened");

    // --- Node ---
    let p2p_port = config.topology.p2p_port;
    let mut tcp: Option<Arc<TcpTransport>> = None;
    let node = Arc::new(
        PeerNode::new(config, roster, db, |registry, inbound| {
            let transport = Arc::new(TcpTransport::new(registry, inbound));
            tcp = Some(transport.clone());
            transport as Arc<dyn Transport>
        })
        .context("failed to build node")?,
    );
    let tcp = tcp.context("transport was not constructed")?;

    let listen_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, p2p_port));
    let listener = tcp
        .listen(listen_addr, node.shutdown_signal())
        .await
        .with_context(|| format!("failed to bind p2p listener on {listen_addr}"))?;

    node.start().await.context("failed to start node")?;
    let stats = node.stats();
    tracing::info!(
        self_ip = %stats.self_ip,
        super_node = stats.super_node,
        peers = stats.active_connections + stats.passive_connections,
        height = stats.chain_height,
        "node running"
    );

    // No block assembler runs in this binary; keep the queue drained.
    if let Some(mut transactions) = node.take_transactions() {
        tokio::spawn(async move {
            while let Some(tx) = transactions.recv().await {
                tracing::debug!(bytes = tx.len(), "transaction accepted");
            }
        });
    }

    // --- Metrics ---
    let node_metrics = Arc::new(NodeMetrics::new().context("failed to create metrics")?);
    let sampler = {
        let node = node.clone();
        let node_metrics = node_metrics.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(METRICS_SAMPLE_INTERVAL);
            loop {
                interval.tick().await;
                node_metrics.observe(&node.stats());
            }
        })
    };
    let metrics_router = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics::metrics_handler))
        .with_state(node_metrics);
    let metrics_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, args.metrics_port));
    let metrics_listener = tokio::net::TcpListener::bind(metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {metrics_addr}"))?;
    tracing::info!(addr = %metrics_addr, "metrics server listening");

    // --- Serve ---
    tokio::select! {
        res = axum::serve(metrics_listener, metrics_router) => {
            if let Err(e) = res {
                tracing::error!(error = %e, "metrics server error");
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
        }
    }

    sampler.abort();
    node.shutdown().await;
    if let Err(e) = listener.await {
        tracing::warn!(error = %e, "p2p listener task failed");
    }
    tracing::info!("peerchain-node stopped");
    Ok(())
}

/// Creates the data directory and writes a default `config.json`.
fn init_node(args: cli::InitArgs) -> Result<()> {
    logging::init_logging(logging::DEFAULT_FILTER, LogFormat::Pretty);

    let data_dir = &args.data_dir;
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

    let config_path = data_dir.join("config.json");
    if config_path.exists() && !args.force {
        anyhow::bail!(
            "{} already exists; pass --force to overwrite",
            config_path.display()
        );
    }

    let config = NodeConfig {
        data_dir: data_dir.clone(),
        ..NodeConfig::default()
    };
    let json = serde_json::to_string_pretty(&config)?;
    std::fs::write(&config_path, json)
        .with_context(|| format!("failed to write {}", config_path.display()))?;
    tracing::info!(path = %config_path.display(), "config written");

    println!("Node initialized.");
    println!("  Data directory : {}", data_dir.display());
    println!("  Config         : {}", config_path.display());
    println!("  Roster         : {}", config.resolved_roster_path().display());
    Ok(())
}

fn show_roster(args: cli::RosterArgs) -> Result<()> {
    let roster = SuperNodeRoster::load(&args.path)
        .with_context(|| format!("failed to load roster {}", args.path.display()))?;
    println!("{} super nodes", roster.len());
    for record in roster.records() {
        println!(
            "  {:>4}  {:<39}  {}",
            record.code,
            record.ip,
            record.stake_address_hex()
        );
    }
    Ok(())
}

fn print_version() {
    println!("peerchain-node {}", env!("CARGO_PKG_VERSION"));
    println!("protocol       {}", PROTOCOL_VERSION);
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
