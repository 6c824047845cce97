//! # Peer Topology Manager
//!
//! Decides who this node talks to. The network has two tiers:
//!
//! ```text
//!        ┌─────────┐      ┌─────────┐      ┌─────────┐
//!        │ super A │──────│ super B │──────│ super C │     roster, static
//!        └────┬────┘      └────┬────┘      └─────────┘
//!             │                │
//!        ┌────┴────┐      ┌────┴────┐
//!        │ normal  │──────│ normal  │                      peer table, learned
//!        └─────────┘      └─────────┘
//! ```
//!
//! A node is a super node if any of its local addresses is in the roster.
//! Super nodes connect to every other super node, up to
//! `max_super_active_connections`. Normal nodes keep a persisted peer table
//! with a trust counter per peer and connect to the most trusted peers, up
//! to `max_active_connections`. If a normal node ends up with no active
//! connection at all, it falls back to joining through the super nodes
//! under the super-node ceiling.
//!
//! ## Join Handshake
//!
//! Before dialing a peer for keeps, a node asks permission with `NodeJoin`
//! (payload: our IP). The peer answers `NodeJoinResp` with `"true"` or
//! `"false"` depending on its inbound headroom. The ask goes over the
//! existing connection if there is one, otherwise over a temporary
//! connection that is closed right after. Peer lists (`NodesReq`) are
//! fetched the same way.
//!
//! Dial failures never propagate: they become [`ConnectStatus::Fail`] and a
//! trust decrement.

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::correlator::{expect_kind, RequestCorrelator};
use super::error::{NetworkError, NetworkResult};
use super::message::{MessageEnvelope, MessageKind};
use super::peer_table::PeerTable;
use super::registry::{ChannelRegistry, Connection};
use super::roster::{SuperNodeRecord, SuperNodeRoster};
use super::transport::Transport;
use crate::config;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    /// Port every node listens on.
    pub p2p_port: u16,
    /// Outbound ceiling for normal nodes.
    pub max_active_connections: usize,
    /// Outbound ceiling for super nodes.
    pub max_super_active_connections: usize,
    /// Inbound ceiling; join requests beyond it are refused.
    pub max_passive_connections: usize,
    /// Peers a joining node tries to learn before it stops asking the roster.
    pub target_peer_count: usize,
    /// Cap on a peer's trust counter.
    pub max_peer_trust: u32,
    /// Period of the maintenance pass in milliseconds.
    pub heartbeat_interval_ms: u64,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            p2p_port: config::DEFAULT_P2P_PORT,
            max_active_connections: config::MAX_ACTIVE_CONNECT_COUNT,
            max_super_active_connections: config::MAX_SUPER_ACTIVE_CONNECT_COUNT,
            max_passive_connections: config::MAX_PASSIVE_CONNECT_COUNT,
            target_peer_count: config::TARGET_PEER_COUNT,
            max_peer_trust: config::MAX_PEER_TRUST,
            heartbeat_interval_ms: config::PEER_HEARTBEAT_INTERVAL.as_millis() as u64,
        }
    }
}

/// Result of [`PeerTopology::connect_by_ip`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStatus {
    /// Connected, or already was.
    Ok,
    /// Dial or registration failed.
    Fail,
    /// The outbound ceiling is reached. Callers stop trying further peers.
    Full,
}

/// What one maintenance pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub alive: usize,
    pub dropped: usize,
    pub rejoined: bool,
}

// ---------------------------------------------------------------------------
// PeerTopology
// ---------------------------------------------------------------------------

pub struct PeerTopology {
    config: TopologyConfig,
    roster: SuperNodeRoster,
    local_ips: Vec<String>,
    self_ip: String,
    super_node: bool,
    registry: Arc<ChannelRegistry>,
    correlator: Arc<RequestCorrelator>,
    transport: Arc<dyn Transport>,
    peers: PeerTable,
    // Join passes (init, fallback, maintenance rejoin) never overlap.
    join_lock: tokio::sync::Mutex<()>,
}

impl PeerTopology {
    /// Builds the manager and decides the node's role. A normal node loads
    /// its peer table from `peer_table_path`; a super node keeps its table
    /// in memory.
    pub fn new(
        config: TopologyConfig,
        roster: SuperNodeRoster,
        local_ips: Vec<String>,
        peer_table_path: Option<&Path>,
        registry: Arc<ChannelRegistry>,
        correlator: Arc<RequestCorrelator>,
        transport: Arc<dyn Transport>,
    ) -> io::Result<Self> {
        let local_ips = if local_ips.is_empty() {
            vec!["127.0.0.1".to_string()]
        } else {
            local_ips
        };
        let roster_ip = local_ips.iter().find(|ip| roster.contains(ip)).cloned();
        let super_node = roster_ip.is_some();
        let self_ip = roster_ip.unwrap_or_else(|| local_ips[0].clone());

        let peers = match peer_table_path {
            Some(path) if !super_node => PeerTable::load(path)?,
            _ => PeerTable::in_memory(),
        }
        .with_max_trust(config.max_peer_trust);

        info!(
            self_ip = %self_ip,
            super_node,
            roster = roster.len(),
            known_peers = peers.len(),
            "peer topology ready"
        );

        Ok(Self {
            config,
            roster,
            local_ips,
            self_ip,
            super_node,
            registry,
            correlator,
            transport,
            peers,
            join_lock: tokio::sync::Mutex::new(()),
        })
    }

    // -- Role & identity ----------------------------------------------------

    pub fn is_super_node(&self) -> bool {
        self.super_node
    }

    pub fn self_ip(&self) -> &str {
        &self.self_ip
    }

    pub fn is_self_ip(&self, ip: &str) -> bool {
        ip == self.self_ip || self.local_ips.iter().any(|own| own == ip)
    }

    pub fn get_super_nodes(&self) -> Vec<SuperNodeRecord> {
        self.roster.records()
    }

    pub fn super_node_by_ip(&self, ip: &str) -> Option<SuperNodeRecord> {
        self.roster.get(ip).cloned()
    }

    pub fn roster(&self) -> &SuperNodeRoster {
        &self.roster
    }

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    pub fn config(&self) -> &TopologyConfig {
        &self.config
    }

    /// Roster nodes other than ourselves, in roster order.
    fn other_super_ips(&self) -> Vec<String> {
        self.roster
            .ips()
            .into_iter()
            .filter(|ip| !self.is_self_ip(ip))
            .collect()
    }

    fn active_ceiling(&self) -> usize {
        if self.super_node {
            self.config.max_super_active_connections
        } else {
            self.config.max_active_connections
        }
    }

    // -- Join ---------------------------------------------------------------

    /// Forms the initial peer set. Returns the number of active connections
    /// afterwards.
    pub async fn init(&self) -> usize {
        let _join = self.join_lock.lock().await;
        if self.super_node {
            self.super_node_join().await;
        } else {
            self.normal_node_join().await;
        }
        self.save_peers();
        let active = self.registry.active_count();
        info!(active, known_peers = self.peers.len(), "topology initialised");
        active
    }

    async fn normal_node_join(&self) {
        if self.peers.is_empty() {
            for ip in self.other_super_ips() {
                if self.peers.len() >= self.config.target_peer_count {
                    break;
                }
                if !self.nodes_join_broadcast(&ip).await {
                    continue;
                }
                self.peers.record_success(&ip);
                if let Err(e) = self.get_peers_online(&ip).await {
                    debug!(peer = %ip, error = %e, "peer list fetch failed");
                }
            }
        }

        for (ip, _) in self.peers.candidates() {
            if self.is_self_ip(&ip) || self.registry.has_active(&ip) {
                continue;
            }
            if !self.nodes_join_broadcast(&ip).await {
                self.peers.record_failure(&ip);
                continue;
            }
            match self.connect_by_ip(&ip).await {
                ConnectStatus::Ok => {
                    self.peers.record_success(&ip);
                    if let Err(e) = self.get_peers_online(&ip).await {
                        debug!(peer = %ip, error = %e, "peer list fetch failed");
                    }
                }
                ConnectStatus::Fail => {
                    self.peers.record_failure(&ip);
                }
                ConnectStatus::Full => break,
            }
        }

        if self.registry.active_count() == 0 {
            info!("no active connection after join, falling back to super nodes");
            self.super_node_join().await;
        }
    }

    async fn super_node_join(&self) {
        let mut supers = self.other_super_ips();
        supers.shuffle(&mut rand::thread_rng());
        info!(self_ip = %self.self_ip, super_nodes = supers.len(), "joining through super nodes");

        // One reachable super node is enough to learn the current peers.
        let mut reached = false;
        for ip in &supers {
            match self.get_peers_online(ip).await {
                Ok(_) => {
                    reached = true;
                    break;
                }
                Err(e) => debug!(peer = %ip, error = %e, "super node unreachable"),
            }
        }
        if !reached {
            warn!("no super node reachable");
            return;
        }
        self.connect_all_super_nodes(&supers).await;
    }

    /// Connects to the super nodes in `supers` until the super-node ceiling
    /// is reached. Only successful connections count against it, so an
    /// unreachable node does not cost a slot. A normal node falling back to
    /// the super nodes uses the same ceiling.
    async fn connect_all_super_nodes(&self, supers: &[String]) {
        let ceiling = self.config.max_super_active_connections;
        let mut budget = ceiling.saturating_sub(self.registry.active_count());
        for ip in supers {
            if budget == 0 {
                break;
            }
            if self.registry.has_active(ip) || !self.nodes_join_broadcast(ip).await {
                continue;
            }
            match self.connect_within(ip, ceiling).await {
                ConnectStatus::Ok => {
                    self.peers.record_success(ip);
                    info!(peer = %ip, "connected to super node");
                    budget -= 1;
                }
                ConnectStatus::Fail => {}
                ConnectStatus::Full => break,
            }
        }
    }

    /// Opens an active connection to `ip` unless the outbound ceiling is
    /// reached. Already being connected counts as `Ok`.
    pub async fn connect_by_ip(&self, ip: &str) -> ConnectStatus {
        self.connect_within(ip, self.active_ceiling()).await
    }

    async fn connect_within(&self, ip: &str, ceiling: usize) -> ConnectStatus {
        let active = self.registry.active_count();
        if active >= ceiling {
            debug!(peer = ip, active, ceiling, "outbound ceiling reached");
            return ConnectStatus::Full;
        }
        if self.registry.has_active(ip) {
            return ConnectStatus::Ok;
        }
        match self.dial_active(ip).await {
            Ok(_) => {
                info!(peer = ip, active = active + 1, "peer connected");
                ConnectStatus::Ok
            }
            Err(e) => {
                debug!(peer = ip, error = %e, "connect failed");
                ConnectStatus::Fail
            }
        }
    }

    async fn dial_active(&self, ip: &str) -> NetworkResult<Connection> {
        let conn = self.transport.dial(ip, self.config.p2p_port).await?;
        if let Err(e) = self.registry.add_connection(conn.clone(), true) {
            conn.close();
            return Err(e);
        }
        Ok(conn)
    }

    /// Runs `f` against `ip` over the existing connection, or over a
    /// temporary one that is removed afterwards.
    async fn with_connection<T, F, Fut>(&self, ip: &str, f: F) -> NetworkResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = NetworkResult<T>>,
    {
        let temporary = if self.registry.is_connected(ip) {
            None
        } else {
            Some(self.dial_active(ip).await?)
        };
        let result = f().await;
        if let Some(conn) = temporary {
            self.registry.remove_connection(&conn);
        }
        result
    }

    async fn request_peer_list(&self, ip: &str) -> NetworkResult<HashMap<String, u32>> {
        let resp = self
            .correlator
            .request_default(MessageEnvelope::empty(MessageKind::NodesReq), ip)
            .await?;
        let resp = expect_kind(resp, MessageKind::NodesResp)?;
        Ok(serde_json::from_slice(resp.payload())?)
    }

    async fn request_join(&self, ip: &str) -> NetworkResult<bool> {
        let req = MessageEnvelope::new(MessageKind::NodeJoin, self.self_ip.clone());
        let resp = self.correlator.request_default(req, ip).await?;
        let resp = expect_kind(resp, MessageKind::NodeJoinResp)?;
        Ok(resp.payload_str().eq_ignore_ascii_case("true"))
    }

    /// Fetches `ip`'s peer list, drops our own addresses from it and merges
    /// the rest into the peer table.
    pub async fn get_peers_online(&self, ip: &str) -> NetworkResult<HashMap<String, u32>> {
        let mut peers = self
            .with_connection(ip, move || self.request_peer_list(ip))
            .await?;
        peers.retain(|peer, _| !self.is_self_ip(peer));
        let added = self
            .peers
            .merge(peers.iter().map(|(ip, trust)| (ip.clone(), *trust)));
        debug!(peer = ip, listed = peers.len(), added, "peer list merged");
        Ok(peers)
    }

    /// Asks `ip` whether we may join it. Any failure is a refusal.
    pub async fn nodes_join_broadcast(&self, ip: &str) -> bool {
        let asked = self
            .with_connection(ip, move || self.request_join(ip))
            .await;
        match asked {
            Ok(accepted) => {
                debug!(peer = ip, accepted, "join answered");
                accepted
            }
            Err(e) => {
                debug!(peer = ip, error = %e, "join request failed");
                false
            }
        }
    }

    /// Whether we take a joining node at `ip`. Accepted nodes are added to
    /// the peer table so later peer-list requests hand them out.
    pub fn accept_join(&self, ip: &str) -> bool {
        if self.is_self_ip(ip) {
            return false;
        }
        let passive = self.registry.passive_count();
        if passive >= self.config.max_passive_connections {
            info!(peer = ip, passive, "join refused, inbound ceiling reached");
            return false;
        }
        self.peers.merge([(ip.to_string(), config::INITIAL_PEER_TRUST)]);
        true
    }

    /// The peer list we hand out: the peer table plus anyone connected,
    /// minus the requester.
    pub fn peers_for(&self, requester: &str) -> HashMap<String, u32> {
        let mut listed = self.peers.snapshot();
        for ip in self.registry.connected_ips() {
            listed.entry(ip).or_insert(config::INITIAL_PEER_TRUST);
        }
        listed.remove(requester);
        listed.retain(|_, trust| *trust > 0);
        listed
    }

    /// Forgets a peer that announced its exit.
    pub fn handle_exit(&self, ip: &str) {
        let closed = self.registry.close_peer(ip);
        let cancelled = self.correlator.cancel_peer(ip);
        self.peers.remove(ip);
        info!(peer = ip, closed, cancelled, "peer exited");
    }

    /// Tells every connected peer that we are leaving.
    pub fn announce_exit(&self) -> usize {
        let exit = MessageEnvelope::new(MessageKind::NodeExit, self.self_ip.clone());
        self.registry.broadcast(&exit, None)
    }

    pub fn save_peers(&self) {
        if let Err(e) = self.peers.save() {
            warn!(error = %e, "failed to persist peer table");
        }
    }

    // -- Maintenance --------------------------------------------------------

    async fn heartbeat(&self, ip: &str) -> NetworkResult<()> {
        let resp = self
            .correlator
            .request_default(MessageEnvelope::empty(MessageKind::HeartbeatReq), ip)
            .await?;
        expect_kind(resp, MessageKind::HeartbeatResp).map(|_| ())
    }

    /// Heartbeats every connected peer, drops the ones that do not answer
    /// and rejoins if no active connection is left.
    pub async fn maintain(&self) -> MaintenanceReport {
        let ips = self.registry.connected_ips();
        let results = join_all(ips.iter().map(|ip| self.heartbeat(ip))).await;

        let mut report = MaintenanceReport::default();
        for (ip, result) in ips.iter().zip(results) {
            match result {
                Ok(()) => report.alive += 1,
                Err(e) => {
                    debug!(peer = %ip, error = %e, "heartbeat failed, dropping peer");
                    self.drop_peer(ip, &e);
                    report.dropped += 1;
                }
            }
        }

        if self.registry.active_count() == 0 {
            let _join = self.join_lock.lock().await;
            if self.registry.active_count() == 0 {
                if self.super_node {
                    self.super_node_join().await;
                } else {
                    self.normal_node_join().await;
                }
                report.rejoined = true;
            }
        }
        self.save_peers();
        if report.dropped > 0 || report.rejoined {
            info!(
                alive = report.alive,
                dropped = report.dropped,
                rejoined = report.rejoined,
                active = self.registry.active_count(),
                "topology maintenance"
            );
        }
        report
    }

    fn drop_peer(&self, ip: &str, cause: &NetworkError) {
        self.registry.close_peer(ip);
        self.correlator.cancel_peer(ip);
        if self.peers.record_failure(ip).is_none() {
            debug!(peer = ip, cause = %cause, "peer evicted");
        }
    }

    /// Runs [`maintain`](Self::maintain) every heartbeat interval until
    /// `shutdown` flips to `true`.
    pub fn spawn_maintenance(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let period = Duration::from_millis(self.config.heartbeat_interval_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.maintain().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("topology maintenance stopped");
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
