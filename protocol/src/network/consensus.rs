//! # Master Election
//!
//! Super nodes agree on one of them as the current master. Everything
//! about block production that hangs off the master lives outside this
//! crate; this module only keeps track of who it is and runs the switch
//! protocol.
//!
//! ## Protocol
//!
//! ```text
//! Proposer (super)                     Every connected super node
//! ────────────────                     ──────────────────────────
//!   phase = ElectionPending
//!   │  NewMasterReq(candidate ip)         │
//!   │───────────────────────────────────> │ check_new_master(candidate)
//!   │  NewMasterResp "ok" | Error(reason) │   accept → adopt candidate
//!   │<─────────────────────────────────── │
//!   count oks (+1 for ourselves)
//!   oks >= quorum → adopt candidate
//!   phase = Stable
//! ```
//!
//! A timeout counts as a rejection. A node with an election of its own in
//! flight rejects other candidates until it is settled, which is what keeps
//! two concurrent proposals from both reaching quorum.
//!
//! ## Policies
//!
//! | Policy      | Accepts a candidate when                          | Quorum            |
//! |-------------|---------------------------------------------------|-------------------|
//! | `Majority`  | there is no master, or the master is unreachable  | roster / 2 + 1    |
//! | `Unilateral`| always                                            | 1 (the proposer)  |
//!
//! In both cases the candidate must be in the roster, and proposing the
//! current master is a no-op success.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::correlator::{expect_kind, RequestCorrelator};
use super::dispatcher::MessageHandler;
use super::error::NetworkError;
use super::message::{MessageEnvelope, MessageKind};
use super::registry::ChannelRegistry;
use super::topology::PeerTopology;
use crate::config;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    Majority,
    Unilateral,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ElectionConfig {
    pub policy: PolicyKind,
    /// Per-peer timeout for `NewMasterReq` and `MasterReq`, in milliseconds.
    pub request_timeout_ms: u64,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            policy: PolicyKind::Majority,
            request_timeout_ms: config::REQUEST_TIMEOUT.as_millis() as u64,
        }
    }
}

// ---------------------------------------------------------------------------
// Policies
// ---------------------------------------------------------------------------

/// What a policy gets to see when deciding on a candidate.
#[derive(Debug, Clone, Copy)]
pub struct ElectionContext<'a> {
    pub current_master: Option<&'a str>,
    /// Whether the current master is us or someone we are connected to.
    pub master_reachable: bool,
    pub roster_size: usize,
}

pub trait ElectionPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this node approves `candidate`. Roster membership has already
    /// been checked.
    fn accept(&self, ctx: &ElectionContext<'_>, candidate: &str) -> bool;

    /// Approvals, the proposer's included, needed to adopt a candidate.
    fn quorum(&self, roster_size: usize) -> usize;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MajorityPolicy;

impl ElectionPolicy for MajorityPolicy {
    fn name(&self) -> &'static str {
        "majority"
    }

    fn accept(&self, ctx: &ElectionContext<'_>, _candidate: &str) -> bool {
        ctx.current_master.is_none() || !ctx.master_reachable
    }

    fn quorum(&self, roster_size: usize) -> usize {
        roster_size / 2 + 1
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UnilateralPolicy;

impl ElectionPolicy for UnilateralPolicy {
    fn name(&self) -> &'static str {
        "unilateral"
    }

    fn accept(&self, _ctx: &ElectionContext<'_>, _candidate: &str) -> bool {
        true
    }

    fn quorum(&self, _roster_size: usize) -> usize {
        1
    }
}

impl PolicyKind {
    pub fn build(self) -> Arc<dyn ElectionPolicy> {
        match self {
            PolicyKind::Majority => Arc::new(MajorityPolicy),
            PolicyKind::Unilateral => Arc::new(UnilateralPolicy),
        }
    }
}

// ---------------------------------------------------------------------------
// State & errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElectionPhase {
    Stable,
    ElectionPending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterState {
    pub current_master: Option<String>,
    pub phase: ElectionPhase,
    /// Candidate of the election we are running, if any.
    pub pending_candidate: Option<String>,
}

impl Default for MasterState {
    fn default() -> Self {
        Self {
            current_master: None,
            phase: ElectionPhase::Stable,
            pending_candidate: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ElectionError {
    #[error("only super nodes run elections")]
    NotSuperNode,

    #[error("{0} is not a super node")]
    NotEligible(String),

    #[error("election for {candidate} already pending")]
    ElectionPending { candidate: String },

    #[error("candidate {candidate} refused, current master is {current}")]
    Refused { candidate: String, current: String },

    #[error("candidate {candidate} got {votes} of {quorum} required approvals")]
    QuorumNotReached {
        candidate: String,
        votes: usize,
        quorum: usize,
    },

    #[error("network error: {0}")]
    Network(#[from] NetworkError),
}

/// Tally of a successful proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElectionOutcome {
    pub votes: usize,
    pub quorum: usize,
}

// ---------------------------------------------------------------------------
// MasterElection
// ---------------------------------------------------------------------------

pub struct MasterElection {
    policy: Arc<dyn ElectionPolicy>,
    topology: Arc<PeerTopology>,
    registry: Arc<ChannelRegistry>,
    correlator: Arc<RequestCorrelator>,
    request_timeout: Duration,
    state: RwLock<MasterState>,
}

impl MasterElection {
    pub fn new(
        config: &ElectionConfig,
        topology: Arc<PeerTopology>,
        registry: Arc<ChannelRegistry>,
        correlator: Arc<RequestCorrelator>,
    ) -> Self {
        Self::with_policy(config.policy.build(), config, topology, registry, correlator)
    }

    pub fn with_policy(
        policy: Arc<dyn ElectionPolicy>,
        config: &ElectionConfig,
        topology: Arc<PeerTopology>,
        registry: Arc<ChannelRegistry>,
        correlator: Arc<RequestCorrelator>,
    ) -> Self {
        debug!(policy = policy.name(), "master election ready");
        Self {
            policy,
            topology,
            registry,
            correlator,
            request_timeout: Duration::from_millis(config.request_timeout_ms),
            state: RwLock::new(MasterState::default()),
        }
    }

    pub fn current_master(&self) -> Option<String> {
        self.state.read().current_master.clone()
    }

    pub fn phase(&self) -> ElectionPhase {
        self.state.read().phase
    }

    pub fn state(&self) -> MasterState {
        self.state.read().clone()
    }

    pub fn is_master(&self) -> bool {
        self.current_master()
            .map(|m| self.topology.is_self_ip(&m))
            .unwrap_or(false)
    }

    fn reachable(&self, ip: &str) -> bool {
        self.topology.is_self_ip(ip) || self.registry.is_connected(ip)
    }

    fn context<'a>(&self, state: &'a MasterState) -> ElectionContext<'a> {
        let current_master = state.current_master.as_deref();
        ElectionContext {
            current_master,
            master_reachable: current_master.map(|m| self.reachable(m)).unwrap_or(false),
            roster_size: self.topology.roster().len(),
        }
    }

    /// Decides on a candidate proposed by another super node. Accepting
    /// adopts it as our master.
    pub fn check_new_master(&self, candidate: &str) -> Result<(), ElectionError> {
        let mut state = self.state.write();
        if state.current_master.as_deref() == Some(candidate) {
            return Ok(());
        }
        if !self.topology.roster().contains(candidate) {
            return Err(ElectionError::NotEligible(candidate.to_string()));
        }
        if state.phase == ElectionPhase::ElectionPending
            && state.pending_candidate.as_deref() != Some(candidate)
        {
            return Err(ElectionError::ElectionPending {
                candidate: state.pending_candidate.clone().unwrap_or_default(),
            });
        }
        if !self.policy.accept(&self.context(&state), candidate) {
            return Err(ElectionError::Refused {
                candidate: candidate.to_string(),
                current: state.current_master.clone().unwrap_or_default(),
            });
        }
        info!(
            master = candidate,
            previous = ?state.current_master,
            "new master accepted"
        );
        state.current_master = Some(candidate.to_string());
        Ok(())
    }

    /// Proposes `candidate` to every connected super node and adopts it if
    /// the policy's quorum approves.
    pub async fn propose_new_master(&self, candidate: &str) -> Result<ElectionOutcome, ElectionError> {
        if !self.topology.is_super_node() {
            return Err(ElectionError::NotSuperNode);
        }
        let quorum = self.policy.quorum(self.topology.roster().len());
        {
            let mut state = self.state.write();
            if state.current_master.as_deref() == Some(candidate) {
                return Ok(ElectionOutcome { votes: 0, quorum });
            }
            if !self.topology.roster().contains(candidate) {
                return Err(ElectionError::NotEligible(candidate.to_string()));
            }
            if let Some(pending) = &state.pending_candidate {
                return Err(ElectionError::ElectionPending {
                    candidate: pending.clone(),
                });
            }
            if !self.policy.accept(&self.context(&state), candidate) {
                return Err(ElectionError::Refused {
                    candidate: candidate.to_string(),
                    current: state.current_master.clone().unwrap_or_default(),
                });
            }
            state.phase = ElectionPhase::ElectionPending;
            state.pending_candidate = Some(candidate.to_string());
        }

        let voters: Vec<String> = self
            .topology
            .roster()
            .ips()
            .into_iter()
            .filter(|ip| !self.topology.is_self_ip(ip) && self.registry.is_connected(ip))
            .collect();
        info!(candidate, voters = voters.len(), quorum, "proposing new master");

        let answers = join_all(voters.iter().map(|ip| self.ask_vote(ip, candidate))).await;
        let votes = 1 + answers.iter().filter(|approved| **approved).count();

        let mut state = self.state.write();
        state.phase = ElectionPhase::Stable;
        state.pending_candidate = None;
        if votes >= quorum {
            info!(candidate, votes, quorum, "master elected");
            state.current_master = Some(candidate.to_string());
            Ok(ElectionOutcome { votes, quorum })
        } else {
            warn!(candidate, votes, quorum, "master proposal failed");
            Err(ElectionError::QuorumNotReached {
                candidate: candidate.to_string(),
                votes,
                quorum,
            })
        }
    }

    async fn ask_vote(&self, voter: &str, candidate: &str) -> bool {
        let req = MessageEnvelope::new(MessageKind::NewMasterReq, candidate.to_string());
        let answer = match self.correlator.request(req, voter, self.request_timeout).await {
            Ok(resp) => expect_kind(resp, MessageKind::NewMasterResp),
            Err(e) => Err(e),
        };
        match answer {
            Ok(resp) => resp.payload_str() == "ok",
            Err(e) => {
                debug!(voter, candidate, error = %e, "vote not granted");
                false
            }
        }
    }

    /// Asks `ip` who its master is.
    pub async fn query_master(&self, ip: &str) -> Result<Option<String>, ElectionError> {
        let resp = self
            .correlator
            .request(
                MessageEnvelope::empty(MessageKind::MasterReq),
                ip,
                self.request_timeout,
            )
            .await?;
        let master = expect_kind(resp, MessageKind::MasterResp)?.payload_str();
        Ok(if master.is_empty() { None } else { Some(master) })
    }

    /// Adopts the master reported by the first connected super node that
    /// knows one, if we have none yet.
    pub async fn refresh_master(&self) -> Option<String> {
        if let Some(master) = self.current_master() {
            return Some(master);
        }
        for ip in self.topology.roster().ips() {
            if self.topology.is_self_ip(&ip) || !self.registry.is_connected(&ip) {
                continue;
            }
            match self.query_master(&ip).await {
                Ok(Some(master)) if self.topology.roster().contains(&master) => {
                    let mut state = self.state.write();
                    if state.current_master.is_none() {
                        info!(master = %master, source = %ip, "master learned from peer");
                        state.current_master = Some(master);
                    }
                    return state.current_master.clone();
                }
                Ok(_) => {}
                Err(e) => debug!(peer = %ip, error = %e, "master query failed"),
            }
        }
        None
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Answers `NewMasterReq` with `"ok"` or an `Error` carrying the reason.
pub struct NewMasterRequestHandler {
    election: Arc<MasterElection>,
    registry: Arc<ChannelRegistry>,
}

impl NewMasterRequestHandler {
    pub fn new(election: Arc<MasterElection>, registry: Arc<ChannelRegistry>) -> Self {
        Self { election, registry }
    }
}

#[async_trait]
impl MessageHandler for NewMasterRequestHandler {
    async fn handle(&self, envelope: &MessageEnvelope) -> bool {
        let candidate = envelope.payload_str();
        let reply = match self.election.check_new_master(&candidate) {
            Ok(()) => envelope.reply(MessageKind::NewMasterResp, "ok"),
            Err(e) => {
                debug!(candidate = %candidate, from = %envelope.source_ip(), reason = %e, "master proposal refused");
                envelope.error_reply(&e.to_string())
            }
        };
        if let Err(e) = self.registry.send_to(envelope.source_ip(), reply) {
            debug!(peer = %envelope.source_ip(), error = %e, "election reply not sent");
        }
        true
    }
}

/// Answers `MasterReq` with our current master, or an empty payload.
pub struct MasterRequestHandler {
    election: Arc<MasterElection>,
    registry: Arc<ChannelRegistry>,
}

impl MasterRequestHandler {
    pub fn new(election: Arc<MasterElection>, registry: Arc<ChannelRegistry>) -> Self {
        Self { election, registry }
    }
}

#[async_trait]
impl MessageHandler for MasterRequestHandler {
    async fn handle(&self, envelope: &MessageEnvelope) -> bool {
        let master = self.election.current_master().unwrap_or_default();
        let reply = envelope.reply(MessageKind::MasterResp, master);
        if let Err(e) = self.registry.send_to(envelope.source_ip(), reply) {
            debug!(peer = %envelope.source_ip(), error = %e, "master reply not sent");
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
