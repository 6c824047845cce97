//! # Prometheus Metrics
//!
//! Operational metrics for a peerchain node, scraped at `/metrics` on the
//! metrics port. Values are sampled from [`NodeStats`] on a fixed period
//! rather than pushed from the hot paths.
//!
//! All metrics live in a dedicated [`prometheus::Registry`] with the
//! `peerchain` prefix.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

use peerchain_protocol::network::NodeStats;

#[derive(Clone)]
pub struct NodeMetrics {
    registry: Registry,
    pub active_connections: IntGauge,
    pub passive_connections: IntGauge,
    pub known_peers: IntGauge,
    pub chain_height: IntGauge,
    /// 1 while a catch-up sync is running.
    pub syncing: IntGauge,
    /// 1 when this node is the elected master.
    pub is_master: IntGauge,
    pub dispatched_total: IntCounter,
    pub rejected_total: IntCounter,
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge, prometheus::Error> {
    let g = IntGauge::new(name, help)?;
    registry.register(Box::new(g.clone()))?;
    Ok(g)
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter, prometheus::Error> {
    let c = IntCounter::new(name, help)?;
    registry.register(Box::new(c.clone()))?;
    Ok(c)
}

impl NodeMetrics {
    /// Creates and registers all metrics. Call once at startup.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("peerchain".into()), None)?;
        Ok(Self {
            active_connections: gauge(
                &registry,
                "active_connections",
                "Connections this node initiated",
            )?,
            passive_connections: gauge(
                &registry,
                "passive_connections",
                "Connections other nodes initiated to this one",
            )?,
            known_peers: gauge(&registry, "known_peers", "Entries in the peer table")?,
            chain_height: gauge(&registry, "chain_height", "Height of the local chain head")?,
            syncing: gauge(&registry, "syncing", "1 while a catch-up sync is running")?,
            is_master: gauge(&registry, "is_master", "1 when this node is the elected master")?,
            dispatched_total: counter(
                &registry,
                "dispatched_total",
                "Inbound envelopes run through the dispatcher",
            )?,
            rejected_total: counter(
                &registry,
                "rejected_total",
                "Inbound envelopes refused by a validator",
            )?,
            registry,
        })
    }

    /// Copies a stats snapshot into the metric handles.
    pub fn observe(&self, stats: &NodeStats) {
        self.active_connections.set(stats.active_connections as i64);
        self.passive_connections.set(stats.passive_connections as i64);
        self.known_peers.set(stats.known_peers as i64);
        self.chain_height.set(stats.chain_height as i64);
        self.syncing.set(i64::from(stats.syncing));
        self.is_master
            .set(i64::from(stats.master.as_deref() == Some(stats.self_ip.as_str())));
        // Counters only move forward; advance them by the delta.
        self.dispatched_total
            .inc_by(stats.dispatched.saturating_sub(self.dispatched_total.get()));
        self.rejected_total
            .inc_by(stats.rejected.saturating_sub(self.rejected_total.get()));
    }

    /// Encodes all registered metrics into the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

pub type SharedMetrics = Arc<NodeMetrics>;

/// Axum handler that renders `/metrics` in Prometheus text format.
pub async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<SharedMetrics>,
) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}
