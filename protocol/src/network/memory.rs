//! # In-Memory Network
//!
//! A [`Transport`] that wires nodes together inside one process. Frames
//! still go through the wire encoding, so a node running on it exercises
//! the same code paths it would over TCP, minus the sockets. Integration
//! tests and the dispatch bench build whole clusters on it.
//!
//! A node is reachable once it has been [`attach`](MemoryNetwork::attach)ed
//! and until it is [`detach`](MemoryNetwork::detach)ed. Dialing anything
//! else fails with `Unreachable`.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::error::{NetworkError, NetworkResult};
use super::message::MessageEnvelope;
use super::registry::{ChannelRegistry, Connection};
use super::transport::Transport;

#[derive(Clone)]
struct Endpoint {
    registry: Arc<ChannelRegistry>,
    inbound: mpsc::Sender<MessageEnvelope>,
}

#[derive(Default)]
pub struct MemoryNetwork {
    endpoints: DashMap<String, Endpoint>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes `ip` reachable and returns the transport that node dials with.
    pub fn attach(
        self: &Arc<Self>,
        ip: &str,
        registry: Arc<ChannelRegistry>,
        inbound: mpsc::Sender<MessageEnvelope>,
    ) -> MemoryTransport {
        self.endpoints
            .insert(ip.to_string(), Endpoint { registry, inbound });
        MemoryTransport {
            network: self.clone(),
            local_ip: ip.to_string(),
        }
    }

    /// Takes `ip` off the network and closes every connection it holds.
    pub fn detach(&self, ip: &str) {
        if let Some((_, endpoint)) = self.endpoints.remove(ip) {
            for conn in endpoint.registry.all_connections() {
                conn.close();
            }
            debug!(node = ip, "detached from memory network");
        }
    }

    pub fn is_attached(&self, ip: &str) -> bool {
        self.endpoints.contains_key(ip)
    }
}

pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
    local_ip: String,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn dial(&self, ip: &str, _port: u16) -> NetworkResult<Connection> {
        let remote = self
            .network
            .endpoints
            .get(ip)
            .map(|e| e.clone())
            .ok_or_else(|| NetworkError::Unreachable(ip.to_string()))?;
        let local = self
            .network
            .endpoints
            .get(&self.local_ip)
            .map(|e| e.clone())
            .ok_or_else(|| NetworkError::NotConnected(self.local_ip.clone()))?;

        let (local_conn, local_rx) = Connection::new(ip, self.local_ip.as_str());
        let (remote_conn, remote_rx) = Connection::new(self.local_ip.as_str(), ip);
        remote.registry.add_connection(remote_conn.clone(), false)?;

        tokio::spawn(pump(
            local_conn.clone(),
            local_rx,
            remote_conn.clone(),
            remote.inbound.clone(),
            local.registry.clone(),
            remote.registry.clone(),
        ));
        tokio::spawn(pump(
            remote_conn,
            remote_rx,
            local_conn.clone(),
            local.inbound,
            remote.registry,
            local.registry,
        ));

        trace!(from = %self.local_ip, to = ip, "memory connection opened");
        Ok(local_conn)
    }
}

/// Moves frames written on `from` to the inbox of the node at the far end.
async fn pump(
    from: Connection,
    mut outbound: mpsc::UnboundedReceiver<MessageEnvelope>,
    to: Connection,
    inbox: mpsc::Sender<MessageEnvelope>,
    from_registry: Arc<ChannelRegistry>,
    to_registry: Arc<ChannelRegistry>,
) {
    loop {
        tokio::select! {
            _ = from.closed() => break,
            _ = to.closed() => break,
            next = outbound.recv() => {
                let Some(envelope) = next else { break };
                let delivered = envelope
                    .encode()
                    .and_then(|bytes| MessageEnvelope::decode(&bytes, from.local_ip(), from.peer_ip()));
                match delivered {
                    Ok(envelope) => {
                        if inbox.send(envelope).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => debug!(error = %e, "memory frame dropped"),
                }
            }
        }
    }
    from.close();
    to.close();
    from_registry.remove_by_id(from.id());
    to_registry.remove_by_id(to.id());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::message::MessageKind;

    struct Node {
        registry: Arc<ChannelRegistry>,
        inbox: mpsc::Receiver<MessageEnvelope>,
        transport: MemoryTransport,
    }

    fn node(net: &Arc<MemoryNetwork>, ip: &str) -> Node {
        let registry = Arc::new(ChannelRegistry::new());
        let (tx, inbox) = mpsc::channel(16);
        let transport = net.attach(ip, registry.clone(), tx);
        Node {
            registry,
            inbox,
            transport,
        }
    }

    #[tokio::test]
    async fn dial_registers_passive_side_and_delivers() {
        let net = MemoryNetwork::new();
        let a = node(&net, "10.0.0.1");
        let mut b = node(&net, "10.0.0.2");

        let conn = a.transport.dial("10.0.0.2", 0).await.unwrap();
        a.registry.add_connection(conn.clone(), true).unwrap();
        assert_eq!(b.registry.passive_count(), 1);

        conn.send(MessageEnvelope::new(MessageKind::NodeJoin, "10.0.0.1").with_sequence(3))
            .unwrap();
        let got = b.inbox.recv().await.unwrap();
        assert_eq!(got.source_ip(), "10.0.0.1");
        assert_eq!(got.dest_ip(), "10.0.0.2");
        assert_eq!(got.sequence(), 3);
    }

    #[tokio::test]
    async fn replies_flow_back() {
        let net = MemoryNetwork::new();
        let mut a = node(&net, "10.0.0.1");
        let mut b = node(&net, "10.0.0.2");

        let conn = a.transport.dial("10.0.0.2", 0).await.unwrap();
        a.registry.add_connection(conn.clone(), true).unwrap();
        conn.send(MessageEnvelope::empty(MessageKind::HeightReq).with_sequence(8))
            .unwrap();
        let req = b.inbox.recv().await.unwrap();
        b.registry
            .send_to(req.source_ip(), req.reply(MessageKind::HeightResp, 4u64.to_be_bytes().to_vec()))
            .unwrap();
        let resp = a.inbox.recv().await.unwrap();
        assert_eq!(resp.sequence(), 8);
        assert_eq!(resp.payload_u64(), Some(4));
    }

    #[tokio::test]
    async fn unattached_ip_is_unreachable() {
        let net = MemoryNetwork::new();
        let a = node(&net, "10.0.0.1");
        assert!(matches!(
            a.transport.dial("10.0.0.9", 0).await,
            Err(NetworkError::Unreachable(_))
        ));
    }

    #[tokio::test]
    async fn close_tears_down_both_sides() {
        let net = MemoryNetwork::new();
        let a = node(&net, "10.0.0.1");
        let b = node(&net, "10.0.0.2");
        let conn = a.transport.dial("10.0.0.2", 0).await.unwrap();
        a.registry.add_connection(conn.clone(), true).unwrap();

        conn.close();
        for _ in 0..20 {
            if b.registry.total_count() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(a.registry.total_count(), 0);
        assert_eq!(b.registry.total_count(), 0);
    }

    #[tokio::test]
    async fn detach_makes_node_unreachable() {
        let net = MemoryNetwork::new();
        let a = node(&net, "10.0.0.1");
        let _b = node(&net, "10.0.0.2");
        net.detach("10.0.0.2");
        assert!(!net.is_attached("10.0.0.2"));
        assert!(a.transport.dial("10.0.0.2", 0).await.is_err());
    }
}
