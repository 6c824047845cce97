//! # Channel Registry
//!
//! Every live connection the node holds, tagged by who opened it:
//! **active** connections were dialed by us, **passive** ones were accepted.
//! Connection ceilings are enforced against these counts, and every
//! outbound message is routed by looking the peer IP up here.
//!
//! A peer has at most one connection per direction. A second live active
//! connection is refused. A new passive connection replaces the old one,
//! since the remote side only redials after giving up on it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::error::NetworkError;
use super::message::MessageEnvelope;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// Who opened a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Active,
    Passive,
}

struct ConnectionInner {
    id: u64,
    peer_ip: String,
    local_ip: String,
    outbound: mpsc::UnboundedSender<MessageEnvelope>,
    closed: CancellationToken,
}

/// Handle to one live connection. Cheap to clone.
///
/// The transport owns the other ends: it drains the outbound queue onto the
/// socket and watches the close token.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Creates a handle and returns the queue the transport must drain.
    pub fn new(
        peer_ip: impl Into<String>,
        local_ip: impl Into<String>,
    ) -> (Self, mpsc::UnboundedReceiver<MessageEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Self {
            inner: Arc::new(ConnectionInner {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                peer_ip: peer_ip.into(),
                local_ip: local_ip.into(),
                outbound: tx,
                closed: CancellationToken::new(),
            }),
        };
        (conn, rx)
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn peer_ip(&self) -> &str {
        &self.inner.peer_ip
    }

    pub fn local_ip(&self) -> &str {
        &self.inner.local_ip
    }

    /// Queues `envelope` for the writer task.
    pub fn send(&self, envelope: MessageEnvelope) -> Result<(), NetworkError> {
        if self.is_closed() {
            return Err(NetworkError::ConnectionClosed(self.inner.peer_ip.clone()));
        }
        trace!(peer = %self.inner.peer_ip, kind = %envelope.kind(), seq = envelope.sequence(), "queue outbound");
        self.inner
            .outbound
            .send(envelope)
            .map_err(|_| NetworkError::ConnectionClosed(self.inner.peer_ip.clone()))
    }

    pub fn close(&self) {
        self.inner.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled() || self.inner.outbound.is_closed()
    }

    /// Resolves once [`Connection::close`] has been called.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("peer_ip", &self.inner.peer_ip)
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ChannelRegistry
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct ChannelRegistry {
    connections: DashMap<u64, (Connection, Direction)>,
    active_by_ip: DashMap<String, u64>,
    passive_by_ip: DashMap<String, u64>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn index(&self, direction: Direction) -> &DashMap<String, u64> {
        match direction {
            Direction::Active => &self.active_by_ip,
            Direction::Passive => &self.passive_by_ip,
        }
    }

    /// Registers `conn`. Fails if it is already closed or if a live
    /// connection in the same direction exists for its peer.
    pub fn add_connection(&self, conn: Connection, is_active: bool) -> Result<(), NetworkError> {
        if conn.is_closed() {
            return Err(NetworkError::ConnectionClosed(conn.peer_ip().to_string()));
        }
        let direction = if is_active {
            Direction::Active
        } else {
            Direction::Passive
        };

        let replaced = match self.index(direction).entry(conn.peer_ip().to_string()) {
            Entry::Occupied(mut slot) => {
                let existing = *slot.get();
                let live = self
                    .connections
                    .get(&existing)
                    .map(|entry| !entry.0.is_closed())
                    .unwrap_or(false);
                if live && direction == Direction::Active {
                    return Err(NetworkError::DuplicateConnection(conn.peer_ip().to_string()));
                }
                slot.insert(conn.id());
                Some(existing)
            }
            Entry::Vacant(slot) => {
                slot.insert(conn.id());
                None
            }
        };
        if let Some(stale) = replaced {
            if let Some((_, (old, _))) = self.connections.remove(&stale) {
                old.close();
            }
        }

        debug!(peer = %conn.peer_ip(), id = conn.id(), ?direction, "connection registered");
        self.connections.insert(conn.id(), (conn, direction));
        Ok(())
    }

    pub fn remove_connection(&self, conn: &Connection) -> bool {
        self.remove_by_id(conn.id())
    }

    /// Drops the connection with `id` from the registry and closes it.
    pub fn remove_by_id(&self, id: u64) -> bool {
        match self.connections.remove(&id) {
            Some((_, (conn, direction))) => {
                self.index(direction)
                    .remove_if(conn.peer_ip(), |_, current| *current == id);
                conn.close();
                debug!(peer = %conn.peer_ip(), id, ?direction, "connection removed");
                true
            }
            None => false,
        }
    }

    /// Closes and forgets every connection to `ip`.
    pub fn close_peer(&self, ip: &str) -> usize {
        let ids: Vec<u64> = [Direction::Active, Direction::Passive]
            .into_iter()
            .filter_map(|d| self.index(d).get(ip).map(|id| *id))
            .collect();
        ids.into_iter().filter(|id| self.remove_by_id(*id)).count()
    }

    pub fn active_count(&self) -> usize {
        self.active_by_ip.len()
    }

    pub fn passive_count(&self) -> usize {
        self.passive_by_ip.len()
    }

    pub fn total_count(&self) -> usize {
        self.connections.len()
    }

    pub fn is_connected(&self, ip: &str) -> bool {
        self.lookup(ip).is_some()
    }

    pub fn has_active(&self, ip: &str) -> bool {
        self.live(Direction::Active, ip).is_some()
    }

    fn live(&self, direction: Direction, ip: &str) -> Option<Connection> {
        let id = *self.index(direction).get(ip)?;
        let entry = self.connections.get(&id)?;
        if entry.0.is_closed() {
            None
        } else {
            Some(entry.0.clone())
        }
    }

    /// A live connection to `ip`, preferring the one we dialed.
    pub fn lookup(&self, ip: &str) -> Option<Connection> {
        self.live(Direction::Active, ip)
            .or_else(|| self.live(Direction::Passive, ip))
    }

    pub fn all_connections(&self) -> Vec<Connection> {
        self.connections
            .iter()
            .map(|entry| entry.value().0.clone())
            .collect()
    }

    /// Distinct peer IPs with at least one live connection.
    pub fn connected_ips(&self) -> Vec<String> {
        let mut ips: Vec<String> = self
            .connections
            .iter()
            .filter(|entry| !entry.value().0.is_closed())
            .map(|entry| entry.value().0.peer_ip().to_string())
            .collect();
        ips.sort();
        ips.dedup();
        ips
    }

    /// Sends `envelope` to `ip` over whichever live connection exists.
    pub fn send_to(&self, ip: &str, envelope: MessageEnvelope) -> Result<(), NetworkError> {
        let conn = self
            .lookup(ip)
            .ok_or_else(|| NetworkError::NotConnected(ip.to_string()))?;
        conn.send(envelope.to_ip(ip))
    }

    /// Sends `envelope` once to every connected peer except `except`.
    /// Returns how many peers it was queued for.
    pub fn broadcast(&self, envelope: &MessageEnvelope, except: Option<&str>) -> usize {
        self.connected_ips()
            .into_iter()
            .filter(|ip| Some(ip.as_str()) != except)
            .filter(|ip| self.send_to(ip, envelope.clone()).is_ok())
            .count()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::message::MessageKind;

    fn conn(ip: &str) -> (Connection, mpsc::UnboundedReceiver<MessageEnvelope>) {
        Connection::new(ip, "10.0.0.1")
    }

    #[test]
    fn counts_track_directions() {
        let registry = ChannelRegistry::new();
        let (a, _ra) = conn("10.0.0.2");
        let (b, _rb) = conn("10.0.0.3");
        let (c, _rc) = conn("10.0.0.2");
        registry.add_connection(a, true).unwrap();
        registry.add_connection(b, false).unwrap();
        registry.add_connection(c, false).unwrap();
        assert_eq!(registry.active_count(), 1);
        assert_eq!(registry.passive_count(), 2);
        assert_eq!(
            registry.active_count() + registry.passive_count(),
            registry.total_count()
        );
    }

    #[test]
    fn second_active_connection_is_refused() {
        let registry = ChannelRegistry::new();
        let (a, _ra) = conn("10.0.0.2");
        let (b, _rb) = conn("10.0.0.2");
        registry.add_connection(a, true).unwrap();
        assert!(matches!(
            registry.add_connection(b, true),
            Err(NetworkError::DuplicateConnection(_))
        ));
        assert_eq!(registry.active_count(), 1);
        assert_eq!(registry.total_count(), 1);
    }

    #[test]
    fn dead_connection_is_replaced() {
        let registry = ChannelRegistry::new();
        let (a, _ra) = conn("10.0.0.2");
        let (b, _rb) = conn("10.0.0.2");
        registry.add_connection(a.clone(), true).unwrap();
        a.close();
        registry.add_connection(b.clone(), true).unwrap();
        assert_eq!(registry.active_count(), 1);
        assert_eq!(registry.total_count(), 1);
        assert_eq!(registry.lookup("10.0.0.2").unwrap().id(), b.id());
    }

    #[test]
    fn new_passive_connection_replaces_old() {
        let registry = ChannelRegistry::new();
        let (old, _ro) = conn("10.0.0.2");
        let (new, _rn) = conn("10.0.0.2");
        registry.add_connection(old.clone(), false).unwrap();
        registry.add_connection(new.clone(), false).unwrap();
        assert!(old.is_closed());
        assert_eq!(registry.passive_count(), 1);
        assert_eq!(registry.total_count(), 1);
        assert_eq!(registry.lookup("10.0.0.2").unwrap().id(), new.id());
    }

    #[test]
    fn closed_connection_cannot_register() {
        let registry = ChannelRegistry::new();
        let (a, _ra) = conn("10.0.0.2");
        a.close();
        assert!(registry.add_connection(a, true).is_err());
        assert_eq!(registry.total_count(), 0);
    }

    #[test]
    fn remove_updates_counts_and_closes() {
        let registry = ChannelRegistry::new();
        let (a, _ra) = conn("10.0.0.2");
        registry.add_connection(a.clone(), true).unwrap();
        assert!(registry.remove_connection(&a));
        assert!(a.is_closed());
        assert_eq!(registry.active_count(), 0);
        assert!(!registry.is_connected("10.0.0.2"));
        assert!(!registry.remove_connection(&a));
    }

    #[test]
    fn stale_remove_keeps_replacement_indexed() {
        let registry = ChannelRegistry::new();
        let (a, _ra) = conn("10.0.0.2");
        let (b, _rb) = conn("10.0.0.2");
        registry.add_connection(a.clone(), true).unwrap();
        a.close();
        registry.add_connection(b.clone(), true).unwrap();
        // The old reader task exits late and removes its own id.
        registry.remove_by_id(a.id());
        assert!(registry.has_active("10.0.0.2"));
    }

    #[test]
    fn lookup_prefers_active() {
        let registry = ChannelRegistry::new();
        let (passive, _rp) = conn("10.0.0.2");
        let (active, _ra) = conn("10.0.0.2");
        registry.add_connection(passive, false).unwrap();
        registry.add_connection(active.clone(), true).unwrap();
        assert_eq!(registry.lookup("10.0.0.2").unwrap().id(), active.id());
    }

    #[test]
    fn close_peer_drops_both_directions() {
        let registry = ChannelRegistry::new();
        let (a, _ra) = conn("10.0.0.2");
        let (b, _rb) = conn("10.0.0.2");
        registry.add_connection(a, true).unwrap();
        registry.add_connection(b, false).unwrap();
        assert_eq!(registry.close_peer("10.0.0.2"), 2);
        assert_eq!(registry.total_count(), 0);
    }

    #[test]
    fn broadcast_skips_excluded_peer() {
        let registry = ChannelRegistry::new();
        let (a, mut ra) = conn("10.0.0.2");
        let (b, mut rb) = conn("10.0.0.3");
        registry.add_connection(a, true).unwrap();
        registry.add_connection(b, false).unwrap();

        let env = MessageEnvelope::new(MessageKind::BlockArrived, vec![1]);
        assert_eq!(registry.broadcast(&env, Some("10.0.0.2")), 1);
        assert!(ra.try_recv().is_err());
        let got = rb.try_recv().unwrap();
        assert_eq!(got.dest_ip(), "10.0.0.3");
    }

    #[test]
    fn send_to_unknown_peer_fails() {
        let registry = ChannelRegistry::new();
        let env = MessageEnvelope::empty(MessageKind::HeartbeatReq);
        assert!(matches!(
            registry.send_to("10.9.9.9", env),
            Err(NetworkError::NotConnected(_))
        ));
    }
}
