//! # Request Correlator
//!
//! Request/response on top of fire-and-forget connections. A request gets a
//! sequence number that no other in-flight request to the same peer is
//! using, a single-use slot is parked under `(peer, sequence)`, and the
//! caller waits on the slot until the response arrives or the timeout
//! fires.
//!
//! Responses are fed in by the dispatcher's response handlers through
//! [`RequestCorrelator::resolve`]. The first matching response wins; later
//! duplicates and responses nobody is waiting for are dropped. A timed-out
//! slot is removed, so a late response cannot resolve it either. There is no
//! retry: callers decide what a failed round trip means.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, trace};

use super::error::{NetworkError, NetworkResult};
use super::message::{MessageEnvelope, MessageKind};
use super::registry::ChannelRegistry;
use crate::config;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelatorConfig {
    /// Default round-trip timeout in milliseconds.
    pub request_timeout_ms: u64,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: config::REQUEST_TIMEOUT.as_millis() as u64,
        }
    }
}

type SlotKey = (String, u32);

pub struct RequestCorrelator {
    registry: Arc<ChannelRegistry>,
    pending: DashMap<SlotKey, oneshot::Sender<MessageEnvelope>>,
    next_sequence: AtomicU32,
    default_timeout: Duration,
}

impl RequestCorrelator {
    pub fn new(registry: Arc<ChannelRegistry>, config: &CorrelatorConfig) -> Self {
        Self {
            registry,
            pending: DashMap::new(),
            next_sequence: AtomicU32::new(1),
            default_timeout: Duration::from_millis(config.request_timeout_ms),
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Parks `slot` under a sequence that is free for `peer`. Sequence 0 is
    /// never handed out; unsolicited messages carry it.
    fn reserve(&self, peer: &str, slot: oneshot::Sender<MessageEnvelope>) -> u32 {
        let mut slot = Some(slot);
        loop {
            let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
            if sequence == 0 {
                continue;
            }
            if let Entry::Vacant(vacant) = self.pending.entry((peer.to_string(), sequence)) {
                if let Some(slot) = slot.take() {
                    vacant.insert(slot);
                }
                return sequence;
            }
        }
    }

    /// Sends `envelope` to `dest_ip` and waits for the matching response.
    pub async fn request(
        &self,
        envelope: MessageEnvelope,
        dest_ip: &str,
        timeout: Duration,
    ) -> NetworkResult<MessageEnvelope> {
        let (tx, rx) = oneshot::channel();
        let sequence = self.reserve(dest_ip, tx);
        let key = (dest_ip.to_string(), sequence);
        let kind = envelope.kind();

        if let Err(e) = self
            .registry
            .send_to(dest_ip, envelope.with_sequence(sequence))
        {
            self.pending.remove(&key);
            return Err(e);
        }
        trace!(peer = dest_ip, %kind, sequence, "request sent");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(NetworkError::ConnectionClosed(dest_ip.to_string())),
            Err(_) => {
                self.pending.remove(&key);
                debug!(peer = dest_ip, %kind, sequence, "request timed out");
                Err(NetworkError::Timeout {
                    peer: dest_ip.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// [`request`](Self::request) with the configured default timeout.
    pub async fn request_default(
        &self,
        envelope: MessageEnvelope,
        dest_ip: &str,
    ) -> NetworkResult<MessageEnvelope> {
        self.request(envelope, dest_ip, self.default_timeout).await
    }

    /// Hands `response` to the request waiting on `(source_ip, sequence)`.
    /// Returns `false` if nobody was waiting.
    pub fn resolve(&self, response: MessageEnvelope) -> bool {
        let key = (response.source_ip().to_string(), response.sequence());
        match self.pending.remove(&key) {
            Some((_, slot)) => {
                // The waiter may have timed out between remove and send.
                let _ = slot.send(response);
                true
            }
            None => {
                trace!(peer = %key.0, sequence = key.1, "unmatched response dropped");
                false
            }
        }
    }

    /// Fails every request waiting on `peer`.
    pub fn cancel_peer(&self, peer: &str) -> usize {
        let before = self.pending.len();
        self.pending.retain(|(ip, _), _| ip != peer);
        before - self.pending.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// Checks that `response` is of `expected` kind. An `Error` envelope becomes
/// [`NetworkError::Rejected`] carrying its reason.
pub fn expect_kind(response: MessageEnvelope, expected: MessageKind) -> NetworkResult<MessageEnvelope> {
    if response.kind() == expected {
        return Ok(response);
    }
    if response.kind() == MessageKind::Error {
        return Err(NetworkError::Rejected {
            peer: response.source_ip().to_string(),
            reason: response.payload_str(),
        });
    }
    Err(NetworkError::UnexpectedResponse {
        peer: response.source_ip().to_string(),
        detail: format!("expected {}, got {}", expected, response.kind()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::registry::Connection;
    use tokio::sync::mpsc;

    const PEER: &str = "10.0.0.2";

    fn setup() -> (
        Arc<RequestCorrelator>,
        mpsc::UnboundedReceiver<MessageEnvelope>,
    ) {
        let registry = Arc::new(ChannelRegistry::new());
        let (conn, rx) = Connection::new(PEER, "10.0.0.1");
        registry.add_connection(conn, true).unwrap();
        let correlator = Arc::new(RequestCorrelator::new(registry, &CorrelatorConfig::default()));
        (correlator, rx)
    }

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    /// Plays the remote peer: answers the next request with `kind`.
    fn answer(
        correlator: &Arc<RequestCorrelator>,
        wire: &mut mpsc::UnboundedReceiver<MessageEnvelope>,
        kind: MessageKind,
        payload: &[u8],
    ) -> u32 {
        let req = wire.try_recv().expect("request on the wire");
        let resp = MessageEnvelope::new(kind, payload.to_vec())
            .with_sequence(req.sequence())
            .from_ip(PEER);
        correlator.resolve(resp);
        req.sequence()
    }

    #[tokio::test]
    async fn response_resolves_request() {
        let (correlator, mut wire) = setup();
        let c = correlator.clone();
        let waiter = tokio::spawn(async move {
            c.request(
                MessageEnvelope::empty(MessageKind::HeightReq),
                PEER,
                Duration::from_secs(1),
            )
            .await
        });
        settle().await;
        answer(&correlator, &mut wire, MessageKind::HeightResp, &9u64.to_be_bytes());

        let resp = waiter.await.unwrap().unwrap();
        assert_eq!(resp.payload_u64(), Some(9));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_removes_slot_and_late_response_is_dropped() {
        let (correlator, mut wire) = setup();
        let err = correlator
            .request(
                MessageEnvelope::empty(MessageKind::HeightReq),
                PEER,
                Duration::from_millis(200),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::Timeout { timeout_ms: 200, .. }));
        assert_eq!(correlator.pending_count(), 0);

        let req = wire.try_recv().unwrap();
        let late = MessageEnvelope::empty(MessageKind::HeightResp)
            .with_sequence(req.sequence())
            .from_ip(PEER);
        assert!(!correlator.resolve(late));
    }

    #[tokio::test]
    async fn wrong_sequence_does_not_resolve() {
        let (correlator, mut wire) = setup();
        let c = correlator.clone();
        let waiter = tokio::spawn(async move {
            c.request(
                MessageEnvelope::empty(MessageKind::NodesReq),
                PEER,
                Duration::from_millis(300),
            )
            .await
        });
        settle().await;
        let req = wire.try_recv().unwrap();
        let stray = MessageEnvelope::empty(MessageKind::NodesResp)
            .with_sequence(req.sequence().wrapping_add(1000))
            .from_ip(PEER);
        assert!(!correlator.resolve(stray));
        // Same sequence from another peer must not resolve it either.
        let spoof = MessageEnvelope::empty(MessageKind::NodesResp)
            .with_sequence(req.sequence())
            .from_ip("10.0.0.66");
        assert!(!correlator.resolve(spoof));

        assert!(matches!(
            waiter.await.unwrap(),
            Err(NetworkError::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn duplicate_response_is_dropped() {
        let (correlator, mut wire) = setup();
        let c = correlator.clone();
        let waiter = tokio::spawn(async move {
            c.request(
                MessageEnvelope::empty(MessageKind::MasterReq),
                PEER,
                Duration::from_secs(1),
            )
            .await
        });
        settle().await;
        let seq = answer(&correlator, &mut wire, MessageKind::MasterResp, b"10.0.0.1");
        let dup = MessageEnvelope::new(MessageKind::MasterResp, b"10.0.0.9".to_vec())
            .with_sequence(seq)
            .from_ip(PEER);
        assert!(!correlator.resolve(dup));
        assert_eq!(waiter.await.unwrap().unwrap().payload_str(), "10.0.0.1");
    }

    #[tokio::test]
    async fn concurrent_requests_get_distinct_sequences() {
        let (correlator, mut wire) = setup();
        let mut waiters = Vec::new();
        for _ in 0..4 {
            let c = correlator.clone();
            waiters.push(tokio::spawn(async move {
                c.request(
                    MessageEnvelope::empty(MessageKind::HeartbeatReq),
                    PEER,
                    Duration::from_secs(1),
                )
                .await
            }));
        }
        settle().await;
        let mut seqs = Vec::new();
        for _ in 0..4 {
            seqs.push(answer(&correlator, &mut wire, MessageKind::HeartbeatResp, b""));
        }
        seqs.sort();
        seqs.dedup();
        assert_eq!(seqs.len(), 4);
        for w in waiters {
            assert!(w.await.unwrap().is_ok());
        }
    }

    #[tokio::test]
    async fn unknown_peer_fails_fast() {
        let (correlator, _wire) = setup();
        let err = correlator
            .request(
                MessageEnvelope::empty(MessageKind::HeightReq),
                "10.0.0.99",
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::NotConnected(_)));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn cancel_peer_fails_waiters() {
        let (correlator, _wire) = setup();
        let c = correlator.clone();
        let waiter = tokio::spawn(async move {
            c.request(
                MessageEnvelope::empty(MessageKind::HeightReq),
                PEER,
                Duration::from_secs(5),
            )
            .await
        });
        settle().await;
        assert_eq!(correlator.cancel_peer(PEER), 1);
        assert!(matches!(
            waiter.await.unwrap(),
            Err(NetworkError::ConnectionClosed(_))
        ));
    }

    #[test]
    fn expect_kind_maps_error_envelope() {
        let err = MessageEnvelope::new(MessageKind::Error, b"no such block".to_vec()).from_ip(PEER);
        match expect_kind(err, MessageKind::BlockResp) {
            Err(NetworkError::Rejected { reason, .. }) => assert_eq!(reason, "no such block"),
            other => panic!("unexpected: {other:?}"),
        }
        let wrong = MessageEnvelope::empty(MessageKind::HeightResp).from_ip(PEER);
        assert!(matches!(
            expect_kind(wrong, MessageKind::BlockResp),
            Err(NetworkError::UnexpectedResponse { .. })
        ));
    }
}
