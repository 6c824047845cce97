//! # Transport
//!
//! The connection substrate under the registry. A [`Transport`] knows how to
//! dial a peer; the TCP implementation also accepts inbound connections and
//! registers them as passive.
//!
//! Every connection gets one task that owns the socket. It drains the
//! connection's outbound queue onto the wire, pushes decoded inbound frames
//! into the node's dispatch queue, and removes the connection from the
//! registry when the socket dies.
//!
//! Frames are length-delimited (4-byte big-endian prefix) with a bincode
//! [`WireFrame`](super::message::WireFrame) body.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info, trace, warn};

use super::error::{NetworkError, NetworkResult};
use super::message::MessageEnvelope;
use super::registry::{ChannelRegistry, Connection};
use crate::config;

/// Opens outbound connections.
///
/// The returned connection is live but not registered. The caller either
/// registers it as active or closes it.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn dial(&self, ip: &str, port: u16) -> NetworkResult<Connection>;
}

// ---------------------------------------------------------------------------
// TCP
// ---------------------------------------------------------------------------

pub struct TcpTransport {
    registry: Arc<ChannelRegistry>,
    inbound: mpsc::Sender<MessageEnvelope>,
    dial_timeout: Duration,
}

impl TcpTransport {
    pub fn new(registry: Arc<ChannelRegistry>, inbound: mpsc::Sender<MessageEnvelope>) -> Self {
        Self {
            registry,
            inbound,
            dial_timeout: config::PEER_CONNECTION_TIMEOUT,
        }
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Binds `addr` and accepts connections until `shutdown` flips to
    /// `true`. Accepted connections are registered as passive.
    pub async fn listen(
        self: Arc<Self>,
        addr: SocketAddr,
        mut shutdown: watch::Receiver<bool>,
    ) -> std::io::Result<JoinHandle<()>> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "p2p listener bound");

        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, remote)) => {
                            trace!(remote = %remote, "inbound tcp connection");
                            if let Err(e) = self.accept(stream) {
                                debug!(remote = %remote, error = %e, "inbound connection dropped");
                            }
                        }
                        Err(e) => warn!(error = %e, "accept failed"),
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("p2p listener stopped");
                            break;
                        }
                    }
                }
            }
        }))
    }

    fn accept(&self, stream: TcpStream) -> NetworkResult<()> {
        let conn = self.spawn_connection(stream)?;
        if let Err(e) = self.registry.add_connection(conn.clone(), false) {
            conn.close();
            return Err(e);
        }
        Ok(())
    }

    fn spawn_connection(&self, stream: TcpStream) -> NetworkResult<Connection> {
        let peer_ip = stream.peer_addr()?.ip().to_string();
        let local_ip = stream.local_addr()?.ip().to_string();
        let (conn, outbound) = Connection::new(peer_ip, local_ip);
        tokio::spawn(run_connection(
            conn.clone(),
            stream,
            outbound,
            self.inbound.clone(),
            self.registry.clone(),
        ));
        Ok(conn)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn dial(&self, ip: &str, port: u16) -> NetworkResult<Connection> {
        let stream = match tokio::time::timeout(self.dial_timeout, TcpStream::connect((ip, port)))
            .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!(peer = ip, error = %e, "dial failed");
                return Err(NetworkError::Unreachable(ip.to_string()));
            }
            Err(_) => return Err(NetworkError::DialTimeout(ip.to_string())),
        };
        stream.set_nodelay(true)?;
        self.spawn_connection(stream)
    }
}

async fn run_connection(
    conn: Connection,
    stream: TcpStream,
    mut outbound: mpsc::UnboundedReceiver<MessageEnvelope>,
    inbound: mpsc::Sender<MessageEnvelope>,
    registry: Arc<ChannelRegistry>,
) {
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(config::MAX_FRAME_LENGTH)
        .new_codec();
    let mut framed = Framed::new(stream, codec);

    loop {
        tokio::select! {
            _ = conn.closed() => break,
            next = outbound.recv() => {
                let Some(envelope) = next else { break };
                let bytes = match envelope.encode() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(peer = %conn.peer_ip(), error = %e, "failed to encode envelope");
                        continue;
                    }
                };
                if let Err(e) = framed.send(Bytes::from(bytes)).await {
                    debug!(peer = %conn.peer_ip(), error = %e, "write failed");
                    break;
                }
            }
            frame = framed.next() => match frame {
                Some(Ok(bytes)) => {
                    match MessageEnvelope::decode(&bytes, conn.peer_ip(), conn.local_ip()) {
                        Ok(envelope) => {
                            if inbound.send(envelope).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(peer = %conn.peer_ip(), error = %e, "dropping undecodable frame"),
                    }
                }
                Some(Err(e)) => {
                    debug!(peer = %conn.peer_ip(), error = %e, "read failed");
                    break;
                }
                None => break,
            },
        }
    }

    conn.close();
    registry.remove_by_id(conn.id());
    debug!(peer = %conn.peer_ip(), id = conn.id(), "connection task finished");
}
