//! Errors shared by the network layer.

/// Failures of the connection substrate and of correlated requests.
///
/// None of these are fatal to the node. Topology turns them into trust
/// decay; consensus and sync treat them as a rejection.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("unknown message kind {0}")]
    UnknownKind(u32),

    #[error("no connection to {0}")]
    NotConnected(String),

    #[error("connection to {0} closed")]
    ConnectionClosed(String),

    #[error("request to {peer} timed out after {timeout_ms}ms")]
    Timeout { peer: String, timeout_ms: u64 },

    #[error("dial to {0} timed out")]
    DialTimeout(String),

    #[error("peer {0} is unreachable")]
    Unreachable(String),

    #[error("peer {peer} rejected the request: {reason}")]
    Rejected { peer: String, reason: String },

    #[error("unexpected response from {peer}: {detail}")]
    UnexpectedResponse { peer: String, detail: String },

    #[error("an active connection to {0} already exists")]
    DuplicateConnection(String),
}

impl From<bincode::Error> for NetworkError {
    fn from(e: bincode::Error) -> Self {
        NetworkError::Codec(e.to_string())
    }
}

impl From<serde_json::Error> for NetworkError {
    fn from(e: serde_json::Error) -> Self {
        NetworkError::Codec(e.to_string())
    }
}

pub type NetworkResult<T> = Result<T, NetworkError>;
