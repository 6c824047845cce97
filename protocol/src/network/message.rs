//! # Message Envelope & Kind Registry
//!
//! Every message on the wire is a [`MessageEnvelope`]: a [`MessageKind`], a
//! caller-chosen `sequence` that a responder echoes back verbatim, and an
//! opaque payload. Source and destination addresses are not on the wire;
//! the connection that carried the frame fills them in.
//!
//! ## Wire Frame
//!
//! ```text
//! ┌──────────────┬──────────────────────────────────────────┐
//! │ length (4B)  │ bincode(WireFrame { kind, sequence,      │
//! │ big-endian   │                     payload })           │
//! └──────────────┴──────────────────────────────────────────┘
//! ```
//!
//! The length prefix is handled by the transport codec; this module only
//! deals with the body.
//!
//! ## Payload Conventions
//!
//! | Kind                            | Payload                       |
//! |---------------------------------|-------------------------------|
//! | `NodesResp`                     | JSON `{ip: trust}`            |
//! | `BlockArrived`, `BlockResp`     | `bincode(Block)`              |
//! | `HeightResp`, `BlockReq`        | `u64` big-endian              |
//! | `NodeJoin`, `NodeExit`, `NewMasterReq`, `MasterResp` | UTF-8 ip |
//! | `NodeJoinResp`                  | UTF-8 `"true"` / `"false"`    |
//! | `NewMasterResp`                 | UTF-8 `"ok"`                  |
//! | `Error`                         | UTF-8 reason                  |
//! | `Transaction`                   | `bincode(SignedTransaction)`  |

use serde::{Deserialize, Serialize};

use super::error::NetworkError;

// ---------------------------------------------------------------------------
// MessageKind
// ---------------------------------------------------------------------------

/// The closed set of message kinds. Discriminants are the wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum MessageKind {
    HeartbeatReq = 1,
    HeartbeatResp = 2,
    NodesReq = 3,
    NodesResp = 4,
    BlockArrived = 5,
    HeightReq = 7,
    HeightResp = 8,
    BlockReq = 9,
    BlockResp = 10,
    NodeJoin = 11,
    NodeExit = 12,
    Error = 13,
    Transaction = 14,
    MasterReq = 17,
    MasterResp = 18,
    NewMasterReq = 19,
    NewMasterResp = 20,
    NodeJoinResp = 21,
    /// Reserved sentinel. Never sent.
    End = 10000,
}

impl MessageKind {
    pub const ALL: [MessageKind; 19] = [
        MessageKind::HeartbeatReq,
        MessageKind::HeartbeatResp,
        MessageKind::NodesReq,
        MessageKind::NodesResp,
        MessageKind::BlockArrived,
        MessageKind::HeightReq,
        MessageKind::HeightResp,
        MessageKind::BlockReq,
        MessageKind::BlockResp,
        MessageKind::NodeJoin,
        MessageKind::NodeExit,
        MessageKind::Error,
        MessageKind::Transaction,
        MessageKind::MasterReq,
        MessageKind::MasterResp,
        MessageKind::NewMasterReq,
        MessageKind::NewMasterResp,
        MessageKind::NodeJoinResp,
        MessageKind::End,
    ];

    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.code() == code)
    }

    /// Kinds that answer a correlated request. `Error` counts: it is how a
    /// responder rejects a request.
    pub fn is_response(self) -> bool {
        matches!(
            self,
            MessageKind::HeartbeatResp
                | MessageKind::NodesResp
                | MessageKind::HeightResp
                | MessageKind::BlockResp
                | MessageKind::NodeJoinResp
                | MessageKind::Error
                | MessageKind::MasterResp
                | MessageKind::NewMasterResp
        )
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({})", self, self.code())
    }
}

// ---------------------------------------------------------------------------
// Wire Frame
// ---------------------------------------------------------------------------

/// The frame body as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireFrame {
    pub kind: u32,
    pub sequence: u32,
    pub payload: Vec<u8>,
}

// ---------------------------------------------------------------------------
// MessageEnvelope
// ---------------------------------------------------------------------------

/// An inbound or outbound message. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEnvelope {
    kind: MessageKind,
    sequence: u32,
    payload: Vec<u8>,
    source_ip: String,
    dest_ip: String,
}

impl MessageEnvelope {
    pub fn new(kind: MessageKind, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            sequence: 0,
            payload: payload.into(),
            source_ip: String::new(),
            dest_ip: String::new(),
        }
    }

    pub fn empty(kind: MessageKind) -> Self {
        Self::new(kind, Vec::new())
    }

    pub fn with_sequence(mut self, sequence: u32) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn from_ip(mut self, ip: impl Into<String>) -> Self {
        self.source_ip = ip.into();
        self
    }

    pub fn to_ip(mut self, ip: impl Into<String>) -> Self {
        self.dest_ip = ip.into();
        self
    }

    /// A response to this envelope: addressed to its source, same sequence.
    pub fn reply(&self, kind: MessageKind, payload: impl Into<Vec<u8>>) -> Self {
        Self::new(kind, payload)
            .with_sequence(self.sequence)
            .from_ip(self.dest_ip.clone())
            .to_ip(self.source_ip.clone())
    }

    /// An `Error` response carrying a human-readable reason.
    pub fn error_reply(&self, reason: &str) -> Self {
        self.reply(MessageKind::Error, reason.as_bytes().to_vec())
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    pub fn source_ip(&self) -> &str {
        &self.source_ip
    }

    pub fn dest_ip(&self) -> &str {
        &self.dest_ip
    }

    /// Payload read as UTF-8, trimmed. Invalid bytes are replaced.
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).trim().to_string()
    }

    /// Payload read as a big-endian `u64`.
    pub fn payload_u64(&self) -> Option<u64> {
        let bytes: [u8; 8] = self.payload.as_slice().try_into().ok()?;
        Some(u64::from_be_bytes(bytes))
    }

    pub fn encode(&self) -> Result<Vec<u8>, NetworkError> {
        let frame = WireFrame {
            kind: self.kind.code(),
            sequence: self.sequence,
            payload: self.payload.clone(),
        };
        Ok(bincode::serialize(&frame)?)
    }

    /// Decodes a frame body received from `source_ip` on a connection whose
    /// local address is `dest_ip`.
    pub fn decode(bytes: &[u8], source_ip: &str, dest_ip: &str) -> Result<Self, NetworkError> {
        let frame: WireFrame = bincode::deserialize(bytes)?;
        let kind =
            MessageKind::from_code(frame.kind).ok_or(NetworkError::UnknownKind(frame.kind))?;
        Ok(Self {
            kind,
            sequence: frame.sequence,
            payload: frame.payload,
            source_ip: source_ip.to_string(),
            dest_ip: dest_ip.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_values_are_stable() {
        assert_eq!(MessageKind::HeartbeatReq.code(), 1);
        assert_eq!(MessageKind::BlockArrived.code(), 5);
        assert_eq!(MessageKind::HeightReq.code(), 7);
        assert_eq!(MessageKind::Error.code(), 13);
        assert_eq!(MessageKind::Transaction.code(), 14);
        assert_eq!(MessageKind::MasterReq.code(), 17);
        assert_eq!(MessageKind::NewMasterResp.code(), 20);
        assert_eq!(MessageKind::NodeJoinResp.code(), 21);
        assert_eq!(MessageKind::End.code(), 10000);
    }

    #[test]
    fn from_code_covers_every_kind() {
        for kind in MessageKind::ALL {
            assert_eq!(MessageKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(MessageKind::from_code(6), None);
        assert_eq!(MessageKind::from_code(15), None);
    }

    #[test]
    fn reply_swaps_addresses_and_keeps_sequence() {
        let req = MessageEnvelope::new(MessageKind::HeightReq, Vec::new())
            .with_sequence(42)
            .from_ip("10.0.0.2")
            .to_ip("10.0.0.1");
        let resp = req.reply(MessageKind::HeightResp, 7u64.to_be_bytes().to_vec());
        assert_eq!(resp.sequence(), 42);
        assert_eq!(resp.dest_ip(), "10.0.0.2");
        assert_eq!(resp.source_ip(), "10.0.0.1");
        assert_eq!(resp.payload_u64(), Some(7));
    }

    #[test]
    fn error_reply_carries_reason() {
        let req = MessageEnvelope::new(MessageKind::NewMasterReq, "10.0.0.9").with_sequence(3);
        let err = req.error_reply("master still alive");
        assert_eq!(err.kind(), MessageKind::Error);
        assert_eq!(err.sequence(), 3);
        assert_eq!(err.payload_str(), "master still alive");
    }

    #[test]
    fn decode_fills_addresses_from_connection() {
        let env = MessageEnvelope::new(MessageKind::NodeJoin, "10.0.0.5").with_sequence(9);
        let bytes = env.encode().unwrap();
        let decoded = MessageEnvelope::decode(&bytes, "10.0.0.5", "10.0.0.1").unwrap();
        assert_eq!(decoded.kind(), MessageKind::NodeJoin);
        assert_eq!(decoded.sequence(), 9);
        assert_eq!(decoded.source_ip(), "10.0.0.5");
        assert_eq!(decoded.dest_ip(), "10.0.0.1");
        assert_eq!(decoded.payload_str(), "10.0.0.5");
    }

    #[test]
    fn decode_rejects_unknown_kind() {
        let frame = WireFrame {
            kind: 6,
            sequence: 0,
            payload: vec![],
        };
        let bytes = bincode::serialize(&frame).unwrap();
        assert!(matches!(
            MessageEnvelope::decode(&bytes, "a", "b"),
            Err(NetworkError::UnknownKind(6))
        ));
    }

    #[test]
    fn payload_u64_requires_eight_bytes() {
        let env = MessageEnvelope::new(MessageKind::BlockReq, vec![1, 2, 3]);
        assert_eq!(env.payload_u64(), None);
    }
}
