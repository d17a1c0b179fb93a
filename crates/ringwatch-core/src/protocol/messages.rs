//! Messages exchanged between daemons.
//!
//! Every datagram is one JSON-encoded [`WireMessage`].

use super::codec::Result;
use crate::process_id::{JobId, Rank};
use serde::{Deserialize, Serialize};

/// Envelope for a reliable-broadcast frame.
///
/// Forwarding daemons re-send the envelope untouched, so the same bytes
/// flow along every path of the overlay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RbcastEnvelope {
    /// Whether `data` is zlib-compressed
    pub compressed: bool,
    /// Bincode-encoded broadcast frame
    pub data: Vec<u8>,
}

/// Top-level daemon-to-daemon message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WireMessage {
    /// Periodic liveness signal, sent to the daemon watching the sender.
    #[serde(rename_all = "camelCase")]
    Heartbeat { job: JobId, sender_rank: Rank },

    /// Ask the recipient to start heartbeating the sender.
    ///
    /// Sent after the daemon between the two has died.
    #[serde(rename_all = "camelCase")]
    HeartbeatRequest { job: JobId, sender_rank: Rank },

    /// Reliable-broadcast traffic.
    Rbcast(RbcastEnvelope),
}

impl WireMessage {
    pub fn heartbeat(job: JobId, sender_rank: Rank) -> Self {
        Self::Heartbeat { job, sender_rank }
    }

    pub fn heartbeat_request(job: JobId, sender_rank: Rank) -> Self {
        Self::HeartbeatRequest { job, sender_rank }
    }

    /// Serialize to JSON bytes.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse from JSON bytes.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Heartbeat { .. } => "heartbeat",
            Self::HeartbeatRequest { .. } => "heartbeatRequest",
            Self::Rbcast(_) => "rbcast",
        }
    }
}

impl From<RbcastEnvelope> for WireMessage {
    fn from(envelope: RbcastEnvelope) -> Self {
        Self::Rbcast(envelope)
    }
}
