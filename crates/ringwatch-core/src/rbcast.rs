//! Reliable broadcast over a binomial-graph overlay.
//!
//! A broadcast is sent to this daemon's overlay neighbors only. Each
//! receiving daemon hands the payload to the handler registered under the
//! frame's [`HandlerId`]; if the handler answers [`ForwardDecision::Forward`]
//! the untouched envelope is re-sent to that daemon's own neighbors.
//!
//! The layer keeps no history. A message stops spreading only when the
//! handlers stop forwarding it, so every handler must eventually answer
//! [`ForwardDecision::Stop`] for any given message.

use crate::config::BroadcastConfig;
use crate::process_id::Rank;
use crate::protocol::codec::{self, CodecError};
use crate::protocol::{RbcastEnvelope, WireMessage, compress_block, decompress_block};
use crate::transport::{GroupInfo, Transport};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Maximum number of handlers installed at once.
pub const HANDLER_TABLE_CAPACITY: usize = 8;

/// Identifies a delivery handler on the wire.
///
/// Every daemon registers its handlers in the same order at startup, so
/// the same id names the same handler cluster-wide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandlerId(u8);

impl HandlerId {
    pub fn as_u8(self) -> u8 {
        self.0
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a delivery handler wants done with the message it just saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardDecision {
    /// Re-send the message to this daemon's neighbors.
    Forward,
    /// Drop the message here.
    Stop,
}

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("Handler table full ({HANDLER_TABLE_CAPACITY} handlers installed)")]
    HandlerTableFull,

    #[error("No handler registered under id {0}")]
    UnknownHandler(HandlerId),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

pub type Result<T> = std::result::Result<T, BroadcastError>;

/// Bincode body of an RBCAST envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RbcastFrame {
    pub handler_id: HandlerId,
    pub payload: Vec<u8>,
}

/// Callback invoked with the payload of each delivered broadcast.
pub type DeliveryHandler = Box<dyn FnMut(&[u8]) -> ForwardDecision>;

/// Per-daemon broadcast state: group snapshot plus the handler table.
pub struct ReliableBroadcast {
    group: GroupInfo,
    compress_limit: usize,
    handlers: BTreeMap<HandlerId, DeliveryHandler>,
}

impl ReliableBroadcast {
    pub fn new(group: GroupInfo, config: &BroadcastConfig) -> Self {
        Self {
            group,
            compress_limit: config.compress_limit,
            handlers: BTreeMap::new(),
        }
    }

    /// Install a delivery handler under the lowest free id.
    pub fn register_handler(
        &mut self,
        handler: impl FnMut(&[u8]) -> ForwardDecision + 'static,
    ) -> Result<HandlerId> {
        let id = (0..HANDLER_TABLE_CAPACITY as u8)
            .map(HandlerId)
            .find(|id| !self.handlers.contains_key(id))
            .ok_or(BroadcastError::HandlerTableFull)?;

        self.handlers.insert(id, Box::new(handler));
        debug!(handler = %id, "registered broadcast handler");
        Ok(id)
    }

    /// Remove a previously installed handler.
    pub fn unregister_handler(&mut self, id: HandlerId) -> Result<()> {
        if self.handlers.remove(&id).is_none() {
            return Err(BroadcastError::UnknownHandler(id));
        }
        debug!(handler = %id, "unregistered broadcast handler");
        Ok(())
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    pub fn has_handler(&self, id: HandlerId) -> bool {
        self.handlers.contains_key(&id)
    }

    /// This daemon's overlay neighbors, in send order.
    pub fn neighbors(&self) -> Vec<Rank> {
        binomial_neighbors(self.group.my_rank, self.group.size)
    }

    /// Originate a broadcast of `payload` tagged with `handler_id`.
    ///
    /// Returns how many neighbors accepted the message. Individual send
    /// failures are logged and skipped.
    pub fn broadcast(
        &self,
        transport: &dyn Transport,
        payload: &[u8],
        handler_id: HandlerId,
    ) -> Result<usize> {
        let frame = codec::encode(&RbcastFrame {
            handler_id,
            payload: payload.to_vec(),
        })?;

        let envelope = match compress_block(&frame, self.compress_limit) {
            Some(compressed) => {
                trace!(raw = frame.len(), compressed = compressed.len(), "compressed broadcast frame");
                RbcastEnvelope {
                    compressed: true,
                    data: compressed,
                }
            }
            None => RbcastEnvelope {
                compressed: false,
                data: frame,
            },
        };

        let bytes = WireMessage::Rbcast(envelope).to_json()?;
        Ok(self.send_to_neighbors(transport, &bytes))
    }

    /// Handle an incoming envelope.
    ///
    /// Runs the frame's handler and, when it answers `Forward`, relays the
    /// envelope unchanged to this daemon's neighbors.
    pub fn deliver(
        &mut self,
        transport: &dyn Transport,
        envelope: &RbcastEnvelope,
    ) -> Result<ForwardDecision> {
        let data: Cow<'_, [u8]> = if envelope.compressed {
            Cow::Owned(decompress_block(&envelope.data)?)
        } else {
            Cow::Borrowed(&envelope.data)
        };
        let frame: RbcastFrame = codec::decode(&data)?;

        let handler = self
            .handlers
            .get_mut(&frame.handler_id)
            .ok_or(BroadcastError::UnknownHandler(frame.handler_id))?;
        let decision = handler(&frame.payload);

        trace!(handler = %frame.handler_id, ?decision, "delivered broadcast");

        if decision == ForwardDecision::Forward {
            let bytes = WireMessage::Rbcast(envelope.clone()).to_json()?;
            self.send_to_neighbors(transport, &bytes);
        }
        Ok(decision)
    }

    fn send_to_neighbors(&self, transport: &dyn Transport, bytes: &[u8]) -> usize {
        let mut accepted = 0;
        for dest in self.neighbors() {
            match transport.send(dest, bytes.to_vec()) {
                Ok(()) => accepted += 1,
                Err(error) => warn!(rank = self.group.my_rank, dest, %error, "broadcast send failed"),
            }
        }
        debug!(rank = self.group.my_rank, accepted, size = bytes.len(), "broadcast sent");
        accepted
    }
}

/// Binomial-graph neighbors of `rank` in a group of `size` daemons.
///
/// Ranks are `1..=size`. Round `i` (for `i` in `1..=⌈log2 size⌉`) yields
/// the daemons at circular offsets `+(2^i - 1)` then `-(2^i - 1)`. Even
/// ranks walk the rounds in ascending order and odd ranks in descending
/// order, which spreads the first sends of concurrent broadcasts. Self and
/// repeated ranks are skipped.
pub fn binomial_neighbors(rank: Rank, size: u32) -> Vec<Rank> {
    if size < 2 || !(1..=size).contains(&rank) {
        return Vec::new();
    }

    let mut rounds: Vec<u32> = (1..=ceil_log2(size)).collect();
    if rank % 2 == 1 {
        rounds.reverse();
    }

    let n = i64::from(size);
    let origin = i64::from(rank) - 1;
    let mut neighbors = Vec::with_capacity(rounds.len() * 2);

    for round in rounds {
        let offset = (1i64 << round) - 1;
        for direction in [1, -1] {
            // rem_euclid keeps the result in 0..n, so it always fits a Rank
            let peer = ((origin + direction * offset).rem_euclid(n) + 1) as Rank;
            if peer != rank && !neighbors.contains(&peer) {
                neighbors.push(peer);
            }
        }
    }
    neighbors
}

fn ceil_log2(n: u32) -> u32 {
    match n {
        0 | 1 => 0,
        _ => u32::BITS - (n - 1).leading_zeros(),
    }
}
