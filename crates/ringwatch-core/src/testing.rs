//! Shared test doubles.

use crate::process_id::Rank;
use crate::protocol::WireMessage;
use crate::transport::{Transport, TransportError};
use std::cell::RefCell;
use std::collections::BTreeSet;

/// Transport that records every send instead of delivering it.
#[derive(Default)]
pub struct RecordingTransport {
    sent: RefCell<Vec<(Rank, Vec<u8>)>>,
    unreachable: RefCell<BTreeSet<Rank>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make sends to `rank` fail from now on.
    pub fn fail_sends_to(&self, rank: Rank) {
        self.unreachable.borrow_mut().insert(rank);
    }

    pub fn heal(&self, rank: Rank) {
        self.unreachable.borrow_mut().remove(&rank);
    }

    /// Drain everything sent so far, decoded.
    pub fn take(&self) -> Vec<(Rank, WireMessage)> {
        self.sent
            .borrow_mut()
            .drain(..)
            .map(|(dest, bytes)| (dest, WireMessage::from_json(&bytes).unwrap()))
            .collect()
    }

    /// Drain raw bytes sent so far.
    pub fn take_raw(&self) -> Vec<(Rank, Vec<u8>)> {
        self.sent.borrow_mut().drain(..).collect()
    }

    pub fn destinations(&self) -> Vec<Rank> {
        self.sent.borrow().iter().map(|(dest, _)| *dest).collect()
    }
}

impl Transport for RecordingTransport {
    fn send(&self, dest: Rank, data: Vec<u8>) -> Result<(), TransportError> {
        if self.unreachable.borrow().contains(&dest) {
            return Err(TransportError::SendFailed(format!("rank {dest} unreachable")));
        }
        self.sent.borrow_mut().push((dest, data));
        Ok(())
    }
}
