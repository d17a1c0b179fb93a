//! Collaborator traits consumed by the fault core.
//!
//! The core never touches sockets. A hosting daemon supplies:
//! - a [`Transport`] for best-effort point-to-point sends between daemons
//! - a [`GroupInfo`] snapshot describing the daemon group
//! - a [`HostedProcessLookup`] that expands a daemon into the application
//!   processes it hosts

use crate::process_id::{JobId, ProcessId, Rank};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Unknown destination rank: {0}")]
    UnknownDestination(Rank),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Transport closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Unordered, best-effort, asynchronous point-to-point messaging.
///
/// `send` must not block: implementations hand the bytes to their own
/// I/O machinery and return. An `Ok` only means the message was accepted
/// for sending, never that it arrived.
pub trait Transport {
    /// Send `data` to the daemon with rank `dest`.
    fn send(&self, dest: Rank, data: Vec<u8>) -> Result<()>;
}

impl<T: Transport + ?Sized> Transport for &T {
    fn send(&self, dest: Rank, data: Vec<u8>) -> Result<()> {
        (**self).send(dest, data)
    }
}

impl<T: Transport + ?Sized> Transport for Rc<T> {
    fn send(&self, dest: Rank, data: Vec<u8>) -> Result<()> {
        (**self).send(dest, data)
    }
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn send(&self, dest: Rank, data: Vec<u8>) -> Result<()> {
        (**self).send(dest, data)
    }
}

/// Static membership snapshot of the daemon group.
///
/// The detector never expects live membership updates; departures are
/// discovered through heartbeat timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupInfo {
    /// Job shared by every daemon in the group
    pub job: JobId,
    /// This daemon's rank, in `1..=size`
    pub my_rank: Rank,
    /// Number of daemons in the group
    pub size: u32,
}

impl GroupInfo {
    pub fn new(job: JobId, my_rank: Rank, size: u32) -> Self {
        Self { job, my_rank, size }
    }

    /// This daemon's own process name.
    pub fn my_name(&self) -> ProcessId {
        ProcessId::new(self.job, self.my_rank)
    }

    /// Check if `rank` names a member of the group.
    pub fn contains(&self, rank: Rank) -> bool {
        (1..=self.size).contains(&rank)
    }

    /// Check if `proc_id` names one of the group's daemons.
    pub fn is_daemon(&self, proc_id: &ProcessId) -> bool {
        proc_id.job == self.job && self.contains(proc_id.rank)
    }
}

/// Expands a daemon into the application processes it hosts.
///
/// Only the daemon that originates a failure report consults this; relays
/// trust the list carried in the notification.
pub trait HostedProcessLookup {
    fn hosted_procs(&self, daemon: Rank) -> Vec<ProcessId>;
}

/// Lookup for daemons that host nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHostedProcs;

impl HostedProcessLookup for NoHostedProcs {
    fn hosted_procs(&self, _daemon: Rank) -> Vec<ProcessId> {
        Vec::new()
    }
}

/// Fixed daemon → hosted processes table.
#[derive(Debug, Clone, Default)]
pub struct StaticLookup {
    hosted: HashMap<Rank, Vec<ProcessId>>,
}

impl StaticLookup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `daemon` hosts `procs` (replacing any earlier entry).
    pub fn insert(&mut self, daemon: Rank, procs: Vec<ProcessId>) {
        self.hosted.insert(daemon, procs);
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn with(mut self, daemon: Rank, procs: Vec<ProcessId>) -> Self {
        self.insert(daemon, procs);
        self
    }
}

impl HostedProcessLookup for StaticLookup {
    fn hosted_procs(&self, daemon: Rank) -> Vec<ProcessId> {
        self.hosted.get(&daemon).cloned().unwrap_or_default()
    }
}
