//! ringwatch-core: failure detection and failure notification for a group
//! of cluster daemons.
//!
//! This crate provides:
//! - A ring heartbeat failure detector ([`detector`])
//! - Reliable broadcast over a binomial-graph overlay ([`rbcast`])
//! - Exactly-once, cluster-wide failure propagation ([`propagate`])
//! - A per-daemon [`FaultContext`] wiring the three together
//!
//! Everything is sans-IO. The host supplies a [`Transport`], feeds in
//! received datagrams and drives the timer with explicit timestamps.

pub mod config;
pub mod context;
pub mod detector;
pub mod events;
pub mod process_id;
pub mod propagate;
pub mod protocol;
pub mod rbcast;
pub mod transport;

#[cfg(test)]
mod testing;

pub use config::{BroadcastConfig, ConfigError, DetectorConfig, RingwatchConfig};
pub use context::FaultContext;
pub use detector::{DetectorStatus, FailureReporter, RingDetector};
pub use events::{EventBus, FaultEvent, Subscription};
pub use process_id::{JobId, ProcessId, ProcessIdError, Rank};
pub use propagate::{FailurePropagator, NotificationRecord, ProcState, ProcessedFailureSet};
pub use protocol::{CodecError, RbcastEnvelope, WireMessage};
pub use rbcast::{BroadcastError, ForwardDecision, HandlerId, ReliableBroadcast};
pub use transport::{
    GroupInfo, HostedProcessLookup, NoHostedProcs, StaticLookup, Transport, TransportError,
};
