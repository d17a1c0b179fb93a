//! ringwatch-daemon library: UDP hosting for `ringwatch-core`.
//!
//! A thin layer that binds one daemon of a cluster to a UDP socket and
//! drives its `FaultContext` from a tokio event loop. Exposed as a library
//! so integration tests can run several daemons in one process.

pub mod cluster;
pub mod daemon;
pub mod udp;

pub use cluster::{ClusterError, ClusterFile, ConfigOverrides};
pub use daemon::Daemon;
pub use udp::{IncomingDatagram, UdpLink, UdpTransport, MAX_DATAGRAM_SIZE};
