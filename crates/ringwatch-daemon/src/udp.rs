//! UDP datagram link between daemons.
//!
//! The socket is driven by two background tasks: a send task draining an
//! outgoing queue, and a receive task forwarding datagrams to the event
//! loop. [`UdpTransport`] is the synchronous, queue-backed handle the
//! fault core sends through.

use ringwatch_core::{Rank, Transport, TransportError};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Largest payload a single IPv4 UDP datagram can carry.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Pause after the first failed receive.
const RECV_BACKOFF_INITIAL: Duration = Duration::from_millis(10);
/// Longest pause between failing receives.
const RECV_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Delay before the next receive after `consecutive_errors` failures in a
/// row, doubling from [`RECV_BACKOFF_INITIAL`] up to [`RECV_BACKOFF_MAX`].
fn recv_backoff(consecutive_errors: u32) -> Duration {
    let doublings = consecutive_errors.saturating_sub(1).min(16);
    RECV_BACKOFF_INITIAL
        .saturating_mul(1 << doublings)
        .min(RECV_BACKOFF_MAX)
}

/// A datagram read from the socket.
#[derive(Debug)]
pub struct IncomingDatagram {
    pub from: SocketAddr,
    pub data: Vec<u8>,
}

enum Outgoing {
    Datagram(SocketAddr, Vec<u8>),
    /// Resolves once everything queued before it has been handed to the socket
    Flush(oneshot::Sender<()>),
}

/// Rank-addressed sender backed by the link's outgoing queue.
///
/// Sends never block; delivery failures surface as warnings from the send
/// task, the way a lost datagram would.
#[derive(Clone)]
pub struct UdpTransport {
    /// Peer addresses; index `i` is rank `i + 1`
    peers: Arc<Vec<SocketAddr>>,
    outgoing: mpsc::UnboundedSender<Outgoing>,
}

impl UdpTransport {
    pub fn address_of(&self, rank: Rank) -> Option<SocketAddr> {
        let index = rank.checked_sub(1)? as usize;
        self.peers.get(index).copied()
    }
}

impl Transport for UdpTransport {
    fn send(&self, dest: Rank, data: Vec<u8>) -> Result<(), TransportError> {
        let addr = self
            .address_of(dest)
            .ok_or(TransportError::UnknownDestination(dest))?;
        if data.len() > MAX_DATAGRAM_SIZE {
            return Err(TransportError::SendFailed(format!(
                "datagram of {} bytes exceeds {MAX_DATAGRAM_SIZE}",
                data.len()
            )));
        }
        self.outgoing
            .send(Outgoing::Datagram(addr, data))
            .map_err(|_| TransportError::Closed)
    }
}

/// A bound UDP socket and its background tasks.
pub struct UdpLink {
    local_addr: SocketAddr,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    incoming_rx: mpsc::UnboundedReceiver<IncomingDatagram>,
    send_task: Option<JoinHandle<()>>,
    recv_task: Option<JoinHandle<()>>,
}

impl UdpLink {
    /// Bind `addr` and start the link.
    pub async fn bind(addr: SocketAddr, peers: Vec<SocketAddr>) -> io::Result<(Self, UdpTransport)> {
        let socket = UdpSocket::bind(addr).await?;
        Self::from_socket(socket, peers)
    }

    /// Start the link on an already bound socket.
    pub fn from_socket(socket: UdpSocket, peers: Vec<SocketAddr>) -> io::Result<(Self, UdpTransport)> {
        let local_addr = socket.local_addr()?;
        let socket = Arc::new(socket);

        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();

        let send_task = tokio::spawn(Self::send_loop(Arc::clone(&socket), outgoing_rx));
        let recv_task = tokio::spawn(Self::recv_loop(socket, incoming_tx));

        debug!("UDP link bound on {}", local_addr);

        let transport = UdpTransport {
            peers: Arc::new(peers),
            outgoing: outgoing.clone(),
        };
        let link = Self {
            local_addr,
            outgoing,
            incoming_rx,
            send_task: Some(send_task),
            recv_task: Some(recv_task),
        };
        Ok((link, transport))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Next datagram from the socket, or `None` once the receive task has
    /// stopped.
    pub async fn recv(&mut self) -> Option<IncomingDatagram> {
        self.incoming_rx.recv().await
    }

    /// Wait until every datagram queued so far has been written.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.outgoing.send(Outgoing::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Stop both background tasks. Queued datagrams are discarded.
    pub fn close(&mut self) {
        if let Some(task) = self.send_task.take() {
            task.abort();
        }
        if let Some(task) = self.recv_task.take() {
            task.abort();
        }
    }

    async fn send_loop(socket: Arc<UdpSocket>, mut outgoing_rx: mpsc::UnboundedReceiver<Outgoing>) {
        while let Some(item) = outgoing_rx.recv().await {
            match item {
                Outgoing::Datagram(addr, data) => {
                    if let Err(e) = socket.send_to(&data, addr).await {
                        warn!("Failed to send {} bytes to {}: {}", data.len(), addr, e);
                    }
                }
                Outgoing::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        debug!("UDP send loop ended");
    }

    async fn recv_loop(socket: Arc<UdpSocket>, incoming_tx: mpsc::UnboundedSender<IncomingDatagram>) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE + 1];
        let mut consecutive_errors = 0u32;
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, from)) => {
                    consecutive_errors = 0;
                    if len > MAX_DATAGRAM_SIZE {
                        warn!("Datagram from {} exceeds max size, dropping", from);
                        continue;
                    }
                    let datagram = IncomingDatagram {
                        from,
                        data: buf[..len].to_vec(),
                    };
                    if incoming_tx.send(datagram).is_err() {
                        break;
                    }
                }
                // ICMP unreachable from a dead peer surfaces here on some platforms
                Err(e) => {
                    consecutive_errors = consecutive_errors.saturating_add(1);
                    let delay = recv_backoff(consecutive_errors);
                    if delay >= RECV_BACKOFF_MAX {
                        warn!("UDP receive keeps failing ({} in a row): {}", consecutive_errors, e);
                    } else {
                        debug!("UDP receive error: {}", e);
                    }
                    tokio::time::sleep(delay).await;
                }
            }
        }
        debug!("UDP receive loop ended");
    }
}

impl Drop for UdpLink {
    fn drop(&mut self) {
        self.close();
    }
}
