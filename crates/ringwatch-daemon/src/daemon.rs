//! One daemon of the group: a `FaultContext` driven over UDP.
//!
//! The fault core is single-threaded (`!Send`), so a `Daemon` runs on the
//! task that owns it: `#[tokio::main]`'s root future or a `LocalSet`.

use crate::cluster::ClusterFile;
use crate::udp::{IncomingDatagram, UdpLink, UdpTransport};
use anyhow::{Context, Result};
use ringwatch_core::{
    FaultContext, FaultEvent, ProcState, ProcessId, Rank, RingwatchConfig, Subscription,
};
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

pub struct Daemon {
    ctx: FaultContext<UdpTransport>,
    link: UdpLink,
    /// Origin of the monotonic clock handed to the fault core
    epoch: Instant,
}

impl Daemon {
    /// Bind the address the cluster file lists for `rank`.
    pub async fn bind(cluster: &ClusterFile, rank: Rank, config: RingwatchConfig) -> Result<Self> {
        let addr = cluster
            .address(rank)
            .with_context(|| format!("rank {rank} is not in the cluster file"))?;
        let (link, transport) = UdpLink::bind(addr, cluster.daemons.clone())
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        Self::from_link(cluster, rank, config, link, transport)
    }

    /// Run on a socket the caller has already bound.
    pub fn with_socket(
        cluster: &ClusterFile,
        rank: Rank,
        config: RingwatchConfig,
        socket: UdpSocket,
    ) -> Result<Self> {
        let (link, transport) = UdpLink::from_socket(socket, cluster.daemons.clone())?;
        Self::from_link(cluster, rank, config, link, transport)
    }

    fn from_link(
        cluster: &ClusterFile,
        rank: Rank,
        config: RingwatchConfig,
        link: UdpLink,
        transport: UdpTransport,
    ) -> Result<Self> {
        let group = cluster.group(rank)?;
        let ctx = FaultContext::new(group, config, transport, cluster.lookup())?;

        Ok(Self {
            ctx,
            link,
            epoch: Instant::now(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.link.local_addr()
    }

    pub fn context(&self) -> &FaultContext<UdpTransport> {
        &self.ctx
    }

    pub fn subscribe(&self, callback: impl Fn(FaultEvent) + Send + Sync + 'static) -> Subscription {
        self.ctx.subscribe(callback)
    }

    /// Announce the failure of a process this daemon hosts.
    pub fn report_local_abort(&mut self, proc_id: ProcessId, state: ProcState) -> Result<bool> {
        Ok(self.ctx.report_local_abort(proc_id, state)?)
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Run the event loop until `shutdown` resolves or the socket dies.
    ///
    /// On the way out the detector says goodbye to its observer and the
    /// farewell is flushed before returning.
    pub async fn run(&mut self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let group = self.ctx.group();
        info!(
            "Daemon {} of {} listening on {}",
            group.my_rank,
            group.size,
            self.local_addr()
        );

        self.ctx.start(self.now_ms())?;

        let mut ticker = tokio::time::interval(self.ctx.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = self.now_ms();
                    self.ctx.on_tick(now);
                }

                datagram = self.link.recv() => {
                    match datagram {
                        Some(datagram) => self.on_datagram(datagram),
                        None => {
                            warn!("UDP receive loop stopped; shutting down");
                            break;
                        }
                    }
                }

                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
            }
        }

        self.ctx.shutdown();
        self.link.flush().await;
        info!("Daemon {} stopped", group.my_rank);
        Ok(())
    }

    fn on_datagram(&mut self, datagram: IncomingDatagram) {
        debug!("{} bytes from {}", datagram.data.len(), datagram.from);
        let now = self.now_ms();
        self.ctx.handle_message(&datagram.data, now);
    }
}
