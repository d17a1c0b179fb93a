//! Per-daemon fault context.
//!
//! Owns the broadcast layer, the propagator and the ring detector for one
//! daemon and routes incoming messages between them. Nothing here is
//! global, so any number of contexts can run side by side in one process.

use crate::config::{ConfigError, RingwatchConfig};
use crate::detector::{FailureReporter, RingDetector};
use crate::events::{EventBus, FaultEvent, Subscription};
use crate::process_id::{JobId, ProcessId, Rank};
use crate::propagate::{FailurePropagator, ProcState};
use crate::protocol::WireMessage;
use crate::rbcast::{BroadcastError, ReliableBroadcast};
use crate::transport::{GroupInfo, HostedProcessLookup, Transport};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Everything one daemon needs to detect and announce failures.
pub struct FaultContext<T: Transport> {
    group: GroupInfo,
    config: RingwatchConfig,
    transport: T,
    rbcast: ReliableBroadcast,
    propagator: FailurePropagator,
    detector: RingDetector,
    events: Arc<EventBus>,
}

impl<T: Transport> FaultContext<T> {
    pub fn new(
        group: GroupInfo,
        config: RingwatchConfig,
        transport: T,
        lookup: impl HostedProcessLookup + 'static,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let events = Arc::new(EventBus::new());
        Ok(Self {
            rbcast: ReliableBroadcast::new(group, &config.broadcast),
            propagator: FailurePropagator::new(group, Arc::clone(&events), Box::new(lookup)),
            detector: RingDetector::new(group),
            group,
            config,
            transport,
            events,
        })
    }

    /// Install the propagate handler and join the ring.
    ///
    /// Every daemon must call this before exchanging messages so the
    /// handler ids line up across the group.
    pub fn start(&mut self, now_ms: u64) -> Result<(), BroadcastError> {
        let handler = self.propagator.register_callback(&mut self.rbcast)?;
        debug!(rank = self.group.my_rank, %handler, "propagate handler installed");

        if self.config.detector.enabled {
            let was_active = self.detector.is_active();
            self.detector.enable(&self.config.detector, now_ms);
            self.note_detector_change(was_active);
        } else {
            debug!(rank = self.group.my_rank, "ring detector disabled by configuration");
        }
        Ok(())
    }

    /// Handle one datagram from another daemon.
    ///
    /// Undecodable messages are logged and dropped.
    pub fn handle_message(&mut self, data: &[u8], now_ms: u64) {
        let message = match WireMessage::from_json(data) {
            Ok(message) => message,
            Err(error) => {
                warn!(rank = self.group.my_rank, size = data.len(), %error, "dropping undecodable message");
                return;
            }
        };
        trace!(rank = self.group.my_rank, kind = message.kind(), "received");

        let was_active = self.detector.is_active();
        match message {
            WireMessage::Heartbeat { job, sender_rank } => {
                if self.is_foreign_job(job) {
                    return;
                }
                self.detector
                    .on_heartbeat(&self.transport, sender_rank, now_ms);
            }
            WireMessage::HeartbeatRequest { job, sender_rank } => {
                if self.is_foreign_job(job) {
                    return;
                }
                self.detector
                    .on_heartbeat_request(&self.transport, sender_rank, now_ms);
            }
            WireMessage::Rbcast(envelope) => {
                if let Err(error) = self.rbcast.deliver(&self.transport, &envelope) {
                    warn!(rank = self.group.my_rank, %error, "dropping broadcast");
                }
            }
        }
        self.note_detector_change(was_active);
    }

    /// Drive the detector's timer.
    pub fn on_tick(&mut self, now_ms: u64) {
        let was_active = self.detector.is_active();
        let mut reporter = PropagateReporter {
            propagator: &mut self.propagator,
            rbcast: &mut self.rbcast,
            transport: &self.transport,
        };
        self.detector.on_tick(&self.transport, &mut reporter, now_ms);
        self.note_detector_change(was_active);
    }

    /// The local runtime saw one of this daemon's application processes
    /// die. Announces it to the other daemons.
    ///
    /// Processes this daemon does not host are ignored. Returns whether
    /// anything was announced.
    pub fn report_local_abort(
        &mut self,
        proc_id: ProcessId,
        state: ProcState,
    ) -> Result<bool, BroadcastError> {
        if !self
            .propagator
            .hosted_procs(self.group.my_rank)
            .contains(&proc_id)
        {
            warn!(rank = self.group.my_rank, proc = %proc_id, "abort reported for a process not hosted here");
            return Ok(false);
        }

        let me = self.group.my_name();
        self.propagator
            .prp(&mut self.rbcast, &self.transport, Some(me), proc_id, state)
    }

    /// The application job finished; forget the failures seen so far.
    pub fn on_job_terminated(&mut self) {
        self.propagator.flush();
    }

    /// Leave the ring and stop taking part in propagation.
    pub fn shutdown(&mut self) {
        let was_active = self.detector.is_active();
        self.detector.disable(&self.transport);
        if let Err(error) = self.propagator.unregister(&mut self.rbcast) {
            warn!(rank = self.group.my_rank, %error, "failed to remove propagate handler");
        }
        self.note_detector_change(was_active);
    }

    pub fn subscribe(&self, callback: impl Fn(FaultEvent) + Send + Sync + 'static) -> Subscription {
        self.events.subscribe(callback)
    }

    pub fn group(&self) -> GroupInfo {
        self.group
    }

    pub fn config(&self) -> &RingwatchConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn detector(&self) -> &RingDetector {
        &self.detector
    }

    pub fn propagator(&self) -> &FailurePropagator {
        &self.propagator
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Whether this daemon still believes `rank` is alive.
    pub fn is_daemon_alive(&self, rank: Rank) -> bool {
        self.detector.is_daemon_alive(rank)
    }

    /// How often the hosting loop should call [`on_tick`](Self::on_tick).
    ///
    /// A tenth of the heartbeat period, so a timeout is noticed at most one
    /// tenth of a period late.
    pub fn tick_interval(&self) -> Duration {
        (self.config.detector.heartbeat_period / 10).max(Duration::from_millis(1))
    }

    fn is_foreign_job(&self, job: JobId) -> bool {
        if job != self.group.job {
            debug!(rank = self.group.my_rank, job, "ignoring detector message for another job");
            return true;
        }
        false
    }

    fn note_detector_change(&self, was_active: bool) {
        if was_active && !self.detector.is_active() {
            self.events.emit(FaultEvent::DetectorDisabled {
                rank: self.group.my_rank,
            });
        }
    }
}

/// Routes detector reports into the propagator as local detections.
struct PropagateReporter<'a> {
    propagator: &'a mut FailurePropagator,
    rbcast: &'a mut ReliableBroadcast,
    transport: &'a dyn Transport,
}

impl FailureReporter for PropagateReporter<'_> {
    fn report_failure(&mut self, failed_proc: ProcessId, state: ProcState) {
        if let Err(error) = self
            .propagator
            .prp(self.rbcast, self.transport, None, failed_proc, state)
        {
            warn!(failed = %failed_proc, %error, "failed to propagate detected failure");
        }
    }
}
