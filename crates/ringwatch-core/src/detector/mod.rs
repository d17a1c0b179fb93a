//! Ring-based heartbeat failure detector.
//!
//! # Protocol Overview
//!
//! Daemons form a directed ring over their ranks:
//! 1. Every daemon heartbeats its *observer* (the next rank) once per period
//! 2. Every daemon expects heartbeats from the rank it is *observing* (the
//!    previous rank)
//! 3. Silence longer than the timeout gets the observed daemon reported as
//!    aborted
//! 4. The reporter then walks backwards past every failed rank to the next
//!    live daemon and asks it to start heartbeating here instead
//!
//! The detector is sans-IO: the hosting loop calls [`RingDetector::on_tick`]
//! at [`RingDetector::tick_interval`] and feeds in received heartbeats. All
//! timestamps are milliseconds on one monotonic clock.

pub mod ring;

use crate::config::DetectorConfig;
use crate::process_id::{ProcessId, Rank};
use crate::propagate::ProcState;
use crate::protocol::WireMessage;
use crate::transport::{GroupInfo, Transport};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Receives failures the detector has confirmed.
pub trait FailureReporter {
    fn report_failure(&mut self, failed_proc: ProcessId, state: ProcState);
}

/// Lifecycle of a [`RingDetector`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorStatus {
    Uninitialized,
    Active,
    Disabled,
}

/// One daemon's view of the monitoring ring.
#[derive(Debug)]
pub struct RingDetector {
    group: GroupInfo,
    status: DetectorStatus,
    /// Rank we expect heartbeats from
    observing: Option<Rank>,
    /// Rank we heartbeat
    observer: Option<Rank>,
    period_ms: u64,
    timeout_ms: u64,
    /// `None` means the next tick heartbeats immediately
    last_sent_ms: Option<u64>,
    /// `None` means nobody is being watched
    last_received_ms: Option<u64>,
    failed: BTreeSet<Rank>,
}

impl RingDetector {
    pub fn new(group: GroupInfo) -> Self {
        Self {
            group,
            status: DetectorStatus::Uninitialized,
            observing: None,
            observer: None,
            period_ms: 0,
            timeout_ms: 0,
            last_sent_ms: None,
            last_received_ms: None,
            failed: BTreeSet::new(),
        }
    }

    /// Join the ring.
    ///
    /// The first deadline is pushed out by one second per daemon so a slow
    /// cluster start is not mistaken for failures.
    pub fn enable(&mut self, config: &DetectorConfig, now_ms: u64) {
        let GroupInfo { my_rank: me, size: n, .. } = self.group;
        self.period_ms = duration_ms(config.heartbeat_period);
        self.timeout_ms = duration_ms(config.heartbeat_timeout);

        if n < 2 {
            info!(rank = me, size = n, "no peers to watch, detector disabled");
            self.stop();
            return;
        }

        self.status = DetectorStatus::Active;
        self.observing = Some(ring::initial_observing(me, n));
        self.observer = Some(ring::initial_observer(me, n));
        self.last_sent_ms = None;
        self.last_received_ms = Some(now_ms + u64::from(n) * 1000);

        info!(
            rank = me,
            observing = ?self.observing,
            observer = ?self.observer,
            period_ms = self.period_ms,
            timeout_ms = self.timeout_ms,
            "detector enabled"
        );
    }

    /// Periodic timer: heartbeat when due, then check the observed daemon.
    pub fn on_tick(
        &mut self,
        transport: &dyn Transport,
        reporter: &mut dyn FailureReporter,
        now_ms: u64,
    ) {
        if self.status != DetectorStatus::Active {
            return;
        }

        if self
            .last_sent_ms
            .is_none_or(|last| now_ms.saturating_sub(last) >= self.period_ms)
        {
            self.heartbeat(transport, now_ms);
        }

        let Some(last_received) = self.last_received_ms else {
            return;
        };
        if now_ms.saturating_sub(last_received) <= self.timeout_ms {
            return;
        }
        let Some(observing) = self.observing else {
            return;
        };

        if self.failed.insert(observing) {
            info!(
                rank = self.group.my_rank,
                observing,
                silent_ms = now_ms - last_received,
                "observed daemon timed out"
            );
            reporter.report_failure(ProcessId::new(self.group.job, observing), ProcState::Aborted);
        } else {
            // An earlier repair could not reach the next predecessor
            debug!(rank = self.group.my_rank, observing, "retrying ring repair");
        }
        self.ring_repair(transport, now_ms);
    }

    /// A heartbeat arrived claiming to come from `sender`.
    ///
    /// A heartbeat carrying our own rank is the farewell of the daemon we
    /// observe. We leave the ring too, passing the farewell on to our own
    /// observer so nobody is left waiting on a silent peer.
    pub fn on_heartbeat(&mut self, transport: &dyn Transport, sender: Rank, now_ms: u64) {
        if self.status != DetectorStatus::Active {
            trace!(rank = self.group.my_rank, sender, "detector inactive, heartbeat ignored");
            return;
        }

        if sender == self.group.my_rank {
            info!(rank = sender, observing = ?self.observing, "observed daemon left the ring, leaving too");
            self.disable(transport);
            return;
        }

        if Some(sender) != self.observing {
            debug!(
                rank = self.group.my_rank,
                sender,
                observing = ?self.observing,
                "heartbeat from a daemon we are not observing"
            );
            return;
        }

        if let Some(last_received) = self.last_received_ms {
            let grace = self.timeout_ms as i64 - (now_ms as i64 - last_received as i64);
            trace!(rank = self.group.my_rank, sender, grace_ms = grace, "heartbeat");
            if grace < 0 {
                warn!(rank = self.group.my_rank, sender, missed_by_ms = -grace, "heartbeat arrived after the deadline");
            }
        }
        self.last_received_ms = Some(now_ms);
    }

    /// `requester` asks to become our observer.
    ///
    /// Accepted only when the requester is at least as far ahead of us on
    /// the ring as the current observer.
    pub fn on_heartbeat_request(&mut self, transport: &dyn Transport, requester: Rank, now_ms: u64) {
        let me = self.group.my_rank;
        let n = self.group.size;

        let Some(observer) = self.observer.filter(|_| self.status == DetectorStatus::Active) else {
            debug!(rank = me, requester, "detector inactive, heartbeat request ignored");
            return;
        };
        if requester == me || !self.group.contains(requester) {
            warn!(rank = me, requester, "heartbeat request from an invalid rank");
            return;
        }

        if ring::ring_distance(me, requester, n) < ring::ring_distance(me, observer, n) {
            debug!(rank = me, requester, observer, "requester is closer than current observer, ignored");
            return;
        }

        info!(rank = me, observer = requester, previous = observer, "observer changed");
        self.observer = Some(requester);
        self.last_sent_ms = None;
        self.heartbeat(transport, now_ms);
    }

    /// Find the next live predecessor and ask it to heartbeat us.
    ///
    /// Disables the detector if every other daemon has failed. A send
    /// failure leaves the ring untouched so the next tick tries again.
    pub fn ring_repair(&mut self, transport: &dyn Transport, now_ms: u64) {
        let me = self.group.my_rank;
        let Some(observing) = self.observing else {
            return;
        };

        let Some(next) = ring::next_live_predecessor(observing, me, self.group.size, &self.failed)
        else {
            info!(rank = me, failed = self.failed.len(), "every other daemon has failed");
            self.disable(transport);
            return;
        };

        let request = WireMessage::heartbeat_request(self.group.job, me);
        if let Err(error) = send(transport, next, &request) {
            warn!(rank = me, observing = next, %error, "heartbeat request failed, will retry");
            return;
        }

        info!(rank = me, observing = next, previous = observing, "ring repaired");
        self.observing = Some(next);
        self.last_received_ms = Some(now_ms + self.timeout_ms);
    }

    /// Leave the ring.
    ///
    /// A live observer is sent one last heartbeat carrying its own rank as
    /// the sender, which tells it to leave as well. The farewell travels
    /// around the ring until it reaches a daemon that is already disabled.
    pub fn disable(&mut self, transport: &dyn Transport) {
        if let Some(observer) = self.observer {
            if observer != self.group.my_rank && !self.failed.contains(&observer) {
                debug!(rank = self.group.my_rank, observer, "sending final heartbeat");
                let farewell = WireMessage::heartbeat(self.group.job, observer);
                if let Err(error) = send(transport, observer, &farewell) {
                    warn!(rank = self.group.my_rank, observer, %error, "final heartbeat failed");
                }
            }
        }
        self.stop();
    }

    fn stop(&mut self) {
        if self.status == DetectorStatus::Active {
            info!(rank = self.group.my_rank, "detector disabled");
        }
        self.status = DetectorStatus::Disabled;
        self.observing = None;
        self.observer = None;
        self.last_sent_ms = None;
        self.last_received_ms = None;
    }

    fn heartbeat(&mut self, transport: &dyn Transport, now_ms: u64) {
        if let Some(last) = self.last_sent_ms {
            let since = now_ms.saturating_sub(last);
            if since >= 2 * self.period_ms {
                warn!(
                    rank = self.group.my_rank,
                    since_ms = since,
                    "missed heartbeat deadline, this daemon may be falsely suspected"
                );
            }
        }
        self.last_sent_ms = Some(now_ms);

        let Some(observer) = self.observer else {
            return;
        };
        let heartbeat = WireMessage::heartbeat(self.group.job, self.group.my_rank);
        match send(transport, observer, &heartbeat) {
            Ok(()) => trace!(rank = self.group.my_rank, observer, "heartbeat sent"),
            Err(error) => warn!(rank = self.group.my_rank, observer, %error, "heartbeat send failed"),
        }
    }

    // ==================== Queries ====================

    pub fn status(&self) -> DetectorStatus {
        self.status
    }

    pub fn is_active(&self) -> bool {
        self.status == DetectorStatus::Active
    }

    pub fn observing(&self) -> Option<Rank> {
        self.observing
    }

    pub fn observer(&self) -> Option<Rank> {
        self.observer
    }

    pub fn last_received_ms(&self) -> Option<u64> {
        self.last_received_ms
    }

    /// Ranks this daemon has declared dead.
    pub fn failed(&self) -> &BTreeSet<Rank> {
        &self.failed
    }

    /// Whether this daemon still believes `rank` is alive.
    pub fn is_daemon_alive(&self, rank: Rank) -> bool {
        self.group.contains(rank) && !self.failed.contains(&rank)
    }

    /// How often the hosting loop should call [`on_tick`](Self::on_tick).
    ///
    /// A tenth of the period, so a timeout is noticed at most one tenth of
    /// a period late.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis((self.period_ms / 10).max(1))
    }
}

fn send(
    transport: &dyn Transport,
    dest: Rank,
    message: &WireMessage,
) -> Result<(), Box<dyn std::error::Error>> {
    transport.send(dest, message.to_json()?)?;
    Ok(())
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingTransport;

    const JOB: u32 = 1;

    #[derive(Default)]
    struct Reports(Vec<ProcessId>);

    impl FailureReporter for Reports {
        fn report_failure(&mut self, failed_proc: ProcessId, state: ProcState) {
            assert_eq!(state, ProcState::Aborted);
            self.0.push(failed_proc);
        }
    }

    fn config(period_ms: u64, timeout_ms: u64) -> DetectorConfig {
        DetectorConfig {
            enabled: true,
            heartbeat_period: Duration::from_millis(period_ms),
            heartbeat_timeout: Duration::from_millis(timeout_ms),
        }
    }

    fn enabled(rank: Rank, size: u32) -> RingDetector {
        let mut detector = RingDetector::new(GroupInfo::new(JOB, rank, size));
        detector.enable(&config(1000, 2000), 0);
        detector
    }

    fn heartbeats_sent(transport: &RecordingTransport) -> Vec<(Rank, Rank)> {
        transport
            .take()
            .into_iter()
            .filter_map(|(dest, msg)| match msg {
                WireMessage::Heartbeat { sender_rank, .. } => Some((dest, sender_rank)),
                _ => None,
            })
            .collect()
    }

    // ==================== Enable ====================

    #[test]
    fn test_enable_links_ring() {
        let detector = enabled(1, 4);
        assert_eq!(detector.status(), DetectorStatus::Active);
        assert_eq!(detector.observing(), Some(4));
        assert_eq!(detector.observer(), Some(2));
        assert_eq!(detector.last_received_ms(), Some(4000));
        assert_eq!(detector.tick_interval(), Duration::from_millis(100));
    }

    #[test]
    fn test_single_daemon_disabled() {
        let detector = enabled(1, 1);
        assert_eq!(detector.status(), DetectorStatus::Disabled);
        assert_eq!(detector.observing(), None);
        assert_eq!(detector.observer(), None);
    }

    #[test]
    fn test_new_is_uninitialized() {
        let detector = RingDetector::new(GroupInfo::new(JOB, 1, 4));
        assert_eq!(detector.status(), DetectorStatus::Uninitialized);
        assert_eq!(detector.observer(), None);
    }

    // ==================== Heartbeats ====================

    #[test]
    fn test_first_tick_heartbeats_observer() {
        let mut detector = enabled(2, 4);
        let transport = RecordingTransport::new();
        let mut reports = Reports::default();

        detector.on_tick(&transport, &mut reports, 0);
        detector.on_tick(&transport, &mut reports, 500);
        detector.on_tick(&transport, &mut reports, 1000);

        assert_eq!(heartbeats_sent(&transport), vec![(3, 2), (3, 2)]);
        assert!(reports.0.is_empty());
    }

    #[test]
    fn test_heartbeat_from_observed_resets_deadline() {
        let mut detector = enabled(2, 4);
        detector.on_heartbeat(&RecordingTransport::new(), 1, 7000);
        assert_eq!(detector.last_received_ms(), Some(7000));
    }

    #[test]
    fn test_heartbeat_from_other_rank_ignored() {
        let mut detector = enabled(2, 4);
        detector.on_heartbeat(&RecordingTransport::new(), 3, 7000);
        assert_eq!(detector.last_received_ms(), Some(4000));
    }

    #[test]
    fn test_heartbeat_from_self_disables_and_passes_farewell_on() {
        let mut detector = enabled(2, 4);
        let transport = RecordingTransport::new();
        detector.on_heartbeat(&transport, 2, 100);

        assert_eq!(detector.status(), DetectorStatus::Disabled);
        assert_eq!(detector.observing(), None);
        assert_eq!(detector.observer(), None);
        assert_eq!(detector.last_received_ms(), None);
        // Rank 3 heartbeats nobody else, so it must be told to stop
        assert_eq!(heartbeats_sent(&transport), vec![(3, 3)]);
    }

    #[test]
    fn test_failed_heartbeat_send_is_not_fatal() {
        let mut detector = enabled(2, 4);
        let transport = RecordingTransport::new();
        transport.fail_sends_to(3);

        detector.on_tick(&transport, &mut Reports::default(), 0);

        assert!(detector.is_active());
        assert!(transport.take().is_empty());
    }

    // ==================== Suspicion ====================

    #[test]
    fn test_detection_within_one_tick_of_deadline() {
        let mut detector = enabled(2, 4);
        let transport = RecordingTransport::new();
        let mut reports = Reports::default();
        let tick = detector.tick_interval().as_millis() as u64;

        // Last heartbeat from rank 1 at t=5000; timeout is 2000
        detector.on_heartbeat(&transport, 1, 5000);

        let mut now = 5000;
        while reports.0.is_empty() {
            now += tick;
            detector.on_tick(&transport, &mut reports, now);
            assert!(now <= 5000 + 2000 + tick, "not detected in time");
        }

        assert!(now > 5000 + 2000, "detected too early at {now}");
        assert_eq!(reports.0, vec![ProcessId::new(JOB, 1)]);
        assert!(!detector.is_daemon_alive(1));
    }

    #[test]
    fn test_exactly_at_timeout_is_not_failure() {
        let mut detector = enabled(2, 4);
        let transport = RecordingTransport::new();
        let mut reports = Reports::default();

        detector.on_heartbeat(&transport, 1, 5000);
        detector.on_tick(&transport, &mut reports, 7000);
        assert!(reports.0.is_empty());

        detector.on_tick(&transport, &mut reports, 7001);
        assert_eq!(reports.0.len(), 1);
    }

    #[test]
    fn test_startup_grace_scales_with_group() {
        let mut detector = enabled(2, 4);
        let transport = RecordingTransport::new();
        let mut reports = Reports::default();

        // Deadline is 4000 (grace) + 2000 (timeout)
        detector.on_tick(&transport, &mut reports, 6000);
        assert!(reports.0.is_empty());
        detector.on_tick(&transport, &mut reports, 6001);
        assert_eq!(reports.0, vec![ProcessId::new(JOB, 1)]);
    }

    // ==================== Ring repair ====================

    #[test]
    fn test_repair_requests_next_predecessor() {
        // Rank 4 of 4 observing 3; 3 dies
        let mut detector = enabled(4, 4);
        let transport = RecordingTransport::new();
        let mut reports = Reports::default();

        detector.on_tick(&transport, &mut reports, 6001);
        let sent = transport.take();

        assert_eq!(reports.0, vec![ProcessId::new(JOB, 3)]);
        assert_eq!(detector.observing(), Some(2));
        assert_eq!(detector.last_received_ms(), Some(6001 + 2000));
        assert!(sent.contains(&(2, WireMessage::heartbeat_request(JOB, 4))));
    }

    #[test]
    fn test_repair_skips_adjacent_failures() {
        let mut detector = enabled(6, 6);
        let transport = RecordingTransport::new();
        let mut reports = Reports::default();

        // 5, 4 and 3 die one after another. After each repair the new
        // predecessor gets a full timeout of slack on top of the timeout.
        let mut now = 8001;
        for _ in 0..3 {
            detector.on_tick(&transport, &mut reports, now);
            now += 4001;
        }

        assert_eq!(
            reports.0,
            vec![ProcessId::new(JOB, 5), ProcessId::new(JOB, 4), ProcessId::new(JOB, 3)]
        );
        assert_eq!(detector.observing(), Some(2));
        assert!(detector.is_active());
    }

    #[test]
    fn test_repair_skips_ranks_already_failed() {
        let mut detector = enabled(6, 6);
        let transport = RecordingTransport::new();
        let mut reports = Reports::default();

        // 4 and 3 were already declared dead; 5 times out next
        detector.failed.extend([4, 3]);
        detector.on_tick(&transport, &mut reports, 8001);

        assert_eq!(reports.0, vec![ProcessId::new(JOB, 5)]);
        assert_eq!(detector.observing(), Some(2));
    }

    #[test]
    fn test_last_survivor_disables() {
        let n = 4;
        let mut detector = enabled(4, n);
        let transport = RecordingTransport::new();
        let mut reports = Reports::default();

        let mut now = 6001;
        for _ in 0..(n - 1) {
            detector.on_tick(&transport, &mut reports, now);
            now += 4001;
        }

        assert_eq!(reports.0.len(), (n - 1) as usize);
        assert_eq!(detector.status(), DetectorStatus::Disabled);
        assert_eq!(detector.observing(), None);
        assert_eq!(detector.observer(), None);
        // Observer (rank 1) is dead, so no farewell goes out
        transport.take();
        detector.on_tick(&transport, &mut reports, now + 10_000);
        assert!(transport.take().is_empty());
    }

    #[test]
    fn test_failed_repair_send_retries_without_rereport() {
        let mut detector = enabled(4, 4);
        let transport = RecordingTransport::new();
        let mut reports = Reports::default();
        transport.fail_sends_to(2);

        detector.on_tick(&transport, &mut reports, 6001);
        assert_eq!(detector.observing(), Some(3));
        assert_eq!(reports.0.len(), 1);

        transport.heal(2);
        detector.on_tick(&transport, &mut reports, 6101);

        assert_eq!(reports.0.len(), 1);
        assert_eq!(detector.observing(), Some(2));
        assert!(transport
            .take()
            .contains(&(2, WireMessage::heartbeat_request(JOB, 4))));
    }

    // ==================== Heartbeat requests ====================

    #[test]
    fn test_request_from_farther_rank_accepted() {
        // Rank 2 of 4, observer 3; rank 4 asks after 3 died
        let mut detector = enabled(2, 4);
        let transport = RecordingTransport::new();

        detector.on_heartbeat_request(&transport, 4, 100);

        assert_eq!(detector.observer(), Some(4));
        assert_eq!(heartbeats_sent(&transport), vec![(4, 2)]);
    }

    #[test]
    fn test_request_from_closer_rank_rejected() {
        let mut detector = enabled(2, 4);
        let transport = RecordingTransport::new();
        detector.on_heartbeat_request(&transport, 4, 100);
        transport.take();

        detector.on_heartbeat_request(&transport, 3, 200);

        assert_eq!(detector.observer(), Some(4));
        assert!(transport.take().is_empty());
    }

    #[test]
    fn test_request_from_current_observer_reapplies() {
        let mut detector = enabled(2, 4);
        let transport = RecordingTransport::new();

        detector.on_heartbeat_request(&transport, 3, 100);

        assert_eq!(detector.observer(), Some(3));
        assert_eq!(heartbeats_sent(&transport), vec![(3, 2)]);
    }

    #[test]
    fn test_request_when_inactive_ignored() {
        let mut detector = RingDetector::new(GroupInfo::new(JOB, 2, 4));
        let transport = RecordingTransport::new();

        detector.on_heartbeat_request(&transport, 4, 100);

        assert_eq!(detector.observer(), None);
        assert!(transport.take().is_empty());
    }

    // ==================== Disable ====================

    #[test]
    fn test_disable_sends_farewell_to_observer() {
        let mut detector = enabled(2, 4);
        let transport = RecordingTransport::new();

        detector.disable(&transport);

        assert_eq!(heartbeats_sent(&transport), vec![(3, 3)]);
        assert_eq!(detector.status(), DetectorStatus::Disabled);
    }

    #[test]
    fn test_farewell_travels_around_the_ring() {
        let n = 4;
        let mut ring: Vec<_> = (1..=n).map(|rank| enabled(rank, n)).collect();
        let transport = RecordingTransport::new();

        ring[1].disable(&transport);
        let mut hops = 0;
        loop {
            let sent = transport.take();
            if sent.is_empty() {
                break;
            }
            for (dest, msg) in sent {
                if let WireMessage::Heartbeat { sender_rank, .. } = msg {
                    hops += 1;
                    ring[dest as usize - 1].on_heartbeat(&transport, sender_rank, 100);
                }
            }
        }

        // 2 -> 3 -> 4 -> 1 -> 2, where the already disabled leaver ends it
        assert_eq!(hops, 4);
        for detector in &ring {
            assert_eq!(detector.status(), DetectorStatus::Disabled);
        }

        // Nobody is left watching, so nothing is ever reported
        let mut reports = Reports::default();
        for detector in &mut ring {
            detector.on_tick(&transport, &mut reports, 100_000);
        }
        assert!(reports.0.is_empty());
    }

    #[test]
    fn test_disabled_detector_ignores_ticks() {
        let mut detector = enabled(2, 4);
        let transport = RecordingTransport::new();
        detector.disable(&transport);
        transport.take();

        detector.on_tick(&transport, &mut Reports::default(), 100_000);

        assert!(transport.take().is_empty());
    }
}
