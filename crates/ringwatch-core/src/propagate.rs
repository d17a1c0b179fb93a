//! Failure propagation.
//!
//! Turns one daemon's detection into a cluster-wide notification that
//! every daemon raises locally exactly once. Deduplication lives here: the
//! broadcast layer forwards for as long as this module's handler answers
//! `Forward`, and the handler stops answering `Forward` once a failure has
//! been seen.

use crate::events::{EventBus, FaultEvent};
use crate::process_id::{ProcessId, Rank};
use crate::protocol::codec;
use crate::rbcast::{BroadcastError, ForwardDecision, HandlerId, ReliableBroadcast};
use crate::transport::{GroupInfo, HostedProcessLookup, Transport};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Terminal state carried by a failure notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProcState {
    /// Declared dead (the only state the ring detector produces)
    Aborted,
    AbortedBySignal,
    Terminated,
    CommFailure,
}

impl fmt::Display for ProcState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Aborted => "aborted",
            Self::AbortedBySignal => "aborted by signal",
            Self::Terminated => "terminated",
            Self::CommFailure => "communication failure",
        };
        f.write_str(name)
    }
}

/// Payload of a propagate broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub handler_id: HandlerId,
    pub state: ProcState,
    pub failed_proc: ProcessId,
    pub affected_procs: Vec<ProcessId>,
}

/// Every failure this daemon has announced or learned of.
///
/// Grows until the job is torn down, then is cleared as a whole.
#[derive(Debug, Default)]
pub struct ProcessedFailureSet {
    procs: HashSet<ProcessId>,
}

impl ProcessedFailureSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `proc_id`. Returns `false` if it was already recorded.
    pub fn insert(&mut self, proc_id: ProcessId) -> bool {
        self.procs.insert(proc_id)
    }

    pub fn contains(&self, proc_id: &ProcessId) -> bool {
        self.procs.contains(proc_id)
    }

    pub fn len(&self) -> usize {
        self.procs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procs.is_empty()
    }

    pub fn clear(&mut self) {
        self.procs.clear();
    }
}

/// Announces failures and deduplicates incoming announcements.
pub struct FailurePropagator {
    group: GroupInfo,
    processed: Rc<RefCell<ProcessedFailureSet>>,
    handler_id: Option<HandlerId>,
    events: Arc<EventBus>,
    lookup: Box<dyn HostedProcessLookup>,
}

impl FailurePropagator {
    /// Failures of `group`'s own daemons get their hosted processes
    /// attached.
    pub fn new(
        group: GroupInfo,
        events: Arc<EventBus>,
        lookup: Box<dyn HostedProcessLookup>,
    ) -> Self {
        Self {
            group,
            processed: Rc::new(RefCell::new(ProcessedFailureSet::new())),
            handler_id: None,
            events,
            lookup,
        }
    }

    /// Install the receive handler with the broadcast layer.
    ///
    /// Safe to call repeatedly; registers again only if the handler has
    /// gone missing from `rbcast`.
    pub fn register_callback(
        &mut self,
        rbcast: &mut ReliableBroadcast,
    ) -> Result<HandlerId, BroadcastError> {
        if let Some(id) = self.handler_id.filter(|id| rbcast.has_handler(*id)) {
            return Ok(id);
        }

        let processed = Rc::clone(&self.processed);
        let events = Arc::clone(&self.events);
        let id = rbcast.register_handler(move |payload| receive(&processed, &events, payload))?;

        self.handler_id = Some(id);
        Ok(id)
    }

    /// Remove the receive handler, if installed.
    pub fn unregister(&mut self, rbcast: &mut ReliableBroadcast) -> Result<(), BroadcastError> {
        match self.handler_id.take() {
            Some(id) => rbcast.unregister_handler(id),
            None => Ok(()),
        }
    }

    /// Application processes `daemon` is hosting, per the lookup.
    pub fn hosted_procs(&self, daemon: Rank) -> Vec<ProcessId> {
        self.lookup.hosted_procs(daemon)
    }

    pub fn handler_id(&self) -> Option<HandlerId> {
        self.handler_id
    }

    /// Announce that `failed_proc` reached `state`.
    ///
    /// `source` is `None` when this daemon made the detection itself; the
    /// local event is then raised immediately instead of waiting for the
    /// broadcast to come back around. Returns `false` when the failure was
    /// already known and nothing was sent.
    pub fn prp(
        &mut self,
        rbcast: &mut ReliableBroadcast,
        transport: &dyn Transport,
        source: Option<ProcessId>,
        failed_proc: ProcessId,
        state: ProcState,
    ) -> Result<bool, BroadcastError> {
        let handler_id = self.register_callback(rbcast)?;

        if !self.processed.borrow_mut().insert(failed_proc) {
            debug!(failed = %failed_proc, "failure already propagated");
            return Ok(false);
        }

        let affected_procs = if self.group.is_daemon(&failed_proc) {
            self.lookup.hosted_procs(failed_proc.rank)
        } else {
            Vec::new()
        };

        info!(
            failed = %failed_proc,
            %state,
            affected = affected_procs.len(),
            source = ?source.map(|s| s.to_string()),
            "propagating failure"
        );

        let record = NotificationRecord {
            handler_id,
            state,
            failed_proc,
            affected_procs,
        };
        let sent = codec::encode(&record)
            .map_err(BroadcastError::from)
            .and_then(|payload| rbcast.broadcast(transport, &payload, handler_id));
        if let Err(error) = sent {
            warn!(failed = %failed_proc, %error, "failed to broadcast failure notification");
        }

        if source.is_none() {
            self.events.emit(FaultEvent::ProcessFailed {
                state,
                failed_proc,
                affected_procs: record.affected_procs,
                detected_locally: true,
            });
        }
        Ok(true)
    }

    /// Forget every processed failure (job teardown).
    pub fn flush(&mut self) {
        let mut processed = self.processed.borrow_mut();
        debug!(count = processed.len(), "flushing processed failures");
        processed.clear();
    }

    pub fn is_processed(&self, proc_id: &ProcessId) -> bool {
        self.processed.borrow().contains(proc_id)
    }

    pub fn processed_count(&self) -> usize {
        self.processed.borrow().len()
    }
}

/// Broadcast handler for propagate notifications.
fn receive(
    processed: &RefCell<ProcessedFailureSet>,
    events: &EventBus,
    payload: &[u8],
) -> ForwardDecision {
    let record: NotificationRecord = match codec::decode(payload) {
        Ok(record) => record,
        Err(error) => {
            warn!(%error, "dropping undecodable failure notification");
            return ForwardDecision::Stop;
        }
    };

    if !processed.borrow_mut().insert(record.failed_proc) {
        return ForwardDecision::Stop;
    }

    info!(
        failed = %record.failed_proc,
        state = %record.state,
        affected = record.affected_procs.len(),
        "learned of failure"
    );

    // The carried list is authoritative: only the detecting daemon knew
    // what the failed daemon was hosting
    events.emit(FaultEvent::ProcessFailed {
        state: record.state,
        failed_proc: record.failed_proc,
        affected_procs: record.affected_procs,
        detected_locally: false,
    });
    ForwardDecision::Forward
}
