//! Local event sink for confirmed failures.
//!
//! Provides `FaultEvent` for the rest of the runtime and `EventBus` for
//! subscriptions. The bus is `Arc` + `RwLock` so subscribers may live on
//! other threads than the daemon loop.

use crate::process_id::{ProcessId, Rank};
use crate::propagate::ProcState;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Events raised on the local daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FaultEvent {
    /// A process failure was detected here or learned from a broadcast.
    ///
    /// Raised at most once per failed process on each daemon.
    #[serde(rename_all = "camelCase")]
    ProcessFailed {
        state: ProcState,
        failed_proc: ProcessId,
        /// Application processes the failed daemon was hosting, as reported
        /// by the daemon that detected the failure.
        affected_procs: Vec<ProcessId>,
        /// Whether this daemon detected the failure itself.
        detected_locally: bool,
    },

    /// The ring detector on this daemon stopped.
    ///
    /// Happens on shutdown, when a peer signals it has nothing left to
    /// watch, or when every other daemon has been declared dead.
    #[serde(rename_all = "camelCase")]
    DetectorDisabled { rank: Rank },
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Hold this value to keep receiving events; drop it to unsubscribe.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

type Callback = Arc<dyn Fn(FaultEvent) + Send + Sync>;

/// Event bus for publishing fault events to subscribers.
///
/// Wrap in `Arc` to enable subscriptions.
#[derive(Default)]
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Callback)>>,
    next_id: AtomicUsize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(FaultEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // try_write: Drop may run while a panicking emit still holds the read lock
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.callbacks.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: FaultEvent) {
        // Snapshot so a callback may subscribe without deadlocking
        let callbacks: Vec<Callback> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }
}
