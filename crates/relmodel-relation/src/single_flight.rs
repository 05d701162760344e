//! Single-flight coordination for relation loads.
//!
//! Concurrent `load()` calls on one relation value must share a single storage
//! fetch. The gate is an async mutex: the first caller holds it while fetching,
//! later callers queue on it and are released in arrival order once the fetch
//! finishes. A released caller then sees the value already loaded and returns
//! without fetching.
//!
//! Failures are shared too. Every caller takes a ticket before queuing; when a
//! fetch fails the gate remembers the error together with the number of
//! tickets issued so far. A caller whose ticket predates the failure was
//! waiting on the failed fetch and receives the same error. A caller arriving
//! afterwards starts a fresh attempt.

use std::sync::atomic::{AtomicU64, Ordering};

use asupersync::sync::Mutex;
use relmodel_core::Error;

/// Arrival ticket for one `load()` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct Ticket(u64);

/// A failed fetch, remembered for the callers that waited on it.
#[derive(Debug)]
struct FailedLoad {
    /// Tickets below this value were issued before the failure.
    tickets_issued: u64,
    error: Error,
}

/// State guarded by the gate mutex.
#[derive(Debug, Default)]
pub(crate) struct GateSlot {
    failure: Option<FailedLoad>,
}

impl GateSlot {
    /// The error of a failed fetch this ticket was waiting on.
    pub(crate) fn shared_failure(&self, ticket: Ticket) -> Option<Error> {
        self.failure
            .as_ref()
            .filter(|failed| ticket.0 < failed.tickets_issued)
            .map(|failed| failed.error.clone())
    }

    /// Remember a failure for every ticket issued so far.
    pub(crate) fn record_failure(&mut self, gate: &LoadGate, error: Error) {
        self.failure = Some(FailedLoad {
            tickets_issued: gate.tickets.load(Ordering::SeqCst),
            error,
        });
    }

    /// Forget any earlier failure after a successful fetch.
    pub(crate) fn record_success(&mut self) {
        self.failure = None;
    }
}

pub(crate) struct LoadGate {
    tickets: AtomicU64,
    slot: Mutex<GateSlot>,
}

impl LoadGate {
    pub(crate) fn new() -> Self {
        Self {
            tickets: AtomicU64::new(0),
            slot: Mutex::new(GateSlot::default()),
        }
    }

    /// Take an arrival ticket. Must happen before locking the slot.
    pub(crate) fn ticket(&self) -> Ticket {
        Ticket(self.tickets.fetch_add(1, Ordering::SeqCst))
    }

    /// The mutex serializing fetches; hold it for the whole fetch.
    pub(crate) fn slot(&self) -> &Mutex<GateSlot> {
        &self.slot
    }

    /// Number of tickets handed out.
    pub(crate) fn issued(&self) -> u64 {
        self.tickets.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for LoadGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadGate")
            .field("tickets", &self.issued())
            .finish_non_exhaustive()
    }
}
