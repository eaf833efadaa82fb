//! Optimistic-mutation tracking.
//!
//! [`MutationTracker`] correlates optimistic client mutations with server
//! acknowledgements delivered via the sync stream. Each tracked mutation
//! gets a locally assigned **ephemeral ID**; once the server assigns a
//! permanent mutation ID the reverse index links the two, and
//! `lmid_advanced` resolves everything at or below the acknowledged
//! last-mutation-ID.
//!
//! The outstanding map is insertion-ordered and mutation IDs are assigned
//! monotonically, so resolution stops at the first entry beyond the LMID.
//! Settled entries are removed, which makes re-resolution idempotent.
//!
//! All state mutations happen on the sync-decoder's thread; outcome
//! consumers may observe results from anywhere via the handle.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;

use tracing::{debug, warn};

use crate::error::{LiteTrickleError, ProtocolError};
use crate::protocol::{
    CompletedPoke, MUTATION_ERROR_ALREADY_PROCESSED, MUTATION_ERROR_APP, MUTATION_ERROR_OOO,
    MutationAck, MutationResult, PushResponse,
};

pub type EphemeralId = u64;

/// Final resolution of one tracked mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
    Success,
    /// An application error raised inside a custom mutator: terminal for
    /// the mutation, non-fatal for the pipeline.
    AppError {
        message: Option<String>,
        details: Option<serde_json::Value>,
    },
    /// A fatal protocol-level failure.
    Fatal(ProtocolError),
}

impl MutationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, MutationOutcome::Success)
    }
}

struct SettleSlot {
    outcome: Option<MutationOutcome>,
    listeners: Vec<Box<dyn FnOnce(&MutationOutcome)>>,
}

/// The caller's view of a tracked mutation. Settled exactly once.
pub struct MutationHandle {
    pub ephemeral_id: EphemeralId,
    slot: Rc<RefCell<SettleSlot>>,
}

impl MutationHandle {
    pub fn outcome(&self) -> Option<MutationOutcome> {
        self.slot.borrow().outcome.clone()
    }

    pub fn is_settled(&self) -> bool {
        self.slot.borrow().outcome.is_some()
    }

    /// Run `f` when the mutation settles; immediately if it already has.
    pub fn on_settled(&self, f: impl FnOnce(&MutationOutcome) + 'static) {
        let settled = self.slot.borrow().outcome.clone();
        match settled {
            Some(outcome) => f(&outcome),
            None => self.slot.borrow_mut().listeners.push(Box::new(f)),
        }
    }
}

fn settle(slot: &Rc<RefCell<SettleSlot>>, outcome: MutationOutcome) {
    let listeners = {
        let mut slot = slot.borrow_mut();
        if slot.outcome.is_some() {
            return;
        }
        slot.outcome = Some(outcome.clone());
        std::mem::take(&mut slot.listeners)
    };
    for listener in listeners {
        listener(&outcome);
    }
}

struct Outstanding {
    mutation_id: Option<u64>,
    slot: Rc<RefCell<SettleSlot>>,
}

// ── The tracker ────────────────────────────────────────────────────────────

pub struct MutationTracker {
    client_id: String,
    next_ephemeral: Cell<EphemeralId>,
    current_mutation_id: Cell<u64>,
    largest_outstanding_mutation_id: Cell<u64>,
    /// Insertion-ordered: ephemeral IDs are assigned monotonically.
    outstanding: RefCell<BTreeMap<EphemeralId, Outstanding>>,
    ephemeral_ids_by_mutation_id: RefCell<BTreeMap<u64, EphemeralId>>,
    all_applied_listeners: RefCell<Vec<Box<dyn Fn()>>>,
    on_fatal_error: RefCell<Option<Box<dyn Fn(&ProtocolError)>>>,
}

impl MutationTracker {
    pub fn new(client_id: impl Into<String>) -> Self {
        MutationTracker {
            client_id: client_id.into(),
            next_ephemeral: Cell::new(0),
            current_mutation_id: Cell::new(0),
            largest_outstanding_mutation_id: Cell::new(0),
            outstanding: RefCell::new(BTreeMap::new()),
            ephemeral_ids_by_mutation_id: RefCell::new(BTreeMap::new()),
            all_applied_listeners: RefCell::new(Vec::new()),
            on_fatal_error: RefCell::new(None),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.borrow().len()
    }

    pub fn current_mutation_id(&self) -> u64 {
        self.current_mutation_id.get()
    }

    pub fn largest_outstanding_mutation_id(&self) -> u64 {
        self.largest_outstanding_mutation_id.get()
    }

    /// Single callback for fatal errors surfaced by the tracker.
    pub fn set_on_fatal_error(&self, f: impl Fn(&ProtocolError) + 'static) {
        *self.on_fatal_error.borrow_mut() = Some(Box::new(f));
    }

    /// Subscribe to the "all outstanding mutations applied" notification.
    pub fn on_all_mutations_applied(&self, f: impl Fn() + 'static) {
        self.all_applied_listeners.borrow_mut().push(Box::new(f));
    }

    fn fatal(&self, error: ProtocolError) {
        warn!(kind = %error.kind, "mutation tracker fatal");
        if let Some(callback) = &*self.on_fatal_error.borrow() {
            callback(&error);
        }
    }

    fn notify_all_applied(&self) {
        for listener in self.all_applied_listeners.borrow().iter() {
            listener();
        }
    }

    // ── operations ───────────────────────────────────────────────────────

    /// Register a new optimistic mutation.
    pub fn track_mutation(&self) -> MutationHandle {
        let ephemeral_id = self.next_ephemeral.get() + 1;
        self.next_ephemeral.set(ephemeral_id);
        self.current_mutation_id
            .set(self.current_mutation_id.get() + 1);
        let slot = Rc::new(RefCell::new(SettleSlot {
            outcome: None,
            listeners: Vec::new(),
        }));
        self.outstanding.borrow_mut().insert(
            ephemeral_id,
            Outstanding {
                mutation_id: None,
                slot: slot.clone(),
            },
        );
        debug!(ephemeral_id, "mutation tracked");
        MutationHandle { ephemeral_id, slot }
    }

    /// Record the server-assigned mutation ID for an ephemeral one.
    /// Monotonically advances `largest_outstanding_mutation_id`.
    pub fn mutation_id_assigned(&self, ephemeral_id: EphemeralId, mutation_id: u64) {
        let mut outstanding = self.outstanding.borrow_mut();
        let Some(entry) = outstanding.get_mut(&ephemeral_id) else {
            // Already settled; assignment is late and moot.
            return;
        };
        entry.mutation_id = Some(mutation_id);
        self.ephemeral_ids_by_mutation_id
            .borrow_mut()
            .insert(mutation_id, ephemeral_id);
        if mutation_id > self.largest_outstanding_mutation_id.get() {
            self.largest_outstanding_mutation_id.set(mutation_id);
        }
    }

    /// Settle one mutation with an application error; used when the
    /// optimistic path threw before persistence.
    pub fn reject_mutation(&self, ephemeral_id: EphemeralId, cause: impl Into<String>) {
        let entry = self.outstanding.borrow_mut().remove(&ephemeral_id);
        let Some(entry) = entry else { return };
        if let Some(mutation_id) = entry.mutation_id {
            self.ephemeral_ids_by_mutation_id
                .borrow_mut()
                .remove(&mutation_id);
        }
        settle(
            &entry.slot,
            MutationOutcome::AppError {
                message: Some(cause.into()),
                details: None,
            },
        );
    }

    /// Settle every pending mutation with the given fatal; used on
    /// disconnect/close. Unblocks "all applied" listeners.
    pub fn reject_all_outstanding(&self, error: ProtocolError) {
        let drained: Vec<Outstanding> = {
            let mut outstanding = self.outstanding.borrow_mut();
            let drained = std::mem::take(&mut *outstanding);
            drained.into_values().collect()
        };
        self.ephemeral_ids_by_mutation_id.borrow_mut().clear();
        for entry in drained {
            settle(&entry.slot, MutationOutcome::Fatal(error.clone()));
        }
        self.largest_outstanding_mutation_id
            .set(self.current_mutation_id.get());
        self.notify_all_applied();
    }

    /// Process a push response from the server.
    ///
    /// Transport-level errors map to a fatal [`ProtocolError`] and invoke
    /// the fatal-error callback; per-mutation results settle individually.
    pub fn process_push_response(&self, response: &PushResponse) {
        match response {
            PushResponse::Error(error) => {
                let mut protocol_error = ProtocolError::server(
                    &error.error,
                    "push endpoint rejected the batch",
                );
                protocol_error.message = error.message.clone();
                protocol_error.mutation_ids = error.mutation_ids.clone();
                self.fatal(protocol_error);
            }
            PushResponse::Ok(ok) => {
                for ack in &ok.mutations {
                    self.process_mutation_ack(ack);
                }
            }
        }
    }

    fn process_mutation_ack(&self, ack: &MutationAck) {
        let ephemeral_id = self
            .ephemeral_ids_by_mutation_id
            .borrow()
            .get(&ack.id.id)
            .copied();
        let Some(ephemeral_id) = ephemeral_id else {
            // Unknown or already settled: re-resolution is a no-op.
            return;
        };
        match &ack.result {
            MutationResult::Ok(_) => {
                self.settle_and_remove(ephemeral_id, MutationOutcome::Success);
            }
            MutationResult::Error(error) => match error.error.as_str() {
                MUTATION_ERROR_APP => {
                    self.settle_and_remove(
                        ephemeral_id,
                        MutationOutcome::AppError {
                            message: error.message.clone(),
                            details: error.details.clone(),
                        },
                    );
                }
                // The server already persisted this one; success.
                MUTATION_ERROR_ALREADY_PROCESSED => {
                    self.settle_and_remove(ephemeral_id, MutationOutcome::Success);
                }
                MUTATION_ERROR_OOO => {
                    let protocol_error = ProtocolError::server(
                        MUTATION_ERROR_OOO,
                        "mutation acknowledged out of order",
                    );
                    self.settle_and_remove(
                        ephemeral_id,
                        MutationOutcome::Fatal(protocol_error.clone()),
                    );
                    self.fatal(protocol_error);
                }
                unknown => {
                    let protocol_error = ProtocolError::server(
                        unknown,
                        "unknown mutation result code",
                    );
                    self.settle_and_remove(
                        ephemeral_id,
                        MutationOutcome::Fatal(protocol_error.clone()),
                    );
                    self.fatal(protocol_error);
                }
            },
        }
    }

    fn settle_and_remove(&self, ephemeral_id: EphemeralId, outcome: MutationOutcome) {
        let entry = self.outstanding.borrow_mut().remove(&ephemeral_id);
        let Some(entry) = entry else { return };
        if let Some(mutation_id) = entry.mutation_id {
            self.ephemeral_ids_by_mutation_id
                .borrow_mut()
                .remove(&mutation_id);
        }
        settle(&entry.slot, outcome);
    }

    /// Resolve every outstanding mutation whose assigned ID is ≤ `lmid`.
    /// Notifies "all applied" listeners once `lmid` reaches the largest
    /// outstanding ID. Idempotent: settled entries are gone.
    pub fn lmid_advanced(&self, lmid: u64) {
        let resolved: Vec<EphemeralId> = {
            let outstanding = self.outstanding.borrow();
            let mut resolved = Vec::new();
            for (ephemeral_id, entry) in outstanding.iter() {
                match entry.mutation_id {
                    Some(mutation_id) if mutation_id <= lmid => resolved.push(*ephemeral_id),
                    // IDs are assigned monotonically over the
                    // insertion-ordered map; the first ID beyond the LMID
                    // (or not yet assigned) ends the scan.
                    _ => break,
                }
            }
            resolved
        };
        for ephemeral_id in resolved {
            self.settle_and_remove(ephemeral_id, MutationOutcome::Success);
        }
        if lmid >= self.largest_outstanding_mutation_id.get() {
            self.notify_all_applied();
        }
    }

    /// Feed a completed poke: advances the LMID for this tracker's client.
    pub fn apply_poke(&self, poke: &CompletedPoke) {
        if let Some(lmid) = poke.last_mutation_id_changes.get(&self.client_id) {
            self.lmid_advanced(*lmid);
        }
    }
}

impl std::fmt::Debug for MutationTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationTracker")
            .field("client_id", &self.client_id)
            .field("outstanding", &self.outstanding.borrow().len())
            .field("current_mutation_id", &self.current_mutation_id.get())
            .field(
                "largest_outstanding_mutation_id",
                &self.largest_outstanding_mutation_id.get(),
            )
            .finish()
    }
}

impl MutationOutcome {
    /// Convert into a crate error for callers that propagate with `?`.
    pub fn into_result(self) -> Result<(), LiteTrickleError> {
        match self {
            MutationOutcome::Success => Ok(()),
            MutationOutcome::AppError { message, .. } => Err(LiteTrickleError::InvalidArgument(
                message.unwrap_or_else(|| "application error".into()),
            )),
            MutationOutcome::Fatal(error) => Err(LiteTrickleError::Protocol(error)),
        }
    }
}
