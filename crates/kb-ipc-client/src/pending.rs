//! Pending-call bookkeeping shared by the client transports.
//!
//! One table per transport instance, owned by that instance. Entries are
//! created when a call is sent, removed when its response arrives, removed
//! by the caller when its deadline elapses, and drained en masse when the
//! connection is lost.

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use kb_ipc_types::{Value, WireMessage};

use crate::errors::TransportError;

const PENDING_TARGET: &str = "kb_ipc_client::pending";

/// Outcome delivered to the thread blocked in `send`.
pub(crate) type CallOutcome = Result<Value, TransportError>;

/// Map from request id to the completion sender of the blocked caller.
#[derive(Debug, Default)]
pub(crate) struct PendingCalls {
    entries: Mutex<HashMap<String, mpsc::Sender<CallOutcome>>>,
}

impl PendingCalls {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, mpsc::Sender<CallOutcome>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers an in-flight call and returns the receiver its caller
    /// blocks on. Request ids must be unique among pending calls.
    pub(crate) fn register(
        &self,
        request_id: &str,
    ) -> Result<mpsc::Receiver<CallOutcome>, TransportError> {
        let mut entries = self.entries();
        if entries.contains_key(request_id) {
            return Err(TransportError::DuplicateRequestId {
                request_id: request_id.to_owned(),
            });
        }
        let (sender, receiver) = mpsc::channel();
        entries.insert(request_id.to_owned(), sender);
        Ok(receiver)
    }

    /// Delivers an outcome to the matching caller and removes the entry.
    ///
    /// Returns `false` when no entry matches (for example a response to a
    /// call that already timed out); such outcomes are discarded.
    pub(crate) fn complete(&self, request_id: &str, outcome: CallOutcome) -> bool {
        let Some(sender) = self.entries().remove(request_id) else {
            return false;
        };
        // The caller may have given up between lookup and delivery; a closed
        // receiver is not an error.
        drop(sender.send(outcome));
        true
    }

    /// Removes an entry without delivering anything. Used by a caller whose
    /// deadline elapsed.
    pub(crate) fn abandon(&self, request_id: &str) {
        drop(self.entries().remove(request_id));
    }

    /// Drains the table, failing every pending call.
    pub(crate) fn fail_all(&self, make_error: impl Fn() -> TransportError) {
        let drained: Vec<(String, mpsc::Sender<CallOutcome>)> =
            self.entries().drain().collect();
        if drained.is_empty() {
            return;
        }
        debug!(
            target: PENDING_TARGET,
            count = drained.len(),
            "failing all pending calls"
        );
        for (_, sender) in drained {
            drop(sender.send(Err(make_error())));
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries().len()
    }
}

/// Routes one decoded inbound message to its pending call.
///
/// Responses with no matching entry (for example answers to calls that
/// already timed out) are discarded. Call envelopes never flow towards a
/// client; one showing up indicates a confused peer and is ignored.
pub(crate) fn route_message(pending: &PendingCalls, message: WireMessage) {
    match message {
        WireMessage::Response(response) => {
            let request_id = response.request_id().to_owned();
            let outcome = response.into_outcome().map_err(TransportError::Remote);
            if !pending.complete(&request_id, outcome) {
                debug!(
                    target: PENDING_TARGET,
                    %request_id,
                    "discarding response with no pending call"
                );
            }
        }
        WireMessage::Call(call) => {
            warn!(
                target: PENDING_TARGET,
                request_id = call.request_id(),
                "ignoring call envelope received by a client transport"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_complete_delivers_outcome() {
        let pending = PendingCalls::new();
        let receiver = pending.register("req-1").expect("register");

        assert!(pending.complete("req-1", Ok(Value::from("done"))));
        let outcome = receiver.recv().expect("receive").expect("successful outcome");
        assert_eq!(outcome, Value::from("done"));
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn duplicate_request_ids_are_rejected() {
        let pending = PendingCalls::new();
        let _receiver = pending.register("req-1").expect("register");

        let error = pending.register("req-1").expect_err("duplicate id");
        assert!(matches!(error, TransportError::DuplicateRequestId { .. }));
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn unknown_request_ids_are_discarded() {
        let pending = PendingCalls::new();
        assert!(!pending.complete("req-404", Ok(Value::Null)));
    }

    #[test]
    fn abandon_removes_without_delivery() {
        let pending = PendingCalls::new();
        let receiver = pending.register("req-1").expect("register");
        pending.abandon("req-1");

        assert_eq!(pending.len(), 0);
        assert!(receiver.recv().is_err(), "sender must be gone");
    }

    #[test]
    fn fail_all_rejects_every_entry() {
        let pending = PendingCalls::new();
        let first = pending.register("req-1").expect("register first");
        let second = pending.register("req-2").expect("register second");

        pending.fail_all(|| TransportError::ConnectionLost);

        assert!(matches!(
            first.recv().expect("first outcome"),
            Err(TransportError::ConnectionLost)
        ));
        assert!(matches!(
            second.recv().expect("second outcome"),
            Err(TransportError::ConnectionLost)
        ));
        assert_eq!(pending.len(), 0);
    }
}
