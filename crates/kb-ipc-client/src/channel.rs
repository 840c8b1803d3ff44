//! Channel-based client transport for directly spawned children.
//!
//! A child launched as a direct subprocess does not dial the shared platform
//! socket; its owner hands it a bidirectional message channel instead. The
//! conduit carries the same newline-framed JSONL lines as the socket wire,
//! so the owner-side bridge stays byte-compatible with the socket protocol.
//!
//! Pending-call bookkeeping is identical to the socket transport. There is
//! no reconnect logic: the channel's lifetime is tied to the owning process,
//! so once it closes the transport is permanently disconnected.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use kb_ipc_types::codec::{self, decode_line};
use kb_ipc_types::{AdapterCall, Value, WireMessage};

use crate::errors::TransportError;
use crate::pending::{PendingCalls, route_message};
use crate::transport::{AdapterTransport, ConnectionState};

const CHANNEL_TARGET: &str = "kb_ipc_client::channel";

/// Client transport over an owner-supplied message channel.
///
/// Born connected; the owner's ends of the conduit are live from the moment
/// the transport is constructed.
#[derive(Debug)]
pub struct ChannelTransport {
    call_timeout: Duration,
    outgoing: Mutex<Option<mpsc::Sender<String>>>,
    shared: Arc<ChannelShared>,
}

#[derive(Debug)]
struct ChannelShared {
    state: Mutex<ConnectionState>,
    pending: PendingCalls,
}

impl ChannelShared {
    fn state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Transitions to disconnected and fails pending calls, once.
    fn shut_down(&self, make_error: impl Fn() -> TransportError) {
        let mut state = self.state();
        if *state == ConnectionState::Disconnected {
            return;
        }
        *state = ConnectionState::Disconnected;
        drop(state);
        self.pending.fail_all(make_error);
    }
}

impl ChannelTransport {
    /// Creates a transport over the given conduit endpoints.
    ///
    /// `outgoing` carries encoded call lines towards the owner; `incoming`
    /// delivers encoded response lines from it. A reader thread drains
    /// `incoming` until the owner closes its end.
    #[must_use]
    pub fn new(
        outgoing: mpsc::Sender<String>,
        incoming: mpsc::Receiver<String>,
        call_timeout: Duration,
    ) -> Self {
        let shared = Arc::new(ChannelShared {
            state: Mutex::new(ConnectionState::Connected),
            pending: PendingCalls::new(),
        });
        let reader_shared = Arc::clone(&shared);
        thread::spawn(move || run_channel_reader(&reader_shared, &incoming));
        Self {
            call_timeout,
            outgoing: Mutex::new(Some(outgoing)),
            shared,
        }
    }

    fn send_line(&self, line: String) -> Result<(), TransportError> {
        let outgoing = self.outgoing.lock().unwrap_or_else(PoisonError::into_inner);
        match outgoing.as_ref() {
            Some(sender) => sender.send(line).map_err(|_| {
                // The owner dropped its receiving end; the conduit is gone.
                self.shared.shut_down(|| TransportError::ConnectionLost);
                TransportError::ConnectionLost
            }),
            None => Err(TransportError::NotConnected),
        }
    }
}

impl AdapterTransport for ChannelTransport {
    /// The conduit is live from construction, so connecting is a no-op
    /// while the channel is open and an error once it has closed.
    fn connect(&self) -> Result<(), TransportError> {
        match *self.shared.state() {
            ConnectionState::Connected => Ok(()),
            _ => Err(TransportError::NotConnected),
        }
    }

    fn send(&self, call: AdapterCall) -> Result<Value, TransportError> {
        call.validate()?;
        if *self.shared.state() != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }
        let timeout = call.timeout().unwrap_or(self.call_timeout);
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let deadline = Instant::now() + timeout;
        let request_id = call.request_id().to_owned();

        let receiver = self.shared.pending.register(&request_id)?;
        let line = codec::encode_message(&WireMessage::Call(call))?;
        if let Err(error) = self.send_line(line) {
            self.shared.pending.abandon(&request_id);
            return Err(error);
        }

        match receiver.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => {
                self.shared.pending.abandon(&request_id);
                debug!(target: CHANNEL_TARGET, %request_id, timeout_ms, "call timed out");
                Err(TransportError::Timeout {
                    request_id,
                    timeout_ms,
                })
            }
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::ConnectionLost),
        }
    }

    fn disconnect(&self) -> Result<(), TransportError> {
        // Dropping the sender tells the owner no more calls are coming.
        let sender = self
            .outgoing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(sender);
        self.shared.shut_down(|| TransportError::Closed);
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        *self.shared.state()
    }
}

impl Drop for ChannelTransport {
    fn drop(&mut self) {
        drop(self.disconnect());
    }
}

/// Drains inbound lines until the owner closes its end of the conduit,
/// routing each decoded response to its pending call.
fn run_channel_reader(shared: &Arc<ChannelShared>, incoming: &mpsc::Receiver<String>) {
    for line in incoming.iter() {
        if let Some(message) = decode_line(line.as_bytes()) {
            route_message(&shared.pending, message);
        }
    }
    debug!(target: CHANNEL_TARGET, "channel conduit closed by owner");
    shared.shut_down(|| TransportError::ConnectionLost);
}
