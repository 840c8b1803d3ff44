//! Local-socket client transport.
//!
//! Dials the parent process's Unix socket and multiplexes concurrent calls
//! over the single connection. A background reader thread decodes response
//! lines and resolves the matching pending call by request id; senders block
//! on their own completion channel, so responses may complete out of order
//! without affecting one another.
//!
//! Connection lifecycle: `disconnected -> connecting -> connected`, and on
//! loss `connected -> reconnecting -> connected` (or `disconnected` once the
//! bounded retry attempts are exhausted or reconnection is disabled). A
//! generation counter stamped on every connection invalidates the reader and
//! reconnect threads of superseded connections, so at most one reconnect
//! sequence is ever in flight.

use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use socket2::{Domain, SockAddr, Socket, Type};
use tracing::{debug, warn};

use kb_ipc_types::codec::{self, LineDecoder};
use kb_ipc_types::{AdapterCall, Value, WireMessage};

use crate::config::ClientConfig;
use crate::errors::TransportError;
use crate::pending::{PendingCalls, route_message};
use crate::transport::{AdapterTransport, ConnectionState};

const SOCKET_TARGET: &str = "kb_ipc_client::socket";
const READ_CHUNK_BYTES: usize = 1024;
const BACKOFF_BASE_MS: u64 = 50;
const BACKOFF_CAP_MS: u64 = 5_000;

/// Client transport over the parent process's local socket.
#[derive(Debug)]
pub struct SocketTransport {
    config: ClientConfig,
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    cell: Mutex<StateCell>,
    state_changed: Condvar,
    writer: Mutex<Option<UnixStream>>,
    pending: PendingCalls,
}

/// Mutable connection state. Lock ordering: `cell` before `writer`.
#[derive(Debug)]
struct StateCell {
    state: ConnectionState,
    generation: u64,
    reconnect_in_flight: bool,
}

impl Shared {
    fn cell(&self) -> MutexGuard<'_, StateCell> {
        self.cell.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn writer(&self) -> MutexGuard<'_, Option<UnixStream>> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SocketTransport {
    /// Creates a transport in the disconnected state.
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared {
                cell: Mutex::new(StateCell {
                    state: ConnectionState::Disconnected,
                    generation: 0,
                    reconnect_in_flight: false,
                }),
                state_changed: Condvar::new(),
                writer: Mutex::new(None),
                pending: PendingCalls::new(),
            }),
        }
    }

    /// Returns the transport configuration.
    #[must_use]
    pub const fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn connect_inner(&self) -> Result<(), TransportError> {
        let deadline = Instant::now() + self.config.connect_timeout();
        let mut cell = self.shared.cell();
        loop {
            match cell.state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Connecting | ConnectionState::Reconnecting => {
                    // Another attempt is in flight; wait for its outcome.
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(self.connect_error(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "timed out waiting for the in-flight connection attempt",
                        )));
                    }
                    let (guard, _) = self
                        .shared
                        .state_changed
                        .wait_timeout(cell, remaining)
                        .unwrap_or_else(PoisonError::into_inner);
                    cell = guard;
                }
                ConnectionState::Disconnected => {
                    cell.state = ConnectionState::Connecting;
                    let generation = cell.generation;
                    drop(cell);
                    return self.dial_and_install(generation);
                }
            }
        }
    }

    fn dial_and_install(&self, expected_generation: u64) -> Result<(), TransportError> {
        let dialed = dial(&self.config).and_then(|stream| {
            let reader = stream.try_clone()?;
            Ok((stream, reader))
        });
        match dialed {
            Ok((stream, reader)) => {
                if install_stream(
                    &self.shared,
                    &self.config,
                    stream,
                    reader,
                    expected_generation,
                    ConnectionState::Connecting,
                ) {
                    Ok(())
                } else {
                    Err(self.connect_error(io::Error::new(
                        io::ErrorKind::Interrupted,
                        "connection attempt superseded by disconnect",
                    )))
                }
            }
            Err(source) => {
                self.handle_dial_failure(expected_generation);
                Err(self.connect_error(source))
            }
        }
    }

    /// Transitions out of `Connecting` after a failed dial, scheduling the
    /// background retry sequence when reconnection is enabled.
    fn handle_dial_failure(&self, expected_generation: u64) {
        let mut cell = self.shared.cell();
        if cell.generation != expected_generation || cell.state != ConnectionState::Connecting {
            return;
        }
        if self.config.auto_reconnect && !cell.reconnect_in_flight {
            cell.state = ConnectionState::Reconnecting;
            cell.reconnect_in_flight = true;
            spawn_reconnect(
                Arc::clone(&self.shared),
                self.config.clone(),
                expected_generation,
            );
        } else {
            cell.state = ConnectionState::Disconnected;
        }
        drop(cell);
        self.shared.state_changed.notify_all();
    }

    fn connect_error(&self, source: io::Error) -> TransportError {
        TransportError::Connect {
            path: self.config.socket_path.clone(),
            source: Arc::new(source),
        }
    }

    fn send_inner(&self, call: AdapterCall) -> Result<Value, TransportError> {
        call.validate()?;
        let timeout = call.timeout().unwrap_or_else(|| self.config.call_timeout());
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let deadline = Instant::now() + timeout;
        let request_id = call.request_id().to_owned();

        self.await_connected(deadline, &request_id, timeout_ms)?;

        let receiver = self.shared.pending.register(&request_id)?;
        let line = codec::encode_message(&WireMessage::Call(call))?;
        if let Err(error) = self.write_line(&line) {
            self.shared.pending.abandon(&request_id);
            return Err(error);
        }

        match receiver.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => {
                self.shared.pending.abandon(&request_id);
                debug!(target: SOCKET_TARGET, %request_id, timeout_ms, "call timed out");
                Err(TransportError::Timeout {
                    request_id,
                    timeout_ms,
                })
            }
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::ConnectionLost),
        }
    }

    /// Blocks until the transport is connected, failing fast from the
    /// disconnected state and bounding the wait by the call deadline while
    /// a connect or reconnect attempt is in flight.
    fn await_connected(
        &self,
        deadline: Instant,
        request_id: &str,
        timeout_ms: u64,
    ) -> Result<(), TransportError> {
        let mut cell = self.shared.cell();
        loop {
            match cell.state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Disconnected => return Err(TransportError::NotConnected),
                ConnectionState::Connecting | ConnectionState::Reconnecting => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(TransportError::Timeout {
                            request_id: request_id.to_owned(),
                            timeout_ms,
                        });
                    }
                    let (guard, _) = self
                        .shared
                        .state_changed
                        .wait_timeout(cell, remaining)
                        .unwrap_or_else(PoisonError::into_inner);
                    cell = guard;
                }
            }
        }
    }

    fn write_line(&self, line: &str) -> Result<(), TransportError> {
        let mut writer = self.shared.writer();
        let Some(stream) = writer.as_mut() else {
            return Err(TransportError::NotConnected);
        };
        stream
            .write_all(line.as_bytes())
            .and_then(|()| stream.flush())
            .map_err(|error| TransportError::Write {
                source: Arc::new(error),
            })
    }

    fn disconnect_inner(&self) -> Result<(), TransportError> {
        let mut cell = self.shared.cell();
        let was_idle = cell.state == ConnectionState::Disconnected;
        cell.state = ConnectionState::Disconnected;
        // The generation bump invalidates the reader thread of the current
        // connection and any scheduled reconnect sequence.
        cell.generation += 1;
        cell.reconnect_in_flight = false;
        let stream = self.shared.writer().take();
        drop(cell);

        if let Some(stream) = stream {
            drop(stream.shutdown(Shutdown::Both));
        }
        self.shared.pending.fail_all(|| TransportError::Closed);
        self.shared.state_changed.notify_all();
        if !was_idle {
            debug!(target: SOCKET_TARGET, "transport disconnected");
        }
        Ok(())
    }
}

impl AdapterTransport for SocketTransport {
    fn connect(&self) -> Result<(), TransportError> {
        self.connect_inner()
    }

    fn send(&self, call: AdapterCall) -> Result<Value, TransportError> {
        self.send_inner(call)
    }

    fn disconnect(&self) -> Result<(), TransportError> {
        self.disconnect_inner()
    }

    fn state(&self) -> ConnectionState {
        self.shared.cell().state
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        drop(self.disconnect_inner());
    }
}

fn dial(config: &ClientConfig) -> io::Result<UnixStream> {
    let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
    let address = SockAddr::unix(config.socket_path.as_str())?;
    socket.connect_timeout(&address, config.connect_timeout())?;
    Ok(std::os::fd::OwnedFd::from(socket).into())
}

/// Promotes a freshly dialled stream to the live connection and starts its
/// reader thread. Returns `false` when the attempt was superseded (by a
/// disconnect or a competing connection) while the dial was in progress.
fn install_stream(
    shared: &Arc<Shared>,
    config: &ClientConfig,
    stream: UnixStream,
    reader: UnixStream,
    expected_generation: u64,
    expected_state: ConnectionState,
) -> bool {
    let mut cell = shared.cell();
    if cell.generation != expected_generation || cell.state != expected_state {
        return false;
    }
    cell.state = ConnectionState::Connected;
    cell.generation += 1;
    cell.reconnect_in_flight = false;
    let generation = cell.generation;
    *shared.writer() = Some(stream);
    drop(cell);
    shared.state_changed.notify_all();

    let reader_shared = Arc::clone(shared);
    let reader_config = config.clone();
    thread::spawn(move || run_reader(&reader_shared, &reader_config, reader, generation));
    debug!(target: SOCKET_TARGET, generation, "transport connected");
    true
}

fn run_reader(shared: &Arc<Shared>, config: &ClientConfig, mut stream: UnixStream, generation: u64) {
    let mut decoder = LineDecoder::new();
    let mut chunk = [0_u8; READ_CHUNK_BYTES];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(read) => match decoder.push(&chunk[..read]) {
                Ok(messages) => {
                    for message in messages {
                        route_message(&shared.pending, message);
                    }
                }
                Err(error) => {
                    warn!(
                        target: SOCKET_TARGET,
                        %error,
                        "dropping connection with unrecoverable framing"
                    );
                    break;
                }
            },
            Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
            Err(error) => {
                debug!(target: SOCKET_TARGET, %error, "socket read failed");
                break;
            }
        }
    }
    handle_connection_loss(shared, config, generation);
}

/// Runs once per lost connection: fails every pending call and either
/// schedules the reconnect sequence or parks the transport in the
/// disconnected state. A stale generation means a disconnect or a newer
/// connection already took over, in which case nothing is done here.
fn handle_connection_loss(shared: &Arc<Shared>, config: &ClientConfig, generation: u64) {
    let mut cell = shared.cell();
    if cell.generation != generation {
        return;
    }
    *shared.writer() = None;
    shared.pending.fail_all(|| TransportError::ConnectionLost);
    if config.auto_reconnect && !cell.reconnect_in_flight {
        cell.state = ConnectionState::Reconnecting;
        cell.reconnect_in_flight = true;
        warn!(target: SOCKET_TARGET, "connection lost, scheduling reconnect");
        spawn_reconnect(Arc::clone(shared), config.clone(), generation);
    } else {
        cell.state = ConnectionState::Disconnected;
        warn!(target: SOCKET_TARGET, "connection lost");
    }
    drop(cell);
    shared.state_changed.notify_all();
}

fn spawn_reconnect(shared: Arc<Shared>, config: ClientConfig, lost_generation: u64) {
    thread::spawn(move || run_reconnect(&shared, &config, lost_generation));
}

fn run_reconnect(shared: &Arc<Shared>, config: &ClientConfig, lost_generation: u64) {
    for attempt in 1..=config.max_reconnect_attempts {
        thread::sleep(backoff_delay(attempt));
        if reconnect_superseded(shared, lost_generation) {
            return;
        }
        debug!(target: SOCKET_TARGET, attempt, "reconnect attempt");
        let dialed = dial(config).and_then(|stream| {
            let reader = stream.try_clone()?;
            Ok((stream, reader))
        });
        match dialed {
            Ok((stream, reader)) => {
                if install_stream(
                    shared,
                    config,
                    stream,
                    reader,
                    lost_generation,
                    ConnectionState::Reconnecting,
                ) {
                    debug!(target: SOCKET_TARGET, attempt, "reconnected");
                }
                return;
            }
            Err(error) => {
                debug!(target: SOCKET_TARGET, %error, attempt, "reconnect attempt failed");
            }
        }
    }

    let mut cell = shared.cell();
    if cell.generation == lost_generation && cell.state == ConnectionState::Reconnecting {
        cell.state = ConnectionState::Disconnected;
        cell.reconnect_in_flight = false;
        warn!(
            target: SOCKET_TARGET,
            attempts = config.max_reconnect_attempts,
            "reconnect attempts exhausted"
        );
    }
    drop(cell);
    shared.state_changed.notify_all();
}

fn reconnect_superseded(shared: &Shared, lost_generation: u64) -> bool {
    let cell = shared.cell();
    cell.generation != lost_generation || cell.state != ConnectionState::Reconnecting
}

/// Delay before the given reconnect attempt (1-based).
///
/// Pure function of the attempt count: exponential from 50ms, capped at 5s.
fn backoff_delay(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(7);
    let delay_ms = BACKOFF_BASE_MS << exponent;
    Duration::from_millis(delay_ms.min(BACKOFF_CAP_MS))
}
