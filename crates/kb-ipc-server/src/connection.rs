//! Per-connection receive loop and call dispatch.
//!
//! Each accepted connection gets its own thread and its own receive buffer;
//! connections are never assumed to deliver whole messages in one read.
//! Every decoded call is dispatched on a dedicated thread so that slow
//! adapter calls on a connection do not delay fast ones: responses complete
//! out of order and carry the originating request id for re-correlation.

use std::collections::HashMap;
use std::io::{self, Read};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use tracing::{debug, warn};

use kb_ipc_types::codec::{self, LineDecoder};
use kb_ipc_types::{AdapterCall, AdapterResponse, PROTOCOL_VERSION, WireMessage};

use crate::handler::CallHandler;

const CONNECTION_TARGET: &str = "kb_ipc_server::connection";
const READ_CHUNK_BYTES: usize = 1024;

/// Slot the hosting process registers its dispatcher into. Shared between
/// the server handle and every connection thread.
pub(crate) type HandlerSlot = Arc<Mutex<Option<Arc<dyn CallHandler>>>>;

/// Live client connections, tracked so `close()` can tear them down.
#[derive(Debug, Default)]
pub(crate) struct ConnectionSet {
    streams: Mutex<HashMap<u64, UnixStream>>,
    next_id: AtomicU64,
}

impl ConnectionSet {
    fn streams(&self) -> MutexGuard<'_, HashMap<u64, UnixStream>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Tracks a connection and returns its id.
    pub(crate) fn insert(&self, stream: UnixStream) -> u64 {
        let connection_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.streams().insert(connection_id, stream);
        connection_id
    }

    /// Stops tracking a connection.
    pub(crate) fn remove(&self, connection_id: u64) {
        drop(self.streams().remove(&connection_id));
    }

    /// Shuts down every tracked connection, unblocking its receive loop.
    pub(crate) fn shutdown_all(&self) {
        let drained: Vec<(u64, UnixStream)> = self.streams().drain().collect();
        for (connection_id, stream) in drained {
            debug!(target: CONNECTION_TARGET, connection_id, "shutting down connection");
            drop(stream.shutdown(Shutdown::Both));
        }
    }
}

/// Serves one accepted connection until it closes or errors.
pub(crate) fn serve_connection(
    connection_id: u64,
    mut stream: UnixStream,
    writer: Arc<Mutex<UnixStream>>,
    handler: HandlerSlot,
    connections: Arc<ConnectionSet>,
) {
    debug!(target: CONNECTION_TARGET, connection_id, "connection opened");
    let mut decoder = LineDecoder::new();
    let mut chunk = [0_u8; READ_CHUNK_BYTES];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(read) => match decoder.push(&chunk[..read]) {
                Ok(messages) => {
                    for message in messages {
                        handle_message(connection_id, message, &handler, &writer);
                    }
                }
                Err(error) => {
                    warn!(
                        target: CONNECTION_TARGET,
                        connection_id,
                        %error,
                        "dropping connection with unrecoverable framing"
                    );
                    break;
                }
            },
            Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
            Err(error) => {
                debug!(
                    target: CONNECTION_TARGET,
                    connection_id,
                    %error,
                    "connection read failed"
                );
                break;
            }
        }
    }
    connections.remove(connection_id);
    debug!(target: CONNECTION_TARGET, connection_id, "connection closed");
}

fn handle_message(
    connection_id: u64,
    message: WireMessage,
    handler: &HandlerSlot,
    writer: &Arc<Mutex<UnixStream>>,
) {
    match message {
        WireMessage::Call(call) => {
            if let Err(error) = call.validate() {
                // Without a usable request id there is nothing to correlate
                // an error response to; drop the call.
                warn!(
                    target: CONNECTION_TARGET,
                    connection_id,
                    %error,
                    "dropping structurally invalid call"
                );
                return;
            }
            if call.version() != PROTOCOL_VERSION {
                // Forward-compatibility is the caller's concern; log and
                // dispatch anyway.
                warn!(
                    target: CONNECTION_TARGET,
                    connection_id,
                    version = call.version(),
                    request_id = call.request_id(),
                    "call carries an unexpected protocol version"
                );
            }
            let registered = handler
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            let Some(dispatcher) = registered else {
                warn!(
                    target: CONNECTION_TARGET,
                    connection_id,
                    request_id = call.request_id(),
                    "no call handler registered, dropping call"
                );
                return;
            };
            let writer = Arc::clone(writer);
            thread::spawn(move || dispatch_call(connection_id, &dispatcher, call, &writer));
        }
        WireMessage::Response(response) => {
            warn!(
                target: CONNECTION_TARGET,
                connection_id,
                request_id = response.request_id(),
                "ignoring response envelope sent by a client"
            );
        }
    }
}

/// Runs one adapter call and writes its response. Handler failures become a
/// normally-framed error response; they never tear down the connection.
fn dispatch_call(
    connection_id: u64,
    dispatcher: &Arc<dyn CallHandler>,
    call: AdapterCall,
    writer: &Arc<Mutex<UnixStream>>,
) {
    let request_id = call.request_id().to_owned();
    debug!(
        target: CONNECTION_TARGET,
        connection_id,
        adapter = %call.adapter(),
        method = call.method(),
        %request_id,
        "dispatching adapter call"
    );
    let response = match dispatcher.handle(call) {
        Ok(result) => AdapterResponse::success(request_id.as_str(), result),
        Err(fault) => AdapterResponse::failure(request_id.as_str(), fault),
    };

    let mut guard = writer.lock().unwrap_or_else(PoisonError::into_inner);
    if let Err(error) = codec::write_message(&mut *guard, &WireMessage::Response(response)) {
        debug!(
            target: CONNECTION_TARGET,
            connection_id,
            %request_id,
            %error,
            "failed to write response, connection likely closed"
        );
    }
}
