//! Socket listener lifecycle for the adapter-call server.
//!
//! The server owns its socket path exclusively while running. Starting
//! removes stale artifacts left by a crashed predecessor (but refuses to
//! evict a live listener), binds, opens access to any same-host process,
//! and accepts connections on a background thread. Closing tears down every
//! live connection, stops the accept loop, and removes the socket artifact
//! so a subsequent start finds a clean slate.

use std::fs;
use std::io;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::connection::{ConnectionSet, HandlerSlot, serve_connection};
use crate::errors::ServerError;
use crate::handler::CallHandler;

const LISTENER_TARGET: &str = "kb_ipc_server::listener";
const ACCEPT_BACKOFF: Duration = Duration::from_millis(25);
const ERROR_BACKOFF: Duration = Duration::from_millis(150);

/// Mode bits opening the socket to any same-host process.
const SOCKET_MODE: u32 = 0o666;

/// The parent-process adapter-call server.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use kb_ipc_server::{AdapterServer, CallHandler, ServerConfig};
/// use kb_ipc_types::{AdapterCall, ErrorValue, Value};
///
/// struct Dispatcher;
///
/// impl CallHandler for Dispatcher {
///     fn handle(&self, call: AdapterCall) -> Result<Value, ErrorValue> {
///         Ok(Value::from(call.method()))
///     }
/// }
///
/// let server = AdapterServer::new(ServerConfig::default());
/// server.set_call_handler(Arc::new(Dispatcher));
/// server.start()?;
/// // ... serve until shutdown ...
/// server.close()?;
/// # Ok::<(), kb_ipc_server::ServerError>(())
/// ```
pub struct AdapterServer {
    config: ServerConfig,
    handler: HandlerSlot,
    runtime: Mutex<Option<ServerRuntime>>,
}

impl std::fmt::Debug for AdapterServer {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("AdapterServer")
            .field("config", &self.config)
            .field("running", &self.runtime().is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct ServerRuntime {
    shutdown: Arc<AtomicBool>,
    accept_thread: JoinHandle<()>,
    connections: Arc<ConnectionSet>,
}

impl AdapterServer {
    /// Creates a stopped server with no call handler registered.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            handler: Arc::new(Mutex::new(None)),
            runtime: Mutex::new(None),
        }
    }

    /// Returns the server configuration.
    #[must_use]
    pub const fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Registers the dispatcher that executes decoded calls.
    ///
    /// May be called before or after `start()`. Until a handler is
    /// registered, decoded calls are logged and dropped without a response
    /// (an operational misconfiguration; the remote caller times out).
    pub fn set_call_handler(&self, handler: Arc<dyn CallHandler>) {
        *self.handler.lock().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    fn runtime(&self) -> MutexGuard<'_, Option<ServerRuntime>> {
        self.runtime.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Binds the socket and starts accepting connections.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::AlreadyRunning`] when the server is running,
    /// [`ServerError::InUse`] when another process is listening at the
    /// path, and a bind-stage error otherwise. A failed start leaves no
    /// socket artifact behind.
    pub fn start(&self) -> Result<(), ServerError> {
        let mut runtime = self.runtime();
        if runtime.is_some() {
            return Err(ServerError::AlreadyRunning);
        }

        let path = self.config.socket_path.clone();
        let listener = bind_socket(&path)?;
        if let Err(source) = listener.set_nonblocking(true) {
            remove_socket_artifact(&path);
            return Err(ServerError::NonBlocking { source });
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let connections = Arc::new(ConnectionSet::default());
        let accept_thread = {
            let shutdown = Arc::clone(&shutdown);
            let connections = Arc::clone(&connections);
            let handler = Arc::clone(&self.handler);
            thread::spawn(move || run_accept_loop(&listener, &path, &shutdown, &handler, &connections))
        };

        *runtime = Some(ServerRuntime {
            shutdown,
            accept_thread,
            connections,
        });
        Ok(())
    }

    /// Stops accepting, destroys every live connection, and removes the
    /// socket artifact.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::NotRunning`] when the server is not running
    /// and [`ServerError::ThreadPanic`] if the accept loop panicked.
    pub fn close(&self) -> Result<(), ServerError> {
        let runtime = self.runtime().take().ok_or(ServerError::NotRunning)?;
        runtime.shutdown.store(true, Ordering::SeqCst);
        runtime.connections.shutdown_all();
        runtime
            .accept_thread
            .join()
            .map_err(|_| ServerError::ThreadPanic)?;
        info!(
            target: LISTENER_TARGET,
            path = %self.config.socket_path,
            "server closed"
        );
        Ok(())
    }
}

impl Drop for AdapterServer {
    fn drop(&mut self) {
        drop(self.close());
    }
}

/// Prepares the socket path and binds the listener.
///
/// An existing artifact is probed before eviction: a live socket is a hard
/// error, a stale one (connection refused or vanished) is removed, and a
/// non-socket file is never touched.
fn bind_socket(path: &Utf8Path) -> Result<UnixListener, ServerError> {
    let std_path = path.as_std_path();
    if std_path.exists() {
        let metadata =
            fs::symlink_metadata(std_path).map_err(|source| ServerError::Metadata {
                path: path.to_owned(),
                source,
            })?;
        if !metadata.file_type().is_socket() {
            return Err(ServerError::NotSocket {
                path: path.to_owned(),
            });
        }
        match UnixStream::connect(std_path) {
            Ok(_stream) => {
                return Err(ServerError::InUse {
                    path: path.to_owned(),
                });
            }
            Err(error)
                if error.kind() == io::ErrorKind::ConnectionRefused
                    || error.kind() == io::ErrorKind::NotFound =>
            {
                warn!(
                    target: LISTENER_TARGET,
                    %path,
                    "removing stale socket artifact from a previous run"
                );
                fs::remove_file(std_path).map_err(|source| ServerError::StaleCleanup {
                    path: path.to_owned(),
                    source,
                })?;
            }
            Err(source) => {
                return Err(ServerError::Probe {
                    path: path.to_owned(),
                    source,
                });
            }
        }
    }

    let listener = UnixListener::bind(std_path).map_err(|source| ServerError::Bind {
        path: path.to_owned(),
        source,
    })?;

    if let Err(source) = fs::set_permissions(std_path, fs::Permissions::from_mode(SOCKET_MODE)) {
        remove_socket_artifact(path);
        return Err(ServerError::Permissions {
            path: path.to_owned(),
            source,
        });
    }

    Ok(listener)
}

fn run_accept_loop(
    listener: &UnixListener,
    path: &Utf8PathBuf,
    shutdown: &Arc<AtomicBool>,
    handler: &HandlerSlot,
    connections: &Arc<ConnectionSet>,
) {
    info!(target: LISTENER_TARGET, %path, "adapter socket listener active");
    let mut last_error = None::<io::ErrorKind>;
    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                last_error = None;
                if let Err(error) = accept_connection(stream, handler, connections) {
                    warn!(
                        target: LISTENER_TARGET,
                        %error,
                        "failed to set up accepted connection"
                    );
                }
            }
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_BACKOFF);
            }
            Err(error) => {
                let kind = error.kind();
                if last_error != Some(kind) {
                    warn!(target: LISTENER_TARGET, %error, "socket accept error");
                }
                last_error = Some(kind);
                thread::sleep(ERROR_BACKOFF);
            }
        }
    }

    remove_socket_artifact(path);
}

/// Wires up one accepted connection: a tracked clone for teardown, a shared
/// writer for out-of-order responses, and the receive loop on its own
/// thread.
fn accept_connection(
    stream: UnixStream,
    handler: &HandlerSlot,
    connections: &Arc<ConnectionSet>,
) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    let writer = Arc::new(Mutex::new(stream.try_clone()?));
    let connection_id = connections.insert(stream.try_clone()?);

    let handler = Arc::clone(handler);
    let connections = Arc::clone(connections);
    thread::spawn(move || serve_connection(connection_id, stream, writer, handler, connections));
    Ok(())
}

fn remove_socket_artifact(path: &Utf8Path) {
    if let Err(error) = fs::remove_file(path.as_std_path())
        && error.kind() != io::ErrorKind::NotFound
    {
        warn!(
            target: LISTENER_TARGET,
            %error,
            %path,
            "failed to remove socket artifact"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Write};
    use std::time::Instant;

    use mockall::mock;
    use tempfile::TempDir;

    use kb_ipc_types::{
        AdapterCall, AdapterKind, AdapterResponse, ErrorValue, Value, WireMessage,
    };

    mock! {
        Dispatcher {}

        impl CallHandler for Dispatcher {
            fn handle(&self, call: AdapterCall) -> Result<Value, ErrorValue>;
        }
    }

    fn temp_config() -> (TempDir, ServerConfig) {
        let dir = TempDir::new().expect("create temp dir");
        let socket_path =
            Utf8PathBuf::from_path_buf(dir.path().join("kb-ipc.sock")).expect("utf8 path");
        (dir, ServerConfig { socket_path })
    }

    fn connect(config: &ServerConfig) -> UnixStream {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            match UnixStream::connect(config.socket_path.as_std_path()) {
                Ok(stream) => return stream,
                Err(_) if Instant::now() < deadline => thread::sleep(Duration::from_millis(10)),
                Err(error) => panic!("connect to server: {error}"),
            }
        }
    }

    fn write_call(stream: &mut UnixStream, call: &AdapterCall) {
        let line =
            serde_json::to_string(&WireMessage::Call(call.clone())).expect("serialize call");
        stream.write_all(line.as_bytes()).expect("write call");
        stream.write_all(b"\n").expect("write delimiter");
        stream.flush().expect("flush call");
    }

    fn read_response(reader: &mut BufReader<UnixStream>) -> AdapterResponse {
        let mut line = String::new();
        assert!(
            reader.read_line(&mut line).expect("read response") > 0,
            "server closed before responding"
        );
        match serde_json::from_str(line.trim()).expect("parse response") {
            WireMessage::Response(response) => response,
            WireMessage::Call(_) => panic!("unexpected call envelope from server"),
        }
    }

    #[test]
    fn stale_socket_artifact_is_cleaned_before_binding() {
        let (_dir, config) = temp_config();
        {
            let _stale =
                UnixListener::bind(config.socket_path.as_std_path()).expect("bind stale listener");
        }
        assert!(config.socket_path.as_std_path().exists(), "stale artifact remains");

        let server = AdapterServer::new(config.clone());
        server.start().expect("start over stale artifact");
        drop(connect(&config));
        server.close().expect("close server");
        assert!(
            !config.socket_path.as_std_path().exists(),
            "close removes the socket artifact"
        );
    }

    #[test]
    fn live_socket_is_rejected_not_evicted() {
        let (_dir, config) = temp_config();
        let _existing =
            UnixListener::bind(config.socket_path.as_std_path()).expect("bind existing listener");

        let server = AdapterServer::new(config.clone());
        let error = server.start().expect_err("must refuse a live socket");
        assert!(matches!(error, ServerError::InUse { .. }));
        assert!(
            config.socket_path.as_std_path().exists(),
            "the live socket must not be evicted"
        );
    }

    #[test]
    fn non_socket_artifact_is_rejected() {
        let (_dir, config) = temp_config();
        fs::write(config.socket_path.as_std_path(), b"not a socket").expect("write file");

        let server = AdapterServer::new(config.clone());
        let error = server.start().expect_err("must refuse a non-socket file");
        assert!(matches!(error, ServerError::NotSocket { .. }));
    }

    #[test]
    fn restarting_at_the_same_address_succeeds() {
        let (_dir, config) = temp_config();

        let first = AdapterServer::new(config.clone());
        first.start().expect("first start");
        first.close().expect("first close");

        let second = AdapterServer::new(config.clone());
        second.start().expect("second start finds a clean slate");
        drop(connect(&config));
        second.close().expect("second close");
    }

    #[test]
    fn double_start_and_stray_close_are_errors() {
        let (_dir, config) = temp_config();
        let server = AdapterServer::new(config);

        assert!(matches!(server.close(), Err(ServerError::NotRunning)));
        server.start().expect("start");
        assert!(matches!(server.start(), Err(ServerError::AlreadyRunning)));
        server.close().expect("close");
    }

    #[test]
    fn bound_socket_is_accessible_to_any_same_host_process() {
        let (_dir, config) = temp_config();
        let server = AdapterServer::new(config.clone());
        server.start().expect("start");

        let mode = fs::metadata(config.socket_path.as_std_path())
            .expect("socket metadata")
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o666);

        server.close().expect("close");
    }

    #[test]
    fn dispatches_calls_and_writes_correlated_responses() {
        let (_dir, config) = temp_config();
        let server = AdapterServer::new(config.clone());

        let mut dispatcher = MockDispatcher::new();
        dispatcher
            .expect_handle()
            .returning(|call| Ok(Value::from(call.method())));
        server.set_call_handler(Arc::new(dispatcher));
        server.start().expect("start");

        let mut stream = connect(&config);
        let call = AdapterCall::new(AdapterKind::Cache, "get", vec![Value::from("k1")])
            .with_request_id("req-1");
        write_call(&mut stream, &call);

        let mut reader = BufReader::new(stream.try_clone().expect("clone stream"));
        let response = read_response(&mut reader);
        assert_eq!(response.request_id(), "req-1");
        assert_eq!(response.result(), Some(&Value::from("get")));
        assert!(response.error().is_none());

        server.close().expect("close");
    }

    #[test]
    fn handler_failure_becomes_an_error_response_and_connection_survives() {
        let (_dir, config) = temp_config();
        let server = AdapterServer::new(config.clone());

        let mut dispatcher = MockDispatcher::new();
        dispatcher.expect_handle().returning(|call| {
            if call.method() == "bad" {
                Err(ErrorValue::new("Error", "boom"))
            } else {
                Ok(Value::from("fine"))
            }
        });
        server.set_call_handler(Arc::new(dispatcher));
        server.start().expect("start");

        let mut stream = connect(&config);
        let mut reader = BufReader::new(stream.try_clone().expect("clone stream"));

        write_call(
            &mut stream,
            &AdapterCall::new(AdapterKind::Llm, "bad", vec![]).with_request_id("req-bad"),
        );
        let failure = read_response(&mut reader);
        assert_eq!(failure.request_id(), "req-bad");
        let error = failure.error().expect("error payload");
        assert_eq!(error.message(), "boom");

        write_call(
            &mut stream,
            &AdapterCall::new(AdapterKind::Llm, "good", vec![]).with_request_id("req-good"),
        );
        let success = read_response(&mut reader);
        assert_eq!(success.result(), Some(&Value::from("fine")));

        server.close().expect("close");
    }

    #[test]
    fn calls_on_one_connection_complete_out_of_order() {
        let (_dir, config) = temp_config();
        let server = AdapterServer::new(config.clone());

        let mut dispatcher = MockDispatcher::new();
        dispatcher.expect_handle().returning(|call| {
            if call.method() == "slow" {
                thread::sleep(Duration::from_millis(300));
            }
            Ok(Value::from(call.method()))
        });
        server.set_call_handler(Arc::new(dispatcher));
        server.start().expect("start");

        let mut stream = connect(&config);
        let mut reader = BufReader::new(stream.try_clone().expect("clone stream"));

        write_call(
            &mut stream,
            &AdapterCall::new(AdapterKind::Storage, "slow", vec![]).with_request_id("req-slow"),
        );
        write_call(
            &mut stream,
            &AdapterCall::new(AdapterKind::Storage, "fast", vec![]).with_request_id("req-fast"),
        );

        let first = read_response(&mut reader);
        let second = read_response(&mut reader);
        assert_eq!(first.request_id(), "req-fast");
        assert_eq!(second.request_id(), "req-slow");

        server.close().expect("close");
    }

    #[test]
    fn missing_handler_drops_the_call_without_a_response() {
        let (_dir, config) = temp_config();
        let server = AdapterServer::new(config.clone());
        server.start().expect("start");

        let mut stream = connect(&config);
        write_call(
            &mut stream,
            &AdapterCall::new(AdapterKind::Cache, "get", vec![]).with_request_id("req-1"),
        );

        stream
            .set_read_timeout(Some(Duration::from_millis(200)))
            .expect("set read timeout");
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        let outcome = reader.read_line(&mut line);
        let timed_out = matches!(
            &outcome,
            Err(error) if matches!(
                error.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            )
        );
        assert!(timed_out, "expected no response, got {outcome:?} ({line:?})");

        server.close().expect("close");
    }

    #[test]
    fn close_tears_down_live_connections() {
        let (_dir, config) = temp_config();
        let server = AdapterServer::new(config.clone());
        server.start().expect("start");

        let stream = connect(&config);
        // Give the accept loop a moment to register the connection.
        thread::sleep(Duration::from_millis(100));
        server.close().expect("close");

        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        assert_eq!(
            reader.read_line(&mut line).expect("read after close"),
            0,
            "connection must be shut down by close"
        );
    }
}
