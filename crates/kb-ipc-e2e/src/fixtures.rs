//! Shared fixtures: a scripted dispatcher and a platform harness binding a
//! throwaway socket.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::TempDir;

use kb_ipc_client::{AdapterTransport, ClientConfig, SocketTransport};
use kb_ipc_server::{AdapterServer, CallHandler, ServerConfig};
use kb_ipc_types::{AdapterCall, ErrorValue, Value};

/// Dispatcher whose behaviour is scripted by the method name of each call.
///
/// - `get` answers `{"value": "v1"}`.
/// - `echo` answers the first argument (or null).
/// - `delay` sleeps for the number of milliseconds in the first argument,
///   then answers the second argument (or null).
/// - `never` blocks far beyond any test deadline before answering.
/// - `fail` fails with an `Error` named fault whose message is `boom`.
/// - anything else fails with a `TypeError` named fault.
#[derive(Debug, Default)]
pub struct ScriptedDispatcher;

impl CallHandler for ScriptedDispatcher {
    fn handle(&self, call: AdapterCall) -> Result<Value, ErrorValue> {
        match call.method() {
            "get" => {
                let mut entries = BTreeMap::new();
                entries.insert("value".to_owned(), Value::from("v1"));
                Ok(Value::Object(entries))
            }
            "echo" => Ok(call.args().first().cloned().unwrap_or(Value::Null)),
            "delay" => {
                let millis = call
                    .args()
                    .first()
                    .and_then(Value::as_i64)
                    .and_then(|value| u64::try_from(value).ok())
                    .unwrap_or(0);
                thread::sleep(Duration::from_millis(millis));
                Ok(call.args().get(1).cloned().unwrap_or(Value::Null))
            }
            "never" => {
                thread::sleep(Duration::from_secs(30));
                Ok(Value::Null)
            }
            "fail" => Err(ErrorValue::new("Error", "boom")),
            other => Err(ErrorValue::new(
                "TypeError",
                format!("unknown method '{other}'"),
            )),
        }
    }
}

/// A running server on a throwaway socket plus client wiring for it.
///
/// The server is closed when the platform is dropped.
#[derive(Debug)]
pub struct TestPlatform {
    server: AdapterServer,
    socket_path: Utf8PathBuf,
    _dir: TempDir,
}

impl TestPlatform {
    /// Binds a fresh socket in a temporary directory and starts the server
    /// with a [`ScriptedDispatcher`] registered.
    ///
    /// # Panics
    ///
    /// Panics when the temporary directory or the server cannot be set up;
    /// these are test-harness failures, not behaviours under test.
    #[must_use]
    pub fn start() -> Self {
        let dir = TempDir::new().expect("create temp dir");
        let socket_path =
            Utf8PathBuf::from_path_buf(dir.path().join("kb-ipc.sock")).expect("utf8 path");
        let server = AdapterServer::new(ServerConfig {
            socket_path: socket_path.clone(),
        });
        server.set_call_handler(Arc::new(ScriptedDispatcher));
        server.start().expect("start server");
        Self {
            server,
            socket_path,
            _dir: dir,
        }
    }

    /// Returns the socket path the platform is serving on.
    #[must_use]
    pub fn socket_path(&self) -> &Utf8Path {
        self.socket_path.as_path()
    }

    /// Returns a client configuration pointed at the platform socket.
    #[must_use]
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            socket_path: self.socket_path.clone(),
            call_timeout_ms: 2_000,
            connect_timeout_ms: 1_000,
            auto_reconnect: true,
            max_reconnect_attempts: 10,
        }
    }

    /// Builds and connects a socket transport to the platform.
    ///
    /// # Panics
    ///
    /// Panics when the connection cannot be established.
    #[must_use]
    pub fn connect_client(&self) -> SocketTransport {
        let transport = SocketTransport::new(self.client_config());
        transport.connect().expect("connect client");
        transport
    }

    /// Stops the server, leaving the socket path free.
    ///
    /// # Panics
    ///
    /// Panics when the server was not running.
    pub fn stop(&self) {
        self.server.close().expect("close server");
    }

    /// Starts the server again after [`TestPlatform::stop`].
    ///
    /// # Panics
    ///
    /// Panics when the server is already running or binding fails.
    pub fn restart(&self) {
        self.server.start().expect("restart server");
    }
}

impl Drop for TestPlatform {
    fn drop(&mut self) {
        drop(self.server.close());
    }
}
