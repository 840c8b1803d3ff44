//! Parent-process listener for the kb adapter-call protocol.
//!
//! The server binds the platform's local socket, accepts connections from
//! sandboxed child processes, decodes their newline-framed call envelopes,
//! and turns each one into exactly one response written back on the same
//! connection. Adapter execution itself is injected through the
//! [`CallHandler`] seam; the server treats it purely as a function from call
//! to result-or-error.

#[cfg(unix)]
mod connection;
mod config;
mod errors;
mod handler;
#[cfg(unix)]
mod listener;

pub use self::config::{DEFAULT_SOCKET_PATH, ServerConfig};
pub use self::errors::ServerError;
pub use self::handler::CallHandler;
#[cfg(unix)]
pub use self::listener::AdapterServer;
