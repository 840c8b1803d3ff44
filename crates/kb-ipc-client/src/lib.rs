//! Client-side transports for the kb adapter-call protocol.
//!
//! A sandboxed child process uses a transport to invoke adapter methods that
//! run in the parent process. Two implementations of the same
//! [`AdapterTransport`] contract are provided:
//!
//! - [`SocketTransport`] dials the parent's local socket, multiplexes
//!   concurrent in-flight calls by request id, and reconnects with bounded
//!   backoff when the connection drops.
//! - [`ChannelTransport`] runs over a message channel supplied by the
//!   process owner, for children spawned as direct subprocesses rather than
//!   connecting to a shared socket.

mod channel;
mod config;
mod errors;
mod pending;
#[cfg(unix)]
mod socket;
mod transport;

pub use self::channel::ChannelTransport;
pub use self::config::{ClientConfig, DEFAULT_SOCKET_PATH};
pub use self::errors::TransportError;
#[cfg(unix)]
pub use self::socket::SocketTransport;
pub use self::transport::{AdapterTransport, ConnectionState};
