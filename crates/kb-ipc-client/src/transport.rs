//! The transport contract shared by all client implementations.

use std::fmt;

use kb_ipc_types::{AdapterCall, Value};

use crate::errors::TransportError;

/// Connection lifecycle of a client transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection and no attempt in flight.
    Disconnected,
    /// A connection attempt is in flight.
    Connecting,
    /// Calls can be sent.
    Connected,
    /// The connection was lost and a background retry sequence is running.
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        };
        formatter.write_str(name)
    }
}

/// Uniform capability for invoking parent-process adapters.
///
/// Implementations are interchangeable: the socket transport for children
/// attached to the shared platform socket, the channel transport for direct
/// subprocesses. All operations block the calling thread rather than an
/// event loop; callers issue concurrent calls from separate threads and the
/// transport correlates responses by request id.
///
/// # Example
///
/// ```
/// use kb_ipc_client::{AdapterTransport, ConnectionState, TransportError};
/// use kb_ipc_types::{AdapterCall, Value};
///
/// struct NullTransport;
///
/// impl AdapterTransport for NullTransport {
///     fn connect(&self) -> Result<(), TransportError> {
///         Ok(())
///     }
///
///     fn send(&self, _call: AdapterCall) -> Result<Value, TransportError> {
///         Ok(Value::Null)
///     }
///
///     fn disconnect(&self) -> Result<(), TransportError> {
///         Ok(())
///     }
///
///     fn state(&self) -> ConnectionState {
///         ConnectionState::Connected
///     }
/// }
/// ```
pub trait AdapterTransport: Send + Sync {
    /// Establishes the connection. Calling while already connected is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if the connection cannot be established.
    fn connect(&self) -> Result<(), TransportError>;

    /// Sends a call and blocks until its response, timeout, or connection
    /// failure.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Remote`] when the adapter reported a
    /// failure, [`TransportError::Timeout`] when the deadline elapsed, and a
    /// connection-level error when the conduit failed.
    fn send(&self, call: AdapterCall) -> Result<Value, TransportError>;

    /// Releases the connection and fails every pending call.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if resources cannot be released cleanly.
    fn disconnect(&self) -> Result<(), TransportError>;

    /// Reports the current connection state.
    fn state(&self) -> ConnectionState;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_render_lowercase() {
        assert_eq!(ConnectionState::Disconnected.to_string(), "disconnected");
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
    }
}
