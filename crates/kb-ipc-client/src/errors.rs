//! Error types for client transports.
//!
//! All errors use `thiserror`-derived enums with structured context. I/O
//! errors are wrapped in `Arc` to keep the enum cheap to move.

use std::io;
use std::sync::Arc;

use camino::Utf8PathBuf;
use thiserror::Error;

use kb_ipc_types::{CodecError, EnvelopeError, ErrorValue};

/// Errors surfaced by client transports.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Dialling the adapter socket failed.
    #[error("failed to connect to adapter socket {path}: {source}")]
    Connect {
        /// Socket path that was dialled.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },

    /// The transport is not connected and no connection attempt is pending.
    #[error("transport is not connected")]
    NotConnected,

    /// A call reused the request id of a call still in flight.
    #[error("request id '{request_id}' is already in flight")]
    DuplicateRequestId {
        /// The offending request id.
        request_id: String,
    },

    /// No response arrived within the call deadline. The connection stays
    /// open; only this call is affected.
    #[error("call '{request_id}' timed out after {timeout_ms}ms")]
    Timeout {
        /// Request id of the expired call.
        request_id: String,
        /// Deadline that elapsed, in milliseconds.
        timeout_ms: u64,
    },

    /// The connection dropped before a response arrived. Every call pending
    /// on the connection fails with this error.
    #[error("connection lost before a response arrived")]
    ConnectionLost,

    /// The transport was disconnected locally while the call was pending.
    #[error("transport was disconnected while the call was pending")]
    Closed,

    /// The call envelope failed validation before transmission.
    #[error("invalid call envelope: {0}")]
    InvalidEnvelope(#[from] EnvelopeError),

    /// The call envelope could not be encoded.
    #[error("failed to encode call envelope: {0}")]
    Encode(#[from] CodecError),

    /// Writing the encoded call to the conduit failed.
    #[error("failed to write to adapter conduit: {source}")]
    Write {
        /// Underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },

    /// The adapter executed the call and reported a failure. Carries the
    /// original error's name, message, and, when available, stack and code.
    #[error("adapter call failed: {0}")]
    Remote(#[source] ErrorValue),
}

impl TransportError {
    /// Returns `true` when the error is a per-call timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns the remote adapter error, when that is what failed the call.
    #[must_use]
    pub const fn as_remote(&self) -> Option<&ErrorValue> {
        match self {
            Self::Remote(error) => Some(error),
            _ => None,
        }
    }
}
