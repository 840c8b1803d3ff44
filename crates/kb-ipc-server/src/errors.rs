//! Error types for the adapter-call server.

use std::io;

use camino::Utf8PathBuf;
use thiserror::Error;

/// Errors surfaced while starting or stopping the server.
///
/// `start()` failures are fatal and leave no partial state behind: a socket
/// artifact created during a failed start is removed before the error is
/// returned.
#[derive(Debug, Error)]
pub enum ServerError {
    /// `start()` was called while the server is already running.
    #[error("server is already running")]
    AlreadyRunning,

    /// `close()` was called while the server is not running.
    #[error("server is not running")]
    NotRunning,

    /// Reading metadata for an existing artifact at the socket path failed.
    #[error("failed to read metadata for socket path {path}: {source}")]
    Metadata {
        /// The configured socket path.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The socket path is occupied by something that is not a socket.
    #[error("socket path {path} exists and is not a socket")]
    NotSocket {
        /// The configured socket path.
        path: Utf8PathBuf,
    },

    /// Another process is already listening at the socket path.
    #[error("socket {path} is already in use")]
    InUse {
        /// The configured socket path.
        path: Utf8PathBuf,
    },

    /// Probing an existing socket artifact for liveness failed.
    #[error("failed to probe existing socket {path}: {source}")]
    Probe {
        /// The configured socket path.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// Removing a stale socket artifact failed.
    #[error("failed to remove stale socket {path}: {source}")]
    StaleCleanup {
        /// The configured socket path.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// Binding the listener failed.
    #[error("failed to bind socket listener at {path}: {source}")]
    Bind {
        /// The configured socket path.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// Making the bound socket accessible to other same-host processes
    /// failed.
    #[error("failed to set permissions on socket {path}: {source}")]
    Permissions {
        /// The configured socket path.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// Enabling non-blocking accepts on the listener failed.
    #[error("failed to enable non-blocking listener: {source}")]
    NonBlocking {
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The accept-loop thread panicked.
    #[error("listener thread panicked")]
    ThreadPanic,
}
