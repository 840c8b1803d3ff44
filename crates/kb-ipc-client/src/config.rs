//! Client transport configuration.

use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

/// Well-known address of the parent-process adapter socket.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/kb-ipc.sock";

const DEFAULT_CALL_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Configuration for the socket transport.
///
/// Plain data; loading it from files or the environment is the hosting
/// process's concern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Filesystem path of the parent-process socket.
    pub socket_path: Utf8PathBuf,
    /// Fallback deadline for calls that carry no timeout of their own.
    pub call_timeout_ms: u64,
    /// Deadline for a single dial attempt.
    pub connect_timeout_ms: u64,
    /// Whether a lost connection schedules background reconnect attempts.
    pub auto_reconnect: bool,
    /// Reconnect attempts before the transport gives up and lands in the
    /// disconnected state.
    pub max_reconnect_attempts: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket_path: Utf8PathBuf::from(DEFAULT_SOCKET_PATH),
            call_timeout_ms: DEFAULT_CALL_TIMEOUT_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            auto_reconnect: true,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
        }
    }
}

impl ClientConfig {
    /// Returns the per-call fallback timeout.
    #[must_use]
    pub const fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Returns the dial timeout.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_point_at_the_well_known_socket() {
        let config = ClientConfig::default();
        assert_eq!(config.socket_path, DEFAULT_SOCKET_PATH);
        assert!(config.auto_reconnect);
        assert_eq!(config.call_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn partial_config_deserializes_over_defaults() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"socket_path":"/run/kb/ipc.sock","auto_reconnect":false}"#)
                .expect("deserialize config");
        assert_eq!(config.socket_path, "/run/kb/ipc.sock");
        assert!(!config.auto_reconnect);
        assert_eq!(config.call_timeout_ms, 30_000);
    }
}
