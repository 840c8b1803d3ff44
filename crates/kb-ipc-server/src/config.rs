//! Server configuration.

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

/// Well-known address the platform socket is bound at.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/kb-ipc.sock";

/// Configuration for the adapter-call server.
///
/// Plain data; loading it from files or the environment is the hosting
/// process's concern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Filesystem path to bind the listening socket at. The running server
    /// owns this path exclusively: stale artifacts are removed before
    /// binding and the path is removed again on shutdown.
    pub socket_path: Utf8PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: Utf8PathBuf::from(DEFAULT_SOCKET_PATH),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_points_at_the_well_known_socket() {
        assert_eq!(ServerConfig::default().socket_path, DEFAULT_SOCKET_PATH);
    }

    #[test]
    fn empty_config_deserializes_to_defaults() {
        let config: ServerConfig = serde_json::from_str("{}").expect("deserialize config");
        assert_eq!(config, ServerConfig::default());
    }
}
