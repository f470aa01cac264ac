//! Master configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::sys::signal::Signal;

/// Default coordination socket path, relative to the working directory.
pub const DEFAULT_SOCKET_PATH: &str = ".hearth.sock";

/// Configuration for the master process.
///
/// These parameters control the reactor heartbeat, the coordination socket
/// used by clients to rendezvous with acceptor stages, and the signal used
/// for cascade kills.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// Well-known coordination socket path.
    pub socket_path: PathBuf,
    /// Reactor poll timeout. Doubles as the liveness heartbeat.
    pub heartbeat: Duration,
    /// Signal sent to a stage when its subtree is torn down.
    pub kill_signal: Signal,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            heartbeat: Duration::from_secs(1),
            kill_signal: Signal::SIGTERM,
        }
    }
}

impl MasterConfig {
    /// Socket path an acceptor stage binds for its own clients.
    ///
    /// Derived from the coordination socket path so all hearth sockets live
    /// side by side: `.hearth.sock` -> `.hearth.<stage>.sock`.
    pub fn acceptor_socket_path(&self, stage_name: &str) -> PathBuf {
        let dir = self.socket_path.parent().unwrap_or(Path::new("."));
        dir.join(format!(".hearth.{stage_name}.sock"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MasterConfig::default();
        assert_eq!(config.socket_path, PathBuf::from(".hearth.sock"));
        assert_eq!(config.heartbeat, Duration::from_secs(1));
        assert_eq!(config.kill_signal, Signal::SIGTERM);
    }

    #[test]
    fn test_acceptor_socket_path_is_sibling_of_coordination_socket() {
        let mut config = MasterConfig::default();
        config.socket_path = PathBuf::from("/tmp/run/.hearth.sock");
        assert_eq!(
            config.acceptor_socket_path("server"),
            PathBuf::from("/tmp/run/.hearth.server.sock")
        );
    }
}
