//! Client handler for the coordination socket.
//!
//! This is the rendezvous point for the end-user command line: a client
//! connects to the well-known socket, asks which acceptor serves its
//! command, and then talks to that acceptor directly. The handler also
//! answers ping/status/stop requests from the hearth CLI itself. The
//! per-command wire protocol beyond the lookup stays out of the core.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, Permissions};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::acceptor::AcceptorRegistrationMonitor;
use super::Monitor;
use crate::control::{read_message, write_message};
use crate::models::{Stage, StageTree};

/// Client request to the master.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientRequest {
    /// Check if the master is alive.
    Ping,
    /// Ask for the live stage tree.
    Status,
    /// Find the acceptor stage serving a command.
    Command { name: String },
    /// Request orderly master shutdown.
    Stop,
}

/// Master response to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientResponse {
    Pong,
    Ok,
    Status { stages: Vec<StageSummary> },
    Acceptor { stage_name: String, descriptor: String },
    Error { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSummary {
    pub name: String,
    pub process_type: String,
    pub state: String,
    pub pid: Option<i32>,
    pub dependencies: usize,
}

impl From<&Stage> for StageSummary {
    fn from(stage: &Stage) -> Self {
        Self {
            name: stage.name.clone(),
            process_type: stage.process_type.clone(),
            state: stage.state.to_string(),
            pid: stage.pid,
            dependencies: stage.loaded_dependencies.len(),
        }
    }
}

pub struct ClientHandler {
    socket_path: PathBuf,
    listener: Option<UnixListener>,
    shutdown: Arc<AtomicBool>,
}

impl ClientHandler {
    /// Bind the coordination socket.
    pub fn bind(socket_path: &Path, shutdown: Arc<AtomicBool>) -> Result<Self> {
        // Remove a stale socket, ignoring NotFound to avoid a TOCTOU race.
        if let Err(err) = fs::remove_file(socket_path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                return Err(err).context("Failed to remove stale coordination socket");
            }
        }

        let listener = UnixListener::bind(socket_path).with_context(|| {
            format!("Failed to bind coordination socket: {}", socket_path.display())
        })?;
        fs::set_permissions(socket_path, Permissions::from_mode(0o600))
            .context("Failed to set coordination socket permissions")?;
        listener
            .set_nonblocking(true)
            .context("Failed to set coordination socket non-blocking")?;

        Ok(Self {
            socket_path: socket_path.to_path_buf(),
            listener: Some(listener),
            shutdown,
        })
    }

    /// Accept and answer one client connection.
    pub fn on_datasource_event(
        &mut self,
        tree: &StageTree,
        acceptors: &AcceptorRegistrationMonitor,
    ) -> Result<()> {
        let Some(listener) = self.listener.as_ref() else {
            return Ok(());
        };
        let mut stream = match listener.accept() {
            Ok((stream, _addr)) => stream,
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
            Err(err) => {
                warn!("client accept failed: {err}");
                return Ok(());
            }
        };

        // A stalled client must not stall the reactor.
        let _ = stream.set_read_timeout(Some(Duration::from_millis(500)));
        let _ = stream.set_write_timeout(Some(Duration::from_millis(500)));

        let response = match read_message::<ClientRequest, _>(&mut stream) {
            Ok(ClientRequest::Ping) => ClientResponse::Pong,
            Ok(ClientRequest::Status) => ClientResponse::Status {
                stages: tree
                    .names()
                    .iter()
                    .filter_map(|name| tree.get(name))
                    .map(StageSummary::from)
                    .collect(),
            },
            Ok(ClientRequest::Command { name }) => {
                match acceptors.find_acceptor_for_command(&name) {
                    Some((stage_name, descriptor)) => ClientResponse::Acceptor {
                        stage_name: stage_name.to_string(),
                        descriptor: descriptor.to_string(),
                    },
                    None => ClientResponse::Error {
                        message: format!("No acceptor serves command '{name}'"),
                    },
                }
            }
            Ok(ClientRequest::Stop) => {
                debug!("client requested shutdown");
                self.shutdown.store(true, Ordering::Relaxed);
                ClientResponse::Ok
            }
            Err(err) => ClientResponse::Error {
                message: format!("{err:#}"),
            },
        };

        if let Err(err) = write_message(&mut stream, &response) {
            warn!("client response write failed: {err:#}");
        }
        Ok(())
    }

    /// Remove the coordination socket path. Part of orderly shutdown.
    pub fn remove_socket(&mut self) {
        self.listener = None;
        if let Err(err) = fs::remove_file(&self.socket_path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to remove coordination socket: {err}");
            }
        }
    }
}

impl Monitor for ClientHandler {
    fn name(&self) -> &'static str {
        "client-handler"
    }

    fn datasources(&self) -> Vec<RawFd> {
        self.listener
            .as_ref()
            .map(|l| l.as_raw_fd())
            .into_iter()
            .collect()
    }

    fn close(&mut self) {
        self.remove_socket();
    }
}

impl Drop for ClientHandler {
    fn drop(&mut self) {
        self.remove_socket();
    }
}

/// Send one request to a running master and await the response.
///
/// This is the client side used by the `hearth status` and `hearth stop`
/// commands.
pub fn send_request(socket_path: &Path, request: &ClientRequest) -> Result<ClientResponse> {
    let mut stream = UnixStream::connect(socket_path).with_context(|| {
        format!(
            "Failed to connect to master socket: {}",
            socket_path.display()
        )
    })?;
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .context("Failed to set read timeout")?;
    write_message(&mut stream, request).context("Failed to send request")?;
    read_message(&mut stream).context("Failed to read response")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{self, ControlMessage};
    use crate::plan::{Plan, PlanNode};

    fn fixture() -> (tempfile::TempDir, ClientHandler, StageTree, AcceptorRegistrationMonitor)
    {
        let dir = tempfile::TempDir::new().unwrap();
        let socket = dir.path().join(".hearth.sock");
        let handler = ClientHandler::bind(&socket, Arc::new(AtomicBool::new(false))).unwrap();

        let plan = Plan::new(PlanNode::named(
            "root",
            vec![PlanNode::acceptor("server", &["serve"])],
        ))
        .unwrap();
        let tree = StageTree::from_plan(&plan);
        let acceptors = AcceptorRegistrationMonitor::new().unwrap();
        (dir, handler, tree, acceptors)
    }

    fn roundtrip(
        handler: &mut ClientHandler,
        tree: &StageTree,
        acceptors: &AcceptorRegistrationMonitor,
        request: &ClientRequest,
    ) -> ClientResponse {
        let mut client = UnixStream::connect(
            handler.socket_path.clone(),
        )
        .unwrap();
        write_message(&mut client, request).unwrap();
        handler.on_datasource_event(tree, acceptors).unwrap();
        read_message(&mut client).unwrap()
    }

    #[test]
    fn test_ping_pong() {
        let (_dir, mut handler, tree, acceptors) = fixture();
        match roundtrip(&mut handler, &tree, &acceptors, &ClientRequest::Ping) {
            ClientResponse::Pong => {}
            other => panic!("Expected Pong, got {other:?}"),
        }
    }

    #[test]
    fn test_status_lists_all_stages() {
        let (_dir, mut handler, tree, acceptors) = fixture();
        match roundtrip(&mut handler, &tree, &acceptors, &ClientRequest::Status) {
            ClientResponse::Status { stages } => {
                let names: Vec<&str> = stages.iter().map(|s| s.name.as_str()).collect();
                assert_eq!(names, ["root", "server"]);
                assert_eq!(stages[0].state, "pending");
            }
            other => panic!("Expected Status, got {other:?}"),
        }
    }

    #[test]
    fn test_command_lookup_routes_to_registered_acceptor() {
        let (_dir, mut handler, tree, mut acceptors) = fixture();
        let mut writer = acceptors.clone_child_writer().unwrap();
        control::write_message(
            &mut writer,
            &ControlMessage::Register {
                stage_name: "server".to_string(),
                acceptor_descriptor: "serve".to_string(),
            },
        )
        .unwrap();
        acceptors.on_datasource_event().unwrap();

        match roundtrip(
            &mut handler,
            &tree,
            &acceptors,
            &ClientRequest::Command {
                name: "serve".to_string(),
            },
        ) {
            ClientResponse::Acceptor { stage_name, .. } => assert_eq!(stage_name, "server"),
            other => panic!("Expected Acceptor, got {other:?}"),
        }

        match roundtrip(
            &mut handler,
            &tree,
            &acceptors,
            &ClientRequest::Command {
                name: "deploy".to_string(),
            },
        ) {
            ClientResponse::Error { message } => assert!(message.contains("deploy")),
            other => panic!("Expected Error, got {other:?}"),
        }
    }

    #[test]
    fn test_stop_sets_shutdown_flag() {
        let (_dir, mut handler, tree, acceptors) = fixture();
        let flag = handler.shutdown.clone();
        match roundtrip(&mut handler, &tree, &acceptors, &ClientRequest::Stop) {
            ClientResponse::Ok => {}
            other => panic!("Expected Ok, got {other:?}"),
        }
        assert!(flag.load(Ordering::Relaxed));
    }

    #[test]
    fn test_remove_socket_releases_path() {
        let (dir, mut handler, _tree, _acceptors) = fixture();
        let socket = dir.path().join(".hearth.sock");
        assert!(socket.exists());
        handler.remove_socket();
        assert!(!socket.exists());
    }
}
