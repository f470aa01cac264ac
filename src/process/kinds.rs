//! Concrete stage kinds.

use anyhow::{Context, Result};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use tracing::{debug, info};

use super::forked::{StageContext, StageKind, WakeEvent};

/// A stage that holds warm application state and waits to be killed.
pub struct PreloadStage;

impl StageKind for PreloadStage {
    fn process_type(&self) -> &'static str {
        "preload"
    }

    fn run_loop(&mut self, ctx: &mut StageContext) -> Result<()> {
        loop {
            match ctx.wait_event(None)? {
                WakeEvent::Kill => {
                    debug!(stage = %ctx.name(), "kill order received");
                    return Ok(());
                }
                WakeEvent::Interrupted => {
                    ctx.acknowledge_interrupt();
                    return Ok(());
                }
                WakeEvent::Extra | WakeEvent::Tick => continue,
            }
        }
    }
}

/// A stage that keeps a listening socket open and accepts client
/// connections for the commands it serves.
///
/// What happens on an accepted connection belongs to the embedding
/// application; this stage owns the socket lifecycle and the registration
/// handshake.
pub struct AcceptorStage {
    name: String,
    commands: Vec<String>,
    socket_path: PathBuf,
    listener: Option<UnixListener>,
}

impl AcceptorStage {
    pub fn new(name: &str, commands: Vec<String>, socket_path: PathBuf) -> Self {
        Self {
            name: name.to_string(),
            commands,
            socket_path,
            listener: None,
        }
    }

    fn descriptor(&self) -> String {
        self.commands.join(" ")
    }
}

impl StageKind for AcceptorStage {
    fn process_type(&self) -> &'static str {
        "acceptor"
    }

    fn after_setup(&mut self, ctx: &mut StageContext) -> Result<()> {
        // Remove a stale socket from a previous incarnation, ignoring
        // NotFound to avoid a TOCTOU race.
        if let Err(err) = std::fs::remove_file(&self.socket_path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                return Err(err).context("Failed to remove stale acceptor socket");
            }
        }
        let listener = UnixListener::bind(&self.socket_path).with_context(|| {
            format!(
                "Failed to bind acceptor socket: {}",
                self.socket_path.display()
            )
        })?;
        listener
            .set_nonblocking(true)
            .context("Failed to set acceptor socket non-blocking")?;
        self.listener = Some(listener);

        ctx.register_acceptor(&self.descriptor())
    }

    fn run_loop(&mut self, ctx: &mut StageContext) -> Result<()> {
        let listener = self
            .listener
            .take()
            .context("Acceptor run loop started without a socket")?;

        let result = loop {
            match ctx.wait_event(Some(listener.as_raw_fd()))? {
                WakeEvent::Extra => match listener.accept() {
                    Ok((stream, _addr)) => {
                        info!(stage = %ctx.name(), "accepted client connection");
                        // Connection handling is the application's job.
                        drop(stream);
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => continue,
                    Err(err) => break Err(err).context("Acceptor accept failed"),
                },
                WakeEvent::Kill => {
                    debug!(stage = %ctx.name(), "kill order received");
                    break Ok(());
                }
                WakeEvent::Interrupted => {
                    ctx.acknowledge_interrupt();
                    break Ok(());
                }
                WakeEvent::Tick => continue,
            }
        };

        let _ = std::fs::remove_file(&self.socket_path);
        result
    }

    fn descendant_acceptors(&self) -> Vec<String> {
        vec![self.name.clone()]
    }
}
