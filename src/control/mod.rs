//! Control channel between the master and its forked stages.
//!
//! Every message crosses a `UnixStream` pair created before the fork and
//! inherited by the child. Stages share one upstream pair per monitor for
//! `Status` / `FeatureLoaded` / `Register` reports; each stage additionally
//! gets a dedicated downstream pair the master uses to push `Kill`.
//!
//! The wire format is a 4-byte big-endian length prefix followed by a JSON
//! body. It is the only wire contract of the core and must stay stable
//! across master/child versions that briefly coexist during a respawn.

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Upper bound on a single framed message (control messages are tiny).
const MAX_MESSAGE_BYTES: usize = 1024 * 1024;

/// Lifecycle phase a stage reports about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Starting,
    Ready,
    Killing,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Starting => write!(f, "starting"),
            Phase::Ready => write!(f, "ready"),
            Phase::Killing => write!(f, "killing"),
        }
    }
}

/// A message on the control channel.
///
/// Produced by a child stage or the master, consumed exactly once by the
/// other side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlMessage {
    /// An acceptor stage announces itself and the commands it serves.
    Register {
        stage_name: String,
        acceptor_descriptor: String,
    },
    /// A stage reports a lifecycle phase change.
    Status {
        pid: i32,
        phase: Phase,
        stage_name: String,
    },
    /// A stage reports a file its warm state now depends on.
    FeatureLoaded { stage_name: String, path: PathBuf },
    /// The master orders a stage to exit.
    Kill { stage_name: String },
    /// A stage acknowledges a `Kill` before exiting.
    Ack,
}

/// Write a length-prefixed JSON message to a stream.
///
/// Format: 4-byte big-endian length prefix + JSON data.
pub fn write_message<T: Serialize, W: Write>(stream: &mut W, message: &T) -> Result<()> {
    let json = serde_json::to_vec(message).context("Failed to serialize message")?;
    let len = json.len() as u32;

    stream
        .write_all(&len.to_be_bytes())
        .context("Failed to write message length")?;
    stream
        .write_all(&json)
        .context("Failed to write message body")?;
    stream.flush().context("Failed to flush stream")?;

    Ok(())
}

/// Read a length-prefixed JSON message from a stream.
pub fn read_message<T: DeserializeOwned, R: Read>(stream: &mut R) -> Result<T> {
    let mut len_bytes = [0u8; 4];
    stream
        .read_exact(&mut len_bytes)
        .context("Failed to read message length")?;
    let len = u32::from_be_bytes(len_bytes) as usize;

    if len > MAX_MESSAGE_BYTES {
        anyhow::bail!("Message too large: {len} bytes");
    }

    let mut json_bytes = vec![0u8; len];
    stream
        .read_exact(&mut json_bytes)
        .context("Failed to read message body")?;

    serde_json::from_slice(&json_bytes).context("Failed to deserialize message")
}

/// A socket pair whose ends straddle the fork boundary.
///
/// The parent end stays with the master and is polled by the reactor; the
/// child end is inherited by every forked stage. Either end can be closed
/// independently once it is no longer needed on that side.
#[derive(Debug)]
pub struct ChannelPair {
    parent: Option<UnixStream>,
    child: Option<UnixStream>,
}

impl ChannelPair {
    pub fn new() -> Result<Self> {
        let (parent, child) =
            UnixStream::pair().context("Failed to create control socket pair")?;
        Ok(Self {
            parent: Some(parent),
            child: Some(child),
        })
    }

    pub fn parent_mut(&mut self) -> Option<&mut UnixStream> {
        self.parent.as_mut()
    }

    pub fn parent_fd(&self) -> Option<RawFd> {
        self.parent.as_ref().map(|s| s.as_raw_fd())
    }

    /// Duplicate the child end for handing to a forked stage.
    pub fn clone_child(&self) -> Result<UnixStream> {
        self.child
            .as_ref()
            .context("Child end of control channel already closed")?
            .try_clone()
            .context("Failed to clone child end of control channel")
    }

    pub fn close_parent(&mut self) {
        self.parent = None;
    }

    pub fn close_child(&mut self) {
        self.child = None;
    }
}

/// Master-side endpoint of one stage's dedicated downstream channel.
///
/// The endpoint is closed when the stage goes dead; sending on a closed or
/// broken endpoint drops the message with a logged warning rather than
/// failing the reactor.
#[derive(Debug)]
pub struct StageEndpoint {
    stage_name: String,
    stream: Option<UnixStream>,
}

impl StageEndpoint {
    /// Create the pair for one stage: (master endpoint, child-side stream).
    pub fn pair(stage_name: &str) -> Result<(Self, UnixStream)> {
        let (master, child) = UnixStream::pair()
            .with_context(|| format!("Failed to create endpoint pair for stage '{stage_name}'"))?;
        Ok((
            Self {
                stage_name: stage_name.to_string(),
                stream: Some(master),
            },
            child,
        ))
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.stream.as_ref().map(|s| s.as_raw_fd())
    }

    /// Send a message downstream, dropping it if the endpoint is gone.
    pub fn send(&mut self, message: &ControlMessage) {
        let Some(stream) = self.stream.as_mut() else {
            warn!(
                stage = %self.stage_name,
                "dropping control message for closed endpoint"
            );
            return;
        };
        if let Err(err) = write_message(stream, message) {
            warn!(
                stage = %self.stage_name,
                "dropping control message, endpoint broken: {err:#}"
            );
            self.stream = None;
        }
    }

    /// Consume any final `Ack` the stage sent before exiting, then close.
    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            if stream.set_nonblocking(true).is_ok() {
                let mut stream = stream;
                if let Ok(ControlMessage::Ack) = read_message(&mut stream) {
                    debug!(stage = %self.stage_name, "stage acknowledged kill");
                }
            }
        }
    }
}
