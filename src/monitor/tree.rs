//! Process tree monitor: owns the live stage tree, applies cascade kills,
//! respawns torn-down subtrees per the static plan, and reaps exited
//! stage processes.

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::signal::{kill, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};
use tracing::{debug, info, warn};

use super::Monitor;
use crate::config::MasterConfig;
use crate::control::{self, ChannelPair, ControlMessage, Phase, StageEndpoint};
use crate::models::{CascadeOutcome, StageTree};
use crate::plan::{Plan, StageKindSpec};
use crate::process::forked::{ChildChannels, ForkedProcess, StageKind};
use crate::process::kinds::{AcceptorStage, PreloadStage};
use crate::process::{self, LoadLedger};

/// Side effects a tree event produces for sibling monitors. The reactor
/// routes them so all cross-monitor calls stay on its thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeEffect {
    /// A stage reported a new dependency; arm the file watcher.
    WatchPath(PathBuf),
    /// A stage incarnation is gone; collaborators drop its state.
    StageGone(String),
}

// SIGCHLD self-pipe. The handler only writes one byte; the reactor sees
// the pipe become readable and reaps from its own thread.
static REAP_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn sigchld_handler(_signal: libc::c_int) {
    let fd = REAP_WRITE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        unsafe {
            libc::write(fd, b"c".as_ptr() as *const libc::c_void, 1);
        }
    }
}

struct ReapPipe {
    read: OwnedFd,
    write: OwnedFd,
}

impl ReapPipe {
    fn install() -> Result<Self> {
        let (read, write) = nix::unistd::pipe().context("Failed to create reap pipe")?;
        for fd in [&read, &write] {
            nix::fcntl::fcntl(fd, nix::fcntl::FcntlArg::F_SETFL(nix::fcntl::OFlag::O_NONBLOCK))
                .context("Failed to set reap pipe non-blocking")?;
        }
        REAP_WRITE_FD.store(write.as_raw_fd(), Ordering::Relaxed);

        let action = SigAction::new(
            SigHandler::Handler(sigchld_handler),
            SaFlags::SA_RESTART | SaFlags::SA_NOCLDSTOP,
            SigSet::empty(),
        );
        unsafe {
            sigaction(Signal::SIGCHLD, &action).context("Failed to install SIGCHLD handler")?;
        }
        Ok(Self { read, write })
    }

    fn fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }

    fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(
                    self.read.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }
}

/// What a fork needs from the master side: the inherited upstream channel
/// ends, the load ledger, and the master-side fds children must close.
struct Spawner {
    tree_writer: UnixStream,
    register_writer: UnixStream,
    ledger: LoadLedger,
    close_fds: Vec<RawFd>,
}

pub struct ProcessTreeMonitor {
    tree: StageTree,
    plan: Plan,
    config: MasterConfig,
    /// Shared upstream channel for `Status` / `FeatureLoaded`.
    channel: ChannelPair,
    /// Per-stage downstream endpoints for `Kill`.
    endpoints: HashMap<String, StageEndpoint>,
    /// Live pid -> stage name, the authority on which incarnation a reap
    /// belongs to.
    pids: HashMap<i32, String>,
    spawner: Spawner,
    reap: ReapPipe,
    root_dead: bool,
}

impl ProcessTreeMonitor {
    /// Build the monitor from the static plan.
    ///
    /// `register_writer` is the child end of the acceptor registration
    /// channel; every forked stage inherits a clone of it.
    pub fn new(plan: Plan, config: MasterConfig, register_writer: UnixStream) -> Result<Self> {
        let channel = ChannelPair::new()?;
        let tree_writer = channel.clone_child()?;
        Ok(Self {
            tree: StageTree::from_plan(&plan),
            plan,
            config,
            channel,
            endpoints: HashMap::new(),
            pids: HashMap::new(),
            spawner: Spawner {
                tree_writer,
                register_writer,
                ledger: LoadLedger::default(),
                close_fds: Vec::new(),
            },
            reap: ReapPipe::install()?,
            root_dead: false,
        })
    }

    pub fn tree(&self) -> &StageTree {
        &self.tree
    }

    /// A dead root means the master has nothing left to keep warm.
    pub fn root_dead(&self) -> bool {
        self.root_dead
    }

    pub fn control_fd(&self) -> Option<RawFd> {
        self.channel.parent_fd()
    }

    pub fn reap_fd(&self) -> RawFd {
        self.reap.fd()
    }

    /// Master-side fds (beyond the dynamic per-stage endpoints) that a
    /// forked child inherits and must close. Set once before boot.
    pub fn set_child_close_fds(&mut self, mut fds: Vec<RawFd>) {
        if let Some(fd) = self.channel.parent_fd() {
            fds.push(fd);
        }
        fds.push(self.reap.read.as_raw_fd());
        fds.push(self.reap.write.as_raw_fd());
        self.spawner.close_fds = fds;
    }

    /// Record a file loaded by the embedding application in the master,
    /// so the next forked stage reports it as its own dependency.
    pub fn add_extra_feature(&mut self, path: impl Into<PathBuf>) {
        self.spawner.ledger.record(path);
    }

    /// Fork every stage of the plan, parents before children.
    pub fn boot(&mut self) -> Result<()> {
        let order: Vec<String> = self.tree.names().to_vec();
        info!(stages = order.len(), "booting plan");
        for name in order {
            self.spawn_stage(&name)?;
        }
        Ok(())
    }

    /// Map a changed file to the minimal set of stages to terminate, kill
    /// those subtrees, and respawn them per the plan.
    pub fn kill_nodes_with_feature(&mut self, path: &Path) -> Result<Vec<TreeEffect>> {
        let outcome = self.tree.cascade_kill(path);
        if outcome.is_noop() {
            debug!(path = %path.display(), "change maps to no live stage");
            return Ok(Vec::new());
        }
        info!(
            path = %path.display(),
            killed = outcome.killed.len(),
            "dependency changed, cascading kill"
        );
        self.execute(outcome)
    }

    /// Signal the kill targets, retire their endpoints, and fork the
    /// replacement subtree.
    fn execute(&mut self, outcome: CascadeOutcome) -> Result<Vec<TreeEffect>> {
        let mut effects = Vec::new();
        for target in &outcome.killed {
            if let Some(endpoint) = self.endpoints.get_mut(&target.name) {
                endpoint.send(&ControlMessage::Kill {
                    stage_name: target.name.clone(),
                });
            }
            if let Some(pid) = target.pid {
                match kill(Pid::from_raw(pid), self.config.kill_signal) {
                    Ok(()) => debug!(stage = %target.name, pid, "kill signal sent"),
                    Err(Errno::ESRCH) => debug!(stage = %target.name, pid, "already gone"),
                    Err(err) => warn!(stage = %target.name, pid, "kill failed: {err}"),
                }
            }
            effects.push(TreeEffect::StageGone(target.name.clone()));
        }
        for name in &outcome.respawn {
            if let Some(mut endpoint) = self.endpoints.remove(name) {
                endpoint.close();
            }
        }
        for name in &outcome.respawn {
            self.spawn_stage(name)?;
        }
        Ok(effects)
    }

    /// Consume one message from the shared upstream channel.
    pub fn on_control_event(&mut self) -> Result<Vec<TreeEffect>> {
        let Some(stream) = self.channel.parent_mut() else {
            return Ok(Vec::new());
        };
        let message: ControlMessage = match control::read_message(stream) {
            Ok(message) => message,
            Err(err) => {
                warn!("control channel read failed: {err:#}");
                return Ok(Vec::new());
            }
        };

        match message {
            ControlMessage::Status {
                pid,
                phase: Phase::Starting,
                stage_name,
            } => {
                if let Err(err) = self.tree.record_starting(&stage_name, pid) {
                    debug!(stage = %stage_name, "dropping status report: {err:#}");
                }
            }
            ControlMessage::Status {
                pid,
                phase: Phase::Ready,
                stage_name,
            } => match self.tree.record_ready(&stage_name, pid) {
                Ok(()) => info!(stage = %stage_name, pid, "stage ready"),
                Err(err) => debug!(stage = %stage_name, "dropping ready report: {err:#}"),
            },
            ControlMessage::Status {
                phase: Phase::Killing,
                stage_name,
                ..
            } => debug!(stage = %stage_name, "stage reported killing"),
            ControlMessage::FeatureLoaded { stage_name, path } => {
                match self.tree.record_feature(&stage_name, &path) {
                    Ok(true) => return Ok(vec![TreeEffect::WatchPath(path)]),
                    Ok(false) => {}
                    Err(err) => debug!(stage = %stage_name, "dropping feature report: {err:#}"),
                }
            }
            other => warn!("unexpected message on tree channel: {other:?}"),
        }
        Ok(Vec::new())
    }

    /// SIGCHLD arrived: drain the self-pipe and reap everything pending.
    pub fn on_reap_event(&mut self) -> Result<Vec<TreeEffect>> {
        self.reap.drain();
        self.reap_outstanding()
    }

    /// Heartbeat: opportunistically reap in case a SIGCHLD was missed.
    pub fn on_tick(&mut self) -> Result<Vec<TreeEffect>> {
        self.reap_outstanding()
    }

    fn reap_outstanding(&mut self) -> Result<Vec<TreeEffect>> {
        let mut effects = Vec::new();
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(WaitStatus::Exited(pid, code)) => {
                    effects.extend(self.handle_exit(pid.as_raw(), format!("exit code {code}"))?);
                }
                Ok(WaitStatus::Signaled(pid, signal, _)) => {
                    effects.extend(self.handle_exit(pid.as_raw(), format!("signal {signal}"))?);
                }
                Ok(_) => continue,
                Err(Errno::ECHILD) => break,
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(err).context("waitpid failed"),
            }
        }
        Ok(effects)
    }

    fn handle_exit(&mut self, pid: i32, status: String) -> Result<Vec<TreeEffect>> {
        process::unguard_child(Pid::from_raw(pid));
        let Some(name) = self.pids.remove(&pid) else {
            debug!(pid, "reaped unknown process");
            return Ok(Vec::new());
        };
        if !self.tree.owns_pid(&name, pid) {
            // A cascade already replaced this incarnation; the reap is
            // pure bookkeeping.
            debug!(stage = %name, pid, "previous incarnation reaped");
            return Ok(Vec::new());
        }

        if name == self.tree.root_name() {
            info!(stage = %name, pid, %status, "root stage exited");
            if let Some(mut endpoint) = self.endpoints.remove(&name) {
                endpoint.close();
            }
            if let Err(err) = self.tree.record_dead(&name) {
                warn!(stage = %name, "failed to mark root dead: {err:#}");
            }
            self.root_dead = true;
            return Ok(vec![TreeEffect::StageGone(name)]);
        }

        info!(stage = %name, pid, %status, "stage exited, respawning subtree");
        let outcome = self.tree.collapse_subtree(&name);
        self.execute(outcome)
    }

    fn spawn_stage(&mut self, name: &str) -> Result<()> {
        let node = self
            .plan
            .find(name)
            .with_context(|| format!("Stage '{name}' is not in the plan"))?
            .clone();

        let (endpoint, child_endpoint) = StageEndpoint::pair(name)?;

        let mut close_fds = self.spawner.close_fds.clone();
        close_fds.extend(self.endpoints.values().filter_map(StageEndpoint::raw_fd));
        close_fds.extend(endpoint.raw_fd());

        let kind: Box<dyn StageKind> = match node.kind {
            StageKindSpec::Preload => Box::new(PreloadStage),
            StageKindSpec::Acceptor => Box::new(AcceptorStage::new(
                name,
                node.commands.clone(),
                self.config.acceptor_socket_path(name),
            )),
        };
        debug!(
            stage = name,
            acceptors = ?kind.descendant_acceptors(),
            "forking stage"
        );

        let (previously_loaded, loaded) = self.spawner.ledger.snapshot();
        let channels = ChildChannels {
            tree_writer: self
                .spawner
                .tree_writer
                .try_clone()
                .context("Failed to clone tree channel for child")?,
            register_writer: self
                .spawner
                .register_writer
                .try_clone()
                .context("Failed to clone registration channel for child")?,
            kill_endpoint: child_endpoint,
        };

        // Acceptors keep inherited listening sockets open past the fork;
        // every other kind drops the master-side fds immediately.
        let close_parent_sockets = !matches!(node.kind, StageKindSpec::Acceptor);

        let mut forked = ForkedProcess::new(
            name,
            kind,
            channels,
            previously_loaded,
            loaded,
            self.config.heartbeat,
        );
        let pid = forked.run(close_parent_sockets, &close_fds)?;
        self.spawner.ledger.advance();

        self.pids.insert(pid.as_raw(), name.to_string());
        self.endpoints.insert(name.to_string(), endpoint);
        self.tree.record_forked(name, pid.as_raw())?;
        info!(stage = name, pid = pid.as_raw(), "forked stage");
        Ok(())
    }
}

impl Monitor for ProcessTreeMonitor {
    fn name(&self) -> &'static str {
        "process-tree"
    }

    fn datasources(&self) -> Vec<RawFd> {
        let mut fds = vec![self.reap.fd()];
        fds.extend(self.channel.parent_fd());
        fds
    }

    fn close_child_socket(&mut self) {
        // The spawner keeps its own clone for future respawns.
        self.channel.close_child();
    }

    fn close(&mut self) {
        for (_, mut endpoint) in self.endpoints.drain() {
            endpoint.close();
        }
        self.channel.close_parent();
    }
}
