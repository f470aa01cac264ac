//! The fork/setup/run/cleanup protocol shared by every stage kind.
//!
//! `ForkedProcess` owns the protocol; a `StageKind` supplies the pieces
//! that differ per kind: the process-type label, optional hooks around
//! setup, and the blocking run loop.

use anyhow::{bail, Context, Result};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd::{fork, ForkResult, Pid};
use std::collections::HashSet;
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::io::RawFd;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

use crate::control::{self, ControlMessage, Phase};
use crate::process;

/// Capability set of one concrete stage kind.
///
/// Hooks default to no-ops; only the run loop and the label are
/// mandatory. Selected at plan-build time, never by inheritance.
pub trait StageKind {
    /// Label shown in the process title, e.g. "preload" or "acceptor".
    fn process_type(&self) -> &'static str;

    /// Runs in the child before any setup work.
    fn before_setup(&mut self, _ctx: &mut StageContext) -> Result<()> {
        Ok(())
    }

    /// Runs in the child after setup, before the stage is reported ready.
    fn after_setup(&mut self, _ctx: &mut StageContext) -> Result<()> {
        Ok(())
    }

    /// The stage's blocking loop. Returning ends the process with exit 0.
    fn run_loop(&mut self, ctx: &mut StageContext) -> Result<()>;

    /// Acceptor stages reachable through this stage.
    fn descendant_acceptors(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Why a stage's wait was interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeEvent {
    /// The master pushed a kill order down the control channel.
    Kill,
    /// SIGINT arrived; the stage should report and exit gracefully.
    Interrupted,
    /// The caller's extra descriptor became readable.
    Extra,
    /// Heartbeat timeout; nothing happened.
    Tick,
}

/// Channel ends a forked stage inherits from the master.
#[derive(Debug)]
pub struct ChildChannels {
    /// Shared upstream channel for `Status` and `FeatureLoaded` reports.
    pub tree_writer: UnixStream,
    /// Shared upstream channel for acceptor `Register` messages.
    pub register_writer: UnixStream,
    /// This stage's dedicated downstream channel for `Kill`.
    pub kill_endpoint: UnixStream,
}

/// Child-side view of one running stage.
pub struct StageContext {
    name: String,
    pid: i32,
    heartbeat: Duration,
    tree_writer: UnixStream,
    register_writer: UnixStream,
    kill_endpoint: UnixStream,
}

impl StageContext {
    fn new(name: String, heartbeat: Duration, channels: ChildChannels) -> Self {
        Self {
            name,
            pid: std::process::id() as i32,
            heartbeat,
            tree_writer: channels.tree_writer,
            register_writer: channels.register_writer,
            kill_endpoint: channels.kill_endpoint,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Report a lifecycle phase to the master.
    pub fn report_phase(&mut self, phase: Phase) -> Result<()> {
        control::write_message(
            &mut self.tree_writer,
            &ControlMessage::Status {
                pid: self.pid,
                phase,
                stage_name: self.name.clone(),
            },
        )
        .with_context(|| format!("Failed to report phase '{phase}'"))
    }

    /// Announce this stage to the acceptor registration monitor.
    pub fn register_acceptor(&mut self, descriptor: &str) -> Result<()> {
        control::write_message(
            &mut self.register_writer,
            &ControlMessage::Register {
                stage_name: self.name.clone(),
                acceptor_descriptor: descriptor.to_string(),
            },
        )
        .context("Failed to register acceptor")
    }

    /// Block until something happens: a kill order, SIGINT, readability of
    /// `extra_fd`, or a heartbeat timeout.
    pub fn wait_event(&mut self, extra_fd: Option<RawFd>) -> Result<WakeEvent> {
        let timeout = poll_timeout(self.heartbeat);
        let (kill_ready, extra_ready) = {
            let mut fds = vec![PollFd::new(self.kill_endpoint.as_fd(), PollFlags::POLLIN)];
            if let Some(raw) = extra_fd {
                let borrowed = unsafe { BorrowedFd::borrow_raw(raw) };
                fds.push(PollFd::new(borrowed, PollFlags::POLLIN));
            }
            match poll(&mut fds, timeout) {
                Ok(0) => (false, false),
                Ok(_) => (
                    fds[0].revents().map(|r| !r.is_empty()).unwrap_or(false),
                    fds.get(1)
                        .and_then(|f| f.revents())
                        .map(|r| !r.is_empty())
                        .unwrap_or(false),
                ),
                Err(Errno::EINTR) => (false, false),
                Err(err) => return Err(err).context("Stage poll failed"),
            }
        };

        if process::interrupted() {
            return Ok(WakeEvent::Interrupted);
        }
        if kill_ready {
            return Ok(match control::read_message(&mut self.kill_endpoint) {
                Ok(ControlMessage::Kill { .. }) => {
                    let _ = control::write_message(&mut self.kill_endpoint, &ControlMessage::Ack);
                    WakeEvent::Kill
                }
                // A broken endpoint means the master is gone; die with it.
                Err(_) => WakeEvent::Kill,
                Ok(_) => WakeEvent::Tick,
            });
        }
        if extra_ready {
            return Ok(WakeEvent::Extra);
        }
        Ok(WakeEvent::Tick)
    }

    /// Graceful SIGINT exit: report, print a short notice, and let the
    /// run loop return.
    pub fn acknowledge_interrupt(&mut self) {
        let _ = self.report_phase(Phase::Killing);
        println!("exiting");
    }
}

/// One stage's fork handle, master side.
pub struct ForkedProcess {
    name: String,
    kind: Box<dyn StageKind>,
    channels: Option<ChildChannels>,
    previously_loaded: Vec<PathBuf>,
    loaded: Vec<PathBuf>,
    heartbeat: Duration,
    pid: Option<Pid>,
}

impl ForkedProcess {
    pub fn new(
        name: &str,
        kind: Box<dyn StageKind>,
        channels: ChildChannels,
        previously_loaded: Vec<PathBuf>,
        loaded: Vec<PathBuf>,
        heartbeat: Duration,
    ) -> Self {
        Self {
            name: name.to_string(),
            kind,
            channels: Some(channels),
            previously_loaded,
            loaded,
            heartbeat,
            pid: None,
        }
    }

    /// Fork the stage process.
    ///
    /// May be called at most once per instance. The parent resumes
    /// immediately with the child pid and registers the exit-time kill
    /// obligation; the child performs setup and never returns from here.
    ///
    /// `close_fds` lists master-side descriptors the child inherited and,
    /// when `close_parent_sockets` is set, must not keep open.
    pub fn run(&mut self, close_parent_sockets: bool, close_fds: &[RawFd]) -> Result<Pid> {
        if self.pid.is_some() {
            bail!("Stage '{}' has already been forked", self.name);
        }
        let channels = self
            .channels
            .take()
            .with_context(|| format!("Stage '{}' channels already consumed", self.name))?;

        match unsafe { fork() }.context("Fork failed; the master cannot continue")? {
            ForkResult::Parent { child } => {
                process::guard_child(child);
                self.pid = Some(child);
                // The parent's copies of the child-side ends close here.
                drop(channels);
                Ok(child)
            }
            ForkResult::Child => {
                let code = match self.child_main(channels, close_parent_sockets, close_fds) {
                    Ok(()) => 0,
                    Err(err) => {
                        eprintln!("hearth stage '{}' failed: {err:#}", self.name);
                        1
                    }
                };
                std::process::exit(code);
            }
        }
    }

    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    fn child_main(
        &mut self,
        channels: ChildChannels,
        close_parent_sockets: bool,
        close_fds: &[RawFd],
    ) -> Result<()> {
        let mut ctx = StageContext::new(self.name.clone(), self.heartbeat, channels);
        self.kind.before_setup(&mut ctx)?;
        self.setup_forked_process(&mut ctx, close_parent_sockets, close_fds)?;
        process::run_after_fork_hooks();
        self.kind.after_setup(&mut ctx)?;
        ctx.report_phase(Phase::Ready)?;
        self.kind.run_loop(&mut ctx)
    }

    /// Post-fork setup, run in the child before any application logic.
    fn setup_forked_process(
        &mut self,
        ctx: &mut StageContext,
        close_parent_sockets: bool,
        close_fds: &[RawFd],
    ) -> Result<()> {
        if close_parent_sockets {
            for fd in close_fds {
                unsafe {
                    libc::close(*fd);
                }
            }
        }

        process::set_process_title(&format!(
            "hearth {}: {}",
            self.kind.process_type(),
            self.name
        ));

        ctx.report_phase(Phase::Starting)?;
        process::install_interrupt_flag()?;

        // Everything loaded since the previous fork's snapshot is this
        // stage's contribution. Reporting happens off-thread so it never
        // delays the stage's actual workload.
        let previous: HashSet<PathBuf> = self.previously_loaded.iter().cloned().collect();
        let new_features: Vec<PathBuf> = self
            .loaded
            .iter()
            .filter(|path| !previous.contains(*path))
            .cloned()
            .collect();
        if !new_features.is_empty() {
            let mut writer = ctx
                .tree_writer
                .try_clone()
                .context("Failed to clone feature report channel")?;
            let stage_name = self.name.clone();
            std::thread::spawn(move || {
                for path in new_features {
                    let message = ControlMessage::FeatureLoaded {
                        stage_name: stage_name.clone(),
                        path,
                    };
                    if control::write_message(&mut writer, &message).is_err() {
                        break;
                    }
                }
            });
        }

        Ok(())
    }
}

/// Clamp a duration into a poll timeout.
pub(crate) fn poll_timeout(duration: Duration) -> PollTimeout {
    u16::try_from(duration.as_millis())
        .map(PollTimeout::from)
        .unwrap_or(PollTimeout::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopKind;

    impl StageKind for NoopKind {
        fn process_type(&self) -> &'static str {
            "preload"
        }

        fn run_loop(&mut self, _ctx: &mut StageContext) -> Result<()> {
            Ok(())
        }
    }

    fn channels() -> ChildChannels {
        let (tree_writer, _a) = UnixStream::pair().unwrap();
        let (register_writer, _b) = UnixStream::pair().unwrap();
        let (kill_endpoint, _c) = UnixStream::pair().unwrap();
        // Leak the peer ends so the channels stay connected for the test.
        std::mem::forget((_a, _b, _c));
        ChildChannels {
            tree_writer,
            register_writer,
            kill_endpoint,
        }
    }

    #[test]
    fn test_default_hooks_are_noops() {
        let mut kind = NoopKind;
        let mut ctx = StageContext::new(
            "app".to_string(),
            Duration::from_millis(10),
            channels(),
        );
        assert!(kind.before_setup(&mut ctx).is_ok());
        assert!(kind.after_setup(&mut ctx).is_ok());
        assert!(kind.descendant_acceptors().is_empty());
    }

    #[test]
    fn test_wait_event_times_out_to_tick() {
        let mut ctx = StageContext::new(
            "app".to_string(),
            Duration::from_millis(10),
            channels(),
        );
        assert_eq!(ctx.wait_event(None).unwrap(), WakeEvent::Tick);
    }

    #[test]
    fn test_wait_event_sees_kill_and_acks() {
        let (kill_master, kill_child) = UnixStream::pair().unwrap();
        let (tree_writer, _t) = UnixStream::pair().unwrap();
        let (register_writer, _r) = UnixStream::pair().unwrap();
        std::mem::forget((_t, _r));
        let mut ctx = StageContext::new(
            "victim".to_string(),
            Duration::from_millis(100),
            ChildChannels {
                tree_writer,
                register_writer,
                kill_endpoint: kill_child,
            },
        );

        let mut kill_master = kill_master;
        control::write_message(
            &mut kill_master,
            &ControlMessage::Kill {
                stage_name: "victim".to_string(),
            },
        )
        .unwrap();

        assert_eq!(ctx.wait_event(None).unwrap(), WakeEvent::Kill);
        let ack: ControlMessage = control::read_message(&mut kill_master).unwrap();
        assert_eq!(ack, ControlMessage::Ack);
    }

    #[test]
    fn test_forked_process_refuses_double_run() {
        // Exhaust the channels without forking, then verify the guard.
        let mut forked = ForkedProcess::new(
            "app",
            Box::new(NoopKind),
            channels(),
            Vec::new(),
            Vec::new(),
            Duration::from_secs(1),
        );
        forked.pid = Some(Pid::from_raw(1));
        assert!(forked.run(false, &[]).is_err());
    }

    #[test]
    fn test_poll_timeout_clamps_large_durations() {
        assert_eq!(
            poll_timeout(Duration::from_millis(250)),
            PollTimeout::from(250u16)
        );
        assert_eq!(poll_timeout(Duration::from_secs(3600)), PollTimeout::MAX);
    }
}
