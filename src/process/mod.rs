//! Process utilities shared by the master and its forked stages.

pub mod forked;
pub mod kinds;

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::signal::{kill, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Mutex, Once};
use tracing::debug;

/// Check if a process with the given pid is alive.
///
/// Sends the null signal, which probes existence without delivering
/// anything. `EPERM` still means the process exists.
pub fn is_process_alive(pid: i32) -> bool {
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Set the OS-visible command name of the current process.
///
/// Shows up in `ps` and `top` so an operator can tell stages apart. The
/// kernel truncates the name to 15 bytes.
pub fn set_process_title(title: &str) {
    #[cfg(target_os = "linux")]
    {
        if let Ok(name) = std::ffi::CString::new(title) {
            unsafe {
                libc::prctl(libc::PR_SET_NAME, name.as_ptr(), 0, 0, 0);
            }
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = title;
}

// Child pids the master must not leave behind. The atexit hook fires in
// forked children too, so it only acts in the process that registered it.
static GUARDED_CHILDREN: Mutex<Vec<i32>> = Mutex::new(Vec::new());
static GUARD_OWNER: AtomicI32 = AtomicI32::new(0);
static GUARD_INIT: Once = Once::new();

extern "C" fn kill_guarded_children_at_exit() {
    let owner = GUARD_OWNER.load(Ordering::Relaxed);
    if owner == 0 || unsafe { libc::getpid() } != owner {
        return;
    }
    if let Ok(children) = GUARDED_CHILDREN.lock() {
        for pid in children.iter() {
            unsafe {
                libc::kill(*pid, libc::SIGKILL);
            }
        }
    }
}

/// Register an exit-time obligation to SIGKILL `pid` if this process
/// exits while the child is still guarded. No stage outlives its master.
pub fn guard_child(pid: Pid) {
    GUARD_INIT.call_once(|| {
        GUARD_OWNER.store(unsafe { libc::getpid() }, Ordering::Relaxed);
        unsafe {
            libc::atexit(kill_guarded_children_at_exit);
        }
    });
    if let Ok(mut children) = GUARDED_CHILDREN.lock() {
        children.push(pid.as_raw());
    }
}

/// Drop the exit-time obligation for a reaped child.
pub fn unguard_child(pid: Pid) {
    if let Ok(mut children) = GUARDED_CHILDREN.lock() {
        children.retain(|p| *p != pid.as_raw());
    }
}

/// Forcibly terminate every guarded child now. Used by the orderly
/// shutdown path; the atexit hook covers everything else.
pub fn kill_guarded_children() {
    let pids: Vec<i32> = GUARDED_CHILDREN
        .lock()
        .map(|mut children| std::mem::take(&mut *children))
        .unwrap_or_default();
    for pid in pids {
        debug!(pid, "killing leftover stage process");
        let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
    }
}

// Interrupt flag for forked stages. The handler only touches the atomic;
// the stage's run loop notices and exits on its own terms.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn interrupt_handler(_signal: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Install the stage-side SIGINT handler and reset SIGCHLD to default.
///
/// Called once in a freshly forked child, before any application logic.
/// SA_RESTART is deliberately absent so a pending `poll` wakes with EINTR
/// and the run loop sees the flag promptly.
pub fn install_interrupt_flag() -> Result<()> {
    INTERRUPTED.store(false, Ordering::SeqCst);
    let action = SigAction::new(
        SigHandler::Handler(interrupt_handler),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        sigaction(Signal::SIGINT, &action).context("Failed to install SIGINT handler")?;
        sigaction(
            Signal::SIGCHLD,
            &SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty()),
        )
        .context("Failed to reset SIGCHLD handler")?;
    }
    Ok(())
}

/// Whether this process received SIGINT since the flag was installed.
pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Ignore SIGPIPE process-wide.
///
/// A stage can die between `poll` telling us its endpoint is writable and
/// the actual write; the write must fail with EPIPE instead of killing
/// the master.
pub fn ignore_sigpipe() -> Result<()> {
    let action = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    unsafe {
        sigaction(Signal::SIGPIPE, &action).context("Failed to ignore SIGPIPE")?;
    }
    Ok(())
}

// Hooks run inside a freshly forked child, before its run loop. Reserved
// for collaborators that must re-arm per-process instrumentation, like
// the load-tracking shim.
static AFTER_FORK_HOOKS: Mutex<Vec<fn()>> = Mutex::new(Vec::new());

/// Register a hook to run inside every forked stage after setup.
pub fn register_after_fork(hook: fn()) {
    if let Ok(mut hooks) = AFTER_FORK_HOOKS.lock() {
        hooks.push(hook);
    }
}

/// Run the registered post-fork hooks. Called from the child.
pub fn run_after_fork_hooks() {
    let hooks: Vec<fn()> = AFTER_FORK_HOOKS
        .lock()
        .map(|hooks| hooks.clone())
        .unwrap_or_default();
    for hook in hooks {
        hook();
    }
}

/// Process-wide record of files the warm state has loaded so far.
///
/// The master appends as the embedding application reports loads; each
/// fork captures the full list plus a cursor marking what the previous
/// fork already covered, so every child reports only what is new since
/// its predecessor.
#[derive(Debug, Default)]
pub struct LoadLedger {
    loaded: Vec<PathBuf>,
    cursor: usize,
}

impl LoadLedger {
    /// Record a newly loaded file.
    pub fn record(&mut self, path: impl Into<PathBuf>) {
        self.loaded.push(path.into());
    }

    /// Capture (previously loaded, everything loaded) for a fork.
    pub fn snapshot(&self) -> (Vec<PathBuf>, Vec<PathBuf>) {
        (
            self.loaded[..self.cursor].to_vec(),
            self.loaded.clone(),
        )
    }

    /// Move the cursor forward after a fork consumed the snapshot.
    pub fn advance(&mut self) {
        self.cursor = self.loaded.len();
    }

    pub fn len(&self) -> usize {
        self.loaded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loaded.is_empty()
    }
}
