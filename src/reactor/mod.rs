//! The master's single event loop.
//!
//! One thread, one `poll(2)` call per iteration over every monitor's
//! readiness sources, with a bounded timeout that doubles as a liveness
//! heartbeat. Each ready source gets its handler invoked exactly once per
//! iteration, and every mutation of the stage tree happens inside one of
//! those dispatches, so nothing here needs a lock.

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::MasterConfig;
use crate::monitor::{
    AcceptorRegistrationMonitor, ClientHandler, FileMonitor, Monitor, ProcessTreeMonitor,
    TreeEffect,
};
use crate::plan::Plan;
use crate::process;
use crate::process::forked::poll_timeout;

/// Which monitor a ready descriptor belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Files,
    TreeControl,
    TreeReap,
    Acceptors,
    Clients,
}

pub struct Reactor {
    config: MasterConfig,
    files: FileMonitor,
    tree: ProcessTreeMonitor,
    acceptors: AcceptorRegistrationMonitor,
    clients: ClientHandler,
    shutdown: Arc<AtomicBool>,
}

impl Reactor {
    pub fn new(plan: Plan, config: MasterConfig) -> Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));

        let files = FileMonitor::new()?;
        let acceptors = AcceptorRegistrationMonitor::new()?;
        let clients = ClientHandler::bind(&config.socket_path, Arc::clone(&shutdown))?;
        let mut tree =
            ProcessTreeMonitor::new(plan, config.clone(), acceptors.clone_child_writer()?)?;

        // Master-side fds every forked stage inherits and, unless it is an
        // acceptor, must close before running application code.
        let mut close_fds: Vec<RawFd> = Vec::new();
        close_fds.extend(files.fds_for_child_close());
        close_fds.extend(acceptors.datasources());
        close_fds.extend(clients.datasources());
        tree.set_child_close_fds(close_fds);

        Ok(Self {
            config,
            files,
            tree,
            acceptors,
            clients,
            shutdown,
        })
    }

    /// Expose the stage tree, mainly for inspection after `run` returns.
    pub fn tree(&self) -> &crate::models::StageTree {
        self.tree.tree()
    }

    /// Record a file the embedding application loaded outside the normal
    /// tracking path. The next forked stage reports it as its own
    /// dependency.
    pub fn add_extra_feature(&mut self, path: impl Into<std::path::PathBuf>) {
        self.tree.add_extra_feature(path);
    }

    /// Boot the plan and multiplex events until shutdown.
    ///
    /// Returns only on a trapped termination signal, a client stop
    /// request, a dead root stage, or a fatal resource error.
    pub fn run(&mut self) -> Result<()> {
        process::set_process_title("hearth master");
        process::ignore_sigpipe()?;

        let flag = Arc::clone(&self.shutdown);
        ctrlc::set_handler(move || {
            flag.store(true, Ordering::Relaxed);
        })
        .context("Failed to install termination signal handler")?;

        self.tree.boot()?;
        for monitor in self.monitors() {
            monitor.close_child_socket();
        }
        info!(socket = %self.config.socket_path.display(), "master running");

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                info!("termination requested, shutting down");
                break;
            }
            if self.tree.root_dead() {
                info!("root stage is dead, shutting down");
                break;
            }

            let routes = self.routes();
            let ready: Vec<Route> = {
                let mut fds: Vec<PollFd> = routes
                    .iter()
                    .map(|(fd, _)| {
                        let borrowed = unsafe { BorrowedFd::borrow_raw(*fd) };
                        PollFd::new(borrowed, PollFlags::POLLIN)
                    })
                    .collect();
                match poll(&mut fds, poll_timeout(self.config.heartbeat)) {
                    Ok(0) => {
                        // Heartbeat: give the tree a chance to reap.
                        let effects = self.tree.on_tick()?;
                        self.apply(effects);
                        continue;
                    }
                    Ok(_) => fds
                        .iter()
                        .zip(routes.iter())
                        .filter(|(fd, _)| fd.revents().map(|r| !r.is_empty()).unwrap_or(false))
                        .map(|(_, (_, route))| *route)
                        .collect(),
                    Err(Errno::EINTR) => continue,
                    Err(err) => return Err(err).context("Reactor poll failed"),
                }
            };

            for route in ready {
                match route {
                    Route::Files => match self.files.on_datasource_event() {
                        Ok(Some(path)) => {
                            let effects = self.tree.kill_nodes_with_feature(&path)?;
                            self.apply(effects);
                        }
                        Ok(None) => {}
                        Err(err) => warn!("file monitor event failed: {err:#}"),
                    },
                    Route::TreeControl => {
                        let effects = self.tree.on_control_event()?;
                        self.apply(effects);
                    }
                    Route::TreeReap => {
                        let effects = self.tree.on_reap_event()?;
                        self.apply(effects);
                    }
                    Route::Acceptors => self.acceptors.on_datasource_event()?,
                    Route::Clients => self
                        .clients
                        .on_datasource_event(self.tree.tree(), &self.acceptors)?,
                }
            }
        }

        self.shutdown_cleanly();
        Ok(())
    }

    fn routes(&self) -> Vec<(RawFd, Route)> {
        let mut routes = Vec::new();
        for fd in self.files.datasources() {
            routes.push((fd, Route::Files));
        }
        routes.push((self.tree.reap_fd(), Route::TreeReap));
        if let Some(fd) = self.tree.control_fd() {
            routes.push((fd, Route::TreeControl));
        }
        for fd in self.acceptors.datasources() {
            routes.push((fd, Route::Acceptors));
        }
        for fd in self.clients.datasources() {
            routes.push((fd, Route::Clients));
        }
        routes
    }

    /// Route cross-monitor side effects, keeping all of it on this thread.
    fn apply(&mut self, effects: Vec<TreeEffect>) {
        for effect in effects {
            match effect {
                TreeEffect::WatchPath(path) => self.files.watch(&path),
                TreeEffect::StageGone(name) => self.acceptors.remove_stage(&name),
            }
        }
    }

    fn monitors(&mut self) -> [&mut dyn Monitor; 4] {
        [
            &mut self.files,
            &mut self.tree,
            &mut self.acceptors,
            &mut self.clients,
        ]
    }

    /// Orderly shutdown: release monitor resources, remove the
    /// coordination socket, and make sure no stage outlives the master.
    fn shutdown_cleanly(&mut self) {
        for monitor in self.monitors() {
            debug!(monitor = monitor.name(), "closing monitor");
            monitor.close();
        }
        process::kill_guarded_children();
        info!("master stopped");
    }
}
