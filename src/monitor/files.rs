//! Filesystem dependency tracker.
//!
//! Watches the parent directory of every indexed file (watching the file
//! itself misses editors that swap in a new inode) and treats creation,
//! modification and removal uniformly as "changed". The notify backend
//! delivers events on its own thread; that thread only forwards paths over
//! an internal socket pair, and the reactor reads them back on its side,
//! so every `on_change` consequence runs single-threaded.

use anyhow::{Context, Result};
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashSet;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

use super::Monitor;
use crate::control;

pub struct FileMonitor {
    watcher: Option<RecommendedWatcher>,
    /// Reactor-side end of the forwarding pair.
    events: UnixStream,
    /// Raw fd of the notify thread's writer, for the child close list.
    forward_fd: RawFd,
    watched_files: HashSet<PathBuf>,
    watched_dirs: HashSet<PathBuf>,
}

impl FileMonitor {
    pub fn new() -> Result<Self> {
        let (events, forward) =
            UnixStream::pair().context("Failed to create file event channel")?;
        let forward_fd = forward.as_raw_fd();

        let mut forward = forward;
        let watcher = RecommendedWatcher::new(
            move |result: notify::Result<Event>| {
                if let Ok(event) = result {
                    for path in event.paths {
                        if control::write_message(&mut forward, &path).is_err() {
                            break;
                        }
                    }
                }
            },
            Config::default(),
        )
        .context("Failed to create filesystem watcher")?;

        Ok(Self {
            watcher: Some(watcher),
            events,
            forward_fd,
            watched_files: HashSet::new(),
            watched_dirs: HashSet::new(),
        })
    }

    /// Start watching a dependency path.
    ///
    /// A path whose directory cannot be watched (already deleted, foreign
    /// mount gone) is logged and skipped; it simply produces no further
    /// change events.
    pub fn watch(&mut self, path: &Path) {
        if !self.watched_files.insert(path.to_path_buf()) {
            return;
        }
        let dir = path.parent().unwrap_or(Path::new("/"));
        if self.watched_dirs.contains(dir) {
            return;
        }
        let Some(watcher) = self.watcher.as_mut() else {
            return;
        };
        match watcher.watch(dir, RecursiveMode::NonRecursive) {
            Ok(()) => {
                trace!(dir = %dir.display(), "watching directory");
                self.watched_dirs.insert(dir.to_path_buf());
            }
            Err(err) => {
                debug!(path = %path.display(), "cannot watch dependency: {err}");
            }
        }
    }

    pub fn watched_count(&self) -> usize {
        self.watched_files.len()
    }

    /// Consume one forwarded event.
    ///
    /// Returns the changed path when it is a watched dependency; directory
    /// noise from unrelated siblings comes back as `None`.
    pub fn on_datasource_event(&mut self) -> Result<Option<PathBuf>> {
        let path: PathBuf = control::read_message(&mut self.events)
            .context("Failed to read file change event")?;
        if self.watched_files.contains(&path) {
            debug!(path = %path.display(), "watched dependency changed");
            Ok(Some(path))
        } else {
            trace!(path = %path.display(), "ignoring change to unwatched path");
            Ok(None)
        }
    }

    /// Master-side fds a forked child must not keep open.
    pub fn fds_for_child_close(&self) -> Vec<RawFd> {
        vec![self.events.as_raw_fd(), self.forward_fd]
    }
}

impl Monitor for FileMonitor {
    fn name(&self) -> &'static str {
        "file-monitor"
    }

    fn datasources(&self) -> Vec<RawFd> {
        vec![self.events.as_raw_fd()]
    }

    fn close(&mut self) {
        self.watcher = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
    use std::io::Write;
    use std::os::fd::BorrowedFd;
    use std::time::{Duration, Instant};

    fn wait_readable(fd: RawFd, deadline: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
            let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
            if let Ok(n) = poll(&mut fds, PollTimeout::from(100u16)) {
                if n > 0 {
                    return true;
                }
            }
        }
        false
    }

    #[test]
    fn test_watch_is_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("dep.rb");
        std::fs::write(&file, "x").unwrap();

        let mut monitor = FileMonitor::new().unwrap();
        monitor.watch(&file);
        monitor.watch(&file);
        assert_eq!(monitor.watched_count(), 1);
    }

    #[test]
    fn test_missing_directory_is_tolerated() {
        let mut monitor = FileMonitor::new().unwrap();
        monitor.watch(Path::new("/nonexistent-hearth-dir/dep.rb"));
        // The path is remembered but produces no events and no crash.
        assert_eq!(monitor.watched_count(), 1);
    }

    #[test]
    fn test_modification_of_watched_file_is_delivered() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("dep.rb");
        std::fs::write(&file, "one").unwrap();

        let mut monitor = FileMonitor::new().unwrap();
        monitor.watch(&file);

        let mut handle = std::fs::OpenOptions::new()
            .append(true)
            .open(&file)
            .unwrap();
        writeln!(handle, "two").unwrap();
        handle.sync_all().unwrap();
        drop(handle);

        let fd = monitor.datasources()[0];
        assert!(
            wait_readable(fd, Duration::from_secs(10)),
            "no change event arrived"
        );

        // Drain until the watched path shows up; the backend may emit
        // several events for one logical change.
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            match monitor.on_datasource_event().unwrap() {
                Some(path) => {
                    assert_eq!(path, file);
                    break;
                }
                None => {
                    assert!(Instant::now() < deadline, "only unwatched noise arrived");
                    assert!(wait_readable(fd, Duration::from_secs(10)));
                }
            }
        }
    }

    #[test]
    fn test_unwatched_sibling_is_filtered() {
        let dir = tempfile::TempDir::new().unwrap();
        let watched = dir.path().join("dep.rb");
        let sibling = dir.path().join("noise.log");
        std::fs::write(&watched, "x").unwrap();

        let mut monitor = FileMonitor::new().unwrap();
        monitor.watch(&watched);

        std::fs::write(&sibling, "noise").unwrap();

        let fd = monitor.datasources()[0];
        assert!(wait_readable(fd, Duration::from_secs(10)));
        assert_eq!(monitor.on_datasource_event().unwrap(), None);
    }
}
