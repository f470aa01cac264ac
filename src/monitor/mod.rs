//! The master's monitors.
//!
//! Each monitor owns one or more readiness sources the reactor polls, plus
//! the socket-discipline hooks used around the fork boundary: after the
//! plan boots, the master drops its copies of child-side ends, and at
//! shutdown every monitor releases its resources.

pub mod acceptor;
pub mod clients;
pub mod files;
pub mod tree;

use std::os::unix::io::RawFd;

pub use acceptor::AcceptorRegistrationMonitor;
pub use clients::{ClientHandler, ClientRequest, ClientResponse, StageSummary};
pub use files::FileMonitor;
pub use tree::{ProcessTreeMonitor, TreeEffect};

pub trait Monitor {
    fn name(&self) -> &'static str;

    /// File descriptors the reactor should poll for readability.
    fn datasources(&self) -> Vec<RawFd>;

    /// Drop the master's copy of the child-side channel end, if any.
    fn close_child_socket(&mut self) {}

    /// Release master-side resources at shutdown.
    fn close(&mut self);
}
