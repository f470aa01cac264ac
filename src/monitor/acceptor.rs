//! Acceptor registration monitor.
//!
//! Freshly forked acceptor stages announce themselves here over a shared
//! upstream channel. The registry is what lets the client handler answer
//! "which stage serves this command". The inner acceptor wire protocol is
//! the embedding application's business; the core only guarantees each
//! registration message is consumed exactly once.

use anyhow::Result;
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::os::unix::net::UnixStream;
use tracing::{debug, info, warn};

use super::Monitor;
use crate::control::{self, ChannelPair, ControlMessage};

pub struct AcceptorRegistrationMonitor {
    channel: ChannelPair,
    /// Stage name -> descriptor (the space-separated command list).
    registrations: HashMap<String, String>,
}

impl AcceptorRegistrationMonitor {
    pub fn new() -> Result<Self> {
        Ok(Self {
            channel: ChannelPair::new()?,
            registrations: HashMap::new(),
        })
    }

    /// Duplicate the child end for handing to forked stages.
    pub fn clone_child_writer(&self) -> Result<UnixStream> {
        self.channel.clone_child()
    }

    /// Consume one registration message.
    pub fn on_datasource_event(&mut self) -> Result<()> {
        let Some(stream) = self.channel.parent_mut() else {
            return Ok(());
        };
        let message: ControlMessage = match control::read_message(stream) {
            Ok(message) => message,
            Err(err) => {
                warn!("registration channel read failed: {err:#}");
                return Ok(());
            }
        };
        match message {
            ControlMessage::Register {
                stage_name,
                acceptor_descriptor,
            } => {
                info!(stage = %stage_name, commands = %acceptor_descriptor, "acceptor registered");
                self.registrations.insert(stage_name, acceptor_descriptor);
            }
            other => warn!("unexpected message on registration channel: {other:?}"),
        }
        Ok(())
    }

    /// Find the acceptor stage serving `command`.
    pub fn find_acceptor_for_command(&self, command: &str) -> Option<(&str, &str)> {
        self.registrations
            .iter()
            .find(|(_, descriptor)| descriptor.split_whitespace().any(|c| c == command))
            .map(|(name, descriptor)| (name.as_str(), descriptor.as_str()))
    }

    /// Drop the registration of a torn-down stage. Its respawn will
    /// register again on its own.
    pub fn remove_stage(&mut self, stage_name: &str) {
        if self.registrations.remove(stage_name).is_some() {
            debug!(stage = %stage_name, "acceptor registration dropped");
        }
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }
}

impl Monitor for AcceptorRegistrationMonitor {
    fn name(&self) -> &'static str {
        "acceptor-registration"
    }

    fn datasources(&self) -> Vec<RawFd> {
        self.channel.parent_fd().into_iter().collect()
    }

    fn close_child_socket(&mut self) {
        self.channel.close_child();
    }

    fn close(&mut self) {
        self.channel.close_parent();
    }
}
