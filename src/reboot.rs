//! Reboot, shutdown and waiting for a node to come back
//!
//! Before a reboot is sent, a marker is written to a volatile filesystem.
//! A node is only considered restarted once the marker is gone: a remote
//! shell that answers while the marker still exists means the daemon
//! restarted but the machine did not, so the reboot is sent again.

use std::thread;
use std::time::{Duration, Instant};

use hive_core_resilience::{PollOutcome, Poller};
use tracing::{debug, info, warn};

use crate::command::escape;
use crate::error::{ProxyError, Result};
use crate::options::RunOptions;
use crate::proxy::{Invocation, NodeProxy};

const REBOOT: &str = "systemctl reboot";
const POWEROFF: &str = "systemctl poweroff";

impl<M> NodeProxy<M> {
    /// Reboot the node, optionally waiting until it is back
    pub fn reboot(&mut self, wait: bool) -> Result<()> {
        info!(node = %self.name(), "Rebooting");
        self.set_status("rebooting");

        let marker = self.config().layout.reboot_marker();
        let tmpfs = escape(&self.config().layout.tmpfs_root);
        self.run_internal(format!("mkdir -p {} && touch {}", tmpfs, escape(&marker)), true)?;

        self.send_power_command(REBOOT)?;
        self.status.clear_ready();

        if !wait {
            return Ok(());
        }

        let grace = self.config().timing.reboot_grace();
        debug!(node = %self.name(), "Waiting {:?} before checking for boot", grace);
        thread::sleep(grace);
        self.wait_for_boot(None)
    }

    /// Power the node off. The proxy cannot be used until the node is
    /// started by other means.
    pub fn shutdown(&mut self) -> Result<()> {
        info!(node = %self.name(), "Shutting down");
        self.send_power_command(POWEROFF)?;
        self.status.clear_ready();
        self.set_status("powered off");
        Ok(())
    }

    fn send_power_command(&mut self, command: &str) -> Result<()> {
        let options = RunOptions::none().elevated().run_when_faulted().shutdown();
        let response = self.execute(options, Invocation::internal(command))?;
        if response.success() {
            Ok(())
        } else {
            Err(response.to_error())
        }
    }

    /// Poll until the node has restarted.
    ///
    /// Each round opens a fresh file session and looks for the reboot
    /// marker. An authentication failure ends the wait at once. Defaults to
    /// the configured reboot timeout.
    pub fn wait_for_boot(&mut self, timeout: Option<Duration>) -> Result<()> {
        let timing = self.config().timing.clone();
        let timeout = timeout.unwrap_or_else(|| timing.reboot_timeout());
        let marker = self.config().layout.reboot_marker();
        let node = self.name().to_string();

        self.set_status("waiting for boot");
        let begun = Instant::now();
        let poller = Poller::new(timing.reboot_poll_interval(), Some(timeout));

        let outcome = poller.until(|round| {
            self.sessions.disconnect();

            match self.sessions.exists_once(&marker) {
                Ok(false) => Ok(Some(())),
                Ok(true) => {
                    warn!(node = %node, "{} still present after restart; rebooting again", marker);
                    if let Err(err) = self.send_power_command(REBOOT) {
                        if err.is_auth_error() {
                            return Err(err);
                        }
                        debug!(node = %node, "Reboot not sent: {}", err);
                    }
                    Ok(None)
                }
                Err(err) if err.is_auth_error() => Err(err),
                Err(err) => {
                    debug!(node = %node, "Node not back yet (check {}): {}", round + 1, err);
                    Ok(None)
                }
            }
        })?;

        match outcome {
            PollOutcome::Ready(()) => {
                info!(node = %node, "Node is back after {:?}", begun.elapsed());
                self.status.mark_ready();
                self.set_status("ready");
                Ok(())
            }
            PollOutcome::TimedOut => Err(ProxyError::Timeout {
                node,
                operation: "waiting for boot".to_string(),
                elapsed: begun.elapsed(),
            }),
        }
    }
}
