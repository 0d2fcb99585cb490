//! Session primitives with reconnect-and-retry
//!
//! Each primitive gets `retry_count + 1` attempts. Only transport-class
//! failures are retried: a dead session is dropped and the next attempt
//! reconnects after `retry_delay`. A failure to reconnect at all is not
//! retried again here since [`SessionManager::open_session`] already spent
//! its own attempt budget.

use hive_core_resilience::{RetryPolicy, Verdict};
use tracing::{debug, warn};

use crate::connection::SessionManager;
use crate::error::{ProxyError, Result};
use crate::transport::{CommandSession, ExecOutput, FileSession, SessionKind, TransportResult};

fn should_retry(err: &ProxyError) -> bool {
    matches!(err, ProxyError::Transport { source, .. } if source.is_transient())
}

impl SessionManager {
    fn operation_policy(&self) -> RetryPolicy {
        let timing = &self.config().timing;
        RetryPolicy::new(timing.retry_count.saturating_add(1), timing.retry_delay())
    }

    fn on_failure<'a>(
        node: &'a str,
        kind: SessionKind,
        label: &str,
    ) -> impl FnMut(&ProxyError, u32) -> Verdict + 'a {
        let label = label.to_string();
        move |err, attempt| {
            if should_retry(err) {
                warn!(node, "{} on {} session failed (attempt {}): {}", label, kind, attempt + 1, err);
                Verdict::Retry
            } else {
                Verdict::Abort
            }
        }
    }

    fn with_command<T, F>(&mut self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut(&mut dyn CommandSession) -> TransportResult<T>,
    {
        let policy = self.operation_policy();
        let node = self.node().to_string();

        policy.run(
            |attempt| {
                if attempt > 0 {
                    debug!(node = %node, "Reconnecting command session before retry");
                    self.reset_command();
                }
                let session = self.ensure_command_session()?;
                op(session.as_mut()).map_err(|err| ProxyError::from_transport(&node, err))
            },
            Self::on_failure(&node, SessionKind::Command, label),
        )
    }

    fn with_file<T, F>(&mut self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut(&mut dyn FileSession) -> TransportResult<T>,
    {
        let policy = self.operation_policy();
        let node = self.node().to_string();

        policy.run(
            |attempt| {
                if attempt > 0 {
                    debug!(node = %node, "Reconnecting file session before retry");
                    self.reset_file();
                }
                let session = self.ensure_file_session()?;
                op(session.as_mut()).map_err(|err| ProxyError::from_transport(&node, err))
            },
            Self::on_failure(&node, SessionKind::File, label),
        )
    }

    /// Run one shell line, retrying transport failures. Only safe for lines
    /// that tolerate being repeated.
    pub fn exec(&mut self, command: &str) -> Result<ExecOutput> {
        self.with_command("exec", |session| session.exec(command))
    }

    /// Run one shell line exactly once: no liveness check, no retry
    pub fn exec_once(&mut self, command: &str) -> Result<ExecOutput> {
        let node = self.node().to_string();
        let session = self.ensure_command_session()?;
        session
            .exec(command)
            .map_err(|err| ProxyError::from_transport(&node, err))
    }

    pub fn upload(&mut self, path: &str, data: &[u8], mode: Option<i32>) -> Result<()> {
        self.with_file("upload", |session| session.upload(path, data, mode))
    }

    pub fn download(&mut self, path: &str) -> Result<Vec<u8>> {
        self.with_file("download", |session| session.download(path))
    }

    pub fn exists(&mut self, path: &str) -> Result<bool> {
        self.with_file("exists", |session| session.exists(path))
    }

    /// One fresh connection and one check, no retries. Used while a node
    /// may be restarting.
    pub fn exists_once(&mut self, path: &str) -> Result<bool> {
        let node = self.node().to_string();
        let session = self.reopen_file_session_once()?;
        session
            .exists(path)
            .map_err(|err| ProxyError::from_transport(&node, err))
    }

    /// Check an existing command session with a no-op; drop it if the
    /// check fails so the next use reconnects cleanly.
    pub fn check_command_session(&mut self) {
        if !self.has_command_session() {
            return;
        }

        let node = self.node().to_string();
        let healthy = match self.ensure_command_session() {
            Ok(session) => session.exec("true").is_ok(),
            Err(_) => false,
        };

        if !healthy {
            debug!(node = %node, "Command session failed its liveness check; reconnecting");
            self.reset_command();
        }
    }
}
