//! Connection lifecycle for one node
//!
//! A [`SessionManager`] owns at most one command session and one file
//! session. Handles are opened lazily, reopened when they report themselves
//! dead, and torn down on a detached worker with a bounded wait because a
//! wedged transport can block forever while disposing.
//!
//! Every connection attempt holds the per-host permit from
//! [`HostGate`](hive_core_resilience::HostGate) for the duration of the
//! handshake only; the pause between attempts happens outside the permit.

use std::sync::{Arc, RwLock};

use hive_core_resilience::{run_with_deadline, Completion, HostGate, RetryPolicy, Verdict};
use tracing::{debug, warn};

use crate::config::ProxyConfig;
use crate::credentials::Credentials;
use crate::error::{ProxyError, Result};
use crate::node::NodeIdentity;
use crate::transport::{
    CommandSession, ConnectParams, FileSession, SessionFactory, SessionKind, TransportError,
    TransportResult,
};

/// State shared by a proxy and its clones
#[derive(Clone)]
pub(crate) struct NodeContext {
    pub identity: Arc<NodeIdentity>,
    pub credentials: Arc<RwLock<Credentials>>,
    pub config: Arc<ProxyConfig>,
    pub factory: Arc<dyn SessionFactory>,
    pub gate: Arc<HostGate>,
}

impl NodeContext {
    pub fn node(&self) -> &str {
        &self.identity.name
    }

    pub fn credentials(&self) -> Credentials {
        self.credentials
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Parameters for the next connection attempt, with current credentials
    pub fn connect_params(&self) -> ConnectParams {
        let (host, port) = self.identity.resolve(self.config.use_public_address);
        let credentials = self.credentials();
        let timing = &self.config.timing;

        ConnectParams {
            node: self.identity.name.clone(),
            host,
            port,
            username: credentials.username,
            auth: credentials.auth,
            connect_timeout: timing.connect_timeout(),
            operation_timeout: timing.file_timeout(),
            cipher: self.config.cipher.clone(),
        }
    }
}

/// Owns the command and file sessions of one proxy instance
pub(crate) struct SessionManager {
    pub(crate) ctx: NodeContext,
    command: Option<Box<dyn CommandSession>>,
    file: Option<Box<dyn FileSession>>,
}

impl SessionManager {
    pub fn new(ctx: NodeContext) -> Self {
        Self {
            ctx,
            command: None,
            file: None,
        }
    }

    pub fn node(&self) -> &str {
        self.ctx.node()
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.ctx.config
    }

    pub fn has_command_session(&self) -> bool {
        self.command.is_some()
    }

    /// Return the live command session, reopening it if needed
    pub fn ensure_command_session(&mut self) -> Result<&mut Box<dyn CommandSession>> {
        let alive = self
            .command
            .as_ref()
            .is_some_and(|session| session.is_connected());

        if !alive {
            if let Some(stale) = self.command.take() {
                self.teardown_command(stale);
            }
            let session = self.open_session(SessionKind::Command, |factory, params| {
                factory.open_command(params)
            })?;
            self.command = Some(session);
        }

        self.command
            .as_mut()
            .ok_or_else(|| ProxyError::Protocol {
                node: self.ctx.node().to_string(),
                message: "command session unavailable".to_string(),
            })
    }

    /// Return the live file session, reopening it if needed
    pub fn ensure_file_session(&mut self) -> Result<&mut Box<dyn FileSession>> {
        let alive = self
            .file
            .as_ref()
            .is_some_and(|session| session.is_connected());

        if !alive {
            if let Some(stale) = self.file.take() {
                self.teardown_file(stale);
            }
            let session = self.open_session(SessionKind::File, |factory, params| {
                factory.open_file(params)
            })?;
            self.file = Some(session);
        }

        self.file.as_mut().ok_or_else(|| ProxyError::Protocol {
            node: self.ctx.node().to_string(),
            message: "file session unavailable".to_string(),
        })
    }

    /// Open one session with bounded attempts, serialized per host.
    ///
    /// Authentication failures abort at once. Exhausting the attempts yields
    /// [`ProxyError::ConnectionFailed`].
    pub fn open_session<S, F>(&self, kind: SessionKind, open: F) -> Result<S>
    where
        F: Fn(&dyn SessionFactory, &ConnectParams) -> TransportResult<S>,
    {
        let timing = &self.ctx.config.timing;
        let policy = RetryPolicy::new(timing.connect_attempts, timing.connect_retry_delay());
        self.open_session_with(policy, kind, open)
    }

    fn open_session_with<S, F>(&self, policy: RetryPolicy, kind: SessionKind, open: F) -> Result<S>
    where
        F: Fn(&dyn SessionFactory, &ConnectParams) -> TransportResult<S>,
    {
        let params = self.ctx.connect_params();
        let node = self.ctx.node();

        let result = policy.run(
            |attempt| {
                let _permit = self.ctx.gate.acquire(&params.host);
                debug!(
                    node,
                    "Opening {} session to {} (attempt {})",
                    kind,
                    params.endpoint(),
                    attempt + 1
                );
                open(self.ctx.factory.as_ref(), &params)
            },
            |err: &TransportError, attempt| {
                if err.is_auth_error() {
                    return Verdict::Abort;
                }
                warn!(
                    node,
                    "Connection attempt {}/{} failed: {}",
                    attempt + 1,
                    policy.attempts.max(1),
                    err
                );
                Verdict::Retry
            },
        );

        result.map_err(|err| {
            if err.is_auth_error() {
                ProxyError::from_transport(node, err)
            } else {
                ProxyError::ConnectionFailed {
                    node: node.to_string(),
                    attempts: policy.attempts.max(1),
                    message: err.to_string(),
                }
            }
        })
    }

    /// Replace the file session using a single connection attempt
    pub fn reopen_file_session_once(&mut self) -> Result<&mut Box<dyn FileSession>> {
        self.reset_file();
        let session = self.open_session_with(RetryPolicy::once(), SessionKind::File, |factory, params| {
            factory.open_file(params)
        })?;
        Ok(self.file.insert(session))
    }

    /// Drop the command session so the next use reconnects
    pub fn reset_command(&mut self) {
        if let Some(session) = self.command.take() {
            self.teardown_command(session);
        }
    }

    /// Drop the file session so the next use reconnects
    pub fn reset_file(&mut self) {
        if let Some(session) = self.file.take() {
            self.teardown_file(session);
        }
    }

    /// Close both sessions
    pub fn disconnect(&mut self) {
        self.reset_command();
        self.reset_file();
    }

    fn teardown_command(&self, mut session: Box<dyn CommandSession>) {
        let node = self.ctx.node().to_string();
        let timeout = self.ctx.config.timing.teardown_timeout();
        let outcome = run_with_deadline("command-teardown", timeout, move || {
            session.disconnect();
        });
        if let Completion::Abandoned = outcome {
            warn!(node = %node, "Command session teardown exceeded {:?}; abandoned", timeout);
        }
    }

    fn teardown_file(&self, mut session: Box<dyn FileSession>) {
        let node = self.ctx.node().to_string();
        let timeout = self.ctx.config.timing.teardown_timeout();
        let outcome = run_with_deadline("file-teardown", timeout, move || {
            session.disconnect();
        });
        if let Completion::Abandoned = outcome {
            warn!(node = %node, "File session teardown exceeded {:?}; abandoned", timeout);
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::TimingConfig;
    use crate::transport::mock::MockHost;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::{Duration, Instant};

    pub(crate) fn fast_config() -> ProxyConfig {
        ProxyConfig {
            timing: TimingConfig {
                connect_attempts: 3,
                connect_retry_delay_ms: 0,
                retry_count: 2,
                retry_delay_ms: 0,
                poll_interval_ms: 0,
                teardown_timeout_ms: 1_000,
                reboot_grace_ms: 0,
                reboot_poll_interval_ms: 0,
                reboot_timeout_ms: 5_000,
                ..TimingConfig::default()
            },
            ..ProxyConfig::default()
        }
    }

    pub(crate) fn context(host: &MockHost) -> NodeContext {
        NodeContext {
            identity: Arc::new(NodeIdentity::new(
                "worker-0",
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 10)),
            )),
            credentials: Arc::new(RwLock::new(Credentials::password("sysadmin", "secret"))),
            config: Arc::new(fast_config()),
            factory: Arc::new(host.clone()),
            gate: Arc::new(HostGate::new()),
        }
    }

    #[test]
    fn test_sessions_are_reused() {
        let host = MockHost::new();
        let mut manager = SessionManager::new(context(&host));
        manager.ensure_command_session().unwrap();
        manager.ensure_command_session().unwrap();
        assert_eq!(host.connection_count(), 1);

        manager.ensure_file_session().unwrap();
        assert_eq!(host.connection_count(), 2);
    }

    #[test]
    fn test_dead_session_is_reopened() {
        let host = MockHost::new();
        let mut manager = SessionManager::new(context(&host));
        manager.ensure_command_session().unwrap();
        host.sever();
        manager.ensure_command_session().unwrap();
        assert_eq!(host.connection_count(), 2);
    }

    #[test]
    fn test_connect_retries_until_accepted() {
        let host = MockHost::new();
        host.refuse_connections(2);
        let mut manager = SessionManager::new(context(&host));
        assert!(manager.ensure_command_session().is_ok());
        assert_eq!(host.connection_count(), 3);
    }

    #[test]
    fn test_connect_gives_up() {
        let host = MockHost::new();
        host.refuse_connections(10);
        let mut manager = SessionManager::new(context(&host));
        let err = manager.ensure_command_session().err().unwrap();
        assert!(matches!(err, ProxyError::ConnectionFailed { attempts: 3, .. }));
    }

    #[test]
    fn test_auth_failure_is_not_retried() {
        let host = MockHost::new();
        host.set_password(Some("other"));
        let mut manager = SessionManager::new(context(&host));
        let err = manager.ensure_command_session().err().unwrap();
        assert!(err.is_auth_error());
        assert_eq!(host.connection_count(), 1);
    }

    #[test]
    fn test_single_attempt_reopen() {
        let host = MockHost::new();
        host.refuse_connections(1);
        let mut manager = SessionManager::new(context(&host));
        let err = manager.reopen_file_session_once().err().unwrap();
        assert!(matches!(err, ProxyError::ConnectionFailed { attempts: 1, .. }));
        assert!(manager.reopen_file_session_once().is_ok());
        assert_eq!(host.connection_count(), 2);
    }

    #[test]
    fn test_wedged_teardown_is_abandoned() {
        let host = MockHost::new();
        host.hang_on_disconnect(Duration::from_secs(5));
        let mut ctx = context(&host);
        ctx.config = Arc::new(ProxyConfig {
            timing: TimingConfig {
                teardown_timeout_ms: 50,
                ..fast_config().timing
            },
            ..fast_config()
        });
        let mut manager = SessionManager::new(ctx);
        manager.ensure_command_session().unwrap();
        manager.ensure_file_session().unwrap();

        let started = Instant::now();
        manager.disconnect();
        assert!(started.elapsed() < Duration::from_secs(2));

        // Both slots were emptied, so the next use dials fresh sessions
        host.hang_on_disconnect(Duration::ZERO);
        manager.ensure_command_session().unwrap();
        assert_eq!(host.connection_count(), 3);
    }

    #[test]
    fn test_public_address_is_dialed() {
        let host = MockHost::new();
        let mut ctx = context(&host);
        ctx.identity = Arc::new(
            NodeIdentity::new("worker-0", IpAddr::V4(Ipv4Addr::new(10, 0, 0, 10)))
                .with_public_address("worker-0.example.com"),
        );
        ctx.config = Arc::new(ProxyConfig {
            use_public_address: true,
            ..fast_config()
        });
        assert_eq!(ctx.connect_params().host, "worker-0.example.com");
    }
}
