//! Transport seam between the engine and a remote-shell client
//!
//! The engine only needs two kinds of session to a node: a command session
//! that runs one shell line at a time, and a file session that moves whole
//! files. Both are opened through a [`SessionFactory`] so the SSH client can
//! be swapped for the in-memory `mock::MockHost` in tests (feature `mock`).

#[cfg(any(test, feature = "mock"))]
pub mod mock;
#[cfg(feature = "ssh")]
pub mod ssh;

use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::credentials::SshAuth;

/// Result type alias for transport operations
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Errors raised by a transport implementation
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection refused, dropped, or the handshake failed
    #[error("connection to {endpoint} failed: {message}")]
    Connection { endpoint: String, message: String },

    /// The server rejected the credentials
    #[error("authentication as {username} failed: {message}")]
    Authentication { username: String, message: String },

    /// A session operation did not complete in time
    #[error("{operation} timed out")]
    Timeout { operation: String },

    /// Remote file does not exist
    #[error("remote path not found: {path}")]
    NotFound { path: String },

    /// Remote file exists but is not accessible
    #[error("permission denied: {path}")]
    PermissionDenied { path: String },

    /// The server answered with an error unrelated to connectivity
    #[error("remote error: {0}")]
    Remote(String),

    /// Socket-level I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Convenience constructor for connection-class failures
    pub fn connection(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        TransportError::Connection {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    /// Whether reconnecting and trying again can plausibly help
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Connection { .. } => true,
            TransportError::Timeout { .. } => true,
            TransportError::Io(_) => true,

            TransportError::Authentication { .. } => false,
            TransportError::NotFound { .. } => false,
            TransportError::PermissionDenied { .. } => false,
            TransportError::Remote(_) => false,
        }
    }

    pub fn is_auth_error(&self) -> bool {
        matches!(self, TransportError::Authentication { .. })
    }
}

/// Which of the two per-node sessions an operation uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKind {
    Command,
    File,
}

impl std::fmt::Display for SessionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionKind::Command => write!(f, "command"),
            SessionKind::File => write!(f, "file"),
        }
    }
}

/// Everything a factory needs to open a session
#[derive(Debug, Clone)]
pub struct ConnectParams {
    /// Node display name, for logs
    pub node: String,
    /// Address actually dialed
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: SshAuth,
    /// TCP connect and handshake bound
    pub connect_timeout: Duration,
    /// Bound on a single blocking session call once connected
    pub operation_timeout: Duration,
    /// The only cipher offered during negotiation
    pub cipher: String,
}

impl ConnectParams {
    /// `host:port` rendering used in errors
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Raw result of running one shell line
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// A session that runs shell lines on the node
pub trait CommandSession: Send {
    /// Whether the handle still believes it is connected
    fn is_connected(&self) -> bool;

    /// Run `command` through the remote login shell and wait for it to exit
    fn exec(&mut self, command: &str) -> TransportResult<ExecOutput>;

    /// Close the session. Must tolerate an already-dead connection.
    fn disconnect(&mut self);
}

/// A session that moves whole files to and from the node
pub trait FileSession: Send {
    fn is_connected(&self) -> bool;

    /// Create or truncate `path` with `data`, applying `mode` if given
    fn upload(&mut self, path: &str, data: &[u8], mode: Option<i32>) -> TransportResult<()>;

    fn download(&mut self, path: &str) -> TransportResult<Vec<u8>>;

    /// Whether `path` exists (file or directory)
    fn exists(&mut self, path: &str) -> TransportResult<bool>;

    fn disconnect(&mut self);
}

/// Opens sessions to a node
pub trait SessionFactory: Send + Sync {
    fn open_command(&self, params: &ConnectParams) -> TransportResult<Box<dyn CommandSession>>;

    fn open_file(&self, params: &ConnectParams) -> TransportResult<Box<dyn FileSession>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(TransportError::connection("10.0.0.1:22", "reset").is_transient());
        assert!(TransportError::Timeout {
            operation: "exec".to_string()
        }
        .is_transient());
        assert!(TransportError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "pipe")).is_transient());

        let auth = TransportError::Authentication {
            username: "sysadmin".to_string(),
            message: "denied".to_string(),
        };
        assert!(!auth.is_transient());
        assert!(auth.is_auth_error());
        assert!(!TransportError::NotFound {
            path: "/x".to_string()
        }
        .is_transient());
    }

    #[test]
    fn test_error_display() {
        let err = TransportError::connection("10.0.0.1:22", "handshake failed");
        assert_eq!(
            err.to_string(),
            "connection to 10.0.0.1:22 failed: handshake failed"
        );
    }

    #[test]
    fn test_exec_output_text() {
        let output = ExecOutput {
            exit_code: 0,
            stdout: b"hello\n".to_vec(),
            stderr: Vec::new(),
        };
        assert!(output.success());
        assert_eq!(output.stdout_text(), "hello\n");
    }
}
