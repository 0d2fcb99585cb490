/*!
 * Error types for hive-proxy
 */

use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::transport::TransportError;

pub type Result<T> = std::result::Result<T, ProxyError>;

/// Exit code constants for the command line tool
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_REMOTE_FAILURE: i32 = 1;
pub const EXIT_FATAL: i32 = 2;

#[derive(Debug, Error)]
pub enum ProxyError {
    /// Connection dropped or refused while talking to the node
    #[error("transport failure on [{node}]: {source}")]
    Transport {
        node: String,
        #[source]
        source: TransportError,
    },

    /// Credentials rejected; never retried
    #[error("authentication failed on [{node}]: {message}")]
    Authentication { node: String, message: String },

    /// Every connection attempt failed
    #[error("unable to connect to [{node}] after {attempts} attempt(s): {message}")]
    ConnectionFailed {
        node: String,
        attempts: u32,
        message: String,
    },

    /// Remote command exited non-zero and the caller asked for a hard failure
    #[error("command on [{node}] failed with exit code {exit_code}: {command}{}", stderr_suffix(.stderr))]
    RemoteCommand {
        node: String,
        command: String,
        exit_code: i32,
        stderr: String,
    },

    /// Command rejected before any remote interaction
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    /// Command bundle rejected before any remote interaction
    #[error("invalid command bundle: {0}")]
    InvalidBundle(String),

    /// Idempotent action identifier rejected
    #[error("invalid action id '{0}'")]
    InvalidActionId(String),

    /// Operation exceeded its overall bound
    #[error("{operation} on [{node}] timed out after {elapsed:?}")]
    Timeout {
        node: String,
        operation: String,
        elapsed: Duration,
    },

    /// The remote side violated the execution protocol
    #[error("protocol error on [{node}]: {message}")]
    Protocol { node: String, message: String },

    /// Local I/O error (reading bundle files, building archives, log sinks)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

fn stderr_suffix(stderr: &str) -> String {
    let first = stderr.lines().find(|line| !line.trim().is_empty());
    match first {
        Some(line) => format!(" ({})", line.trim()),
        None => String::new(),
    }
}

impl ProxyError {
    /// Wrap a transport error, keeping authentication failures distinct
    pub fn from_transport(node: &str, err: TransportError) -> Self {
        match err {
            TransportError::Authentication { message, .. } => ProxyError::Authentication {
                node: node.to_string(),
                message,
            },
            source => ProxyError::Transport {
                node: node.to_string(),
                source,
            },
        }
    }

    /// Check if this error is transient (worth reconnecting and retrying)
    pub fn is_transient(&self) -> bool {
        match self {
            ProxyError::Transport { source, .. } => source.is_transient(),
            ProxyError::ConnectionFailed { .. } => true,

            // Not transient
            _ => false,
        }
    }

    pub fn is_auth_error(&self) -> bool {
        matches!(self, ProxyError::Authentication { .. })
    }

    /// Whether the remote file simply did not exist
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ProxyError::Transport {
                source: TransportError::NotFound { .. },
                ..
            }
        )
    }

    /// Get the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            ProxyError::RemoteCommand { exit_code, .. } if *exit_code > 0 => *exit_code,
            ProxyError::RemoteCommand { .. } => EXIT_REMOTE_FAILURE,
            _ => EXIT_FATAL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_is_kept_distinct() {
        let err = ProxyError::from_transport(
            "worker-1",
            TransportError::Authentication {
                username: "sysadmin".to_string(),
                message: "bad password".to_string(),
            },
        );
        assert!(err.is_auth_error());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_transport_is_transient() {
        let err = ProxyError::from_transport(
            "worker-1",
            TransportError::connection("10.0.0.1:22", "reset by peer"),
        );
        assert!(err.is_transient());
        assert!(!err.is_auth_error());
    }

    #[test]
    fn test_not_found() {
        let err = ProxyError::from_transport(
            "worker-1",
            TransportError::NotFound {
                path: "/etc/missing".to_string(),
            },
        );
        assert!(err.is_not_found());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_remote_command_display() {
        let err = ProxyError::RemoteCommand {
            node: "worker-1".to_string(),
            command: "docker ps".to_string(),
            exit_code: 125,
            stderr: "\nCannot connect to the Docker daemon\n".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "command on [worker-1] failed with exit code 125: docker ps (Cannot connect to the Docker daemon)"
        );
        assert_eq!(err.exit_code(), 125);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(ProxyError::Config("x".to_string()).exit_code(), EXIT_FATAL);
        let err = ProxyError::RemoteCommand {
            node: "n".to_string(),
            command: "c".to_string(),
            exit_code: -1,
            stderr: String::new(),
        };
        assert_eq!(err.exit_code(), EXIT_REMOTE_FAILURE);
    }
}
