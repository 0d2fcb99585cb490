/*!
 * hive-proxy - resilient remote command and file execution for hive nodes
 *
 * Runs shell commands and moves files on managed Linux nodes over SSH while
 * tolerating dropped connections, node restarts and concurrent callers:
 * - Commands run at most once, even when the connection drops mid-command
 * - Transport failures are absorbed by reconnect-and-retry
 * - Command bundles ship a script and its files as one archive
 * - Idempotent actions are recorded as marker files on the node
 * - A per-node fault state gates further work after a failure
 * - Reboots are confirmed by a marker on a volatile filesystem
 * - Every command is written to a per-node operation log
 */

pub mod bundle;
pub mod command;
pub mod config;
mod connection;
pub mod credentials;
mod docker;
pub mod error;
mod ledger;
pub mod logging;
pub mod node;
pub mod oplog;
pub mod options;
pub mod proxy;
mod reboot;
pub mod response;
mod retrying;
mod safe_exec;
pub mod status;
pub mod transport;

// Re-export commonly used types
pub use bundle::{CommandBundle, CommandFile};
pub use command::{CommandArg, FormattedCommand, REDACTED};
pub use config::{HiveConfig, LogConfig, LogFormat, ProxyConfig, TimingConfig};
pub use credentials::{Credentials, SshAuth};
pub use error::{ProxyError, Result};
pub use node::NodeIdentity;
pub use oplog::OperationLog;
pub use options::RunOptions;
pub use proxy::{NodeProxy, TransferOptions};
pub use response::{CommandOutput, CommandResponse};
pub use status::NodeState;

#[cfg(feature = "ssh")]
pub use transport::ssh::SshSessionFactory;

pub use hive_core_resilience::HostGate;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, env!("CARGO_PKG_VERSION"));
    }
}
