/*!
 * Configuration types for hive-proxy
 */

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::credentials::Credentials;
use crate::error::{ProxyError, Result};
use crate::node::NodeIdentity;

/// Timing policy for a node proxy. All values are milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// TCP connect + handshake bound
    pub connect_timeout_ms: u64,

    /// Bound on a single file transfer call
    pub file_timeout_ms: u64,

    /// Extra attempts for a session operation after a transport failure
    pub retry_count: u32,

    /// Pause between session operation retries
    pub retry_delay_ms: u64,

    /// Attempts to establish a single session
    pub connect_attempts: u32,

    /// Pause between connection attempts
    pub connect_retry_delay_ms: u64,

    /// Interval between checks for a finished remote command
    pub poll_interval_ms: u64,

    /// Overall bound on a remote command; unbounded when absent
    pub exec_timeout_ms: Option<u64>,

    /// Longest we wait for a session handle to dispose
    pub teardown_timeout_ms: u64,

    /// Pause after sending a reboot before the first boot check
    pub reboot_grace_ms: u64,

    /// Interval between boot checks
    pub reboot_poll_interval_ms: u64,

    /// Overall bound on waiting for a node to come back
    pub reboot_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            file_timeout_ms: 30_000,
            retry_count: 10,
            retry_delay_ms: 5_000,
            connect_attempts: 10,
            connect_retry_delay_ms: 5_000,
            poll_interval_ms: 5_000,
            exec_timeout_ms: None,
            teardown_timeout_ms: 30_000,
            reboot_grace_ms: 10_000,
            reboot_poll_interval_ms: 5_000,
            reboot_timeout_ms: 10 * 60 * 1_000,
        }
    }
}

impl TimingConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn file_timeout(&self) -> Duration {
        Duration::from_millis(self.file_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_millis(self.connect_retry_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn exec_timeout(&self) -> Option<Duration> {
        self.exec_timeout_ms.map(Duration::from_millis)
    }

    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_timeout_ms)
    }

    pub fn reboot_grace(&self) -> Duration {
        Duration::from_millis(self.reboot_grace_ms)
    }

    pub fn reboot_poll_interval(&self) -> Duration {
        Duration::from_millis(self.reboot_poll_interval_ms)
    }

    pub fn reboot_timeout(&self) -> Duration {
        Duration::from_millis(self.reboot_timeout_ms)
    }
}

/// Remote directory layout reserved for transient engine state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteLayout {
    /// World-writable scratch root for command and bundle folders
    pub exec_root: String,

    /// Root of the idempotent action markers
    pub state_root: String,

    /// Folder on a volatile filesystem; emptied by a real restart
    pub tmpfs_root: String,

    /// Parent of user home folders
    pub home_root: String,
}

impl Default for RemoteLayout {
    fn default() -> Self {
        Self {
            exec_root: "/var/lib/hive/exec".to_string(),
            state_root: "/var/lib/hive/state".to_string(),
            tmpfs_root: "/dev/shm/hive".to_string(),
            home_root: "/home".to_string(),
        }
    }
}

impl RemoteLayout {
    /// Scratch folder for one safe command execution
    pub fn command_folder(&self, token: &str) -> String {
        format!("{}/cmd/{}", self.exec_root.trim_end_matches('/'), token)
    }

    /// Scratch folder for one unpacked bundle
    pub fn bundle_folder(&self, token: &str) -> String {
        format!("{}/{}", self.exec_root.trim_end_matches('/'), token)
    }

    /// Reboot detection marker
    pub fn reboot_marker(&self) -> String {
        format!("{}/rebooting", self.tmpfs_root.trim_end_matches('/'))
    }
}

/// Retry policy for container orchestrator client commands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerRetryConfig {
    /// Total attempts
    pub attempts: u32,

    /// Pause between attempts
    pub delay_ms: u64,

    /// stderr substrings marking a failure as transient
    pub transient_errors: Vec<String>,
}

impl Default for DockerRetryConfig {
    fn default() -> Self {
        Self {
            attempts: 10,
            delay_ms: 15_000,
            transient_errors: vec![
                "i/o timeout".to_string(),
                "Client.Timeout exceeded".to_string(),
                "context deadline exceeded".to_string(),
                "TLS handshake timeout".to_string(),
                "timeout exceeded while awaiting headers".to_string(),
            ],
        }
    }
}

impl DockerRetryConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// Whether `stderr` contains one of the transient markers
    pub fn is_transient(&self, stderr: &str) -> bool {
        self.transient_errors
            .iter()
            .any(|marker| stderr.contains(marker.as_str()))
    }
}

/// Main configuration for node proxies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// The single cipher offered during SSH negotiation
    #[serde(default = "default_cipher")]
    pub cipher: String,

    /// Prepended to PATH for every command unless suppressed
    #[serde(default = "default_remote_path")]
    pub remote_path: String,

    /// Dial the public address instead of the private one
    #[serde(default)]
    pub use_public_address: bool,

    #[serde(default)]
    pub timing: TimingConfig,

    #[serde(default)]
    pub layout: RemoteLayout,

    #[serde(default)]
    pub docker: DockerRetryConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            timing: TimingConfig::default(),
            layout: RemoteLayout::default(),
            docker: DockerRetryConfig::default(),
            cipher: default_cipher(),
            remote_path: default_remote_path(),
            use_public_address: false,
        }
    }
}

fn default_cipher() -> String {
    "aes256-ctr".to_string()
}

fn default_remote_path() -> String {
    "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin:/snap/bin".to_string()
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration for the command line tool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// tracing level filter for the crate (error, warn, info, debug, trace)
    pub level: String,

    /// Diagnostic log file; stderr when absent
    pub file: Option<PathBuf>,

    /// Folder for per-node operation logs; disabled when absent
    pub operation_log_dir: Option<PathBuf>,

    /// Format of the per-node operation logs
    pub operation_log_format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            operation_log_dir: None,
            operation_log_format: LogFormat::Text,
        }
    }
}

/// One node entry in a hive file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDefinition {
    #[serde(flatten)]
    pub identity: NodeIdentity,

    pub username: String,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub key_file: Option<PathBuf>,
}

impl NodeDefinition {
    /// Build credentials; a key file wins over a password
    pub fn credentials(&self) -> Result<Credentials> {
        match (&self.key_file, &self.password) {
            (Some(key), _) => Ok(Credentials::key_file(&self.username, key)),
            (None, Some(password)) => Ok(Credentials::password(&self.username, password)),
            (None, None) => Err(ProxyError::Config(format!(
                "node '{}' has neither a password nor a key_file",
                self.identity.name
            ))),
        }
    }
}

/// File-level document: proxy policy, logging and the node list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct HiveConfig {
    #[serde(default)]
    pub proxy: ProxyConfig,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub nodes: Vec<NodeDefinition>,
}

impl HiveConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: HiveConfig = toml::from_str(contents)
            .map_err(|e| ProxyError::Config(format!("invalid hive file: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| ProxyError::Config(format!("failed to serialize: {}", e)))?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Look up a node by name
    pub fn node(&self, name: &str) -> Option<&NodeDefinition> {
        self.nodes.iter().find(|node| node.identity.name == name)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.identity.name.as_str()) {
                return Err(ProxyError::Config(format!(
                    "duplicate node name '{}'",
                    node.identity.name
                )));
            }
        }
        if self.proxy.timing.connect_attempts == 0 {
            return Err(ProxyError::Config(
                "timing.connect_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Default location of the hive file: `~/.config/hive-proxy/hive.toml`
pub fn default_hive_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("hive-proxy").join("hive.toml"))
}
