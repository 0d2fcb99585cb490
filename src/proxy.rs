/*!
 * Node proxy: the caller-facing handle to one node
 *
 * A [`NodeProxy`] runs commands and bundles, moves files and tracks the
 * node's readiness and fault state. One instance is meant for one caller at
 * a time; clone it to work on the same node from several threads. Clones
 * open their own sessions and start with a fresh state, but share identity,
 * credentials, configuration, the host gate, the operation log and the
 * metadata.
 *
 * # Example
 *
 * ```no_run
 * use std::sync::Arc;
 * use hive_proxy::transport::mock::MockHost;
 * use hive_proxy::{args, Credentials, NodeIdentity, NodeProxy, ProxyConfig};
 *
 * let host = MockHost::new();
 * let identity = NodeIdentity::new("worker-0", "10.0.0.10".parse().unwrap());
 * let mut proxy = NodeProxy::new(
 *     identity,
 *     Credentials::password("sysadmin", "secret"),
 *     ProxyConfig::default(),
 *     Arc::new(host),
 * );
 *
 * let response = proxy.run_command("echo", &args!["hello"]).unwrap();
 * assert_eq!(response.output_text(), Some("hello\n"));
 * ```
 */

use std::sync::{Arc, RwLock};
use std::time::Instant;

use hive_core_resilience::HostGate;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bundle::{CommandBundle, ARCHIVE_NAME, RUN_SCRIPT};
use crate::command::{escape, CommandArg, FormattedCommand, REDACTED};
use crate::config::ProxyConfig;
use crate::connection::{NodeContext, SessionManager};
use crate::credentials::Credentials;
use crate::error::{ProxyError, Result};
use crate::node::NodeIdentity;
use crate::oplog::{OperationLog, RecordKind};
use crate::options::RunOptions;
use crate::response::{CommandOutput, CommandResponse};
use crate::status::{NodeState, NodeStatus};
use crate::transport::SessionFactory;

/// Options for file transfers and remote folder creation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferOptions {
    /// Stage through the per-user folders and place or fetch with `sudo`
    pub elevated: bool,
    /// `chmod` argument applied after placement, e.g. `"640"`
    pub permissions: Option<String>,
    /// `chown` argument applied after placement, e.g. `"root:root"`
    pub owner: Option<String>,
    /// Expand tabs to this stop when uploading text
    pub tab_stop: Option<usize>,
}

impl TransferOptions {
    pub fn elevated() -> Self {
        Self {
            elevated: true,
            ..Default::default()
        }
    }

    pub fn with_permissions(mut self, permissions: impl Into<String>) -> Self {
        self.permissions = Some(permissions.into());
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn with_tab_stop(mut self, tab_stop: usize) -> Self {
        self.tab_stop = Some(tab_stop);
        self
    }
}

/// A line to run plus how it is shown in responses and logs
#[derive(Debug, Clone)]
pub(crate) struct Invocation {
    pub line: String,
    pub command_line: String,
    pub bash_command: String,
    /// Keep out of the operation log entirely
    pub quiet: bool,
}

impl Invocation {
    pub fn plain(command: &FormattedCommand) -> Self {
        Self {
            line: command.command_line(),
            command_line: command.command_line(),
            bash_command: command.bash_command(),
            quiet: false,
        }
    }

    /// Engine bookkeeping, shown as-is
    pub fn internal(line: impl Into<String>) -> Self {
        let line = line.into();
        Self {
            command_line: line.clone(),
            bash_command: line.clone(),
            line,
            quiet: false,
        }
    }

    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    fn shown(&self, redact: bool) -> (String, String) {
        if redact {
            (REDACTED.to_string(), REDACTED.to_string())
        } else {
            (self.command_line.clone(), self.bash_command.clone())
        }
    }
}

/// Normalize line endings and optionally expand tabs
pub(crate) fn prepare_text(text: &str, tab_stop: Option<usize>) -> String {
    let text = text.replace("\r\n", "\n");
    let Some(tab_stop) = tab_stop.filter(|stop| *stop > 0) else {
        return text;
    };

    let mut expanded = String::with_capacity(text.len());
    let mut column = 0;
    for ch in text.chars() {
        match ch {
            '\t' => {
                let pad = tab_stop - column % tab_stop;
                expanded.extend(std::iter::repeat(' ').take(pad));
                column += pad;
            }
            '\n' => {
                expanded.push(ch);
                column = 0;
            }
            _ => {
                expanded.push(ch);
                column += 1;
            }
        }
    }
    expanded
}

fn parent_folder(path: &str) -> &str {
    match path.trim_end_matches('/').rsplit_once('/') {
        Some(("", _)) => "/",
        Some((parent, _)) => parent,
        None => ".",
    }
}

/// Handle to one node, carrying caller metadata of type `M`
pub struct NodeProxy<M = ()> {
    pub(crate) sessions: SessionManager,
    pub(crate) status: NodeStatus,
    defaults: RunOptions,
    log: OperationLog,
    metadata: Arc<M>,
}

impl<M> std::fmt::Debug for NodeProxy<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeProxy")
            .field("node", &self.name())
            .field("state", &self.status.state())
            .field("defaults", &self.defaults)
            .finish()
    }
}

impl NodeProxy<()> {
    /// Create a proxy that arbitrates connections through the process-wide
    /// host gate
    pub fn new(
        identity: NodeIdentity,
        credentials: Credentials,
        config: ProxyConfig,
        factory: Arc<dyn SessionFactory>,
    ) -> Self {
        let ctx = NodeContext {
            identity: Arc::new(identity),
            credentials: Arc::new(RwLock::new(credentials)),
            config: Arc::new(config),
            factory,
            gate: HostGate::global(),
        };

        Self {
            sessions: SessionManager::new(ctx),
            status: NodeStatus::default(),
            defaults: RunOptions::none(),
            log: OperationLog::discard(),
            metadata: Arc::new(()),
        }
    }
}

impl<M> Clone for NodeProxy<M> {
    fn clone(&self) -> Self {
        Self {
            sessions: SessionManager::new(self.sessions.ctx.clone()),
            status: NodeStatus::default(),
            defaults: self.defaults,
            log: self.log.clone(),
            metadata: Arc::clone(&self.metadata),
        }
    }
}

impl<M> NodeProxy<M> {
    /// Attach caller metadata
    pub fn with_metadata<N>(self, metadata: N) -> NodeProxy<N> {
        NodeProxy {
            sessions: self.sessions,
            status: self.status,
            defaults: self.defaults,
            log: self.log,
            metadata: Arc::new(metadata),
        }
    }

    /// Use a specific connection arbitration gate instead of the global one
    pub fn with_host_gate(mut self, gate: Arc<HostGate>) -> Self {
        self.sessions.ctx.gate = gate;
        self
    }

    pub fn with_operation_log(mut self, log: OperationLog) -> Self {
        self.log = log;
        self
    }

    /// Options merged into every call that asks for the defaults
    pub fn with_default_options(mut self, defaults: RunOptions) -> Self {
        self.defaults = RunOptions {
            use_defaults: false,
            ..defaults
        };
        self
    }

    pub fn name(&self) -> &str {
        self.sessions.node()
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.sessions.ctx.identity
    }

    pub fn config(&self) -> &ProxyConfig {
        self.sessions.config()
    }

    pub fn metadata(&self) -> &M {
        &self.metadata
    }

    pub fn default_options(&self) -> RunOptions {
        self.defaults
    }

    pub fn operation_log(&self) -> &OperationLog {
        &self.log
    }

    /// Replace the credentials for the next connection. Open sessions are
    /// kept; clones see the new credentials too.
    pub fn update_credentials(&mut self, credentials: Credentials) {
        debug!(node = %self.name(), "Credentials updated for {}", credentials.username);
        *self
            .sessions
            .ctx
            .credentials
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = credentials;
    }

    /// Open both sessions and mark the node ready
    pub fn connect(&mut self) -> Result<()> {
        self.set_status("connecting");
        self.sessions.ensure_command_session()?;
        self.sessions.ensure_file_session()?;
        self.status.mark_ready();
        self.set_status("connected");
        info!(node = %self.name(), "Connected");
        Ok(())
    }

    /// Close both sessions with a bounded wait
    pub fn disconnect(&mut self) {
        self.sessions.disconnect();
    }

    // ---- state ----

    pub fn state(&self) -> NodeState {
        self.status.state()
    }

    /// First line of the last status, or the fault banner
    pub fn status(&self) -> String {
        self.status.display()
    }

    pub fn set_status(&mut self, status: impl Into<String>) {
        let status = status.into();
        debug!(node = %self.name(), status = %status.lines().next().unwrap_or_default(), "Status changed");
        self.status.set_status(status);
    }

    pub fn is_ready(&self) -> bool {
        self.status.is_ready()
    }

    pub fn is_faulted(&self) -> bool {
        self.status.is_faulted()
    }

    pub fn fault_message(&self) -> Option<&str> {
        self.status.fault_message()
    }

    /// Put the node into the faulted state. Only the first message is kept.
    pub fn fault(&mut self, message: &str) {
        if !self.status.is_faulted() {
            error!(node = %self.name(), "Node faulted: {}", message);
            let node = self.name().to_string();
            self.record(self.log.fault(&node, message));
        }
        self.status.fault(Some(message.to_string()));
    }

    /// Append a free-form line to the operation log
    pub fn log_line(&self, text: &str) {
        self.record(self.log.line(self.name(), text));
    }

    fn record(&self, result: Result<()>) {
        if let Err(err) = result {
            warn!(node = %self.name(), "Operation log write failed: {}", err);
        }
    }

    // ---- commands ----

    pub fn run_command(&mut self, command: &str, args: &[CommandArg]) -> Result<CommandResponse> {
        self.run_command_with(RunOptions::default(), command, args)
    }

    /// Run a command with explicit options.
    ///
    /// A non-zero exit code is returned as data unless `fault_on_error` is
    /// set, in which case the node is faulted and the call fails.
    pub fn run_command_with(
        &mut self,
        options: RunOptions,
        command: &str,
        args: &[CommandArg],
    ) -> Result<CommandResponse> {
        let formatted = FormattedCommand::new(command, args);
        formatted.check_redirection()?;
        let options = options.merged(self.defaults);
        self.execute(options, Invocation::plain(&formatted))
    }

    pub fn sudo_command(&mut self, command: &str, args: &[CommandArg]) -> Result<CommandResponse> {
        self.run_command_with(RunOptions::default().elevated(), command, args)
    }

    pub fn sudo_command_with(
        &mut self,
        options: RunOptions,
        command: &str,
        args: &[CommandArg],
    ) -> Result<CommandResponse> {
        self.run_command_with(options.elevated(), command, args)
    }

    /// Core dispatch: fault gate, safe execution, logging, fault-on-error
    pub(crate) fn execute(&mut self, options: RunOptions, invocation: Invocation) -> Result<CommandResponse> {
        let node = self.name().to_string();
        let (command_line, bash_command) = invocation.shown(options.redact);

        if self.status.is_faulted() && !options.run_when_faulted {
            debug!(node = %node, "Skipping on faulted node: {}", command_line);
            return Ok(CommandResponse::skipped(&node, command_line, bash_command));
        }

        if options.shutdown {
            return self.send_once(options, &invocation.line, command_line, bash_command);
        }

        let log_all = !invocation.quiet && !options.log_on_error_only;
        if log_all {
            self.record(self.log.command_start(&node, &command_line));
        }

        debug!(node = %node, elevated = options.elevated, "Running: {}", command_line);
        let started = Instant::now();
        let output = match self.sessions.safe_exec(&invocation.line, options.elevated, !options.no_remote_path) {
            Ok(output) => {
                self.status.mark_ready();
                output
            }
            Err(err) => {
                if !invocation.quiet {
                    self.record(self.log.line(&node, &format!("{}: {}", command_line, err)));
                }
                return Err(err);
            }
        };
        let elapsed = started.elapsed();

        let response = CommandResponse {
            node: node.clone(),
            command_line,
            bash_command,
            exit_code: output.exit_code,
            output: if options.binary_output {
                CommandOutput::Binary(output.stdout)
            } else {
                CommandOutput::Text(String::from_utf8_lossy(&output.stdout).into_owned())
            },
            error_text: String::from_utf8_lossy(&output.stderr).into_owned(),
            already_faulted: false,
        };

        let failed = !response.success();
        if !invocation.quiet && (log_all || failed) {
            if !log_all {
                self.record(self.log.command_start(&node, &response.command_line));
            }
            if !options.redact && (failed || options.log_output) {
                if let Some(text) = response.output_text() {
                    self.record(self.log.output(&node, RecordKind::Stdout, text));
                }
                self.record(self.log.output(&node, RecordKind::Stderr, &response.error_text));
            }
            self.record(self.log.command_end(&node, &response.command_line, response.exit_code, elapsed));
        }

        if failed && options.fault_on_error {
            self.fault(&response.error_summary());
            return Err(response.to_error());
        }

        Ok(response)
    }

    /// Shutdown-class lines are sent exactly once. A dropped connection
    /// while sending is the expected outcome and counts as delivered.
    fn send_once(
        &mut self,
        options: RunOptions,
        line: &str,
        command_line: String,
        bash_command: String,
    ) -> Result<CommandResponse> {
        let node = self.name().to_string();
        let line = if options.elevated {
            format!("sudo {}", line)
        } else {
            line.to_string()
        };

        self.record(self.log.command_start(&node, &command_line));
        let output = match self.sessions.exec_once(&line) {
            Ok(output) => output,
            Err(ProxyError::Transport { source, .. }) => {
                debug!(node = %node, "Connection closed while sending '{}': {}", command_line, source);
                Default::default()
            }
            Err(err) => return Err(err),
        };
        self.sessions.disconnect();

        Ok(CommandResponse {
            node,
            command_line,
            bash_command,
            exit_code: output.exit_code,
            output: CommandOutput::Text(output.stdout_text()),
            error_text: output.stderr_text(),
            already_faulted: false,
        })
    }

    /// Engine bookkeeping: never fault-gated, logged only on failure
    pub(crate) fn run_internal(&mut self, line: impl Into<String>, elevated: bool) -> Result<CommandResponse> {
        let mut options = RunOptions::none().run_when_faulted().log_on_error_only();
        options.elevated = elevated;
        let response = self.execute(options, Invocation::internal(line))?;
        if response.success() {
            Ok(response)
        } else {
            Err(response.to_error())
        }
    }

    /// Engine check whose exit code is the answer
    pub(crate) fn check_internal(&mut self, line: impl Into<String>, elevated: bool) -> Result<bool> {
        let mut options = RunOptions::none().run_when_faulted();
        options.elevated = elevated;
        let response = self.execute(options, Invocation::internal(line).quiet())?;
        Ok(response.success())
    }

    // ---- bundles ----

    pub fn run_bundle(&mut self, bundle: &CommandBundle) -> Result<CommandResponse> {
        self.run_bundle_with(RunOptions::default(), bundle)
    }

    pub fn sudo_bundle(&mut self, bundle: &CommandBundle) -> Result<CommandResponse> {
        self.run_bundle_with(RunOptions::default().elevated(), bundle)
    }

    /// Upload, unpack and run a bundle from a fresh folder, then remove it
    pub fn run_bundle_with(&mut self, options: RunOptions, bundle: &CommandBundle) -> Result<CommandResponse> {
        let options = options.merged(self.defaults);
        let archive = bundle.to_archive(options.elevated)?;

        let entry = bundle.formatted();
        let node = self.name().to_string();
        let token = Uuid::new_v4().simple().to_string();
        let folder = self.config().layout.bundle_folder(&token);
        let dir = escape(&folder);

        let invocation = Invocation {
            line: format!("cd {} && ./{}", dir, RUN_SCRIPT),
            command_line: entry.command_line(),
            bash_command: entry.bash_command(),
            quiet: false,
        };

        if self.status.is_faulted() && !options.run_when_faulted {
            let (command_line, bash_command) = invocation.shown(options.redact);
            return Ok(CommandResponse::skipped(&node, command_line, bash_command));
        }

        debug!(node = %node, "Staging bundle with {} file(s) in {}", bundle.files().len(), folder);
        let result = self
            .stage_bundle(&folder, &archive, options.elevated)
            .and_then(|_| self.execute(options, invocation));

        if let Err(err) = self.run_internal(format!("rm -rf {}", dir), options.elevated) {
            warn!(node = %node, "Could not remove bundle folder {}: {}", folder, err);
        }

        result
    }

    fn stage_bundle(&mut self, folder: &str, archive: &[u8], elevated: bool) -> Result<()> {
        let dir = escape(folder);
        self.run_internal(format!("mkdir -p {dir} && chmod 777 {dir}"), false)?;
        self.sessions
            .upload(&format!("{}/{}", folder, ARCHIVE_NAME), archive, Some(0o644))?;
        self.run_internal(
            format!(
                "cd {} && tar -xzf {} && chmod 700 {}",
                dir, ARCHIVE_NAME, RUN_SCRIPT
            ),
            elevated,
        )?;
        Ok(())
    }

    // ---- files ----

    fn home_folder(&self) -> String {
        self.sessions
            .ctx
            .credentials()
            .home_folder(&self.config().layout.home_root)
    }

    fn staging_path(&mut self, folder: &str) -> Result<String> {
        let staging = format!("{}/{}", self.home_folder(), folder);
        self.run_internal(format!("mkdir -p {}", escape(&staging)), false)?;
        Ok(format!("{}/{}", staging, Uuid::new_v4().simple()))
    }

    /// Upload `data` to `path`.
    ///
    /// Elevated uploads go to `~/.upload` first and are moved into place with
    /// `sudo`, creating the destination folder.
    pub fn upload_bytes(&mut self, path: &str, data: &[u8], options: &TransferOptions) -> Result<()> {
        debug!(node = %self.name(), "Uploading {} byte(s) to {}", data.len(), path);

        if options.elevated {
            let staged = self.staging_path(".upload")?;
            self.sessions.upload(&staged, data, None)?;

            let placed = self.run_internal(
                format!(
                    "mkdir -p {} && mv {} {}",
                    escape(parent_folder(path)),
                    escape(&staged),
                    escape(path)
                ),
                true,
            );
            if placed.is_err() {
                if let Err(err) = self.run_internal(format!("rm -f {}", escape(&staged)), true) {
                    warn!(node = %self.name(), "Could not remove staged upload {}: {}", staged, err);
                }
            }
            placed?;
        } else {
            self.sessions.upload(path, data, None)?;
            self.status.mark_ready();
        }

        self.apply_attributes(path, options)
    }

    /// Upload text with LF line endings, expanding tabs when asked
    pub fn upload_text(&mut self, path: &str, text: &str, options: &TransferOptions) -> Result<()> {
        let text = prepare_text(text, options.tab_stop);
        self.upload_bytes(path, text.as_bytes(), options)
    }

    /// Download `path`.
    ///
    /// Elevated downloads copy the file into `~/.download` with `sudo` first;
    /// the copy is removed whether or not the download succeeds.
    pub fn download_bytes(&mut self, path: &str, options: &TransferOptions) -> Result<Vec<u8>> {
        debug!(node = %self.name(), "Downloading {}", path);

        if !options.elevated {
            let data = self.sessions.download(path)?;
            self.status.mark_ready();
            return Ok(data);
        }

        let staged = self.staging_path(".download")?;
        let staged_arg = escape(&staged);
        let result = self
            .run_internal(
                format!("cp {} {} && chmod 444 {}", escape(path), staged_arg, staged_arg),
                true,
            )
            .and_then(|_| self.sessions.download(&staged));

        if let Err(err) = self.run_internal(format!("rm -f {}", staged_arg), true) {
            warn!(node = %self.name(), "Could not remove staged download {}: {}", staged, err);
        }

        result
    }

    pub fn download_text(&mut self, path: &str, options: &TransferOptions) -> Result<String> {
        let data = self.download_bytes(path, options)?;
        String::from_utf8(data).map_err(|_| ProxyError::Protocol {
            node: self.name().to_string(),
            message: format!("{} is not UTF-8 text", path),
        })
    }

    pub fn file_exists(&mut self, path: &str) -> Result<bool> {
        self.check_internal(format!("test -f {}", escape(path)), true)
    }

    pub fn directory_exists(&mut self, path: &str) -> Result<bool> {
        self.check_internal(format!("test -d {}", escape(path)), true)
    }

    /// `mkdir -p`, then apply the requested mode and owner
    pub fn create_directory(&mut self, path: &str, options: &TransferOptions) -> Result<()> {
        self.run_internal(format!("mkdir -p {}", escape(path)), options.elevated)?;
        self.apply_attributes(path, options)
    }

    /// Remove a file or folder tree; missing paths are fine
    pub fn remove_path(&mut self, path: &str) -> Result<()> {
        self.run_internal(format!("rm -rf {}", escape(path)), true)?;
        Ok(())
    }

    fn apply_attributes(&mut self, path: &str, options: &TransferOptions) -> Result<()> {
        if let Some(permissions) = &options.permissions {
            self.run_internal(
                format!("chmod {} {}", escape(permissions), escape(path)),
                options.elevated,
            )?;
        }
        if let Some(owner) = &options.owner {
            self.run_internal(format!("chown {} {}", escape(owner), escape(path)), options.elevated)?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::args;
    use crate::config::LogFormat;
    use crate::connection::tests::fast_config;
    use crate::logging::init_test_logging;
    use crate::transport::mock::{MockHost, MockOutput};

    pub(crate) fn proxy(host: &MockHost) -> NodeProxy {
        init_test_logging();
        NodeProxy::new(
            NodeIdentity::new("worker-0", "10.0.0.10".parse().unwrap()),
            Credentials::password("sysadmin", "secret"),
            fast_config(),
            Arc::new(host.clone()),
        )
        .with_host_gate(Arc::new(HostGate::new()))
        .with_operation_log(OperationLog::in_memory(LogFormat::Text))
    }

    #[test]
    fn test_prepare_text() {
        assert_eq!(prepare_text("a\r\nb\r\n", None), "a\nb\n");
        assert_eq!(prepare_text("a\tb\n\tc", Some(4)), "a   b\n    c");
        assert_eq!(prepare_text("abcd\te", Some(4)), "abcd    e");
        assert_eq!(prepare_text("a\tb", Some(0)), "a\tb");
    }

    #[test]
    fn test_parent_folder() {
        assert_eq!(parent_folder("/etc/app/app.conf"), "/etc/app");
        assert_eq!(parent_folder("/motd"), "/");
        assert_eq!(parent_folder("notes.txt"), ".");
    }

    #[test]
    fn test_connect_marks_ready() {
        let host = MockHost::new();
        let mut proxy = proxy(&host);
        assert_eq!(proxy.state(), NodeState::Connecting);
        proxy.connect().unwrap();
        assert!(proxy.is_ready());
        assert_eq!(host.connection_count(), 2);
    }

    #[test]
    fn test_first_command_marks_ready() {
        let host = MockHost::new();
        let mut proxy = proxy(&host);

        proxy.run_command("true", &args![]).unwrap();
        assert_eq!(proxy.state(), NodeState::Ready);

        proxy.fault("broken");
        proxy
            .run_command_with(RunOptions::default().run_when_faulted(), "true", &args![])
            .unwrap();
        assert_eq!(proxy.state(), NodeState::Faulted);
    }

    #[test]
    fn test_plain_transfer_marks_ready() {
        let host = MockHost::new();
        let mut proxy = proxy(&host);

        proxy
            .upload_bytes("/tmp/x", b"x", &TransferOptions::default())
            .unwrap();
        assert!(proxy.is_ready());
    }

    #[test]
    fn test_run_command_output() {
        let host = MockHost::new();
        let mut proxy = proxy(&host);

        let response = proxy.run_command("echo", &args!["hello world"]).unwrap();
        assert!(response.success());
        assert_eq!(response.command_line(), r#"echo "hello world""#);
        assert_eq!(response.bash_command(), "echo 'hello world'");
        assert_eq!(response.output_text(), Some("hello world\n"));
        assert_eq!(response.node(), "worker-0");
    }

    #[test]
    fn test_redirection_rejected_without_contact() {
        let host = MockHost::new();
        let mut proxy = proxy(&host);

        let err = proxy.run_command("echo hi > /tmp/x", &[]).unwrap_err();
        assert!(matches!(err, ProxyError::InvalidCommand(_)));
        assert_eq!(host.connection_count(), 0);
    }

    #[test]
    fn test_failure_is_data_by_default() {
        let host = MockHost::new();
        let mut proxy = proxy(&host);

        let response = proxy.run_command("cat", &args!["/nope"]).unwrap();
        assert_eq!(response.exit_code(), 1);
        assert!(response.error_text().contains("No such file"));
        assert!(!proxy.is_faulted());

        let log = proxy.operation_log().contents().unwrap();
        assert!(log.contains("STDERR"));
        assert!(log.contains("[exitcode=1]"));
    }

    #[test]
    fn test_fault_on_error() {
        let host = MockHost::new();
        let mut proxy = proxy(&host);

        let err = proxy
            .run_command_with(RunOptions::default().fault_on_error(), "cat", &args!["/nope"])
            .unwrap_err();
        assert!(matches!(err, ProxyError::RemoteCommand { exit_code: 1, .. }));
        assert!(proxy.is_faulted());
        assert!(proxy.status().starts_with("*** FAULT: [exitcode=1]: cat:"));
        assert!(proxy.operation_log().contents().unwrap().contains("FAULT:"));
    }

    #[test]
    fn test_default_options_apply() {
        let host = MockHost::new();
        let mut proxy = proxy(&host).with_default_options(RunOptions::none().fault_on_error());

        assert!(proxy.run_command("false", &[]).is_err());
        assert!(proxy.is_faulted());
    }

    #[test]
    fn test_faulted_node_skips_commands() {
        let host = MockHost::new();
        let mut proxy = proxy(&host);
        proxy.fault("disk full");
        let before = host.exec_count();

        let response = proxy.run_command("touch", &args!["/tmp/x"]).unwrap();
        assert!(response.already_faulted());
        assert_eq!(response.exit_code(), 1);
        assert_eq!(host.exec_count(), before);
        assert!(!host.exists("/tmp/x"));

        let response = proxy
            .run_command_with(RunOptions::default().run_when_faulted(), "touch", &args!["/tmp/x"])
            .unwrap();
        assert!(response.success());
        assert!(host.exists("/tmp/x"));
        assert_eq!(proxy.status(), "*** FAULT: disk full");
    }

    #[test]
    fn test_redacted_command_never_logged() {
        let host = MockHost::new();
        let mut proxy = proxy(&host);

        let response = proxy
            .run_command_with(
                RunOptions::default().redact().log_output(),
                "echo",
                &args!["s3cr3t-token"],
            )
            .unwrap();
        assert_eq!(response.command_line(), REDACTED);
        assert_eq!(response.bash_command(), REDACTED);
        assert_eq!(response.output_text(), Some("s3cr3t-token\n"));

        let log = proxy.operation_log().contents().unwrap();
        assert!(log.contains(REDACTED));
        assert!(!log.contains("s3cr3t"));
    }

    #[test]
    fn test_log_on_error_only() {
        let host = MockHost::new();
        let mut proxy = proxy(&host);

        proxy
            .run_command_with(RunOptions::default().log_on_error_only(), "true", &[])
            .unwrap();
        assert_eq!(proxy.operation_log().contents().unwrap(), "");

        proxy
            .run_command_with(RunOptions::default().log_on_error_only(), "false", &[])
            .unwrap();
        let log = proxy.operation_log().contents().unwrap();
        assert!(log.contains("START: false"));
        assert!(log.contains("END: false [exitcode=1]"));
    }

    #[test]
    fn test_binary_output() {
        let host = MockHost::new();
        host.add_file("/tmp/blob", &[0, 159, 146, 150]);
        let mut proxy = proxy(&host);

        let response = proxy
            .run_command_with(RunOptions::default().binary_output(), "cat", &args!["/tmp/blob"])
            .unwrap();
        assert_eq!(response.output_binary(), Some(&[0u8, 159, 146, 150][..]));
    }

    #[test]
    fn test_sudo_command() {
        let host = MockHost::new();
        let mut proxy = proxy(&host);

        proxy.sudo_command("touch", &args!["/etc/flag"]).unwrap();
        assert!(host.exists("/etc/flag"));
        assert!(host
            .exec_log()
            .iter()
            .any(|line| line.contains("sudo nohup bash")));
    }

    #[test]
    fn test_bundle_runs_and_cleans_up() {
        let host = MockHost::new();
        let mut proxy = proxy(&host);

        let mut bundle = CommandBundle::new("./hello.sh", args![]);
        bundle.add_file("hello.sh", "#!/bin/bash\r\ncat greeting.txt\r\n", true);
        bundle.add_file("greeting.txt", "hello from bundle\n", false);

        let response = proxy.run_bundle(&bundle).unwrap();
        assert!(response.success(), "{}", response.all_text());
        assert_eq!(response.output_text(), Some("hello from bundle\n"));
        assert_eq!(response.command_line(), "./hello.sh");

        let leftovers: Vec<_> = host
            .list("/var/lib/hive/exec")
            .into_iter()
            .filter(|path| !path.starts_with("/var/lib/hive/exec/cmd"))
            .collect();
        assert!(leftovers.is_empty(), "{:?}", leftovers);
    }

    #[test]
    fn test_invalid_bundle_rejected_without_contact() {
        let host = MockHost::new();
        let mut proxy = proxy(&host);

        let mut bundle = CommandBundle::new("./x.sh", args![]);
        bundle.add_file("/abs/x.sh", "echo", true);
        assert!(matches!(
            proxy.run_bundle(&bundle),
            Err(ProxyError::InvalidBundle(_))
        ));
        assert_eq!(host.connection_count(), 0);
    }

    #[test]
    fn test_bundle_on_faulted_node_is_skipped() {
        let host = MockHost::new();
        let mut proxy = proxy(&host);
        proxy.fault("broken");

        let bundle = CommandBundle::new("true", args![]);
        let response = proxy.run_bundle(&bundle).unwrap();
        assert!(response.already_faulted());
        assert_eq!(host.connection_count(), 0);
    }

    #[test]
    fn test_elevated_upload_is_staged() {
        let host = MockHost::new();
        let mut proxy = proxy(&host);

        let options = TransferOptions::elevated()
            .with_permissions("600")
            .with_owner("root")
            .with_tab_stop(4);
        proxy
            .upload_text("/etc/app/app.conf", "key\tvalue\r\n", &options)
            .unwrap();

        assert_eq!(host.read_text("/etc/app/app.conf").unwrap(), "key value\n");
        assert_eq!(host.mode("/etc/app/app.conf"), Some(0o600));
        assert_eq!(host.owner("/etc/app/app.conf").as_deref(), Some("root"));
        assert!(host.list("/home/sysadmin/.upload").is_empty());
        assert!(host
            .exec_log()
            .iter()
            .any(|line| line.contains("sudo nohup bash")));
    }

    #[test]
    fn test_elevated_upload_failure_reports_exit_code() {
        let host = MockHost::new();
        host.add_file("/etc/app", b"not a folder");
        let mut proxy = proxy(&host);

        let err = proxy
            .upload_bytes("/etc/app/x.conf", b"x", &TransferOptions::elevated())
            .unwrap_err();
        match err {
            ProxyError::RemoteCommand { exit_code, stderr, .. } => {
                assert_eq!(exit_code, 1);
                assert!(stderr.contains("File exists"), "{}", stderr);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(host.list("/home/sysadmin/.upload").is_empty());
        assert!(host.list("/var/lib/hive/exec/cmd").is_empty());
    }

    #[test]
    fn test_plain_upload_and_download() {
        let host = MockHost::new();
        let mut proxy = proxy(&host);

        proxy
            .upload_bytes("/tmp/data.bin", &[1, 2, 3], &TransferOptions::default())
            .unwrap();
        assert_eq!(
            proxy
                .download_bytes("/tmp/data.bin", &TransferOptions::default())
                .unwrap(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn test_elevated_download_removes_copy() {
        let host = MockHost::new();
        host.add_file("/etc/shadow", b"root:*:19000");
        let mut proxy = proxy(&host);

        let text = proxy
            .download_text("/etc/shadow", &TransferOptions::elevated())
            .unwrap();
        assert_eq!(text, "root:*:19000");
        assert!(host.list("/home/sysadmin/.download").is_empty());
    }

    #[test]
    fn test_elevated_download_of_missing_file() {
        let host = MockHost::new();
        let mut proxy = proxy(&host);

        let err = proxy
            .download_bytes("/etc/missing", &TransferOptions::elevated())
            .unwrap_err();
        assert!(matches!(err, ProxyError::RemoteCommand { .. }));
        assert!(host.list("/home/sysadmin/.download").is_empty());
    }

    #[test]
    fn test_existence_checks() {
        let host = MockHost::new();
        host.add_file("/etc/hosts", b"127.0.0.1 localhost\n");
        let mut proxy = proxy(&host);

        assert!(proxy.file_exists("/etc/hosts").unwrap());
        assert!(!proxy.file_exists("/etc").unwrap());
        assert!(proxy.directory_exists("/etc").unwrap());
        assert!(!proxy.directory_exists("/srv").unwrap());
        assert_eq!(proxy.operation_log().contents().unwrap(), "");
    }

    #[test]
    fn test_create_and_remove_directory() {
        let host = MockHost::new();
        let mut proxy = proxy(&host);

        proxy
            .create_directory("/srv/app/data", &TransferOptions::elevated().with_permissions("750"))
            .unwrap();
        assert!(host.is_dir("/srv/app/data"));
        assert_eq!(host.mode("/srv/app/data"), Some(0o750));

        proxy.remove_path("/srv/app").unwrap();
        assert!(!host.exists("/srv/app"));
        proxy.remove_path("/srv/app").unwrap();
    }

    #[test]
    fn test_clone_is_fresh_but_shares_log() {
        let host = MockHost::new();
        let mut proxy = proxy(&host).with_metadata(42u32);
        proxy.fault("broken");

        let mut clone = proxy.clone();
        assert!(!clone.is_faulted());
        assert_eq!(*clone.metadata(), 42);

        clone.log_line("from the clone");
        assert!(proxy
            .operation_log()
            .contents()
            .unwrap()
            .contains("from the clone"));
        assert!(clone.run_command("true", &[]).unwrap().success());
    }

    #[test]
    fn test_update_credentials() {
        let host = MockHost::new();
        host.set_password(Some("rotated"));
        let mut proxy = proxy(&host);

        assert!(proxy.run_command("true", &[]).unwrap_err().is_auth_error());

        proxy.update_credentials(Credentials::password("sysadmin", "rotated"));
        assert!(proxy.run_command("true", &[]).unwrap().success());
    }

    #[test]
    fn test_handler_sees_arguments() {
        let host = MockHost::new();
        host.on_command("hivectl", |_, args| MockOutput::ok(args.join(",")));
        let mut proxy = proxy(&host);

        let response = proxy
            .run_command("hivectl", &args!["status", vec!["a", ""]])
            .unwrap();
        assert_eq!(response.output_text(), Some("status,a,-"));
    }
}
