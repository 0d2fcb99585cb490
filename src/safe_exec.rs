//! Run a command at most once across dropped connections
//!
//! A command never runs directly on the command session. Instead:
//!
//! ```text
//! <exec_root>/cmd/<token>/
//!     cmd.sh     generated wrapper
//!     invoked    created before the wrapper starts
//!     stdout     command stdout
//!     stderr     command stderr
//!     exit       exit code, renamed into place once complete
//! ```
//!
//! The wrapper is started by a guard that does nothing when `invoked`
//! already exists, so repeating the start after a dropped connection cannot
//! run the command twice. Completion is observed by polling for `exit`,
//! which the wrapper writes to a temporary name and renames so a reader
//! never sees a partial value.

use hive_core_resilience::{PollOutcome, Poller};
use std::time::Instant;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::command::escape;
use crate::connection::SessionManager;
use crate::error::{ProxyError, Result};
use crate::transport::ExecOutput;

const SCRIPT: &str = "cmd.sh";
const INVOKED: &str = "invoked";
const STDOUT: &str = "stdout";
const STDERR: &str = "stderr";
const EXIT: &str = "exit";

/// Paths of one execution's scratch folder
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ScratchFolder {
    pub root: String,
}

impl ScratchFolder {
    pub fn new(root: String) -> Self {
        Self { root }
    }

    pub fn file(&self, name: &str) -> String {
        format!("{}/{}", self.root, name)
    }
}

/// The wrapper script uploaded as `cmd.sh`
pub(crate) fn render_script(folder: &ScratchFolder, command_line: &str, remote_path: Option<&str>) -> String {
    let invoked = escape(&folder.file(INVOKED));
    let stdout = escape(&folder.file(STDOUT));
    let stderr = escape(&folder.file(STDERR));
    let exit = escape(&folder.file(EXIT));
    let exit_tmp = escape(&folder.file("exit.tmp"));

    let mut script = String::from("#!/bin/bash\n");
    script.push_str(&format!("touch {}\n", invoked));
    if let Some(path) = remote_path.filter(|path| !path.is_empty()) {
        script.push_str(&format!("export PATH={}:$PATH\n", path));
    }
    script.push_str(&format!("(\n{}\n) > {} 2> {}\n", command_line, stdout, stderr));
    script.push_str(&format!("echo $? > {}\n", exit_tmp));
    script.push_str(&format!("mv {} {}\n", exit_tmp, exit));
    script
}

/// The start line; a no-op once `invoked` exists
pub(crate) fn render_guard(folder: &ScratchFolder, elevated: bool) -> String {
    let invoked = escape(&folder.file(INVOKED));
    let script = escape(&folder.file(SCRIPT));
    let sudo = if elevated { "sudo " } else { "" };
    format!(
        "if [ ! -f {invoked} ]; then touch {invoked}; {sudo}nohup bash {script} > /dev/null 2>&1 & fi"
    )
}

fn parse_exit_code(node: &str, raw: &[u8]) -> Result<i32> {
    let text = String::from_utf8_lossy(raw);
    text.trim().parse().map_err(|_| ProxyError::Protocol {
        node: node.to_string(),
        message: format!("unreadable exit code {:?}", text.trim()),
    })
}

impl SessionManager {
    /// Run `command_line` through the scratch-folder protocol
    pub fn safe_exec(&mut self, command_line: &str, elevated: bool, remote_path: bool) -> Result<ExecOutput> {
        self.check_command_session();

        let node = self.node().to_string();
        let token = Uuid::new_v4().simple().to_string();
        let folder = ScratchFolder::new(self.config().layout.command_folder(&token));
        let path = remote_path.then(|| self.config().remote_path.clone());

        trace!(node = %node, "Executing in {}", folder.root);

        let root = escape(&folder.root);
        let created = self.exec(&format!("mkdir -p {root} && chmod 777 {root}"))?;
        if !created.success() {
            return Err(ProxyError::Protocol {
                node,
                message: format!(
                    "cannot create {}: {}",
                    folder.root,
                    created.stderr_text().trim()
                ),
            });
        }

        let result = self.run_in_folder(&folder, command_line, elevated, path.as_deref());

        // A timed out command may still be running; its folder stays for inspection
        if !matches!(result, Err(ProxyError::Timeout { .. })) {
            if let Err(err) = self.exec(&format!("rm -rf {root}")) {
                warn!(node = %node, "Could not remove {}: {}", folder.root, err);
            }
        }

        if let Ok(output) = &result {
            debug!(node = %node, "Command finished with exit code {}", output.exit_code);
        }
        result
    }

    fn run_in_folder(
        &mut self,
        folder: &ScratchFolder,
        command_line: &str,
        elevated: bool,
        path: Option<&str>,
    ) -> Result<ExecOutput> {
        let node = self.node().to_string();
        let timing = self.config().timing.clone();

        let script = render_script(folder, command_line, path);
        self.upload(&folder.file(SCRIPT), script.as_bytes(), Some(0o644))?;

        let started = self.exec(&render_guard(folder, elevated))?;
        if !started.success() {
            return Err(ProxyError::Protocol {
                node,
                message: format!("cannot start command: {}", started.stderr_text().trim()),
            });
        }

        let begun = Instant::now();
        let exit_path = folder.file(EXIT);
        let poller = Poller::new(timing.poll_interval(), timing.exec_timeout());
        let outcome = poller.until(|round| {
            if round > 0 {
                trace!(node = %node, "Waiting for {} (check {})", exit_path, round + 1);
            }
            Ok::<_, ProxyError>(self.exists(&exit_path)?.then_some(()))
        })?;

        if let PollOutcome::TimedOut = outcome {
            return Err(ProxyError::Timeout {
                node,
                operation: format!("command in {}", folder.root),
                elapsed: begun.elapsed(),
            });
        }

        Ok(ExecOutput {
            exit_code: parse_exit_code(&node, &self.download(&exit_path)?)?,
            stdout: self.download(&folder.file(STDOUT))?,
            stderr: self.download(&folder.file(STDERR))?,
        })
    }
}
