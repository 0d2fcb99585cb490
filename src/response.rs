//! Result of a remote command

use serde::Serialize;

use crate::error::{ProxyError, Result};

/// Captured stdout; text and binary are mutually exclusive
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "data")]
pub enum CommandOutput {
    Text(String),
    Binary(Vec<u8>),
}

impl Default for CommandOutput {
    fn default() -> Self {
        CommandOutput::Text(String::new())
    }
}

/// Immutable record of one executed (or skipped) command
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandResponse {
    pub(crate) node: String,
    pub(crate) command_line: String,
    pub(crate) bash_command: String,
    pub(crate) exit_code: i32,
    pub(crate) output: CommandOutput,
    pub(crate) error_text: String,
    pub(crate) already_faulted: bool,
}

impl CommandResponse {
    /// Synthetic failure returned without contacting a faulted node
    pub(crate) fn skipped(node: &str, command_line: String, bash_command: String) -> Self {
        Self {
            node: node.to_string(),
            command_line,
            bash_command,
            exit_code: 1,
            output: CommandOutput::default(),
            error_text: "** node is faulted **".to_string(),
            already_faulted: true,
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    /// The command as executed (or the redaction token)
    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    /// Shell-escaped rendering for audit logs (or the redaction token)
    pub fn bash_command(&self) -> &str {
        &self.bash_command
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// The call was short-circuited because the node was already faulted
    pub fn already_faulted(&self) -> bool {
        self.already_faulted
    }

    pub fn output(&self) -> &CommandOutput {
        &self.output
    }

    /// stdout as text; `None` for binary output
    pub fn output_text(&self) -> Option<&str> {
        match &self.output {
            CommandOutput::Text(text) => Some(text),
            CommandOutput::Binary(_) => None,
        }
    }

    /// stdout as bytes; `None` for text output
    pub fn output_binary(&self) -> Option<&[u8]> {
        match &self.output {
            CommandOutput::Binary(data) => Some(data),
            CommandOutput::Text(_) => None,
        }
    }

    pub fn error_text(&self) -> &str {
        &self.error_text
    }

    /// stdout followed by stderr. Binary stdout is omitted.
    pub fn all_text(&self) -> String {
        let stdout = self.output_text().unwrap_or_default();
        match (stdout.is_empty(), self.error_text.is_empty()) {
            (_, true) => stdout.to_string(),
            (true, false) => self.error_text.clone(),
            (false, false) => {
                let mut text = stdout.to_string();
                if !text.ends_with('\n') {
                    text.push('\n');
                }
                text.push_str(&self.error_text);
                text
            }
        }
    }

    /// One-line description of a failure, suitable for a status or fault message
    pub fn error_summary(&self) -> String {
        let detail = self
            .error_text
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty());

        match detail {
            Some(detail) => format!("[exitcode={}]: {}", self.exit_code, detail),
            None => format!("[exitcode={}]", self.exit_code),
        }
    }

    /// Turn a non-zero exit code into a [`ProxyError::RemoteCommand`]
    pub fn ensure_success(&self) -> Result<&Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(self.to_error())
        }
    }

    pub(crate) fn to_error(&self) -> ProxyError {
        ProxyError::RemoteCommand {
            node: self.node.clone(),
            command: self.command_line.clone(),
            exit_code: self.exit_code,
            stderr: self.error_text.clone(),
        }
    }
}
