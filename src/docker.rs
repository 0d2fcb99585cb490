//! Container orchestrator client commands with transient-error retry
//!
//! The docker client reports registry and daemon timeouts as ordinary
//! non-zero exits. Those are retried after a pause; any other failure is
//! final. Either way a failed response is returned rather than an error,
//! and the node is faulted only when the caller asked for it.

use hive_core_resilience::{RetryPolicy, Verdict};
use tracing::warn;

use crate::command::{CommandArg, FormattedCommand, REDACTED};
use crate::error::{ProxyError, Result};
use crate::options::RunOptions;
use crate::proxy::{Invocation, NodeProxy};
use crate::response::CommandResponse;

/// Why one docker attempt did not succeed
#[derive(Debug)]
enum DockerFailure {
    /// Non-zero exit with a known transient marker in stderr
    Transient(CommandResponse),
    /// Any other non-zero exit
    Hard(CommandResponse),
    /// The engine itself failed
    Error(ProxyError),
}

impl<M> NodeProxy<M> {
    /// Run `docker <args>`, retrying transient failures
    pub fn docker_command(&mut self, options: RunOptions, args: &[CommandArg]) -> Result<CommandResponse> {
        let formatted = FormattedCommand::new("docker", args);
        formatted.check_redirection()?;

        let options = options.merged(self.default_options());
        let fault_on_error = options.fault_on_error;
        let attempt_options = RunOptions {
            fault_on_error: false,
            ..options
        };

        let docker = self.config().docker.clone();
        let policy = RetryPolicy::new(docker.attempts, docker.delay());
        let total = policy.attempts.max(1);
        let node = self.name().to_string();
        let shown = if options.redact {
            REDACTED.to_string()
        } else {
            formatted.command_line()
        };

        let result = policy.run(
            |attempt| {
                if attempt > 0 {
                    self.set_status(format!("{} [attempt={}/{}]", shown, attempt + 1, total));
                }

                let response = self
                    .execute(attempt_options, Invocation::plain(&formatted))
                    .map_err(DockerFailure::Error)?;

                if response.success() || response.already_faulted() {
                    Ok(response)
                } else if docker.is_transient(response.error_text()) {
                    Err(DockerFailure::Transient(response))
                } else {
                    Err(DockerFailure::Hard(response))
                }
            },
            |failure, attempt| match failure {
                DockerFailure::Transient(response) => {
                    warn!(
                        node = %node,
                        "Transient docker failure (attempt {}/{}): {}",
                        attempt + 1,
                        total,
                        response.error_summary()
                    );
                    Verdict::Retry
                }
                _ => Verdict::Abort,
            },
        );

        match result {
            Ok(response) => Ok(response),
            Err(DockerFailure::Error(err)) => Err(err),
            Err(DockerFailure::Transient(response)) | Err(DockerFailure::Hard(response)) => {
                if fault_on_error {
                    self.fault(&response.error_summary());
                }
                Ok(response)
            }
        }
    }
}
