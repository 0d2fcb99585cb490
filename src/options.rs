//! Per-call execution options

/// Flags a caller passes with each command.
///
/// `use_defaults` merges the proxy's default options into the call: a flag
/// set on either side ends up set. Without it the call's flags are used
/// verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    /// Merge the instance defaults into this call
    pub use_defaults: bool,
    /// Run through `sudo`
    pub elevated: bool,
    /// Fault the node and fail the call on a non-zero exit code
    pub fault_on_error: bool,
    /// Run even though the node is already faulted
    pub run_when_faulted: bool,
    /// Keep stdout as raw bytes
    pub binary_output: bool,
    /// Replace the command text with a redaction token in logs and responses
    pub redact: bool,
    /// Only write the operation log when the command fails
    pub log_on_error_only: bool,
    /// Always log stdout/stderr, not only on failure
    pub log_output: bool,
    /// Do not prepend the remote PATH
    pub no_remote_path: bool,
    /// Reboot/shutdown class: sent once, never retried, result not awaited
    pub shutdown: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            use_defaults: true,
            ..Self::none()
        }
    }
}

impl RunOptions {
    /// No flags at all, not even the instance defaults
    pub const fn none() -> Self {
        Self {
            use_defaults: false,
            elevated: false,
            fault_on_error: false,
            run_when_faulted: false,
            binary_output: false,
            redact: false,
            log_on_error_only: false,
            log_output: false,
            no_remote_path: false,
            shutdown: false,
        }
    }

    pub fn elevated(mut self) -> Self {
        self.elevated = true;
        self
    }

    pub fn fault_on_error(mut self) -> Self {
        self.fault_on_error = true;
        self
    }

    pub fn run_when_faulted(mut self) -> Self {
        self.run_when_faulted = true;
        self
    }

    pub fn binary_output(mut self) -> Self {
        self.binary_output = true;
        self
    }

    pub fn redact(mut self) -> Self {
        self.redact = true;
        self
    }

    pub fn log_on_error_only(mut self) -> Self {
        self.log_on_error_only = true;
        self
    }

    pub fn log_output(mut self) -> Self {
        self.log_output = true;
        self
    }

    pub fn no_remote_path(mut self) -> Self {
        self.no_remote_path = true;
        self
    }

    pub fn shutdown(mut self) -> Self {
        self.shutdown = true;
        self
    }

    /// Resolve the effective options for a call
    pub fn merged(self, defaults: RunOptions) -> RunOptions {
        if !self.use_defaults {
            return self;
        }

        RunOptions {
            use_defaults: false,
            elevated: self.elevated || defaults.elevated,
            fault_on_error: self.fault_on_error || defaults.fault_on_error,
            run_when_faulted: self.run_when_faulted || defaults.run_when_faulted,
            binary_output: self.binary_output || defaults.binary_output,
            redact: self.redact || defaults.redact,
            log_on_error_only: self.log_on_error_only || defaults.log_on_error_only,
            log_output: self.log_output || defaults.log_output,
            no_remote_path: self.no_remote_path || defaults.no_remote_path,
            shutdown: self.shutdown || defaults.shutdown,
        }
    }
}
