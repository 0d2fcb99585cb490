//! Readiness and fault state of one proxy instance

use serde::Serialize;

/// Lifecycle of a proxy instance. `Faulted` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Connecting,
    Ready,
    Faulted,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Connecting => write!(f, "connecting"),
            NodeState::Ready => write!(f, "ready"),
            NodeState::Faulted => write!(f, "faulted"),
        }
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default()
}

#[derive(Debug, Clone, Default)]
pub(crate) struct NodeStatus {
    status: String,
    ready: bool,
    faulted: bool,
    fault_message: Option<String>,
}

impl NodeStatus {
    pub fn state(&self) -> NodeState {
        if self.faulted {
            NodeState::Faulted
        } else if self.ready {
            NodeState::Ready
        } else {
            NodeState::Connecting
        }
    }

    /// First line of the last status, or the fault banner when faulted
    pub fn display(&self) -> String {
        if !self.faulted {
            return first_line(&self.status).to_string();
        }
        match self.fault_message.as_deref().map(first_line) {
            Some(message) if !message.trim().is_empty() => format!("*** FAULT: {}", message),
            _ => "*** FAULTED ***".to_string(),
        }
    }

    pub fn set_status(&mut self, status: impl Into<String>) {
        self.status = status.into();
    }

    /// Ready once a session is established; a faulted node stays faulted
    pub fn mark_ready(&mut self) {
        if !self.faulted {
            self.ready = true;
        }
    }

    /// Back to `Connecting`, e.g. while a node restarts
    pub fn clear_ready(&mut self) {
        self.ready = false;
    }

    pub fn is_ready(&self) -> bool {
        self.ready && !self.faulted
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted
    }

    pub fn fault_message(&self) -> Option<&str> {
        self.fault_message.as_deref()
    }

    /// Enter the faulted state. The first message is kept.
    pub fn fault(&mut self, message: Option<String>) {
        if !self.faulted {
            self.fault_message = message.filter(|message| !message.trim().is_empty());
        }
        self.faulted = true;
        self.ready = false;
    }
}
