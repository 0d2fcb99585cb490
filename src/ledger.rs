//! Idempotent actions recorded as marker files on the node
//!
//! An action id such as `setup/docker/install` maps to the marker
//! `<state_root>/setup/docker/install`. The marker is written only after the
//! action completes without faulting the node, and is never removed here.

use tracing::{debug, info};

use crate::command::escape;
use crate::error::{ProxyError, Result};
use crate::proxy::NodeProxy;

/// Check an action id: letters, digits, `-` and `.`, with `/` separating
/// non-empty groups
pub(crate) fn validate_action_id(action_id: &str) -> Result<()> {
    let invalid = || ProxyError::InvalidActionId(action_id.to_string());

    if action_id.is_empty() || action_id.starts_with('/') || action_id.ends_with('/') {
        return Err(invalid());
    }

    for segment in action_id.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(invalid());
        }
        if !segment
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '.')
        {
            return Err(invalid());
        }
    }
    Ok(())
}

/// Folder and marker path for an action id
pub(crate) fn marker_location(state_root: &str, action_id: &str) -> (String, String) {
    let root = state_root.trim_end_matches('/');
    let folder = match action_id.rsplit_once('/') {
        Some((group, _)) => format!("{}/{}", root, group),
        None => root.to_string(),
    };
    (folder, format!("{}/{}", root, action_id))
}

impl<M> NodeProxy<M> {
    /// Run `action` unless it already completed on this node.
    ///
    /// Returns `true` when the action ran. The marker is only written when
    /// the node is not faulted afterwards; an error from `action` propagates
    /// and leaves no marker.
    pub fn invoke_idempotent<F>(&mut self, action_id: &str, action: F) -> Result<bool>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        validate_action_id(action_id)?;

        let (folder, marker) = marker_location(&self.config().layout.state_root, action_id);
        self.run_internal(format!("mkdir -p {}", escape(&folder)), true)?;

        if self.check_internal(format!("test -f {}", escape(&marker)), true)? {
            debug!(node = %self.name(), "Action [{}] already done", action_id);
            return Ok(false);
        }

        info!(node = %self.name(), "Running action [{}]", action_id);
        action(self)?;

        if self.is_faulted() {
            debug!(node = %self.name(), "Action [{}] faulted the node; not recorded", action_id);
        } else {
            self.run_internal(format!("touch {}", escape(&marker)), true)?;
        }
        Ok(true)
    }
}
