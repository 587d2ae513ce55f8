//! VM power state types.

use serde::{Deserialize, Serialize};
pub use snapvisor_protocol::PowerState;

/// VM state captured together with a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotVmState {
    /// VM was running.
    Running,
    /// VM was paused.
    Paused,
    /// VM was suspended to disk.
    Suspended,
    /// VM was powered off.
    #[default]
    Stopped,
}

impl SnapshotVmState {
    /// Attribute value used in the snapshot tree file.
    pub fn as_xml(&self) -> &'static str {
        match self {
            SnapshotVmState::Running => "poweron",
            SnapshotVmState::Paused => "pause",
            SnapshotVmState::Suspended => "suspend",
            SnapshotVmState::Stopped => "poweroff",
        }
    }

    /// Parse the attribute value used in the snapshot tree file.
    pub fn from_xml(value: &str) -> Option<Self> {
        match value {
            "poweron" => Some(SnapshotVmState::Running),
            "pause" => Some(SnapshotVmState::Paused),
            "suspend" => Some(SnapshotVmState::Suspended),
            "poweroff" => Some(SnapshotVmState::Stopped),
            _ => None,
        }
    }

    /// Whether a VM reverted to this state must be executing afterwards.
    pub fn is_running(&self) -> bool {
        matches!(self, SnapshotVmState::Running | SnapshotVmState::Paused)
    }

    /// Whether the snapshot carries a screenshot.
    pub fn has_screenshot(&self) -> bool {
        !matches!(self, SnapshotVmState::Stopped)
    }
}

impl From<PowerState> for SnapshotVmState {
    fn from(state: PowerState) -> Self {
        match state {
            PowerState::Running => SnapshotVmState::Running,
            PowerState::Paused => SnapshotVmState::Paused,
            PowerState::Suspended => SnapshotVmState::Suspended,
            PowerState::Stopped | PowerState::Unknown => SnapshotVmState::Stopped,
        }
    }
}

impl std::fmt::Display for SnapshotVmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnapshotVmState::Running => write!(f, "running"),
            SnapshotVmState::Paused => write!(f, "paused"),
            SnapshotVmState::Suspended => write!(f, "suspended"),
            SnapshotVmState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Whether the VM has a live process the agent can talk to.
pub fn is_live(state: PowerState) -> bool {
    matches!(state, PowerState::Running | PowerState::Paused)
}
