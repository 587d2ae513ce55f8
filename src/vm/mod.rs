//! VM model and the live-VM agent capability.
//!
//! This module provides the types the snapshot and clone engines use to
//! describe a VM:
//! - [`VmConfig`]: device and resource configuration stored in the VM home
//! - [`VmIdentity`]: the (directory, vm) key used by every lock table
//! - [`VmAgent`]: trait for talking to the execution engine of a live VM

pub mod config;
pub mod identity;
pub mod state;

use crate::error::Result;
pub use config::{
    DiskEmulation, GuestOs, HardDisk, ImageDevice, NetAdapter, VmConfig, VmType, CONFIG_FILE,
    VM_INFO_FILE,
};
pub use identity::{SessionId, TaskId, VmIdentity};
pub use snapvisor_protocol::{AgentCommand, JobId};
pub use state::{is_live, PowerState, SnapshotVmState};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Suspend-state file of a VM, relative to its home.
pub const SUSPEND_SAV_FILE: &str = "suspend.sav";

/// Suspended memory image of a VM, relative to its home.
pub const SUSPEND_MEM_FILE: &str = "suspend.mem";

/// Screenshot taken at suspend time, relative to its home.
pub const SUSPEND_PNG_FILE: &str = "suspend.png";

/// A registered VM resolved to its home directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmLocation {
    /// Lock-table key.
    pub id: VmIdentity,
    /// VM home directory.
    pub home: PathBuf,
}

impl VmLocation {
    /// Create a new location.
    pub fn new(id: VmIdentity, home: impl Into<PathBuf>) -> Self {
        Self {
            id,
            home: home.into(),
        }
    }

    /// Path of `config.json`.
    pub fn config_path(&self) -> PathBuf {
        self.home.join(CONFIG_FILE)
    }

    /// Whether the VM left suspend-state files behind.
    pub fn has_suspend_state(&self) -> bool {
        self.home.join(SUSPEND_SAV_FILE).exists()
    }

    /// Home-relative path resolution.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        VmConfig::resolve(&self.home, path)
    }
}

/// Handle to a job submitted to a live VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    /// Job id.
    pub id: JobId,
    /// Command name, for logs.
    pub command: &'static str,
}

/// Terminal reply of an agent job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentReply {
    /// Job completed.
    Completed {
        /// PNG screenshot taken by the job.
        screenshot: Option<Vec<u8>>,
    },
    /// Job failed inside the VM.
    Failed {
        /// Agent-side message.
        message: String,
    },
}

/// Outcome of one bounded wait for a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The job reached a terminal state.
    Reply(AgentReply),
    /// The wait elapsed while the job was still running.
    Timeout {
        /// Last reported progress (0-100).
        progress: u32,
    },
}

/// Capability for driving the execution engine of a VM.
///
/// A dropped transport while waiting is reported as
/// [`Error::UnexpectedDisconnect`](crate::Error::UnexpectedDisconnect) so
/// callers can tell it apart from a failed reply.
pub trait VmAgent: Send + Sync {
    /// Submit a command to a live VM.
    fn send_command(&self, vm: &VmLocation, command: AgentCommand) -> Result<JobHandle>;

    /// Wait up to `timeout` for a job to finish.
    fn wait_for_reply(
        &self,
        vm: &VmLocation,
        job: &JobHandle,
        timeout: Duration,
    ) -> Result<WaitOutcome>;

    /// Current power state.
    fn power_state(&self, vm: &VmLocation) -> Result<PowerState>;

    /// Installed guest tools version.
    fn guest_agent_version(&self, vm: &VmLocation) -> Result<String>;

    /// Ask the VM to abandon a job.
    fn abort(&self, vm: &VmLocation, job: &JobHandle) -> Result<()>;
}
