//! Detection of disk operations interrupted by a crash.

use crate::disk::{DiskBackend, UnfinishedOp};
use crate::vm::VmConfig;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Scan result for one image disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiskUnfinishedState {
    /// Device index in the VM config.
    pub index: u32,
    /// Resolved image path.
    pub path: PathBuf,
    /// Pending operation, `None` when the disk is clean.
    pub op: UnfinishedOp,
    /// Snapshot the pending operation belongs to.
    pub snapshot: Option<String>,
    /// Set when the disk could not be inspected.
    pub error: Option<String>,
}

impl DiskUnfinishedState {
    /// Whether an operation is pending on this disk.
    pub fn is_unfinished(&self) -> bool {
        self.error.is_none() && self.op != UnfinishedOp::None
    }
}

/// What recovery has to do.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UnfinishedPlan {
    /// Disks whose pending operation must be completed.
    pub devices: Vec<DiskUnfinishedState>,
    /// Snapshot nodes whose deletion was interrupted.
    pub snapshots_to_remove: BTreeSet<String>,
}

impl UnfinishedPlan {
    /// Whether there is nothing to recover.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty() && self.snapshots_to_remove.is_empty()
    }
}

/// Read-only inspection of a VM's image disks.
pub struct UnfinishedDiskOpScanner<'a> {
    disks: &'a dyn DiskBackend,
}

impl<'a> UnfinishedDiskOpScanner<'a> {
    /// Create a scanner over a disk backend.
    pub fn new(disks: &'a dyn DiskBackend) -> Self {
        Self { disks }
    }

    /// Inspect every enabled image disk.
    ///
    /// A disk that cannot be inspected is reported with `error` set and
    /// does not stop the scan.
    pub fn scan(&self, config: &VmConfig, home: &Path) -> Vec<DiskUnfinishedState> {
        config
            .image_disks(home)
            .into_iter()
            .map(|(index, path)| match self.disks.inspect(&path) {
                Ok(pending) => {
                    let (op, snapshot) = pending
                        .map(|p| (p.op, p.snapshot))
                        .unwrap_or((UnfinishedOp::None, None));
                    DiskUnfinishedState {
                        index,
                        path,
                        op,
                        snapshot,
                        error: None,
                    }
                }
                Err(e) => {
                    tracing::warn!(disk = %path.display(), error = %e, "cannot inspect disk");
                    DiskUnfinishedState {
                        index,
                        path,
                        op: UnfinishedOp::None,
                        snapshot: None,
                        error: Some(e.to_string()),
                    }
                }
            })
            .collect()
    }

    /// Split scan results into disks to commit and snapshots to drop.
    pub fn classify(states: &[DiskUnfinishedState]) -> UnfinishedPlan {
        let mut plan = UnfinishedPlan::default();
        for state in states.iter().filter(|s| s.is_unfinished()) {
            if state.op.removes_state() {
                if let Some(guid) = &state.snapshot {
                    plan.snapshots_to_remove.insert(guid.clone());
                }
            }
            plan.devices.push(state.clone());
        }
        plan
    }
}
