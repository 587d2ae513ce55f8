//! Disk image backend.
//!
//! Snapshot states live inside the disk images themselves. The engines
//! only see the [`DiskBackend`] trait; long operations come back as a
//! [`DiskJob`] that the caller drives step by step.

pub mod bundle;

pub use bundle::BundleDiskBackend;

use crate::cancel::CancelToken;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Kind of disk operation left behind by a crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnfinishedOp {
    /// Nothing pending.
    None,
    /// State deletion that discards its data.
    Delete,
    /// State deletion that folds its data into the parent.
    Merge,
    /// State files still need to be removed.
    DeleteFiles,
}

impl UnfinishedOp {
    /// Whether the op removes a snapshot state.
    pub fn removes_state(self) -> bool {
        matches!(self, UnfinishedOp::Delete | UnfinishedOp::Merge | UnfinishedOp::DeleteFiles)
    }
}

/// Pending operation recorded inside a disk image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingOp {
    /// What was running.
    pub op: UnfinishedOp,
    /// Snapshot state the op applies to.
    #[serde(default)]
    pub snapshot: Option<String>,
}

/// A running disk operation.
///
/// Each item is the progress percentage after one step. Dropping the job
/// before it is exhausted abandons the operation and leaves it pending
/// in the image.
pub type DiskJob = Box<dyn Iterator<Item = Result<u32>> + Send>;

/// A job with nothing left to do.
pub fn finished_job() -> DiskJob {
    Box::new(std::iter::empty())
}

/// Disk image operations used by snapshots and clones.
pub trait DiskBackend: Send + Sync {
    /// Pending operation recorded in the image, if any.
    fn inspect(&self, disk: &Path) -> Result<Option<PendingOp>>;

    /// Freeze the image's current contents as snapshot state `guid`.
    fn create_state(&self, disk: &Path, guid: &str) -> Result<()>;

    /// Remove snapshot state `guid`, merging it into its parent if `merge`.
    fn delete_state(&self, disk: &Path, guid: &str, merge: bool) -> Result<DiskJob>;

    /// Make snapshot state `guid` the image's contents.
    fn switch_state(&self, disk: &Path, guid: &str) -> Result<DiskJob>;

    /// Complete the pending operation.
    fn commit_unfinished(&self, disk: &Path) -> Result<DiskJob>;

    /// Create `target` backed by state `guid` of `source`.
    fn create_linked(&self, source: &Path, guid: &str, target: &Path) -> Result<DiskJob>;

    /// Full copy of an image.
    fn copy_image(&self, source: &Path, target: &Path) -> Result<DiskJob>;
}

/// Run a job to completion, checking for cancellation between steps.
///
/// Once a step reports 100 the job is past its point of no return and
/// cancellation is no longer observed.
pub fn drive_job(job: DiskJob, cancel: &CancelToken, mut on_progress: impl FnMut(u32)) -> Result<()> {
    for step in job {
        let progress = step?.min(100);
        on_progress(progress);
        if progress < 100 {
            cancel.check()?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn job(steps: Vec<Result<u32>>) -> DiskJob {
        Box::new(steps.into_iter())
    }

    #[test]
    fn test_drive_job_reports_progress() {
        let job = job(vec![Ok(30), Ok(70), Ok(150)]);
        let mut seen = Vec::new();
        drive_job(job, &CancelToken::new(), |p| seen.push(p)).unwrap();
        assert_eq!(seen, vec![30, 70, 100]);
    }

    #[test]
    fn test_drive_job_stops_on_error() {
        let job = job(vec![Ok(10), Err(Error::disk("/d", "eio")), Ok(100)]);
        let mut seen = Vec::new();
        let err = drive_job(job, &CancelToken::new(), |p| seen.push(p)).unwrap_err();
        assert!(matches!(err, Error::Disk { .. }));
        assert_eq!(seen, vec![10]);
    }

    #[test]
    fn test_drive_job_observes_cancel() {
        let cancel = CancelToken::new();
        let flag = cancel.clone();
        let job = job((1..=10).map(|i| Ok(i * 10)).collect());
        let mut seen = Vec::new();
        let err = drive_job(job, &cancel, |p| {
            seen.push(p);
            if p == 20 {
                flag.cancel();
            }
        })
        .unwrap_err();
        assert!(matches!(err, Error::OperationCancelled));
        assert_eq!(seen, vec![10, 20]);
    }

    #[test]
    fn test_drive_job_ignores_cancel_after_final_step() {
        let cancel = CancelToken::new();
        let flag = cancel.clone();
        let job = job(vec![Ok(50), Ok(100)]);
        drive_job(job, &cancel, |p| {
            if p == 100 {
                flag.cancel();
            }
        })
        .unwrap();
    }

    #[test]
    fn test_removes_state() {
        assert!(UnfinishedOp::Merge.removes_state());
        assert!(!UnfinishedOp::None.removes_state());
    }
}
