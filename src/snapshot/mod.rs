//! VM snapshots.
//!
//! - [`SnapshotTree`]: arena of snapshot nodes with a current pointer
//! - [`SnapshotStore`]: per-VM cache of trees persisted as `Snapshots.xml`
//! - [`SnapshotLockTable`]: per-snapshot locks taken by delete and revert
//! - [`UnfinishedDiskOpScanner`]: detection of crash-interrupted disk ops
//! - [`SnapshotEngine`]: create, delete and revert

pub mod engine;
pub mod files;
pub mod lock_table;
pub mod store;
pub mod tree;
pub mod unfinished;
pub mod xml;

pub use engine::{CreateRequest, DeleteOptions, RevertOptions, RevertOutcome, SnapshotEngine};
pub use files::SnapshotFiles;
pub use lock_table::{SnapshotLockGuard, SnapshotLockTable};
pub use store::SnapshotStore;
pub use tree::{SnapshotData, SnapshotInfo, SnapshotRuntime, SnapshotTree, HEAD_GUID};
pub use unfinished::{DiskUnfinishedState, UnfinishedDiskOpScanner, UnfinishedPlan};
