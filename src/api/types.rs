//! API request and response types.

use crate::catalogue::CatalogueItem;
use crate::exclusive::HeldOp;
use crate::snapshot::{SnapshotData, SnapshotInfo};
use serde::{Deserialize, Serialize};

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Health status.
    pub status: &'static str,
    /// Server version.
    pub version: &'static str,
}

/// Registered VMs.
#[derive(Debug, Serialize)]
pub struct ListVmsResponse {
    /// Catalogue entries.
    pub vms: Vec<CatalogueItem>,
}

/// A VM's snapshot tree.
#[derive(Debug, Serialize)]
pub struct ListSnapshotsResponse {
    /// Top-level snapshots with their children nested.
    pub snapshots: Vec<SnapshotInfo>,
}

/// A created snapshot.
#[derive(Debug, Serialize)]
pub struct SnapshotResponse {
    /// Snapshot guid.
    pub guid: String,
    /// Display name.
    pub name: String,
    /// Creation time.
    pub created: String,
    /// Session that created it.
    pub creator: String,
}

impl From<SnapshotData> for SnapshotResponse {
    fn from(data: SnapshotData) -> Self {
        Self {
            created: data.created_str(),
            guid: data.guid,
            name: data.name,
            creator: data.creator,
        }
    }
}

/// Query parameters for deleting a snapshot.
#[derive(Debug, Default, Deserialize)]
pub struct DeleteSnapshotQuery {
    /// Also delete the snapshots between this one and the current one.
    #[serde(default)]
    pub child: bool,
    /// Fold deltas into the parent. Defaults to true.
    #[serde(default)]
    pub merge: Option<bool>,
}

/// Query parameters for reverting to a snapshot.
#[derive(Debug, Default, Deserialize)]
pub struct RevertQuery {
    /// Leave a running snapshot powered off.
    #[serde(default)]
    pub skip_resume: bool,
}

/// Exclusive operations held on a VM.
#[derive(Debug, Serialize)]
pub struct LocksResponse {
    /// Session holding the exclusive VM lock.
    pub locker_session: Option<String>,
    /// Tasks holding any operation.
    pub tasks: Vec<String>,
    /// Every held operation.
    pub held: Vec<HeldOp>,
}

/// Generic success response.
#[derive(Debug, Serialize)]
pub struct OkResponse {
    /// Always true.
    pub ok: bool,
}
