//! Process-wide dispatcher state and per-request context.

use crate::agent::SocketAgent;
use crate::cancel::CancelToken;
use crate::catalogue::VmCatalogue;
use crate::config::SnapvisorConfig;
use crate::disk::{BundleDiskBackend, DiskBackend};
use crate::error::{Error, Result};
use crate::events::{BroadcastChannel, Channel};
use crate::exclusive::ExclusiveRegistry;
#[cfg(target_os = "linux")]
use crate::host::EffectiveUid;
use crate::host::{
    AccessCheck, FsAccessCheck, Impersonator, NoImpersonation, SpaceProbe, StatvfsProbe,
};
use crate::snapshot::{SnapshotLockTable, SnapshotStore};
use crate::vm::{SessionId, TaskId, VmAgent, VmIdentity, VmLocation};
use std::sync::Arc;

/// External capabilities the engines depend on.
#[derive(Clone)]
pub struct Collaborators {
    /// Live VM control.
    pub agent: Arc<dyn VmAgent>,
    /// Disk image operations.
    pub disks: Arc<dyn DiskBackend>,
    /// Authorization.
    pub access: Arc<dyn AccessCheck>,
    /// Client notifications.
    pub channel: Arc<dyn Channel>,
    /// Free space probing.
    pub space: Arc<dyn SpaceProbe>,
    /// Identity switching.
    pub impersonator: Arc<dyn Impersonator>,
}

impl Collaborators {
    /// The shipped host implementations.
    pub fn host(config: &SnapvisorConfig, channel: Arc<dyn Channel>) -> Self {
        #[cfg(target_os = "linux")]
        let impersonator: Arc<dyn Impersonator> = if unsafe { libc::geteuid() } == 0 {
            Arc::new(EffectiveUid::new())
        } else {
            Arc::new(NoImpersonation)
        };
        #[cfg(not(target_os = "linux"))]
        let impersonator: Arc<dyn Impersonator> = Arc::new(NoImpersonation);
        Self {
            agent: Arc::new(SocketAgent::new(
                config.agent_socket_name.clone(),
                config.agent_poll_interval,
            )),
            disks: Arc::new(BundleDiskBackend::new()),
            access: Arc::new(FsAccessCheck),
            channel,
            space: Arc::new(StatvfsProbe),
            impersonator,
        }
    }
}

/// Everything shared between requests. Built once at startup.
pub struct DispatcherContext {
    /// Service configuration.
    pub config: SnapvisorConfig,
    /// External capabilities.
    pub collab: Collaborators,
    /// Exclusive VM operations.
    pub registry: ExclusiveRegistry,
    /// Per-snapshot locks.
    pub snapshot_locks: SnapshotLockTable,
    /// Loaded snapshot trees.
    pub snapshots: SnapshotStore,
    /// Registered VMs.
    pub catalogue: VmCatalogue,
}

impl DispatcherContext {
    /// Assemble a context from parts.
    pub fn new(config: SnapvisorConfig, collab: Collaborators, catalogue: VmCatalogue) -> Self {
        Self {
            config,
            collab,
            registry: ExclusiveRegistry::default(),
            snapshot_locks: SnapshotLockTable::new(),
            snapshots: SnapshotStore::new(),
            catalogue,
        }
    }

    /// Context with the host implementations and the configured catalogue.
    ///
    /// Returns the broadcast channel so callers can stream events.
    pub fn from_config(config: SnapvisorConfig) -> Result<(Self, Arc<BroadcastChannel>)> {
        let channel = Arc::new(BroadcastChannel::new());
        let catalogue = VmCatalogue::open(&config.catalogue_path)?;
        let collab = Collaborators::host(&config, channel.clone());
        Ok((Self::new(config, collab, catalogue), channel))
    }

    /// Resolve a VM by uuid or name.
    pub fn locate(&self, key: &str) -> Result<VmLocation> {
        let item = self
            .catalogue
            .find(key)
            .ok_or_else(|| Error::VmNotFound(key.to_string()))?;
        Ok(VmLocation::new(self.identity(&item.uuid), item.home))
    }

    /// Lock-table key for a VM uuid.
    pub fn identity(&self, uuid: &str) -> VmIdentity {
        VmIdentity::new(self.config.directory_id.clone(), uuid)
    }
}

/// Per-request context.
#[derive(Debug, Clone)]
pub struct OpContext {
    /// Requesting session.
    pub session: SessionId,
    /// This request.
    pub task: TaskId,
    /// Cancellation flag for this request.
    pub cancel: CancelToken,
}

impl OpContext {
    /// New request for a session.
    pub fn new(session: SessionId) -> Self {
        Self {
            session,
            task: TaskId::generate(),
            cancel: CancelToken::new(),
        }
    }

    /// Same session and cancellation, new task id.
    pub fn subtask(&self) -> Self {
        Self {
            session: self.session.clone(),
            task: TaskId::generate(),
            cancel: self.cancel.clone(),
        }
    }
}
