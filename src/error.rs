//! Error types for snapvisor.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using snapvisor's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Operation that currently holds a VM, as reported to a conflicting caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockedFor {
    /// Clone or linked clone in progress.
    Clone,
    /// VM deletion in progress.
    Delete,
    /// VM unregistration in progress.
    Unregister,
    /// Configuration commit in progress.
    EditCommit,
    /// Configuration commit with rename in progress.
    EditCommitWithRename,
    /// Security settings update in progress.
    UpdateSecurity,
    /// Device change requires a stopped VM.
    MustBeStoppedForChangeDevices,
    /// VM is starting or running a start task.
    Execute,
    /// Migration in progress.
    Migrate,
    /// Snapshot creation in progress.
    CreateSnapshot,
    /// Revert to snapshot in progress.
    SwitchToSnapshot,
    /// Snapshot deletion in progress.
    DeleteSnapshot,
    /// Backup in progress.
    Backup,
    /// Restore from backup in progress.
    RestoreFromBackup,
    /// VM is exclusively locked by a session.
    ExclusivelyLocked,
    /// Disk resize in progress.
    DiskResize,
    /// Disk compaction in progress.
    DiskCompact,
    /// Disk conversion in progress.
    DiskConvert,
    /// Firewall change in progress.
    ChangeFirewall,
    /// Image copy in progress.
    CopyImage,
    /// VM move in progress.
    Move,
    /// Internal dispatcher operation.
    Internal,
}

impl LockedFor {
    /// Stable code suffix.
    pub fn as_str(&self) -> &'static str {
        match self {
            LockedFor::Clone => "CLONE",
            LockedFor::Delete => "DELETE",
            LockedFor::Unregister => "UNREGISTER",
            LockedFor::EditCommit => "EDIT_COMMIT",
            LockedFor::EditCommitWithRename => "EDIT_COMMIT_WITH_RENAME",
            LockedFor::UpdateSecurity => "UPDATE_SECURITY",
            LockedFor::MustBeStoppedForChangeDevices => "CHANGE_DEVICES",
            LockedFor::Execute => "EXECUTE",
            LockedFor::Migrate => "MIGRATE",
            LockedFor::CreateSnapshot => "CREATE_SNAPSHOT",
            LockedFor::SwitchToSnapshot => "SWITCH_TO_SNAPSHOT",
            LockedFor::DeleteSnapshot => "DELETE_TO_SNAPSHOT",
            LockedFor::Backup => "BACKUP",
            LockedFor::RestoreFromBackup => "RESTORE_FROM_BACKUP",
            LockedFor::ExclusivelyLocked => "EXCLUSIVE",
            LockedFor::DiskResize => "DISK_RESIZE",
            LockedFor::DiskCompact => "DISK_COMPACT",
            LockedFor::DiskConvert => "DISK_CONVERT",
            LockedFor::ChangeFirewall => "CHANGE_FIREWALL",
            LockedFor::CopyImage => "COPY_IMAGE",
            LockedFor::Move => "MOVE",
            LockedFor::Internal => "INTERNAL_REASON",
        }
    }
}

impl std::fmt::Display for LockedFor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockedFor::Clone => write!(f, "clone"),
            LockedFor::Delete => write!(f, "deletion"),
            LockedFor::Unregister => write!(f, "unregistration"),
            LockedFor::EditCommit => write!(f, "configuration change"),
            LockedFor::EditCommitWithRename => write!(f, "rename"),
            LockedFor::UpdateSecurity => write!(f, "security update"),
            LockedFor::MustBeStoppedForChangeDevices => write!(f, "device change"),
            LockedFor::Execute => write!(f, "start"),
            LockedFor::Migrate => write!(f, "migration"),
            LockedFor::CreateSnapshot => write!(f, "snapshot creation"),
            LockedFor::SwitchToSnapshot => write!(f, "revert to snapshot"),
            LockedFor::DeleteSnapshot => write!(f, "snapshot deletion"),
            LockedFor::Backup => write!(f, "backup"),
            LockedFor::RestoreFromBackup => write!(f, "restore from backup"),
            LockedFor::ExclusivelyLocked => write!(f, "exclusive lock"),
            LockedFor::DiskResize => write!(f, "disk resize"),
            LockedFor::DiskCompact => write!(f, "disk compaction"),
            LockedFor::DiskConvert => write!(f, "disk conversion"),
            LockedFor::ChangeFirewall => write!(f, "firewall change"),
            LockedFor::CopyImage => write!(f, "image copy"),
            LockedFor::Move => write!(f, "move"),
            LockedFor::Internal => write!(f, "internal operation"),
        }
    }
}

/// Catalogue attribute that collided with an existing registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisteredBy {
    /// Same VM uuid.
    Uuid,
    /// Same VM home path.
    Path,
    /// Same VM name.
    Name,
}

impl std::fmt::Display for RegisteredBy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegisteredBy::Uuid => write!(f, "uuid"),
            RegisteredBy::Path => write!(f, "path"),
            RegisteredBy::Name => write!(f, "name"),
        }
    }
}

/// Device class whose copy failed during a clone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneDevice {
    /// Hard disk image.
    HardDisk,
    /// Linked hard disk.
    LinkedHardDisk,
    /// Floppy image.
    Floppy,
    /// Serial port output file.
    SerialPort,
    /// Parallel port output file.
    ParallelPort,
    /// NVRAM file.
    Nvram,
    /// VM info file.
    VmInfo,
    /// Snapshot tree and snapshot files.
    Snapshots,
}

impl CloneDevice {
    fn code(&self) -> &'static str {
        match self {
            CloneDevice::HardDisk => "HDD_IMAGE_COPY",
            CloneDevice::LinkedHardDisk => "COULDNT_CREATE_HDD_LINKED_CLONE",
            CloneDevice::Floppy => "FDD_IMAGE_COPY",
            CloneDevice::SerialPort => "SERIAL_IMG_COPY",
            CloneDevice::ParallelPort => "PARALLEL_PORT_IMG_COPY",
            CloneDevice::Nvram => "NVRAM_FILE_COPY",
            CloneDevice::VmInfo => "COPY_VM_INFO_FILE",
            CloneDevice::Snapshots => "SNAPSHOTS_COPY",
        }
    }
}

impl std::fmt::Display for CloneDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloneDevice::HardDisk => write!(f, "hard disk"),
            CloneDevice::LinkedHardDisk => write!(f, "linked hard disk"),
            CloneDevice::Floppy => write!(f, "floppy image"),
            CloneDevice::SerialPort => write!(f, "serial port output"),
            CloneDevice::ParallelPort => write!(f, "parallel port output"),
            CloneDevice::Nvram => write!(f, "nvram"),
            CloneDevice::VmInfo => write!(f, "vm info"),
            CloneDevice::Snapshots => write!(f, "snapshots"),
        }
    }
}

/// Errors that can occur in snapvisor operations.
#[derive(Error, Debug)]
pub enum Error {
    // Conflict errors
    /// Another exclusive operation holds the VM.
    #[error("vm {vm} is locked for {reason}")]
    VmLocked {
        /// VM identity.
        vm: String,
        /// Operation holding the VM.
        reason: LockedFor,
    },

    /// Another destructive operation holds the snapshot.
    #[error("snapshot {guid} is locked for {reason}")]
    SnapshotLocked {
        /// Snapshot guid.
        guid: String,
        /// Operation holding the snapshot.
        reason: LockedFor,
    },

    /// Session tried to release a lock it does not own.
    #[error("session does not own the lock on vm {vm}")]
    NotLockOwner {
        /// VM identity.
        vm: String,
    },

    /// Command is not registered for the caller.
    #[error("{command} is not registered on vm {vm}")]
    NotRegistered {
        /// VM identity.
        vm: String,
        /// Command kind.
        command: String,
    },

    // Consistency errors
    /// Snapshot tree refused an insert.
    #[error("cannot create snapshot: {0}")]
    CannotCreateSnapshot(String),

    /// Snapshot tree refused a delete.
    #[error("cannot delete snapshot {guid}")]
    CannotDeleteSnapshot {
        /// Snapshot guid.
        guid: String,
    },

    /// Snapshot does not exist in the tree.
    #[error("snapshot not found: {guid}")]
    SnapshotNotFound {
        /// Snapshot guid.
        guid: String,
    },

    /// Persisted snapshot tree is malformed.
    #[error("bad snapshot tree: {0}")]
    BadSnapshotTree(String),

    /// Persisted snapshot tree has no snapshots.
    #[error("snapshot tree is empty")]
    EmptySnapshotTree,

    /// Snapshot tree file could not be read or written.
    #[error("bad snapshot tree file {}: {reason}", path.display())]
    BadFileName {
        /// Tree file path.
        path: PathBuf,
        /// Underlying failure.
        reason: String,
    },

    /// Internal invariant violated.
    #[error("unexpected error: {0}")]
    Unexpected(String),

    // Resource errors
    /// Not enough free space to create a snapshot.
    #[error("not enough free space in {} for snapshot: need {required_mb} MB, have {available_mb} MB", path.display())]
    NotEnoughSpaceForSnapshot {
        /// Directory checked.
        path: PathBuf,
        /// Required space in MB.
        required_mb: u64,
        /// Available space in MB.
        available_mb: u64,
    },

    /// Not enough free space to clone a VM.
    #[error("not enough free space to clone vm {name}")]
    NotEnoughSpaceForClone {
        /// Source VM name.
        name: String,
    },

    /// Free space could not be determined.
    #[error("cannot get free space of {}: {reason}", path.display())]
    GetFreeSpaceFailed {
        /// Directory probed.
        path: PathBuf,
        /// Underlying failure.
        reason: String,
    },

    /// Caller may not access a file.
    #[error("permission denied: {}", path.display())]
    PermissionDenied {
        /// Denied path.
        path: PathBuf,
    },

    /// Caller may not access the VM.
    #[error("access to vm {vm} denied")]
    AccessDenied {
        /// VM identity.
        vm: String,
    },

    /// Caller may not read one of the VM's hard disks.
    #[error("access to hard disk {} of vm {vm} denied", path.display())]
    AccessToVmHddDenied {
        /// VM name.
        vm: String,
        /// Disk path.
        path: PathBuf,
    },

    /// Caller may not read a device of the clone source.
    #[error("access to clone source device {} denied", path.display())]
    AccessToCloneDeviceDenied {
        /// Device path.
        path: PathBuf,
    },

    /// Target path already exists.
    #[error("file or directory already exists: {}", path.display())]
    AlreadyExists {
        /// Existing path.
        path: PathBuf,
    },

    /// Directory could not be created.
    #[error("cannot create directory {}: {reason}", path.display())]
    MakeDirectory {
        /// Directory path.
        path: PathBuf,
        /// Underlying failure.
        reason: String,
    },

    // External collaborator errors
    /// Snapshot creation failed.
    #[error("create snapshot failed: {0}")]
    CreateSnapshotFailed(String),

    /// Snapshot state removal failed.
    #[error("delete snapshot state failed: {0}")]
    DeleteStateFailed(String),

    /// Revert to snapshot failed.
    #[error("restore snapshot state failed: {0}")]
    RestoreStateFailed(String),

    /// Unfinished disk operations could not be completed.
    #[error("cannot complete unfinished disk operation: {0}")]
    DeleteUnfinishedStateFailed(String),

    /// Live VM connection dropped during an operation.
    #[error("connection to vm {vm} dropped unexpectedly")]
    UnexpectedDisconnect {
        /// VM identity.
        vm: String,
    },

    /// Guest tools are not running.
    #[error("guest tools unavailable in vm {vm}")]
    GuestToolsUnavailable {
        /// VM identity.
        vm: String,
    },

    /// Agent transport or protocol failure.
    #[error("agent error during {operation}: {reason}")]
    Agent {
        /// What was being attempted.
        operation: String,
        /// Underlying failure.
        reason: String,
    },

    /// Disk backend failure.
    #[error("disk error on {}: {reason}", path.display())]
    Disk {
        /// Disk path.
        path: PathBuf,
        /// Underlying failure.
        reason: String,
    },

    /// Snapshots are not supported with pass-through boot-camp disks.
    #[error("snapshots are not allowed for vm {vm} with boot camp partitions")]
    SnapshotsNotAllowedForBootcamp {
        /// VM name.
        vm: String,
    },

    // Cancellation
    /// Operation was cancelled by the caller.
    #[error("operation was cancelled")]
    OperationCancelled,

    /// Snapshot deletion was cancelled by the caller.
    #[error("snapshot deletion was cancelled")]
    SnapshotDeletionCancelled,

    /// Clone was cancelled by the caller.
    #[error("clone was cancelled")]
    CloneCancelled,

    // Clone errors
    /// Device copy failed during a clone.
    #[error("failed to copy {device} {}: {reason}", path.display())]
    DeviceCopy {
        /// Failing device class.
        device: CloneDevice,
        /// Source path.
        path: PathBuf,
        /// Underlying failure.
        reason: String,
    },

    /// Clone would overwrite its own source disk.
    #[error("hard disk {} would be cloned onto itself", path.display())]
    HddImageCloneToSelf {
        /// Disk path.
        path: PathBuf,
    },

    /// Clone target name is empty.
    #[error("vm name is empty")]
    VmNameEmpty,

    /// Clone target config already exists.
    #[error("vm config already exists: {}", path.display())]
    VmConfigAlreadyExists {
        /// Config path.
        path: PathBuf,
    },

    /// Catalogue already holds a VM with the same attribute.
    #[error("vm already registered with the same {by}: {value}")]
    AlreadyRegistered {
        /// Colliding attribute.
        by: RegisteredBy,
        /// Colliding value.
        value: String,
    },

    /// Guest OS does not support SID change.
    #[error("sid change is not supported for vm {vm}")]
    ChangeSidNotSupported {
        /// VM name.
        vm: String,
    },

    /// SID change needs guest tools.
    #[error("sid change needs guest tools in vm {vm}")]
    ChangeSidGuestToolsNotAvailable {
        /// VM name.
        vm: String,
    },

    // Lookup errors
    /// VM not found.
    #[error("vm not found: {0}")]
    VmNotFound(String),

    // Configuration errors
    /// Generic configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to load configuration.
    #[error("failed to load config: {0}")]
    ConfigLoad(String),

    /// Failed to save configuration.
    #[error("failed to save config: {0}")]
    ConfigSave(String),

    // IO errors
    /// IO error wrapper.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create an agent error.
    pub fn agent(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Agent {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a disk backend error.
    pub fn disk(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Disk {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a snapshot tree file error.
    pub fn bad_file(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::BadFileName {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a device copy error.
    pub fn device_copy(device: CloneDevice, path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::DeviceCopy {
            device,
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Create an unexpected (invariant) error.
    pub fn unexpected(msg: impl Into<String>) -> Self {
        Self::Unexpected(msg.into())
    }

    /// Whether this error reports a caller cancellation.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            Error::OperationCancelled | Error::SnapshotDeletionCancelled | Error::CloneCancelled
        )
    }

    /// Whether this error is a tree consistency violation.
    pub fn is_consistency(&self) -> bool {
        matches!(
            self,
            Error::CannotCreateSnapshot(_)
                | Error::CannotDeleteSnapshot { .. }
                | Error::BadSnapshotTree(_)
                | Error::Unexpected(_)
        )
    }

    /// Stable code for the dispatch layer.
    pub fn code(&self) -> String {
        let code = match self {
            Error::VmLocked { reason, .. } => return format!("VM_LOCKED_FOR_{}", reason.as_str()),
            Error::SnapshotLocked { reason, .. } => {
                return format!("VM_LOCKED_FOR_{}", reason.as_str())
            }
            Error::DeviceCopy { device, .. } => device.code(),
            Error::AlreadyRegistered { by, .. } => match by {
                RegisteredBy::Uuid => "VM_ALREADY_REGISTERED_VM_UUID",
                RegisteredBy::Path => "VM_ALREADY_REGISTERED_VM_PATH",
                RegisteredBy::Name => "VM_ALREADY_REGISTERED_VM_NAME",
            },
            Error::NotLockOwner { .. } => "NOT_LOCK_OWNER_SESSION_TRIES_TO_UNLOCK",
            Error::NotRegistered { .. } => "VM_IS_NOT_LOCKED",
            Error::CannotCreateSnapshot(_) => "CANT_CREATE_SNAPSHOT",
            Error::CannotDeleteSnapshot { .. } => "CANT_DELETE_SNAPSHOT",
            Error::SnapshotNotFound { .. } => "SNAPSHOT_NOT_FOUND",
            Error::BadSnapshotTree(_) => "BAD_SNAPSHOT_TREE",
            Error::EmptySnapshotTree => "EMPTY_SNAPSHOT_TREE",
            Error::BadFileName { .. } => "BAD_FILE_NAME",
            Error::Unexpected(_) => "UNEXPECTED",
            Error::NotEnoughSpaceForSnapshot { .. } => "FREE_DISK_SPACE_FOR_CREATE_SNAPSHOT",
            Error::NotEnoughSpaceForClone { .. } => "FREE_DISK_SPACE_FOR_CLONE",
            Error::GetFreeSpaceFailed { .. } => "GET_DISK_FREE_SPACE_FAILED",
            Error::PermissionDenied { .. } => "PERMISSION_DENIED",
            Error::AccessDenied { .. } => "ACCESS_TO_VM_DENIED",
            Error::AccessToVmHddDenied { .. } => "ACCESS_TO_VM_HDD_DENIED",
            Error::AccessToCloneDeviceDenied { .. } => "ACCESS_TO_CLONE_VM_DEVICE_DENIED",
            Error::AlreadyExists { .. } => "FILE_OR_DIR_ALREADY_EXISTS",
            Error::MakeDirectory { .. } => "MAKE_DIRECTORY",
            Error::CreateSnapshotFailed(_) => "VM_CREATE_SNAPSHOT_FAILED",
            Error::DeleteStateFailed(_) => "VM_DELETE_STATE_FAILED",
            Error::RestoreStateFailed(_) => "VM_RESTORE_STATE_FAILED",
            Error::DeleteUnfinishedStateFailed(_) => "VM_DELETE_UNFINISHED_STATE_FAILED",
            Error::UnexpectedDisconnect { .. } => "VM_CONNECTION_DROPPED",
            Error::GuestToolsUnavailable { .. } => "GUEST_TOOLS_NOT_AVAILABLE",
            Error::Agent { .. } => "AGENT_FAILURE",
            Error::Disk { .. } => "DISK_FAILURE",
            Error::SnapshotsNotAllowedForBootcamp { .. } => "SNAPSHOTS_NOT_ALLOWED_FOR_BOOTCAMP",
            Error::OperationCancelled => "OPERATION_WAS_CANCELED",
            Error::SnapshotDeletionCancelled => "SNAPSHOT_DELETE_CANCELED",
            Error::CloneCancelled => "CLONE_OPERATION_CANCELED",
            Error::HddImageCloneToSelf { .. } => "HDD_IMAGE_CLONE_TO_SELF",
            Error::VmNameEmpty => "VM_NAME_IS_EMPTY",
            Error::VmConfigAlreadyExists { .. } => "VM_CONFIG_ALREADY_EXISTS",
            Error::ChangeSidNotSupported { .. } => "CHANGESID_NOT_SUPPORTED",
            Error::ChangeSidGuestToolsNotAvailable { .. } => "CHANGESID_GUEST_TOOLS_NOT_AVAILABLE",
            Error::VmNotFound(_) => "VM_NOT_FOUND",
            Error::Config(_) | Error::ConfigLoad(_) | Error::ConfigSave(_) => "CONFIG",
            Error::Io(_) => "IO",
        };
        code.to_string()
    }
}
