//! Registrable command kinds and their compatibility table.

use crate::error::LockedFor;
use serde::{Deserialize, Serialize};

/// Command that can hold a VM in the exclusive registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    /// Start the VM.
    Start,
    /// Full clone.
    Clone,
    /// Linked clone.
    CloneLinked,
    /// Migration.
    Migrate,
    /// Migration that keeps the source as a clone.
    MigrateClone,
    /// Delete the VM.
    Delete,
    /// Unregister the VM.
    Unregister,
    /// Commit configuration edits.
    EditCommit,
    /// Commit configuration edits that rename the VM.
    EditWithRename,
    /// Commit configuration edits that change hardware.
    EditWithHardwareChanged,
    /// Change firewall rules.
    EditFirewall,
    /// Reconfigure a boot camp partition.
    EditBootcampReconfigure,
    /// Drop the suspended state.
    DropSuspendedState,
    /// Update security settings.
    UpdateSecurity,
    /// Create a snapshot.
    CreateSnapshot,
    /// Delete a snapshot.
    DeleteSnapshot,
    /// Revert to a snapshot.
    SwitchToSnapshot,
    /// Update snapshot name or description.
    UpdateSnapshotData,
    /// Finish interrupted disk operations.
    CommitDiskUnfinished,
    /// Create a backup.
    CreateBackup,
    /// Restore from a backup.
    RestoreBackup,
    /// Resize a disk.
    ResizeDisk,
    /// Compact disks.
    Compact,
    /// Convert disk formats.
    ConvertDisks,
    /// Copy a disk image.
    CopyImage,
    /// Move the VM home.
    Move,
    /// Mount guest filesystems.
    Mount,
    /// Unmount guest filesystems.
    Umount,
    /// Session-level exclusive lock.
    VmLock,
}

use CommandKind::*;

const BACKUP_CONFLICTS: &[CommandKind] = &[
    CreateBackup,
    RestoreBackup,
    Delete,
    Migrate,
    MigrateClone,
    Unregister,
    Compact,
    ResizeDisk,
    EditWithRename,
    ConvertDisks,
    Move,
];

const SNAPSHOT_CONFLICTS: &[CommandKind] = &[
    Clone,
    CloneLinked,
    Migrate,
    MigrateClone,
    Delete,
    Unregister,
    EditCommit,
    EditWithRename,
    EditWithHardwareChanged,
    EditFirewall,
    CreateBackup,
    RestoreBackup,
    ResizeDisk,
    Compact,
    ConvertDisks,
    CopyImage,
    Move,
];

impl CommandKind {
    /// Kinds that may be registered several times on the same VM.
    pub fn is_reentrant(self) -> bool {
        matches!(self, Clone | EditCommit | CopyImage | MigrateClone)
    }

    fn is_clone(self) -> bool {
        matches!(self, Clone | MigrateClone)
    }

    fn is_snapshot(self) -> bool {
        matches!(
            self,
            CreateSnapshot | DeleteSnapshot | SwitchToSnapshot | UpdateSnapshotData | CommitDiskUnfinished
        )
    }

    fn is_device_edit(self) -> bool {
        matches!(
            self,
            EditWithHardwareChanged | EditFirewall | EditBootcampReconfigure
        )
    }

    fn conflicts_with_backup(self) -> bool {
        BACKUP_CONFLICTS.contains(&self)
    }

    fn conflicts_with_snapshot(self) -> bool {
        SNAPSHOT_CONFLICTS.contains(&self)
    }

    /// Reason reported to callers blocked by this kind.
    pub fn locked_for(self) -> LockedFor {
        match self {
            Clone | CloneLinked => LockedFor::Clone,
            Delete => LockedFor::Delete,
            Unregister => LockedFor::Unregister,
            EditCommit => LockedFor::EditCommit,
            EditWithRename => LockedFor::EditCommitWithRename,
            UpdateSecurity => LockedFor::UpdateSecurity,
            EditWithHardwareChanged | EditBootcampReconfigure => {
                LockedFor::MustBeStoppedForChangeDevices
            }
            Start => LockedFor::Execute,
            Migrate | MigrateClone => LockedFor::Migrate,
            CreateSnapshot => LockedFor::CreateSnapshot,
            SwitchToSnapshot => LockedFor::SwitchToSnapshot,
            DeleteSnapshot | CommitDiskUnfinished => LockedFor::DeleteSnapshot,
            CreateBackup => LockedFor::Backup,
            RestoreBackup => LockedFor::RestoreFromBackup,
            VmLock => LockedFor::ExclusivelyLocked,
            ResizeDisk => LockedFor::DiskResize,
            Compact => LockedFor::DiskCompact,
            ConvertDisks => LockedFor::DiskConvert,
            EditFirewall => LockedFor::ChangeFirewall,
            CopyImage => LockedFor::CopyImage,
            Move => LockedFor::Move,
            DropSuspendedState | UpdateSnapshotData | Mount | Umount => LockedFor::Internal,
        }
    }

    /// Stable lower-case name.
    pub fn as_str(self) -> &'static str {
        match self {
            Start => "start",
            Clone => "clone",
            CloneLinked => "clone_linked",
            Migrate => "migrate",
            MigrateClone => "migrate_clone",
            Delete => "delete",
            Unregister => "unregister",
            EditCommit => "edit_commit",
            EditWithRename => "edit_with_rename",
            EditWithHardwareChanged => "edit_with_hardware_changed",
            EditFirewall => "edit_firewall",
            EditBootcampReconfigure => "edit_bootcamp_reconfigure",
            DropSuspendedState => "drop_suspended_state",
            UpdateSecurity => "update_security",
            CreateSnapshot => "create_snapshot",
            DeleteSnapshot => "delete_snapshot",
            SwitchToSnapshot => "switch_to_snapshot",
            UpdateSnapshotData => "update_snapshot_data",
            CommitDiskUnfinished => "commit_disk_unfinished",
            CreateBackup => "create_backup",
            RestoreBackup => "restore_backup",
            ResizeDisk => "resize_disk",
            Compact => "compact",
            ConvertDisks => "convert_disks",
            CopyImage => "copy_image",
            Move => "move",
            Mount => "mount",
            Umount => "umount",
            VmLock => "vm_lock",
        }
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Whether `cmd` may run while `exec` is held.
///
/// `same_session` and `same_task` compare the requester against the holder.
pub fn compatible(cmd: CommandKind, exec: CommandKind, same_session: bool, same_task: bool) -> bool {
    if cmd == exec {
        return cmd.is_reentrant();
    }

    if cmd == VmLock {
        return same_session || exec == Start;
    }

    let allowed = matches!((cmd, exec), (Start, EditCommit) | (EditCommit, Start))
        || (exec == EditCommit && cmd == EditWithRename)
        || (exec == Start && matches!(cmd, Migrate | MigrateClone | CreateBackup | Compact))
        || (cmd.is_device_edit() && exec != Start)
        || (exec.is_device_edit() && cmd != Start)
        || (exec == VmLock && same_session)
        || (exec == Compact && matches!(cmd, Start | EditCommit));
    if allowed {
        return true;
    }

    if cmd == RestoreBackup {
        return !exec.conflicts_with_backup();
    }
    if exec == CreateBackup {
        if cmd == CreateSnapshot && same_task {
            return true;
        }
        return !cmd.conflicts_with_backup();
    }
    if exec == RestoreBackup {
        return !(cmd.conflicts_with_backup() || cmd.is_snapshot() || cmd == Start);
    }
    if matches!(
        cmd,
        CreateSnapshot | SwitchToSnapshot | DeleteSnapshot | CommitDiskUnfinished
    ) {
        return !exec.conflicts_with_snapshot();
    }
    if cmd == ResizeDisk && exec == EditCommit && same_task {
        return true;
    }
    cmd.is_clone() && exec.is_clone()
}
