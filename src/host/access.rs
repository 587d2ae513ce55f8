//! Caller access checks.

use super::c_path;
use crate::error::{Error, Result};
use crate::exclusive::CommandKind;
use crate::vm::{SessionId, VmLocation};
use std::path::Path;

/// Decides whether a session may act on a VM or read one of its devices.
pub trait AccessCheck: Send + Sync {
    /// Check VM-level access for a command.
    fn check_access(&self, session: &SessionId, command: CommandKind, vm: &VmLocation) -> Result<()>;

    /// Whether the session may read a device file.
    fn check_device_access(&self, session: &SessionId, device: &Path) -> bool;
}

/// [`AccessCheck`] backed by `access(2)` for the current effective identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsAccessCheck;

fn accessible(path: &Path, mode: libc::c_int) -> bool {
    match c_path(path) {
        Some(c) => unsafe { libc::access(c.as_ptr(), mode) == 0 },
        None => false,
    }
}

impl AccessCheck for FsAccessCheck {
    fn check_access(&self, _session: &SessionId, command: CommandKind, vm: &VmLocation) -> Result<()> {
        let mode = match command {
            CommandKind::Clone | CommandKind::CloneLinked => libc::R_OK,
            _ => libc::R_OK | libc::W_OK,
        };
        if accessible(&vm.config_path(), mode) {
            Ok(())
        } else {
            Err(Error::AccessDenied {
                vm: vm.id.to_string(),
            })
        }
    }

    fn check_device_access(&self, _session: &SessionId, device: &Path) -> bool {
        accessible(device, libc::R_OK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::VmIdentity;
    use tempfile::TempDir;

    #[test]
    fn test_fs_access() {
        let dir = TempDir::new().unwrap();
        let vm = VmLocation::new(VmIdentity::new("default", "web"), dir.path());
        let session = SessionId::new("s1");
        let check = FsAccessCheck;

        assert!(matches!(
            check.check_access(&session, CommandKind::CreateSnapshot, &vm),
            Err(Error::AccessDenied { .. })
        ));

        std::fs::write(vm.config_path(), b"{}").unwrap();
        check
            .check_access(&session, CommandKind::CreateSnapshot, &vm)
            .unwrap();
        assert!(check.check_device_access(&session, &vm.config_path()));
        assert!(!check.check_device_access(&session, &dir.path().join("nope")));
    }
}
