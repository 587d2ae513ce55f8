//! On-disk layout of snapshot files inside a VM home.

use crate::error::{Error, Result};
use crate::vm::{SUSPEND_MEM_FILE, SUSPEND_PNG_FILE, SUSPEND_SAV_FILE};
use std::path::{Path, PathBuf};

/// Snapshot tree file, relative to the VM home.
pub const TREE_FILE: &str = "Snapshots.xml";

/// Directory holding per-snapshot files, relative to the VM home.
pub const SNAPSHOTS_DIR: &str = "Snapshots";

/// Per-snapshot file paths for one VM.
#[derive(Debug, Clone)]
pub struct SnapshotFiles {
    home: PathBuf,
}

impl SnapshotFiles {
    /// Layout rooted at a VM home.
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    /// `Snapshots.xml`.
    pub fn tree(&self) -> PathBuf {
        self.home.join(TREE_FILE)
    }

    /// `Snapshots/`.
    pub fn dir(&self) -> PathBuf {
        self.home.join(SNAPSHOTS_DIR)
    }

    fn file(&self, guid: &str, ext: &str) -> PathBuf {
        self.dir().join(format!("{}.{}", guid, ext))
    }

    /// Suspend-state file of a snapshot.
    pub fn sav(&self, guid: &str) -> PathBuf {
        self.file(guid, "sav")
    }

    /// Memory image of a snapshot.
    pub fn mem(&self, guid: &str) -> PathBuf {
        self.file(guid, "mem")
    }

    /// Screenshot of a snapshot.
    pub fn png(&self, guid: &str) -> PathBuf {
        self.file(guid, "png")
    }

    /// Saved VM configuration of a snapshot.
    pub fn cfg(&self, guid: &str) -> PathBuf {
        self.file(guid, "cfg")
    }

    /// Every file a snapshot may own.
    pub fn all(&self, guid: &str) -> [PathBuf; 4] {
        [self.sav(guid), self.mem(guid), self.png(guid), self.cfg(guid)]
    }

    /// Create `Snapshots/` if missing.
    pub fn ensure_dir(&self) -> Result<()> {
        let dir = self.dir();
        std::fs::create_dir_all(&dir).map_err(|e| Error::MakeDirectory {
            path: dir,
            reason: e.to_string(),
        })
    }

    /// Copy the VM's suspend files into the snapshot. Returns the files created.
    pub fn capture_suspend(&self, guid: &str) -> Result<Vec<PathBuf>> {
        let pairs = [
            (SUSPEND_SAV_FILE, self.sav(guid)),
            (SUSPEND_MEM_FILE, self.mem(guid)),
            (SUSPEND_PNG_FILE, self.png(guid)),
        ];
        let mut created = Vec::new();
        for (name, target) in pairs {
            let source = self.home.join(name);
            if !source.exists() {
                continue;
            }
            if let Err(e) = std::fs::copy(&source, &target) {
                remove_files(&created);
                return Err(Error::CreateSnapshotFailed(format!(
                    "copy {} to {}: {}",
                    source.display(),
                    target.display(),
                    e
                )));
            }
            created.push(target);
        }
        Ok(created)
    }

    /// Copy a snapshot's suspend files back over the VM's own.
    pub fn restore_suspend(&self, guid: &str) -> Result<()> {
        let pairs = [
            (self.sav(guid), SUSPEND_SAV_FILE),
            (self.mem(guid), SUSPEND_MEM_FILE),
            (self.png(guid), SUSPEND_PNG_FILE),
        ];
        for (source, name) in pairs {
            if !source.exists() {
                continue;
            }
            let target = self.home.join(name);
            std::fs::copy(&source, &target).map_err(|e| {
                Error::RestoreStateFailed(format!("restore {}: {}", target.display(), e))
            })?;
        }
        Ok(())
    }

    /// Drop the VM's own suspend files.
    pub fn clear_suspend(&self) {
        let files: Vec<PathBuf> = [SUSPEND_SAV_FILE, SUSPEND_MEM_FILE, SUSPEND_PNG_FILE]
            .iter()
            .map(|name| self.home.join(name))
            .collect();
        remove_files(&files);
    }

    /// Delete every file owned by a snapshot.
    pub fn remove(&self, guid: &str) {
        remove_files(&self.all(guid));
    }
}

/// Best-effort removal; failures other than "missing" are logged.
pub fn remove_files(paths: &[PathBuf]) {
    for path in paths {
        remove_file(path);
    }
}

fn remove_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove snapshot file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_paths() {
        let files = SnapshotFiles::new("/vms/web");
        assert_eq!(files.tree(), PathBuf::from("/vms/web/Snapshots.xml"));
        assert_eq!(files.mem("{g}"), PathBuf::from("/vms/web/Snapshots/{g}.mem"));
        assert_eq!(files.cfg("{g}"), PathBuf::from("/vms/web/Snapshots/{g}.cfg"));
    }

    #[test]
    fn test_capture_and_restore_suspend() {
        let home = TempDir::new().unwrap();
        let files = SnapshotFiles::new(home.path());
        files.ensure_dir().unwrap();
        std::fs::write(home.path().join(SUSPEND_SAV_FILE), b"sav").unwrap();
        std::fs::write(home.path().join(SUSPEND_MEM_FILE), b"mem").unwrap();

        let created = files.capture_suspend("{g}").unwrap();
        assert_eq!(created.len(), 2);
        assert_eq!(std::fs::read(files.sav("{g}")).unwrap(), b"sav");
        assert!(!files.png("{g}").exists());

        files.clear_suspend();
        assert!(!home.path().join(SUSPEND_SAV_FILE).exists());

        files.restore_suspend("{g}").unwrap();
        assert_eq!(std::fs::read(home.path().join(SUSPEND_MEM_FILE)).unwrap(), b"mem");

        files.remove("{g}");
        assert!(!files.sav("{g}").exists());
        assert!(!files.mem("{g}").exists());
    }
}
