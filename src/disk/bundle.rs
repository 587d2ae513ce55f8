//! Directory-bundle disk images.
//!
//! A disk is a directory:
//!
//! ```text
//! harddisk.hdd/
//!   descriptor.json   states, current state, pending op, backing file
//!   disk.hds          active image
//!   {guid}.hds        frozen snapshot state
//! ```
//!
//! Every multi-step operation records a pending marker in the descriptor
//! before touching files and clears it last, so an interrupted operation
//! stays visible to [`DiskBackend::inspect`].

use super::{finished_job, DiskBackend, DiskJob, PendingOp, UnfinishedOp};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Descriptor file inside a bundle.
pub const DESCRIPTOR_FILE: &str = "descriptor.json";

/// Active image inside a bundle.
pub const ACTIVE_IMAGE: &str = "disk.hds";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct DiskState {
    guid: String,
    #[serde(default)]
    parent: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Descriptor {
    #[serde(default)]
    states: Vec<DiskState>,
    #[serde(default)]
    current: Option<String>,
    #[serde(default)]
    pending: Option<PendingOp>,
    #[serde(default)]
    backing: Option<PathBuf>,
}

impl Descriptor {
    fn state(&self, guid: &str) -> Option<&DiskState> {
        self.states.iter().find(|s| s.guid == guid)
    }
}

type Step = Box<dyn FnOnce() -> Result<u32> + Send>;

fn job_from(steps: Vec<Step>) -> DiskJob {
    Box::new(steps.into_iter().map(|step| step()))
}

fn state_file(disk: &Path, guid: &str) -> PathBuf {
    disk.join(format!("{}.hds", guid))
}

fn read_descriptor(disk: &Path) -> Result<Descriptor> {
    if !disk.is_dir() {
        return Err(Error::disk(disk, "not a disk bundle"));
    }
    let path = disk.join(DESCRIPTOR_FILE);
    match std::fs::read(&path) {
        Ok(data) => serde_json::from_slice(&data).map_err(|e| Error::disk(disk, e)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Descriptor::default()),
        Err(e) => Err(Error::disk(disk, e)),
    }
}

fn write_descriptor(disk: &Path, descriptor: &Descriptor) -> Result<()> {
    let data = serde_json::to_vec_pretty(descriptor).map_err(|e| Error::disk(disk, e))?;
    let tmp = disk.join(format!("{}.tmp", DESCRIPTOR_FILE));
    std::fs::write(&tmp, data).map_err(|e| Error::disk(disk, e))?;
    std::fs::rename(&tmp, disk.join(DESCRIPTOR_FILE)).map_err(|e| Error::disk(disk, e))
}

fn remove_if_exists(disk: &Path, path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::disk(disk, e)),
    }
}

fn set_pending(disk: &Path, pending: PendingOp) -> Result<()> {
    let mut d = read_descriptor(disk)?;
    d.pending = Some(pending);
    write_descriptor(disk, &d)
}

/// Drop a state from the descriptor and clear the pending marker.
fn finish_delete(disk: &Path, guid: &str) -> Result<()> {
    let mut d = read_descriptor(disk)?;
    let parent = d.state(guid).and_then(|s| s.parent.clone());
    d.states.retain(|s| s.guid != guid);
    for state in d.states.iter_mut() {
        if state.parent.as_deref() == Some(guid) {
            state.parent = parent.clone();
        }
    }
    if d.current.as_deref() == Some(guid) {
        d.current = parent;
    }
    d.pending = None;
    write_descriptor(disk, &d)
}

fn delete_steps(disk: &Path, guid: &str) -> Vec<Step> {
    let (d1, g1) = (disk.to_path_buf(), guid.to_string());
    let (d2, g2) = (disk.to_path_buf(), guid.to_string());
    vec![
        Box::new(move || {
            remove_if_exists(&d1, &state_file(&d1, &g1))?;
            Ok(60)
        }),
        Box::new(move || {
            finish_delete(&d2, &g2)?;
            Ok(100)
        }),
    ]
}

/// [`DiskBackend`] over directory bundles.
#[derive(Debug, Clone, Copy, Default)]
pub struct BundleDiskBackend;

impl BundleDiskBackend {
    /// Create the backend.
    pub fn new() -> Self {
        Self
    }

    /// Create an empty bundle.
    pub fn create_image(disk: &Path) -> Result<()> {
        std::fs::create_dir_all(disk).map_err(|e| Error::disk(disk, e))?;
        std::fs::write(disk.join(ACTIVE_IMAGE), b"").map_err(|e| Error::disk(disk, e))?;
        write_descriptor(disk, &Descriptor::default())
    }

    /// Snapshot states stored in a bundle, oldest first.
    pub fn states(disk: &Path) -> Result<Vec<String>> {
        Ok(read_descriptor(disk)?
            .states
            .into_iter()
            .map(|s| s.guid)
            .collect())
    }

    /// Current state of a bundle.
    pub fn current_state(disk: &Path) -> Result<Option<String>> {
        Ok(read_descriptor(disk)?.current)
    }

    /// Backing file of a linked bundle.
    pub fn backing(disk: &Path) -> Result<Option<PathBuf>> {
        Ok(read_descriptor(disk)?.backing)
    }

    /// Record a pending op as if an operation had been interrupted.
    pub fn mark_pending(disk: &Path, pending: PendingOp) -> Result<()> {
        set_pending(disk, pending)
    }
}

impl DiskBackend for BundleDiskBackend {
    fn inspect(&self, disk: &Path) -> Result<Option<PendingOp>> {
        Ok(read_descriptor(disk)?
            .pending
            .filter(|p| p.op != UnfinishedOp::None))
    }

    fn create_state(&self, disk: &Path, guid: &str) -> Result<()> {
        let mut d = read_descriptor(disk)?;
        if d.state(guid).is_some() {
            return Err(Error::disk(disk, format!("state {} already exists", guid)));
        }
        let active = disk.join(ACTIVE_IMAGE);
        let frozen = state_file(disk, guid);
        if active.exists() {
            std::fs::copy(&active, &frozen).map_err(|e| Error::disk(disk, e))?;
        } else {
            std::fs::write(&frozen, b"").map_err(|e| Error::disk(disk, e))?;
        }
        d.states.push(DiskState {
            guid: guid.to_string(),
            parent: d.current.clone(),
        });
        d.current = Some(guid.to_string());
        write_descriptor(disk, &d)
    }

    fn delete_state(&self, disk: &Path, guid: &str, merge: bool) -> Result<DiskJob> {
        let d = read_descriptor(disk)?;
        if d.state(guid).is_none() {
            return Ok(finished_job());
        }
        let op = if merge {
            UnfinishedOp::Merge
        } else {
            UnfinishedOp::Delete
        };
        let (d0, g0) = (disk.to_path_buf(), guid.to_string());
        let mut steps: Vec<Step> = vec![Box::new(move || {
            set_pending(
                &d0,
                PendingOp {
                    op,
                    snapshot: Some(g0),
                },
            )?;
            Ok(10)
        })];
        steps.extend(delete_steps(disk, guid));
        Ok(job_from(steps))
    }

    fn switch_state(&self, disk: &Path, guid: &str) -> Result<DiskJob> {
        let d = read_descriptor(disk)?;
        if d.state(guid).is_none() {
            return Err(Error::disk(disk, format!("no state {}", guid)));
        }
        let (d1, g1) = (disk.to_path_buf(), guid.to_string());
        let (d2, g2) = (disk.to_path_buf(), guid.to_string());
        Ok(job_from(vec![
            Box::new(move || {
                std::fs::copy(state_file(&d1, &g1), d1.join(ACTIVE_IMAGE))
                    .map_err(|e| Error::disk(&d1, e))?;
                Ok(80)
            }),
            Box::new(move || {
                let mut d = read_descriptor(&d2)?;
                d.current = Some(g2);
                write_descriptor(&d2, &d)?;
                Ok(100)
            }),
        ]))
    }

    fn commit_unfinished(&self, disk: &Path) -> Result<DiskJob> {
        let d = read_descriptor(disk)?;
        match d.pending {
            None => Ok(finished_job()),
            Some(PendingOp {
                op,
                snapshot: Some(guid),
            }) if op.removes_state() => Ok(job_from(delete_steps(disk, &guid))),
            Some(_) => {
                let d1 = disk.to_path_buf();
                Ok(job_from(vec![Box::new(move || {
                    let mut d = read_descriptor(&d1)?;
                    d.pending = None;
                    write_descriptor(&d1, &d)?;
                    Ok(100)
                })]))
            }
        }
    }

    fn create_linked(&self, source: &Path, guid: &str, target: &Path) -> Result<DiskJob> {
        let d = read_descriptor(source)?;
        if d.state(guid).is_none() {
            return Err(Error::disk(source, format!("no state {}", guid)));
        }
        if target.exists() {
            return Err(Error::AlreadyExists {
                path: target.to_path_buf(),
            });
        }
        let backing = state_file(source, guid);
        let t1 = target.to_path_buf();
        let t2 = target.to_path_buf();
        Ok(job_from(vec![
            Box::new(move || {
                std::fs::create_dir_all(&t1).map_err(|e| Error::disk(&t1, e))?;
                Ok(30)
            }),
            Box::new(move || {
                std::fs::write(t2.join(ACTIVE_IMAGE), b"").map_err(|e| Error::disk(&t2, e))?;
                let descriptor = Descriptor {
                    backing: Some(backing),
                    ..Descriptor::default()
                };
                write_descriptor(&t2, &descriptor)?;
                Ok(100)
            }),
        ]))
    }

    fn copy_image(&self, source: &Path, target: &Path) -> Result<DiskJob> {
        if !source.is_dir() {
            return Err(Error::disk(source, "not a disk bundle"));
        }
        if target.exists() {
            return Err(Error::AlreadyExists {
                path: target.to_path_buf(),
            });
        }
        let mut files = Vec::new();
        for entry in std::fs::read_dir(source).map_err(|e| Error::disk(source, e))? {
            let entry = entry.map_err(|e| Error::disk(source, e))?;
            if entry.path().is_file() {
                files.push(entry.file_name());
            }
        }
        files.sort();

        let total = files.len() as u32 + 1;
        let t0 = target.to_path_buf();
        let mut steps: Vec<Step> = vec![Box::new(move || {
            std::fs::create_dir_all(&t0).map_err(|e| Error::disk(&t0, e))?;
            Ok(100 / total)
        })];
        for (i, name) in files.into_iter().enumerate() {
            let from = source.join(&name);
            let to = target.join(&name);
            let done = (i as u32 + 2) * 100 / total;
            steps.push(Box::new(move || {
                std::fs::copy(&from, &to).map_err(|e| Error::disk(&from, e))?;
                Ok(done)
            }));
        }
        Ok(job_from(steps))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::disk::drive_job;
    use tempfile::TempDir;

    fn run(job: DiskJob) {
        drive_job(job, &CancelToken::new(), |_| {}).unwrap();
    }

    fn disk(dir: &TempDir) -> PathBuf {
        let disk = dir.path().join("harddisk.hdd");
        BundleDiskBackend::create_image(&disk).unwrap();
        std::fs::write(disk.join(ACTIVE_IMAGE), b"v0").unwrap();
        disk
    }

    #[test]
    fn test_create_and_switch_state() {
        let dir = TempDir::new().unwrap();
        let disk = disk(&dir);
        let backend = BundleDiskBackend::new();

        backend.create_state(&disk, "a").unwrap();
        std::fs::write(disk.join(ACTIVE_IMAGE), b"v1").unwrap();
        backend.create_state(&disk, "b").unwrap();
        assert_eq!(BundleDiskBackend::states(&disk).unwrap(), vec!["a", "b"]);
        assert!(backend.create_state(&disk, "a").is_err());

        run(backend.switch_state(&disk, "a").unwrap());
        assert_eq!(std::fs::read(disk.join(ACTIVE_IMAGE)).unwrap(), b"v0");
        assert_eq!(BundleDiskBackend::current_state(&disk).unwrap().as_deref(), Some("a"));
    }

    #[test]
    fn test_delete_state_reparents() {
        let dir = TempDir::new().unwrap();
        let disk = disk(&dir);
        let backend = BundleDiskBackend::new();
        backend.create_state(&disk, "a").unwrap();
        backend.create_state(&disk, "b").unwrap();
        backend.create_state(&disk, "c").unwrap();

        run(backend.delete_state(&disk, "b", true).unwrap());
        assert_eq!(BundleDiskBackend::states(&disk).unwrap(), vec!["a", "c"]);
        assert!(!state_file(&disk, "b").exists());
        assert!(backend.inspect(&disk).unwrap().is_none());

        run(backend.delete_state(&disk, "c", false).unwrap());
        assert_eq!(BundleDiskBackend::current_state(&disk).unwrap().as_deref(), Some("a"));

        // unknown states are a no-op
        run(backend.delete_state(&disk, "zzz", false).unwrap());
    }

    #[test]
    fn test_interrupted_delete_is_pending() {
        let dir = TempDir::new().unwrap();
        let disk = disk(&dir);
        let backend = BundleDiskBackend::new();
        backend.create_state(&disk, "a").unwrap();

        let mut job = backend.delete_state(&disk, "a", false).unwrap();
        assert_eq!(job.next().unwrap().unwrap(), 10);
        drop(job);

        let pending = backend.inspect(&disk).unwrap().unwrap();
        assert_eq!(pending.op, UnfinishedOp::Delete);
        assert_eq!(pending.snapshot.as_deref(), Some("a"));

        run(backend.commit_unfinished(&disk).unwrap());
        assert!(backend.inspect(&disk).unwrap().is_none());
        assert!(BundleDiskBackend::states(&disk).unwrap().is_empty());
    }

    #[test]
    fn test_linked_and_copied_images() {
        let dir = TempDir::new().unwrap();
        let disk = disk(&dir);
        let backend = BundleDiskBackend::new();
        backend.create_state(&disk, "a").unwrap();

        let linked = dir.path().join("linked.hdd");
        run(backend.create_linked(&disk, "a", &linked).unwrap());
        assert_eq!(
            BundleDiskBackend::backing(&linked).unwrap(),
            Some(state_file(&disk, "a"))
        );

        let copy = dir.path().join("copy.hdd");
        run(backend.copy_image(&disk, &copy).unwrap());
        assert_eq!(std::fs::read(copy.join(ACTIVE_IMAGE)).unwrap(), b"v0");
        assert_eq!(BundleDiskBackend::states(&copy).unwrap(), vec!["a"]);

        assert!(matches!(
            backend.copy_image(&disk, &copy),
            Err(Error::AlreadyExists { .. })
        ));
    }

    #[test]
    fn test_missing_bundle_is_disk_error() {
        let dir = TempDir::new().unwrap();
        let backend = BundleDiskBackend::new();
        assert!(matches!(
            backend.inspect(&dir.path().join("nope.hdd")),
            Err(Error::Disk { .. })
        ));
    }
}
