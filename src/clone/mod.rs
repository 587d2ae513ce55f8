//! VM cloning.
//!
//! A clone builds a new VM home next to the source: devices are copied
//! (or, for a linked clone, hard disks are backed by a fresh snapshot of
//! the source), the configuration gets a new identity, and the result is
//! registered in the catalogue. Everything created on the way is recorded
//! in a [`Journal`] and removed again if the clone does not complete.

pub mod journal;
pub mod network;

pub use journal::Journal;

use crate::catalogue::CatalogueItem;
use crate::context::{DispatcherContext, OpContext};
use crate::disk::drive_job;
use crate::error::{CloneDevice, Error, Result};
use crate::events::{Answer, Event, EventKind, Question};
use crate::exclusive::CommandKind;
use crate::host::space::to_mb;
use crate::host::Impersonation;
use crate::snapshot::files::{SNAPSHOTS_DIR, TREE_FILE};
use crate::snapshot::{CreateRequest, DeleteOptions, SnapshotEngine, SnapshotFiles};
use crate::vm::{DiskEmulation, GuestOs, VmConfig, VmLocation, VmType, CONFIG_FILE, VM_INFO_FILE};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Hard disks stored outside the source home.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalDisks {
    /// The clone refers to the same image.
    #[default]
    Link,
    /// The clone drops the device.
    Detach,
}

/// Parameters of a clone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloneRequest {
    /// Name of the new VM.
    pub name: String,
    /// Directory the new home is created in. Defaults to the VM root.
    #[serde(default)]
    pub home_parent: Option<PathBuf>,
    /// Back the clone's disks by a snapshot of the source.
    #[serde(default)]
    pub linked: bool,
    /// Register the clone as a template.
    #[serde(default)]
    pub template: bool,
    /// Regenerate the Windows SID on first boot.
    #[serde(default)]
    pub change_sid: bool,
    /// Keep boot camp partitions attached.
    #[serde(default)]
    pub import_bootcamp: bool,
    /// What to do with disks outside the source home.
    #[serde(default)]
    pub external_disks: ExternalDisks,
    /// Answer yes to every question.
    #[serde(default)]
    pub force: bool,
}

impl CloneRequest {
    /// Full clone under the default VM root.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// A completed clone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CloneOutcome {
    /// Registration of the new VM.
    pub vm: CatalogueItem,
    /// Source snapshot backing a linked clone.
    pub source_snapshot: Option<String>,
}

/// Translate backend failures into the device class that was being copied.
fn copy_failure(device: CloneDevice, path: &Path, err: Error) -> Error {
    match err {
        Error::Disk { reason, .. } => Error::device_copy(device, path, reason),
        Error::Io(e) => Error::device_copy(device, path, e),
        other => other,
    }
}

fn copy_dir(from: &Path, to: &Path) -> io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let dest = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &dest)?;
        } else {
            std::fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}

/// Bytes under `path`. Unreadable entries count as empty.
fn disk_usage(path: &Path) -> u64 {
    let Ok(meta) = std::fs::symlink_metadata(path) else {
        return 0;
    };
    if !meta.is_dir() {
        return meta.len();
    }
    std::fs::read_dir(path)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| disk_usage(&e.path()))
                .sum()
        })
        .unwrap_or(0)
}

/// Clone operations over a dispatcher context.
pub struct CloneEngine<'a> {
    ctx: &'a DispatcherContext,
}

impl<'a> CloneEngine<'a> {
    /// Create an engine.
    pub fn new(ctx: &'a DispatcherContext) -> Self {
        Self { ctx }
    }

    fn warn_client(&self, op: &OpContext, source: &VmLocation, message: String) {
        self.ctx.collab.channel.send_event(Event::to_session(
            &op.session,
            &source.id,
            EventKind::Warning { message },
        ));
    }

    fn progress(&self, op: &OpContext, source: &VmLocation, percent: u32) {
        self.ctx.collab.channel.send_event(Event::to_session(
            &op.session,
            &source.id,
            EventKind::Progress {
                operation: "clone_vm".to_string(),
                percent: percent.min(100),
            },
        ));
    }

    /// Clone `source` into a new registered VM.
    ///
    /// On any failure, including cancellation, the partially built VM is
    /// removed and its catalogue reservation released.
    pub fn clone_vm(
        &self,
        op: &OpContext,
        source: &VmLocation,
        request: &CloneRequest,
    ) -> Result<CloneOutcome> {
        let result = self.run(op, source, request).map_err(|e| {
            if e.is_cancellation() {
                Error::CloneCancelled
            } else {
                e
            }
        });
        match &result {
            Ok(outcome) => tracing::info!(
                source = %source.id,
                uuid = %outcome.vm.uuid,
                name = %outcome.vm.name,
                linked = request.linked,
                "vm cloned"
            ),
            Err(Error::CloneCancelled) => {
                tracing::info!(source = %source.id, name = %request.name, "clone cancelled")
            }
            Err(e) => {
                tracing::warn!(source = %source.id, name = %request.name, error = %e, "clone failed")
            }
        }
        result
    }

    fn run(&self, op: &OpContext, source: &VmLocation, request: &CloneRequest) -> Result<CloneOutcome> {
        if request.name.trim().is_empty() {
            return Err(Error::VmNameEmpty);
        }
        let parent = request
            .home_parent
            .clone()
            .unwrap_or_else(|| self.ctx.config.vm_root.clone());
        let home = parent.join(&request.name);
        if home.join(CONFIG_FILE).exists() {
            return Err(Error::VmConfigAlreadyExists {
                path: home.join(CONFIG_FILE),
            });
        }

        let kind = if request.linked {
            CommandKind::CloneLinked
        } else {
            CommandKind::Clone
        };
        let registry = &self.ctx.registry;
        let lock = registry.lock(&source.id, kind, &op.session, &op.task)?;
        let config = VmConfig::load(&source.home)?;
        self.check_source(op, source, &config, kind, request)?;

        if !request.linked {
            let _lock = lock;
            let vm = self.build(op, source, &config, &home, request, None)?;
            return Ok(CloneOutcome {
                vm,
                source_snapshot: None,
            });
        }

        lock.release()?;
        // The source is unlocked until lock_wait returns.
        let guid = SnapshotEngine::new(self.ctx)
            .create(
                &op.subtask(),
                source,
                &CreateRequest {
                    name: format!("Linked clone {}", request.name),
                    description: String::new(),
                },
            )?
            .guid;
        let built = registry
            .lock_wait(&source.id, kind, &op.session, &op.task, &op.cancel)
            .and_then(|_lock| self.build(op, source, &config, &home, request, Some(&guid)));
        match built {
            Ok(vm) => Ok(CloneOutcome {
                vm,
                source_snapshot: Some(guid),
            }),
            Err(e) => {
                self.discard_snapshot(op, source, &guid);
                Err(e)
            }
        }
    }

    /// Create, fill and register the clone home. Anything created is
    /// removed again unless this returns `Ok`.
    fn build(
        &self,
        op: &OpContext,
        source: &VmLocation,
        config: &VmConfig,
        home: &Path,
        request: &CloneRequest,
        snapshot: Option<&str>,
    ) -> Result<CatalogueItem> {
        let uuid = Uuid::new_v4().to_string();
        let reservation = self.ctx.catalogue.reserve(&uuid, home, &request.name)?;
        let _as_user = Impersonation::begin(self.ctx.collab.impersonator.as_ref(), &op.session)?;
        let mut journal = Journal::create_root(home)?;
        tracing::debug!(source = %source.id, home = %home.display(), uuid = %uuid, "clone root created");

        self.check_space(op, source, config, home, request)?;

        let mut target = config.clone();
        self.rewrite_config(config, &mut target, &uuid, request);
        self.copy_devices(op, source, &mut target, &mut journal, request, snapshot)?;

        op.cancel.check()?;
        journal.record(home.join(CONFIG_FILE));
        target.save(home)?;

        let item = CatalogueItem {
            uuid,
            name: request.name.clone(),
            home: home.to_path_buf(),
            template: request.template,
        };
        reservation.commit(item.clone())?;
        journal.commit();

        self.ctx.collab.channel.send_event(Event::broadcast(
            &self.ctx.identity(&item.uuid),
            EventKind::VmAdded {
                uuid: item.uuid.clone(),
                name: item.name.clone(),
            },
        ));
        Ok(item)
    }

    /// Delete the source snapshot taken for a linked clone that failed.
    fn discard_snapshot(&self, op: &OpContext, source: &VmLocation, guid: &str) {
        let cleanup = OpContext::new(op.session.clone());
        let options = DeleteOptions {
            child: false,
            merge: true,
        };
        match SnapshotEngine::new(self.ctx).destroy(&cleanup, source, guid, options) {
            Ok(()) => tracing::debug!(source = %source.id, guid, "linked clone snapshot removed"),
            Err(e) => {
                tracing::warn!(source = %source.id, guid, error = %e, "failed to remove linked clone snapshot")
            }
        }
    }

    /// VM access, read access to every source device, and SID-change support.
    fn check_source(
        &self,
        op: &OpContext,
        source: &VmLocation,
        config: &VmConfig,
        kind: CommandKind,
        request: &CloneRequest,
    ) -> Result<()> {
        let access = self.ctx.collab.access.as_ref();
        access.check_access(&op.session, kind, source)?;

        let images = config
            .hard_disks
            .iter()
            .filter(|d| d.emulation == DiskEmulation::Image)
            .map(|d| &d.path);
        let others = config
            .floppies
            .iter()
            .chain(&config.serial_ports)
            .chain(&config.parallel_ports)
            .map(|d| &d.path);
        for path in images.chain(others).chain(config.nvram.as_ref()) {
            let path = source.resolve(path);
            if path.exists() && !access.check_device_access(&op.session, &path) {
                return Err(Error::AccessToCloneDeviceDenied { path });
            }
        }

        if request.change_sid {
            if config.guest_os != GuestOs::Windows {
                return Err(Error::ChangeSidNotSupported {
                    vm: config.name.clone(),
                });
            }
            if let Err(e) = self.ctx.collab.agent.guest_agent_version(source) {
                tracing::debug!(vm = %source.id, error = %e, "guest tools did not answer");
                return Err(Error::ChangeSidGuestToolsNotAvailable {
                    vm: config.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Bytes the clone will write: everything copied rather than linked.
    fn estimate(&self, source_home: &Path, config: &VmConfig, request: &CloneRequest) -> u64 {
        let inside = |p: &Path| {
            let p = VmConfig::resolve(source_home, p);
            p.starts_with(source_home).then_some(p)
        };
        let disks: u64 = config
            .hard_disks
            .iter()
            .filter(|d| d.emulation == DiskEmulation::Image)
            .filter(|d| !(request.linked && d.is_active_image()))
            .filter_map(|d| inside(&d.path))
            .map(|p| disk_usage(&p))
            .sum();
        let devices: u64 = config
            .floppies
            .iter()
            .chain(&config.serial_ports)
            .chain(&config.parallel_ports)
            .map(|d| d.path.as_path())
            .chain(config.nvram.as_deref())
            .filter_map(inside)
            .map(|p| disk_usage(&p))
            .sum();
        let snapshots = if request.linked {
            0
        } else {
            disk_usage(&source_home.join(SNAPSHOTS_DIR))
        };
        disks + devices + snapshots
    }

    fn check_space(
        &self,
        op: &OpContext,
        source: &VmLocation,
        config: &VmConfig,
        home: &Path,
        request: &CloneRequest,
    ) -> Result<()> {
        let required = self.estimate(&source.home, config, request);

        let (question, refused) = match self.ctx.collab.space.free_bytes(home) {
            Ok(available) if available > required => return Ok(()),
            Ok(available) => {
                tracing::warn!(
                    home = %home.display(),
                    required_mb = to_mb(required),
                    available_mb = to_mb(available),
                    force = request.force,
                    "free space looks insufficient for clone"
                );
                (
                    Question::NotEnoughSpaceForClone {
                        vm_uuid: config.uuid.clone(),
                        required_mb: to_mb(required),
                        available_mb: to_mb(available),
                    },
                    Error::NotEnoughSpaceForClone {
                        name: config.name.clone(),
                    },
                )
            }
            Err(Error::GetFreeSpaceFailed { path, reason }) => {
                tracing::warn!(path = %path.display(), reason = %reason, force = request.force, "cannot get free space for clone");
                (
                    Question::CannotGetDiskFreeSpace {
                        vm_uuid: config.uuid.clone(),
                    },
                    Error::OperationCancelled,
                )
            }
            Err(e) => return Err(e),
        };
        if request.force {
            return Ok(());
        }
        match self.ctx.collab.channel.ask(&op.session, question) {
            Answer::Yes => Ok(()),
            Answer::No => Err(refused),
        }
    }

    /// New identity for the target configuration.
    fn rewrite_config(&self, source: &VmConfig, target: &mut VmConfig, uuid: &str, request: &CloneRequest) {
        target.uuid = uuid.to_string();
        target.name = request.name.clone();
        target.template = request.template;
        target.pending_sid_change = request.change_sid;
        let prefix = match target.vm_type {
            VmType::Vm => &self.ctx.config.mac_prefix_vm,
            VmType::Ct => &self.ctx.config.mac_prefix_ct,
        };
        network::regenerate(
            &mut target.net_adapters,
            prefix,
            source.template || request.template,
        );
    }

    /// Copy one file-backed device into the clone home.
    ///
    /// Returns the device's new home-relative path, or `None` when the
    /// device stays as it is (outside the source home, or no file yet).
    fn copy_file(
        &self,
        source: &VmLocation,
        path: &Path,
        device: CloneDevice,
        journal: &mut Journal,
    ) -> Result<Option<PathBuf>> {
        let from = source.resolve(path);
        if !from.starts_with(&source.home) || !from.exists() {
            return Ok(None);
        }
        let name = from
            .file_name()
            .map(PathBuf::from)
            .ok_or_else(|| Error::device_copy(device, &from, "no file name"))?;
        let to = journal.root().join(&name);
        if to.exists() {
            return Err(Error::AlreadyExists { path: to });
        }
        journal.record(&to);
        std::fs::copy(&from, &to).map_err(|e| Error::device_copy(device, &from, e))?;
        Ok(Some(name))
    }

    fn copy_devices(
        &self,
        op: &OpContext,
        source: &VmLocation,
        target: &mut VmConfig,
        journal: &mut Journal,
        request: &CloneRequest,
        snapshot: Option<&str>,
    ) -> Result<()> {
        let ports = [
            (CloneDevice::SerialPort, &mut target.serial_ports),
            (CloneDevice::ParallelPort, &mut target.parallel_ports),
            (CloneDevice::Floppy, &mut target.floppies),
        ];
        for (class, devices) in ports {
            for device in devices.iter_mut() {
                op.cancel.check()?;
                if let Some(path) = self.copy_file(source, &device.path, class, journal)? {
                    device.path = path;
                }
            }
        }

        self.copy_file(source, Path::new(VM_INFO_FILE), CloneDevice::VmInfo, journal)?;
        if let Some(nvram) = target.nvram.clone() {
            if let Some(path) = self.copy_file(source, &nvram, CloneDevice::Nvram, journal)? {
                target.nvram = Some(path);
            }
        }

        self.copy_disks(op, source, target, journal, request, snapshot)?;

        if snapshot.is_none() {
            self.copy_snapshots(source, target, journal)?;
        }
        Ok(())
    }

    fn copy_disks(
        &self,
        op: &OpContext,
        source: &VmLocation,
        target: &mut VmConfig,
        journal: &mut Journal,
        request: &CloneRequest,
        snapshot: Option<&str>,
    ) -> Result<()> {
        let disks = self.ctx.collab.disks.as_ref();
        let mut detached = Vec::new();
        let mut external = Vec::new();
        let total = target.hard_disks.len().max(1) as u32;

        for (step, disk) in target.hard_disks.iter_mut().enumerate() {
            op.cancel.check()?;
            let step = step as u32;
            if disk.emulation == DiskEmulation::RealDevice {
                if disk.bootcamp && !request.import_bootcamp {
                    detached.push(disk.index);
                    self.warn_client(
                        op,
                        source,
                        format!("boot camp partition {} is not attached to the clone", disk.path.display()),
                    );
                }
                continue;
            }

            let from = source.resolve(&disk.path);
            if !from.starts_with(&source.home) {
                match request.external_disks {
                    ExternalDisks::Link => disk.path = from.clone(),
                    ExternalDisks::Detach => detached.push(disk.index),
                }
                external.push(from);
                continue;
            }

            let name = from
                .file_name()
                .map(PathBuf::from)
                .ok_or_else(|| Error::device_copy(CloneDevice::HardDisk, &from, "no file name"))?;
            let to = journal.root().join(&name);
            if to == from {
                return Err(Error::HddImageCloneToSelf { path: from });
            }

            let (class, job) = match snapshot.filter(|_| disk.is_active_image()) {
                Some(guid) => (CloneDevice::LinkedHardDisk, disks.create_linked(&from, guid, &to)),
                None => (CloneDevice::HardDisk, disks.copy_image(&from, &to)),
            };
            let job = job.map_err(|e| copy_failure(class, &from, e))?;
            journal.record(&to);
            drive_job(job, &op.cancel, |p| {
                self.progress(op, source, (100 * step + p) / total)
            })
            .map_err(|e| copy_failure(class, &from, e))?;
            disk.path = name;
        }

        if !external.is_empty() {
            let paths: Vec<String> = external.iter().map(|p| p.display().to_string()).collect();
            let message = match request.external_disks {
                ExternalDisks::Link => format!("clone shares external hard disks: {}", paths.join(", ")),
                ExternalDisks::Detach => {
                    format!("external hard disks detached from clone: {}", paths.join(", "))
                }
            };
            self.warn_client(op, source, message);
        }
        target.hard_disks.retain(|d| !detached.contains(&d.index));
        Ok(())
    }

    /// Snapshot tree and per-snapshot files of a full clone.
    fn copy_snapshots(&self, source: &VmLocation, target: &VmConfig, journal: &mut Journal) -> Result<()> {
        let files = SnapshotFiles::new(&source.home);
        let tree = files.tree();
        if tree.exists() {
            let to = journal.root().join(TREE_FILE);
            journal.record(&to);
            std::fs::copy(&tree, &to).map_err(|e| Error::device_copy(CloneDevice::Snapshots, &tree, e))?;
        }

        let dir = files.dir();
        if !dir.is_dir() {
            return Ok(());
        }
        let to = journal.root().join(SNAPSHOTS_DIR);
        journal.record(&to);
        copy_dir(&dir, &to).map_err(|e| Error::device_copy(CloneDevice::Snapshots, &dir, e))?;

        let copied = SnapshotFiles::new(journal.root());
        let entries = std::fs::read_dir(copied.dir())
            .map_err(|e| Error::device_copy(CloneDevice::Snapshots, &dir, e))?;
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "cfg") {
                continue;
            }
            let mut saved = VmConfig::load_from(&path)?;
            saved.uuid = target.uuid.clone();
            saved.name = target.name.clone();
            saved.template = target.template;
            saved.net_adapters = target.net_adapters.clone();
            saved.save_to(&path)?;
        }
        Ok(())
    }
}
