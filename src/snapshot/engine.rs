//! Create, delete and revert snapshots.
//!
//! Running and paused VMs are driven through the [`VmAgent`](crate::vm::VmAgent);
//! stopped and suspended VMs are handled directly on their disk images
//! and snapshot files. Every operation first finishes disk operations a
//! crash left behind.

use super::files::SnapshotFiles;
use super::tree::{SnapshotData, SnapshotInfo, SnapshotRuntime, SnapshotTree};
use super::unfinished::{DiskUnfinishedState, UnfinishedDiskOpScanner, UnfinishedPlan};
use crate::cancel::CancelToken;
use crate::context::{DispatcherContext, OpContext};
use crate::disk::{drive_job, DiskBackend};
use crate::error::{Error, LockedFor, Result};
use crate::events::{Event, EventKind};
use crate::exclusive::CommandKind;
use crate::host::space::to_mb;
use crate::host::Impersonation;
use crate::vm::{
    is_live, AgentCommand, AgentReply, PowerState, SnapshotVmState, VmAgent, VmConfig, VmLocation,
    WaitOutcome,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use uuid::Uuid;

/// Space kept free on top of the VM memory footprint, in MB.
const SPACE_MARGIN_MB: u64 = 10;

/// Parameters of a new snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateRequest {
    /// Display name.
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
}

/// How a snapshot is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteOptions {
    /// Also delete everything between the snapshot and the current one.
    #[serde(default)]
    pub child: bool,
    /// Fold deltas into the parent instead of discarding them.
    #[serde(default = "default_merge")]
    pub merge: bool,
}

fn default_merge() -> bool {
    true
}

impl Default for DeleteOptions {
    fn default() -> Self {
        Self {
            child: false,
            merge: true,
        }
    }
}

/// How a snapshot is restored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevertOptions {
    /// Restore a running snapshot as powered off.
    #[serde(default)]
    pub skip_resume: bool,
}

/// Result of a successful revert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RevertOutcome {
    /// The VM was stopped to complete the revert.
    pub vm_stopped: bool,
}

/// One step of a delete.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Removal {
    /// A single node, its children move up.
    Node { guid: String, merge: bool },
    /// A whole subtree, discarded. `guids` lists descendants before ancestors.
    Branch { root: String, guids: Vec<String> },
}

impl Removal {
    fn branch(tree: &SnapshotTree, root: &str) -> Self {
        let mut guids = tree.subtree_guids(root);
        guids.reverse();
        Removal::Branch {
            root: root.to_string(),
            guids,
        }
    }

    fn guids(&self) -> Vec<String> {
        match self {
            Removal::Node { guid, .. } => vec![guid.clone()],
            Removal::Branch { guids, .. } => guids.clone(),
        }
    }

    /// Disk states to delete, with their merge flag.
    fn states(&self) -> Vec<(String, bool)> {
        match self {
            Removal::Node { guid, merge } => vec![(guid.clone(), *merge)],
            Removal::Branch { guids, .. } => guids.iter().map(|g| (g.clone(), false)).collect(),
        }
    }

    fn apply(&self, tree: &mut SnapshotTree) -> Result<()> {
        match self {
            Removal::Node { guid, .. } => tree.delete_node(guid),
            Removal::Branch { root, .. } => tree.delete_branch(root),
        }
    }
}

/// Work needed to delete `target`.
///
/// With `child` set and the current snapshot below `target`, every node
/// from the current one's parent up to `target` is removed with the
/// requested merge mode, and their other branches are discarded. The
/// current snapshot itself stays.
fn removal_plan(tree: &SnapshotTree, target: &str, options: DeleteOptions) -> Vec<Removal> {
    if !options.child {
        return vec![Removal::Node {
            guid: target.to_string(),
            merge: options.merge,
        }];
    }
    let Some(current) = tree.current_guid() else {
        return vec![Removal::branch(tree, target)];
    };
    let ancestors = tree.path_to(current);
    let Some(pos) = ancestors.iter().position(|g| g == target) else {
        return vec![Removal::branch(tree, target)];
    };

    let mut plan = Vec::new();
    let mut keep = current.to_string();
    for node in &ancestors[..=pos] {
        for sibling in tree.children(node).iter().filter(|c| **c != keep) {
            plan.push(Removal::branch(tree, sibling));
        }
        plan.push(Removal::Node {
            guid: node.clone(),
            merge: options.merge,
        });
        keep = node.clone();
    }
    plan
}

/// Map collaborator failures to an operation's own failure code.
fn surface(err: Error, failed: fn(String) -> Error) -> Error {
    match err {
        Error::Agent { .. }
        | Error::Disk { .. }
        | Error::Io(_)
        | Error::GuestToolsUnavailable { .. }
        | Error::UnexpectedDisconnect { .. } => failed(err.to_string()),
        other => other,
    }
}

fn report<T>(operation: &'static str, vm: &VmLocation, result: &Result<T>) {
    match result {
        Ok(_) => tracing::info!(vm = %vm.id, operation, "snapshot operation finished"),
        Err(e) if e.is_consistency() => {
            tracing::error!(vm = %vm.id, operation, error = %e, "snapshot tree inconsistency")
        }
        Err(e) if e.is_cancellation() => {
            tracing::info!(vm = %vm.id, operation, "snapshot operation cancelled")
        }
        Err(e) => tracing::warn!(vm = %vm.id, operation, error = %e, "snapshot operation failed"),
    }
}

/// Snapshot files and disk states of a create in progress.
///
/// Dropped without [`commit`](Self::commit), it removes what was produced.
struct Capture<'a> {
    disks: &'a dyn DiskBackend,
    files: &'a SnapshotFiles,
    guid: String,
    states: Vec<PathBuf>,
    committed: bool,
}

impl<'a> Capture<'a> {
    fn new(disks: &'a dyn DiskBackend, files: &'a SnapshotFiles, guid: &str) -> Self {
        Self {
            disks,
            files,
            guid: guid.to_string(),
            states: Vec::new(),
            committed: false,
        }
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for Capture<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        tracing::debug!(guid = %self.guid, "discarding partial snapshot");
        self.files.remove(&self.guid);
        let cancel = CancelToken::new();
        for disk in &self.states {
            let undone = self
                .disks
                .delete_state(disk, &self.guid, false)
                .and_then(|job| drive_job(job, &cancel, |_| {}));
            if let Err(e) = undone {
                tracing::warn!(disk = %disk.display(), guid = %self.guid, error = %e, "failed to discard disk state");
            }
        }
    }
}

#[derive(Debug, Default)]
struct SwitchProgress {
    vm_stopped: bool,
    disks_touched: bool,
}

/// Snapshot operations over a dispatcher context.
pub struct SnapshotEngine<'a> {
    ctx: &'a DispatcherContext,
}

impl<'a> SnapshotEngine<'a> {
    /// Create an engine.
    pub fn new(ctx: &'a DispatcherContext) -> Self {
        Self { ctx }
    }

    fn agent(&self) -> &dyn VmAgent {
        self.ctx.collab.agent.as_ref()
    }

    fn disks(&self) -> &dyn DiskBackend {
        self.ctx.collab.disks.as_ref()
    }

    fn notify(&self, vm: &VmLocation, kind: EventKind) {
        self.ctx
            .collab
            .channel
            .send_event(Event::broadcast(&vm.id, kind));
    }

    fn progress(&self, op: &OpContext, vm: &VmLocation, operation: &str, percent: u32) {
        self.ctx.collab.channel.send_event(Event::to_session(
            &op.session,
            &vm.id,
            EventKind::Progress {
                operation: operation.to_string(),
                percent: percent.min(100),
            },
        ));
    }

    /// Nested view of a VM's snapshots.
    pub fn list(&self, vm: &VmLocation) -> Result<Vec<SnapshotInfo>> {
        Ok(self.ctx.snapshots.read(vm)?.to_info())
    }

    /// Report interrupted disk operations without touching anything.
    pub fn scan(&self, vm: &VmLocation) -> Result<Vec<DiskUnfinishedState>> {
        let config = VmConfig::load(&vm.home)?;
        Ok(UnfinishedDiskOpScanner::new(self.disks()).scan(&config, &vm.home))
    }

    /// Finish interrupted disk operations and drop the snapshots they deleted.
    pub fn commit_unfinished(&self, op: &OpContext, vm: &VmLocation) -> Result<UnfinishedPlan> {
        let _lock = self.ctx.registry.lock(
            &vm.id,
            CommandKind::CommitDiskUnfinished,
            &op.session,
            &op.task,
        )?;
        let result = self.finish_pending(op, vm);
        report("commit_unfinished", vm, &result);
        result
    }

    fn finish_pending(&self, op: &OpContext, vm: &VmLocation) -> Result<UnfinishedPlan> {
        let config = VmConfig::load(&vm.home)?;
        let states = UnfinishedDiskOpScanner::new(self.disks()).scan(&config, &vm.home);
        let plan = UnfinishedDiskOpScanner::classify(&states);
        if plan.is_empty() {
            return Ok(plan);
        }
        tracing::info!(
            vm = %vm.id,
            disks = plan.devices.len(),
            snapshots = plan.snapshots_to_remove.len(),
            "finishing interrupted disk operations"
        );

        let committed = if is_live(self.agent().power_state(vm)?) {
            self.run_agent_job(op, vm, AgentCommand::CommitUnfinished, |_| {})
                .map(drop)
        } else {
            plan.devices.iter().try_for_each(|device| {
                let job = self.disks().commit_unfinished(&device.path)?;
                drive_job(job, &op.cancel, |_| {})
            })
        };
        committed.map_err(|e| surface(e, Error::DeleteUnfinishedStateFailed))?;

        if !plan.snapshots_to_remove.is_empty() {
            self.ctx.snapshots.edit(vm, |tree| {
                for guid in &plan.snapshots_to_remove {
                    if tree.find_by_guid(guid).is_some() {
                        tree.delete_node(guid)?;
                    }
                }
                Ok(())
            })?;
            let files = SnapshotFiles::new(&vm.home);
            for guid in &plan.snapshots_to_remove {
                files.remove(guid);
            }
            self.notify(vm, EventKind::SnapshotTreeChanged);
        }
        Ok(plan)
    }

    /// Submit an agent job and wait for it, aborting it on cancellation.
    fn run_agent_job(
        &self,
        op: &OpContext,
        vm: &VmLocation,
        command: AgentCommand,
        mut on_progress: impl FnMut(u32),
    ) -> Result<Option<Vec<u8>>> {
        let agent = self.agent();
        let job = agent.send_command(vm, command)?;
        loop {
            if op.cancel.is_cancelled() {
                if let Err(e) = agent.abort(vm, &job) {
                    tracing::warn!(vm = %vm.id, job = job.id, error = %e, "failed to abort agent job");
                }
                return Err(Error::OperationCancelled);
            }
            match agent.wait_for_reply(vm, &job, self.ctx.config.agent_poll_interval)? {
                WaitOutcome::Timeout { progress } => on_progress(progress),
                WaitOutcome::Reply(AgentReply::Completed { screenshot }) => return Ok(screenshot),
                WaitOutcome::Reply(AgentReply::Failed { message }) => {
                    return Err(Error::agent(job.command, message))
                }
            }
        }
    }

    fn check_space(&self, vm: &VmLocation, config: &VmConfig) -> Result<()> {
        let required = config.snapshot_footprint_mb() + SPACE_MARGIN_MB;
        let available = to_mb(self.ctx.collab.space.free_bytes(&vm.home)?);
        if available <= required {
            return Err(Error::NotEnoughSpaceForSnapshot {
                path: vm.home.clone(),
                required_mb: required,
                available_mb: available,
            });
        }
        Ok(())
    }

    /// Take a snapshot of the VM's current state and make it current.
    pub fn create(
        &self,
        op: &OpContext,
        vm: &VmLocation,
        request: &CreateRequest,
    ) -> Result<SnapshotData> {
        let _lock = self.ctx.registry.lock(
            &vm.id,
            CommandKind::CreateSnapshot,
            &op.session,
            &op.task,
        )?;
        let result = self
            .create_locked(op, vm, request)
            .map_err(|e| surface(e, Error::CreateSnapshotFailed));
        report("create_snapshot", vm, &result);
        result
    }

    fn create_locked(
        &self,
        op: &OpContext,
        vm: &VmLocation,
        request: &CreateRequest,
    ) -> Result<SnapshotData> {
        let collab = &self.ctx.collab;
        collab
            .access
            .check_access(&op.session, CommandKind::CreateSnapshot, vm)?;
        let config = VmConfig::load(&vm.home)?;
        if config.has_bootcamp_device() {
            return Err(Error::SnapshotsNotAllowedForBootcamp {
                vm: vm.id.to_string(),
            });
        }
        for (_, disk) in config.image_disks(&vm.home) {
            if !collab.access.check_device_access(&op.session, &disk) {
                return Err(Error::AccessToVmHddDenied {
                    vm: vm.id.to_string(),
                    path: disk,
                });
            }
        }
        self.finish_pending(op, vm)?;

        let state = self.agent().power_state(vm)?;
        let live = is_live(state);
        if !live {
            self.check_space(vm, &config)?;
        }

        let guid = format!("{{{}}}", Uuid::new_v4());
        let files = SnapshotFiles::new(&vm.home);
        let _as_user = Impersonation::begin(collab.impersonator.as_ref(), &op.session)?;
        files.ensure_dir()?;
        let mut capture = Capture::new(self.disks(), &files, &guid);

        if live {
            let command = AgentCommand::CreateSnapshot {
                guid: guid.clone(),
                name: request.name.clone(),
                description: request.description.clone(),
            };
            let screenshot = self.run_agent_job(op, vm, command, |p| {
                self.progress(op, vm, "create_snapshot", p)
            })?;
            if let Some(png) = screenshot {
                let path = files.png(&guid);
                std::fs::write(&path, png).map_err(|e| {
                    Error::CreateSnapshotFailed(format!("write {}: {}", path.display(), e))
                })?;
            }
        } else {
            for (_, disk) in config.image_disks(&vm.home) {
                self.disks().create_state(&disk, &guid)?;
                capture.states.push(disk);
            }
            if state == PowerState::Suspended {
                files.capture_suspend(&guid)?;
            }
        }
        config.save_to(&files.cfg(&guid))?;

        let vm_state = SnapshotVmState::from(state);
        let mut data = SnapshotData::new(&guid, &request.name);
        data.description = request.description.clone();
        data.creator = op.session.to_string();
        data.vm_state = vm_state;
        if vm_state.has_screenshot() {
            data.screenshot = format!("{}.png", guid);
        }
        data.runtime = Some(SnapshotRuntime {
            size: files
                .all(&guid)
                .iter()
                .filter_map(|p| std::fs::metadata(p).ok())
                .map(|m| m.len())
                .sum(),
            os_version: 0,
        });

        self.ctx.snapshots.edit(vm, |tree| tree.insert(data.clone()))?;
        capture.commit();
        tracing::info!(vm = %vm.id, guid = %guid, state = %vm_state, "snapshot created");

        self.notify(vm, EventKind::SnapshotTreeChanged);
        self.notify(vm, EventKind::Snapshotted { guid });
        Ok(data)
    }

    /// Delete a snapshot.
    pub fn destroy(
        &self,
        op: &OpContext,
        vm: &VmLocation,
        guid: &str,
        options: DeleteOptions,
    ) -> Result<()> {
        let _lock = self.ctx.registry.lock(
            &vm.id,
            CommandKind::DeleteSnapshot,
            &op.session,
            &op.task,
        )?;
        let result = self
            .destroy_locked(op, vm, guid, options)
            .map_err(|e| match e {
                e if e.is_cancellation() => Error::SnapshotDeletionCancelled,
                e => surface(e, Error::DeleteStateFailed),
            });
        report("delete_snapshot", vm, &result);
        result
    }

    fn destroy_locked(
        &self,
        op: &OpContext,
        vm: &VmLocation,
        guid: &str,
        options: DeleteOptions,
    ) -> Result<()> {
        self.finish_pending(op, vm)?;
        let tree = self.ctx.snapshots.read(vm)?;
        if tree.find_by_guid(guid).is_none() {
            return Err(Error::SnapshotNotFound {
                guid: guid.to_string(),
            });
        }
        let plan = removal_plan(&tree, guid, options);
        let doomed: BTreeSet<String> = plan.iter().flat_map(Removal::guids).collect();
        let _locked = self
            .ctx
            .snapshot_locks
            .guard(&vm.id, doomed, LockedFor::DeleteSnapshot)?;

        let config = VmConfig::load(&vm.home)?;
        let disks = config.image_disks(&vm.home);
        let live = is_live(self.agent().power_state(vm)?);
        let files = SnapshotFiles::new(&vm.home);
        let _as_user = Impersonation::begin(self.ctx.collab.impersonator.as_ref(), &op.session)?;

        let steps = plan.iter().map(|r| r.states().len()).sum::<usize>().max(1) as u32;
        let per_disk = disks.len().max(1) as u32;
        let mut step = 0u32;
        let mut changed = false;
        let outcome = (|| -> Result<()> {
            for removal in &plan {
                for (state, merge) in removal.states() {
                    op.cancel.check()?;
                    let overall = |p: u32| (100 * step + p) / steps;
                    if live {
                        let command = AgentCommand::DeleteState {
                            guid: state.clone(),
                            merge,
                        };
                        self.run_agent_job(op, vm, command, |p| {
                            self.progress(op, vm, "delete_snapshot", overall(p))
                        })?;
                    } else {
                        for (i, (_, disk)) in disks.iter().enumerate() {
                            let job = self.disks().delete_state(disk, &state, merge)?;
                            drive_job(job, &op.cancel, |p| {
                                let p = (100 * i as u32 + p) / per_disk;
                                self.progress(op, vm, "delete_snapshot", overall(p))
                            })?;
                        }
                    }
                    step += 1;
                }
                self.ctx.snapshots.edit(vm, |tree| removal.apply(tree))?;
                changed = true;
                for g in removal.guids() {
                    files.remove(&g);
                }
                tracing::debug!(vm = %vm.id, removal = ?removal, "snapshot removal done");
            }
            Ok(())
        })();

        if changed {
            self.notify(vm, EventKind::SnapshotTreeChanged);
        }
        outcome
    }

    /// Restore the VM to a snapshot and make it current.
    pub fn revert(
        &self,
        op: &OpContext,
        vm: &VmLocation,
        guid: &str,
        options: RevertOptions,
    ) -> Result<RevertOutcome> {
        let _lock = self.ctx.registry.lock(
            &vm.id,
            CommandKind::SwitchToSnapshot,
            &op.session,
            &op.task,
        )?;
        let _locked = self.ctx.snapshot_locks.guard(
            &vm.id,
            BTreeSet::from([guid.to_string()]),
            LockedFor::SwitchToSnapshot,
        )?;
        let result = self
            .revert_locked(op, vm, guid, options)
            .map_err(|e| match e {
                e @ Error::UnexpectedDisconnect { .. } => e,
                e => surface(e, Error::RestoreStateFailed),
            });
        report("switch_to_snapshot", vm, &result);
        result
    }

    fn revert_locked(
        &self,
        op: &OpContext,
        vm: &VmLocation,
        guid: &str,
        options: RevertOptions,
    ) -> Result<RevertOutcome> {
        self.finish_pending(op, vm)?;
        let tree = self.ctx.snapshots.read(vm)?;
        let data = tree
            .find_by_guid(guid)
            .cloned()
            .ok_or_else(|| Error::SnapshotNotFound {
                guid: guid.to_string(),
            })?;

        let files = SnapshotFiles::new(&vm.home);
        let saved = files.cfg(guid);
        if !saved.exists() {
            return Err(Error::RestoreStateFailed(format!(
                "missing saved config {}",
                saved.display()
            )));
        }
        let snapshot_config = VmConfig::load_from(&saved)?;
        if data.vm_state != SnapshotVmState::Stopped {
            self.check_space(vm, &snapshot_config)?;
        }
        let previous = std::fs::read(vm.config_path())?;

        let _as_user = Impersonation::begin(self.ctx.collab.impersonator.as_ref(), &op.session)?;
        let mut progress = SwitchProgress::default();
        let switched = self.switch_state(op, vm, &data, &snapshot_config, options, &mut progress);

        if let Err(e) = switched {
            let keep_snapshot_config = data.vm_state.is_running() && progress.disks_touched;
            let restored = if keep_snapshot_config {
                std::fs::copy(&saved, vm.config_path()).map(drop)
            } else {
                std::fs::write(vm.config_path(), &previous)
            };
            if let Err(write_err) = restored {
                tracing::error!(vm = %vm.id, error = %write_err, "failed to restore vm config after revert failure");
            }
            return Err(e);
        }

        let committed = std::fs::copy(&saved, vm.config_path())
            .map(drop)
            .map_err(|e| {
                Error::RestoreStateFailed(format!("restore {}: {}", vm.config_path().display(), e))
            })
            .and_then(|()| self.ctx.snapshots.edit(vm, |tree| tree.set_current(guid)));
        if let Err(e) = committed {
            if let Err(write_err) = std::fs::write(vm.config_path(), &previous) {
                tracing::error!(vm = %vm.id, error = %write_err, "failed to restore vm config after tree update failure");
            }
            return Err(e);
        }
        tracing::info!(vm = %vm.id, guid, vm_stopped = progress.vm_stopped, "reverted to snapshot");

        self.notify(vm, EventKind::SnapshotTreeChanged);
        self.notify(
            vm,
            EventKind::VmRestored {
                guid: guid.to_string(),
            },
        );
        Ok(RevertOutcome {
            vm_stopped: progress.vm_stopped,
        })
    }

    fn switch_state(
        &self,
        op: &OpContext,
        vm: &VmLocation,
        data: &SnapshotData,
        snapshot_config: &VmConfig,
        options: RevertOptions,
        progress: &mut SwitchProgress,
    ) -> Result<()> {
        let on_progress = |p: u32| self.progress(op, vm, "switch_to_snapshot", p);
        if is_live(self.agent().power_state(vm)?) {
            if data.vm_state != SnapshotVmState::Stopped {
                progress.disks_touched = true;
                let command = AgentCommand::SwitchToState {
                    guid: data.guid.clone(),
                    skip_resume: options.skip_resume,
                };
                return match self.run_agent_job(op, vm, command, on_progress) {
                    Ok(_) => Ok(()),
                    Err(e) => {
                        self.stopped_on_disconnect(vm, e)?;
                        progress.vm_stopped = true;
                        Ok(())
                    }
                };
            }
            self.stop(op, vm)?;
            progress.vm_stopped = true;
        }

        let files = SnapshotFiles::new(&vm.home);
        let disks = snapshot_config.image_disks(&vm.home);
        let per_disk = disks.len().max(1) as u32;
        for (i, (_, disk)) in disks.iter().enumerate() {
            let job = self.disks().switch_state(disk, &data.guid)?;
            progress.disks_touched = true;
            drive_job(job, &op.cancel, |p| on_progress((100 * i as u32 + p) / per_disk))?;
        }
        if data.vm_state != SnapshotVmState::Stopped && !options.skip_resume {
            files.restore_suspend(&data.guid)?;
        } else {
            files.clear_suspend();
        }
        Ok(())
    }

    /// Power the VM off through the agent.
    fn stop(&self, op: &OpContext, vm: &VmLocation) -> Result<()> {
        match self.run_agent_job(op, vm, AgentCommand::Stop, |_| {}) {
            Ok(_) => Ok(()),
            Err(e) => self.stopped_on_disconnect(vm, e),
        }
    }

    /// Pass `e` through unless it is a lost agent connection and the VM is
    /// no longer live, in which case the VM stopped cleanly.
    fn stopped_on_disconnect(&self, vm: &VmLocation, e: Error) -> Result<()> {
        if !matches!(e, Error::UnexpectedDisconnect { .. }) {
            return Err(e);
        }
        if is_live(self.agent().power_state(vm)?) {
            return Err(e);
        }
        tracing::debug!(vm = %vm.id, "connection closed by stopping vm");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::{BundleDiskBackend, PendingOp, UnfinishedOp};
    use crate::testing::{Fixture, Script, MB};
    use crate::vm::SessionId;

    fn create(fx: &Fixture, name: &str) -> String {
        SnapshotEngine::new(&fx.ctx)
            .create(
                &fx.op(),
                &fx.vm,
                &CreateRequest {
                    name: name.into(),
                    description: format!("{} desc", name),
                },
            )
            .unwrap()
            .guid
    }

    fn revert(fx: &Fixture, guid: &str) -> Result<RevertOutcome> {
        SnapshotEngine::new(&fx.ctx).revert(&fx.op(), &fx.vm, guid, RevertOptions::default())
    }

    fn tree(fx: &Fixture) -> SnapshotTree {
        fx.ctx.snapshots.read(&fx.vm).unwrap()
    }

    #[test]
    fn test_create_on_stopped_vm() {
        let fx = Fixture::new();
        let first = create(&fx, "base");
        let second = create(&fx, "next");

        let tree = tree(&fx);
        assert_eq!(tree.len(), 2);
        assert!(tree.is_current(&second));
        assert!(!tree.is_current(&first));
        assert_eq!(tree.parent(&second), Some(first.as_str()));

        let data = tree.find_by_guid(&first).unwrap();
        assert_eq!(data.vm_state, SnapshotVmState::Stopped);
        assert_eq!(data.creator, "alice");
        assert_eq!(data.description, "base desc");
        assert!(data.screenshot.is_empty());

        for i in 0..2 {
            assert_eq!(
                BundleDiskBackend::states(&fx.disk(i)).unwrap(),
                vec![first.clone(), second.clone()]
            );
        }
        let files = SnapshotFiles::new(&fx.vm.home);
        assert!(files.cfg(&first).exists());
        assert!(files.tree().exists());

        let kinds = fx.channel.kinds();
        assert!(kinds.contains(&EventKind::SnapshotTreeChanged));
        assert!(kinds.contains(&EventKind::Snapshotted { guid: second }));
    }

    #[test]
    fn test_create_requires_free_space() {
        let fx = Fixture::new();
        *fx.space.0.lock() = Some(1000 * MB);

        let err = SnapshotEngine::new(&fx.ctx)
            .create(&fx.op(), &fx.vm, &CreateRequest::default())
            .unwrap_err();
        match err {
            Error::NotEnoughSpaceForSnapshot {
                required_mb,
                available_mb,
                ..
            } => {
                assert_eq!(required_mb, 1024 + 32 + 10);
                assert_eq!(available_mb, 1000);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(tree(&fx).is_empty());
        assert!(BundleDiskBackend::states(&fx.disk(0)).unwrap().is_empty());
    }

    #[test]
    fn test_create_checks_disk_access() {
        let fx = Fixture::new();
        fx.access.0.lock().push(fx.disk(1));

        let err = SnapshotEngine::new(&fx.ctx)
            .create(&fx.op(), &fx.vm, &CreateRequest::default())
            .unwrap_err();
        assert!(matches!(err, Error::AccessToVmHddDenied { path, .. } if path == fx.disk(1)));
    }

    #[test]
    fn test_create_rejects_bootcamp() {
        let fx = Fixture::new();
        let mut config = VmConfig::load(&fx.vm.home).unwrap();
        config.hard_disks[1].bootcamp = true;
        config.hard_disks[1].emulation = crate::vm::DiskEmulation::RealDevice;
        config.save(&fx.vm.home).unwrap();

        let err = SnapshotEngine::new(&fx.ctx)
            .create(&fx.op(), &fx.vm, &CreateRequest::default())
            .unwrap_err();
        assert!(matches!(err, Error::SnapshotsNotAllowedForBootcamp { .. }));
    }

    #[test]
    fn test_create_failure_discards_partial_states() {
        let fx = Fixture::new();
        std::fs::remove_dir_all(fx.disk(1)).unwrap();

        let err = SnapshotEngine::new(&fx.ctx)
            .create(&fx.op(), &fx.vm, &CreateRequest::default())
            .unwrap_err();
        assert!(matches!(err, Error::CreateSnapshotFailed(_)), "{:?}", err);
        assert!(BundleDiskBackend::states(&fx.disk(0)).unwrap().is_empty());
        assert!(tree(&fx).is_empty());
        let leftovers = std::fs::read_dir(SnapshotFiles::new(&fx.vm.home).dir())
            .unwrap()
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_create_on_running_vm_uses_agent() {
        let fx = Fixture::new();
        fx.agent.set_state(PowerState::Running);
        fx.agent.push(Script::Complete(Some(b"png".to_vec())));

        let guid = create(&fx, "live");
        let data = tree(&fx).find_by_guid(&guid).cloned().unwrap();
        assert_eq!(data.vm_state, SnapshotVmState::Running);
        assert_eq!(data.screenshot, format!("{}.png", guid));
        assert_eq!(
            std::fs::read(SnapshotFiles::new(&fx.vm.home).png(&guid)).unwrap(),
            b"png"
        );
        assert!(matches!(
            fx.agent.commands()[0],
            AgentCommand::CreateSnapshot { ref name, .. } if name == "live"
        ));
        assert!(BundleDiskBackend::states(&fx.disk(0)).unwrap().is_empty());
    }

    #[test]
    fn test_create_transport_failure_is_create_failed() {
        let fx = Fixture::new();
        fx.agent.set_state(PowerState::Running);
        fx.agent.push(Script::Disconnect);

        let err = SnapshotEngine::new(&fx.ctx)
            .create(&fx.op(), &fx.vm, &CreateRequest::default())
            .unwrap_err();
        assert!(matches!(err, Error::CreateSnapshotFailed(_)));
        assert!(tree(&fx).is_empty());
    }

    #[test]
    fn test_create_cancel_aborts_agent_job() {
        let fx = Fixture::new();
        fx.agent.set_state(PowerState::Running);
        fx.agent.push(Script::Hang);
        let op = fx.op();
        op.cancel.cancel();

        let err = SnapshotEngine::new(&fx.ctx)
            .create(&op, &fx.vm, &CreateRequest::default())
            .unwrap_err();
        assert!(matches!(err, Error::OperationCancelled));
        assert_eq!(*fx.agent.aborted.lock(), vec![1]);
        assert!(fx.ctx.registry.get_tasks_under_exclusive_op(&fx.vm.id).is_empty());
    }

    #[test]
    fn test_create_conflicts_with_running_op() {
        let fx = Fixture::new();
        let other = SessionId::new("bob");
        let _held = fx
            .ctx
            .registry
            .lock(&fx.vm.id, CommandKind::Delete, &other, &crate::vm::TaskId::generate())
            .unwrap();

        let err = SnapshotEngine::new(&fx.ctx)
            .create(&fx.op(), &fx.vm, &CreateRequest::default())
            .unwrap_err();
        assert!(matches!(err, Error::VmLocked { .. }));
    }

    #[test]
    fn test_destroy_single_node_reparents_children() {
        let fx = Fixture::new();
        let a = create(&fx, "a");
        let b = create(&fx, "b");
        let c = create(&fx, "c");

        SnapshotEngine::new(&fx.ctx)
            .destroy(&fx.op(), &fx.vm, &b, DeleteOptions::default())
            .unwrap();

        let tree = tree(&fx);
        assert!(tree.find_by_guid(&b).is_none());
        assert_eq!(tree.parent(&c), Some(a.as_str()));
        assert!(tree.is_current(&c));
        assert_eq!(
            BundleDiskBackend::states(&fx.disk(0)).unwrap(),
            vec![a.clone(), c.clone()]
        );
        assert!(!SnapshotFiles::new(&fx.vm.home).cfg(&b).exists());

        let percents: Vec<u32> = fx
            .channel
            .kinds()
            .into_iter()
            .filter_map(|k| match k {
                EventKind::Progress { operation, percent } if operation == "delete_snapshot" => {
                    Some(percent)
                }
                _ => None,
            })
            .collect();
        assert_eq!(percents.last(), Some(&100));
        assert!(percents.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_destroy_child_discards_siblings_and_merges_path() {
        let fx = Fixture::new();
        let a = create(&fx, "a");
        let b = create(&fx, "b");
        let s1 = create(&fx, "s1");
        revert(&fx, &b).unwrap();
        let c = create(&fx, "c");
        let s2 = create(&fx, "s2");
        revert(&fx, &c).unwrap();
        let d = create(&fx, "d");
        assert_eq!(tree(&fx).children(&b), &[s1.clone(), c.clone()]);

        fx.agent.set_state(PowerState::Running);
        SnapshotEngine::new(&fx.ctx)
            .destroy(
                &fx.op(),
                &fx.vm,
                &b,
                DeleteOptions {
                    child: true,
                    merge: true,
                },
            )
            .unwrap();

        let deletes: Vec<(String, bool)> = fx
            .agent
            .commands()
            .into_iter()
            .filter_map(|c| match c {
                AgentCommand::DeleteState { guid, merge } => Some((guid, merge)),
                _ => None,
            })
            .collect();
        assert_eq!(
            deletes,
            vec![(s2, false), (c, true), (s1, false), (b.clone(), true)]
        );

        let tree = tree(&fx);
        assert_eq!(tree.len(), 2);
        assert_eq!(tree.parent(&d), Some(a.as_str()));
        assert!(tree.is_current(&d));
    }

    #[test]
    fn test_destroy_cancel_has_its_own_code() {
        let fx = Fixture::new();
        let a = create(&fx, "a");
        let op = fx.op();
        op.cancel.cancel();

        let err = SnapshotEngine::new(&fx.ctx)
            .destroy(&op, &fx.vm, &a, DeleteOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::SnapshotDeletionCancelled));
        assert!(tree(&fx).find_by_guid(&a).is_some());
        assert!(!fx.ctx.snapshot_locks.is_locked(&fx.vm.id, &a));
    }

    #[test]
    fn test_destroy_reverts_identity_on_failure_and_cancel() {
        let fx = Fixture::new();
        let a = create(&fx, "a");
        fx.switches.0.lock().clear();
        fx.agent.set_state(PowerState::Running);
        fx.agent.push(Script::Fail("merge failed".into()));
        let engine = SnapshotEngine::new(&fx.ctx);

        let err = engine
            .destroy(&fx.op(), &fx.vm, &a, DeleteOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::DeleteStateFailed(_)), "{:?}", err);
        assert_eq!(fx.switches.log(), vec!["as alice", "revert"]);

        let op = fx.op();
        op.cancel.cancel();
        let err = engine
            .destroy(&op, &fx.vm, &a, DeleteOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::SnapshotDeletionCancelled));
        assert!(fx.switches.restored());
        assert_eq!(fx.switches.log().len(), 4);
    }

    #[test]
    fn test_destroy_missing_and_locked() {
        let fx = Fixture::new();
        let a = create(&fx, "a");
        let engine = SnapshotEngine::new(&fx.ctx);

        let err = engine
            .destroy(&fx.op(), &fx.vm, "{nope}", DeleteOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::SnapshotNotFound { .. }));

        let _held = fx
            .ctx
            .snapshot_locks
            .guard(&fx.vm.id, BTreeSet::from([a.clone()]), LockedFor::SwitchToSnapshot)
            .unwrap();
        let err = engine
            .destroy(&fx.op(), &fx.vm, &a, DeleteOptions::default())
            .unwrap_err();
        assert!(matches!(
            err,
            Error::SnapshotLocked {
                reason: LockedFor::SwitchToSnapshot,
                ..
            }
        ));
    }

    #[test]
    fn test_revert_stopped_vm_restores_config_and_disks() {
        let fx = Fixture::new();
        let a = create(&fx, "a");
        std::fs::write(fx.disk(0).join("disk.hds"), b"changed").unwrap();
        let mut config = VmConfig::load(&fx.vm.home).unwrap();
        config.ram_mb = 4096;
        config.save(&fx.vm.home).unwrap();
        let b = create(&fx, "b");

        let outcome = revert(&fx, &a).unwrap();
        assert!(!outcome.vm_stopped);

        let tree = tree(&fx);
        assert!(tree.is_current(&a));
        assert!(!tree.is_current(&b));
        assert_eq!(VmConfig::load(&fx.vm.home).unwrap().ram_mb, 1024);
        assert_eq!(std::fs::read(fx.disk(0).join("disk.hds")).unwrap(), b"");
        assert_eq!(
            BundleDiskBackend::current_state(&fx.disk(1)).unwrap(),
            Some(a.clone())
        );
        assert!(fx.channel.kinds().contains(&EventKind::VmRestored { guid: a }));
    }

    #[test]
    fn test_revert_running_vm_to_poweroff_snapshot_stops_it() {
        let fx = Fixture::new();
        let a = create(&fx, "a");
        fx.agent.set_state(PowerState::Running);

        let outcome = revert(&fx, &a).unwrap();
        assert!(outcome.vm_stopped);
        assert!(matches!(fx.agent.commands().last(), Some(AgentCommand::Stop)));
        assert_eq!(
            BundleDiskBackend::current_state(&fx.disk(0)).unwrap(),
            Some(a)
        );
    }

    #[test]
    fn test_revert_reports_unexpected_disconnect() {
        let fx = Fixture::new();
        fx.agent.set_state(PowerState::Running);
        let a = create(&fx, "a");
        let b = create(&fx, "b");
        fx.agent.push(Script::Disconnect);

        let err = revert(&fx, &a).unwrap_err();
        assert!(matches!(err, Error::UnexpectedDisconnect { .. }), "{:?}", err);
        assert!(tree(&fx).is_current(&b));
        assert!(!fx.ctx.snapshot_locks.is_locked(&fx.vm.id, &a));
    }

    #[test]
    fn test_revert_treats_disconnect_from_stopped_vm_as_clean_stop() {
        let fx = Fixture::new();
        fx.agent.set_state(PowerState::Running);
        let a = create(&fx, "a");
        let b = create(&fx, "b");
        fx.agent.push(Script::StopThenDisconnect);

        let outcome = revert(&fx, &a).unwrap();
        assert!(outcome.vm_stopped);
        let tree = tree(&fx);
        assert!(tree.is_current(&a));
        assert!(!tree.is_current(&b));
        assert!(fx.channel.kinds().contains(&EventKind::VmRestored { guid: a.clone() }));
        assert!(!fx.ctx.snapshot_locks.is_locked(&fx.vm.id, &a));
        assert!(fx.switches.restored());
    }

    #[test]
    fn test_revert_tree_write_failure_restores_previous_config() {
        let fx = Fixture::new();
        let a = create(&fx, "a");
        let mut config = VmConfig::load(&fx.vm.home).unwrap();
        config.ram_mb = 2048;
        config.save(&fx.vm.home).unwrap();
        let b = create(&fx, "b");
        let tree_file = SnapshotFiles::new(&fx.vm.home).tree();
        std::fs::remove_file(&tree_file).unwrap();
        std::fs::create_dir(&tree_file).unwrap();

        let err = revert(&fx, &a).unwrap_err();
        assert!(matches!(err, Error::BadFileName { .. }), "{:?}", err);
        assert_eq!(VmConfig::load(&fx.vm.home).unwrap().ram_mb, 2048);
        assert!(tree(&fx).is_current(&b));
    }

    #[test]
    fn test_revert_failure_writes_back_previous_config() {
        let fx = Fixture::new();
        let a = create(&fx, "a");
        let mut config = VmConfig::load(&fx.vm.home).unwrap();
        config.ram_mb = 2048;
        config.save(&fx.vm.home).unwrap();
        std::fs::remove_dir_all(fx.disk(0)).unwrap();

        let err = revert(&fx, &a).unwrap_err();
        assert!(matches!(err, Error::RestoreStateFailed(_)), "{:?}", err);
        assert_eq!(VmConfig::load(&fx.vm.home).unwrap().ram_mb, 2048);
    }

    #[test]
    fn test_commit_unfinished_drops_interrupted_deletes() {
        let fx = Fixture::new();
        let a = create(&fx, "a");
        let b = create(&fx, "b");
        BundleDiskBackend::mark_pending(
            &fx.disk(0),
            PendingOp {
                op: UnfinishedOp::Delete,
                snapshot: Some(b.clone()),
            },
        )
        .unwrap();

        let engine = SnapshotEngine::new(&fx.ctx);
        assert_eq!(engine.scan(&fx.vm).unwrap()[0].op, UnfinishedOp::Delete);

        let plan = engine.commit_unfinished(&fx.op(), &fx.vm).unwrap();
        assert_eq!(plan.snapshots_to_remove, BTreeSet::from([b.clone()]));
        assert!(engine.scan(&fx.vm).unwrap().iter().all(|s| !s.is_unfinished()));

        let tree = tree(&fx);
        assert!(tree.find_by_guid(&b).is_none());
        assert!(tree.is_current(&a));
        assert_eq!(BundleDiskBackend::states(&fx.disk(0)).unwrap(), vec![a]);
    }

    #[test]
    fn test_create_finishes_pending_work_first() {
        let fx = Fixture::new();
        let a = create(&fx, "a");
        BundleDiskBackend::mark_pending(
            &fx.disk(1),
            PendingOp {
                op: UnfinishedOp::Merge,
                snapshot: Some(a.clone()),
            },
        )
        .unwrap();

        let b = create(&fx, "b");
        let tree = tree(&fx);
        assert!(tree.find_by_guid(&a).is_none());
        assert!(tree.is_current(&b));
    }

    #[test]
    fn test_removal_plan_without_current_below_target() {
        let mut tree = SnapshotTree::new();
        for g in ["a", "b", "c"] {
            tree.insert(SnapshotData::new(g, g)).unwrap();
        }
        tree.set_current("a").unwrap();
        let plan = removal_plan(
            &tree,
            "b",
            DeleteOptions {
                child: true,
                merge: true,
            },
        );
        assert_eq!(
            plan,
            vec![Removal::Branch {
                root: "b".into(),
                guids: vec!["c".into(), "b".into()],
            }]
        );
    }
}
