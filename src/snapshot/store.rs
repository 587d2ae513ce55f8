//! Per-VM snapshot tree cache backed by `Snapshots.xml`.

use super::files::SnapshotFiles;
use super::tree::SnapshotTree;
use super::xml;
use crate::error::Result;
use crate::vm::{VmIdentity, VmLocation};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Loaded snapshot trees keyed by VM.
///
/// Mutation happens through [`SnapshotStore::edit`], which works on a copy,
/// persists it and only then replaces the cached tree. A failed edit leaves
/// both the cache and the file untouched.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    trees: Mutex<HashMap<VmIdentity, SnapshotTree>>,
}

impl SnapshotStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn load(vm: &VmLocation) -> Result<SnapshotTree> {
        let path = SnapshotFiles::new(&vm.home).tree();
        if !path.exists() {
            return Ok(SnapshotTree::new());
        }
        xml::load_file(&path)
    }

    /// Copy of the VM's tree.
    pub fn read(&self, vm: &VmLocation) -> Result<SnapshotTree> {
        if let Some(tree) = self.trees.lock().get(&vm.id) {
            return Ok(tree.clone());
        }
        let tree = Self::load(vm)?;
        self.trees.lock().insert(vm.id.clone(), tree.clone());
        Ok(tree)
    }

    /// Apply `f` to the VM's tree and persist the result.
    ///
    /// Callers must hold the VM's exclusive registration.
    pub fn edit<T>(
        &self,
        vm: &VmLocation,
        f: impl FnOnce(&mut SnapshotTree) -> Result<T>,
    ) -> Result<T> {
        let mut working = self.read(vm)?;
        let value = f(&mut working)?;
        xml::save_file(&working, &SnapshotFiles::new(&vm.home).tree())?;
        self.trees.lock().insert(vm.id.clone(), working);
        Ok(value)
    }

    /// Drop the cached tree so the next read goes to disk.
    pub fn invalidate(&self, vm: &VmIdentity) {
        self.trees.lock().remove(vm);
    }
}
