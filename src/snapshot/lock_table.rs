//! Per-snapshot locks for destructive snapshot operations.

use crate::error::{Error, LockedFor, Result};
use crate::vm::VmIdentity;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};

/// Locked snapshot guids per VM, each tagged with the reason reported to
/// a conflicting caller.
#[derive(Debug, Default)]
pub struct SnapshotLockTable {
    locked: Mutex<HashMap<VmIdentity, HashMap<String, LockedFor>>>,
}

impl SnapshotLockTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock every guid or none of them.
    ///
    /// The error carries the reason stored by the current holder.
    pub fn lock(&self, vm: &VmIdentity, guids: &BTreeSet<String>, reason: LockedFor) -> Result<()> {
        let mut table = self.locked.lock();
        let entry = table.entry(vm.clone()).or_default();

        if let Some((guid, held)) = guids
            .iter()
            .find_map(|g| entry.get(g).map(|held| (g, *held)))
        {
            if entry.is_empty() {
                table.remove(vm);
            }
            return Err(Error::SnapshotLocked {
                guid: guid.clone(),
                reason: held,
            });
        }

        for guid in guids {
            entry.insert(guid.clone(), reason);
        }
        if entry.is_empty() {
            table.remove(vm);
        }
        Ok(())
    }

    /// Release guids. Unknown guids are ignored.
    pub fn unlock(&self, vm: &VmIdentity, guids: &BTreeSet<String>) {
        let mut table = self.locked.lock();
        if let Some(entry) = table.get_mut(vm) {
            for guid in guids {
                entry.remove(guid);
            }
            if entry.is_empty() {
                table.remove(vm);
            }
        }
    }

    /// Whether a guid is locked.
    pub fn is_locked(&self, vm: &VmIdentity, guid: &str) -> bool {
        self.locked
            .lock()
            .get(vm)
            .map(|entry| entry.contains_key(guid))
            .unwrap_or(false)
    }

    /// Lock and return a guard that unlocks on drop.
    pub fn guard(
        &self,
        vm: &VmIdentity,
        guids: BTreeSet<String>,
        reason: LockedFor,
    ) -> Result<SnapshotLockGuard<'_>> {
        self.lock(vm, &guids, reason)?;
        Ok(SnapshotLockGuard {
            table: self,
            vm: vm.clone(),
            guids,
        })
    }
}

/// Scoped snapshot lock.
#[derive(Debug)]
pub struct SnapshotLockGuard<'a> {
    table: &'a SnapshotLockTable,
    vm: VmIdentity,
    guids: BTreeSet<String>,
}

impl SnapshotLockGuard<'_> {
    /// Locked guids.
    pub fn guids(&self) -> &BTreeSet<String> {
        &self.guids
    }
}

impl Drop for SnapshotLockGuard<'_> {
    fn drop(&mut self) {
        self.table.unlock(&self.vm, &self.guids);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn vm() -> VmIdentity {
        VmIdentity::new("default", "web")
    }

    #[test]
    fn test_lock_is_all_or_nothing() {
        let table = SnapshotLockTable::new();
        table.lock(&vm(), &set(&["a"]), LockedFor::DeleteSnapshot).unwrap();

        let err = table
            .lock(&vm(), &set(&["b", "a", "c"]), LockedFor::SwitchToSnapshot)
            .unwrap_err();
        match err {
            Error::SnapshotLocked { guid, reason } => {
                assert_eq!(guid, "a");
                assert_eq!(reason, LockedFor::DeleteSnapshot);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(!table.is_locked(&vm(), "b"));
        assert!(!table.is_locked(&vm(), "c"));
    }

    #[test]
    fn test_disjoint_sets_coexist() {
        let table = SnapshotLockTable::new();
        table.lock(&vm(), &set(&["a"]), LockedFor::DeleteSnapshot).unwrap();
        table.lock(&vm(), &set(&["b"]), LockedFor::DeleteSnapshot).unwrap();

        let other = VmIdentity::new("default", "db");
        table.lock(&other, &set(&["a"]), LockedFor::DeleteSnapshot).unwrap();
    }

    #[test]
    fn test_unlock_is_idempotent() {
        let table = SnapshotLockTable::new();
        table.lock(&vm(), &set(&["a", "b"]), LockedFor::DeleteSnapshot).unwrap();
        table.unlock(&vm(), &set(&["a"]));
        table.unlock(&vm(), &set(&["a", "zzz"]));
        assert!(!table.is_locked(&vm(), "a"));
        assert!(table.is_locked(&vm(), "b"));
    }

    #[test]
    fn test_guard_unlocks_on_drop() {
        let table = SnapshotLockTable::new();
        {
            let guard = table
                .guard(&vm(), set(&["a"]), LockedFor::SwitchToSnapshot)
                .unwrap();
            assert_eq!(guard.guids().len(), 1);
            assert!(table.is_locked(&vm(), "a"));
        }
        assert!(!table.is_locked(&vm(), "a"));
    }
}
