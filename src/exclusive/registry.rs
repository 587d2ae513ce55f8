//! Exclusive-operation registry.
//!
//! Keeps, per VM, the set of commands currently executing against it and
//! refuses a new command when any held one is incompatible. All state sits
//! behind a single mutex; each occupied slot owns a condition variable that
//! blocked callers wait on.

use super::kinds::{compatible, CommandKind};
use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::vm::{SessionId, TaskId, VmIdentity};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Default bound on a single condition-variable wait.
pub const DEFAULT_WAIT_SLICE: Duration = Duration::from_millis(100);

/// One command holding a VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeldOp {
    /// Command kind.
    pub kind: CommandKind,
    /// Owning session.
    pub session: SessionId,
    /// Owning task.
    pub task: TaskId,
}

#[derive(Default)]
struct Slot {
    held: Vec<HeldOp>,
    cond: Arc<Condvar>,
}

impl Slot {
    fn check(&self, vm: &VmIdentity, kind: CommandKind, session: &SessionId, task: &TaskId) -> Result<()> {
        for op in &self.held {
            if !compatible(kind, op.kind, op.session == *session, op.task == *task) {
                return Err(Error::VmLocked {
                    vm: vm.to_string(),
                    reason: op.kind.locked_for(),
                });
            }
        }
        Ok(())
    }
}

/// Registry of commands executing against each VM.
pub struct ExclusiveRegistry {
    slots: Mutex<HashMap<VmIdentity, Slot>>,
    wait_slice: Duration,
}

impl Default for ExclusiveRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_WAIT_SLICE)
    }
}

impl ExclusiveRegistry {
    /// Create an empty registry; `wait_slice` bounds each blocking wait
    /// between cancellation checks.
    pub fn new(wait_slice: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            wait_slice,
        }
    }

    /// Register `kind` on `vm`, failing immediately on conflict.
    ///
    /// The error names the executing command that blocks the request.
    pub fn register_op(
        &self,
        vm: &VmIdentity,
        kind: CommandKind,
        session: &SessionId,
        task: &TaskId,
    ) -> Result<()> {
        let mut slots = self.slots.lock();
        let slot = slots.entry(vm.clone()).or_default();
        slot.check(vm, kind, session, task)?;
        slot.held.push(HeldOp {
            kind,
            session: session.clone(),
            task: task.clone(),
        });
        tracing::debug!(vm = %vm, kind = %kind, session = %session, "registered exclusive op");
        Ok(())
    }

    /// Register `kind` on `vm`, waiting until every conflicting holder is gone.
    ///
    /// There is no overall timeout; the wait ends only on success or when
    /// `cancel` fires, which yields [`Error::OperationCancelled`].
    pub fn register_op_wait(
        &self,
        vm: &VmIdentity,
        kind: CommandKind,
        session: &SessionId,
        task: &TaskId,
        cancel: &CancelToken,
    ) -> Result<()> {
        let mut slots = self.slots.lock();
        loop {
            cancel.check()?;

            let slot = slots.entry(vm.clone()).or_default();
            match slot.check(vm, kind, session, task) {
                Ok(()) => {
                    slot.held.push(HeldOp {
                        kind,
                        session: session.clone(),
                        task: task.clone(),
                    });
                    tracing::debug!(vm = %vm, kind = %kind, session = %session, "registered exclusive op after wait");
                    return Ok(());
                }
                Err(e) => {
                    tracing::debug!(vm = %vm, kind = %kind, blocked_by = %e, "waiting for exclusive op");
                    let cond = Arc::clone(&slot.cond);
                    cond.wait_for(&mut slots, self.wait_slice);
                }
            }
        }
    }

    /// Remove the caller's registration of `kind` on `vm` and wake waiters.
    pub fn unregister_op(&self, vm: &VmIdentity, kind: CommandKind, session: &SessionId) -> Result<()> {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(vm) else {
            tracing::error!(vm = %vm, kind = %kind, "unregister on a vm with no exclusive ops");
            return Err(Error::NotRegistered {
                vm: vm.to_string(),
                command: kind.to_string(),
            });
        };

        let pos = slot
            .held
            .iter()
            .position(|op| op.kind == kind && op.session == *session);
        let Some(pos) = pos else {
            if kind == CommandKind::VmLock && slot.held.iter().any(|op| op.kind == kind) {
                return Err(Error::NotLockOwner { vm: vm.to_string() });
            }
            tracing::error!(vm = %vm, kind = %kind, session = %session, "unregister of a command not held");
            return Err(Error::NotRegistered {
                vm: vm.to_string(),
                command: kind.to_string(),
            });
        };

        slot.held.remove(pos);
        slot.cond.notify_all();
        if slot.held.is_empty() {
            slots.remove(vm);
        }
        tracing::debug!(vm = %vm, kind = %kind, session = %session, "unregistered exclusive op");
        Ok(())
    }

    /// Swap the caller's `from` registration to `to` under one lock hold.
    pub fn replace_op(
        &self,
        vm: &VmIdentity,
        from: CommandKind,
        to: CommandKind,
        session: &SessionId,
    ) -> Result<()> {
        let mut slots = self.slots.lock();
        let op = slots.get_mut(vm).and_then(|slot| {
            let cond = Arc::clone(&slot.cond);
            slot.held
                .iter_mut()
                .find(|op| op.kind == from && op.session == *session)
                .map(|op| (op, cond))
        });
        match op {
            Some((op, cond)) => {
                op.kind = to;
                cond.notify_all();
                tracing::debug!(vm = %vm, from = %from, to = %to, "replaced exclusive op");
                Ok(())
            }
            None => Err(Error::NotRegistered {
                vm: vm.to_string(),
                command: from.to_string(),
            }),
        }
    }

    /// Session holding the exclusive [`CommandKind::VmLock`], if any.
    pub fn get_locker_session(&self, vm: &VmIdentity) -> Option<SessionId> {
        let slots = self.slots.lock();
        slots.get(vm).and_then(|slot| {
            slot.held
                .iter()
                .find(|op| op.kind == CommandKind::VmLock)
                .map(|op| op.session.clone())
        })
    }

    /// Tasks currently holding any command on `vm`.
    pub fn get_tasks_under_exclusive_op(&self, vm: &VmIdentity) -> Vec<TaskId> {
        let slots = self.slots.lock();
        slots
            .get(vm)
            .map(|slot| slot.held.iter().map(|op| op.task.clone()).collect())
            .unwrap_or_default()
    }

    /// Snapshot of every command held on `vm`.
    pub fn held_ops(&self, vm: &VmIdentity) -> Vec<HeldOp> {
        let slots = self.slots.lock();
        slots.get(vm).map(|slot| slot.held.clone()).unwrap_or_default()
    }

    /// Release every registration owned by a terminated session.
    pub fn cleanup_session_locks(&self, session: &SessionId) {
        let mut slots = self.slots.lock();
        let mut released = 0usize;
        slots.retain(|vm, slot| {
            let before = slot.held.len();
            slot.held.retain(|op| op.session != *session);
            if slot.held.len() != before {
                released += before - slot.held.len();
                tracing::info!(vm = %vm, session = %session, "released locks of closed session");
                slot.cond.notify_all();
            }
            !slot.held.is_empty()
        });
        if released > 0 {
            tracing::debug!(session = %session, released, "session cleanup done");
        }
    }

    /// Register `kind` and return a guard that unregisters on drop.
    pub fn lock(
        &self,
        vm: &VmIdentity,
        kind: CommandKind,
        session: &SessionId,
        task: &TaskId,
    ) -> Result<ExclusiveGuard<'_>> {
        self.register_op(vm, kind, session, task)?;
        Ok(ExclusiveGuard::new(self, vm, kind, session))
    }

    /// Blocking variant of [`lock`](Self::lock).
    pub fn lock_wait(
        &self,
        vm: &VmIdentity,
        kind: CommandKind,
        session: &SessionId,
        task: &TaskId,
        cancel: &CancelToken,
    ) -> Result<ExclusiveGuard<'_>> {
        self.register_op_wait(vm, kind, session, task, cancel)?;
        Ok(ExclusiveGuard::new(self, vm, kind, session))
    }
}

/// Scoped registration; unregisters when dropped.
pub struct ExclusiveGuard<'a> {
    registry: &'a ExclusiveRegistry,
    vm: VmIdentity,
    kind: CommandKind,
    session: SessionId,
    active: bool,
}

impl<'a> ExclusiveGuard<'a> {
    fn new(registry: &'a ExclusiveRegistry, vm: &VmIdentity, kind: CommandKind, session: &SessionId) -> Self {
        Self {
            registry,
            vm: vm.clone(),
            kind,
            session: session.clone(),
            active: true,
        }
    }

    /// Currently registered kind.
    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    /// Move the registration to another kind without unlocking.
    pub fn replace(&mut self, to: CommandKind) -> Result<()> {
        self.registry
            .replace_op(&self.vm, self.kind, to, &self.session)?;
        self.kind = to;
        Ok(())
    }

    /// Unregister now and report the outcome.
    pub fn release(mut self) -> Result<()> {
        self.active = false;
        self.registry.unregister_op(&self.vm, self.kind, &self.session)
    }
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        if self.active {
            if let Err(e) = self.registry.unregister_op(&self.vm, self.kind, &self.session) {
                tracing::warn!(vm = %self.vm, kind = %self.kind, error = %e, "failed to release exclusive op");
            }
        }
    }
}
