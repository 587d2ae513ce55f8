//! Acting under the calling user's identity.
//!
//! File operations done on behalf of a client run while the worker thread
//! wears that client's effective uid. [`Impersonation`] restores the previous
//! identity when it goes out of scope, whatever path the operation leaves by.

use crate::error::Result;
use crate::vm::SessionId;
use std::marker::PhantomData;

#[cfg(target_os = "linux")]
pub use self::linux::EffectiveUid;

/// Switches the calling thread's identity to a session's user and back.
pub trait Impersonator: Send + Sync {
    /// Take on the session's identity.
    fn impersonate(&self, session: &SessionId) -> Result<()>;

    /// Return to the service identity.
    fn revert(&self) -> Result<()>;

    /// Run the session's operations as `uid`. Ignored where identities
    /// cannot be switched.
    fn bind(&self, _session: &SessionId, _uid: u32) {}

    /// Forget the session's user.
    fn unbind(&self, _session: &SessionId) {}
}

/// Scoped impersonation.
///
/// The switch belongs to the thread that began it, so the guard cannot be
/// sent to another thread.
pub struct Impersonation<'a> {
    impersonator: &'a dyn Impersonator,
    _thread: PhantomData<*const ()>,
}

impl<'a> Impersonation<'a> {
    /// Switch to the session's identity until the guard is dropped.
    pub fn begin(impersonator: &'a dyn Impersonator, session: &SessionId) -> Result<Self> {
        impersonator.impersonate(session)?;
        Ok(Self {
            impersonator,
            _thread: PhantomData,
        })
    }
}

impl Drop for Impersonation<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.impersonator.revert() {
            tracing::error!(error = %e, "failed to revert impersonation");
        }
    }
}

/// Identity switching that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoImpersonation;

impl Impersonator for NoImpersonation {
    fn impersonate(&self, _session: &SessionId) -> Result<()> {
        Ok(())
    }

    fn revert(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use super::Impersonator;
    use crate::error::{Error, Result};
    use crate::vm::SessionId;
    use parking_lot::RwLock;
    use std::collections::HashMap;
    use std::io;

    /// [`Impersonator`] that switches the calling thread's effective uid.
    ///
    /// Sessions without a bound uid keep the service identity.
    #[derive(Debug, Default)]
    pub struct EffectiveUid {
        users: RwLock<HashMap<SessionId, libc::uid_t>>,
    }

    impl EffectiveUid {
        /// Create with no bound sessions.
        pub fn new() -> Self {
            Self::default()
        }

        /// Uid bound to a session.
        pub fn user(&self, session: &SessionId) -> Option<libc::uid_t> {
            self.users.read().get(session).copied()
        }

        // The raw syscall changes only this thread's credentials. The libc
        // wrapper applies the change to every thread in the process.
        fn set(uid: libc::uid_t) -> Result<()> {
            const KEEP: libc::c_long = -1;
            let rc = unsafe {
                libc::syscall(libc::SYS_setresuid, KEEP, uid as libc::c_long, KEEP)
            };
            if rc != 0 {
                return Err(Error::PermissionDenied {
                    path: format!("uid {}: {}", uid, io::Error::last_os_error()).into(),
                });
            }
            Ok(())
        }
    }

    impl Impersonator for EffectiveUid {
        fn impersonate(&self, session: &SessionId) -> Result<()> {
            let Some(uid) = self.user(session) else {
                return Ok(());
            };
            if uid == unsafe { libc::geteuid() } {
                return Ok(());
            }
            tracing::debug!(session = %session, uid, "impersonating");
            Self::set(uid)
        }

        fn revert(&self) -> Result<()> {
            let real = unsafe { libc::getuid() };
            if real == unsafe { libc::geteuid() } {
                return Ok(());
            }
            Self::set(real)
        }

        fn bind(&self, session: &SessionId, uid: u32) {
            self.users.write().insert(session.clone(), uid);
        }

        fn unbind(&self, session: &SessionId) {
            self.users.write().remove(session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        log: Mutex<Vec<String>>,
        fail: bool,
    }

    impl Impersonator for Recorder {
        fn impersonate(&self, session: &SessionId) -> Result<()> {
            if self.fail {
                return Err(Error::PermissionDenied {
                    path: "denied".into(),
                });
            }
            self.log.lock().push(format!("as {}", session));
            Ok(())
        }

        fn revert(&self) -> Result<()> {
            self.log.lock().push("revert".into());
            Ok(())
        }
    }

    fn failing_op(imp: &dyn Impersonator) -> Result<()> {
        let _as_user = Impersonation::begin(imp, &SessionId::new("s1"))?;
        Err(Error::OperationCancelled)
    }

    #[test]
    fn test_guard_reverts_on_error_path() {
        let rec = Recorder::default();
        assert!(failing_op(&rec).is_err());
        assert_eq!(*rec.log.lock(), vec!["as s1", "revert"]);
    }

    #[test]
    fn test_failed_switch_does_not_revert() {
        let rec = Recorder {
            fail: true,
            ..Recorder::default()
        };
        assert!(Impersonation::begin(&rec, &SessionId::new("s1")).is_err());
        assert!(rec.log.lock().is_empty());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_unbound_session_keeps_identity() {
        let euid = EffectiveUid::new();
        let before = unsafe { libc::geteuid() };
        {
            let _g = Impersonation::begin(&euid, &SessionId::new("nobody")).unwrap();
            assert_eq!(unsafe { libc::geteuid() }, before);
        }
        assert_eq!(unsafe { libc::geteuid() }, before);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_bind_and_unbind_through_trait() {
        let euid = EffectiveUid::new();
        let imp: &dyn Impersonator = &euid;
        imp.bind(&SessionId::new("alice"), 1000);
        assert_eq!(euid.user(&SessionId::new("alice")), Some(1000));
        imp.unbind(&SessionId::new("alice"));
        assert_eq!(euid.user(&SessionId::new("alice")), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_switch_is_per_thread() {
        use std::sync::{Arc, Barrier};

        if unsafe { libc::geteuid() } != 0 {
            return;
        }
        let euid = Arc::new(EffectiveUid::new());
        euid.bind(&SessionId::new("alice"), 1000);
        euid.bind(&SessionId::new("bob"), 1001);
        let barrier = Arc::new(Barrier::new(2));

        let workers: Vec<_> = [("alice", 1000), ("bob", 1001)]
            .into_iter()
            .map(|(name, uid)| {
                let euid = euid.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    let guard = Impersonation::begin(euid.as_ref(), &SessionId::new(name)).unwrap();
                    barrier.wait();
                    assert_eq!(unsafe { libc::geteuid() }, uid);
                    barrier.wait();
                    drop(guard);
                    assert_eq!(unsafe { libc::geteuid() }, 0);
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(unsafe { libc::geteuid() }, 0);
    }
}
