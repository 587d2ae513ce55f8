//! Host capabilities: access checks, free space, identity switching.

pub mod access;
pub mod impersonate;
pub mod space;

pub use access::{AccessCheck, FsAccessCheck};
#[cfg(target_os = "linux")]
pub use impersonate::EffectiveUid;
pub use impersonate::{Impersonation, Impersonator, NoImpersonation};
pub use space::{SpaceProbe, StatvfsProbe};

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

fn c_path(path: &Path) -> Option<CString> {
    CString::new(path.as_os_str().as_bytes()).ok()
}
