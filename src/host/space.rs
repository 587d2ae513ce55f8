//! Free space probing.

use super::c_path;
use crate::error::{Error, Result};
use std::io;
use std::path::Path;

/// Reports free space on the filesystem holding a path.
pub trait SpaceProbe: Send + Sync {
    /// Bytes available to unprivileged users.
    fn free_bytes(&self, path: &Path) -> Result<u64>;
}

/// [`SpaceProbe`] backed by `statvfs(3)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatvfsProbe;

impl SpaceProbe for StatvfsProbe {
    fn free_bytes(&self, path: &Path) -> Result<u64> {
        // the target directory may not exist yet
        let probe = path
            .ancestors()
            .find(|p| p.exists())
            .unwrap_or(path);
        let c = c_path(probe).ok_or_else(|| Error::GetFreeSpaceFailed {
            path: path.to_path_buf(),
            reason: "path contains a nul byte".into(),
        })?;

        let mut st: libc::statvfs = unsafe { std::mem::zeroed() };
        if unsafe { libc::statvfs(c.as_ptr(), &mut st) } != 0 {
            return Err(Error::GetFreeSpaceFailed {
                path: path.to_path_buf(),
                reason: io::Error::last_os_error().to_string(),
            });
        }
        Ok(st.f_bavail as u64 * st.f_frsize as u64)
    }
}

/// Bytes to whole megabytes.
pub fn to_mb(bytes: u64) -> u64 {
    bytes / (1024 * 1024)
}
