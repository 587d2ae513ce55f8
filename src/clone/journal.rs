//! Paths created by a clone, removed again if the clone does not finish.

use crate::error::{Error, Result};
use std::io;
use std::path::{Path, PathBuf};

/// Ordered record of created files and directories under a clone root.
///
/// Dropping an uncommitted journal rolls it back: entries are removed in
/// reverse creation order, then the root if the journal created it.
#[derive(Debug)]
pub struct Journal {
    root: PathBuf,
    owns_root: bool,
    created: Vec<PathBuf>,
    committed: bool,
}

impl Journal {
    /// Create the clone root and start recording under it.
    ///
    /// An existing empty directory is reused and left in place on rollback.
    pub fn create_root(root: &Path) -> Result<Self> {
        let owns_root = !root.exists();
        std::fs::create_dir_all(root).map_err(|e| Error::MakeDirectory {
            path: root.to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            root: root.to_path_buf(),
            owns_root,
            created: Vec::new(),
            committed: false,
        })
    }

    /// Clone root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Record a created file or directory.
    pub fn record(&mut self, path: impl Into<PathBuf>) {
        self.created.push(path.into());
    }

    /// Paths recorded so far, oldest first.
    pub fn created(&self) -> &[PathBuf] {
        &self.created
    }

    /// Keep everything.
    pub fn commit(mut self) {
        self.committed = true;
    }

    /// Remove everything now.
    pub fn rollback(mut self) {
        self.undo();
        self.committed = true;
    }

    fn undo(&mut self) {
        tracing::info!(root = %self.root.display(), entries = self.created.len(), "rolling back clone");
        for path in self.created.drain(..).rev() {
            if let Err(e) = remove_path(&path) {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove clone leftover");
            }
        }
        if self.owns_root {
            if let Err(e) = remove_path(&self.root) {
                tracing::warn!(root = %self.root.display(), error = %e, "failed to remove clone root");
            }
        }
    }
}

impl Drop for Journal {
    fn drop(&mut self) {
        if !self.committed {
            self.undo();
        }
    }
}

fn remove_path(path: &Path) -> io::Result<()> {
    let result = match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(e) => Err(e),
    };
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
