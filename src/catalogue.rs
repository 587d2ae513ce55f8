//! Registered VMs.
//!
//! The catalogue maps VM uuids and names to their home directories. New
//! registrations go through a [`Reservation`] so that two concurrent
//! clones cannot claim the same uuid, path or name.

use crate::error::{Error, RegisteredBy, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One registered VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogueItem {
    /// VM uuid.
    pub uuid: String,
    /// VM name.
    pub name: String,
    /// VM home directory.
    pub home: PathBuf,
    /// Whether the VM is a template.
    #[serde(default)]
    pub template: bool,
}

#[derive(Debug, Clone)]
struct Claim {
    uuid: String,
    home: PathBuf,
    name: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CatalogueFile {
    #[serde(default)]
    vms: Vec<CatalogueItem>,
}

#[derive(Debug, Default)]
struct State {
    items: Vec<CatalogueItem>,
    claims: Vec<Claim>,
}

impl State {
    fn conflict(&self, uuid: &str, home: &Path, name: &str) -> Option<Error> {
        let taken = |by: RegisteredBy, value: &str| {
            Some(Error::AlreadyRegistered {
                by,
                value: value.to_string(),
            })
        };
        let entries = self
            .items
            .iter()
            .map(|i| (i.uuid.as_str(), i.home.as_path(), i.name.as_str()))
            .chain(
                self.claims
                    .iter()
                    .map(|c| (c.uuid.as_str(), c.home.as_path(), c.name.as_str())),
            );
        for (u, h, n) in entries {
            if u == uuid {
                return taken(RegisteredBy::Uuid, uuid);
            }
            if h == home {
                return taken(RegisteredBy::Path, &home.display().to_string());
            }
            if n == name {
                return taken(RegisteredBy::Name, name);
            }
        }
        None
    }
}

/// Registered VMs, optionally persisted as JSON.
#[derive(Debug)]
pub struct VmCatalogue {
    path: Option<PathBuf>,
    state: Mutex<State>,
}

impl VmCatalogue {
    /// Catalogue that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(State::default()),
        }
    }

    /// Load a catalogue file. A missing file is an empty catalogue.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file: CatalogueFile = match std::fs::read(&path) {
            Ok(data) => serde_json::from_slice(&data)
                .map_err(|e| Error::Config(format!("parse {}: {}", path.display(), e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => CatalogueFile::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: Some(path),
            state: Mutex::new(State {
                items: file.vms,
                claims: Vec::new(),
            }),
        })
    }

    fn persist(&self, items: &[CatalogueItem]) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec_pretty(&CatalogueFile {
            vms: items.to_vec(),
        })
        .map_err(|e| Error::Config(format!("serialize catalogue: {}", e)))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// All registered VMs.
    pub fn list(&self) -> Vec<CatalogueItem> {
        self.state.lock().items.clone()
    }

    /// Look a VM up by uuid, then by name.
    pub fn find(&self, key: &str) -> Option<CatalogueItem> {
        let state = self.state.lock();
        state
            .items
            .iter()
            .find(|i| i.uuid == key)
            .or_else(|| state.items.iter().find(|i| i.name == key))
            .cloned()
    }

    /// Register a VM directly.
    pub fn register(&self, item: CatalogueItem) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(e) = state.conflict(&item.uuid, &item.home, &item.name) {
            return Err(e);
        }
        state.items.push(item);
        if let Err(e) = self.persist(&state.items) {
            state.items.pop();
            return Err(e);
        }
        Ok(())
    }

    /// Unregister a VM by uuid.
    pub fn remove(&self, uuid: &str) -> Result<Option<CatalogueItem>> {
        let mut state = self.state.lock();
        let Some(pos) = state.items.iter().position(|i| i.uuid == uuid) else {
            return Ok(None);
        };
        let item = state.items.remove(pos);
        if let Err(e) = self.persist(&state.items) {
            state.items.insert(pos, item);
            return Err(e);
        }
        Ok(Some(item))
    }

    /// Claim a uuid, home and name for a VM about to be created.
    pub fn reserve(&self, uuid: &str, home: &Path, name: &str) -> Result<Reservation<'_>> {
        let mut state = self.state.lock();
        if let Some(e) = state.conflict(uuid, home, name) {
            return Err(e);
        }
        state.claims.push(Claim {
            uuid: uuid.to_string(),
            home: home.to_path_buf(),
            name: name.to_string(),
        });
        Ok(Reservation {
            catalogue: self,
            uuid: uuid.to_string(),
            active: true,
        })
    }

    fn release(&self, uuid: &str) {
        self.state.lock().claims.retain(|c| c.uuid != uuid);
    }

    fn commit_claim(&self, item: CatalogueItem) -> Result<()> {
        let mut state = self.state.lock();
        let uuid = item.uuid.clone();
        state.items.push(item);
        if let Err(e) = self.persist(&state.items) {
            state.items.pop();
            return Err(e);
        }
        state.claims.retain(|c| c.uuid != uuid);
        Ok(())
    }
}

/// A pending registration. Dropping it releases the claim.
#[derive(Debug)]
pub struct Reservation<'a> {
    catalogue: &'a VmCatalogue,
    uuid: String,
    active: bool,
}

impl Reservation<'_> {
    /// Reserved uuid.
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Turn the claim into a permanent registration.
    pub fn commit(mut self, item: CatalogueItem) -> Result<()> {
        if item.uuid != self.uuid {
            return Err(Error::unexpected(format!(
                "reservation {} committed as {}",
                self.uuid, item.uuid
            )));
        }
        self.catalogue.commit_claim(item)?;
        self.active = false;
        Ok(())
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.active {
            self.catalogue.release(&self.uuid);
        }
    }
}
