//! snapvisor - snapshot and clone dispatcher for virtual machines.
//!
//! The crate keeps a per-VM snapshot tree, serializes conflicting
//! operations through an exclusive-operation registry, and drives the
//! snapshot and clone workflows against a VM agent and a disk backend.
//!
//! # Modules
//!
//! - [`exclusive`]: which operations may run together on one VM
//! - [`snapshot`]: snapshot tree, locks, crash recovery and the engine
//! - [`clone`]: full and linked clones with rollback
//! - [`api`]: HTTP surface over the engines

pub mod agent;
pub mod api;
pub mod cancel;
pub mod catalogue;
pub mod clone;
pub mod config;
pub mod context;
pub mod disk;
pub mod error;
pub mod events;
pub mod exclusive;
pub mod host;
pub mod snapshot;
pub mod vm;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
