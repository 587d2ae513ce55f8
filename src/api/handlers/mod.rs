//! API request handlers.

pub mod clone;
pub mod events;
pub mod health;
pub mod snapshots;
pub mod vms;
