//! Serialization of conflicting VM operations.
//!
//! - [`CommandKind`] and [`compatible`]: which commands may run together
//! - [`ExclusiveRegistry`]: per-VM table of executing commands
//! - [`ExclusiveGuard`]: scoped registration

pub mod kinds;
pub mod registry;

pub use kinds::{compatible, CommandKind};
pub use registry::{ExclusiveGuard, ExclusiveRegistry, HeldOp};
