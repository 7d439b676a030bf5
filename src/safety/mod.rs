//! Safety and cleanup
//!
//! Per-job workspaces, symlink-safe removal and the startup orphan sweep.

pub mod cleanup;
pub mod safe_cleanup;
pub mod workspace;

pub use cleanup::{sweep_orphans, SweepReport};
pub use workspace::JobWorkspace;
