//! Execution control
//!
//! The type-state pre-exec chain run inside the sandbox.

pub mod preexec;
