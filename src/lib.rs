//! sandrun: ephemeral sandboxed code execution with CPU-time quotas
//!
//! # Architecture
//!
//! ## Kernel Primitives ([`kernel`])
//! - [`kernel::namespace`]: namespace set for the proxy clone
//! - [`kernel::cgroup`]: cgroup v2 job groups, limits and accounting
//! - [`kernel::capabilities`]: capability bounding-set drop
//! - [`kernel::credentials`]: uid/gid transition
//! - [`kernel::mount`]: private root, tmpfs workdirs, mountinfo scanning
//! - [`kernel::seccomp`]: syscall allow-lists
//! - [`kernel::gpu`]: GPU device probing and memory sampling
//! - [`kernel::signal`]: shutdown signal handling for the binary
//!
//! ## Sandbox Execution ([`core`], [`exec`])
//! - [`core::engine`]: the [`core::SandboxEngine`] seam and its Linux implementation
//! - [`core::supervisor`]: proxy launch and event-driven supervision
//! - [`core::proxy`]: PID-1 proxy inside the job namespaces
//! - [`exec::preexec`]: type-state ordered pre-exec chain
//!
//! ## Admission ([`quota`])
//! - [`quota::engine`]: per-client quota table
//! - [`quota::token_bucket`], [`quota::sliding_window`]: rate primitives
//!
//! ## Job Lifecycle ([`lifecycle`])
//! - [`lifecycle::coordinator`]: submit, schedule, query, shut down
//! - [`lifecycle::janitor`]: TTL and memory-pressure retention
//!
//! ## Safety & Cleanup ([`safety`])
//! - [`safety::workspace`]: per-job tmpfs working directories
//! - [`safety::cleanup`]: startup orphan sweep
//!
//! ## Observability ([`observability`])
//! - [`observability::metrics`]: counters, gauges, histograms and Prometheus export
//!
//! ## Configuration ([`config`])
//! - [`config::settings`]: worker configuration
//! - [`config::job`]: typed job configuration
//! - [`config::presets`]: interpreter launch templates
//! - [`config::validator`]: static checks

// Kernel Primitives
pub mod kernel;

// Execution Control
pub mod exec;

// Sandbox engine
pub mod core;

// Admission control
pub mod quota;

// Job lifecycle
pub mod lifecycle;

// Safety & Cleanup
pub mod safety;

// Observability
pub mod observability;

// Configuration
pub mod config;

// Utilities
pub mod utils;

// CLI entrypoint wiring for the sandrun binary.
pub mod cli;

// Re-export commonly used types for convenience
pub use config::types::*;
pub use config::job::{JobConfig, ResourceLimits, SecurityLevel};
pub use config::presets::Interpreter;
pub use config::settings::WorkerConfig;
pub use lifecycle::{Coordinator, JobId, JobSnapshot, JobState};
