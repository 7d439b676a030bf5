//! Job lifecycle management
//!
//! - [`job`]: job records and the QUEUED -> RUNNING -> terminal state machine
//! - [`queue`]: the run queue
//! - [`registry`]: id -> record map
//! - [`digest`]: job hashes and result digests
//! - [`janitor`]: retention decisions (TTL, memory pressure, stuck jobs)
//! - [`coordinator`]: submission, scheduling, queries and shutdown

pub mod coordinator;
pub mod digest;
pub mod janitor;
pub mod job;
pub mod queue;
pub mod registry;

pub use coordinator::Coordinator;
pub use job::{Job, JobId, JobLogs, JobSnapshot, JobState, JobUsage};
