/// Core types shared by the sandbox engine, quota engine and job lifecycle.
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Outcome of a single sandboxed execution.
///
/// Runtime violations are carried here as data. A job that was killed for
/// exceeding its deadline or memory ceiling still produces a complete
/// result.
#[derive(Default, Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Exit code of the payload (`None` when killed by a signal)
    pub exit_code: Option<i32>,
    /// Signal that terminated the payload, if any
    pub signal: Option<i32>,
    /// Captured standard output, bounded by `max_output_bytes`
    pub stdout: String,
    /// Captured standard error, bounded by `max_output_bytes`
    pub stderr: String,
    pub stdout_integrity: OutputIntegrity,
    pub stderr_integrity: OutputIntegrity,
    /// Wall clock duration of the execution
    pub execution_time: Duration,
    /// Aggregate CPU time of every task in the cgroup, in seconds
    pub cpu_seconds: f64,
    /// Peak cgroup memory usage in bytes
    pub memory_peak: u64,
    /// Peak GPU memory in bytes, when the job held a GPU
    pub gpu_memory_peak: Option<u64>,
    /// True when the wall deadline or CPU ceiling forced a kill
    pub timeout_occurred: bool,
    /// Runtime violation that ended the job, if any
    pub violation: Option<Violation>,
    /// Files collected from the working directory
    pub output_files: Vec<OutputFile>,
}

impl ExecutionResult {
    /// A clean exit: exit code 0 and no violation.
    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0) && self.violation.is_none()
    }

    /// Reason code recorded on a FAILED job.
    pub fn failure_reason(&self) -> Option<FailureReason> {
        if self.is_success() {
            return None;
        }
        Some(match self.violation {
            Some(v) => FailureReason::Violation(v),
            None => match (self.exit_code, self.signal) {
                (Some(code), _) => FailureReason::NonZeroExit(code),
                (None, Some(sig)) => FailureReason::Signaled(sig),
                (None, None) => FailureReason::Internal("payload exit status unavailable".into()),
            },
        })
    }
}

/// Runtime violations. These are routine outcomes of untrusted code.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum Violation {
    /// Wall clock deadline reached
    #[serde(rename = "wall_timeout")]
    WallTimeout,
    /// CPU-seconds ceiling reached
    #[serde(rename = "cpu_timeout")]
    CpuTimeout,
    /// cgroup memory ceiling breached and the kernel OOM killer fired
    #[serde(rename = "memory_limit")]
    MemoryLimit,
    /// Seccomp filter killed the payload (SIGSYS)
    #[serde(rename = "blocked_syscall")]
    BlockedSyscall,
    /// File size limit hit (SIGXFSZ)
    #[serde(rename = "file_size_limit")]
    FileSizeLimit,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Violation::WallTimeout => "wall_timeout",
            Violation::CpuTimeout => "cpu_timeout",
            Violation::MemoryLimit => "memory_limit",
            Violation::BlockedSyscall => "blocked_syscall",
            Violation::FileSizeLimit => "file_size_limit",
        };
        f.write_str(s)
    }
}

/// Reason code attached to a FAILED job.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    Violation(Violation),
    NonZeroExit(i32),
    Signaled(i32),
    /// Sandbox construction failed after the job was scheduled
    SetupFailure(String),
    /// Coordinator or I/O fault isolated to this job
    Internal(String),
    /// Cancelled by shutdown or memory-pressure eviction
    Cancelled,
    /// Wall deadline passed while the job was still queued; never executed
    Expired,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::Violation(v) => write!(f, "violation: {v}"),
            FailureReason::NonZeroExit(code) => write!(f, "exited with code {code}"),
            FailureReason::Signaled(sig) => write!(f, "terminated by signal {sig}"),
            FailureReason::SetupFailure(msg) => write!(f, "sandbox setup failed: {msg}"),
            FailureReason::Internal(msg) => write!(f, "internal error: {msg}"),
            FailureReason::Cancelled => f.write_str("cancelled"),
            FailureReason::Expired => f.write_str("deadline passed before start"),
        }
    }
}

/// Output integrity classification
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum OutputIntegrity {
    #[default]
    #[serde(rename = "complete")]
    Complete,
    #[serde(rename = "truncated_by_limit")]
    TruncatedByLimit,
    #[serde(rename = "read_error")]
    ReadError,
}

impl std::fmt::Display for OutputIntegrity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputIntegrity::Complete => write!(f, "complete"),
            OutputIntegrity::TruncatedByLimit => write!(f, "truncated_by_limit"),
            OutputIntegrity::ReadError => write!(f, "read_error"),
        }
    }
}

/// Coarse file classification for collected outputs.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Text,
    Json,
    Csv,
    Image,
    Archive,
    Model,
    Data,
    Binary,
}

/// A file produced by a job, reported after execution.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct OutputFile {
    /// Path relative to the job working directory
    pub path: String,
    pub size_bytes: u64,
    /// Lowercase hex SHA-256 of the file content
    pub sha256: String,
    pub kind: FileKind,
}

/// Cgroup accounting read back after execution
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CgroupEvidence {
    pub memory_peak: Option<u64>,
    pub memory_limit: Option<u64>,
    pub oom_events: u64,
    pub oom_kill_events: u64,
    pub cpu_usage_usec: Option<u64>,
    pub process_count: Option<u32>,
}

/// Sandbox construction failures.
///
/// These abort the execution before any CPU quota is charged and are
/// reported separately from runtime outcomes.
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cgroup error: {0}")]
    Cgroup(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Namespace isolation error: {0}")]
    Namespace(String),

    #[error("Mount error: {0}")]
    Mount(String),

    #[error("Filesystem error: {0}")]
    Filesystem(String),

    #[error("Seccomp error: {0}")]
    Seccomp(String),

    #[error("Privilege error: {0}")]
    Privilege(String),

    #[error("GPU error: {0}")]
    Gpu(String),
}

pub type Result<T> = std::result::Result<T, SandboxError>;

impl From<nix::errno::Errno> for SandboxError {
    fn from(err: nix::errno::Errno) -> Self {
        SandboxError::Process(format!("System call failed: {}", err))
    }
}

/// Why admission was refused.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    Banned {
        /// `None` for a permanent ban
        remaining_secs: Option<u64>,
    },
    ConcurrencyLimit {
        active: u32,
        max: u32,
    },
    CpuQuotaExhausted {
        used_seconds: f64,
        limit_seconds: f64,
    },
    HourlyJobLimit {
        max: u32,
    },
    RequestRate,
}

/// Synchronous admission rejection. No job id is issued.
#[derive(Error, Clone, Debug, Serialize, Deserialize, PartialEq)]
#[error("admission rejected for {client_id}: {reason:?} (retry after {retry_after:?})")]
pub struct AdmissionRejected {
    pub client_id: String,
    pub reason: RejectReason,
    pub retry_after: Duration,
}

/// Errors returned by `submit`.
#[derive(Error, Debug)]
pub enum SubmitError {
    #[error(transparent)]
    Rejected(#[from] AdmissionRejected),

    #[error("invalid job configuration: {0}")]
    Invalid(String),

    #[error("sandbox preflight failed: {0}")]
    Setup(#[from] SandboxError),

    #[error("coordinator is shutting down")]
    ShuttingDown,
}

/// Errors returned by job queries.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum JobError {
    #[error("job {0} not found")]
    NotFound(String),

    #[error("job {0} has not finished")]
    NotFinished(String),

    #[error("invalid output path: {0}")]
    InvalidPath(String),
}
