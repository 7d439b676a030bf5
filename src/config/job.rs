//! Typed job configuration consumed by the coordinator.
//!
//! Manifest parsing happens upstream; by the time a `JobConfig` reaches
//! `submit` every field is already typed. `validate` checks the bounds and
//! path rules that typing alone cannot express.

use crate::config::presets::Interpreter;
use crate::config::validator::{validate_job, ValidationResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const MIB: u64 = 1024 * 1024;

/// Per-job resource ceilings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Hard cgroup memory ceiling
    pub memory_mb: u64,
    /// CPU-seconds ceiling across all tasks of the job
    pub cpu_seconds: u64,
    /// Wall clock deadline, measured from admission
    pub wall_seconds: u64,
    /// CPU bandwidth in cores (`cpu.max` runtime per period)
    pub cpu_cores: u32,
    /// `pids.max` for the job cgroup
    pub max_processes: u32,
    pub max_open_files: u64,
    /// RLIMIT_FSIZE for the payload
    pub max_file_mb: u64,
    /// Size of the writable working directory
    pub tmpfs_mb: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 512,
            cpu_seconds: 300,
            wall_seconds: 300,
            cpu_cores: 1,
            max_processes: 32,
            max_open_files: 256,
            max_file_mb: 100,
            tmpfs_mb: 100,
        }
    }
}

impl ResourceLimits {
    pub const MEMORY_MB_RANGE: (u64, u64) = (16, 8192);
    pub const CPU_SECONDS_RANGE: (u64, u64) = (1, 300);
    pub const WALL_SECONDS_RANGE: (u64, u64) = (1, 600);
    pub const CPU_CORES_RANGE: (u32, u32) = (1, 8);
    pub const PROCESSES_RANGE: (u32, u32) = (1, 256);
    pub const TMPFS_MB_RANGE: (u64, u64) = (16, 1024);

    pub fn memory_bytes(&self) -> u64 {
        self.memory_mb * MIB
    }

    pub fn tmpfs_bytes(&self) -> u64 {
        self.tmpfs_mb * MIB
    }
}

/// Isolation strength requested by the job
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityLevel {
    #[default]
    Standard,
    /// No /etc binds, no process creation after the initial exec
    Paranoid,
    /// Standard isolation plus exactly one bound GPU device
    GpuSecure,
}

/// GPU requirement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuSpec {
    pub device_id: u32,
    pub memory_mb: u64,
}

impl GpuSpec {
    pub const MAX_MEMORY_MB: u64 = 8192;
    pub const MAX_DEVICES_PER_JOB: usize = 1;
}

/// A file placed in the working directory before launch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputFile {
    /// Relative path inside the working directory
    pub path: String,
    pub contents: Vec<u8>,
    #[serde(default)]
    pub executable: bool,
}

/// Validated job configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    /// Relative path of the file handed to the interpreter
    pub entrypoint: String,
    pub interpreter: Interpreter,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub limits: ResourceLimits,
    #[serde(default)]
    pub security: SecurityLevel,
    #[serde(default)]
    pub gpu: Option<GpuSpec>,
    /// Glob patterns selecting output files; empty selects everything
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub inputs: Vec<InputFile>,
}

impl JobConfig {
    pub fn new(interpreter: Interpreter, entrypoint: impl Into<String>) -> Self {
        Self {
            entrypoint: entrypoint.into(),
            interpreter,
            args: Vec::new(),
            env: BTreeMap::new(),
            limits: ResourceLimits::default(),
            security: SecurityLevel::default(),
            gpu: None,
            outputs: Vec::new(),
            inputs: Vec::new(),
        }
    }

    pub fn with_input(mut self, path: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        self.inputs.push(InputFile {
            path: path.into(),
            contents: contents.into(),
            executable: false,
        });
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Run the static checks; returns every problem found.
    pub fn validate(&self) -> ValidationResult {
        validate_job(self)
    }

    /// Input bytes held in memory for this job
    pub fn input_bytes(&self) -> u64 {
        self.inputs.iter().map(|f| f.contents.len() as u64).sum()
    }
}
