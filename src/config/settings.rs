//! Worker configuration loaded from a JSON file.

use crate::config::types::{Result, SandboxError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Per-client admission limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub cpu_seconds_per_window: f64,
    pub cpu_window_secs: u64,
    pub max_concurrent_jobs: u32,
    pub max_jobs_per_hour: u32,
    /// Token bucket capacity for submission requests
    pub request_burst: u32,
    pub request_refill_per_sec: f64,
    /// Clients idle this long with no jobs and no ban are forgotten
    pub client_idle_ttl_secs: u64,
    pub default_ban_secs: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            cpu_seconds_per_window: 10.0,
            cpu_window_secs: 60,
            max_concurrent_jobs: 2,
            max_jobs_per_hour: 20,
            request_burst: 5,
            request_refill_per_sec: 1.0,
            client_idle_ttl_secs: 3600,
            default_ban_secs: 3600,
        }
    }
}

impl QuotaConfig {
    pub fn cpu_window(&self) -> Duration {
        Duration::from_secs(self.cpu_window_secs)
    }

    pub fn client_idle_ttl(&self) -> Duration {
        Duration::from_secs(self.client_idle_ttl_secs)
    }
}

/// Scheduling and retention
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Worker-wide cap on simultaneously RUNNING jobs
    pub max_parallel_jobs: usize,
    pub completed_ttl_secs: u64,
    pub failed_ttl_secs: u64,
    pub sweep_interval_ms: u64,
    /// Aggregate captured-output bytes that trigger eviction
    pub memory_pressure_bytes: u64,
    /// A RUNNING job this far past its deadline counts as stuck
    pub stuck_grace_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            max_parallel_jobs: 4,
            completed_ttl_secs: 300,
            failed_ttl_secs: 60,
            sweep_interval_ms: 1000,
            memory_pressure_bytes: 256 * 1024 * 1024,
            stuck_grace_secs: 30,
        }
    }
}

impl LifecycleConfig {
    pub fn completed_ttl(&self) -> Duration {
        Duration::from_secs(self.completed_ttl_secs)
    }

    pub fn failed_ttl(&self) -> Duration {
        Duration::from_secs(self.failed_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn stuck_grace(&self) -> Duration {
        Duration::from_secs(self.stuck_grace_secs)
    }
}

/// Host layout and isolation controls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    /// Parent cgroup for every job cgroup
    pub cgroup_root: PathBuf,
    /// Per-job tmpfs working directories
    pub jobs_root: PathBuf,
    /// Per-job root scaffolds used for pivot_root
    pub runtime_root: PathBuf,
    /// Host directories bound read-only into every sandbox
    pub base_binds: Vec<PathBuf>,
    /// Extra read-only binds, skipped at `SecurityLevel::Paranoid`
    pub config_binds: Vec<PathBuf>,
    pub sandbox_uid: u32,
    pub sandbox_gid: u32,
    /// Fail setup when any isolation control cannot be applied
    pub strict_mode: bool,
    pub kill_grace_ms: u64,
    pub max_output_bytes: usize,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            cgroup_root: PathBuf::from("/sys/fs/cgroup/sandrun"),
            jobs_root: PathBuf::from("/run/sandrun/jobs"),
            runtime_root: PathBuf::from("/run/sandrun/roots"),
            base_binds: ["/usr", "/bin", "/lib", "/lib64", "/sbin"]
                .iter()
                .map(PathBuf::from)
                .collect(),
            config_binds: ["/etc/alternatives", "/etc/ld.so.cache", "/etc/ssl/certs"]
                .iter()
                .map(PathBuf::from)
                .collect(),
            sandbox_uid: 65534,
            sandbox_gid: 65534,
            strict_mode: true,
            kill_grace_ms: 200,
            max_output_bytes: 10 * 1024 * 1024,
        }
    }
}

impl SandboxSettings {
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

/// Top-level worker configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub quota: QuotaConfig,
    pub lifecycle: LifecycleConfig,
    pub sandbox: SandboxSettings,
}

impl WorkerConfig {
    /// Load configuration from a JSON file. Missing fields take defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            SandboxError::Config(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        let config: WorkerConfig = serde_json::from_str(&content)
            .map_err(|e| SandboxError::Config(format!("Failed to parse config JSON: {}", e)))?;

        Ok(config)
    }
}
