// Static validation of job and worker configuration.
// Errors block admission (job) or startup (worker); warnings are logged.

use crate::config::job::{GpuSpec, JobConfig, ResourceLimits};
use crate::config::settings::WorkerConfig;
use crate::config::types::{Result, SandboxError};
use std::path::{Component, Path};

/// Validation result with detailed errors
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn add_error(&mut self, error: String) {
        self.valid = false;
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Collapse into a single message, or `Ok` when valid.
    pub fn into_result(self) -> std::result::Result<(), String> {
        if self.valid {
            Ok(())
        } else {
            Err(self.errors.join("; "))
        }
    }
}

const RESERVED_ENV: &[&str] = &["LD_PRELOAD", "LD_LIBRARY_PATH", "LD_AUDIT", "PATH", "HOME"];
const MAX_ARGS: usize = 64;
const MAX_ARG_LEN: usize = 4096;
const MAX_INPUT_FILES: usize = 256;

/// Validate a relative path for use inside the working directory.
pub fn check_relative_path(path: &str) -> std::result::Result<(), String> {
    if path.is_empty() {
        return Err("path is empty".to_string());
    }
    if path.contains('\0') {
        return Err(format!("path contains NUL byte: {:?}", path));
    }
    let p = Path::new(path);
    if p.is_absolute() {
        return Err(format!("path must be relative: {}", path));
    }
    for component in p.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => return Err(format!("path escapes working directory: {}", path)),
        }
    }
    Ok(())
}

fn check_range<T: PartialOrd + std::fmt::Display + Copy>(
    name: &str,
    value: T,
    (min, max): (T, T),
    result: &mut ValidationResult,
) {
    if value < min || value > max {
        result.add_error(format!("{} must be in {}..={}, got {}", name, min, max, value));
    }
}

fn validate_limits(limits: &ResourceLimits, result: &mut ValidationResult) {
    check_range("memory_mb", limits.memory_mb, ResourceLimits::MEMORY_MB_RANGE, result);
    check_range("cpu_seconds", limits.cpu_seconds, ResourceLimits::CPU_SECONDS_RANGE, result);
    check_range("wall_seconds", limits.wall_seconds, ResourceLimits::WALL_SECONDS_RANGE, result);
    check_range("cpu_cores", limits.cpu_cores, ResourceLimits::CPU_CORES_RANGE, result);
    check_range("max_processes", limits.max_processes, ResourceLimits::PROCESSES_RANGE, result);
    check_range("tmpfs_mb", limits.tmpfs_mb, ResourceLimits::TMPFS_MB_RANGE, result);

    if limits.max_open_files < 16 {
        result.add_error(format!(
            "max_open_files must be at least 16, got {}",
            limits.max_open_files
        ));
    }
    if limits.max_file_mb > limits.tmpfs_mb {
        result.add_warning(format!(
            "max_file_mb ({}) exceeds tmpfs_mb ({}); tmpfs size is the effective cap",
            limits.max_file_mb, limits.tmpfs_mb
        ));
    }
    if limits.wall_seconds < limits.cpu_seconds / u64::from(limits.cpu_cores.max(1)) {
        result.add_warning("wall_seconds is shorter than the CPU budget can use".to_string());
    }
}

fn validate_env(config: &JobConfig, result: &mut ValidationResult) {
    for (key, value) in &config.env {
        let mut chars = key.chars();
        let well_formed = matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
            && chars.all(|c| c == '_' || c.is_ascii_alphanumeric());
        if !well_formed {
            result.add_error(format!("invalid environment key: {:?}", key));
        }
        if RESERVED_ENV.contains(&key.as_str()) {
            result.add_error(format!("environment key is reserved: {}", key));
        }
        if value.contains('\0') {
            result.add_error(format!("environment value for {} contains NUL byte", key));
        }
    }
}

fn validate_gpu(gpu: &GpuSpec, result: &mut ValidationResult) {
    if gpu.memory_mb == 0 || gpu.memory_mb > GpuSpec::MAX_MEMORY_MB {
        result.add_error(format!(
            "gpu memory_mb must be in 1..={}, got {}",
            GpuSpec::MAX_MEMORY_MB,
            gpu.memory_mb
        ));
    }
}

/// Validate a job configuration before admission.
pub fn validate_job(config: &JobConfig) -> ValidationResult {
    let mut result = ValidationResult::new();

    if let Err(e) = check_relative_path(&config.entrypoint) {
        result.add_error(format!("entrypoint: {}", e));
    }

    if config.args.len() > MAX_ARGS {
        result.add_error(format!("too many arguments ({} > {})", config.args.len(), MAX_ARGS));
    }
    for arg in &config.args {
        if arg.contains('\0') || arg.len() > MAX_ARG_LEN {
            result.add_error("argument contains NUL byte or is too long".to_string());
            break;
        }
    }

    validate_limits(&config.limits, &mut result);
    validate_env(config, &mut result);

    if let Some(gpu) = &config.gpu {
        validate_gpu(gpu, &mut result);
    }

    if config.inputs.len() > MAX_INPUT_FILES {
        result.add_error(format!("too many input files ({})", config.inputs.len()));
    }
    for input in &config.inputs {
        if let Err(e) = check_relative_path(&input.path) {
            result.add_error(format!("input file: {}", e));
        }
    }
    if config.input_bytes() > config.limits.tmpfs_bytes() {
        result.add_error(format!(
            "input files ({} bytes) do not fit in tmpfs_mb={}",
            config.input_bytes(),
            config.limits.tmpfs_mb
        ));
    }
    if !config.inputs.is_empty() && !config.inputs.iter().any(|f| f.path == config.entrypoint) {
        result.add_warning(format!(
            "entrypoint {} is not among the input files",
            config.entrypoint
        ));
    }

    for pattern in &config.outputs {
        if let Err(e) = glob::Pattern::new(pattern) {
            result.add_error(format!("invalid output pattern {:?}: {}", pattern, e));
        }
        if pattern.starts_with('/') || pattern.split('/').any(|part| part == "..") {
            result.add_error(format!("output pattern escapes working directory: {}", pattern));
        }
    }

    result
}

/// Validate worker configuration at startup.
/// Strict mode turns any error into a hard failure.
pub fn validate_worker_config(config: &WorkerConfig) -> Result<ValidationResult> {
    let mut result = ValidationResult::new();
    let quota = &config.quota;

    if quota.cpu_seconds_per_window <= 0.0 {
        result.add_error("quota.cpu_seconds_per_window must be positive".to_string());
    }
    if quota.cpu_window_secs == 0 {
        result.add_error("quota.cpu_window_secs must be positive".to_string());
    }
    if quota.max_concurrent_jobs == 0 {
        result.add_error("quota.max_concurrent_jobs must be at least 1".to_string());
    }
    if quota.request_burst == 0 || quota.request_refill_per_sec <= 0.0 {
        result.add_error("quota request bucket needs positive burst and refill".to_string());
    }

    let lifecycle = &config.lifecycle;
    if lifecycle.max_parallel_jobs == 0 {
        result.add_error("lifecycle.max_parallel_jobs must be at least 1".to_string());
    }
    if lifecycle.failed_ttl_secs > lifecycle.completed_ttl_secs {
        result.add_warning("failed jobs are retained longer than completed jobs".to_string());
    }
    if lifecycle.sweep_interval_ms == 0 {
        result.add_error("lifecycle.sweep_interval_ms must be positive".to_string());
    }

    let sandbox = &config.sandbox;
    for (name, path) in [
        ("cgroup_root", &sandbox.cgroup_root),
        ("jobs_root", &sandbox.jobs_root),
        ("runtime_root", &sandbox.runtime_root),
    ] {
        if !path.is_absolute() {
            result.add_error(format!("sandbox.{} must be absolute: {}", name, path.display()));
        }
    }
    if sandbox.jobs_root.starts_with(&sandbox.runtime_root)
        || sandbox.runtime_root.starts_with(&sandbox.jobs_root)
    {
        result.add_error("sandbox.jobs_root and sandbox.runtime_root must not nest".to_string());
    }
    if sandbox.sandbox_uid == 0 || sandbox.sandbox_gid == 0 {
        result.add_error("sandbox_uid/sandbox_gid must not be root".to_string());
    }
    for bind in sandbox.base_binds.iter().chain(&sandbox.config_binds) {
        if !bind.is_absolute() {
            result.add_error(format!("bind path must be absolute: {}", bind.display()));
        } else if !bind.exists() {
            result.add_warning(format!("bind path missing on host: {}", bind.display()));
        }
    }
    if !sandbox.strict_mode {
        result.add_warning("strict_mode disabled: isolation failures degrade to warnings".into());
    }

    if sandbox.strict_mode && !result.is_valid() {
        return Err(SandboxError::Config(format!(
            "Config validation failed in strict mode:\n{}",
            result.errors.join("\n")
        )));
    }

    for warning in &result.warnings {
        log::warn!("config: {}", warning);
    }

    Ok(result)
}
