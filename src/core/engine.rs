//! Sandbox execution engine.
//!
//! [`LinuxEngine`] turns one validated job into one supervised launch:
//! workspace, cgroup, private root, proxy, supervision, evidence and
//! output collection. Setup failures come back as `Err`; runtime
//! violations are data on the returned [`ExecutionResult`].

use crate::config::job::{JobConfig, SecurityLevel, MIB};
use crate::config::settings::SandboxSettings;
use crate::config::types::{
    CgroupEvidence, ExecutionResult, Result, SandboxError, Violation,
};
use crate::core::cancel::CancelToken;
use crate::core::supervisor::{spawn_proxy, supervise, SupervisionBounds};
use crate::core::types::{LaunchRequest, StopReason, SupervisorOutcome};
use crate::exec::preexec::PayloadHygiene;
use crate::kernel::cgroup::{CgroupV2, JobCgroup};
use crate::kernel::gpu;
use crate::kernel::mount::RootfsPlan;
use crate::kernel::namespace::NamespaceSet;
use crate::safety::safe_cleanup::remove_tree_secure;
use crate::safety::workspace::JobWorkspace;
use crate::utils::env_hygiene::sandbox_environment;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const GPU_SAMPLE_INTERVAL: Duration = Duration::from_millis(200);

/// What the lifecycle layer hands the engine for one job
#[derive(Debug, Clone, Copy)]
pub struct ExecutionContext<'a> {
    pub job_id: &'a str,
    pub config: &'a JobConfig,
    /// Absolute wall-clock deadline fixed at admission
    pub deadline: Instant,
    /// CPU-seconds granted by the quota engine; never above the job's own limit
    pub cpu_seconds: f64,
}

impl ExecutionContext<'_> {
    /// Effective CPU ceiling in microseconds.
    pub fn cpu_limit_usec(&self) -> u64 {
        (self.cpu_seconds.min(self.config.limits.cpu_seconds as f64).max(0.0) * 1e6) as u64
    }
}

/// A finished execution. The workspace stays alive for downloads.
#[derive(Debug)]
pub struct Execution {
    pub result: ExecutionResult,
    pub workspace: Option<JobWorkspace>,
}

/// The seam between the lifecycle manager and process isolation.
pub trait SandboxEngine: Send + Sync {
    /// Checks that can fail before a job id is issued.
    fn preflight(&self, config: &JobConfig) -> Result<()>;

    /// Run the job to completion or forced termination.
    fn execute(&self, ctx: &ExecutionContext<'_>, cancel: &CancelToken) -> Result<Execution>;
}

/// Map what the supervisor saw onto a runtime violation.
///
/// Memory beats time: an OOM kill often surfaces as a late exit, and a
/// kill at the deadline must not hide it.
pub fn classify_violation(
    outcome: &SupervisorOutcome,
    evidence: &CgroupEvidence,
    cpu_limit_usec: u64,
) -> Option<Violation> {
    let signal = outcome.signal();
    if evidence.oom_kill_events > 0
        || matches!(outcome.stop, Some(StopReason::MemoryLimit | StopReason::GpuMemoryLimit))
    {
        return Some(Violation::MemoryLimit);
    }
    if outcome.stop == Some(StopReason::Deadline) {
        return Some(Violation::WallTimeout);
    }
    let cpu_exhausted = evidence
        .cpu_usage_usec
        .map_or(false, |used| used >= cpu_limit_usec)
        && outcome.exit_code() != Some(0);
    if outcome.stop == Some(StopReason::CpuLimit) || signal == Some(libc::SIGXCPU) || cpu_exhausted {
        return Some(Violation::CpuTimeout);
    }
    match signal {
        Some(libc::SIGSYS) => Some(Violation::BlockedSyscall),
        Some(libc::SIGXFSZ) => Some(Violation::FileSizeLimit),
        _ => None,
    }
}

/// Exclusive use of one GPU for the duration of a job
struct GpuLease<'a> {
    leases: &'a Mutex<HashSet<u32>>,
    device_id: u32,
}

impl<'a> GpuLease<'a> {
    fn acquire(leases: &'a Mutex<HashSet<u32>>, device_id: u32) -> Result<Self> {
        let mut held = leases.lock().unwrap_or_else(PoisonError::into_inner);
        if !held.insert(device_id) {
            return Err(SandboxError::Gpu(format!("GPU {} is already in use", device_id)));
        }
        Ok(Self { leases, device_id })
    }
}

impl Drop for GpuLease<'_> {
    fn drop(&mut self) {
        self.leases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.device_id);
    }
}

/// Samples device memory while the job runs and trips `trip` above the limit.
struct GpuWatch {
    stop: Sender<()>,
    handle: JoinHandle<u64>,
}

impl GpuWatch {
    fn start(device_id: u32, limit_mb: u64, trip: CancelToken) -> Result<Self> {
        let (stop, stop_rx) = bounded::<()>(1);
        let handle = std::thread::Builder::new()
            .name(format!("gpu-watch-{}", device_id))
            .spawn(move || {
                let mut peak_mb = 0;
                loop {
                    if let Some(used) = gpu::sample_memory_used(device_id) {
                        peak_mb = peak_mb.max(used);
                        if used > limit_mb && !trip.is_cancelled() {
                            log::info!(
                                "GPU {} memory {} MiB above limit {} MiB",
                                device_id,
                                used,
                                limit_mb
                            );
                            trip.cancel();
                        }
                    }
                    match stop_rx.recv_timeout(GPU_SAMPLE_INTERVAL) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        _ => break,
                    }
                }
                peak_mb * MIB
            })?;
        Ok(Self { stop, handle })
    }

    /// Stop sampling; returns the peak in bytes.
    fn finish(self) -> u64 {
        let _ = self.stop.send(());
        self.handle.join().unwrap_or(0)
    }
}

/// Engine backed by Linux namespaces, cgroup v2, seccomp and tmpfs.
pub struct LinuxEngine {
    settings: SandboxSettings,
    cgroups: CgroupV2,
    namespaces: NamespaceSet,
    gpu_leases: Mutex<HashSet<u32>>,
}

impl LinuxEngine {
    pub fn new(settings: SandboxSettings) -> Result<Self> {
        let cgroups = CgroupV2::new(&settings.cgroup_root, settings.strict_mode);
        if let Err(e) = cgroups.ensure_root() {
            if settings.strict_mode {
                return Err(e);
            }
            log::warn!("cgroup root unavailable, jobs run without cgroup limits: {}", e);
        }
        for dir in [&settings.jobs_root, &settings.runtime_root] {
            std::fs::create_dir_all(dir).map_err(|e| {
                SandboxError::Filesystem(format!("Failed to create {}: {}", dir.display(), e))
            })?;
        }
        Ok(Self {
            settings,
            cgroups,
            namespaces: NamespaceSet::default(),
            gpu_leases: Mutex::new(HashSet::new()),
        })
    }

    pub fn settings(&self) -> &SandboxSettings {
        &self.settings
    }

    fn create_cgroup(&self, ctx: &ExecutionContext<'_>) -> Result<Option<JobCgroup>> {
        match self.cgroups.create(ctx.job_id, &ctx.config.limits) {
            Ok(cgroup) => Ok(Some(cgroup)),
            Err(e) if self.settings.strict_mode => Err(e),
            Err(e) => {
                log::warn!(
                    "Job {} runs without a cgroup (permissive mode): {}",
                    ctx.job_id,
                    e
                );
                Ok(None)
            }
        }
    }

    fn rootfs_plan(&self, root: &Path, workdir: &Path, config: &JobConfig) -> Result<RootfsPlan> {
        let mut ro_binds = self.settings.base_binds.clone();
        if config.security != SecurityLevel::Paranoid {
            ro_binds.extend(self.settings.config_binds.iter().cloned());
        }
        let devices = match &config.gpu {
            Some(spec) => gpu::probe(spec.device_id)?.nodes(),
            None => Vec::new(),
        };
        Ok(RootfsPlan {
            root: root.to_path_buf(),
            ro_binds,
            workdir: workdir.to_path_buf(),
            devices,
        })
    }

    fn launch_request(
        &self,
        ctx: &ExecutionContext<'_>,
        cgroup: Option<&JobCgroup>,
        rootfs: RootfsPlan,
    ) -> LaunchRequest {
        let config = ctx.config;
        let mut limits = config.limits.clone();
        limits.cpu_seconds = limits.cpu_seconds.min(ctx.cpu_seconds.ceil().max(1.0) as u64);
        LaunchRequest {
            job_id: ctx.job_id.to_string(),
            cgroup_name: cgroup.map(JobCgroup::name).unwrap_or_default(),
            strict_mode: self.settings.strict_mode,
            namespaces: self.namespaces,
            rootfs,
            // Descriptors are filled in by spawn_proxy.
            hygiene: PayloadHygiene::new(&limits, -1, -1),
            security: config.security,
            uid: self.settings.sandbox_uid,
            gid: self.settings.sandbox_gid,
            argv: config.interpreter.argv(&config.entrypoint, &config.args),
            env: sandbox_environment(config).into_iter().collect(),
        }
    }

    fn run(
        &self,
        ctx: &ExecutionContext<'_>,
        workspace: &JobWorkspace,
        cancel: &CancelToken,
    ) -> Result<ExecutionResult> {
        let config = ctx.config;
        let mut cgroup = self.create_cgroup(ctx)?;

        let root = self.settings.runtime_root.join(ctx.job_id);
        std::fs::create_dir_all(&root)?;
        let outcome = self.launch_and_supervise(ctx, workspace, cgroup.as_ref(), &root, cancel);
        if let Err(e) = remove_tree_secure(&root) {
            log::warn!("Failed to remove root scaffold {}: {}", root.display(), e);
        }
        let (outcome, gpu_memory_peak) = outcome?;

        let evidence = cgroup.as_ref().map(JobCgroup::evidence).unwrap_or_default();
        if let Some(cg) = cgroup.as_mut() {
            if let Err(e) = cg.release() {
                log::warn!("Failed to release cgroup for job {}: {}", ctx.job_id, e);
            }
        }

        if let Some(status) = &outcome.proxy_status {
            if !status.missing_controls.is_empty() {
                log::warn!(
                    "Job {} ran without: {} (permissive mode)",
                    ctx.job_id,
                    status.missing_controls.join(", ")
                );
            }
        }
        if let Some(err) = outcome.setup_error() {
            return Err(SandboxError::Process(format!("sandbox setup failed: {}", err)));
        }

        let violation = classify_violation(&outcome, &evidence, ctx.cpu_limit_usec());
        let cpu_seconds = match evidence.cpu_usage_usec {
            Some(usec) => usec as f64 / 1e6,
            // No cgroup accounting: charge wall time
            None => outcome.wall_time.as_secs_f64(),
        };
        let output_files = workspace.collect_outputs(&config.outputs).unwrap_or_else(|e| {
            log::warn!("Output collection for job {} failed: {}", ctx.job_id, e);
            Vec::new()
        });

        let limit = self.settings.max_output_bytes;
        let stdout_integrity = outcome.stdout.integrity;
        let stderr_integrity = outcome.stderr.integrity;
        Ok(ExecutionResult {
            exit_code: outcome.exit_code(),
            signal: outcome.signal(),
            stdout: outcome.stdout.into_text(limit),
            stderr: outcome.stderr.into_text(limit),
            stdout_integrity,
            stderr_integrity,
            execution_time: outcome.wall_time,
            cpu_seconds,
            memory_peak: evidence.memory_peak.unwrap_or(0),
            gpu_memory_peak,
            timeout_occurred: matches!(
                violation,
                Some(Violation::WallTimeout | Violation::CpuTimeout)
            ),
            violation,
            output_files,
        })
    }

    fn launch_and_supervise(
        &self,
        ctx: &ExecutionContext<'_>,
        workspace: &JobWorkspace,
        cgroup: Option<&JobCgroup>,
        root: &Path,
        cancel: &CancelToken,
    ) -> Result<(SupervisorOutcome, Option<u64>)> {
        let config = ctx.config;
        let rootfs = self.rootfs_plan(root, workspace.path(), config)?;
        let request = self.launch_request(ctx, cgroup, rootfs);
        let bounds = SupervisionBounds {
            deadline: ctx.deadline,
            cpu_limit_usec: ctx.cpu_limit_usec(),
            cpu_cores: config.limits.cpu_cores,
            kill_grace: self.settings.kill_grace(),
        };

        let handle = spawn_proxy(request, cgroup, self.settings.max_output_bytes)?;
        log::info!("Job {} launched as proxy {}", ctx.job_id, handle.pid);

        let gpu_trip = CancelToken::new();
        let watch = match &config.gpu {
            Some(spec) => Some(GpuWatch::start(spec.device_id, spec.memory_mb, gpu_trip.clone())?),
            None => None,
        };
        let outcome = supervise(
            handle,
            cgroup,
            &bounds,
            cancel,
            watch.as_ref().map(|_| &gpu_trip),
        );
        let gpu_peak = watch.map(GpuWatch::finish);
        Ok((outcome, gpu_peak))
    }
}

impl SandboxEngine for LinuxEngine {
    fn preflight(&self, config: &JobConfig) -> Result<()> {
        if self.settings.strict_mode && !nix::unistd::geteuid().is_root() {
            return Err(SandboxError::Privilege(
                "strict mode requires root privileges".to_string(),
            ));
        }
        let validation = config.validate();
        for warning in &validation.warnings {
            log::warn!("Job configuration warning: {}", warning);
        }
        validation.into_result().map_err(SandboxError::Config)?;

        if let Some(spec) = &config.gpu {
            gpu::probe(spec.device_id)?;
        }
        let executable = config.interpreter.template().executable;
        if !Path::new(executable).exists() {
            return Err(SandboxError::Config(format!(
                "interpreter {} is not installed ({} missing)",
                config.interpreter.tag(),
                executable
            )));
        }
        Ok(())
    }

    fn execute(&self, ctx: &ExecutionContext<'_>, cancel: &CancelToken) -> Result<Execution> {
        let config = ctx.config;
        let _lease = match &config.gpu {
            Some(spec) => Some(GpuLease::acquire(&self.gpu_leases, spec.device_id)?),
            None => None,
        };

        let workspace = JobWorkspace::create(
            &self.settings.jobs_root,
            ctx.job_id,
            config.limits.tmpfs_bytes(),
            self.settings.sandbox_uid,
            self.settings.sandbox_gid,
            self.settings.strict_mode,
        )?;
        workspace.stage_inputs(&config.inputs)?;

        let result = self.run(ctx, &workspace, cancel)?;
        log::info!(
            "Job {} finished: exit={:?} signal={:?} violation={:?} cpu={:.3}s wall={:?}",
            ctx.job_id,
            result.exit_code,
            result.signal,
            result.violation,
            result.cpu_seconds,
            result.execution_time
        );
        Ok(Execution {
            result,
            workspace: Some(workspace),
        })
    }
}
