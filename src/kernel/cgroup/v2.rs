/// Cgroup v2 backend: per-job limits, accounting and teardown.
///
/// Memory breach semantics rely on `memory.oom.group=1`: when the kernel OOM
/// killer fires inside a job cgroup it takes every task of the job with it.
use crate::config::job::ResourceLimits;
use crate::config::types::{CgroupEvidence, Result, SandboxError};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// `cpu.max` period; the quota is `cpu_cores` periods per period.
pub const CPU_PERIOD_USEC: u64 = 100_000;
const CONTROLLERS: &[&str] = &["cpu", "memory", "pids"];
const RELEASE_TIMEOUT: Duration = Duration::from_secs(2);
const RELEASE_BACKOFF: Duration = Duration::from_millis(10);

/// Counters from `memory.events`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryEvents {
    pub high: u64,
    pub max: u64,
    pub oom: u64,
    pub oom_kill: u64,
}

pub fn parse_memory_events(content: &str) -> MemoryEvents {
    let mut events = MemoryEvents::default();
    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let value = value.parse::<u64>().unwrap_or(0);
        match key {
            "high" => events.high = value,
            "max" => events.max = value,
            "oom" => events.oom = value,
            "oom_kill" => events.oom_kill = value,
            _ => {}
        }
    }
    events
}

/// `usage_usec` from `cpu.stat`
pub fn parse_cpu_usage_usec(content: &str) -> Option<u64> {
    content.lines().find_map(|line| {
        let rest = line.strip_prefix("usage_usec")?;
        rest.trim().parse().ok()
    })
}

/// A single-value limit file; `max` reads as `None`.
pub fn parse_limit(content: &str) -> Option<u64> {
    let value = content.trim();
    if value == "max" {
        return None;
    }
    value.parse().ok()
}

fn read_u64(path: &Path) -> Result<u64> {
    let content = fs::read_to_string(path)
        .map_err(|e| SandboxError::Cgroup(format!("Failed to read {}: {}", path.display(), e)))?;
    content.trim().parse::<u64>().map_err(|e| {
        SandboxError::Cgroup(format!("Failed to parse {}: {}", path.display(), e))
    })
}

/// Parent cgroup that owns every job cgroup
#[derive(Debug, Clone)]
pub struct CgroupV2 {
    root: PathBuf,
    strict_mode: bool,
}

impl CgroupV2 {
    pub fn new(root: impl Into<PathBuf>, strict_mode: bool) -> Self {
        Self {
            root: root.into(),
            strict_mode,
        }
    }

    /// True when the unified hierarchy is mounted at /sys/fs/cgroup.
    pub fn is_available() -> bool {
        Path::new("/sys/fs/cgroup/cgroup.controllers").exists()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn job_path(&self, job_id: &str) -> PathBuf {
        self.root.join(job_id)
    }

    /// Create the parent cgroup and delegate cpu, memory and pids to its
    /// children.
    pub fn ensure_root(&self) -> Result<()> {
        fs::create_dir_all(&self.root).map_err(|e| {
            SandboxError::Cgroup(format!(
                "Failed to create cgroup root {}: {}",
                self.root.display(),
                e
            ))
        })?;

        if let Some(parent) = self.root.parent() {
            self.enable_controllers(parent)?;
        }
        self.enable_controllers(&self.root)
    }

    fn enable_controllers(&self, dir: &Path) -> Result<()> {
        let control = dir.join("cgroup.subtree_control");
        if !control.exists() {
            return Ok(());
        }
        let enabled = fs::read_to_string(&control).unwrap_or_default();
        for controller in CONTROLLERS {
            if enabled.split_whitespace().any(|c| c == *controller) {
                continue;
            }
            if let Err(e) = fs::write(&control, format!("+{}", controller)) {
                let msg = format!(
                    "Failed to enable {} controller in {}: {}",
                    controller,
                    control.display(),
                    e
                );
                if self.strict_mode {
                    return Err(SandboxError::Cgroup(msg));
                }
                log::warn!("{} (permissive mode)", msg);
            }
        }
        Ok(())
    }

    /// Create the job cgroup and write its limits.
    pub fn create(&self, job_id: &str, limits: &ResourceLimits) -> Result<JobCgroup> {
        let path = self.job_path(job_id);
        fs::create_dir(&path).map_err(|e| {
            SandboxError::Cgroup(format!("Failed to create cgroup {}: {}", path.display(), e))
        })?;

        // From here on the directory is owned by the handle and removed on drop.
        let cgroup = JobCgroup {
            path,
            strict_mode: self.strict_mode,
            released: false,
        };

        let quota = u64::from(limits.cpu_cores) * CPU_PERIOD_USEC;
        cgroup.write_limit("cpu.max", &format!("{} {}", quota, CPU_PERIOD_USEC))?;
        cgroup.write_limit("memory.max", &limits.memory_bytes().to_string())?;
        cgroup.write_limit("pids.max", &limits.max_processes.to_string())?;
        cgroup.write_optional("memory.swap.max", "0")?;
        cgroup.write_optional("memory.oom.group", "1")?;

        log::debug!(
            "created cgroup {} (cpu.max={} {}, memory.max={}, pids.max={})",
            cgroup.path.display(),
            quota,
            CPU_PERIOD_USEC,
            limits.memory_bytes(),
            limits.max_processes
        );
        Ok(cgroup)
    }

    /// Job cgroups currently present under the root.
    pub fn list_children(&self) -> Result<Vec<PathBuf>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut children = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                children.push(entry.path());
            }
        }
        children.sort();
        Ok(children)
    }
}

/// Handle to one job's cgroup. Released exactly once: explicitly via
/// [`JobCgroup::release`] or on drop.
#[derive(Debug)]
pub struct JobCgroup {
    path: PathBuf,
    strict_mode: bool,
    released: bool,
}

impl JobCgroup {
    /// Take ownership of an existing cgroup directory (orphan sweep).
    pub fn adopt(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            strict_mode: false,
            released: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    fn write_limit(&self, file: &str, value: &str) -> Result<()> {
        let target = self.path.join(file);
        if let Err(e) = fs::write(&target, value) {
            let msg = format!("Failed to write {}={}: {}", target.display(), value, e);
            if self.strict_mode {
                return Err(SandboxError::Cgroup(msg));
            }
            log::warn!("{} (permissive mode)", msg);
        }
        Ok(())
    }

    /// Like `write_limit`, but only when the kernel exposes the file.
    fn write_optional(&self, file: &str, value: &str) -> Result<()> {
        if self.path.join(file).exists() {
            self.write_limit(file, value)?;
        }
        Ok(())
    }

    pub fn attach(&self, pid: i32) -> Result<()> {
        let procs = self.path.join("cgroup.procs");
        fs::write(&procs, pid.to_string()).map_err(|e| {
            SandboxError::Cgroup(format!(
                "Failed to attach pid {} to {}: {}",
                pid,
                self.path.display(),
                e
            ))
        })
    }

    pub fn events_path(&self) -> PathBuf {
        self.path.join("memory.events")
    }

    /// Aggregate CPU time of every task, in microseconds.
    pub fn cpu_usage_usec(&self) -> Result<u64> {
        let stat = self.path.join("cpu.stat");
        let content = fs::read_to_string(&stat)
            .map_err(|e| SandboxError::Cgroup(format!("Failed to read cpu.stat: {}", e)))?;
        parse_cpu_usage_usec(&content)
            .ok_or_else(|| SandboxError::Cgroup("cpu.stat has no usage_usec".to_string()))
    }

    /// memory.peak (5.19+), falling back to memory.current.
    pub fn memory_peak(&self) -> Result<u64> {
        let peak = self.path.join("memory.peak");
        if peak.exists() {
            return read_u64(&peak);
        }
        read_u64(&self.path.join("memory.current"))
    }

    pub fn memory_limit(&self) -> Option<u64> {
        fs::read_to_string(self.path.join("memory.max"))
            .ok()
            .and_then(|c| parse_limit(&c))
    }

    pub fn memory_events(&self) -> MemoryEvents {
        fs::read_to_string(self.events_path())
            .map(|c| parse_memory_events(&c))
            .unwrap_or_default()
    }

    pub fn oom_killed(&self) -> bool {
        self.memory_events().oom_kill > 0
    }

    pub fn procs(&self) -> Vec<i32> {
        fs::read_to_string(self.path.join("cgroup.procs"))
            .map(|c| c.lines().filter_map(|l| l.trim().parse().ok()).collect())
            .unwrap_or_default()
    }

    /// SIGKILL every task in the cgroup. Uses `cgroup.kill` (5.14+) and
    /// falls back to signalling each listed pid.
    pub fn kill_all(&self) -> Result<()> {
        let kill_file = self.path.join("cgroup.kill");
        if kill_file.exists() && fs::write(&kill_file, "1").is_ok() {
            return Ok(());
        }
        for pid in self.procs() {
            // SAFETY: plain kill(2); ESRCH for already-exited tasks is fine.
            unsafe {
                libc::kill(pid, libc::SIGKILL);
            }
        }
        Ok(())
    }

    pub fn evidence(&self) -> CgroupEvidence {
        let events = self.memory_events();
        CgroupEvidence {
            memory_peak: self.memory_peak().ok(),
            memory_limit: self.memory_limit(),
            oom_events: events.oom,
            oom_kill_events: events.oom_kill,
            cpu_usage_usec: self.cpu_usage_usec().ok(),
            process_count: Some(self.procs().len() as u32),
        }
    }

    /// Kill whatever is left and remove the directory. Idempotent.
    pub fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        if !self.path.exists() {
            self.released = true;
            return Ok(());
        }

        self.kill_all()?;
        let started = Instant::now();
        loop {
            match fs::remove_dir(&self.path) {
                Ok(()) => break,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => break,
                // Killed tasks leave the cgroup asynchronously.
                Err(e) if started.elapsed() < RELEASE_TIMEOUT => {
                    log::debug!("cgroup {} busy ({}), retrying", self.path.display(), e);
                    self.kill_all()?;
                    std::thread::sleep(RELEASE_BACKOFF);
                }
                Err(e) => {
                    return Err(SandboxError::Cgroup(format!(
                        "Failed to remove cgroup {}: {}",
                        self.path.display(),
                        e
                    )))
                }
            }
        }
        self.released = true;
        log::debug!("released cgroup {}", self.path.display());
        Ok(())
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

impl Drop for JobCgroup {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::warn!("cgroup cleanup on drop failed: {}", e);
        }
    }
}
