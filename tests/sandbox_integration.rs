//! End-to-end sandbox tests.
//!
//! The launch tests need root and a writable cgroup v2 hierarchy; they
//! return early otherwise so the suite stays green on developer machines.

use sandrun::config::settings::SandboxSettings;
use sandrun::core::engine::{ExecutionContext, LinuxEngine, SandboxEngine};
use sandrun::core::CancelToken;
use sandrun::kernel::cgroup::CgroupV2;
use sandrun::kernel::seccomp::{allowed_syscalls, SyscallFilter};
use sandrun::{
    Interpreter, JobConfig, OutputIntegrity, ResourceLimits, SandboxError, SecurityLevel,
    Violation,
};
use std::time::{Duration, Instant};

fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

fn settings(base: &std::path::Path) -> SandboxSettings {
    SandboxSettings {
        cgroup_root: format!("/sys/fs/cgroup/sandrun-test-{}", std::process::id()).into(),
        jobs_root: base.join("jobs"),
        runtime_root: base.join("roots"),
        max_output_bytes: 4096,
        ..SandboxSettings::default()
    }
}

/// A strict engine, or `None` when this host cannot run one.
fn privileged_engine(base: &std::path::Path) -> Option<LinuxEngine> {
    if !is_root() || !CgroupV2::is_available() {
        eprintln!("skipping: needs root and cgroup v2");
        return None;
    }
    match LinuxEngine::new(settings(base)) {
        Ok(engine) => Some(engine),
        Err(e) => {
            eprintln!("skipping: engine unavailable: {}", e);
            None
        }
    }
}

fn sh_job(script: &str) -> JobConfig {
    JobConfig::new(Interpreter::Sh, "run.sh").with_input("run.sh", script)
}

fn execute(engine: &LinuxEngine, id: &str, config: &JobConfig) -> sandrun::core::Execution {
    engine.preflight(config).unwrap();
    let ctx = ExecutionContext {
        job_id: id,
        config,
        deadline: Instant::now() + Duration::from_secs(config.limits.wall_seconds),
        cpu_seconds: config.limits.cpu_seconds as f64,
    };
    engine.execute(&ctx, &CancelToken::new()).unwrap()
}

#[test]
fn strict_preflight_refuses_without_root() {
    if is_root() {
        return;
    }
    let base = tempfile::tempdir().unwrap();
    let mut s = settings(base.path());
    s.cgroup_root = base.path().join("cgroup");
    s.strict_mode = false;
    let engine = LinuxEngine::new(s.clone()).unwrap();
    drop(engine);

    s.strict_mode = true;
    // Strict construction may fail on the cgroup root; if it does not,
    // preflight must.
    if let Ok(engine) = LinuxEngine::new(s) {
        let err = engine.preflight(&sh_job("true")).unwrap_err();
        assert!(matches!(err, SandboxError::Privilege(_)));
    }
}

#[test]
fn every_security_level_has_a_filter() {
    for level in [SecurityLevel::Standard, SecurityLevel::Paranoid, SecurityLevel::GpuSecure] {
        assert!(!allowed_syscalls(level).is_empty());
        let path = std::ffi::CString::new("/bin/sh").unwrap();
        SyscallFilter::build(level, &path).unwrap();
    }
    let standard = allowed_syscalls(SecurityLevel::Standard).len();
    let paranoid = allowed_syscalls(SecurityLevel::Paranoid).len();
    assert!(paranoid < standard);
}

#[test]
fn hello_world_completes_with_outputs() {
    let base = tempfile::tempdir().unwrap();
    let Some(engine) = privileged_engine(base.path()) else { return };

    let config = sh_job("echo hello\necho data > out.txt\n");
    let execution = execute(&engine, "it-hello", &config);
    let result = &execution.result;
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.stdout, "hello\n");
    assert_eq!(result.stdout_integrity, OutputIntegrity::Complete);
    assert!(result.violation.is_none());
    assert!(result.output_files.iter().any(|f| f.path == "out.txt"));

    let workspace = execution.workspace.unwrap();
    assert!(workspace.is_tmpfs());
}

#[test]
fn wall_deadline_kills_the_job() {
    let base = tempfile::tempdir().unwrap();
    let Some(engine) = privileged_engine(base.path()) else { return };

    let config = sh_job("while :; do sleep 1; done\n").with_limits(ResourceLimits {
        wall_seconds: 1,
        ..ResourceLimits::default()
    });
    let started = Instant::now();
    let execution = execute(&engine, "it-wall", &config);
    assert_eq!(execution.result.violation, Some(Violation::WallTimeout));
    assert!(execution.result.timeout_occurred);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn memory_ceiling_is_a_memory_violation() {
    let base = tempfile::tempdir().unwrap();
    let Some(engine) = privileged_engine(base.path()) else { return };

    let config = sh_job("x=a; while :; do x=\"$x$x\"; done\n").with_limits(ResourceLimits {
        memory_mb: 32,
        wall_seconds: 20,
        ..ResourceLimits::default()
    });
    let execution = execute(&engine, "it-oom", &config);
    assert_eq!(execution.result.violation, Some(Violation::MemoryLimit));
}

#[test]
fn stdout_is_capped_with_a_marker() {
    let base = tempfile::tempdir().unwrap();
    let Some(engine) = privileged_engine(base.path()) else { return };

    let config = sh_job("i=0; while [ $i -lt 2000 ]; do echo 0123456789; i=$((i+1)); done\n");
    let execution = execute(&engine, "it-cap", &config);
    let result = &execution.result;
    assert_eq!(result.stdout_integrity, OutputIntegrity::TruncatedByLimit);
    assert!(result.stdout.ends_with("\n[output truncated at 4096 bytes]"));
}

#[test]
fn network_is_unreachable_inside_the_sandbox() {
    let base = tempfile::tempdir().unwrap();
    let Some(engine) = privileged_engine(base.path()) else { return };

    // Only loopback exists in a fresh network namespace.
    let config = sh_job("ls /sys/class/net\n");
    let execution = execute(&engine, "it-net", &config);
    let ifaces: Vec<&str> = execution.result.stdout.split_whitespace().collect();
    assert!(ifaces.iter().all(|i| *i == "lo"), "unexpected interfaces: {:?}", ifaces);
}

#[test]
fn cancellation_stops_a_running_job() {
    let base = tempfile::tempdir().unwrap();
    let Some(engine) = privileged_engine(base.path()) else { return };

    let config = sh_job("sleep 30\n");
    engine.preflight(&config).unwrap();
    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    let canceller = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(300));
        trigger.cancel();
    });
    let ctx = ExecutionContext {
        job_id: "it-cancel",
        config: &config,
        deadline: Instant::now() + Duration::from_secs(60),
        cpu_seconds: 10.0,
    };
    let started = Instant::now();
    let execution = engine.execute(&ctx, &cancel).unwrap();
    canceller.join().unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_ne!(execution.result.exit_code, Some(0));
}

#[test]
fn socket_creation_is_a_blocked_syscall() {
    let base = tempfile::tempdir().unwrap();
    let Some(engine) = privileged_engine(base.path()) else { return };
    if !std::path::Path::new("/usr/bin/python3").exists() {
        eprintln!("skipping: python3 not installed");
        return;
    }

    let config = JobConfig::new(Interpreter::Python3, "net.py")
        .with_input("net.py", "import socket\nsocket.socket(socket.AF_INET, socket.SOCK_STREAM)\n");
    let execution = execute(&engine, "it-socket", &config);
    assert_eq!(execution.result.violation, Some(Violation::BlockedSyscall));
    assert_eq!(execution.result.exit_code, None);
}

#[test]
fn paranoid_payload_cannot_exec_again() {
    let base = tempfile::tempdir().unwrap();
    let Some(engine) = privileged_engine(base.path()) else { return };

    // `exec` replaces the shell without forking, so only the pinned
    // execve rule stands between it and /bin/true.
    let mut config = sh_job("exec /bin/true\n");
    config.security = SecurityLevel::Paranoid;
    let execution = execute(&engine, "it-paranoid-exec", &config);
    assert_eq!(execution.result.violation, Some(Violation::BlockedSyscall));
}
