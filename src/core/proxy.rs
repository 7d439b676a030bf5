//! The sandbox proxy: PID 1 of the job's PID namespace.
//!
//! The proxy waits for its launch request, builds the private root, forks
//! the payload, reaps everything and reports back over the status pipe. It
//! runs between clone and exit, so it never logs.

use crate::config::types::{Result, SandboxError};
use crate::core::types::{LaunchRequest, ProxyStatus};
use crate::exec::preexec::{FreshChild, PayloadHygiene, RootReady, Sandbox};
use crate::kernel::seccomp::SyscallFilter;
use crate::utils::env_hygiene::to_argv;
use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::ffi::CString;
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

const REPORT_MISSING: &str = "missing:";
const REPORT_ERROR: &str = "error:";

fn to_process_error(prefix: &str, err: impl std::fmt::Display) -> SandboxError {
    SandboxError::Process(format!("{prefix}: {err}"))
}

/// pipe2(O_CLOEXEC) as owned descriptors (read end, write end).
pub fn cloexec_pipe() -> Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as RawFd; 2];
    // SAFETY: pipe2 fills exactly two descriptors on success.
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
        return Err(to_process_error("pipe2", std::io::Error::last_os_error()));
    }
    // SAFETY: both descriptors are fresh and owned by nothing else.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// Read one JSON value up to EOF; `None` when the writer closed without data.
pub fn read_json<T: DeserializeOwned>(fd: OwnedFd) -> Result<Option<T>> {
    let mut data = Vec::new();
    File::from(fd).read_to_end(&mut data)?;
    if data.is_empty() {
        return Ok(None);
    }
    serde_json::from_slice(&data)
        .map(Some)
        .map_err(|e| to_process_error("failed to decode json", e))
}

pub fn write_json<T: Serialize>(fd: OwnedFd, value: &T) -> Result<()> {
    let payload =
        serde_json::to_vec(value).map_err(|e| to_process_error("failed to encode json", e))?;
    let mut file = File::from(fd);
    file.write_all(&payload)?;
    file.flush()?;
    Ok(())
}

/// Descriptor numbers inherited by the cloned proxy
#[derive(Debug, Clone, Copy)]
pub struct ProxyFds {
    pub launch_read: RawFd,
    pub launch_write: RawFd,
    pub status_read: RawFd,
    pub status_write: RawFd,
    pub stdout_read: RawFd,
    pub stderr_read: RawFd,
}

/// Entry point of the cloned proxy.
pub fn run_proxy_main(fds: ProxyFds) -> ! {
    // Host-side ends; holding launch_write would keep the request read from
    // ever seeing EOF.
    for fd in [fds.launch_write, fds.status_read, fds.stdout_read, fds.stderr_read] {
        let _ = nix::unistd::close(fd);
    }
    // SAFETY: the host handed these descriptors to this process alone.
    let (launch, status_out) = unsafe {
        (
            OwnedFd::from_raw_fd(fds.launch_read),
            OwnedFd::from_raw_fd(fds.status_write),
        )
    };

    let status = match read_json::<LaunchRequest>(launch) {
        Ok(Some(request)) => run_proxy(&request).unwrap_or_else(|e| ProxyStatus {
            setup_error: Some(e.to_string()),
            ..ProxyStatus::default()
        }),
        // Host aborted the launch before sending a request
        Ok(None) => std::process::exit(126),
        Err(e) => ProxyStatus {
            setup_error: Some(e.to_string()),
            ..ProxyStatus::default()
        },
    };

    let _ = write_json(status_out, &status);
    std::process::exit(if status.setup_error.is_some() { 126 } else { 0 });
}

fn run_proxy(request: &LaunchRequest) -> Result<ProxyStatus> {
    let sandbox = Sandbox::<FreshChild>::new(request.job_id.as_str(), request.strict_mode)
        .setup_namespaces(&request.namespaces)?
        .harden_mount_propagation()?
        .confirm_cgroup(&request.cgroup_name)?
        .build_root(&request.rootfs)?;

    let argv = to_argv(&request.argv)?;
    let program = argv
        .first()
        .ok_or_else(|| SandboxError::Config("Empty command for exec".to_string()))?;
    // The payload execs `program` from this same buffer after fork.
    let filter = SyscallFilter::build(request.security, program)?;
    let envp = request
        .env
        .iter()
        .map(|(k, v)| CString::new(format!("{k}={v}")))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| SandboxError::Config("environment contains NUL byte".to_string()))?;

    let (report_read, report_write) = cloexec_pipe()?;
    let mut hygiene = request.hygiene.clone();
    hygiene.keep_fds.push(report_write.as_raw_fd());

    let mut status = ProxyStatus {
        missing_controls: sandbox
            .missing_controls()
            .iter()
            .map(|c| c.to_string())
            .collect(),
        ..ProxyStatus::default()
    };

    // SAFETY: the proxy is single-threaded; the child only runs the
    // pre-exec chain and then execs or _exits.
    match unsafe { fork() }.map_err(|e| to_process_error("fork(payload)", e))? {
        ForkResult::Child => {
            drop(report_read);
            let mut report = File::from(report_write);
            let err = launch_payload(sandbox, request, &hygiene, &filter, &argv, &envp, &mut report);
            let _ = writeln!(report, "{REPORT_ERROR}{err}");
            // SAFETY: _exit skips atexit handlers inherited from the proxy.
            unsafe { libc::_exit(127) }
        }
        ForkResult::Parent { child } => {
            drop(report_write);
            let _ = nix::unistd::close(request.hygiene.stdout_fd);
            let _ = nix::unistd::close(request.hygiene.stderr_fd);
            status.payload_pid = Some(child.as_raw());

            // EOF arrives at exec (CLOEXEC) or when the payload exits.
            let mut report = String::new();
            let _ = File::from(report_read).read_to_string(&mut report);
            apply_payload_report(&mut status, &report);

            let (exit_code, term_signal, reaped) = wait_for_payload_and_reap(child)?;
            status.exit_code = exit_code;
            status.term_signal = term_signal;
            status.reaped_descendants = reaped;
        }
    }
    Ok(status)
}

/// Runs in the forked payload. Returns only on failure.
fn launch_payload(
    sandbox: Sandbox<RootReady>,
    request: &LaunchRequest,
    hygiene: &PayloadHygiene,
    filter: &SyscallFilter,
    argv: &[CString],
    envp: &[CString],
    report: &mut File,
) -> SandboxError {
    let ready = sandbox
        .apply_runtime_hygiene(hygiene)
        .and_then(|s| s.drop_credentials(request.uid, request.gid))
        .and_then(|s| s.lock_privileges())
        .and_then(|s| s.install_filter(filter));
    let ready = match ready {
        Ok(ready) => ready,
        Err(e) => return e,
    };
    for control in ready.missing_controls() {
        let _ = writeln!(report, "{REPORT_MISSING}{control}");
    }
    match ready.exec(argv, envp) {
        Ok(never) => match never {},
        Err(e) => e,
    }
}

/// Fold the payload's pre-exec report into the status.
pub fn apply_payload_report(status: &mut ProxyStatus, report: &str) {
    for line in report.lines() {
        if let Some(control) = line.strip_prefix(REPORT_MISSING) {
            if !status.missing_controls.iter().any(|c| c == control) {
                status.missing_controls.push(control.to_string());
            }
        } else if let Some(err) = line.strip_prefix(REPORT_ERROR) {
            status.setup_error = Some(err.to_string());
        }
    }
}

fn wait_for_payload_and_reap(payload_pid: Pid) -> Result<(Option<i32>, Option<i32>, u32)> {
    let (exit_code, term_signal) = loop {
        match waitpid(payload_pid, None) {
            Ok(WaitStatus::Exited(_, code)) => break (Some(code), None),
            Ok(WaitStatus::Signaled(_, sig, _)) => break (None, Some(sig as i32)),
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(e) => return Err(to_process_error("waitpid(payload)", e)),
        }
    };

    // Descendants that already exited; live ones die with the namespace
    // when PID 1 exits.
    let mut reaped = 0;
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(Errno::ECHILD) => break,
            Ok(_) => reaped += 1,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(to_process_error("waitpid(reap)", e)),
        }
    }
    Ok((exit_code, term_signal, reaped))
}
