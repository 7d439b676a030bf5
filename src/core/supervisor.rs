//! Host side of a launch: clone the proxy, attach it to the job cgroup,
//! release it, and wait for whichever comes first: exit, deadline, CPU
//! ceiling, memory event or cancellation.
//!
//! Waiting is event driven: poll() on a pidfd for the proxy, an inotify
//! watch on `memory.events` and the cancel eventfd. When pidfd_open is
//! unavailable the loop falls back to a coarse waitpid poll.

use crate::config::types::{Result, SandboxError};
use crate::core::cancel::CancelToken;
use crate::core::proxy::{cloexec_pipe, read_json, run_proxy_main, write_json, ProxyFds};
use crate::core::types::{LaunchRequest, ProxyStatus, StopReason, SupervisorOutcome};
use crate::kernel::cgroup::JobCgroup;
use crate::utils::output::{spawn_reader, CapturedStream};
use crossbeam_channel::{bounded, Receiver};
use nix::errno::Errno;
use nix::sched::clone;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::ffi::CString;
use std::fs::File;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::time::{Duration, Instant};

const PROXY_STACK_BYTES: usize = 2 * 1024 * 1024;
const FALLBACK_POLL: Duration = Duration::from_millis(50);
const MIN_CPU_CHECK: Duration = Duration::from_millis(10);
/// Extra time granted to output readers after the proxy is gone
const READER_GRACE: Duration = Duration::from_secs(2);

/// Limits enforced while the job runs
#[derive(Debug, Clone)]
pub struct SupervisionBounds {
    pub deadline: Instant,
    pub cpu_limit_usec: u64,
    pub cpu_cores: u32,
    pub kill_grace: Duration,
}

impl SupervisionBounds {
    /// Earliest moment the CPU ceiling could be reached given current usage.
    pub fn next_cpu_check(&self, used_usec: u64) -> Option<Duration> {
        if used_usec >= self.cpu_limit_usec {
            return None;
        }
        let remaining = self.cpu_limit_usec - used_usec;
        let wall = Duration::from_micros(remaining / u64::from(self.cpu_cores.max(1)));
        Some(wall.max(MIN_CPU_CHECK))
    }
}

/// A launched proxy and its output channels
pub struct ProxyHandle {
    pub pid: Pid,
    pidfd: Option<OwnedFd>,
    status_rx: Receiver<Option<ProxyStatus>>,
    stdout_rx: Receiver<CapturedStream>,
    stderr_rx: Receiver<CapturedStream>,
    started: Instant,
}

fn pidfd_open(pid: Pid) -> Option<OwnedFd> {
    // SAFETY: pidfd_open returns a new descriptor or -1.
    let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid.as_raw(), 0) };
    if fd < 0 {
        return None;
    }
    // SAFETY: fresh descriptor owned by nothing else.
    Some(unsafe { OwnedFd::from_raw_fd(fd as RawFd) })
}

fn inotify_watch(path: &Path) -> Option<OwnedFd> {
    // SAFETY: returns a new descriptor or -1.
    let fd = unsafe { libc::inotify_init1(libc::IN_NONBLOCK | libc::IN_CLOEXEC) };
    if fd < 0 {
        return None;
    }
    // SAFETY: fresh descriptor owned by nothing else.
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };
    let cpath = CString::new(path.as_os_str().as_bytes()).ok()?;
    // SAFETY: cpath is a valid NUL-terminated string for the call's duration.
    let wd = unsafe { libc::inotify_add_watch(fd, cpath.as_ptr(), libc::IN_MODIFY) };
    if wd < 0 {
        return None;
    }
    Some(owned)
}

fn drain(fd: RawFd) {
    let mut buf = [0u8; 4096];
    // SAFETY: reads into a stack buffer of the stated size; fd is non-blocking.
    while unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) } > 0 {}
}

/// Block until one of `fds` is readable or `timeout` passes.
/// Returns the readable descriptors.
fn poll_readable(fds: &[RawFd], timeout: Duration) -> Vec<RawFd> {
    let mut pollfds: Vec<libc::pollfd> = fds
        .iter()
        .map(|&fd| libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();
    let millis = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
    // SAFETY: pollfds is a live, correctly sized array.
    let rc = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, millis) };
    if rc <= 0 {
        return Vec::new();
    }
    pollfds
        .iter()
        .filter(|p| p.revents != 0)
        .map(|p| p.fd)
        .collect()
}

/// Clone the proxy into fresh namespaces and hand it the launch request.
pub fn spawn_proxy(
    mut request: LaunchRequest,
    cgroup: Option<&JobCgroup>,
    max_output_bytes: usize,
) -> Result<ProxyHandle> {
    let (launch_read, launch_write) = cloexec_pipe()?;
    let (status_read, status_write) = cloexec_pipe()?;
    let (stdout_read, stdout_write) = cloexec_pipe()?;
    let (stderr_read, stderr_write) = cloexec_pipe()?;

    request.hygiene.stdout_fd = stdout_write.as_raw_fd();
    request.hygiene.stderr_fd = stderr_write.as_raw_fd();
    let fds = ProxyFds {
        launch_read: launch_read.as_raw_fd(),
        launch_write: launch_write.as_raw_fd(),
        status_read: status_read.as_raw_fd(),
        status_write: status_write.as_raw_fd(),
        stdout_read: stdout_read.as_raw_fd(),
        stderr_read: stderr_read.as_raw_fd(),
    };

    let mut stack = vec![0u8; PROXY_STACK_BYTES];
    let callback: Box<dyn FnMut() -> isize> = Box::new(move || -> isize { run_proxy_main(fds) });
    let flags = request.namespaces.clone_flags();
    // SAFETY: the child gets a private copy of the address space and only
    // runs run_proxy_main, which never returns.
    let pid = unsafe { clone(callback, &mut stack, flags, Some(libc::SIGCHLD)) }.map_err(
        |e| match e {
            Errno::EPERM => SandboxError::Privilege(
                "clone with namespace flags requires root (CAP_SYS_ADMIN)".to_string(),
            ),
            e => SandboxError::Process(format!("clone(proxy) failed: {}", e)),
        },
    )?;
    log::debug!("Cloned proxy {} for job {} with {:?}", pid, request.job_id, flags);

    drop(launch_read);
    drop(status_write);
    drop(stdout_write);
    drop(stderr_write);

    if let Some(cgroup) = cgroup {
        if let Err(e) = cgroup.attach(pid.as_raw()) {
            let _ = kill(pid, Signal::SIGKILL);
            let _ = waitpid(pid, None);
            return Err(e);
        }
    }

    let pidfd = pidfd_open(pid);
    if pidfd.is_none() {
        log::warn!("pidfd_open unavailable; supervising proxy {} by polling", pid);
    }

    let stdout_rx = spawn_reader("stdout", File::from(stdout_read), max_output_bytes)?;
    let stderr_rx = spawn_reader("stderr", File::from(stderr_read), max_output_bytes)?;
    let (status_tx, status_rx) = bounded(1);
    std::thread::Builder::new()
        .name("proxy-status".to_string())
        .spawn(move || {
            let status = read_json::<ProxyStatus>(status_read).unwrap_or_else(|e| {
                log::warn!("Unreadable proxy status: {}", e);
                None
            });
            let _ = status_tx.send(status);
        })?;

    // Releasing the proxy: it blocks on this request until now.
    if let Err(e) = write_json(launch_write, &request) {
        log::warn!("Failed to send launch request to proxy {}: {}", pid, e);
    }

    Ok(ProxyHandle {
        pid,
        pidfd,
        status_rx,
        stdout_rx,
        stderr_rx,
        started: Instant::now(),
    })
}

fn exit_parts(status: WaitStatus) -> (Option<i32>, Option<i32>) {
    match status {
        WaitStatus::Exited(_, code) => (Some(code), None),
        WaitStatus::Signaled(_, sig, _) => (None, Some(sig as i32)),
        _ => (None, None),
    }
}

fn reap_now(pid: Pid) -> Option<WaitStatus> {
    match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
        Ok(status @ WaitStatus::Exited(..)) | Ok(status @ WaitStatus::Signaled(..)) => {
            Some(status)
        }
        // Already reaped elsewhere; nothing left to wait for
        Err(Errno::ECHILD) => Some(WaitStatus::Exited(pid, -1)),
        _ => None,
    }
}

fn wait_exit(pid: Pid, pidfd: Option<RawFd>, timeout: Duration) -> Option<WaitStatus> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = reap_now(pid) {
            return Some(status);
        }
        let now = Instant::now();
        if now >= deadline {
            return None;
        }
        match pidfd {
            Some(fd) => {
                poll_readable(&[fd], deadline - now);
            }
            None => std::thread::sleep(FALLBACK_POLL.min(deadline - now)),
        }
    }
}

/// Kill the whole job: every task in the cgroup, then the proxy itself.
fn terminate(pid: Pid, pidfd: Option<RawFd>, cgroup: Option<&JobCgroup>, grace: Duration) -> WaitStatus {
    if let Some(cgroup) = cgroup {
        if let Err(e) = cgroup.kill_all() {
            log::warn!("cgroup kill failed for {}: {}", cgroup.name(), e);
        }
    }
    let _ = kill(pid, Signal::SIGKILL);
    if let Some(status) = wait_exit(pid, pidfd, grace) {
        return status;
    }

    log::warn!("Proxy {} still alive {:?} after SIGKILL; retrying", pid, grace);
    let _ = kill(pid, Signal::SIGKILL);
    loop {
        match waitpid(pid, None) {
            Ok(status @ WaitStatus::Exited(..)) | Ok(status @ WaitStatus::Signaled(..)) => {
                return status
            }
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(_) => return WaitStatus::Exited(pid, -1),
        }
    }
}

fn stop_reason(
    bounds: &SupervisionBounds,
    cgroup: Option<&JobCgroup>,
    cancel: &CancelToken,
    gpu_trip: Option<&CancelToken>,
) -> (Option<StopReason>, Duration) {
    if cancel.is_cancelled() {
        return (Some(StopReason::Cancelled), Duration::ZERO);
    }
    if gpu_trip.map_or(false, CancelToken::is_cancelled) {
        return (Some(StopReason::GpuMemoryLimit), Duration::ZERO);
    }
    let now = Instant::now();
    if now >= bounds.deadline {
        return (Some(StopReason::Deadline), Duration::ZERO);
    }
    let mut timeout = bounds.deadline - now;

    if let Some(cgroup) = cgroup {
        if cgroup.memory_events().oom_kill > 0 {
            return (Some(StopReason::MemoryLimit), Duration::ZERO);
        }
        if let Ok(used) = cgroup.cpu_usage_usec() {
            match bounds.next_cpu_check(used) {
                None => return (Some(StopReason::CpuLimit), Duration::ZERO),
                Some(next) => timeout = timeout.min(next),
            }
        }
    }
    (None, timeout)
}

/// Wait for the proxy and collect everything it produced.
pub fn supervise(
    handle: ProxyHandle,
    cgroup: Option<&JobCgroup>,
    bounds: &SupervisionBounds,
    cancel: &CancelToken,
    gpu_trip: Option<&CancelToken>,
) -> SupervisorOutcome {
    let pid = handle.pid;
    let pidfd = handle.pidfd.as_ref().map(AsRawFd::as_raw_fd);
    let memory_watch = cgroup.and_then(|c| inotify_watch(&c.events_path()));
    let watch_fd = memory_watch.as_ref().map(AsRawFd::as_raw_fd);

    let mut wake: Vec<RawFd> = Vec::with_capacity(4);
    wake.extend(pidfd);
    wake.extend(watch_fd);
    wake.extend(cancel.wake_fd());
    wake.extend(gpu_trip.and_then(CancelToken::wake_fd));

    let mut stop = None;
    let exit = loop {
        if let Some(status) = reap_now(pid) {
            break status;
        }
        let (reason, mut timeout) = stop_reason(bounds, cgroup, cancel, gpu_trip);
        if let Some(reason) = reason {
            log::info!("Stopping proxy {}: {:?}", pid, reason);
            stop = Some(reason);
            break terminate(pid, pidfd, cgroup, bounds.kill_grace);
        }
        if pidfd.is_none() {
            timeout = timeout.min(FALLBACK_POLL);
        }
        for fd in poll_readable(&wake, timeout) {
            if Some(fd) == watch_fd {
                drain(fd);
            }
        }
    };
    let wall_time = handle.started.elapsed();
    let (proxy_exit_code, proxy_signal) = exit_parts(exit);
    log::debug!(
        "Proxy {} finished: exit={:?} signal={:?} after {:?}",
        pid,
        proxy_exit_code,
        proxy_signal,
        wall_time
    );

    let collect = bounds.kill_grace + READER_GRACE;
    let stdout = handle.stdout_rx.recv_timeout(collect).unwrap_or_else(|_| {
        log::warn!("stdout reader for proxy {} did not finish", pid);
        CapturedStream {
            integrity: crate::config::types::OutputIntegrity::ReadError,
            ..CapturedStream::default()
        }
    });
    let stderr = handle.stderr_rx.recv_timeout(collect).unwrap_or_else(|_| {
        log::warn!("stderr reader for proxy {} did not finish", pid);
        CapturedStream {
            integrity: crate::config::types::OutputIntegrity::ReadError,
            ..CapturedStream::default()
        }
    });
    let proxy_status = handle.status_rx.recv_timeout(collect).ok().flatten();

    SupervisorOutcome {
        proxy_status,
        proxy_exit_code,
        proxy_signal,
        stop,
        wall_time,
        stdout,
        stderr,
    }
}
