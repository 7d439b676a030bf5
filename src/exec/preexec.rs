/// Locked pre-exec ordering for the sandbox child.
///
/// The setup sequence is fixed:
/// 1. setsid() and PR_SET_PDEATHSIG
/// 2. namespace configuration (hostname, PID 1 check)
/// 3. mount propagation hardening: / becomes MS_PRIVATE | MS_REC
/// 4. cgroup membership check
/// 5. private root and pivot_root
/// 6. rlimits, umask, FD closure, stdio and working directory
/// 7. drop bounding/ambient capabilities, then setresgid and setresuid
/// 8. clear remaining capabilities and set PR_SET_NO_NEW_PRIVS
/// 9. load the seccomp programs
/// 10. exec the interpreter
///
/// Steps 1-5 run in the proxy (PID 1), steps 6-10 in the forked payload.
/// Everything here runs after clone, so nothing logs; permissive-mode
/// fallbacks are recorded on the sandbox and reported back to the host.
use crate::config::job::{ResourceLimits, MIB};
use crate::config::types::{Result, SandboxError};
use crate::kernel::capabilities::{
    check_no_new_privs, clear_process_capabilities, drop_bounding_and_ambient, set_no_new_privs,
};
use crate::kernel::credentials::transition_to_unprivileged;
use crate::kernel::mount::{RootfsPlan, SANDBOX_WORKDIR};
use crate::kernel::namespace::{self, NamespaceSet};
use crate::kernel::seccomp::SyscallFilter;
use crate::utils::env_hygiene::PAYLOAD_UMASK;
use crate::utils::fd_closure::close_inherited_fds;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::ffi::CString;
use std::marker::PhantomData;
use std::os::unix::io::{AsRawFd, RawFd};

/// Rlimits and descriptors applied to the payload before it drops privileges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadHygiene {
    pub cpu_seconds: u64,
    pub max_open_files: u64,
    pub max_file_bytes: u64,
    /// Host-created pipe ends that become stdout and stderr
    pub stdout_fd: RawFd,
    pub stderr_fd: RawFd,
    /// Descriptors that survive FD closure besides stdio
    pub keep_fds: Vec<RawFd>,
}

impl PayloadHygiene {
    pub fn new(limits: &ResourceLimits, stdout_fd: RawFd, stderr_fd: RawFd) -> Self {
        Self {
            cpu_seconds: limits.cpu_seconds,
            max_open_files: limits.max_open_files,
            max_file_bytes: limits.max_file_mb * MIB,
            stdout_fd,
            stderr_fd,
            keep_fds: Vec::new(),
        }
    }
}

fn apply_rlimit(resource: libc::__rlimit_resource_t, soft: u64, hard: u64) -> Result<()> {
    let limit = libc::rlimit {
        rlim_cur: soft as libc::rlim_t,
        rlim_max: hard as libc::rlim_t,
    };
    // SAFETY: setrlimit reads a fully initialised rlimit struct.
    if unsafe { libc::setrlimit(resource, &limit) } != 0 {
        return Err(SandboxError::Process(format!(
            "setrlimit({}) failed: {}",
            resource,
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// Kill this process if the parent dies.
pub fn setup_parent_death_signal() -> Result<()> {
    use nix::sys::prctl;
    use nix::sys::signal::Signal;

    prctl::set_pdeathsig(Signal::SIGKILL)
        .map_err(|e| SandboxError::Process(format!("Failed to set parent death signal: {}", e)))
}

/// Cgroup v2 path of the calling process from `/proc/self/cgroup` content.
pub fn unified_cgroup_path(content: &str) -> Option<&str> {
    content.lines().find_map(|line| line.strip_prefix("0::"))
}

/// Type-state marker: fresh clone, no setup done yet
pub struct FreshChild;

/// Type-state marker: namespaces configured
pub struct NamespacesReady;

/// Type-state marker: mount propagation hardened
pub struct MountsPrivate;

/// Type-state marker: membership in the job cgroup confirmed
pub struct CgroupAttached;

/// Type-state marker: private root in place
pub struct RootReady;

/// Type-state marker: running as the sandbox user
pub struct CredsDropped;

/// Type-state marker: capabilities cleared and no_new_privs set
pub struct PrivsLocked;

/// Type-state marker: seccomp loaded, ready for exec
pub struct ExecReady;

/// Sandbox child with type-state tracking.
///
/// Each step consumes the prior state and returns exactly one next state on
/// success. Only `Sandbox<ExecReady>` can exec the payload:
///
/// ```compile_fail
/// use sandrun::exec::preexec::{FreshChild, Sandbox};
/// use std::ffi::CString;
///
/// let sandbox = Sandbox::<FreshChild>::new("job", true);
/// let argv: Vec<CString> = Vec::new();
/// sandbox.exec(&argv, &argv);
/// ```
///
/// Privileges cannot be locked before credentials are dropped:
///
/// ```compile_fail
/// use sandrun::exec::preexec::{RootReady, Sandbox};
///
/// fn skip_credentials(sandbox: Sandbox<RootReady>) {
///     let _ = sandbox.lock_privileges();
/// }
/// ```
///
/// and a consumed state cannot be reused:
///
/// ```compile_fail
/// use sandrun::exec::preexec::{FreshChild, Sandbox};
/// use sandrun::kernel::namespace::NamespaceSet;
///
/// let sandbox = Sandbox::<FreshChild>::new("job", true);
/// let _ = sandbox.setup_namespaces(&NamespaceSet::default());
/// let _ = sandbox.setup_namespaces(&NamespaceSet::default());
/// ```
///
/// The full payload chain, in order:
///
/// ```no_run
/// use sandrun::exec::preexec::{PayloadHygiene, RootReady, Sandbox};
/// use sandrun::kernel::seccomp::SyscallFilter;
/// use std::ffi::CString;
///
/// fn launch(
///     sandbox: Sandbox<RootReady>,
///     hygiene: &PayloadHygiene,
///     filter: &SyscallFilter,
///     argv: &[CString],
///     envp: &[CString],
/// ) -> sandrun::config::types::Result<()> {
///     let ready = sandbox
///         .apply_runtime_hygiene(hygiene)?
///         .drop_credentials(65534, 65534)?
///         .lock_privileges()?
///         .install_filter(filter)?;
///     ready.exec(argv, envp)?;
///     Ok(())
/// }
/// ```
pub struct Sandbox<S> {
    pub job_id: String,
    pub strict_mode: bool,
    missing: Vec<&'static str>,
    _state: PhantomData<S>,
}

impl<S> Sandbox<S> {
    /// Controls that failed and were skipped in permissive mode
    pub fn missing_controls(&self) -> &[&'static str] {
        &self.missing
    }

    fn advance<T>(self) -> Sandbox<T> {
        Sandbox {
            job_id: self.job_id,
            strict_mode: self.strict_mode,
            missing: self.missing,
            _state: PhantomData,
        }
    }

    /// Strict mode propagates the failure; permissive mode records it.
    fn tolerate(&mut self, control: &'static str, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => Ok(()),
            Err(e) if self.strict_mode => Err(e),
            Err(_) => {
                self.missing.push(control);
                Ok(())
            }
        }
    }
}

impl Sandbox<FreshChild> {
    pub fn new(job_id: impl Into<String>, strict_mode: bool) -> Self {
        Self {
            job_id: job_id.into(),
            strict_mode,
            missing: Vec::new(),
            _state: PhantomData,
        }
    }

    pub fn setup_namespaces(mut self, set: &NamespaceSet) -> Result<Sandbox<NamespacesReady>> {
        // SAFETY: setsid has no memory effects.
        let session = if unsafe { libc::setsid() } < 0 {
            Err(SandboxError::Process(format!(
                "setsid failed: {}",
                std::io::Error::last_os_error()
            )))
        } else {
            Ok(())
        };
        self.tolerate("session", session)?;

        setup_parent_death_signal()?;

        let configured = namespace::configure_inside(set);
        self.tolerate("namespaces", configured)?;
        Ok(self.advance())
    }
}

impl Sandbox<NamespacesReady> {
    /// Never optional: the root build would otherwise leak onto the host.
    pub fn harden_mount_propagation(self) -> Result<Sandbox<MountsPrivate>> {
        namespace::harden_mount_propagation()?;
        Ok(self.advance())
    }
}

impl Sandbox<MountsPrivate> {
    /// The host attaches the proxy before releasing it; verify that it did.
    pub fn confirm_cgroup(mut self, cgroup_name: &str) -> Result<Sandbox<CgroupAttached>> {
        let check = std::fs::read_to_string("/proc/self/cgroup")
            .map_err(SandboxError::from)
            .and_then(|content| match unified_cgroup_path(&content) {
                Some(path) if path.rsplit('/').next() == Some(cgroup_name) => Ok(()),
                other => Err(SandboxError::Cgroup(format!(
                    "process is in cgroup {:?}, expected {}",
                    other, cgroup_name
                ))),
            });
        self.tolerate("cgroup", check)?;
        Ok(self.advance())
    }
}

impl Sandbox<CgroupAttached> {
    pub fn build_root(self, plan: &RootfsPlan) -> Result<Sandbox<RootReady>> {
        plan.build()?;
        Ok(self.advance())
    }
}

impl Sandbox<RootReady> {
    /// Rlimits, umask, stdio, FD closure and working directory.
    pub fn apply_runtime_hygiene(mut self, hygiene: &PayloadHygiene) -> Result<Sandbox<RootReady>> {
        let cpu = hygiene.cpu_seconds.max(1);
        for (control, resource, soft, hard) in [
            ("rlimit_cpu", libc::RLIMIT_CPU, cpu, cpu + 1),
            ("rlimit_fsize", libc::RLIMIT_FSIZE, hygiene.max_file_bytes, hygiene.max_file_bytes),
            ("rlimit_nofile", libc::RLIMIT_NOFILE, hygiene.max_open_files, hygiene.max_open_files),
            ("rlimit_core", libc::RLIMIT_CORE, 0, 0),
        ] {
            let applied = apply_rlimit(resource, soft, hard);
            self.tolerate(control, applied)?;
        }

        // SAFETY: umask only changes the process file creation mask.
        unsafe { libc::umask(PAYLOAD_UMASK) };

        let null = std::fs::File::open("/dev/null")?;
        nix::unistd::dup2(null.as_raw_fd(), libc::STDIN_FILENO)?;
        nix::unistd::dup2(hygiene.stdout_fd, libc::STDOUT_FILENO)?;
        nix::unistd::dup2(hygiene.stderr_fd, libc::STDERR_FILENO)?;
        drop(null);

        close_inherited_fds(&hygiene.keep_fds)?;

        std::env::set_current_dir(SANDBOX_WORKDIR).map_err(|e| {
            SandboxError::Mount(format!("Failed to chdir to {}: {}", SANDBOX_WORKDIR, e))
        })?;
        Ok(self)
    }

    /// Bounding and ambient sets go first: PR_CAPBSET_DROP needs
    /// CAP_SETPCAP, which is gone after setresuid.
    pub fn drop_credentials(mut self, uid: u32, gid: u32) -> Result<Sandbox<CredsDropped>> {
        let bounding = drop_bounding_and_ambient();
        self.tolerate("capability_bounding_set", bounding)?;
        transition_to_unprivileged(uid, gid)?;
        Ok(self.advance())
    }
}

impl Sandbox<CredsDropped> {
    pub fn lock_privileges(mut self) -> Result<Sandbox<PrivsLocked>> {
        let cleared = clear_process_capabilities();
        self.tolerate("capabilities", cleared)?;

        set_no_new_privs()?;
        if !check_no_new_privs()? {
            return Err(SandboxError::Privilege(
                "PR_SET_NO_NEW_PRIVS verification failed".to_string(),
            ));
        }
        Ok(self.advance())
    }
}

impl Sandbox<PrivsLocked> {
    pub fn install_filter(mut self, filter: &SyscallFilter) -> Result<Sandbox<ExecReady>> {
        let installed = filter.install();
        self.tolerate("seccomp", installed)?;
        Ok(self.advance())
    }
}

impl Sandbox<ExecReady> {
    /// Replace the process image. Returns only on failure.
    pub fn exec(self, argv: &[CString], envp: &[CString]) -> Result<Infallible> {
        let program = argv
            .first()
            .ok_or_else(|| SandboxError::Config("Empty command for exec".to_string()))?;
        nix::unistd::execve(program.as_c_str(), argv, envp)
            .map_err(|e| SandboxError::Process(format!("execve {:?} failed: {}", program, e)))
    }
}
