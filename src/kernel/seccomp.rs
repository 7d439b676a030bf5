// Default-deny syscall filtering for the payload.
//
// Two programs are installed. The allow program lists every permitted
// syscall and kills the process on anything else. The soft-deny program
// answers a handful of probing syscalls with ENOSYS; the kernel picks the
// most restrictive verdict, so ENOSYS wins for those.

use crate::config::job::SecurityLevel;
use crate::config::types::{Result, SandboxError};
use seccompiler::{
    BpfProgram, SeccompAction, SeccompCmpArgLen, SeccompCmpOp, SeccompCondition, SeccompFilter,
    SeccompRule, TargetArch,
};
use std::collections::BTreeMap;
use std::ffi::CStr;

/// Syscall numbers are `libc::SYS_*`, widened to i64 for seccompiler.
macro_rules! syscalls {
    ($($name:ident),* $(,)?) => {
        &[$((stringify!($name), libc::$name as i64)),*]
    };
}

const PROCESS: &[(&str, i64)] = syscalls![
    SYS_exit, SYS_exit_group, SYS_wait4, SYS_waitid,
    SYS_set_tid_address, SYS_set_robust_list, SYS_futex, SYS_getpid,
    SYS_getppid, SYS_gettid, SYS_getpgid, SYS_setpgid, SYS_getuid,
    SYS_geteuid, SYS_getgid, SYS_getegid, SYS_getgroups, SYS_getresuid,
    SYS_getresgid, SYS_prlimit64, SYS_getrlimit, SYS_getrusage,
    SYS_sched_yield, SYS_sched_getaffinity, SYS_rseq, SYS_uname,
    SYS_sysinfo, SYS_umask, SYS_getcwd, SYS_chdir, SYS_fchdir,
];

/// Program replacement. At `SecurityLevel::Paranoid` the path argument is
/// pinned to the launcher's own exec, see [`SyscallFilter::build`].
const EXEC: &[(&str, i64)] = syscalls![SYS_execve];

/// Process creation; absent at `SecurityLevel::Paranoid`
const SPAWN: &[(&str, i64)] = syscalls![SYS_clone, SYS_clone3, SYS_kill, SYS_tgkill];

const MEMORY: &[(&str, i64)] = syscalls![
    SYS_brk, SYS_mmap, SYS_munmap, SYS_mremap, SYS_mprotect, SYS_madvise,
];

const FILE_IO: &[(&str, i64)] = syscalls![
    SYS_read, SYS_write, SYS_readv, SYS_writev, SYS_pread64, SYS_pwrite64,
    SYS_openat, SYS_close, SYS_fstat, SYS_newfstatat, SYS_statx, SYS_lseek,
    SYS_fcntl, SYS_dup, SYS_dup3, SYS_pipe2, SYS_ioctl, SYS_getdents64,
    SYS_readlinkat, SYS_faccessat, SYS_faccessat2, SYS_mkdirat, SYS_unlinkat,
    SYS_renameat, SYS_ftruncate, SYS_fsync, SYS_fdatasync, SYS_fchmod,
    SYS_fstatfs, SYS_statfs, SYS_flock, SYS_ppoll, SYS_pselect6,
    SYS_epoll_create1, SYS_epoll_ctl, SYS_epoll_pwait, SYS_eventfd2,
    SYS_getrandom, SYS_close_range,
];

/// Legacy entry points that only exist on x86_64
#[cfg(target_arch = "x86_64")]
const FILE_IO_LEGACY: &[(&str, i64)] = syscalls![
    SYS_open, SYS_stat, SYS_lstat, SYS_access, SYS_readlink, SYS_pipe,
    SYS_dup2, SYS_poll, SYS_select, SYS_epoll_wait, SYS_epoll_create,
    SYS_mkdir, SYS_unlink, SYS_rename, SYS_arch_prctl, SYS_getpgrp, SYS_time,
];
#[cfg(not(target_arch = "x86_64"))]
const FILE_IO_LEGACY: &[(&str, i64)] = &[];

const SIGNALS: &[(&str, i64)] = syscalls![
    SYS_rt_sigaction, SYS_rt_sigprocmask, SYS_rt_sigreturn, SYS_sigaltstack,
    SYS_rt_sigsuspend,
];

const TIME: &[(&str, i64)] = syscalls![
    SYS_clock_gettime, SYS_clock_getres, SYS_clock_nanosleep, SYS_nanosleep,
    SYS_gettimeofday,
];

/// Answered with ENOSYS instead of a kill; runtimes probe these at startup
const SOFT_DENY: &[(&str, i64)] = syscalls![
    SYS_io_uring_setup, SYS_io_uring_enter, SYS_io_uring_register,
];

/// Allowed syscalls for a security level, as (name, number) pairs.
pub fn allowed_syscalls(level: SecurityLevel) -> Vec<(&'static str, i64)> {
    let mut groups: Vec<&[(&str, i64)]> =
        vec![PROCESS, EXEC, MEMORY, FILE_IO, FILE_IO_LEGACY, SIGNALS, TIME];
    if level != SecurityLevel::Paranoid {
        groups.push(SPAWN);
    }
    let mut all: Vec<(&'static str, i64)> = groups.into_iter().flatten().copied().collect();
    all.sort_by_key(|&(_, nr)| nr);
    all.dedup_by_key(|&mut (_, nr)| nr);
    all
}

pub fn soft_denied_syscalls() -> &'static [(&'static str, i64)] {
    SOFT_DENY
}

fn target_arch() -> Result<TargetArch> {
    std::env::consts::ARCH
        .try_into()
        .map_err(|e| SandboxError::Seccomp(format!("unsupported architecture: {:?}", e)))
}

fn compile(filter: SeccompFilter) -> Result<BpfProgram> {
    filter
        .try_into()
        .map_err(|e: seccompiler::BackendError| {
            SandboxError::Seccomp(format!("failed to compile BPF program: {}", e))
        })
}

/// Compiled programs for one payload
#[derive(Debug, Clone)]
pub struct SyscallFilter {
    allow: BpfProgram,
    soft_deny: BpfProgram,
    pub allowed_count: usize,
}

impl SyscallFilter {
    /// Compile the allow-list for `level`. Runs before fork so the payload
    /// only has to load the programs.
    ///
    /// `exec_path` must be the exact buffer later handed to `execve`. At
    /// `SecurityLevel::Paranoid`, `execve` is allowed only when its first
    /// argument is that pointer, so the launcher's exec passes and a
    /// payload's own `execve` is killed. Pointer pinning does not inspect
    /// the string: a payload that maps a path at that same address can
    /// still replace itself, though never spawn, since `clone` stays denied.
    pub fn build(level: SecurityLevel, exec_path: &CStr) -> Result<Self> {
        let arch = target_arch()?;
        let allowed = allowed_syscalls(level);
        let allowed_count = allowed.len();

        let exec_rules = if level == SecurityLevel::Paranoid {
            vec![pinned_path_rule(exec_path)?]
        } else {
            vec![]
        };

        // Soft-denied numbers must pass the allow program, otherwise its
        // kill verdict would win over ENOSYS.
        let allow_rules: BTreeMap<i64, Vec<SeccompRule>> = allowed
            .into_iter()
            .chain(SOFT_DENY.iter().copied())
            .map(|(_, nr)| {
                if nr == libc::SYS_execve as i64 {
                    (nr, exec_rules.clone())
                } else {
                    (nr, vec![])
                }
            })
            .collect();
        let allow = SeccompFilter::new(
            allow_rules,
            SeccompAction::KillProcess, // mismatch: not on the list
            SeccompAction::Allow,       // match
            arch,
        )
        .map_err(|e| SandboxError::Seccomp(format!("failed to create allow filter: {}", e)))?;

        let soft_rules: BTreeMap<i64, Vec<SeccompRule>> =
            SOFT_DENY.iter().map(|&(_, nr)| (nr, vec![])).collect();
        let soft_deny = SeccompFilter::new(
            soft_rules,
            SeccompAction::Allow,
            SeccompAction::Errno(libc::ENOSYS as u32),
            arch,
        )
        .map_err(|e| SandboxError::Seccomp(format!("failed to create soft-deny filter: {}", e)))?;

        Ok(Self {
            allow: compile(allow)?,
            soft_deny: compile(soft_deny)?,
            allowed_count,
        })
    }

    /// Load both programs into the calling thread. Irreversible.
    /// Requires no_new_privs or CAP_SYS_ADMIN.
    pub fn install(&self) -> Result<()> {
        seccompiler::apply_filter(&self.soft_deny)
            .map_err(|e| SandboxError::Seccomp(format!("failed to apply soft-deny filter: {}", e)))?;
        seccompiler::apply_filter(&self.allow)
            .map_err(|e| SandboxError::Seccomp(format!("failed to apply allow filter: {}", e)))?;
        Ok(())
    }
}

/// `execve` whose path argument is exactly `exec_path`'s buffer.
fn pinned_path_rule(exec_path: &CStr) -> Result<SeccompRule> {
    let condition = SeccompCondition::new(
        0,
        SeccompCmpArgLen::Qword,
        SeccompCmpOp::Eq,
        exec_path.as_ptr() as u64,
    )
    .map_err(|e| SandboxError::Seccomp(format!("failed to pin execve path: {}", e)))?;
    SeccompRule::new(vec![condition])
        .map_err(|e| SandboxError::Seccomp(format!("failed to create execve rule: {}", e)))
}

/// Check if the running kernel supports seccomp filters.
pub fn is_seccomp_supported() -> bool {
    match std::fs::read_to_string("/proc/self/status") {
        Ok(status) => status.lines().any(|l| l.starts_with("Seccomp:")),
        Err(_) => false,
    }
}
