use crate::config::job::SecurityLevel;
use crate::exec::preexec::PayloadHygiene;
use crate::kernel::mount::RootfsPlan;
use crate::kernel::namespace::NamespaceSet;
use crate::utils::output::CapturedStream;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Host->proxy launch contract, sent as JSON over the launch pipe once the
/// proxy is attached to its cgroup.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LaunchRequest {
    pub job_id: String,
    /// Last component of the job cgroup path
    pub cgroup_name: String,
    pub strict_mode: bool,
    pub namespaces: NamespaceSet,
    pub rootfs: RootfsPlan,
    pub hygiene: PayloadHygiene,
    pub security: SecurityLevel,
    pub uid: u32,
    pub gid: u32,
    /// Absolute interpreter path first
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
}

/// Proxy->host status payload transferred through the status pipe.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProxyStatus {
    pub payload_pid: Option<i32>,
    pub exit_code: Option<i32>,
    pub term_signal: Option<i32>,
    /// Pre-exec failure in the proxy or payload
    pub setup_error: Option<String>,
    /// Controls skipped in permissive mode
    pub missing_controls: Vec<String>,
    pub reaped_descendants: u32,
}

/// Why the supervisor ended the job early
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    Deadline,
    CpuLimit,
    MemoryLimit,
    GpuMemoryLimit,
    Cancelled,
}

/// Raw outcome of one supervised launch.
#[derive(Clone, Debug, Default)]
pub struct SupervisorOutcome {
    /// `None` when the proxy was killed before reporting
    pub proxy_status: Option<ProxyStatus>,
    pub proxy_exit_code: Option<i32>,
    pub proxy_signal: Option<i32>,
    pub stop: Option<StopReason>,
    pub wall_time: Duration,
    pub stdout: CapturedStream,
    pub stderr: CapturedStream,
}

impl SupervisorOutcome {
    /// Payload exit code, or the proxy's when the payload never reported.
    pub fn exit_code(&self) -> Option<i32> {
        match &self.proxy_status {
            Some(status) => status.exit_code,
            None => self.proxy_exit_code,
        }
    }

    pub fn signal(&self) -> Option<i32> {
        match &self.proxy_status {
            Some(status) => status.term_signal,
            None => self.proxy_signal,
        }
    }

    pub fn setup_error(&self) -> Option<&str> {
        self.proxy_status
            .as_ref()
            .and_then(|status| status.setup_error.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_status_wins_over_proxy_status() {
        let outcome = SupervisorOutcome {
            proxy_status: Some(ProxyStatus {
                exit_code: None,
                term_signal: Some(libc::SIGSYS),
                ..Default::default()
            }),
            proxy_exit_code: Some(0),
            ..Default::default()
        };
        assert_eq!(outcome.exit_code(), None);
        assert_eq!(outcome.signal(), Some(libc::SIGSYS));
    }

    #[test]
    fn killed_proxy_falls_back_to_wait_status() {
        let outcome = SupervisorOutcome {
            proxy_signal: Some(libc::SIGKILL),
            ..Default::default()
        };
        assert_eq!(outcome.signal(), Some(libc::SIGKILL));
        assert_eq!(outcome.setup_error(), None);
    }

    #[test]
    fn proxy_status_survives_json() {
        let status = ProxyStatus {
            payload_pid: Some(2),
            exit_code: Some(3),
            missing_controls: vec!["seccomp".into()],
            ..Default::default()
        };
        let json = serde_json::to_vec(&status).unwrap();
        let back: ProxyStatus = serde_json::from_slice(&json).unwrap();
        assert_eq!(back, status);
    }
}
