//! Read-back of capability state from /proc.
use super::PR_GET_NO_NEW_PRIVS;
use crate::config::types::{Result, SandboxError};

/// Capability masks from /proc/<pid>/status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapabilityStatus {
    pub inheritable: u64,
    pub permitted: u64,
    pub effective: u64,
    pub bounding: u64,
    pub ambient: u64,
}

impl CapabilityStatus {
    pub fn is_fully_dropped(&self) -> bool {
        self.inheritable == 0
            && self.permitted == 0
            && self.effective == 0
            && self.bounding == 0
            && self.ambient == 0
    }
}

pub fn parse_capability_status(status: &str) -> CapabilityStatus {
    let mut caps = CapabilityStatus::default();
    for line in status.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let Ok(mask) = u64::from_str_radix(value.trim(), 16) else {
            continue;
        };
        match key {
            "CapInh" => caps.inheritable = mask,
            "CapPrm" => caps.permitted = mask,
            "CapEff" => caps.effective = mask,
            "CapBnd" => caps.bounding = mask,
            "CapAmb" => caps.ambient = mask,
            _ => {}
        }
    }
    caps
}

pub fn get_capability_status() -> Result<CapabilityStatus> {
    let status = std::fs::read_to_string("/proc/self/status").map_err(|e| {
        SandboxError::Privilege(format!("cannot read /proc/self/status: {}", e))
    })?;
    Ok(parse_capability_status(&status))
}

pub fn check_no_new_privs() -> Result<bool> {
    // SAFETY: PR_GET_NO_NEW_PRIVS takes no pointers.
    let rc = unsafe { libc::prctl(PR_GET_NO_NEW_PRIVS, 0, 0, 0, 0) };
    if rc < 0 {
        return Err(SandboxError::Privilege(format!(
            "PR_GET_NO_NEW_PRIVS failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(rc == 1)
}
